//! Pending-order promotion tests: at-most-once promotion, existing-order
//! confirmation idempotency, rejected payments, and draft expiry.

mod common;

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use common::TestApp;
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, EntityTrait, PaginatorTrait, Set};
use uuid::Uuid;

use orderflow::clients::gateway::{encode_promotion_token, GatewayCallback, PromotionToken};
use orderflow::entities::order::{OrderStatus, PaymentMethod, PaymentStatus};
use orderflow::entities::{order, pending_order};
use orderflow::services::pending_orders::{PromotionOutcome, StashPendingOrderRequest};

fn new_order_callback(payment_request_id: &str, amount: rust_decimal::Decimal) -> GatewayCallback {
    let token = encode_promotion_token(&PromotionToken {
        order_id: None,
        order_number: None,
        is_new_order: true,
    })
    .unwrap();
    GatewayCallback {
        payment_request_id: payment_request_id.to_string(),
        amount,
        gateway_ref: "wallet-555".to_string(),
        result_code: 0,
        token,
    }
}

fn existing_order_callback(payment_request_id: &str, order_id: Uuid) -> GatewayCallback {
    let token = encode_promotion_token(&PromotionToken {
        order_id: Some(order_id),
        order_number: None,
        is_new_order: false,
    })
    .unwrap();
    GatewayCallback {
        payment_request_id: payment_request_id.to_string(),
        amount: dec!(30.00),
        gateway_ref: "card-session-9".to_string(),
        result_code: 0,
        token,
    }
}

#[tokio::test]
async fn promoting_a_draft_creates_exactly_one_order() {
    let app = TestApp::new().await;
    let product = app.seed_product("Wallet Checkout", Some(200)).await;
    app.set_stock(product.id, None, None, 10).await;

    let mut draft = app.order_request(product.id, 2, dec!(20.00));
    draft.payment_method = PaymentMethod::Wallet;
    app.state
        .pending_orders
        .stash(StashPendingOrderRequest {
            payment_request_id: "req-100".to_string(),
            user_id: app.user_id,
            gateway_ref: "wallet-555".to_string(),
            draft,
        })
        .await
        .unwrap();

    // The draft alone holds no stock.
    assert_eq!(app.stock(product.id, None, None).await, Some(10));

    let outcome = app
        .state
        .pending_orders
        .promote(new_order_callback("req-100", dec!(40.00)))
        .await
        .unwrap();
    let order_id = match outcome {
        PromotionOutcome::Promoted { order_id } => order_id,
        other => panic!("expected promotion, got {other:?}"),
    };

    let promoted = app.state.orders.get_order(order_id).await.unwrap().unwrap();
    assert_eq!(promoted.payment_status, PaymentStatus::Paid);
    assert_eq!(app.stock(product.id, None, None).await, Some(8));
    // The promoter requested a shipment for the prepaid order.
    assert!(promoted.tracking_code.is_some());

    // The draft is gone, so the replayed callback promotes nothing.
    let replay = app
        .state
        .pending_orders
        .promote(new_order_callback("req-100", dec!(40.00)))
        .await
        .unwrap();
    assert_eq!(replay, PromotionOutcome::DraftMissing);

    let order_count = order::Entity::find().count(&*app.state.db).await.unwrap();
    assert_eq!(order_count, 1);
    assert_eq!(app.stock(product.id, None, None).await, Some(8));

    // Cart clearing was queued for the draft's owner.
    app.drain_outbox().await;
    assert_eq!(*app.cart.cleared.lock().unwrap(), vec![app.user_id]);

    let payment = app
        .state
        .payments
        .find_by_request_id("req-100")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Paid);
    assert_eq!(payment.order_id, Some(order_id));
}

#[tokio::test]
async fn failed_gateway_results_promote_nothing() {
    let app = TestApp::new().await;
    let product = app.seed_product("Declined", None).await;
    app.set_stock(product.id, None, None, 5).await;

    let mut draft = app.order_request(product.id, 1, dec!(10.00));
    draft.payment_method = PaymentMethod::Wallet;
    app.state
        .pending_orders
        .stash(StashPendingOrderRequest {
            payment_request_id: "req-200".to_string(),
            user_id: app.user_id,
            gateway_ref: "wallet-999".to_string(),
            draft,
        })
        .await
        .unwrap();

    let mut callback = new_order_callback("req-200", dec!(10.00));
    callback.result_code = 49;
    let outcome = app.state.pending_orders.promote(callback).await.unwrap();
    assert_eq!(outcome, PromotionOutcome::PaymentRejected);

    assert_eq!(order::Entity::find().count(&*app.state.db).await.unwrap(), 0);
    let payment = app
        .state
        .payments
        .find_by_request_id("req-200")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Failed);
}

#[tokio::test]
async fn existing_pending_order_is_confirmed_once() {
    let app = TestApp::new().await;
    let product = app.seed_product("Card Checkout", Some(350)).await;
    app.set_stock(product.id, None, None, 10).await;

    let order = app
        .state
        .orders
        .create(app.order_request(product.id, 1, dec!(30.00)), app.user_id)
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::Pending);
    assert!(order.tracking_code.is_none());

    let outcome = app
        .state
        .pending_orders
        .promote(existing_order_callback("req-300", order.id))
        .await
        .unwrap();
    assert_eq!(outcome, PromotionOutcome::Confirmed { order_id: order.id });

    let confirmed = app.state.orders.get_order(order.id).await.unwrap().unwrap();
    assert_eq!(confirmed.payment_status, PaymentStatus::Paid);
    // Confirmation created the missing shipment, advancing to Processing.
    assert!(confirmed.tracking_code.is_some());
    assert_eq!(confirmed.status, OrderStatus::Processing);
    // Pending already held stock; confirmation adds no second decrement.
    assert_eq!(app.stock(product.id, None, None).await, Some(9));

    let replay = app
        .state
        .pending_orders
        .promote(existing_order_callback("req-300", order.id))
        .await
        .unwrap();
    assert_eq!(
        replay,
        PromotionOutcome::AlreadyProcessed { order_id: order.id }
    );
    assert_eq!(app.stock(product.id, None, None).await, Some(9));
}

#[tokio::test]
async fn callbacks_for_unknown_orders_are_quiet_no_ops() {
    let app = TestApp::new().await;
    let outcome = app
        .state
        .pending_orders
        .promote(existing_order_callback("req-400", Uuid::new_v4()))
        .await
        .unwrap();
    assert_eq!(outcome, PromotionOutcome::OrderMissing);
}

#[tokio::test]
async fn malformed_tokens_are_rejected() {
    let app = TestApp::new().await;
    let callback = GatewayCallback {
        payment_request_id: "req-500".to_string(),
        amount: dec!(5.00),
        gateway_ref: "wallet-1".to_string(),
        result_code: 0,
        token: "!!!".to_string(),
    };
    let result = app.state.pending_orders.promote(callback).await;
    assert_matches!(
        result,
        Err(orderflow::errors::ServiceError::SerializationError(_))
    );
}

#[tokio::test]
async fn stale_drafts_expire_and_cannot_be_promoted() {
    let app = TestApp::new().await;
    let product = app.seed_product("Abandoned", None).await;
    app.set_stock(product.id, None, None, 5).await;

    let mut draft = app.order_request(product.id, 1, dec!(10.00));
    draft.payment_method = PaymentMethod::Wallet;
    let stored = app
        .state
        .pending_orders
        .stash(StashPendingOrderRequest {
            payment_request_id: "req-600".to_string(),
            user_id: app.user_id,
            gateway_ref: "wallet-2".to_string(),
            draft,
        })
        .await
        .unwrap();

    // Backdate the draft past its TTL.
    let mut active: pending_order::ActiveModel = stored.into();
    active.expires_at = Set(Utc::now() - Duration::minutes(1));
    active.update(&*app.state.db).await.unwrap();

    let expired = app.state.pending_orders.expire_stale().await.unwrap();
    assert_eq!(expired, 1);

    let outcome = app
        .state
        .pending_orders
        .promote(new_order_callback("req-600", dec!(10.00)))
        .await
        .unwrap();
    assert_eq!(outcome, PromotionOutcome::DraftMissing);
    assert_eq!(order::Entity::find().count(&*app.state.db).await.unwrap(), 0);
}
