//! End-to-end tests for the order lifecycle: creation and stock take,
//! status transitions and their ledger effects, cancellation and return
//! guards, hard deletion, and the carrier shipment handshake.

mod common;

use assert_matches::assert_matches;
use common::TestApp;
use rust_decimal_macros::dec;
use std::sync::atomic::Ordering;

use orderflow::entities::order::{OrderStatus, PaymentMethod, PaymentStatus};
use orderflow::entities::{product, voucher};
use orderflow::errors::ServiceError;
use sea_orm::EntityTrait;

#[tokio::test]
async fn create_order_takes_stock_and_seeds_tracking() {
    let app = TestApp::new().await;
    let product = app.seed_product("Ceramic Mug", Some(300)).await;
    app.set_stock(product.id, None, None, 10).await;

    let order = app
        .state
        .orders
        .create(app.order_request(product.id, 3, dec!(12.50)), app.user_id)
        .await
        .expect("order creation failed");

    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.payment_status, PaymentStatus::Pending);
    assert!(order.order_number.starts_with("YM"));
    assert_eq!(order.final_amount, dec!(37.50));
    assert_eq!(app.stock(product.id, None, None).await, Some(7));

    let log = app
        .state
        .tracking
        .get_for_order(order.id)
        .await
        .unwrap()
        .expect("tracking log missing");
    assert_eq!(log.status, OrderStatus::Pending);
    assert_eq!(log.history.len(), 1);
}

#[tokio::test]
async fn cancelling_a_pending_order_restores_stock() {
    let app = TestApp::new().await;
    let product = app.seed_product("Desk Lamp", None).await;
    app.set_stock(product.id, None, None, 10).await;

    let order = app
        .state
        .orders
        .create(app.order_request(product.id, 3, dec!(20.00)), app.user_id)
        .await
        .unwrap();
    assert_eq!(app.stock(product.id, None, None).await, Some(7));

    let cancelled = app
        .state
        .orders
        .cancel_order(order.id, "changed my mind".to_string(), Some("customer".to_string()))
        .await
        .unwrap();

    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(app.stock(product.id, None, None).await, Some(10));
    assert_eq!(
        cancelled.metadata["cancellation"]["reason"],
        "changed my mind"
    );

    let log = app
        .state
        .tracking
        .get_for_order(order.id)
        .await
        .unwrap()
        .unwrap();
    assert!(log
        .history
        .0
        .iter()
        .any(|e| e.description.contains("changed my mind")));
}

#[tokio::test]
async fn confirming_a_pending_order_leaves_stock_alone() {
    let app = TestApp::new().await;
    let product = app.seed_product("Notebook", None).await;
    app.set_stock(product.id, None, None, 10).await;

    let order = app
        .state
        .orders
        .create(app.order_request(product.id, 3, dec!(4.00)), app.user_id)
        .await
        .unwrap();
    assert_eq!(app.stock(product.id, None, None).await, Some(7));

    let confirmed = app
        .state
        .orders
        .update_status(order.id, OrderStatus::Confirmed, None)
        .await
        .unwrap();

    assert_eq!(confirmed.status, OrderStatus::Confirmed);
    // Pending already held the stock; no second decrement.
    assert_eq!(app.stock(product.id, None, None).await, Some(7));
}

#[tokio::test]
async fn cancel_is_rejected_once_terminal_and_mutates_nothing() {
    let app = TestApp::new().await;
    let product = app.seed_product("Poster", None).await;
    app.set_stock(product.id, None, None, 10).await;

    let order = app
        .state
        .orders
        .create(app.order_request(product.id, 3, dec!(9.00)), app.user_id)
        .await
        .unwrap();
    app.state
        .orders
        .update_status(order.id, OrderStatus::Delivered, None)
        .await
        .unwrap();

    let result = app
        .state
        .orders
        .cancel_order(order.id, "too late".to_string(), None)
        .await;
    assert_matches!(result, Err(ServiceError::InvalidOperation(_)));
    // No inventory mutation happened on the failed cancel.
    assert_eq!(app.stock(product.id, None, None).await, Some(7));

    let reloaded = app.state.orders.get_order(order.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, OrderStatus::Delivered);
}

#[tokio::test]
async fn cancelling_twice_fails_the_second_time() {
    let app = TestApp::new().await;
    let product = app.seed_product("Pen", None).await;
    app.set_stock(product.id, None, None, 5).await;

    let order = app
        .state
        .orders
        .create(app.order_request(product.id, 1, dec!(2.00)), app.user_id)
        .await
        .unwrap();
    app.state
        .orders
        .cancel_order(order.id, "first".to_string(), None)
        .await
        .unwrap();

    let result = app
        .state
        .orders
        .cancel_order(order.id, "second".to_string(), None)
        .await;
    assert_matches!(result, Err(ServiceError::InvalidOperation(_)));
    assert_eq!(app.stock(product.id, None, None).await, Some(5));
}

#[tokio::test]
async fn returns_are_only_accepted_from_delivered() {
    let app = TestApp::new().await;
    let product = app.seed_product("Kettle", None).await;
    app.set_stock(product.id, None, None, 10).await;

    let order = app
        .state
        .orders
        .create(app.order_request(product.id, 3, dec!(30.00)), app.user_id)
        .await
        .unwrap();

    let early = app
        .state
        .orders
        .return_order(order.id, "damaged".to_string(), None)
        .await;
    assert_matches!(early, Err(ServiceError::InvalidOperation(_)));

    app.state
        .orders
        .update_status(order.id, OrderStatus::Delivered, None)
        .await
        .unwrap();
    let returned = app
        .state
        .orders
        .return_order(order.id, "damaged".to_string(), Some("support".to_string()))
        .await
        .unwrap();

    assert_eq!(returned.status, OrderStatus::Returned);
    // Delivered -> Returned restores the held stock.
    assert_eq!(app.stock(product.id, None, None).await, Some(10));
    assert_eq!(returned.metadata["return_request"]["reason"], "damaged");
}

#[tokio::test]
async fn removal_requires_cancelled_status_and_deletes_the_log() {
    let app = TestApp::new().await;
    let product = app.seed_product("Vase", None).await;
    app.set_stock(product.id, None, None, 4).await;

    let order = app
        .state
        .orders
        .create(app.order_request(product.id, 1, dec!(15.00)), app.user_id)
        .await
        .unwrap();
    app.state
        .orders
        .update_status(order.id, OrderStatus::Processing, None)
        .await
        .unwrap();

    let premature = app.state.orders.remove(order.id).await;
    assert_matches!(premature, Err(ServiceError::InvalidOperation(_)));

    app.state
        .orders
        .cancel_order(order.id, "cleanup".to_string(), None)
        .await
        .unwrap();
    app.state.orders.remove(order.id).await.unwrap();

    assert!(app.state.orders.get_order(order.id).await.unwrap().is_none());
    assert!(app
        .state
        .tracking
        .get_for_order(order.id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn delivery_queues_sold_count_updates() {
    let app = TestApp::new().await;
    let product = app.seed_product("Socks", None).await;
    app.set_stock(product.id, None, None, 20).await;

    let order = app
        .state
        .orders
        .create(app.order_request(product.id, 4, dec!(3.00)), app.user_id)
        .await
        .unwrap();
    app.state
        .orders
        .update_status(order.id, OrderStatus::Delivered, None)
        .await
        .unwrap();

    app.drain_outbox().await;

    let reloaded = product::Entity::find_by_id(product.id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.sold_count, 4);
}

#[tokio::test]
async fn voucher_consumption_is_queued_at_checkout() {
    let app = TestApp::new().await;
    let product = app.seed_product("Blanket", None).await;
    app.set_stock(product.id, None, None, 8).await;
    let voucher = app.seed_voucher(dec!(5.00)).await;

    let mut request = app.order_request(product.id, 1, dec!(40.00));
    request.voucher_id = Some(voucher.id);
    request.voucher_discount = dec!(5.00);

    let order = app.state.orders.create(request, app.user_id).await.unwrap();
    assert_eq!(order.final_amount, dec!(35.00));

    app.drain_outbox().await;

    let reloaded = voucher::Entity::find_by_id(voucher.id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert!(reloaded.consumed);
    assert!(reloaded.consumed_at.is_some());
}

#[tokio::test]
async fn cod_checkout_creates_a_shipment_synchronously() {
    let app = TestApp::new().await;
    let product = app.seed_product("Rice Cooker", Some(2500)).await;
    app.set_stock(product.id, None, None, 6).await;

    let mut request = app.order_request(product.id, 2, dec!(45.00));
    request.payment_method = PaymentMethod::Cod;
    let order = app.state.orders.create(request, app.user_id).await.unwrap();

    assert_eq!(order.status, OrderStatus::Processing);
    assert!(order.tracking_code.is_some());

    let created = app.carrier.created.lock().unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].cod_amount, dec!(90.00));
    assert_eq!(created[0].weight_grams, 5000);

    drop(created);
    let log = app
        .state
        .tracking
        .get_for_order(order.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(log.carrier_name.as_deref(), Some("ViettelPost"));
    assert_eq!(log.tracking_code, order.tracking_code);
}

#[tokio::test]
async fn cod_checkout_survives_a_carrier_outage() {
    let app = TestApp::new().await;
    let product = app.seed_product("Fan", None).await;
    app.set_stock(product.id, None, None, 6).await;
    app.carrier.fail_create.store(true, Ordering::SeqCst);

    let mut request = app.order_request(product.id, 1, dec!(25.00));
    request.payment_method = PaymentMethod::Cod;
    let order = app.state.orders.create(request, app.user_id).await.unwrap();

    // The order is kept for later manual shipment creation.
    assert_eq!(order.status, OrderStatus::Pending);
    assert!(order.tracking_code.is_none());
    assert_eq!(app.stock(product.id, None, None).await, Some(5));
}

#[tokio::test]
async fn shipment_is_rejected_for_malformed_phone_or_duplicate() {
    let app = TestApp::new().await;
    let product = app.seed_product("Helmet", Some(800)).await;
    app.set_stock(product.id, None, None, 6).await;

    let mut request = app.order_request(product.id, 1, dec!(60.00));
    request.shipping_address.phone = "12345".to_string();
    let order = app.state.orders.create(request, app.user_id).await.unwrap();

    let bad_phone = app.state.orders.create_carrier_shipment(order.id).await;
    assert_matches!(bad_phone, Err(ServiceError::ValidationError(_)));

    let order2 = app
        .state
        .orders
        .create(app.order_request(product.id, 1, dec!(60.00)), app.user_id)
        .await
        .unwrap();
    app.state
        .orders
        .create_carrier_shipment(order2.id)
        .await
        .unwrap();
    let duplicate = app.state.orders.create_carrier_shipment(order2.id).await;
    assert_matches!(duplicate, Err(ServiceError::Conflict(_)));
}

#[tokio::test]
async fn zero_cod_collection_is_flagged_not_corrected() {
    let app = TestApp::new().await;
    let product = app.seed_product("Mixer", Some(1200)).await;
    app.set_stock(product.id, None, None, 3).await;
    app.carrier.zero_collection.store(true, Ordering::SeqCst);

    let mut request = app.order_request(product.id, 1, dec!(80.00));
    request.payment_method = PaymentMethod::Cod;
    let order = app.state.orders.create(request, app.user_id).await.unwrap();

    assert!(order.tracking_code.is_some());
    let flag = &order.metadata["cod_collection_flagged"];
    let expected: rust_decimal::Decimal =
        serde_json::from_value(flag["expected"].clone()).unwrap();
    assert_eq!(expected, dec!(80.00));
    // The order's own amounts stand; only the discrepancy is recorded.
    assert_eq!(order.final_amount, dec!(80.00));
}

#[tokio::test]
async fn cancelling_a_shipped_order_queues_carrier_cancellation() {
    let app = TestApp::new().await;
    let product = app.seed_product("Teapot", Some(400)).await;
    app.set_stock(product.id, None, None, 5).await;

    let mut request = app.order_request(product.id, 1, dec!(22.00));
    request.payment_method = PaymentMethod::Cod;
    let order = app.state.orders.create(request, app.user_id).await.unwrap();
    let tracking_code = order.tracking_code.clone().unwrap();

    app.state
        .orders
        .cancel_order(order.id, "address unreachable".to_string(), None)
        .await
        .unwrap();
    app.drain_outbox().await;

    let cancellations = app.carrier.cancellations.lock().unwrap();
    assert_eq!(
        *cancellations,
        vec![(tracking_code, "address unreachable".to_string())]
    );
    drop(cancellations);

    // The sync result is mirrored into order metadata for operators.
    let reloaded = app.state.orders.get_order(order.id).await.unwrap().unwrap();
    assert_eq!(reloaded.metadata["carrier_cancellation"]["status"], 200);
}

#[tokio::test]
async fn orders_without_items_are_rejected() {
    let app = TestApp::new().await;
    let product = app.seed_product("Empty", None).await;
    let mut request = app.order_request(product.id, 1, dec!(1.00));
    request.items.clear();

    let result = app.state.orders.create(request, app.user_id).await;
    assert_matches!(result, Err(ServiceError::ValidationError(_)));
}

#[tokio::test]
async fn list_orders_paginates_newest_first() {
    let app = TestApp::new().await;
    let product = app.seed_product("Card Deck", None).await;
    app.set_stock(product.id, None, None, 50).await;

    for _ in 0..3 {
        app.state
            .orders
            .create(app.order_request(product.id, 1, dec!(6.00)), app.user_id)
            .await
            .unwrap();
    }

    let (orders, total) = app.state.orders.list_orders(1, 2).await.unwrap();
    assert_eq!(total, 3);
    assert_eq!(orders.len(), 2);
    let (rest, _) = app.state.orders.list_orders(2, 2).await.unwrap();
    assert_eq!(rest.len(), 1);
}
