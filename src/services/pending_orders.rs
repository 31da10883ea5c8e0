//! Promotion of pre-payment order drafts.
//!
//! When checkout defers to an external payment page, the order payload is
//! stashed as a draft keyed by the payment request id. The gateway callback
//! promotes at most one draft into a real order; deleting the draft after
//! promotion is what makes callback replay harmless. Gateways expect an
//! acknowledgment no matter what, so missing drafts and orders are quiet
//! no-ops, never errors.

use std::sync::Arc;

use chrono::{Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::clients::gateway::{decode_promotion_token, GatewayCallback};
use crate::config::AppConfig;
use crate::entities::order::{OrderStatus, PaymentStatus};
use crate::entities::pending_order;
use crate::errors::ServiceError;
use crate::events::outbox::{self, SideEffect};
use crate::events::{Event, EventSender};
use crate::services::orders::{CreateOrderRequest, OrderService, UpdateOrderRequest};
use crate::services::payments::PaymentService;

#[derive(Debug, Clone)]
pub struct StashPendingOrderRequest {
    pub payment_request_id: String,
    pub user_id: Uuid,
    /// Gateway-side correlation id (wallet order id / card session id).
    pub gateway_ref: String,
    pub draft: CreateOrderRequest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromotionOutcome {
    /// A draft became a real order.
    Promoted { order_id: Uuid },
    /// An existing pending order was confirmed and marked paid.
    Confirmed { order_id: Uuid },
    /// The order had already moved past `Pending`; replay no-op.
    AlreadyProcessed { order_id: Uuid },
    /// No draft for this payment request id; replay or expiry no-op.
    DraftMissing,
    /// The token referenced an order that does not exist.
    OrderMissing,
    /// The gateway reported failure; payment recorded, nothing promoted.
    PaymentRejected,
}

#[derive(Clone)]
pub struct PendingOrderService {
    db: Arc<DatabaseConnection>,
    config: Arc<AppConfig>,
    orders: OrderService,
    payments: PaymentService,
    event_sender: Option<Arc<EventSender>>,
}

impl PendingOrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: Arc<AppConfig>,
        orders: OrderService,
        payments: PaymentService,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            db,
            config,
            orders,
            payments,
            event_sender,
        }
    }

    /// Stashes a draft until its gateway confirms funds, and opens the
    /// matching payment attempt record.
    #[instrument(skip(self, request), fields(payment_request_id = %request.payment_request_id, user_id = %request.user_id))]
    pub async fn stash(
        &self,
        request: StashPendingOrderRequest,
    ) -> Result<pending_order::Model, ServiceError> {
        let now = Utc::now();
        let draft = pending_order::ActiveModel {
            id: Set(Uuid::new_v4()),
            payment_request_id: Set(request.payment_request_id.clone()),
            user_id: Set(request.user_id),
            gateway_ref: Set(request.gateway_ref.clone()),
            payload: Set(serde_json::to_value(&request.draft)?),
            created_at: Set(now),
            expires_at: Set(now + Duration::minutes(self.config.pending_order_ttl_minutes)),
        };
        let stored = draft.insert(&*self.db).await?;

        self.payments
            .create_payment(
                &request.payment_request_id,
                request.draft.total_amount - request.draft.voucher_discount,
                request.draft.payment_method,
                Some(request.gateway_ref),
            )
            .await?;

        Ok(stored)
    }

    pub async fn find_by_request_id(
        &self,
        payment_request_id: &str,
    ) -> Result<Option<pending_order::Model>, ServiceError> {
        let found = pending_order::Entity::find()
            .filter(pending_order::Column::PaymentRequestId.eq(payment_request_id))
            .one(&*self.db)
            .await?;
        Ok(found)
    }

    /// Handles a gateway success/failure callback. Side effects (shipment,
    /// cart clearing) are each wrapped so one failure cannot block the
    /// others or the acknowledgment.
    #[instrument(skip(self, callback), fields(payment_request_id = %callback.payment_request_id, result_code = callback.result_code))]
    pub async fn promote(
        &self,
        callback: GatewayCallback,
    ) -> Result<PromotionOutcome, ServiceError> {
        let snapshot = serde_json::to_value(&callback).ok();

        if !callback.is_success() {
            info!("gateway reported failure, recording and skipping promotion");
            self.payments
                .record_gateway_result(
                    &callback.payment_request_id,
                    false,
                    callback.amount,
                    crate::entities::order::PaymentMethod::Wallet,
                    Some(callback.gateway_ref.clone()),
                    snapshot,
                    None,
                )
                .await?;
            return Ok(PromotionOutcome::PaymentRejected);
        }

        let token = decode_promotion_token(&callback.token)?;
        if token.is_new_order {
            self.promote_new_order(callback, snapshot).await
        } else {
            self.confirm_existing_order(callback, snapshot, token.order_id)
                .await
        }
    }

    async fn promote_new_order(
        &self,
        callback: GatewayCallback,
        snapshot: Option<serde_json::Value>,
    ) -> Result<PromotionOutcome, ServiceError> {
        let Some(draft) = self
            .find_by_request_id(&callback.payment_request_id)
            .await?
        else {
            // Replayed callback or expired draft. The gateway still gets
            // its acknowledgment.
            warn!("no pending order draft for confirmed payment");
            return Ok(PromotionOutcome::DraftMissing);
        };

        let request: CreateOrderRequest = serde_json::from_value(draft.payload.clone())?;
        let order = self.orders.create(request, draft.user_id).await?;

        self.payments
            .record_gateway_result(
                &callback.payment_request_id,
                true,
                callback.amount,
                order.payment_method,
                Some(callback.gateway_ref.clone()),
                snapshot,
                Some(order.id),
            )
            .await?;
        self.orders
            .update(
                order.id,
                UpdateOrderRequest {
                    payment_status: Some(PaymentStatus::Paid),
                    ..Default::default()
                },
            )
            .await?;

        if order.tracking_code.is_none() {
            if let Err(e) = self.orders.create_carrier_shipment(order.id).await {
                warn!(order_id = %order.id, error = %e, "shipment creation after promotion failed");
            }
        }
        self.queue_cart_clear(draft.user_id).await;

        // Deleting the draft is the at-most-once guard: a replayed callback
        // finds nothing to promote.
        pending_order::Entity::delete_by_id(draft.id)
            .exec(&*self.db)
            .await?;

        info!(order_id = %order.id, "pending order promoted");
        self.emit(Event::PendingOrderPromoted {
            order_id: order.id,
            payment_request_id: callback.payment_request_id.clone(),
        })
        .await;
        self.emit(Event::PaymentCaptured(order.id)).await;

        Ok(PromotionOutcome::Promoted { order_id: order.id })
    }

    async fn confirm_existing_order(
        &self,
        callback: GatewayCallback,
        snapshot: Option<serde_json::Value>,
        order_id: Option<Uuid>,
    ) -> Result<PromotionOutcome, ServiceError> {
        let Some(order_id) = order_id else {
            warn!("gateway token for existing order carries no order id");
            return Ok(PromotionOutcome::OrderMissing);
        };
        let Some(order) = self.orders.get_order(order_id).await? else {
            warn!(order_id = %order_id, "gateway callback for unknown order");
            return Ok(PromotionOutcome::OrderMissing);
        };

        if order.status != OrderStatus::Pending {
            info!(order_id = %order_id, status = %order.status, "order already past pending, callback replay ignored");
            return Ok(PromotionOutcome::AlreadyProcessed { order_id });
        }

        self.orders
            .update_status(order_id, OrderStatus::Confirmed, Some("payment-gateway".to_string()))
            .await?;
        self.orders
            .update(
                order_id,
                UpdateOrderRequest {
                    payment_status: Some(PaymentStatus::Paid),
                    ..Default::default()
                },
            )
            .await?;
        self.payments
            .record_gateway_result(
                &callback.payment_request_id,
                true,
                callback.amount,
                order.payment_method,
                Some(callback.gateway_ref.clone()),
                snapshot,
                Some(order_id),
            )
            .await?;

        if order.tracking_code.is_none() {
            if let Err(e) = self.orders.create_carrier_shipment(order_id).await {
                warn!(order_id = %order_id, error = %e, "shipment creation after confirmation failed");
            }
        }
        self.queue_cart_clear(order.user_id).await;

        self.emit(Event::PaymentCaptured(order_id)).await;
        Ok(PromotionOutcome::Confirmed { order_id })
    }

    /// Deletes drafts whose gateway never confirmed within the TTL.
    #[instrument(skip(self))]
    pub async fn expire_stale(&self) -> Result<u64, ServiceError> {
        let result = pending_order::Entity::delete_many()
            .filter(pending_order::Column::ExpiresAt.lt(Utc::now()))
            .exec(&*self.db)
            .await?;
        if result.rows_affected > 0 {
            info!(count = result.rows_affected, "expired stale pending orders");
        }
        Ok(result.rows_affected)
    }

    async fn queue_cart_clear(&self, user_id: Uuid) {
        let effect = SideEffect::ClearCart { user_id };
        if let Err(e) = outbox::enqueue(&*self.db, &effect).await {
            warn!(error = %e, user_id = %user_id, "failed to queue cart clearing");
        }
    }

    async fn emit(&self, event: Event) {
        if let Some(event_sender) = &self.event_sender {
            if let Err(e) = event_sender.send(event).await {
                warn!(error = %e, "failed to send event");
            }
        }
    }
}
