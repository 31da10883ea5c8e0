use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::clients::carrier::{CarrierClient, ShipmentItem, ShipmentRequest};
use crate::config::AppConfig;
use crate::entities::order::{
    self, merge_metadata, OrderStatus, PaymentMethod, PaymentStatus, ShippingAddress,
};
use crate::entities::order_item;
use crate::entities::order_tracking::TrackingEntry;
use crate::entities::product;
use crate::errors::ServiceError;
use crate::events::outbox::{self, SideEffect};
use crate::events::{Event, EventSender};
use crate::services::inventory::{InventoryService, StockDirection};
use crate::services::order_status::{stock_action, StockAction};
use crate::services::tracking::OrderTrackingService;

static PHONE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{10,11}$").unwrap());

fn non_negative(value: &Decimal) -> Result<(), ValidationError> {
    if *value < Decimal::ZERO {
        return Err(ValidationError::new("non_negative"));
    }
    Ok(())
}

fn default_options() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Generates an order number: `YM` + yymmdd + four random digits. Not
/// guaranteed globally unique, but treated as a unique key downstream.
pub fn generate_order_number() -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..10_000);
    format!("YM{}{suffix:04}", Utc::now().format("%y%m%d"))
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateOrderItemRequest {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub combination_id: Option<Uuid>,
    #[validate(range(min = 1, message = "Quantity must be at least 1"))]
    pub quantity: i32,
    #[validate(custom = "non_negative")]
    pub unit_price: Decimal,
    /// Free-form selection payload as submitted by the storefront.
    #[serde(default = "default_options")]
    pub options: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateOrderRequest {
    #[validate]
    pub items: Vec<CreateOrderItemRequest>,
    #[validate]
    pub shipping_address: ShippingAddress,
    pub payment_method: PaymentMethod,
    pub branch_id: Option<Uuid>,
    pub voucher_id: Option<Uuid>,
    #[validate(custom = "non_negative")]
    pub subtotal: Decimal,
    #[validate(custom = "non_negative")]
    pub tax_amount: Decimal,
    #[validate(custom = "non_negative")]
    pub shipping_fee: Decimal,
    #[validate(custom = "non_negative")]
    pub total_amount: Decimal,
    #[validate(custom = "non_negative")]
    #[serde(default)]
    pub voucher_discount: Decimal,
}

/// General field patch. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateOrderRequest {
    pub status: Option<OrderStatus>,
    pub payment_status: Option<PaymentStatus>,
    pub tracking_code: Option<String>,
    pub metadata: Option<serde_json::Value>,
    /// Free-text note recorded on the tracking log when the status changes.
    pub note: Option<String>,
    pub updated_by: Option<String>,
}

/// Service owning order creation, mutation, and the carrier shipment
/// handshake. All status changes funnel through the transition table here
/// before any side effect runs.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    config: Arc<AppConfig>,
    inventory: InventoryService,
    tracking: OrderTrackingService,
    carrier: Arc<dyn CarrierClient>,
    event_sender: Option<Arc<EventSender>>,
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: Arc<AppConfig>,
        inventory: InventoryService,
        tracking: OrderTrackingService,
        carrier: Arc<dyn CarrierClient>,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            db,
            config,
            inventory,
            tracking,
            carrier,
            event_sender,
        }
    }

    /// Creates a new order: assigns the order number, takes stock, persists
    /// the order with its items, seeds the tracking log, and queues voucher
    /// consumption. COD orders additionally get a synchronous best-effort
    /// carrier shipment.
    #[instrument(skip(self, request), fields(user_id = %user_id, item_count = request.items.len()))]
    pub async fn create(
        &self,
        request: CreateOrderRequest,
        user_id: Uuid,
    ) -> Result<order::Model, ServiceError> {
        request
            .validate()
            .map_err(|e| ServiceError::ValidationError(e.to_string()))?;
        if request.items.is_empty() {
            return Err(ServiceError::ValidationError(
                "An order needs at least one item".to_string(),
            ));
        }

        let final_amount = request.total_amount - request.voucher_discount;
        if final_amount < Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Voucher discount exceeds order total".to_string(),
            ));
        }

        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let order_number = generate_order_number();

        let items: Vec<order_item::Model> = request
            .items
            .iter()
            .map(|item| order_item::Model {
                id: Uuid::new_v4(),
                order_id,
                product_id: item.product_id,
                variant_id: item.variant_id,
                combination_id: item.combination_id,
                quantity: item.quantity,
                unit_price: item.unit_price,
                options: item.options.clone(),
                created_at: now,
            })
            .collect();

        // Stock is taken before the order document exists; creation always
        // starts in a stock-holding state.
        let report = self
            .inventory
            .adjust_for_items(
                &items,
                request.branch_id,
                self.config.default_branch_id,
                StockDirection::Decrement,
            )
            .await;
        if !report.is_clean() {
            warn!(
                order_number = %order_number,
                failed_items = report.failures.len(),
                "stock decrement incomplete at checkout"
            );
        }

        let order_active = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order_number.clone()),
            user_id: Set(user_id),
            status: Set(OrderStatus::Pending),
            payment_status: Set(PaymentStatus::Pending),
            payment_method: Set(request.payment_method),
            subtotal: Set(request.subtotal),
            tax_amount: Set(request.tax_amount),
            shipping_fee: Set(request.shipping_fee),
            total_amount: Set(request.total_amount),
            final_amount: Set(final_amount),
            voucher_id: Set(request.voucher_id),
            voucher_discount: Set(request.voucher_discount),
            shipping_address: Set(request.shipping_address.clone()),
            branch_id: Set(request.branch_id),
            tracking_code: Set(None),
            metadata: Set(json!({})),
            created_at: Set(now),
            updated_at: Set(Some(now)),
            version: Set(1),
        };

        let txn = self.db.begin().await?;
        let order = order_active.insert(&txn).await?;
        order_item::Entity::insert_many(
            items
                .iter()
                .cloned()
                .map(order_item::ActiveModel::from)
                .collect::<Vec<_>>(),
        )
        .exec(&txn)
        .await?;
        txn.commit().await?;

        self.tracking
            .seed(
                order_id,
                OrderStatus::Pending,
                format!("Order {order_number} placed"),
                None,
            )
            .await?;

        if let Some(voucher_id) = request.voucher_id {
            let effect = SideEffect::ConsumeVoucher {
                voucher_id,
                order_id,
            };
            if let Err(e) = outbox::enqueue(&*self.db, &effect).await {
                warn!(error = %e, voucher_id = %voucher_id, "failed to queue voucher consumption");
            }
        }

        info!(order_id = %order_id, order_number = %order_number, "order created");
        self.emit(Event::OrderCreated(order_id)).await;

        // COD collects on delivery, so the shipment is requested right at
        // checkout. A carrier failure is swallowed; the order is returned
        // for later manual shipment creation.
        if order.payment_method == PaymentMethod::Cod {
            match self.create_carrier_shipment(order_id).await {
                Ok(with_shipment) => return Ok(with_shipment),
                Err(e) => {
                    warn!(
                        order_id = %order_id,
                        error = %e,
                        "carrier shipment creation failed at checkout, order kept for manual shipment"
                    );
                }
            }
        }

        Ok(order)
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<Option<order::Model>, ServiceError> {
        let found = order::Entity::find_by_id(order_id).one(&*self.db).await?;
        Ok(found)
    }

    pub async fn get_order_by_tracking_code(
        &self,
        tracking_code: &str,
    ) -> Result<Option<order::Model>, ServiceError> {
        let found = order::Entity::find()
            .filter(order::Column::TrackingCode.eq(tracking_code))
            .one(&*self.db)
            .await?;
        Ok(found)
    }

    pub async fn items_for_order(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<order_item::Model>, ServiceError> {
        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&*self.db)
            .await?;
        Ok(items)
    }

    /// Lists orders newest-first with pagination.
    #[instrument(skip(self))]
    pub async fn list_orders(
        &self,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<order::Model>, u64), ServiceError> {
        let paginator = order::Entity::find()
            .order_by_desc(order::Column::CreatedAt)
            .paginate(&*self.db, per_page);
        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page.saturating_sub(1)).await?;
        Ok((orders, total))
    }

    /// General field patch. A status change is validated against the
    /// transition table, appends a tracking entry, and on `Delivered`
    /// queues per-item sold-count updates. The patch performs no ledger
    /// action; `update_status` is the entry point that reconciles stock.
    #[instrument(skip(self, request), fields(order_id = %order_id))]
    pub async fn update(
        &self,
        order_id: Uuid,
        request: UpdateOrderRequest,
    ) -> Result<order::Model, ServiceError> {
        let order = self
            .get_order(order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {order_id} not found")))?;

        let old_status = order.status;
        let status_change = request.status.filter(|next| *next != old_status);

        if let Some(next) = status_change {
            if !old_status.can_transition_to(next) {
                return Err(ServiceError::InvalidOperation(format!(
                    "Cannot transition order {} from {old_status} to {next}",
                    order.order_number
                )));
            }
        }

        let version = order.version;
        let mut active: order::ActiveModel = order.into();
        if let Some(next) = status_change {
            active.status = Set(next);
        }
        if let Some(payment_status) = request.payment_status {
            active.payment_status = Set(payment_status);
        }
        if let Some(tracking_code) = request.tracking_code.clone() {
            active.tracking_code = Set(Some(tracking_code));
        }
        if let Some(metadata) = request.metadata.clone() {
            active.metadata = Set(metadata);
        }
        active.updated_at = Set(Some(Utc::now()));
        active.version = Set(version + 1);
        let updated = active.update(&*self.db).await?;

        if let Some(next) = status_change {
            let description = request
                .note
                .clone()
                .unwrap_or_else(|| format!("Status changed from {old_status} to {next}"));
            self.tracking
                .append_entry(
                    order_id,
                    TrackingEntry {
                        status: next,
                        description,
                        timestamp: Utc::now(),
                        location: None,
                        updated_by: request.updated_by.clone(),
                    },
                    next,
                )
                .await?;

            if next == OrderStatus::Delivered {
                for item in self.items_for_order(order_id).await? {
                    let effect = SideEffect::IncrementSoldCount {
                        product_id: item.product_id,
                        quantity: item.quantity,
                    };
                    if let Err(e) = outbox::enqueue(&*self.db, &effect).await {
                        warn!(
                            error = %e,
                            product_id = %item.product_id,
                            "failed to queue sold count update"
                        );
                    }
                }
            }

            info!(order_id = %order_id, %old_status, new_status = %next, "order status updated");
            self.emit(Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status: next,
            })
            .await;
        }

        Ok(updated)
    }

    /// Validated status transition: classifies the move against the stock
    /// policy, executes the indicated ledger action, then persists the new
    /// status through `update`. The ledger runs first so a persistence
    /// failure never leaves a silently unreconciled status.
    #[instrument(skip(self), fields(order_id = %order_id, %status))]
    pub async fn update_status(
        &self,
        order_id: Uuid,
        status: OrderStatus,
        updated_by: Option<String>,
    ) -> Result<order::Model, ServiceError> {
        let order = self
            .get_order(order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {order_id} not found")))?;

        if order.status == status {
            return Ok(order);
        }
        if !order.status.can_transition_to(status) {
            return Err(ServiceError::InvalidOperation(format!(
                "Cannot transition order {} from {} to {status}",
                order.order_number, order.status
            )));
        }

        let action = stock_action(order.status, status);
        if action != StockAction::None {
            let direction = match action {
                StockAction::Decrement => StockDirection::Decrement,
                StockAction::Restore => StockDirection::Restore,
                StockAction::None => unreachable!(),
            };
            let items = self.items_for_order(order_id).await?;
            let report = self
                .inventory
                .adjust_for_items(
                    &items,
                    order.branch_id,
                    self.config.default_branch_id,
                    direction,
                )
                .await;
            if !report.is_clean() {
                warn!(
                    order_id = %order_id,
                    failed_items = report.failures.len(),
                    "stock reconciliation incomplete for status change"
                );
            }
        }

        self.update(
            order_id,
            UpdateOrderRequest {
                status: Some(status),
                updated_by,
                ..Default::default()
            },
        )
        .await
    }

    /// Cancels an order. Rejected once delivered, cancelled, or returned;
    /// otherwise restores stock via the policy, records reason and actor in
    /// metadata and the tracking log, and queues carrier-side cancellation
    /// when a shipment exists.
    #[instrument(skip(self, reason), fields(order_id = %order_id))]
    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        reason: String,
        updated_by: Option<String>,
    ) -> Result<order::Model, ServiceError> {
        let order = self
            .get_order(order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {order_id} not found")))?;

        if order.status.is_terminal() {
            return Err(ServiceError::InvalidOperation(format!(
                "Cannot cancel order {} in status {}",
                order.order_number, order.status
            )));
        }

        let updated = self
            .update_status(order_id, OrderStatus::Cancelled, updated_by.clone())
            .await?;

        let mut metadata = updated.metadata.clone();
        merge_metadata(
            &mut metadata,
            "cancellation",
            json!({
                "reason": reason,
                "cancelled_by": updated_by,
                "cancelled_at": Utc::now(),
            }),
        );
        let updated = self
            .update(
                order_id,
                UpdateOrderRequest {
                    metadata: Some(metadata),
                    ..Default::default()
                },
            )
            .await?;

        self.tracking
            .append_entry(
                order_id,
                TrackingEntry {
                    status: OrderStatus::Cancelled,
                    description: format!("Order cancelled: {reason}"),
                    timestamp: Utc::now(),
                    location: None,
                    updated_by: updated_by.clone(),
                },
                OrderStatus::Cancelled,
            )
            .await?;

        if let Some(tracking_code) = updated.tracking_code.clone() {
            let effect = SideEffect::CancelCarrierShipment {
                order_id,
                tracking_code,
                reason: reason.clone(),
            };
            if let Err(e) = outbox::enqueue(&*self.db, &effect).await {
                warn!(error = %e, order_id = %order_id, "failed to queue carrier cancellation");
            }
        }

        self.emit(Event::OrderCancelled(order_id)).await;
        Ok(updated)
    }

    /// Accepts a return for a delivered order: requests a carrier pickup
    /// when a shipment exists, restores stock via the policy, and records
    /// the request in metadata and the tracking log.
    #[instrument(skip(self, reason), fields(order_id = %order_id))]
    pub async fn return_order(
        &self,
        order_id: Uuid,
        reason: String,
        updated_by: Option<String>,
    ) -> Result<order::Model, ServiceError> {
        let order = self
            .get_order(order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {order_id} not found")))?;

        if order.status != OrderStatus::Delivered {
            return Err(ServiceError::InvalidOperation(format!(
                "Only delivered orders can be returned, order {} is {}",
                order.order_number, order.status
            )));
        }

        if let Some(tracking_code) = order.tracking_code.clone() {
            let effect = SideEffect::RequestCarrierReturn {
                order_id,
                tracking_code,
                reason: reason.clone(),
            };
            if let Err(e) = outbox::enqueue(&*self.db, &effect).await {
                warn!(error = %e, order_id = %order_id, "failed to queue carrier return pickup");
            }
        }

        let updated = self
            .update_status(order_id, OrderStatus::Returned, updated_by.clone())
            .await?;

        let mut metadata = updated.metadata.clone();
        merge_metadata(
            &mut metadata,
            "return_request",
            json!({
                "reason": reason,
                "requested_by": updated_by,
                "requested_at": Utc::now(),
            }),
        );
        let updated = self
            .update(
                order_id,
                UpdateOrderRequest {
                    metadata: Some(metadata),
                    ..Default::default()
                },
            )
            .await?;

        self.tracking
            .append_entry(
                order_id,
                TrackingEntry {
                    status: OrderStatus::Returned,
                    description: format!("Return requested: {reason}"),
                    timestamp: Utc::now(),
                    location: None,
                    updated_by,
                },
                OrderStatus::Returned,
            )
            .await?;

        self.emit(Event::OrderReturned(order_id)).await;
        Ok(updated)
    }

    /// Hard delete, permitted only for cancelled orders. Removes the order,
    /// its items, and its tracking log.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn remove(&self, order_id: Uuid) -> Result<(), ServiceError> {
        let order = self
            .get_order(order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {order_id} not found")))?;

        if order.status != OrderStatus::Cancelled {
            return Err(ServiceError::InvalidOperation(format!(
                "Only cancelled orders can be deleted, order {} is {}",
                order.order_number, order.status
            )));
        }

        let txn = self.db.begin().await?;
        order_item::Entity::delete_many()
            .filter(order_item::Column::OrderId.eq(order_id))
            .exec(&txn)
            .await?;
        self.tracking.remove_for_order(&txn, order_id).await?;
        order::Entity::delete_by_id(order_id).exec(&txn).await?;
        txn.commit().await?;

        info!(order_id = %order_id, "order deleted");
        self.emit(Event::OrderRemoved(order_id)).await;
        Ok(())
    }

    /// Requests a carrier shipment for the order. Rejected when a shipment
    /// already exists or the receiver phone is malformed. On success stores
    /// the tracking code, advances the order to `Processing`, and records
    /// the carrier on the tracking log. COD orders whose carrier-registered
    /// collection amount comes back zero are flagged in metadata for
    /// operator review, not auto-corrected.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn create_carrier_shipment(
        &self,
        order_id: Uuid,
    ) -> Result<order::Model, ServiceError> {
        let order = self
            .get_order(order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {order_id} not found")))?;

        if let Some(existing) = &order.tracking_code {
            return Err(ServiceError::Conflict(format!(
                "Order {} already has shipment {existing}",
                order.order_number
            )));
        }
        if !PHONE_RE.is_match(&order.shipping_address.phone) {
            return Err(ServiceError::ValidationError(
                "Receiver phone must be 10-11 digits".to_string(),
            ));
        }

        let items = self.items_for_order(order_id).await?;
        let product_ids: Vec<Uuid> = items.iter().map(|i| i.product_id).collect();
        let products: HashMap<Uuid, product::Model> = product::Entity::find()
            .filter(product::Column::Id.is_in(product_ids))
            .all(&*self.db)
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();

        let shipment_items: Vec<ShipmentItem> = items
            .iter()
            .map(|item| {
                let product = products.get(&item.product_id);
                let weight = product
                    .and_then(|p| p.weight_grams)
                    .or_else(|| {
                        item.options
                            .get("weight_grams")
                            .and_then(serde_json::Value::as_i64)
                            .map(|w| w as i32)
                    })
                    .unwrap_or(0);
                ShipmentItem {
                    name: product
                        .map(|p| p.name.clone())
                        .unwrap_or_else(|| item.product_id.to_string()),
                    quantity: item.quantity,
                    weight_grams: weight,
                }
            })
            .collect();
        let total_weight: i32 = shipment_items
            .iter()
            .map(|i| i.weight_grams * i.quantity)
            .sum();

        let cod_amount = if order.payment_method == PaymentMethod::Cod {
            order.final_amount
        } else {
            Decimal::ZERO
        };

        let address = &order.shipping_address;
        let info = self
            .carrier
            .create_shipment(ShipmentRequest {
                order_number: order.order_number.clone(),
                receiver_name: address.name.clone(),
                receiver_phone: address.phone.clone(),
                receiver_address: address.street.clone(),
                province_code: address.province_code.clone(),
                district_code: address.district_code.clone(),
                ward_code: address.ward_code.clone(),
                weight_grams: total_weight,
                cod_amount,
                items: shipment_items,
            })
            .await?;

        let tracking_code = info.tracking_code.clone();
        self.update(
            order_id,
            UpdateOrderRequest {
                tracking_code: Some(tracking_code.clone()),
                ..Default::default()
            },
        )
        .await?;
        let updated = self
            .update_status(
                order_id,
                OrderStatus::Processing,
                Some("carrier-shipment".to_string()),
            )
            .await?;

        self.tracking
            .set_carrier(
                order_id,
                updated.status,
                self.config.carrier.name.clone(),
                tracking_code.clone(),
                self.config.carrier.tracking_url(&tracking_code),
            )
            .await?;
        self.tracking
            .append_entry(
                order_id,
                TrackingEntry {
                    status: updated.status,
                    description: format!(
                        "Shipment created with {}, tracking code {tracking_code}",
                        self.config.carrier.name
                    ),
                    timestamp: Utc::now(),
                    location: None,
                    updated_by: Some("carrier-shipment".to_string()),
                },
                updated.status,
            )
            .await?;

        let mut updated = updated;
        if order.payment_method == PaymentMethod::Cod
            && info.money_collection == Decimal::ZERO
            && order.final_amount > Decimal::ZERO
        {
            warn!(
                order_id = %order_id,
                expected = %order.final_amount,
                "carrier registered zero COD collection, flagging for review"
            );
            let mut metadata = updated.metadata.clone();
            merge_metadata(
                &mut metadata,
                "cod_collection_flagged",
                json!({
                    "expected": order.final_amount,
                    "registered": Decimal::ZERO,
                    "flagged_at": Utc::now(),
                }),
            );
            updated = self
                .update(
                    order_id,
                    UpdateOrderRequest {
                        metadata: Some(metadata),
                        ..Default::default()
                    },
                )
                .await?;
        }

        info!(order_id = %order_id, tracking_code = %tracking_code, "carrier shipment created");
        self.emit(Event::ShipmentCreated {
            order_id,
            tracking_code,
        })
        .await;
        Ok(updated)
    }

    async fn emit(&self, event: Event) {
        if let Some(event_sender) = &self.event_sender {
            if let Err(e) = event_sender.send(event).await {
                warn!(error = %e, "failed to send event");
            }
        }
    }
}
