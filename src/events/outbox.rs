use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clients::carrier::CarrierClient;
use crate::clients::cart::CartClient;
use crate::entities::order::{self, merge_metadata};
use crate::entities::outbox_task::{self, TaskStatus};
use crate::entities::{product, voucher};
use crate::errors::ServiceError;

const MAX_ATTEMPTS: i32 = 8;
const BASE_BACKOFF_SECS: i64 = 2; // exponential backoff base

/// A side effect detached from its triggering order mutation. Enqueued
/// after the primary write commits, executed by the worker, retried with
/// backoff, and left as a durable failure record when exhausted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SideEffect {
    CancelCarrierShipment {
        order_id: Uuid,
        tracking_code: String,
        reason: String,
    },
    RequestCarrierReturn {
        order_id: Uuid,
        tracking_code: String,
        reason: String,
    },
    ClearCart {
        user_id: Uuid,
    },
    ConsumeVoucher {
        voucher_id: Uuid,
        order_id: Uuid,
    },
    IncrementSoldCount {
        product_id: Uuid,
        quantity: i32,
    },
}

impl SideEffect {
    pub fn task_type(&self) -> &'static str {
        match self {
            SideEffect::CancelCarrierShipment { .. } => "CancelCarrierShipment",
            SideEffect::RequestCarrierReturn { .. } => "RequestCarrierReturn",
            SideEffect::ClearCart { .. } => "ClearCart",
            SideEffect::ConsumeVoucher { .. } => "ConsumeVoucher",
            SideEffect::IncrementSoldCount { .. } => "IncrementSoldCount",
        }
    }

    fn aggregate_id(&self) -> Option<Uuid> {
        match self {
            SideEffect::CancelCarrierShipment { order_id, .. }
            | SideEffect::RequestCarrierReturn { order_id, .. }
            | SideEffect::ConsumeVoucher { order_id, .. } => Some(*order_id),
            SideEffect::ClearCart { user_id } => Some(*user_id),
            SideEffect::IncrementSoldCount { product_id, .. } => Some(*product_id),
        }
    }
}

/// Enqueue a side effect. Call after the write it follows has committed.
pub async fn enqueue(db: &impl ConnectionTrait, effect: &SideEffect) -> Result<(), ServiceError> {
    let now = Utc::now();
    let task = outbox_task::ActiveModel {
        id: Set(Uuid::new_v4()),
        task_type: Set(effect.task_type().to_string()),
        aggregate_id: Set(effect.aggregate_id()),
        payload: Set(serde_json::to_value(effect)?),
        status: Set(TaskStatus::Pending),
        attempts: Set(0),
        available_at: Set(now),
        last_error: Set(None),
        created_at: Set(now),
        updated_at: Set(None),
        processed_at: Set(None),
    };
    let task = task.insert(db).await?;
    debug!(task_id = %task.id, task_type = %task.task_type, "enqueued outbox task");
    Ok(())
}

/// Drains and executes outbox tasks. Owns the external collaborators the
/// side effects talk to.
#[derive(Clone)]
pub struct OutboxWorker {
    db: Arc<DatabaseConnection>,
    carrier: Arc<dyn CarrierClient>,
    cart: Arc<dyn CartClient>,
}

impl OutboxWorker {
    pub fn new(
        db: Arc<DatabaseConnection>,
        carrier: Arc<dyn CarrierClient>,
        cart: Arc<dyn CartClient>,
    ) -> Self {
        Self { db, carrier, cart }
    }

    /// Spawns the polling loop.
    pub fn start(self, poll_interval: Duration) -> tokio::task::JoinHandle<()> {
        info!(interval_ms = poll_interval.as_millis() as u64, "starting outbox worker");
        tokio::spawn(async move {
            loop {
                if let Err(e) = self.drain_once(50).await {
                    error!(error = %e, "outbox worker error");
                }
                tokio::time::sleep(poll_interval).await;
            }
        })
    }

    /// Claims and executes one batch of due tasks. Returns how many tasks
    /// were attempted.
    pub async fn drain_once(&self, batch_size: u64) -> Result<usize, ServiceError> {
        let now = Utc::now();
        let due = outbox_task::Entity::find()
            .filter(outbox_task::Column::Status.eq(TaskStatus::Pending))
            .filter(outbox_task::Column::AvailableAt.lte(now))
            .order_by_asc(outbox_task::Column::CreatedAt)
            .limit(batch_size)
            .all(&*self.db)
            .await?;

        let mut attempted = 0;
        for task in due {
            attempted += 1;
            let attempts = task.attempts + 1;
            let task_id = task.id;

            let mut claimed: outbox_task::ActiveModel = task.clone().into();
            claimed.status = Set(TaskStatus::Processing);
            claimed.attempts = Set(attempts);
            claimed.updated_at = Set(Some(Utc::now()));
            let claimed = claimed.update(&*self.db).await?;

            let outcome = match serde_json::from_value::<SideEffect>(task.payload.clone()) {
                Ok(effect) => self.execute(effect).await,
                Err(e) => Err(ServiceError::SerializationError(format!(
                    "undecodable outbox payload: {e}"
                ))),
            };

            let mut finished: outbox_task::ActiveModel = claimed.into();
            match outcome {
                Ok(()) => {
                    finished.status = Set(TaskStatus::Delivered);
                    finished.processed_at = Set(Some(Utc::now()));
                    finished.last_error = Set(None);
                }
                Err(e) if attempts < MAX_ATTEMPTS => {
                    let backoff = BASE_BACKOFF_SECS.saturating_pow(attempts as u32);
                    warn!(task_id = %task_id, attempts, backoff_secs = backoff, error = %e, "outbox task failed, scheduling retry");
                    finished.status = Set(TaskStatus::Pending);
                    finished.available_at = Set(Utc::now() + chrono::Duration::seconds(backoff));
                    finished.last_error = Set(Some(e.to_string()));
                }
                Err(e) => {
                    error!(task_id = %task_id, attempts, error = %e, "outbox task exhausted retries");
                    finished.status = Set(TaskStatus::Failed);
                    finished.last_error = Set(Some(e.to_string()));
                }
            }
            finished.updated_at = Set(Some(Utc::now()));
            finished.update(&*self.db).await?;
        }
        Ok(attempted)
    }

    async fn execute(&self, effect: SideEffect) -> Result<(), ServiceError> {
        match effect {
            SideEffect::CancelCarrierShipment {
                order_id,
                tracking_code,
                reason,
            } => {
                let result = self
                    .carrier
                    .request_cancellation(&tracking_code, &reason)
                    .await;
                self.record_carrier_sync(order_id, "carrier_cancellation", &result)
                    .await?;
                let result = result?;
                if !result.is_success() {
                    return Err(ServiceError::ExternalServiceError(format!(
                        "carrier rejected cancellation of {tracking_code}: status {}",
                        result.status
                    )));
                }
                Ok(())
            }
            SideEffect::RequestCarrierReturn {
                order_id,
                tracking_code,
                reason,
            } => {
                let result = self.carrier.request_return(&tracking_code, &reason).await;
                self.record_carrier_sync(order_id, "carrier_return", &result)
                    .await?;
                let result = result?;
                if !result.is_success() {
                    return Err(ServiceError::ExternalServiceError(format!(
                        "carrier rejected return of {tracking_code}: status {}",
                        result.status
                    )));
                }
                Ok(())
            }
            SideEffect::ClearCart { user_id } => self.cart.clear_cart(user_id).await,
            SideEffect::ConsumeVoucher {
                voucher_id,
                order_id,
            } => {
                let voucher = voucher::Entity::find_by_id(voucher_id)
                    .one(&*self.db)
                    .await?
                    .ok_or_else(|| {
                        ServiceError::NotFound(format!("Voucher {voucher_id} not found"))
                    })?;
                if voucher.consumed {
                    debug!(voucher_id = %voucher_id, order_id = %order_id, "voucher already consumed");
                    return Ok(());
                }
                let mut active: voucher::ActiveModel = voucher.into();
                active.consumed = Set(true);
                active.consumed_at = Set(Some(Utc::now()));
                active.update(&*self.db).await?;
                Ok(())
            }
            SideEffect::IncrementSoldCount {
                product_id,
                quantity,
            } => {
                let product = product::Entity::find_by_id(product_id)
                    .one(&*self.db)
                    .await?
                    .ok_or_else(|| {
                        ServiceError::NotFound(format!("Product {product_id} not found"))
                    })?;
                let new_count = product.sold_count + quantity;
                let mut active: product::ActiveModel = product.into();
                active.sold_count = Set(new_count);
                active.updated_at = Set(Some(Utc::now()));
                active.update(&*self.db).await?;
                Ok(())
            }
        }
    }

    /// Mirrors a carrier sync outcome into the order's metadata so
    /// operators can inspect it without reading the outbox table.
    async fn record_carrier_sync(
        &self,
        order_id: Uuid,
        key: &str,
        result: &Result<crate::clients::carrier::CarrierSyncResult, ServiceError>,
    ) -> Result<(), ServiceError> {
        let Some(order) = order::Entity::find_by_id(order_id).one(&*self.db).await? else {
            warn!(order_id = %order_id, "order vanished before carrier sync result could be recorded");
            return Ok(());
        };

        let value = match result {
            Ok(r) => json!({
                "status": r.status,
                "error": r.error,
                "recorded_at": Utc::now(),
            }),
            Err(e) => json!({
                "status": null,
                "error": e.to_string(),
                "recorded_at": Utc::now(),
            }),
        };

        let mut metadata = order.metadata.clone();
        merge_metadata(&mut metadata, key, value);
        let mut active: order::ActiveModel = order.into();
        active.metadata = Set(metadata);
        active.updated_at = Set(Some(Utc::now()));
        active.update(&*self.db).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_effects_serialize_with_kind_tag() {
        let effect = SideEffect::ClearCart {
            user_id: Uuid::new_v4(),
        };
        let value = serde_json::to_value(&effect).unwrap();
        assert_eq!(value["kind"], "clear_cart");

        let back: SideEffect = serde_json::from_value(value).unwrap();
        assert_eq!(back.task_type(), "ClearCart");
    }

    #[test]
    fn backoff_grows_exponentially() {
        let delays: Vec<i64> = (1..5)
            .map(|attempts| BASE_BACKOFF_SECS.saturating_pow(attempts as u32))
            .collect();
        assert_eq!(delays, vec![2, 4, 8, 16]);
    }
}
