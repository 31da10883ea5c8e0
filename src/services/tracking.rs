use std::sync::Arc;

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set,
};
use tracing::instrument;
use uuid::Uuid;

use crate::entities::order::OrderStatus;
use crate::entities::order_tracking::{self, TrackingEntry, TrackingHistory};
use crate::errors::ServiceError;

/// Service owning the per-order tracking log: an append-only, newest-first
/// history of status changes, stored separately from the order itself.
#[derive(Clone)]
pub struct OrderTrackingService {
    db: Arc<DatabaseConnection>,
}

impl OrderTrackingService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn get_for_order(
        &self,
        order_id: Uuid,
    ) -> Result<Option<order_tracking::Model>, ServiceError> {
        let log = order_tracking::Entity::find()
            .filter(order_tracking::Column::OrderId.eq(order_id))
            .one(&*self.db)
            .await?;
        Ok(log)
    }

    /// Fetches the log for an order, creating an empty one when missing.
    /// Webhooks may arrive for orders whose log was never seeded.
    pub async fn load_or_create(
        &self,
        order_id: Uuid,
        status: OrderStatus,
    ) -> Result<order_tracking::Model, ServiceError> {
        if let Some(existing) = self.get_for_order(order_id).await? {
            return Ok(existing);
        }
        let log = order_tracking::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            status: Set(status),
            carrier_name: Set(None),
            tracking_code: Set(None),
            tracking_url: Set(None),
            history: Set(TrackingHistory::default()),
            created_at: Set(Utc::now()),
            updated_at: Set(None),
        };
        let created = log.insert(&*self.db).await?;
        Ok(created)
    }

    /// Seeds the log at order creation with its first history entry.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn seed(
        &self,
        order_id: Uuid,
        status: OrderStatus,
        description: String,
        updated_by: Option<String>,
    ) -> Result<order_tracking::Model, ServiceError> {
        let log = self.load_or_create(order_id, status).await?;
        self.append_entry(
            order_id,
            TrackingEntry {
                status,
                description,
                timestamp: log.created_at,
                location: None,
                updated_by,
            },
            status,
        )
        .await
    }

    /// Appends one history entry and mirrors the order's current status.
    /// The mirror is passed separately: a webhook may record carrier
    /// history on an order whose own status is already final.
    #[instrument(skip(self, entry), fields(order_id = %order_id, entry_status = %entry.status))]
    pub async fn append_entry(
        &self,
        order_id: Uuid,
        entry: TrackingEntry,
        order_status: OrderStatus,
    ) -> Result<order_tracking::Model, ServiceError> {
        let log = self.load_or_create(order_id, order_status).await?;

        let mut history = log.history.clone();
        history.push(entry);

        let mut active: order_tracking::ActiveModel = log.into();
        active.history = Set(history);
        active.status = Set(order_status);
        active.updated_at = Set(Some(Utc::now()));
        let updated = active.update(&*self.db).await?;
        Ok(updated)
    }

    /// Records the carrier assignment on the log.
    pub async fn set_carrier(
        &self,
        order_id: Uuid,
        order_status: OrderStatus,
        carrier_name: String,
        tracking_code: String,
        tracking_url: String,
    ) -> Result<order_tracking::Model, ServiceError> {
        let log = self.load_or_create(order_id, order_status).await?;
        let mut active: order_tracking::ActiveModel = log.into();
        active.carrier_name = Set(Some(carrier_name));
        active.tracking_code = Set(Some(tracking_code));
        active.tracking_url = Set(Some(tracking_url));
        active.updated_at = Set(Some(Utc::now()));
        let updated = active.update(&*self.db).await?;
        Ok(updated)
    }

    /// Deletes the log with its order. Only called from order removal.
    pub async fn remove_for_order(
        &self,
        conn: &impl ConnectionTrait,
        order_id: Uuid,
    ) -> Result<(), ServiceError> {
        order_tracking::Entity::delete_many()
            .filter(order_tracking::Column::OrderId.eq(order_id))
            .exec(conn)
            .await?;
        Ok(())
    }
}
