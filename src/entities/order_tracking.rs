use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::FromJsonQueryResult;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::order::OrderStatus;

/// One status-change record in an order's tracking history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, FromJsonQueryResult)]
pub struct TrackingEntry {
    pub status: OrderStatus,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
}

/// Append-only history, kept newest-first after every insert. Entries are
/// never removed.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, FromJsonQueryResult)]
pub struct TrackingHistory(pub Vec<TrackingEntry>);

impl TrackingHistory {
    pub fn push(&mut self, entry: TrackingEntry) {
        self.0.push(entry);
        self.0.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    }

    /// Duplicate-delivery check: same status, same timestamp, same text.
    pub fn contains(
        &self,
        status: OrderStatus,
        timestamp: DateTime<Utc>,
        description: &str,
    ) -> bool {
        self.0.iter().any(|e| {
            e.status == status && e.timestamp == timestamp && e.description == description
        })
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn newest(&self) -> Option<&TrackingEntry> {
        self.0.first()
    }
}

/// Tracking log document, one-to-one with an order.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "order_tracking")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(unique)]
    pub order_id: Uuid,

    /// Mirror of the order's current status.
    pub status: OrderStatus,

    pub carrier_name: Option<String>,
    pub tracking_code: Option<String>,
    pub tracking_url: Option<String>,

    #[sea_orm(column_type = "Json")]
    pub history: TrackingHistory,

    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::order::Entity",
        from = "Column::OrderId",
        to = "super::order::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Order,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
