use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A draft order held until a payment gateway confirms funds. Deleting the
/// draft after promotion is the at-most-once guard against callback replay.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "pending_orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Payment request identifier the gateway echoes back in its callback.
    #[sea_orm(unique)]
    pub payment_request_id: String,

    pub user_id: Uuid,

    /// Gateway-side correlation id (wallet order id / card session id).
    pub gateway_ref: String,

    /// Full order-creation payload, serialized as submitted.
    pub payload: Json,

    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
