use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::FromJsonQueryResult;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Enum representing the possible statuses of an order.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum OrderStatus {
    #[sea_orm(string_value = "Pending")]
    Pending,
    #[sea_orm(string_value = "Confirmed")]
    Confirmed,
    #[sea_orm(string_value = "Processing")]
    Processing,
    #[sea_orm(string_value = "Shipping")]
    Shipping,
    #[sea_orm(string_value = "Delivered")]
    Delivered,
    #[sea_orm(string_value = "Cancelled")]
    Cancelled,
    #[sea_orm(string_value = "Returned")]
    Returned,
}

impl OrderStatus {
    /// States past which the webhook reconciler will not overwrite the order.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Delivered | OrderStatus::Cancelled | OrderStatus::Returned
        )
    }

    /// States in which the order holds stock against the ledger.
    pub fn holds_stock(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending
                | OrderStatus::Confirmed
                | OrderStatus::Processing
                | OrderStatus::Shipping
        )
    }

    /// The statuses this one may move to. Forward skips are allowed (carrier
    /// and gateway callbacks can jump steps), cancelled/returned orders may
    /// re-enter active fulfillment, and late carrier reconciliation may land
    /// a delivered status on an order the shop already closed out.
    pub fn allowed_targets(&self) -> &'static [OrderStatus] {
        use OrderStatus::*;
        match self {
            Pending => &[Confirmed, Processing, Shipping, Delivered, Cancelled],
            Confirmed => &[Processing, Shipping, Delivered, Cancelled],
            Processing => &[Shipping, Delivered, Cancelled],
            Shipping => &[Delivered, Cancelled, Returned],
            Delivered => &[Returned, Cancelled],
            Cancelled => &[Pending, Confirmed, Processing, Shipping, Delivered],
            Returned => &[Pending, Confirmed, Processing, Shipping, Delivered],
        }
    }

    /// Same-state transitions are accepted as no-ops.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        *self == next || self.allowed_targets().contains(&next)
    }
}

/// Payment state of an order or payment attempt.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum PaymentStatus {
    #[sea_orm(string_value = "Pending")]
    Pending,
    #[sea_orm(string_value = "Paid")]
    Paid,
    #[sea_orm(string_value = "Failed")]
    Failed,
    #[sea_orm(string_value = "Refunded")]
    Refunded,
}

#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum PaymentMethod {
    #[sea_orm(string_value = "Cod")]
    Cod,
    #[sea_orm(string_value = "BankTransfer")]
    BankTransfer,
    #[sea_orm(string_value = "Card")]
    Card,
    #[sea_orm(string_value = "Wallet")]
    Wallet,
}

/// Receiver address stored on the order as a JSON document.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult, Validate,
)]
pub struct ShippingAddress {
    #[validate(length(min = 1, message = "Receiver name is required"))]
    pub name: String,
    pub phone: String,
    #[validate(length(min = 1, message = "Street address is required"))]
    pub street: String,
    #[serde(default)]
    pub province_code: Option<String>,
    #[serde(default)]
    pub district_code: Option<String>,
    #[serde(default)]
    pub ward_code: Option<String>,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// System-generated order number, `YM` + yymmdd + 4 random digits.
    pub order_number: String,

    pub user_id: Uuid,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub payment_method: PaymentMethod,

    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub shipping_fee: Decimal,
    pub total_amount: Decimal,
    /// `total_amount` minus the voucher discount.
    pub final_amount: Decimal,

    pub voucher_id: Option<Uuid>,
    pub voucher_discount: Decimal,

    #[sea_orm(column_type = "Json")]
    pub shipping_address: ShippingAddress,

    /// Fulfillment branch this order draws stock from, when pinned.
    pub branch_id: Option<Uuid>,

    /// Carrier-assigned shipment identifier, null until a shipment exists.
    pub tracking_code: Option<String>,

    /// Audit trail for cross-system side effects (carrier sync results,
    /// COD collection flags, return requests).
    pub metadata: Json,

    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub version: i32,
}

/// Sets one key in an order's metadata audit map, promoting non-object
/// values to an empty object first.
pub fn merge_metadata(metadata: &mut Json, key: &str, value: Json) {
    if !metadata.is_object() {
        *metadata = Json::Object(serde_json::Map::new());
    }
    if let Some(map) = metadata.as_object_mut() {
        map.insert(key.to_string(), value);
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItems,
    #[sea_orm(has_one = "super::order_tracking::Entity")]
    OrderTracking,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItems.def()
    }
}

impl Related<super::order_tracking::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderTracking.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
