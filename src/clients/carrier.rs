use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::ServiceError;

/// Outbound shipment creation payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShipmentRequest {
    pub order_number: String,
    pub receiver_name: String,
    pub receiver_phone: String,
    pub receiver_address: String,
    pub province_code: Option<String>,
    pub district_code: Option<String>,
    pub ward_code: Option<String>,
    pub weight_grams: i32,
    /// Amount the carrier collects on delivery; zero for prepaid orders.
    pub cod_amount: Decimal,
    pub items: Vec<ShipmentItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShipmentItem {
    pub name: String,
    pub quantity: i32,
    pub weight_grams: i32,
}

/// Shipment details as reported by the carrier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShipmentInfo {
    pub tracking_code: String,
    pub fee: Option<Decimal>,
    /// Collection amount the carrier registered for the shipment.
    pub money_collection: Decimal,
}

/// Result of a carrier-side cancellation or return request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarrierSyncResult {
    pub status: i32,
    pub error: Option<String>,
}

impl CarrierSyncResult {
    pub fn is_success(&self) -> bool {
        self.status == 200 && self.error.is_none()
    }
}

/// Carrier integration surface. Implementations live outside this crate;
/// the engine only consumes the capability.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CarrierClient: Send + Sync {
    async fn create_shipment(&self, request: ShipmentRequest)
        -> Result<ShipmentInfo, ServiceError>;

    async fn get_shipment_info(&self, tracking_code: &str) -> Result<ShipmentInfo, ServiceError>;

    async fn request_cancellation(
        &self,
        tracking_code: &str,
        reason: &str,
    ) -> Result<CarrierSyncResult, ServiceError>;

    async fn request_return(
        &self,
        tracking_code: &str,
        reason: &str,
    ) -> Result<CarrierSyncResult, ServiceError>;

    async fn resend_webhook<'a>(
        &self,
        tracking_code: &str,
        reason: Option<&'a str>,
    ) -> Result<(), ServiceError>;
}
