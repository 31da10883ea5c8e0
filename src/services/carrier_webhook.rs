//! Reconciliation of inbound carrier status webhooks.
//!
//! Carrier deliveries are unordered and may repeat; reconciliation relies
//! on the history-entry dedup check and on never overwriting an order that
//! reached a terminal state locally. Carrier history is appended even after
//! local finality.

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::entities::order::{OrderStatus, PaymentMethod, PaymentStatus};
use crate::entities::order_tracking::TrackingEntry;
use crate::errors::ServiceError;
use crate::services::orders::{OrderService, UpdateOrderRequest};
use crate::services::tracking::OrderTrackingService;

const CARRIER_DATE_FORMAT: &str = "%d/%m/%Y %H:%M:%S";

/// Inbound webhook envelope. Token verification happens at the boundary;
/// the reconciler consumes the `DATA` object only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarrierWebhookPayload {
    #[serde(rename = "DATA")]
    pub data: CarrierStatusEvent,
    #[serde(rename = "TOKEN", default)]
    pub token: Option<String>,
}

/// One carrier status event, field names as on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarrierStatusEvent {
    #[serde(rename = "ORDER_NUMBER")]
    pub tracking_code: String,
    #[serde(rename = "ORDER_STATUS")]
    pub status_code: i32,
    #[serde(rename = "ORDER_STATUSDATE")]
    pub status_date: String,
    #[serde(rename = "STATUS_NAME", default)]
    pub status_name: Option<String>,
    #[serde(rename = "NOTE", default)]
    pub note: Option<String>,
    #[serde(rename = "LOCALION_CURRENTLY", default)]
    pub current_location: Option<String>,
    #[serde(rename = "MONEY_COLLECTION", default)]
    pub money_collection: Option<rust_decimal::Decimal>,
    #[serde(rename = "MONEY_TOTAL", default)]
    pub money_total: Option<rust_decimal::Decimal>,
}

/// Maps a carrier status code to an internal order status. Unknown codes
/// map to nothing and only leave a history entry.
pub fn map_carrier_status(code: i32) -> Option<OrderStatus> {
    match code {
        100 | 102 | 103 | 104 => Some(OrderStatus::Processing),
        105 | 200 | 202 | 300 | 320 | 400 | 500 => Some(OrderStatus::Shipping),
        501 => Some(OrderStatus::Delivered),
        107 | 201 | 503 => Some(OrderStatus::Cancelled),
        502 | 504 | 505 => Some(OrderStatus::Returned),
        _ => None,
    }
}

/// Whether the code is in the carrier's own closed set of final statuses.
pub fn is_carrier_final(code: i32) -> bool {
    matches!(code, 107 | 201 | 501 | 503 | 504)
}

/// Parses the carrier's `dd/mm/yyyy HH:MM:SS` timestamp.
pub fn parse_status_date(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, CARRIER_DATE_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// No order carries this tracking code; the event is discarded.
    UnknownTrackingCode,
    /// An identical history entry already exists; the event is discarded.
    Duplicate,
    /// The order status was updated and the event recorded.
    Applied { order_id: Uuid, status: OrderStatus },
    /// Only the tracking history was extended; the order status stands.
    HistoryRecorded { order_id: Uuid },
}

#[derive(Clone)]
pub struct CarrierWebhookService {
    #[allow(dead_code)]
    db: Arc<DatabaseConnection>,
    orders: OrderService,
    tracking: OrderTrackingService,
}

impl CarrierWebhookService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        orders: OrderService,
        tracking: OrderTrackingService,
    ) -> Self {
        Self {
            db,
            orders,
            tracking,
        }
    }

    /// Reconciles one carrier status event against the order it refers to.
    #[instrument(skip(self, event), fields(tracking_code = %event.tracking_code, status_code = event.status_code))]
    pub async fn handle_event(
        &self,
        event: CarrierStatusEvent,
    ) -> Result<WebhookOutcome, ServiceError> {
        let Some(order) = self
            .orders
            .get_order_by_tracking_code(&event.tracking_code)
            .await?
        else {
            info!("webhook for unknown tracking code discarded");
            return Ok(WebhookOutcome::UnknownTrackingCode);
        };

        let log = self.tracking.load_or_create(order.id, order.status).await?;

        let timestamp = parse_status_date(&event.status_date).unwrap_or_else(|| {
            warn!(raw = %event.status_date, "unparseable carrier status date, using now");
            Utc::now()
        });

        let mapped = map_carrier_status(event.status_code);
        let entry_status = mapped.unwrap_or(order.status);
        let description = event
            .status_name
            .clone()
            .or_else(|| event.note.clone())
            .unwrap_or_else(|| format!("Carrier status {}", event.status_code));

        if log.history.contains(entry_status, timestamp, &description) {
            info!("duplicate carrier event discarded");
            return Ok(WebhookOutcome::Duplicate);
        }

        let entry = TrackingEntry {
            status: entry_status,
            description,
            timestamp,
            location: event.current_location.clone(),
            updated_by: Some("carrier-webhook".to_string()),
        };

        // Local finality wins over carrier state, but the carrier history
        // is still preserved in full.
        if order.status.is_terminal() {
            self.tracking
                .append_entry(order.id, entry, order.status)
                .await?;
            return Ok(WebhookOutcome::HistoryRecorded { order_id: order.id });
        }

        let mut new_status = order.status;
        if let Some(target) = mapped {
            if target != order.status {
                if order.status.can_transition_to(target) {
                    self.orders
                        .update_status(order.id, target, Some("carrier-webhook".to_string()))
                        .await?;
                    if target == OrderStatus::Delivered
                        && order.payment_method == PaymentMethod::Cod
                    {
                        // COD funds change hands at the door.
                        self.orders
                            .update(
                                order.id,
                                UpdateOrderRequest {
                                    payment_status: Some(PaymentStatus::Paid),
                                    ..Default::default()
                                },
                            )
                            .await?;
                    }
                    new_status = target;
                } else {
                    info!(
                        current = %order.status,
                        target = %target,
                        carrier_final = is_carrier_final(event.status_code),
                        "out-of-order carrier status left unapplied, history recorded"
                    );
                }
            }
        }

        self.tracking
            .append_entry(order.id, entry, new_status)
            .await?;

        if new_status != order.status {
            Ok(WebhookOutcome::Applied {
                order_id: order.id,
                status: new_status,
            })
        } else {
            Ok(WebhookOutcome::HistoryRecorded { order_id: order.id })
        }
    }
}
