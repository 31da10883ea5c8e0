use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::entities::order::OrderStatus;

pub mod outbox;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

// Define the various events that can occur in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Order events
    OrderCreated(Uuid),
    OrderStatusChanged {
        order_id: Uuid,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },
    OrderCancelled(Uuid),
    OrderReturned(Uuid),
    OrderRemoved(Uuid),

    // Inventory events
    InventoryAdjusted {
        product_id: Uuid,
        branch_id: Uuid,
        old_quantity: i32,
        new_quantity: i32,
    },

    // Shipment events
    ShipmentCreated {
        order_id: Uuid,
        tracking_code: String,
    },

    // Payment events
    PaymentCaptured(Uuid),
    PaymentFailed(Uuid),
    PendingOrderPromoted {
        order_id: Uuid,
        payment_request_id: String,
    },
}
