//! orderflow — order lifecycle and inventory reconciliation engine.
//!
//! The crate owns the order status state machine, the branch-scoped stock
//! ledger it drives, idempotent reconciliation of carrier webhooks, and
//! at-most-once promotion of pre-payment order drafts. Carrier and payment
//! gateway HTTP clients are consumed as trait collaborators and live
//! outside this crate.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod clients;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod migrator;
pub mod services;

use std::sync::Arc;
use std::time::Duration;

use sea_orm::DatabaseConnection;

use clients::carrier::CarrierClient;
use clients::cart::CartClient;
use events::outbox::OutboxWorker;
use events::EventSender;
use services::carrier_webhook::CarrierWebhookService;
use services::inventory::InventoryService;
use services::orders::OrderService;
use services::payments::PaymentService;
use services::pending_orders::PendingOrderService;
use services::tracking::OrderTrackingService;

/// Wired application state: one value carrying every service, ready to be
/// embedded by a server shell or a test harness.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<config::AppConfig>,
    pub event_sender: Option<Arc<EventSender>>,
    pub inventory: InventoryService,
    pub tracking: OrderTrackingService,
    pub orders: OrderService,
    pub payments: PaymentService,
    pub pending_orders: PendingOrderService,
    pub carrier_webhooks: CarrierWebhookService,
    carrier: Arc<dyn CarrierClient>,
    cart: Arc<dyn CartClient>,
}

impl AppState {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: Arc<config::AppConfig>,
        carrier: Arc<dyn CarrierClient>,
        cart: Arc<dyn CartClient>,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        let inventory = InventoryService::new(db.clone(), event_sender.clone());
        let tracking = OrderTrackingService::new(db.clone());
        let orders = OrderService::new(
            db.clone(),
            config.clone(),
            inventory.clone(),
            tracking.clone(),
            carrier.clone(),
            event_sender.clone(),
        );
        let payments = PaymentService::new(db.clone());
        let pending_orders = PendingOrderService::new(
            db.clone(),
            config.clone(),
            orders.clone(),
            payments.clone(),
            event_sender.clone(),
        );
        let carrier_webhooks =
            CarrierWebhookService::new(db.clone(), orders.clone(), tracking.clone());

        Self {
            db,
            config,
            event_sender,
            inventory,
            tracking,
            orders,
            payments,
            pending_orders,
            carrier_webhooks,
            carrier,
            cart,
        }
    }

    /// Builds the outbox worker over the same collaborators.
    pub fn outbox_worker(&self) -> OutboxWorker {
        OutboxWorker::new(self.db.clone(), self.carrier.clone(), self.cart.clone())
    }

    /// Spawns the outbox worker with the configured polling interval.
    pub fn start_outbox_worker(&self) -> tokio::task::JoinHandle<()> {
        self.outbox_worker()
            .start(Duration::from_millis(self.config.outbox_poll_interval_ms))
    }
}
