//! Shared test harness: an in-memory SQLite-backed application state with
//! recording stand-ins for the carrier and cart collaborators.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectOptions, ConnectionTrait, Database, DatabaseConnection,
    EntityTrait, QueryFilter, Schema, Set,
};
use uuid::Uuid;

use orderflow::clients::carrier::{
    CarrierClient, CarrierSyncResult, ShipmentInfo, ShipmentRequest,
};
use orderflow::clients::cart::CartClient;
use orderflow::config::AppConfig;
use orderflow::entities;
use orderflow::entities::order::ShippingAddress;
use orderflow::entities::{inventory_level, product, product_variant, voucher};
use orderflow::errors::ServiceError;
use orderflow::services::orders::{CreateOrderItemRequest, CreateOrderRequest};
use orderflow::AppState;

/// Recording carrier double. Toggle the flags to simulate failures.
pub struct StubCarrier {
    pub created: Mutex<Vec<ShipmentRequest>>,
    pub cancellations: Mutex<Vec<(String, String)>>,
    pub returns: Mutex<Vec<(String, String)>>,
    pub fail_create: AtomicBool,
    pub zero_collection: AtomicBool,
    counter: AtomicU32,
}

impl StubCarrier {
    pub fn new() -> Self {
        Self {
            created: Mutex::new(Vec::new()),
            cancellations: Mutex::new(Vec::new()),
            returns: Mutex::new(Vec::new()),
            fail_create: AtomicBool::new(false),
            zero_collection: AtomicBool::new(false),
            counter: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl CarrierClient for StubCarrier {
    async fn create_shipment(
        &self,
        request: ShipmentRequest,
    ) -> Result<ShipmentInfo, ServiceError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ServiceError::ExternalServiceError(
                "carrier unavailable".to_string(),
            ));
        }
        let seq = self.counter.fetch_add(1, Ordering::SeqCst);
        let money_collection = if self.zero_collection.load(Ordering::SeqCst) {
            Decimal::ZERO
        } else {
            request.cod_amount
        };
        self.created.lock().unwrap().push(request);
        Ok(ShipmentInfo {
            tracking_code: format!("VTP9000{seq:02}"),
            fee: None,
            money_collection,
        })
    }

    async fn get_shipment_info(&self, tracking_code: &str) -> Result<ShipmentInfo, ServiceError> {
        Ok(ShipmentInfo {
            tracking_code: tracking_code.to_string(),
            fee: None,
            money_collection: Decimal::ZERO,
        })
    }

    async fn request_cancellation(
        &self,
        tracking_code: &str,
        reason: &str,
    ) -> Result<CarrierSyncResult, ServiceError> {
        self.cancellations
            .lock()
            .unwrap()
            .push((tracking_code.to_string(), reason.to_string()));
        Ok(CarrierSyncResult {
            status: 200,
            error: None,
        })
    }

    async fn request_return(
        &self,
        tracking_code: &str,
        reason: &str,
    ) -> Result<CarrierSyncResult, ServiceError> {
        self.returns
            .lock()
            .unwrap()
            .push((tracking_code.to_string(), reason.to_string()));
        Ok(CarrierSyncResult {
            status: 200,
            error: None,
        })
    }

    async fn resend_webhook<'a>(
        &self,
        _tracking_code: &str,
        _reason: Option<&'a str>,
    ) -> Result<(), ServiceError> {
        Ok(())
    }
}

pub struct StubCart {
    pub cleared: Mutex<Vec<Uuid>>,
}

impl StubCart {
    pub fn new() -> Self {
        Self {
            cleared: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl CartClient for StubCart {
    async fn clear_cart(&self, user_id: Uuid) -> Result<(), ServiceError> {
        self.cleared.lock().unwrap().push(user_id);
        Ok(())
    }
}

/// Application state over a fresh in-memory SQLite database.
pub struct TestApp {
    pub state: AppState,
    pub carrier: Arc<StubCarrier>,
    pub cart: Arc<StubCart>,
    pub branch_id: Uuid,
    pub user_id: Uuid,
}

impl TestApp {
    pub async fn new() -> Self {
        let mut options = ConnectOptions::new("sqlite::memory:");
        // A single connection keeps every query on the same in-memory
        // database.
        options.max_connections(1).min_connections(1);
        let db = Database::connect(options)
            .await
            .expect("failed to open in-memory database");
        create_schema(&db).await;

        let branch_id = Uuid::new_v4();
        let config = AppConfig::new("sqlite::memory:", branch_id);
        let carrier = Arc::new(StubCarrier::new());
        let cart = Arc::new(StubCart::new());
        let state = AppState::new(
            Arc::new(db),
            Arc::new(config),
            carrier.clone(),
            cart.clone(),
            None,
        );

        Self {
            state,
            carrier,
            cart,
            branch_id,
            user_id: Uuid::new_v4(),
        }
    }

    pub async fn seed_product(&self, name: &str, weight_grams: Option<i32>) -> product::Model {
        let now = Utc::now();
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            sku: Set(format!("SKU-{name}")),
            weight_grams: Set(weight_grams),
            sold_count: Set(0),
            created_at: Set(now),
            updated_at: Set(None),
        }
        .insert(&*self.state.db)
        .await
        .expect("failed to seed product")
    }

    pub async fn declare_variant(&self, product_id: Uuid, name: &str) -> product_variant::Model {
        product_variant::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_id: Set(product_id),
            name: Set(name.to_string()),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.state.db)
        .await
        .expect("failed to declare variant")
    }

    pub async fn seed_voucher(&self, discount: Decimal) -> voucher::Model {
        voucher::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set("WELCOME".to_string()),
            discount_amount: Set(discount),
            consumed: Set(false),
            consumed_at: Set(None),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.state.db)
        .await
        .expect("failed to seed voucher")
    }

    pub async fn set_stock(
        &self,
        product_id: Uuid,
        variant_id: Option<Uuid>,
        combination_id: Option<Uuid>,
        quantity: i32,
    ) {
        self.set_stock_at(product_id, self.branch_id, variant_id, combination_id, quantity)
            .await;
    }

    pub async fn set_stock_at(
        &self,
        product_id: Uuid,
        branch_id: Uuid,
        variant_id: Option<Uuid>,
        combination_id: Option<Uuid>,
        quantity: i32,
    ) {
        self.state
            .inventory
            .set_level(product_id, branch_id, variant_id, combination_id, quantity)
            .await
            .expect("failed to set stock level");
    }

    /// Reads one ledger row's quantity; `None` when the row does not exist.
    pub async fn stock(
        &self,
        product_id: Uuid,
        variant_id: Option<Uuid>,
        combination_id: Option<Uuid>,
    ) -> Option<i32> {
        self.stock_at(product_id, self.branch_id, variant_id, combination_id)
            .await
    }

    pub async fn stock_at(
        &self,
        product_id: Uuid,
        branch_id: Uuid,
        variant_id: Option<Uuid>,
        combination_id: Option<Uuid>,
    ) -> Option<i32> {
        let mut query = inventory_level::Entity::find()
            .filter(inventory_level::Column::ProductId.eq(product_id))
            .filter(inventory_level::Column::BranchId.eq(branch_id));
        query = match variant_id {
            Some(v) => query.filter(inventory_level::Column::VariantId.eq(v)),
            None => query.filter(inventory_level::Column::VariantId.is_null()),
        };
        query = match combination_id {
            Some(c) => query.filter(inventory_level::Column::CombinationId.eq(c)),
            None => query.filter(inventory_level::Column::CombinationId.is_null()),
        };
        query
            .one(&*self.state.db)
            .await
            .expect("failed to read stock level")
            .map(|l| l.quantity)
    }

    pub fn order_request(
        &self,
        product_id: Uuid,
        quantity: i32,
        unit_price: Decimal,
    ) -> CreateOrderRequest {
        let line_total = unit_price * Decimal::from(quantity);
        CreateOrderRequest {
            items: vec![CreateOrderItemRequest {
                product_id,
                variant_id: None,
                combination_id: None,
                quantity,
                unit_price,
                options: serde_json::json!({}),
            }],
            shipping_address: ShippingAddress {
                name: "Binh Tran".to_string(),
                phone: "0912345678".to_string(),
                street: "12 Hang Bac".to_string(),
                province_code: Some("01".to_string()),
                district_code: Some("001".to_string()),
                ward_code: Some("00001".to_string()),
            },
            payment_method: orderflow::entities::order::PaymentMethod::Card,
            branch_id: None,
            voucher_id: None,
            subtotal: line_total,
            tax_amount: Decimal::ZERO,
            shipping_fee: Decimal::ZERO,
            total_amount: line_total,
            voucher_discount: Decimal::ZERO,
        }
    }

    /// Runs one outbox drain pass; returns the number of attempted tasks.
    pub async fn drain_outbox(&self) -> usize {
        self.state
            .outbox_worker()
            .drain_once(50)
            .await
            .expect("outbox drain failed")
    }
}

async fn create_schema(db: &DatabaseConnection) {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);
    let statements = vec![
        schema.create_table_from_entity(entities::Order),
        schema.create_table_from_entity(entities::OrderItem),
        schema.create_table_from_entity(entities::OrderTracking),
        schema.create_table_from_entity(entities::Product),
        schema.create_table_from_entity(entities::ProductVariant),
        schema.create_table_from_entity(entities::InventoryLevel),
        schema.create_table_from_entity(entities::Voucher),
        schema.create_table_from_entity(entities::Payment),
        schema.create_table_from_entity(entities::PendingOrder),
        schema.create_table_from_entity(entities::OutboxTask),
    ];
    for statement in statements {
        db.execute(backend.build(&statement))
            .await
            .expect("failed to create table");
    }
}
