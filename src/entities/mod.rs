pub mod inventory_level;
pub mod order;
pub mod order_item;
pub mod order_tracking;
pub mod outbox_task;
pub mod payment;
pub mod pending_order;
pub mod product;
pub mod product_variant;
pub mod voucher;

pub use inventory_level::Entity as InventoryLevel;
pub use order::Entity as Order;
pub use order_item::Entity as OrderItem;
pub use order_tracking::Entity as OrderTracking;
pub use outbox_task::Entity as OutboxTask;
pub use payment::Entity as Payment;
pub use pending_order::Entity as PendingOrder;
pub use product::Entity as Product;
pub use product_variant::Entity as ProductVariant;
pub use voucher::Entity as Voucher;
