//! Multi-granularity stock ledger.
//!
//! Stock is tracked per fulfillment branch at up to three nesting levels:
//! product, variant, and variant-combination. The deepest level present for
//! an item is the authoritative leaf; parents are recomputed bottom-up from
//! their children after every leaf mutation. Leaf update and parent
//! recomputes share one transaction per item.

use std::sync::Arc;

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde_json::Value;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::entities::{inventory_level, order_item, product_variant};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

/// Normalized ledger placement of one order line. Built once at the
/// boundary from the item columns and its free-form option payload; every
/// downstream ledger step depends only on this struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemPlacement {
    pub branch_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub combination_id: Option<Uuid>,
}

impl ItemPlacement {
    /// Resolves the acting branch (explicit order branch, else an
    /// option-embedded override, else the supplied default) and the
    /// variant/combination selection (item columns first, then the legacy
    /// option shapes).
    pub fn resolve(
        item: &order_item::Model,
        order_branch: Option<Uuid>,
        default_branch: Uuid,
    ) -> Self {
        let branch_id = order_branch
            .or_else(|| option_id(&item.options, "branch_id"))
            .unwrap_or(default_branch);
        let variant_id = item
            .variant_id
            .or_else(|| option_id(&item.options, "variant_id"));
        let combination_id = item
            .combination_id
            .or_else(|| option_id(&item.options, "combination_id"));
        Self {
            branch_id,
            variant_id,
            combination_id,
        }
    }
}

/// Probes the legacy option shapes for an id: top-level key, nested under
/// `selected_options`, then a deep scan of the whole payload.
fn option_id(options: &Value, key: &str) -> Option<Uuid> {
    if let Some(found) = parse_uuid(options.get(key)) {
        return Some(found);
    }
    if let Some(found) = parse_uuid(options.get("selected_options").and_then(|v| v.get(key))) {
        return Some(found);
    }
    deep_scan(options, key)
}

fn parse_uuid(value: Option<&Value>) -> Option<Uuid> {
    value.and_then(Value::as_str).and_then(|s| Uuid::parse_str(s).ok())
}

fn deep_scan(value: &Value, key: &str) -> Option<Uuid> {
    match value {
        Value::Object(map) => {
            if let Some(found) = parse_uuid(map.get(key)) {
                return Some(found);
            }
            map.values().find_map(|v| deep_scan(v, key))
        }
        Value::Array(items) => items.iter().find_map(|v| deep_scan(v, key)),
        _ => None,
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StockDirection {
    Decrement,
    Restore,
}

impl StockDirection {
    /// Decrements clamp at zero; restores are additive by construction and
    /// never clamp.
    pub fn apply(&self, current: i32, quantity: i32) -> i32 {
        match self {
            StockDirection::Decrement => (current - quantity).max(0),
            StockDirection::Restore => current + quantity,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdjustmentFailure {
    pub product_id: Uuid,
    pub reason: String,
}

/// Outcome of a best-effort pass over an order's items. Failures are
/// recorded, never raised: inventory adjustment must not block the order
/// mutation it accompanies.
#[derive(Debug, Clone, Default)]
pub struct AdjustmentReport {
    pub applied: usize,
    pub failures: Vec<AdjustmentFailure>,
}

impl AdjustmentReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Service owning the stock ledger.
#[derive(Clone)]
pub struct InventoryService {
    db: Arc<DatabaseConnection>,
    event_sender: Option<Arc<EventSender>>,
}

impl InventoryService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Option<Arc<EventSender>>) -> Self {
        Self { db, event_sender }
    }

    /// Adjusts stock for every item of an order. Each item runs inside its
    /// own error boundary; a failure on one item is recorded and skipped.
    #[instrument(skip(self, items), fields(item_count = items.len(), ?direction))]
    pub async fn adjust_for_items(
        &self,
        items: &[order_item::Model],
        order_branch: Option<Uuid>,
        default_branch: Uuid,
        direction: StockDirection,
    ) -> AdjustmentReport {
        let mut report = AdjustmentReport::default();
        for item in items {
            let placement = ItemPlacement::resolve(item, order_branch, default_branch);
            match self.adjust_item(item, &placement, direction).await {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    warn!(
                        product_id = %item.product_id,
                        branch_id = %placement.branch_id,
                        error = %e,
                        "inventory adjustment skipped for item"
                    );
                    report.failures.push(AdjustmentFailure {
                        product_id: item.product_id,
                        reason: e.to_string(),
                    });
                }
            }
        }
        report
    }

    /// Adjusts one item's leaf and recomputes its rollups atomically.
    async fn adjust_item(
        &self,
        item: &order_item::Model,
        placement: &ItemPlacement,
        direction: StockDirection,
    ) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;

        let (old_quantity, new_quantity) = match (placement.combination_id, placement.variant_id) {
            (Some(combination_id), Some(variant_id)) => {
                self.adjust_combination_leaf(
                    &txn,
                    item,
                    placement.branch_id,
                    variant_id,
                    combination_id,
                    direction,
                )
                .await?
            }
            (Some(combination_id), None) => {
                return Err(ServiceError::InventoryError(format!(
                    "combination {combination_id} selected without a variant for product {}",
                    item.product_id
                )));
            }
            (None, Some(variant_id)) => {
                self.adjust_variant_leaf(&txn, item, placement.branch_id, variant_id, direction)
                    .await?
            }
            (None, None) => {
                self.adjust_product_leaf(&txn, item, placement.branch_id, direction)
                    .await?
            }
        };

        txn.commit().await?;

        if let Some(event_sender) = &self.event_sender {
            let event = Event::InventoryAdjusted {
                product_id: item.product_id,
                branch_id: placement.branch_id,
                old_quantity,
                new_quantity,
            };
            if let Err(e) = event_sender.send(event).await {
                warn!(error = %e, product_id = %item.product_id, "failed to send inventory adjusted event");
            }
        }
        Ok(())
    }

    /// Combination is the leaf: write it, then recompute the parent variant
    /// and the branch-level product total.
    async fn adjust_combination_leaf(
        &self,
        txn: &impl ConnectionTrait,
        item: &order_item::Model,
        branch_id: Uuid,
        variant_id: Uuid,
        combination_id: Uuid,
        direction: StockDirection,
    ) -> Result<(i32, i32), ServiceError> {
        let leaf = find_level(
            txn,
            item.product_id,
            branch_id,
            Some(variant_id),
            Some(combination_id),
        )
        .await?
        .ok_or_else(|| {
            ServiceError::NotFound(format!(
                "No inventory record for product {} combination {combination_id} at branch {branch_id}",
                item.product_id
            ))
        })?;

        let old_quantity = leaf.quantity;
        let new_quantity = direction.apply(old_quantity, item.quantity);
        write_quantity(txn, leaf, new_quantity).await?;

        let variant_total =
            rollup_variant(txn, item.product_id, branch_id, variant_id).await?;
        upsert_level(
            txn,
            item.product_id,
            branch_id,
            Some(variant_id),
            None,
            variant_total,
        )
        .await?;

        let branch_total = rollup_branch(txn, item.product_id, branch_id).await?;
        upsert_level(txn, item.product_id, branch_id, None, None, branch_total).await?;

        Ok((old_quantity, new_quantity))
    }

    /// Variant is the leaf: write it, then recompute the branch total.
    async fn adjust_variant_leaf(
        &self,
        txn: &impl ConnectionTrait,
        item: &order_item::Model,
        branch_id: Uuid,
        variant_id: Uuid,
        direction: StockDirection,
    ) -> Result<(i32, i32), ServiceError> {
        let leaf = find_level(txn, item.product_id, branch_id, Some(variant_id), None)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "No inventory record for product {} variant {variant_id} at branch {branch_id}",
                    item.product_id
                ))
            })?;

        let old_quantity = leaf.quantity;
        let new_quantity = direction.apply(old_quantity, item.quantity);
        write_quantity(txn, leaf, new_quantity).await?;

        let branch_total = rollup_branch(txn, item.product_id, branch_id).await?;
        upsert_level(txn, item.product_id, branch_id, None, None, branch_total).await?;

        Ok((old_quantity, new_quantity))
    }

    /// No variant selected: mutate the branch-level row directly, except
    /// when the product declares no variants yet stray variant-level rows
    /// exist for the branch. Legacy catalogs carry such rows; the first one
    /// is then treated as the leaf and its rollup replaces the direct
    /// update.
    async fn adjust_product_leaf(
        &self,
        txn: &impl ConnectionTrait,
        item: &order_item::Model,
        branch_id: Uuid,
        direction: StockDirection,
    ) -> Result<(i32, i32), ServiceError> {
        let declared_variants = product_variant::Entity::find()
            .filter(product_variant::Column::ProductId.eq(item.product_id))
            .count(txn)
            .await?;

        if declared_variants == 0 {
            let stray = inventory_level::Entity::find()
                .filter(inventory_level::Column::ProductId.eq(item.product_id))
                .filter(inventory_level::Column::BranchId.eq(branch_id))
                .filter(inventory_level::Column::VariantId.is_not_null())
                .filter(inventory_level::Column::CombinationId.is_null())
                .order_by_asc(inventory_level::Column::Id)
                .one(txn)
                .await?;

            if let Some(stray_leaf) = stray {
                let old_quantity = stray_leaf.quantity;
                let new_quantity = direction.apply(old_quantity, item.quantity);
                write_quantity(txn, stray_leaf, new_quantity).await?;

                let branch_total = rollup_branch(txn, item.product_id, branch_id).await?;
                upsert_level(txn, item.product_id, branch_id, None, None, branch_total).await?;

                return Ok((old_quantity, new_quantity));
            }
        }

        let leaf = find_level(txn, item.product_id, branch_id, None, None)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "No inventory record for product {} at branch {branch_id}",
                    item.product_id
                ))
            })?;

        let old_quantity = leaf.quantity;
        let new_quantity = direction.apply(old_quantity, item.quantity);
        write_quantity(txn, leaf, new_quantity).await?;

        Ok((old_quantity, new_quantity))
    }

    /// All ledger rows for a product, deepest first.
    pub async fn get_levels_for_product(
        &self,
        product_id: Uuid,
    ) -> Result<Vec<inventory_level::Model>, ServiceError> {
        let levels = inventory_level::Entity::find()
            .filter(inventory_level::Column::ProductId.eq(product_id))
            .order_by_asc(inventory_level::Column::BranchId)
            .all(&*self.db)
            .await?;
        Ok(levels)
    }

    /// Directly sets one ledger row, creating it when absent. Intended for
    /// stock intake and operational corrections, not order flow.
    pub async fn set_level(
        &self,
        product_id: Uuid,
        branch_id: Uuid,
        variant_id: Option<Uuid>,
        combination_id: Option<Uuid>,
        quantity: i32,
    ) -> Result<inventory_level::Model, ServiceError> {
        upsert_level(
            &*self.db,
            product_id,
            branch_id,
            variant_id,
            combination_id,
            quantity,
        )
        .await
    }
}

/// Finds the unique ledger row for a placement, treating `None` ids as SQL
/// NULL.
async fn find_level(
    conn: &impl ConnectionTrait,
    product_id: Uuid,
    branch_id: Uuid,
    variant_id: Option<Uuid>,
    combination_id: Option<Uuid>,
) -> Result<Option<inventory_level::Model>, ServiceError> {
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
    let level = query.one(conn).await?;
    Ok(level)
}

async fn write_quantity(
    conn: &impl ConnectionTrait,
    level: inventory_level::Model,
    quantity: i32,
) -> Result<inventory_level::Model, ServiceError> {
    let mut active: inventory_level::ActiveModel = level.into();
    active.quantity = Set(quantity);
    active.updated_at = Set(Utc::now());
    let updated = active.update(conn).await?;
    Ok(updated)
}

async fn upsert_level(
    conn: &impl ConnectionTrait,
    product_id: Uuid,
    branch_id: Uuid,
    variant_id: Option<Uuid>,
    combination_id: Option<Uuid>,
    quantity: i32,
) -> Result<inventory_level::Model, ServiceError> {
    match find_level(conn, product_id, branch_id, variant_id, combination_id).await? {
        Some(existing) => write_quantity(conn, existing, quantity).await,
        None => {
            let level = inventory_level::ActiveModel {
                id: Set(Uuid::new_v4()),
                product_id: Set(product_id),
                branch_id: Set(branch_id),
                variant_id: Set(variant_id),
                combination_id: Set(combination_id),
                quantity: Set(quantity),
                updated_at: Set(Utc::now()),
            };
            let inserted = level.insert(conn).await?;
            Ok(inserted)
        }
    }
}

/// Sum of all combination rows under `(product, branch, variant)`.
async fn rollup_variant(
    conn: &impl ConnectionTrait,
    product_id: Uuid,
    branch_id: Uuid,
    variant_id: Uuid,
) -> Result<i32, ServiceError> {
    let combinations = inventory_level::Entity::find()
        .filter(inventory_level::Column::ProductId.eq(product_id))
        .filter(inventory_level::Column::BranchId.eq(branch_id))
        .filter(inventory_level::Column::VariantId.eq(variant_id))
        .filter(inventory_level::Column::CombinationId.is_not_null())
        .all(conn)
        .await?;
    Ok(combinations.iter().map(|l| l.quantity).sum())
}

/// Sum of all variant rows under `(product, branch)`.
async fn rollup_branch(
    conn: &impl ConnectionTrait,
    product_id: Uuid,
    branch_id: Uuid,
) -> Result<i32, ServiceError> {
    let variants = inventory_level::Entity::find()
        .filter(inventory_level::Column::ProductId.eq(product_id))
        .filter(inventory_level::Column::BranchId.eq(branch_id))
        .filter(inventory_level::Column::VariantId.is_not_null())
        .filter(inventory_level::Column::CombinationId.is_null())
        .all(conn)
        .await?;
    Ok(variants.iter().map(|l| l.quantity).sum())
}
