//! Classification of status transitions into stock ledger actions.
//!
//! The classification is a pure function of the `(previous, next)` pair and
//! is evaluated once per transition, before the order is persisted with its
//! new status. It does not care how the transition was triggered (admin
//! edit, customer cancel, carrier webhook).

use crate::entities::order::OrderStatus;

/// What a status transition means for the stock ledger.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StockAction {
    /// The order (re-)enters a stock-holding state: decrement.
    Decrement,
    /// The order leaves fulfillment with stock still held: restore.
    Restore,
    /// Nothing to reconcile.
    None,
}

/// Maps a status transition to the ledger action it requires.
///
/// An order holds stock while in `Pending/Confirmed/Processing/Shipping`.
/// Moving into that set from outside it decrements; leaving it (or leaving
/// `Delivered`) for `Cancelled`/`Returned` restores. A cancelled or
/// returned order reaching `Delivered` was already reconciled, so nothing
/// happens.
pub fn stock_action(previous: OrderStatus, next: OrderStatus) -> StockAction {
    let entering_hold = !previous.holds_stock() && next.holds_stock();
    if entering_hold {
        return StockAction::Decrement;
    }

    let leaving_with_stock = previous.holds_stock() || previous == OrderStatus::Delivered;
    if leaving_with_stock && matches!(next, OrderStatus::Cancelled | OrderStatus::Returned) {
        return StockAction::Restore;
    }

    StockAction::None
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::Iterable;

    use OrderStatus::*;

    /// The classification table, spelled out pair by pair.
    fn expected(previous: OrderStatus, next: OrderStatus) -> StockAction {
        let holding = [Pending, Confirmed, Processing, Shipping];
        let reconciled = [Cancelled, Returned];

        if reconciled.contains(&previous) && next == Delivered {
            StockAction::None
        } else if reconciled.contains(&previous) && holding.contains(&next) {
            StockAction::Decrement
        } else if previous == Delivered && holding.contains(&next) {
            StockAction::Decrement
        } else if holding.contains(&previous) && reconciled.contains(&next) {
            StockAction::Restore
        } else if previous == Delivered && reconciled.contains(&next) {
            StockAction::Restore
        } else {
            StockAction::None
        }
    }

    #[test]
    fn classification_matches_table_for_every_pair() {
        for previous in OrderStatus::iter() {
            for next in OrderStatus::iter() {
                assert_eq!(
                    stock_action(previous, next),
                    expected(previous, next),
                    "({previous} -> {next})"
                );
            }
        }
    }

    #[test]
    fn creation_state_decrements_from_nothing() {
        // An order is born Pending; creation decrements unconditionally, and
        // moving between holding states must not decrement again.
        assert_eq!(stock_action(Pending, Confirmed), StockAction::None);
        assert_eq!(stock_action(Confirmed, Shipping), StockAction::None);
        assert_eq!(stock_action(Processing, Shipping), StockAction::None);
    }

    #[test]
    fn cancel_and_return_restore_held_stock() {
        assert_eq!(stock_action(Pending, Cancelled), StockAction::Restore);
        assert_eq!(stock_action(Shipping, Cancelled), StockAction::Restore);
        assert_eq!(stock_action(Shipping, Returned), StockAction::Restore);
        assert_eq!(stock_action(Delivered, Returned), StockAction::Restore);
        assert_eq!(stock_action(Delivered, Cancelled), StockAction::Restore);
    }

    #[test]
    fn reactivating_a_cancelled_order_decrements_again() {
        assert_eq!(stock_action(Cancelled, Processing), StockAction::Decrement);
        assert_eq!(stock_action(Returned, Pending), StockAction::Decrement);
        assert_eq!(stock_action(Delivered, Shipping), StockAction::Decrement);
    }

    #[test]
    fn late_delivery_after_reconciliation_is_a_no_op() {
        assert_eq!(stock_action(Cancelled, Delivered), StockAction::None);
        assert_eq!(stock_action(Returned, Delivered), StockAction::None);
    }

    #[test]
    fn delivery_from_fulfillment_is_neutral() {
        assert_eq!(stock_action(Shipping, Delivered), StockAction::None);
        assert_eq!(stock_action(Pending, Delivered), StockAction::None);
        assert_eq!(stock_action(Cancelled, Returned), StockAction::None);
        assert_eq!(stock_action(Returned, Cancelled), StockAction::None);
    }
}
