//! Authoritative in-memory position record.
//!
//! Mutated only by confirmed fills. Each order's cumulative fill is
//! tracked so the same fill arriving from an `OrderResult` and from a push
//! update is applied exactly once.

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::error::EngineError;
use crate::exchange::{ExchangeRole, OrderId, OrderResult, OrderSide, OrderUpdate};
use crate::utils::decimal::{blend_price, safe_div};

/// Quantities held on the two legs. The hedge quantity is the short size.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionState {
    pub long_role: ExchangeRole,
    pub hedge_role: ExchangeRole,
    pub long_qty: Decimal,
    pub long_price: Decimal,
    pub hedge_qty: Decimal,
    pub hedge_price: Decimal,
}

impl PositionState {
    pub fn new(long_role: ExchangeRole, hedge_role: ExchangeRole) -> Self {
        Self {
            long_role,
            hedge_role,
            long_qty: Decimal::ZERO,
            long_price: Decimal::ZERO,
            hedge_qty: Decimal::ZERO,
            hedge_price: Decimal::ZERO,
        }
    }

    /// Net directional exposure in base units.
    pub fn delta(&self) -> Decimal {
        self.long_qty - self.hedge_qty
    }

    pub fn quantity(&self, role: ExchangeRole) -> Decimal {
        if role == self.long_role {
            self.long_qty
        } else if role == self.hedge_role {
            self.hedge_qty
        } else {
            Decimal::ZERO
        }
    }

    pub fn is_flat(&self) -> bool {
        self.long_qty == Decimal::ZERO && self.hedge_qty == Decimal::ZERO
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct FillProgress {
    filled_qty: Decimal,
    avg_price: Decimal,
    fee: Decimal,
}

/// Fill applied to a leg, after de-duplication.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AppliedFill {
    pub quantity: Decimal,
    pub price: Decimal,
    pub realized_pnl: Decimal,
}

#[derive(Debug, Clone)]
pub struct PositionLedger {
    position: PositionState,
    /// Keyed by role since order ids are only unique per venue
    orders: HashMap<(ExchangeRole, OrderId), FillProgress>,
    realized_pnl: Decimal,
    fees: Decimal,
}

impl PositionLedger {
    pub fn new(long_role: ExchangeRole, hedge_role: ExchangeRole) -> Self {
        Self {
            position: PositionState::new(long_role, hedge_role),
            orders: HashMap::new(),
            realized_pnl: Decimal::ZERO,
            fees: Decimal::ZERO,
        }
    }

    pub fn position(&self) -> &PositionState {
        &self.position
    }

    pub fn delta(&self) -> Decimal {
        self.position.delta()
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.realized_pnl
    }

    pub fn fees(&self) -> Decimal {
        self.fees
    }

    /// Realized PnL net of fees, in quote units.
    pub fn cumulative_pnl(&self) -> Decimal {
        self.realized_pnl - self.fees
    }

    /// Cumulative filled quantity recorded for an order.
    pub fn order_filled(&self, role: ExchangeRole, order_id: &OrderId) -> Decimal {
        self.orders
            .get(&(role, order_id.clone()))
            .map(|p| p.filled_qty)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn apply_result(&mut self, result: &OrderResult) -> Result<Option<AppliedFill>, EngineError> {
        self.apply_fill(
            result.role,
            result.side,
            &result.order_id,
            result.filled_qty,
            result.avg_price,
            result.fee,
        )
    }

    pub fn apply_update(
        &mut self,
        role: ExchangeRole,
        update: &OrderUpdate,
    ) -> Result<Option<AppliedFill>, EngineError> {
        self.apply_fill(
            role,
            update.side,
            &update.order_id,
            update.filled_qty,
            update.avg_price,
            update.fee,
        )
    }

    /// Apply an order's cumulative fill state. Only the increment over what
    /// was already recorded for the order moves the position.
    pub fn apply_fill(
        &mut self,
        role: ExchangeRole,
        side: OrderSide,
        order_id: &OrderId,
        cumulative_qty: Decimal,
        cumulative_avg_price: Decimal,
        cumulative_fee: Decimal,
    ) -> Result<Option<AppliedFill>, EngineError> {
        if role != self.position.long_role && role != self.position.hedge_role {
            return Err(EngineError::InvariantViolation(format!(
                "fill on unbound role {role} for order {order_id}"
            )));
        }
        if cumulative_qty < Decimal::ZERO {
            return Err(EngineError::InvariantViolation(format!(
                "negative fill quantity {cumulative_qty} for order {order_id}"
            )));
        }

        let key = (role, order_id.clone());
        let previous = self.orders.get(&key).copied().unwrap_or_default();
        let quantity = cumulative_qty - previous.filled_qty;
        if quantity <= Decimal::ZERO {
            debug!(%order_id, %cumulative_qty, "Fill already recorded");
            return Ok(None);
        }
        let price = safe_div(
            cumulative_avg_price * cumulative_qty - previous.avg_price * previous.filled_qty,
            quantity,
        );
        let fee = (cumulative_fee - previous.fee).max(Decimal::ZERO);

        let increases = if role == self.position.long_role {
            side == OrderSide::Buy
        } else {
            side == OrderSide::Sell
        };

        let (qty, avg) = if role == self.position.long_role {
            (&mut self.position.long_qty, &mut self.position.long_price)
        } else {
            (&mut self.position.hedge_qty, &mut self.position.hedge_price)
        };

        let realized_pnl = if increases {
            *avg = blend_price(*avg, *qty, price, quantity);
            *qty += quantity;
            Decimal::ZERO
        } else {
            if quantity > *qty {
                return Err(EngineError::InvariantViolation(format!(
                    "reducing {role} by {quantity} with only {} held",
                    *qty
                )));
            }
            // Long legs profit when sold above cost; short legs when bought back below entry.
            let pnl = if role == self.position.long_role {
                (price - *avg) * quantity
            } else {
                (*avg - price) * quantity
            };
            *qty -= quantity;
            if *qty == Decimal::ZERO {
                *avg = Decimal::ZERO;
            }
            pnl
        };

        self.orders.insert(
            key,
            FillProgress {
                filled_qty: cumulative_qty,
                avg_price: cumulative_avg_price,
                fee: cumulative_fee.max(previous.fee),
            },
        );
        self.realized_pnl += realized_pnl;
        self.fees += fee;

        info!(
            %role,
            side = ?side,
            %order_id,
            %quantity,
            %price,
            %realized_pnl,
            delta = %self.position.delta(),
            "Fill applied to ledger"
        );

        Ok(Some(AppliedFill {
            quantity,
            price,
            realized_pnl,
        }))
    }

    /// Clear positions after a full close. PnL and per-order fill progress
    /// are kept, so late updates for closed orders stay de-duplicated.
    pub fn reset(&mut self) {
        self.position = PositionState::new(self.position.long_role, self.position.hedge_role);
        info!(cumulative_pnl = %self.cumulative_pnl(), "Ledger positions reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ledger() -> PositionLedger {
        PositionLedger::new(ExchangeRole::Spot, ExchangeRole::Futures)
    }

    #[test]
    fn test_hedged_entry_is_delta_neutral() {
        let mut ledger = ledger();
        ledger
            .apply_fill(ExchangeRole::Spot, OrderSide::Buy, &"s1".into(), dec!(1), dec!(100), dec!(0.04))
            .unwrap();
        ledger
            .apply_fill(ExchangeRole::Futures, OrderSide::Sell, &"f1".into(), dec!(1), dec!(100.6), dec!(0.04))
            .unwrap();

        assert_eq!(ledger.position().long_qty, dec!(1));
        assert_eq!(ledger.position().hedge_qty, dec!(1));
        assert_eq!(ledger.delta(), Decimal::ZERO);
        assert_eq!(ledger.fees(), dec!(0.08));
    }

    #[test]
    fn test_weighted_average_price() {
        let mut ledger = ledger();
        ledger
            .apply_fill(ExchangeRole::Spot, OrderSide::Buy, &"a".into(), dec!(2), dec!(100), Decimal::ZERO)
            .unwrap();
        ledger
            .apply_fill(ExchangeRole::Spot, OrderSide::Buy, &"b".into(), dec!(1), dec!(130), Decimal::ZERO)
            .unwrap();
        assert_eq!(ledger.position().long_price, dec!(110));
    }

    #[test]
    fn test_duplicate_fill_applied_once() {
        let mut ledger = ledger();
        let id: OrderId = "s1".into();
        ledger
            .apply_fill(ExchangeRole::Spot, OrderSide::Buy, &id, dec!(0.5), dec!(100), Decimal::ZERO)
            .unwrap();
        // Push update for the same partial fill.
        assert!(ledger
            .apply_fill(ExchangeRole::Spot, OrderSide::Buy, &id, dec!(0.5), dec!(100), Decimal::ZERO)
            .unwrap()
            .is_none());
        // Later fill at 102 lifts the cumulative average to 101.
        let applied = ledger
            .apply_fill(ExchangeRole::Spot, OrderSide::Buy, &id, dec!(1), dec!(101), Decimal::ZERO)
            .unwrap()
            .unwrap();
        assert_eq!(applied.quantity, dec!(0.5));
        assert_eq!(applied.price, dec!(102));
        assert_eq!(ledger.position().long_qty, dec!(1));
    }

    #[test]
    fn test_reduction_realizes_pnl() {
        let mut ledger = ledger();
        ledger
            .apply_fill(ExchangeRole::Futures, OrderSide::Sell, &"f1".into(), dec!(2), dec!(101), Decimal::ZERO)
            .unwrap();
        ledger
            .apply_fill(ExchangeRole::Futures, OrderSide::Buy, &"f2".into(), dec!(1), dec!(100), dec!(0.1))
            .unwrap();

        assert_eq!(ledger.position().hedge_qty, dec!(1));
        assert_eq!(ledger.realized_pnl(), dec!(1));
        assert_eq!(ledger.cumulative_pnl(), dec!(0.9));
    }

    #[test]
    fn test_over_reduction_is_invariant_violation() {
        let mut ledger = ledger();
        let err = ledger
            .apply_fill(ExchangeRole::Spot, OrderSide::Sell, &"x".into(), dec!(1), dec!(100), Decimal::ZERO)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation(_)));
        assert!(err.is_fatal());
        assert!(ledger.position().is_flat());
    }

    #[test]
    fn test_unbound_role_rejected() {
        let mut ledger = ledger();
        assert!(ledger
            .apply_fill(ExchangeRole::Target, OrderSide::Buy, &"t".into(), dec!(1), dec!(100), Decimal::ZERO)
            .is_err());
    }

    #[test]
    fn test_reset_keeps_pnl() {
        let mut ledger = ledger();
        ledger
            .apply_fill(ExchangeRole::Spot, OrderSide::Buy, &"a".into(), dec!(1), dec!(100), Decimal::ZERO)
            .unwrap();
        ledger
            .apply_fill(ExchangeRole::Spot, OrderSide::Sell, &"b".into(), dec!(1), dec!(105), dec!(1))
            .unwrap();
        ledger.reset();
        assert!(ledger.position().is_flat());
        assert_eq!(ledger.cumulative_pnl(), dec!(4));

        // A late duplicate of a closed order changes nothing.
        let late = ledger
            .apply_fill(ExchangeRole::Spot, OrderSide::Sell, &"b".into(), dec!(1), dec!(105), dec!(1))
            .unwrap();
        assert!(late.is_none());
        assert!(ledger.position().is_flat());
        assert_eq!(ledger.order_filled(ExchangeRole::Spot, &"b".into()), dec!(1));
        assert_eq!(ledger.order_filled(ExchangeRole::Futures, &"b".into()), Decimal::ZERO);
    }
}
