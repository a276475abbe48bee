//! Hedge rebalancing logic to maintain delta neutrality.

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::executor::{ExecutionCoordinator, ExecutionReport, LegMode};
use crate::error::EngineError;
use crate::events::{EngineEvent, EventBus};
use crate::exchange::{ExchangeRole, OrderSide, OrderSpec};
use crate::risk::{PositionLedger, PositionState};
use crate::utils::decimal::safe_div;

/// Action to take for rebalancing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RebalanceAction {
    /// Delta within tolerance
    None,
    /// Single market order on one leg that brings delta to zero
    Adjust {
        role: ExchangeRole,
        side: OrderSide,
        quantity: Decimal,
        delta_before: Decimal,
        drift_pct: Decimal,
    },
}

/// Result of a rebalance operation.
#[derive(Debug, Clone, Serialize)]
pub struct RebalanceResult {
    pub action: RebalanceAction,
    pub report: Option<ExecutionReport>,
    pub new_delta: Decimal,
    pub success: bool,
}

/// Keeps |delta| within tolerance of the base position size.
#[derive(Debug, Clone)]
pub struct HedgeRebalancer {
    base_position_size: Decimal,
    /// Maximum |delta| / base_position_size, in percent
    tolerance_pct: Decimal,
}

impl HedgeRebalancer {
    pub fn new(base_position_size: Decimal, tolerance_pct: Decimal) -> Self {
        Self {
            base_position_size,
            tolerance_pct,
        }
    }

    /// |delta| as percent of the base position size.
    pub fn drift_pct(&self, position: &PositionState) -> Decimal {
        safe_div(position.delta().abs(), self.base_position_size) * Decimal::ONE_HUNDRED
    }

    pub fn within_tolerance(&self, position: &PositionState) -> bool {
        self.drift_pct(position) <= self.tolerance_pct
    }

    /// Corrective order for `position`. `target_qty` is the size both legs
    /// should hold; the leg farther from it is the one adjusted.
    pub fn analyze(&self, position: &PositionState, target_qty: Decimal) -> RebalanceAction {
        let delta = position.delta();
        let drift_pct = self.drift_pct(position);

        debug!(
            long = %position.long_qty,
            hedge = %position.hedge_qty,
            %delta,
            %drift_pct,
            "Analyzing position delta"
        );

        if drift_pct <= self.tolerance_pct {
            return RebalanceAction::None;
        }

        let long_off = (position.long_qty - target_qty).abs();
        let hedge_off = (position.hedge_qty - target_qty).abs();
        let role = if long_off >= hedge_off {
            position.long_role
        } else {
            position.hedge_role
        };
        // Selling shrinks an excess long or grows a short hedge; both lower delta.
        let side = if delta > Decimal::ZERO {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        };
        let quantity = delta.abs();

        RebalanceAction::Adjust {
            role,
            side,
            quantity,
            delta_before: delta,
            drift_pct,
        }
    }

    /// Analyze and, if needed, correct the ledger's delta through `executor`.
    pub async fn rebalance(
        &self,
        target_qty: Decimal,
        executor: &ExecutionCoordinator,
        ledger: &mut PositionLedger,
        events: &EventBus,
    ) -> Result<RebalanceResult, EngineError> {
        let action = self.analyze(ledger.position(), target_qty);
        let RebalanceAction::Adjust {
            role,
            side,
            quantity,
            delta_before,
            drift_pct,
        } = action.clone()
        else {
            return Ok(RebalanceResult {
                action,
                report: None,
                new_delta: ledger.delta(),
                success: true,
            });
        };

        info!(%role, side = ?side, %quantity, %delta_before, %drift_pct, "Rebalancing hedge");
        events.emit(EngineEvent::RebalanceIssued {
            role,
            side,
            quantity,
            delta_before,
        });

        let report = executor
            .execute(
                vec![OrderSpec::market(role, side, quantity)],
                LegMode::Independent,
                ledger,
                events,
            )
            .await?;

        let new_delta = ledger.delta();
        let success = self.within_tolerance(ledger.position());
        if !success {
            warn!(%new_delta, error = report.error.as_deref().unwrap_or(""), "Delta still out of tolerance after rebalance");
        }

        Ok(RebalanceResult {
            action,
            report: Some(report),
            new_delta,
            success,
        })
    }
}
