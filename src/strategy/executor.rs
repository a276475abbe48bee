//! Multi-leg order execution with compensation.
//!
//! All legs of a trade are placed concurrently and jointly awaited. Any
//! quantity filled on one leg but not hedged by the other is flattened at
//! once with a market order on the over-filled leg.
//!
//! A leg still resting after its cancel window is reported as failed with
//! its last known fill. Fills that land later arrive through the venue
//! event stream and are reconciled by the ledger.

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::analyzer::ArbitrageOpportunity;
use crate::config::ExecutionConfig;
use crate::error::{EngineError, ExchangeError};
use crate::events::{EngineEvent, EventBus};
use crate::exchange::{ExchangeManager, ExchangeRole, OrderResult, OrderSide, OrderSpec, Symbol};
use crate::risk::PositionLedger;
use crate::utils::decimal::{pct_to_fraction, safe_div};

/// Pause between cancel attempts on a leg that is still open.
const CANCEL_RETRY_MS: u64 = 20;

/// Outcome of one placed leg.
#[derive(Debug, Clone, Serialize)]
pub struct LegOutcome {
    pub spec: OrderSpec,
    pub result: Option<OrderResult>,
    pub error: Option<String>,
}

impl LegOutcome {
    pub fn filled_qty(&self) -> Decimal {
        self.result
            .as_ref()
            .map(|r| r.filled_qty)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn fill_ratio(&self) -> Decimal {
        safe_div(self.filled_qty(), self.spec.quantity)
    }
}

/// Corrective order for unhedged quantity.
#[derive(Debug, Clone, Serialize)]
pub struct Compensation {
    pub role: ExchangeRole,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub result: Option<OrderResult>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub legs: Vec<LegOutcome>,
    pub compensations: Vec<Compensation>,
    /// Quantity held on every leg after compensation
    pub hedged_qty: Decimal,
    pub success: bool,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionReport {
    pub fn latency_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }

    /// Fold a follow-up execution into this one. `hedged_qty` stays ours.
    fn merge(mut self, other: ExecutionReport) -> Self {
        self.legs.extend(other.legs);
        self.compensations.extend(other.compensations);
        self.success &= other.success;
        self.error = match (self.error.take(), other.error) {
            (Some(a), Some(b)) => Some(format!("{a}; {b}")),
            (a, b) => a.or(b),
        };
        self.finished_at = other.finished_at;
        self
    }
}

/// How partial fills across legs are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegMode {
    /// Legs hedge each other; excess fills are compensated.
    Hedged,
    /// Legs are independent (rebalance, residual close); nothing is compensated.
    Independent,
}

pub struct ExecutionCoordinator {
    exchanges: Arc<ExchangeManager>,
    symbol: Symbol,
    config: ExecutionConfig,
    /// Limit price offset for entry/exit legs, in percent
    max_slippage_pct: Decimal,
}

impl ExecutionCoordinator {
    pub fn new(
        exchanges: Arc<ExchangeManager>,
        symbol: Symbol,
        config: ExecutionConfig,
        max_slippage_pct: Decimal,
    ) -> Self {
        Self {
            exchanges,
            symbol,
            config,
            max_slippage_pct,
        }
    }

    /// Marketable limit legs for `opportunity` at `quantity`.
    pub fn build_legs(&self, opportunity: &ArbitrageOpportunity, quantity: Decimal) -> Vec<OrderSpec> {
        let offset = pct_to_fraction(self.max_slippage_pct);
        vec![
            OrderSpec::limit(
                opportunity.buy_role,
                OrderSide::Buy,
                quantity,
                (opportunity.buy_price * (Decimal::ONE + offset)).round_dp(8),
            ),
            OrderSpec::limit(
                opportunity.sell_role,
                OrderSide::Sell,
                quantity,
                (opportunity.sell_price * (Decimal::ONE - offset)).round_dp(8),
            ),
        ]
    }

    /// Execute both legs of `opportunity` concurrently.
    pub async fn execute_opportunity(
        &self,
        opportunity: &ArbitrageOpportunity,
        quantity: Decimal,
        ledger: &mut PositionLedger,
        events: &EventBus,
    ) -> Result<ExecutionReport, EngineError> {
        let legs = self.build_legs(opportunity, quantity);
        let report = self.execute(legs, LegMode::Hedged, ledger, events).await?;

        for leg in &report.legs {
            let (Some(result), Some((_, expected))) = (&leg.result, opportunity.leg(leg.spec.role)) else {
                continue;
            };
            if result.filled_qty > Decimal::ZERO && !self.check_slippage(leg.spec.side, expected, result.avg_price) {
                warn!(
                    role = %leg.spec.role,
                    %expected,
                    actual = %result.avg_price,
                    "Fill slippage above tolerance"
                );
            }
        }
        Ok(report)
    }

    /// Whether an adverse price move from `expected` to `actual` is within tolerance.
    pub fn check_slippage(&self, side: OrderSide, expected: Decimal, actual: Decimal) -> bool {
        let adverse = match side {
            OrderSide::Buy => actual - expected,
            OrderSide::Sell => expected - actual,
        };
        safe_div(adverse, expected) * Decimal::ONE_HUNDRED <= self.max_slippage_pct
    }

    /// Place `legs` concurrently, reconcile fills into `ledger`, and
    /// compensate any unhedged quantity when `mode` is `Hedged`.
    ///
    /// Returns `Err` only for fatal conditions (invariant violation, failed
    /// compensation). Leg failures are reported in the returned report.
    pub async fn execute(
        &self,
        legs: Vec<OrderSpec>,
        mode: LegMode,
        ledger: &mut PositionLedger,
        events: &EventBus,
    ) -> Result<ExecutionReport, EngineError> {
        let started_at = Utc::now();
        info!(legs = legs.len(), mode = ?mode, symbol = %self.symbol, "Placing legs");

        let results = join_all(legs.iter().map(|spec| self.place_leg(spec))).await;

        let mut outcomes = Vec::with_capacity(legs.len());
        for (spec, result) in legs.into_iter().zip(results) {
            let outcome = match result {
                Ok((order, error)) => {
                    ledger.apply_result(&order)?;
                    LegOutcome {
                        spec,
                        result: Some(order),
                        error,
                    }
                }
                Err(e) => {
                    warn!(role = %spec.role, side = ?spec.side, error = %e, "Leg failed");
                    LegOutcome {
                        spec,
                        result: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            outcomes.push(outcome);
        }

        let all_filled = outcomes
            .iter()
            .all(|o| o.error.is_none() && o.fill_ratio() >= self.config.min_fill_ratio);
        let hedged_qty = outcomes
            .iter()
            .map(|o| o.filled_qty())
            .min()
            .unwrap_or(Decimal::ZERO);

        let mut report = ExecutionReport {
            legs: outcomes,
            compensations: Vec::new(),
            hedged_qty,
            success: all_filled,
            error: None,
            started_at,
            finished_at: Utc::now(),
        };

        if all_filled {
            info!(%hedged_qty, latency_ms = report.latency_ms(), "All legs filled");
            return Ok(report);
        }

        report.error = Some(
            report
                .legs
                .iter()
                .filter(|o| o.error.is_some() || o.fill_ratio() < self.config.min_fill_ratio)
                .map(|o| {
                    format!(
                        "{} {:?} filled {}/{}{}",
                        o.spec.role,
                        o.spec.side,
                        o.filled_qty(),
                        o.spec.quantity,
                        o.error.as_ref().map(|e| format!(" ({e})")).unwrap_or_default()
                    )
                })
                .collect::<Vec<_>>()
                .join("; "),
        );

        if mode == LegMode::Hedged && report.legs.len() > 1 {
            let excess: Vec<(ExchangeRole, OrderSide, Decimal)> = report
                .legs
                .iter()
                .filter(|o| o.filled_qty() > hedged_qty)
                .map(|o| (o.spec.role, o.spec.side.opposite(), o.filled_qty() - hedged_qty))
                .collect();

            for (role, side, quantity) in excess {
                let compensation = self.compensate(role, side, quantity, ledger, events).await?;
                report.compensations.push(compensation);
            }
        }

        report.finished_at = Utc::now();
        warn!(
            error = report.error.as_deref().unwrap_or(""),
            %hedged_qty,
            compensations = report.compensations.len(),
            "Execution incomplete"
        );
        Ok(report)
    }

    /// Market orders that bring both legs to zero.
    ///
    /// The matched quantity is closed as a hedged pair, so a one-sided
    /// close is compensated back and the position stays delta neutral. Any
    /// residual delta is then closed on its own leg.
    pub async fn flatten(
        &self,
        ledger: &mut PositionLedger,
        events: &EventBus,
    ) -> Result<Option<ExecutionReport>, EngineError> {
        let position = ledger.position().clone();
        if position.is_flat() {
            return Ok(None);
        }
        info!(long = %position.long_qty, hedge = %position.hedge_qty, "Flattening positions");

        let matched = position.long_qty.min(position.hedge_qty);
        let mut report = None;
        if matched > Decimal::ZERO {
            let legs = vec![
                OrderSpec::market(position.long_role, OrderSide::Sell, matched),
                OrderSpec::market(position.hedge_role, OrderSide::Buy, matched),
            ];
            report = Some(self.execute(legs, LegMode::Hedged, ledger, events).await?);
        }

        let delta = ledger.delta();
        let residual = if delta > Decimal::ZERO {
            OrderSpec::market(position.long_role, OrderSide::Sell, delta)
        } else if delta < Decimal::ZERO {
            OrderSpec::market(position.hedge_role, OrderSide::Buy, -delta)
        } else {
            return Ok(report);
        };
        info!(role = %residual.role, side = ?residual.side, quantity = %residual.quantity, "Closing residual delta");
        let single = self.execute(vec![residual], LegMode::Independent, ledger, events).await?;
        Ok(Some(match report {
            Some(pair) => pair.merge(single),
            None => single,
        }))
    }

    /// Place one leg. Anything left resting is canceled within the leg
    /// timeout; a leg that cannot be canceled comes back with its last
    /// known fill and an error.
    async fn place_leg(&self, spec: &OrderSpec) -> Result<(OrderResult, Option<String>), ExchangeError> {
        let timeout = Duration::from_millis(self.config.leg_timeout_ms);
        let deadline = Instant::now() + timeout;
        let result = match tokio::time::timeout(timeout, self.exchanges.place(spec.role, &self.symbol, spec)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ExchangeError::Timeout {
                    role: spec.role,
                    operation: "place_order",
                    elapsed_ms: self.config.leg_timeout_ms,
                })
            }
        };

        if !result.status.is_open() {
            return Ok((result, None));
        }

        let retry = Duration::from_millis(CANCEL_RETRY_MS);
        let reason = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let reason = match tokio::time::timeout(
                remaining,
                self.exchanges.cancel_order(spec.role, &self.symbol, &result.order_id),
            )
            .await
            {
                Ok(Ok(canceled)) => return Ok((canceled, None)),
                Ok(Err(e)) => e.to_string(),
                Err(_) => "cancel timed out".to_string(),
            };
            if Instant::now() + retry >= deadline {
                break reason;
            }
            warn!(role = %spec.role, order_id = %result.order_id, error = %reason, "Cancel failed, retrying");
            tokio::time::sleep(retry).await;
        };

        error!(
            role = %spec.role,
            order_id = %result.order_id,
            filled = %result.filled_qty,
            error = %reason,
            "Leg still open after cancel window"
        );
        let error = format!("order {} still open: {reason}", result.order_id);
        Ok((result, Some(error)))
    }

    async fn compensate(
        &self,
        role: ExchangeRole,
        side: OrderSide,
        quantity: Decimal,
        ledger: &mut PositionLedger,
        events: &EventBus,
    ) -> Result<Compensation, EngineError> {
        warn!(%role, side = ?side, %quantity, "Compensating unhedged quantity");
        let timeout = Duration::from_millis(self.config.compensation_timeout_ms);
        let placed = tokio::time::timeout(
            timeout,
            self.exchanges.place_market_order(role, &self.symbol, side, quantity),
        )
        .await
        .unwrap_or(Err(ExchangeError::Timeout {
            role,
            operation: "compensation",
            elapsed_ms: self.config.compensation_timeout_ms,
        }));

        let failure = match &placed {
            Ok(result) => {
                ledger.apply_result(result)?;
                if result.filled_qty < quantity {
                    Some(format!(
                        "{role} compensation filled {} of {quantity}",
                        result.filled_qty
                    ))
                } else {
                    None
                }
            }
            Err(e) => Some(format!("{role} compensation failed: {e}")),
        };

        events.emit(EngineEvent::CompensationIssued {
            role,
            side,
            quantity,
            success: failure.is_none(),
        });

        if let Some(reason) = failure {
            error!(%role, %quantity, %reason, "Compensation failed, position may be unhedged");
            return Err(EngineError::CompensationFailed(reason));
        }

        let (result, error) = match placed {
            Ok(result) => (Some(result), None),
            Err(e) => (None, Some(e.to_string())),
        };
        Ok(Compensation {
            role,
            side,
            quantity,
            result,
            error,
        })
    }
}
