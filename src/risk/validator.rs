//! Pre-trade risk validation.
//!
//! One entry point, fail-fast checks in a fixed order. Rejections are
//! values, not errors.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, warn};

use super::ledger::PositionState;
use super::mdd::DrawdownTracker;
use crate::config::RiskParameters;
use crate::exchange::{AccountKind, BalanceSnapshot, ExchangeRole, OrderSide, Symbol};
use crate::strategy::{ArbitrageOpportunity, OpenTrade};
use crate::utils::decimal::{pct_to_fraction, safe_div};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub reason: String,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self {
            valid: true,
            reason: String::new(),
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: reason.into(),
        }
    }
}

/// State the checks read. Balances must be freshly fetched.
pub struct ValidationContext<'a> {
    pub balances: &'a HashMap<ExchangeRole, BalanceSnapshot>,
    pub position: &'a PositionState,
    pub cumulative_pnl: Decimal,
    pub open_trades: &'a [OpenTrade],
    pub now: DateTime<Utc>,
}

pub struct RiskValidator {
    params: RiskParameters,
    symbol: Symbol,
    staleness: Duration,
    initial_equity: Decimal,
    drawdown: DrawdownTracker,
}

impl RiskValidator {
    pub fn new(
        params: RiskParameters,
        symbol: Symbol,
        staleness: Duration,
        initial_equity: Decimal,
    ) -> Self {
        let drawdown = DrawdownTracker::new(params.max_drawdown_pct, initial_equity);
        Self {
            params,
            symbol,
            staleness,
            initial_equity,
            drawdown,
        }
    }

    pub fn drawdown(&self) -> &DrawdownTracker {
        &self.drawdown
    }

    /// Check `opportunity` at `proposed_qty` against balances, limits, data
    /// freshness, drawdown and open-trade age, in that order.
    pub fn validate(
        &mut self,
        opportunity: &ArbitrageOpportunity,
        proposed_qty: Decimal,
        ctx: &ValidationContext<'_>,
    ) -> ValidationResult {
        let result = self.run_checks(opportunity, proposed_qty, ctx);
        if !result.valid {
            debug!(reason = %result.reason, qty = %proposed_qty, "Validation rejected");
        }
        result
    }

    fn run_checks(
        &mut self,
        opportunity: &ArbitrageOpportunity,
        proposed_qty: Decimal,
        ctx: &ValidationContext<'_>,
    ) -> ValidationResult {
        if proposed_qty <= Decimal::ZERO {
            return ValidationResult::reject("proposed quantity must be positive");
        }

        let legs = [
            (opportunity.buy_role, OrderSide::Buy, opportunity.buy_price),
            (opportunity.sell_role, OrderSide::Sell, opportunity.sell_price),
        ];

        // (a) balances
        for (role, side, price) in legs {
            let Some(balance) = ctx.balances.get(&role) else {
                return ValidationResult::reject(format!("no balance snapshot for {role}"));
            };
            if let Some(reason) = self.check_balance(role, side, price, proposed_qty, balance, ctx.position) {
                return ValidationResult::reject(reason);
            }
        }

        // (b) resulting position and leverage
        let mut long_qty = ctx.position.long_qty;
        let mut hedge_qty = ctx.position.hedge_qty;
        for (role, side, _) in legs {
            let signed = if increases(role, side, ctx.position) {
                proposed_qty
            } else {
                -proposed_qty
            };
            if role == ctx.position.long_role {
                long_qty += signed;
            } else if role == ctx.position.hedge_role {
                hedge_qty += signed;
            } else {
                return ValidationResult::reject(format!("{role} is not a leg of this strategy"));
            }
        }
        if long_qty < Decimal::ZERO || hedge_qty < Decimal::ZERO {
            return ValidationResult::reject(format!(
                "resulting position negative (long {long_qty}, hedge {hedge_qty})"
            ));
        }
        if long_qty > self.params.max_position_size || hedge_qty > self.params.max_position_size {
            return ValidationResult::reject(format!(
                "resulting position exceeds max_position_size {} (long {long_qty}, hedge {hedge_qty})",
                self.params.max_position_size
            ));
        }
        for (role, _, price) in legs {
            let Some(balance) = ctx.balances.get(&role) else {
                continue;
            };
            if balance.account != AccountKind::Margin {
                continue;
            }
            let resulting = if role == ctx.position.long_role { long_qty } else { hedge_qty };
            let collateral = balance
                .balances
                .get(&self.symbol.quote)
                .map(|b| b.free + b.locked)
                .unwrap_or(Decimal::ZERO);
            let leverage = safe_div(resulting * price, collateral);
            if resulting > Decimal::ZERO && (collateral == Decimal::ZERO || leverage > self.params.max_leverage) {
                return ValidationResult::reject(format!(
                    "{role} leverage {} exceeds max_leverage {}",
                    leverage.round_dp(2),
                    self.params.max_leverage
                ));
            }
        }

        // (c) freshness re-check
        for (label, quote_time) in [
            ("buy", opportunity.buy_quote_time),
            ("sell", opportunity.sell_quote_time),
        ] {
            if ctx.now - quote_time > self.staleness {
                return ValidationResult::reject(format!(
                    "{label} snapshot stale at validation ({}ms old)",
                    (ctx.now - quote_time).num_milliseconds()
                ));
            }
        }

        // (d) drawdown
        let equity = self.initial_equity + ctx.cumulative_pnl;
        if self.drawdown.update(equity) {
            return ValidationResult::reject(format!(
                "drawdown {}% at or above max_drawdown_pct {}%",
                self.drawdown.current_drawdown_pct().round_dp(2),
                self.params.max_drawdown_pct
            ));
        }
        let (near_limit, headroom_pct) = self.drawdown.warning_check();
        if near_limit {
            warn!(
                drawdown_pct = %self.drawdown.current_drawdown_pct().round_dp(2),
                %headroom_pct,
                peak = %self.drawdown.peak_equity(),
                "Drawdown approaching limit"
            );
        }

        // (e) stale open trades block new entries
        if !opportunity.is_exit() {
            let timeout = Duration::seconds(self.params.position_timeout_seconds as i64);
            if let Some(trade) = ctx.open_trades.iter().find(|t| t.age(ctx.now) > timeout) {
                return ValidationResult::reject(format!(
                    "open {} trade older than position_timeout_seconds ({}s)",
                    trade.direction.as_str(),
                    trade.age(ctx.now).num_seconds()
                ));
            }
        }

        ValidationResult::ok()
    }

    fn check_balance(
        &self,
        role: ExchangeRole,
        side: OrderSide,
        price: Decimal,
        qty: Decimal,
        balance: &BalanceSnapshot,
        position: &PositionState,
    ) -> Option<String> {
        let buffer = Decimal::ONE + pct_to_fraction(self.params.max_slippage_pct);
        let (asset, required) = match (balance.account, side) {
            (AccountKind::Cash, OrderSide::Buy) => (&self.symbol.quote, qty * price * buffer),
            (AccountKind::Cash, OrderSide::Sell) => (&self.symbol.base, qty),
            (AccountKind::Margin, _) if increases(role, side, position) => (
                &self.symbol.quote,
                safe_div(qty * price * buffer, self.params.max_leverage),
            ),
            (AccountKind::Margin, _) => return None,
        };

        let available = balance.free(asset);
        if available < required {
            return Some(format!(
                "insufficient {asset} on {role}: need {}, have {available}",
                required.round_dp(8)
            ));
        }
        None
    }
}

/// Whether trading `side` on `role` grows that leg.
fn increases(role: ExchangeRole, side: OrderSide, position: &PositionState) -> bool {
    if role == position.long_role {
        side == OrderSide::Buy
    } else {
        side == OrderSide::Sell
    }
}
