//! Spread analysis.
//!
//! Pure functions over two book tickers. No I/O; the rolling basis window
//! is owned by the caller and passed in.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::{Decimal, MathematicalOps};
use serde::Serialize;
use std::collections::VecDeque;

use crate::config::TradingThresholds;
use crate::exchange::{BookTicker, ExchangeRole, OrderSide};
use crate::utils::decimal::{clamp, pct_change, safe_div};

/// Which leg is bought and which is sold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Buy on the long role, sell on the hedge role.
    SpotToFutures,
    /// Buy on the hedge role, sell on the long role.
    FuturesToSpot,
}

impl Direction {
    pub fn opposite(&self) -> Direction {
        match self {
            Direction::SpotToFutures => Direction::FuturesToSpot,
            Direction::FuturesToSpot => Direction::SpotToFutures,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::SpotToFutures => "spot_to_futures",
            Direction::FuturesToSpot => "futures_to_spot",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Converged,
    AgeLimit,
}

/// Whether an opportunity opens a trade or unwinds one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TradePurpose {
    Entry,
    Exit(ExitReason),
}

/// Candidate trade produced within a single cycle. Never stored across cycles.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArbitrageOpportunity {
    pub direction: Direction,
    /// Spread of `direction` in percent: (sell_bid - buy_ask) / buy_ask * 100
    pub spread_pct: Decimal,
    pub buy_role: ExchangeRole,
    pub sell_role: ExchangeRole,
    pub buy_price: Decimal,
    pub sell_price: Decimal,
    /// Top-of-book size available on both legs
    pub max_quantity: Decimal,
    /// Detection time
    pub timestamp: DateTime<Utc>,
    /// Timestamps of the two snapshots used
    pub buy_quote_time: DateTime<Utc>,
    pub sell_quote_time: DateTime<Utc>,
    /// 0..1, decays with snapshot age
    pub confidence: Decimal,
    pub zscore: Option<Decimal>,
    pub purpose: TradePurpose,
}

impl ArbitrageOpportunity {
    pub fn is_exit(&self) -> bool {
        matches!(self.purpose, TradePurpose::Exit(_))
    }

    /// Side and expected price on `role`, if it is one of the legs.
    pub fn leg(&self, role: ExchangeRole) -> Option<(OrderSide, Decimal)> {
        if role == self.buy_role {
            Some((OrderSide::Buy, self.buy_price))
        } else if role == self.sell_role {
            Some((OrderSide::Sell, self.sell_price))
        } else {
            None
        }
    }
}

/// An arbitrage trade held on top of the base hedge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpenTrade {
    pub direction: Direction,
    pub quantity: Decimal,
    pub entry_spread_pct: Decimal,
    pub opened_at: DateTime<Utc>,
}

impl OpenTrade {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.opened_at).max(Duration::zero())
    }
}

/// Spread from buying at `buy_ask` and selling at `sell_bid`, in percent.
pub fn spread_pct(buy_ask: Decimal, sell_bid: Decimal) -> Decimal {
    pct_change(sell_bid, buy_ask)
}

/// Rolling window of mid-price basis samples (hedge over long, percent).
#[derive(Debug, Clone)]
pub struct SpreadStats {
    window: usize,
    samples: VecDeque<Decimal>,
}

impl SpreadStats {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(2),
            samples: VecDeque::with_capacity(window.max(2)),
        }
    }

    /// Basis between the two mids, in percent.
    pub fn basis_pct(long: &BookTicker, hedge: &BookTicker) -> Decimal {
        pct_change(hedge.mid_price(), long.mid_price())
    }

    pub fn push(&mut self, sample: Decimal) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn is_ready(&self) -> bool {
        self.samples.len() == self.window
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn mean(&self) -> Decimal {
        safe_div(self.samples.iter().sum(), Decimal::from(self.samples.len()))
    }

    /// Population standard deviation.
    pub fn std_dev(&self) -> Decimal {
        if self.samples.len() < 2 {
            return Decimal::ZERO;
        }
        let mean = self.mean();
        let variance = safe_div(
            self.samples.iter().map(|s| (s - mean) * (s - mean)).sum(),
            Decimal::from(self.samples.len()),
        );
        variance.sqrt().unwrap_or(Decimal::ZERO)
    }

    /// Z-score of `value` against the window. `None` until the window is full
    /// or when the window has no dispersion.
    pub fn zscore(&self, value: Decimal) -> Option<Decimal> {
        if !self.is_ready() {
            return None;
        }
        let std_dev = self.std_dev();
        if std_dev == Decimal::ZERO {
            return None;
        }
        Some((value - self.mean()) / std_dev)
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Evaluates spreads between the long and hedge roles.
#[derive(Debug, Clone)]
pub struct SpreadAnalyzer {
    thresholds: TradingThresholds,
    long_role: ExchangeRole,
    hedge_role: ExchangeRole,
    staleness: Duration,
}

impl SpreadAnalyzer {
    pub fn new(
        thresholds: TradingThresholds,
        long_role: ExchangeRole,
        hedge_role: ExchangeRole,
        staleness: Duration,
    ) -> Self {
        Self {
            thresholds,
            long_role,
            hedge_role,
            staleness,
        }
    }

    /// Snapshot confidence: 1 for brand-new data, 0 at the staleness bound.
    pub fn confidence(&self, long: &BookTicker, hedge: &BookTicker, now: DateTime<Utc>) -> Decimal {
        let oldest = long.age(now).max(hedge.age(now));
        let bound = self.staleness.num_milliseconds();
        if bound <= 0 {
            return Decimal::ZERO;
        }
        let ratio = Decimal::from(oldest.num_milliseconds()) / Decimal::from(bound);
        clamp(Decimal::ONE - ratio, Decimal::ZERO, Decimal::ONE)
    }

    /// Spread of `direction` given the long and hedge snapshots.
    pub fn direction_spread(&self, direction: Direction, long: &BookTicker, hedge: &BookTicker) -> Decimal {
        match direction {
            Direction::SpotToFutures => spread_pct(long.ask_price, hedge.bid_price),
            Direction::FuturesToSpot => spread_pct(hedge.ask_price, long.bid_price),
        }
    }

    /// Opportunity for `direction` priced off the two snapshots.
    pub fn opportunity_for(
        &self,
        direction: Direction,
        long: &BookTicker,
        hedge: &BookTicker,
        now: DateTime<Utc>,
        zscore: Option<Decimal>,
        purpose: TradePurpose,
    ) -> ArbitrageOpportunity {
        let (buy, sell) = match direction {
            Direction::SpotToFutures => (long, hedge),
            Direction::FuturesToSpot => (hedge, long),
        };
        ArbitrageOpportunity {
            direction,
            spread_pct: self.direction_spread(direction, long, hedge),
            buy_role: buy.role,
            sell_role: sell.role,
            buy_price: buy.ask_price,
            sell_price: sell.bid_price,
            max_quantity: buy.ask_qty.min(sell.bid_qty),
            timestamp: now,
            buy_quote_time: buy.timestamp,
            sell_quote_time: sell.timestamp,
            confidence: self.confidence(long, hedge, now),
            zscore,
            purpose,
        }
    }

    fn is_fresh(&self, long: &BookTicker, hedge: &BookTicker, now: DateTime<Utc>) -> bool {
        long.role == self.long_role
            && hedge.role == self.hedge_role
            && !long.is_stale(now, self.staleness)
            && !hedge.is_stale(now, self.staleness)
    }

    /// Entry opportunity, if one qualifies under the enabled gates.
    ///
    /// `stats` holds the basis samples seen before this tick.
    pub fn analyze(
        &self,
        long: &BookTicker,
        hedge: &BookTicker,
        stats: &SpreadStats,
        now: DateTime<Utc>,
    ) -> Option<ArbitrageOpportunity> {
        if !self.is_fresh(long, hedge, now) {
            return None;
        }

        let t = &self.thresholds;
        let zscore = if t.zscore.enabled {
            Some(stats.zscore(SpreadStats::basis_pct(long, hedge))?)
        } else {
            None
        };

        let qualifies = |direction: Direction, spread: Decimal| -> bool {
            if t.use_entry_threshold && spread < t.entry_pct {
                return false;
            }
            if !t.use_entry_threshold && spread <= Decimal::ZERO {
                return false;
            }
            match zscore {
                // A rich hedge basis favors selling the hedge.
                Some(z) => match direction {
                    Direction::SpotToFutures => z >= t.zscore.min_zscore,
                    Direction::FuturesToSpot => z <= -t.zscore.min_zscore,
                },
                None => true,
            }
        };

        let best = [Direction::SpotToFutures, Direction::FuturesToSpot]
            .into_iter()
            .map(|d| (d, self.direction_spread(d, long, hedge)))
            .filter(|(d, spread)| qualifies(*d, *spread))
            .max_by(|a, b| a.1.abs().cmp(&b.1.abs()))?;

        let opportunity = self.opportunity_for(best.0, long, hedge, now, zscore, TradePurpose::Entry);
        if opportunity.confidence < t.min_confidence {
            return None;
        }
        Some(opportunity)
    }

    /// Unwind opportunity for `trade` when its spread converged or it is too old.
    pub fn evaluate_exit(
        &self,
        trade: &OpenTrade,
        long: &BookTicker,
        hedge: &BookTicker,
        now: DateTime<Utc>,
    ) -> Option<ArbitrageOpportunity> {
        if !self.is_fresh(long, hedge, now) {
            return None;
        }

        let reason = if self.direction_spread(trade.direction, long, hedge) <= self.thresholds.exit_pct {
            ExitReason::Converged
        } else if trade.age(now).num_seconds() as u64 > self.thresholds.position_age_limit_secs {
            ExitReason::AgeLimit
        } else {
            return None;
        };

        Some(self.opportunity_for(
            trade.direction.opposite(),
            long,
            hedge,
            now,
            None,
            TradePurpose::Exit(reason),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Symbol;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn ticker(role: ExchangeRole, bid: Decimal, ask: Decimal, at: DateTime<Utc>) -> BookTicker {
        BookTicker {
            role,
            symbol: Symbol::new("BTC", "USDT"),
            bid_price: bid,
            ask_price: ask,
            bid_qty: dec!(5),
            ask_qty: dec!(3),
            timestamp: at,
        }
    }

    fn analyzer(thresholds: TradingThresholds) -> SpreadAnalyzer {
        SpreadAnalyzer::new(
            thresholds,
            ExchangeRole::Spot,
            ExchangeRole::Futures,
            Duration::seconds(5),
        )
    }

    fn thresholds() -> TradingThresholds {
        TradingThresholds {
            entry_pct: dec!(0.5),
            ..Default::default()
        }
    }

    #[test]
    fn test_entry_opportunity_spot_to_futures() {
        let now = Utc::now();
        let spot = ticker(ExchangeRole::Spot, dec!(99.95), dec!(100.00), now);
        let futures = ticker(ExchangeRole::Futures, dec!(100.60), dec!(100.65), now);

        let opp = analyzer(thresholds())
            .analyze(&spot, &futures, &SpreadStats::new(10), now)
            .unwrap();

        assert_eq!(opp.direction, Direction::SpotToFutures);
        assert_eq!(opp.spread_pct, dec!(0.60));
        assert_eq!(opp.buy_role, ExchangeRole::Spot);
        assert_eq!(opp.sell_price, dec!(100.60));
        assert_eq!(opp.max_quantity, dec!(3));
        assert_eq!(opp.confidence, Decimal::ONE);
        assert_eq!(opp.purpose, TradePurpose::Entry);
    }

    #[test]
    fn test_entry_opportunity_futures_to_spot() {
        let now = Utc::now();
        let spot = ticker(ExchangeRole::Spot, dec!(101.00), dec!(101.05), now);
        let futures = ticker(ExchangeRole::Futures, dec!(99.95), dec!(100.00), now);

        let opp = analyzer(thresholds())
            .analyze(&spot, &futures, &SpreadStats::new(10), now)
            .unwrap();
        assert_eq!(opp.direction, Direction::FuturesToSpot);
        assert_eq!(opp.spread_pct, dec!(1.00));
        assert_eq!(opp.buy_role, ExchangeRole::Futures);
    }

    #[test]
    fn test_small_spread_no_opportunity() {
        let now = Utc::now();
        let spot = ticker(ExchangeRole::Spot, dec!(99.95), dec!(100.00), now);
        let futures = ticker(ExchangeRole::Futures, dec!(100.05), dec!(100.10), now);

        assert!(analyzer(thresholds())
            .analyze(&spot, &futures, &SpreadStats::new(10), now)
            .is_none());
    }

    #[test]
    fn test_low_confidence_rejected() {
        let now = Utc::now();
        let spot = ticker(ExchangeRole::Spot, dec!(99.95), dec!(100.00), now - Duration::seconds(4));
        let futures = ticker(ExchangeRole::Futures, dec!(100.60), dec!(100.65), now);

        // Confidence 1 - 4/5 = 0.2 < 0.5
        assert!(analyzer(thresholds())
            .analyze(&spot, &futures, &SpreadStats::new(10), now)
            .is_none());
    }

    #[test]
    fn test_zscore_gate_requires_full_window() {
        let now = Utc::now();
        let spot = ticker(ExchangeRole::Spot, dec!(99.95), dec!(100.00), now);
        let futures = ticker(ExchangeRole::Futures, dec!(100.60), dec!(100.65), now);
        let mut t = thresholds();
        t.zscore.enabled = true;
        t.zscore.window = 4;
        let analyzer = analyzer(t);

        let mut stats = SpreadStats::new(4);
        stats.push(dec!(0.1));
        stats.push(dec!(0.2));
        assert!(analyzer.analyze(&spot, &futures, &stats, now).is_none());

        stats.push(dec!(0.1));
        stats.push(dec!(0.2));
        // Basis ~0.625 against mean 0.15, std 0.05
        let opp = analyzer.analyze(&spot, &futures, &stats, now).unwrap();
        assert!(opp.zscore.unwrap() > dec!(2));
    }

    #[test]
    fn test_zscore_gate_blocks_ordinary_basis() {
        let now = Utc::now();
        let spot = ticker(ExchangeRole::Spot, dec!(99.95), dec!(100.00), now);
        let futures = ticker(ExchangeRole::Futures, dec!(100.60), dec!(100.65), now);
        let mut t = thresholds();
        t.zscore.enabled = true;
        t.zscore.window = 4;

        let mut stats = SpreadStats::new(4);
        for sample in [dec!(0.2), dec!(1.0), dec!(0.3), dec!(0.9)] {
            stats.push(sample);
        }
        assert!(analyzer(t).analyze(&spot, &futures, &stats, now).is_none());
    }

    #[test]
    fn test_stats_window_rolls() {
        let mut stats = SpreadStats::new(3);
        for sample in [dec!(1), dec!(2), dec!(3), dec!(4)] {
            stats.push(sample);
        }
        assert_eq!(stats.len(), 3);
        assert_eq!(stats.mean(), dec!(3));
    }

    #[test]
    fn test_exit_on_convergence() {
        let now = Utc::now();
        let trade = OpenTrade {
            direction: Direction::SpotToFutures,
            quantity: dec!(1),
            entry_spread_pct: dec!(0.6),
            opened_at: now - Duration::seconds(30),
        };
        let spot = ticker(ExchangeRole::Spot, dec!(99.95), dec!(100.00), now);
        let converged = ticker(ExchangeRole::Futures, dec!(100.05), dec!(100.10), now);
        let wide = ticker(ExchangeRole::Futures, dec!(100.60), dec!(100.65), now);

        let analyzer = analyzer(thresholds());
        assert!(analyzer.evaluate_exit(&trade, &spot, &wide, now).is_none());

        let exit = analyzer.evaluate_exit(&trade, &spot, &converged, now).unwrap();
        assert_eq!(exit.direction, Direction::FuturesToSpot);
        assert_eq!(exit.purpose, TradePurpose::Exit(ExitReason::Converged));
        assert_eq!(exit.sell_role, ExchangeRole::Spot);
    }

    #[test]
    fn test_exit_on_age_limit() {
        let now = Utc::now();
        let trade = OpenTrade {
            direction: Direction::SpotToFutures,
            quantity: dec!(1),
            entry_spread_pct: dec!(0.6),
            opened_at: now - Duration::hours(2),
        };
        let spot = ticker(ExchangeRole::Spot, dec!(99.95), dec!(100.00), now);
        let wide = ticker(ExchangeRole::Futures, dec!(100.60), dec!(100.65), now);

        let exit = analyzer(thresholds()).evaluate_exit(&trade, &spot, &wide, now).unwrap();
        assert_eq!(exit.purpose, TradePurpose::Exit(ExitReason::AgeLimit));
    }

    proptest! {
        #[test]
        fn stale_snapshot_never_yields_opportunity(
            spot_age_ms in 0i64..20_000,
            futures_age_ms in 0i64..20_000,
            futures_bid_bps in 0i64..500,
        ) {
            let now = Utc::now();
            let spot = ticker(
                ExchangeRole::Spot,
                dec!(99.99),
                dec!(100),
                now - Duration::milliseconds(spot_age_ms),
            );
            let bid = dec!(100) + Decimal::new(futures_bid_bps, 2);
            let futures = ticker(
                ExchangeRole::Futures,
                bid,
                bid + dec!(0.01),
                now - Duration::milliseconds(futures_age_ms),
            );
            let mut t = thresholds();
            t.min_confidence = Decimal::ZERO;

            let result = analyzer(t).analyze(&spot, &futures, &SpreadStats::new(10), now);
            if spot_age_ms > 5_000 || futures_age_ms > 5_000 {
                prop_assert!(result.is_none());
            }
            if let Some(opp) = result {
                prop_assert!(opp.spread_pct.abs() >= dec!(0.5));
            }
        }
    }
}
