//! Trading strategy implementation.
//!
//! Contains the core logic for:
//! - The arbitrage state machine and its transition table
//! - Spread analysis over the latest book tickers
//! - Concurrent multi-leg execution with compensation
//! - Hedge rebalancing to maintain delta neutrality

mod analyzer;
mod coordinator;
mod executor;
mod market_view;
mod rebalancer;
mod state;

pub use analyzer::{
    spread_pct, ArbitrageOpportunity, Direction, ExitReason, OpenTrade, SpreadAnalyzer, SpreadStats,
    TradePurpose,
};
pub use coordinator::{ArbitrageCoordinator, CoordinatorHandle, CoordinatorStatus};
pub use executor::{Compensation, ExecutionCoordinator, ExecutionReport, LegMode, LegOutcome};
pub use market_view::MarketDataView;
pub use rebalancer::{HedgeRebalancer, RebalanceAction, RebalanceResult};
pub use state::{ArbitrageState, StateCell};
