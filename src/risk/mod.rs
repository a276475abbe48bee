//! Risk management for the arbitrage engine.
//!
//! - Position ledger (authoritative per-role quantities, PnL)
//! - Pre-trade validation
//! - Maximum drawdown tracking

mod ledger;
mod mdd;
mod validator;

pub use ledger::{AppliedFill, PositionLedger, PositionState};
pub use mdd::DrawdownTracker;
pub use validator::{RiskValidator, ValidationContext, ValidationResult};
