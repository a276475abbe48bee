//! # Delta Arb
//!
//! Coordination engine for delta-neutral spot/futures arbitrage across
//! multiple venues.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `error`: Exchange and engine error taxonomy
//! - `events`: Structured engine events
//! - `exchange`: Role-keyed venue access, client boundary and mock venue
//! - `strategy`: State machine, spread analysis, execution and rebalancing
//! - `risk`: Position ledger, pre-trade validation and MDD tracking
//! - `persistence`: SQLite-backed trade cycle records
//! - `utils`: Shared utilities and decimal arithmetic

pub mod config;
pub mod error;
pub mod events;
pub mod exchange;
pub mod persistence;
pub mod risk;
pub mod strategy;
pub mod utils;

pub use config::Config;
pub use error::{EngineError, ExchangeError};
pub use strategy::{ArbitrageCoordinator, CoordinatorHandle, CoordinatorStatus};
