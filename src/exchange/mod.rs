//! Exchange layer.
//!
//! ## Roles
//! The core never names a venue. Strategies trade through logical roles
//! (`Spot`, `Futures`, `Target`), each bound to an `ExchangeClient` at
//! construction time:
//! - `ExchangeManager`: retry, health, latency metrics, event tagging
//! - `ExchangeClient`: boundary trait implemented by venue adapters
//!
//! ## Paper trading
//! `MockExchange` simulates a cash or margin venue with fault injection.

mod manager;
pub mod mock;
mod traits;
mod types;

pub use manager::{ExchangeManager, RoleMetrics};
pub use mock::{Fault, MockExchange};
pub use traits::ExchangeClient;
pub use types::*;
