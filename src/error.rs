//! Error taxonomy for the arbitrage engine.
//!
//! Expected rejections (stale data, spread below threshold, insufficient
//! balance at validation time) are not errors and never appear here; they
//! are returned as values by the analyzer and the risk validator.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::exchange::ExchangeRole;
use crate::strategy::ArbitrageState;

/// Errors surfaced at the exchange boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExchangeError {
    /// Call did not complete within its deadline.
    #[error("{role} {operation} timed out after {elapsed_ms}ms")]
    Timeout {
        role: ExchangeRole,
        operation: &'static str,
        elapsed_ms: u64,
    },

    /// Rate limited by the venue.
    #[error("rate limited: retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Transient venue failure (5xx, overload).
    #[error("transient venue error: {0}")]
    Transient(String),

    /// Connection to the venue was lost.
    #[error("connection lost: {0}")]
    Disconnected(String),

    /// Order rejected by the venue.
    #[error("order rejected: {0}")]
    Rejected(String),

    /// Venue reports insufficient funds.
    #[error("insufficient balance: need {required} {asset}, have {available}")]
    InsufficientBalance {
        asset: String,
        required: Decimal,
        available: Decimal,
    },

    /// Credentials refused.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// No client bound to the role.
    #[error("no exchange bound to role {0}")]
    UnknownRole(ExchangeRole),

    /// Role was marked unhealthy and refuses calls until re-checked.
    #[error("role {0} is unhealthy")]
    Unhealthy(ExchangeRole),

    /// Venue does not know the order.
    #[error("order {0} not found")]
    OrderNotFound(String),
}

impl ExchangeError {
    /// Whether the manager may retry the call with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::RateLimited { .. }
                | ExchangeError::Transient(_)
                | ExchangeError::Disconnected(_)
        )
    }

    /// Errors that must halt trading rather than be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ExchangeError::Authentication(_) | ExchangeError::UnknownRole(_)
        )
    }

    pub fn is_connection_loss(&self) -> bool {
        matches!(self, ExchangeError::Disconnected(_) | ExchangeError::Unhealthy(_))
    }
}

/// Errors raised inside the coordinator and its components.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    /// Requested transition is not in the table. Programming error.
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        from: ArbitrageState,
        to: ArbitrageState,
    },

    /// Ledger or position invariant broken (e.g. negative quantity).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// One or more legs failed; unhedged quantity was compensated.
    #[error("leg failure: {0}")]
    LegFailure(String),

    /// Compensation order failed: position may be unhedged.
    #[error("compensation failed: {0}")]
    CompensationFailed(String),

    #[error("recovery budget exhausted after {0} attempts")]
    RetryBudgetExhausted(u32),

    #[error("no usable market data for {0}")]
    MarketDataUnavailable(ExchangeRole),

    /// Coordinator task is gone; handle calls cannot be served.
    #[error("coordinator task has stopped")]
    Shutdown,
}

impl EngineError {
    /// Fatal errors are not retried: the coordinator flattens and halts.
    pub fn is_fatal(&self) -> bool {
        match self {
            EngineError::Exchange(e) => e.is_fatal(),
            EngineError::IllegalTransition { .. }
            | EngineError::InvariantViolation(_)
            | EngineError::CompensationFailed(_)
            | EngineError::RetryBudgetExhausted(_) => true,
            EngineError::LegFailure(_)
            | EngineError::MarketDataUnavailable(_)
            | EngineError::Shutdown => false,
        }
    }
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, EngineError>;
