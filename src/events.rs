//! Structured engine events.
//!
//! Events are fire-and-forget: they are logged as JSON under the `arb_event`
//! target and offered to an optional broadcast channel. Emitting never
//! blocks or fails.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::exchange::{ExchangeRole, OrderSide};
use crate::persistence::CycleKind;
use crate::strategy::{ArbitrageState, Direction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Observable things the coordinator does.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    StateTransition {
        from: ArbitrageState,
        to: ArbitrageState,
        /// Fatal error or illegal request forced the move to Closing.
        forced: bool,
    },
    OpportunityDetected {
        direction: Direction,
        spread_pct: Decimal,
        confidence: Decimal,
        quantity: Decimal,
        exit: bool,
    },
    ValidationRejected {
        reason: String,
    },
    ExecutionCompleted {
        cycle_id: u64,
        kind: CycleKind,
        hedged_qty: Decimal,
        success: bool,
    },
    CompensationIssued {
        role: ExchangeRole,
        side: OrderSide,
        quantity: Decimal,
        success: bool,
    },
    RebalanceIssued {
        role: ExchangeRole,
        side: OrderSide,
        quantity: Decimal,
        delta_before: Decimal,
    },
    ErrorRecorded {
        error: String,
        fatal: bool,
    },
    RoleHealthChanged {
        role: ExchangeRole,
        healthy: bool,
        reason: Option<String>,
    },
}

impl EngineEvent {
    pub fn severity(&self) -> Severity {
        match self {
            EngineEvent::StateTransition { forced: true, .. } => Severity::Warning,
            EngineEvent::ExecutionCompleted { success: false, .. } => Severity::Warning,
            EngineEvent::CompensationIssued { success: false, .. } => Severity::Error,
            EngineEvent::CompensationIssued { .. } => Severity::Warning,
            EngineEvent::ErrorRecorded { fatal: true, .. } => Severity::Error,
            EngineEvent::ErrorRecorded { .. } => Severity::Warning,
            EngineEvent::RoleHealthChanged { healthy: false, .. } => Severity::Warning,
            _ => Severity::Info,
        }
    }
}

/// Event with its origin and emission time.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub strategy: String,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    #[serde(flatten)]
    pub event: EngineEvent,
}

/// Per-strategy event emitter.
#[derive(Debug, Clone)]
pub struct EventBus {
    strategy: String,
    tx: Option<broadcast::Sender<EventEnvelope>>,
}

impl EventBus {
    /// Log-only bus.
    pub fn new(strategy: impl Into<String>) -> Self {
        Self {
            strategy: strategy.into(),
            tx: None,
        }
    }

    /// Bus that also forwards to a broadcast channel.
    pub fn with_broadcast(strategy: impl Into<String>, tx: broadcast::Sender<EventEnvelope>) -> Self {
        Self {
            strategy: strategy.into(),
            tx: Some(tx),
        }
    }

    pub fn strategy(&self) -> &str {
        &self.strategy
    }

    pub fn emit(&self, event: EngineEvent) {
        let envelope = EventEnvelope {
            strategy: self.strategy.clone(),
            timestamp: Utc::now(),
            severity: event.severity(),
            event,
        };
        let json = serde_json::to_string(&envelope).unwrap_or_default();

        match envelope.severity {
            Severity::Info => info!(target: "arb_event", "ARB_EVENT: {}", json),
            Severity::Warning => warn!(target: "arb_event", "ARB_EVENT: {}", json),
            Severity::Error => error!(target: "arb_event", "ARB_EVENT: {}", json),
        }

        if let Some(tx) = &self.tx {
            // No receivers is fine.
            let _ = tx.send(envelope);
        }
    }
}
