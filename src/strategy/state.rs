//! Arbitrage state machine states and the legal transition table.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tracing::{info, warn};

use crate::error::EngineError;

/// Lifecycle state of one strategy instance. Exactly one is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArbitrageState {
    Idle,
    Initializing,
    EstablishingDeltaNeutral,
    Monitoring,
    Analyzing,
    Preparing,
    Executing,
    Rebalancing,
    Completing,
    ErrorRecovery,
    Closing,
}

use ArbitrageState::*;

impl ArbitrageState {
    pub const ALL: [ArbitrageState; 11] = [
        Idle,
        Initializing,
        EstablishingDeltaNeutral,
        Monitoring,
        Analyzing,
        Preparing,
        Executing,
        Rebalancing,
        Completing,
        ErrorRecovery,
        Closing,
    ];

    /// States reachable from `self` in one legal step.
    pub fn successors(&self) -> &'static [ArbitrageState] {
        match self {
            Idle => &[Initializing],
            Initializing => &[EstablishingDeltaNeutral, Closing],
            EstablishingDeltaNeutral => &[Monitoring, Rebalancing, Closing],
            Monitoring => &[Analyzing, Rebalancing, ErrorRecovery, Completing],
            Analyzing => &[Preparing, Monitoring, Completing],
            Preparing => &[Executing, Monitoring, Completing],
            Executing => &[Rebalancing, Monitoring, ErrorRecovery, Completing],
            Rebalancing => &[Monitoring, ErrorRecovery, Completing],
            Completing => &[Closing],
            ErrorRecovery => &[Monitoring, Closing],
            Closing => &[Idle],
        }
    }

    pub fn can_transition_to(&self, to: ArbitrageState) -> bool {
        self.successors().contains(&to)
    }

    /// Where a pending stop request leads from this state, if it is honored here.
    pub fn stop_target(&self) -> Option<ArbitrageState> {
        match self {
            Monitoring | Analyzing | Preparing | Executing | Rebalancing => Some(Completing),
            Initializing | EstablishingDeltaNeutral | ErrorRecovery => Some(Closing),
            Idle | Completing | Closing => None,
        }
    }

    /// Whether a fatal error may force `Closing` from here.
    pub fn can_force_close(&self) -> bool {
        !matches!(self, Idle | Closing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Idle => "idle",
            Initializing => "initializing",
            EstablishingDeltaNeutral => "establishing_delta_neutral",
            Monitoring => "monitoring",
            Analyzing => "analyzing",
            Preparing => "preparing",
            Executing => "executing",
            Rebalancing => "rebalancing",
            Completing => "completing",
            ErrorRecovery => "error_recovery",
            Closing => "closing",
        }
    }
}

impl fmt::Display for ArbitrageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single active state and its bookkeeping.
#[derive(Debug, Clone)]
pub struct StateCell {
    current: ArbitrageState,
    entered_at: DateTime<Utc>,
    transitions: u64,
}

impl Default for StateCell {
    fn default() -> Self {
        Self {
            current: Idle,
            entered_at: Utc::now(),
            transitions: 0,
        }
    }
}

impl StateCell {
    pub fn current(&self) -> ArbitrageState {
        self.current
    }

    pub fn entered_at(&self) -> DateTime<Utc> {
        self.entered_at
    }

    pub fn transitions(&self) -> u64 {
        self.transitions
    }

    /// Move to `to` if the table allows it. Returns the previous state.
    pub fn transition(&mut self, to: ArbitrageState) -> Result<ArbitrageState, EngineError> {
        let from = self.current;
        if !from.can_transition_to(to) {
            return Err(EngineError::IllegalTransition { from, to });
        }
        self.enter(to);
        info!(%from, %to, "State transition");
        Ok(from)
    }

    /// Forced move to `Closing` after a fatal error. Returns the previous state.
    pub fn force_close(&mut self) -> Option<ArbitrageState> {
        let from = self.current;
        if !from.can_force_close() {
            return None;
        }
        self.enter(Closing);
        warn!(%from, to = %Closing, "Forced state transition");
        Some(from)
    }

    fn enter(&mut self, to: ArbitrageState) {
        self.current = to;
        self.entered_at = Utc::now();
        self.transitions += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_happy_path_is_legal() {
        let path = [
            Idle,
            Initializing,
            EstablishingDeltaNeutral,
            Monitoring,
            Analyzing,
            Preparing,
            Executing,
            Monitoring,
            Completing,
            Closing,
            Idle,
        ];
        let mut cell = StateCell::default();
        for to in &path[1..] {
            cell.transition(*to).unwrap();
        }
        assert_eq!(cell.current(), Idle);
        assert_eq!(cell.transitions(), 10);
    }

    #[test]
    fn test_illegal_transition_leaves_state() {
        let mut cell = StateCell::default();
        let err = cell.transition(Executing).unwrap_err();
        assert_eq!(err, EngineError::IllegalTransition { from: Idle, to: Executing });
        assert_eq!(cell.current(), Idle);
    }

    #[test]
    fn test_stop_targets_are_legal() {
        for state in ArbitrageState::ALL {
            if let Some(target) = state.stop_target() {
                assert!(state.can_transition_to(target), "{state} -> {target}");
            }
        }
    }

    #[test]
    fn test_every_state_can_reach_idle() {
        for state in ArbitrageState::ALL {
            let mut current = state;
            let mut steps = 0;
            while current != Idle {
                current = if current.can_transition_to(Closing) {
                    Closing
                } else if current == Closing {
                    Idle
                } else {
                    current.stop_target().unwrap_or(Closing)
                };
                steps += 1;
                assert!(steps < 5, "{state} cannot reach idle");
            }
        }
    }

    #[test]
    fn test_force_close() {
        let mut cell = StateCell::default();
        assert_eq!(cell.force_close(), None);
        cell.transition(Initializing).unwrap();
        cell.transition(EstablishingDeltaNeutral).unwrap();
        cell.transition(Monitoring).unwrap();
        assert_eq!(cell.force_close(), Some(Monitoring));
        assert_eq!(cell.current(), Closing);
    }

    proptest! {
        #[test]
        fn random_requests_never_take_illegal_transition(
            requests in prop::collection::vec(0usize..11, 1..200)
        ) {
            let mut cell = StateCell::default();
            for idx in requests {
                let from = cell.current();
                let to = ArbitrageState::ALL[idx];
                match cell.transition(to) {
                    Ok(prev) => {
                        prop_assert_eq!(prev, from);
                        prop_assert!(from.can_transition_to(to));
                        prop_assert_eq!(cell.current(), to);
                    }
                    Err(EngineError::IllegalTransition { from: f, to: t }) => {
                        prop_assert_eq!((f, t), (from, to));
                        prop_assert_eq!(cell.current(), from);
                    }
                    Err(other) => prop_assert!(false, "unexpected error {:?}", other),
                }
            }
        }
    }
}
