//! Coordinator scenarios against two mock venues.

use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

use delta_arb::config::Config;
use delta_arb::error::ExchangeError;
use delta_arb::events::{EngineEvent, EventBus, EventEnvelope};
use delta_arb::exchange::{
    AccountKind, ExchangeClient, ExchangeManager, ExchangeRole, Fault, MockExchange, OrderSide, Symbol,
};
use delta_arb::persistence::RecordEmitter;
use delta_arb::strategy::{ArbitrageCoordinator, ArbitrageState, CoordinatorHandle, CoordinatorStatus};

const WAIT: Duration = Duration::from_secs(5);

fn test_config() -> Config {
    let mut config = Config::default();
    config.strategy.base_position_size = dec!(1);
    config.strategy.trade_quantity = dec!(0.5);
    config.strategy.min_check_interval_ms = 10;
    config.strategy.heartbeat_ms = 50;
    config.strategy.recovery_backoff_ms = 300;
    config.strategy.max_recovery_attempts = 3;
    config.strategy.initial_equity = dec!(100000);
    config.risk.max_position_size = dec!(1.5);
    config.execution.leg_timeout_ms = 250;
    config.execution.compensation_timeout_ms = 1000;
    config.exchange.max_attempts = 2;
    config.exchange.base_backoff_ms = 1;
    config.exchange.max_backoff_ms = 5;
    config.persistence.db_path = String::new();
    config
}

struct Harness {
    spot: Arc<MockExchange>,
    futures: Arc<MockExchange>,
    symbol: Symbol,
    handle: CoordinatorHandle,
    events: broadcast::Receiver<EventEnvelope>,
}

impl Harness {
    async fn new(config: Config) -> Self {
        let symbol = config.strategy.symbol();
        let spot = Arc::new(MockExchange::new("spot", AccountKind::Cash));
        let futures = Arc::new(MockExchange::new("futures", AccountKind::Margin));
        spot.fund("USDT", dec!(100000)).await;
        futures.fund("USDT", dec!(100000)).await;

        let exchanges = Arc::new(
            ExchangeManager::new(config.exchange.clone())
                .with_role(ExchangeRole::Spot, spot.clone() as Arc<dyn ExchangeClient>)
                .with_role(ExchangeRole::Futures, futures.clone() as Arc<dyn ExchangeClient>),
        );
        let (tx, events) = broadcast::channel(4096);
        let bus = EventBus::with_broadcast("BTC/USDT", tx);
        let (handle, _task) = ArbitrageCoordinator::spawn(config, exchanges, bus, RecordEmitter::disabled());

        let harness = Self {
            spot,
            futures,
            symbol,
            handle,
            events,
        };
        harness.neutral().await;
        harness
    }

    /// Spreads well below entry in both directions.
    async fn neutral(&self) {
        self.spot.set_quote(&self.symbol, dec!(99.95), dec!(100.00), dec!(5)).await;
        self.futures.set_quote(&self.symbol, dec!(99.98), dec!(100.03), dec!(5)).await;
    }

    /// Futures bid 0.6% over spot ask.
    async fn widen(&self) {
        self.spot.set_quote(&self.symbol, dec!(99.95), dec!(100.00), dec!(5)).await;
        self.futures.set_quote(&self.symbol, dec!(100.60), dec!(100.65), dec!(5)).await;
    }

    async fn start_and_establish(&self) -> CoordinatorStatus {
        self.handle.start().await.unwrap();
        wait_until(&self.handle, |s| s.state == ArbitrageState::Monitoring && s.cycles >= 1).await
    }

    fn drain_events(&mut self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(envelope) = self.events.try_recv() {
            events.push(envelope.event);
        }
        events
    }
}

async fn wait_until<F>(handle: &CoordinatorHandle, predicate: F) -> CoordinatorStatus
where
    F: Fn(&CoordinatorStatus) -> bool,
{
    let mut rx = handle.subscribe();
    let status = tokio::time::timeout(WAIT, rx.wait_for(|s| predicate(s)))
        .await
        .expect("timed out waiting for coordinator status")
        .expect("coordinator task gone")
        .clone();
    status
}

fn transitions(events: &[EngineEvent]) -> Vec<(ArbitrageState, ArbitrageState, bool)> {
    events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::StateTransition { from, to, forced } => Some((*from, *to, *forced)),
            _ => None,
        })
        .collect()
}

fn assert_legal_chain(events: &[EngineEvent]) {
    let mut previous = ArbitrageState::Idle;
    for (from, to, forced) in transitions(events) {
        assert_eq!(from, previous, "transition chain broken at {from} -> {to}");
        if forced {
            assert_eq!(to, ArbitrageState::Closing);
            assert!(from.can_force_close(), "forced close from {from}");
        } else {
            assert!(from.can_transition_to(to), "illegal transition {from} -> {to}");
        }
        previous = to;
    }
}

#[tokio::test]
async fn test_establishes_base_hedge_on_start() {
    let mut h = Harness::new(test_config()).await;
    let status = h.start_and_establish().await;

    assert_eq!(status.position.long_qty, dec!(1));
    assert_eq!(status.position.hedge_qty, dec!(1));
    assert_eq!(status.delta, Decimal::ZERO);
    assert_eq!(status.transitions, 3);
    assert_eq!(status.session_mdd_pct, Decimal::ZERO);
    assert_eq!(h.spot.balance("BTC").await, dec!(1));
    assert_eq!(h.futures.position(&h.symbol).await, dec!(-1));

    let events = h.drain_events();
    let path: Vec<_> = transitions(&events).into_iter().map(|(_, to, _)| to).collect();
    assert_eq!(
        path,
        vec![
            ArbitrageState::Initializing,
            ArbitrageState::EstablishingDeltaNeutral,
            ArbitrageState::Monitoring
        ]
    );
    h.handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_entry_executes_both_legs_and_stays_neutral() {
    let mut h = Harness::new(test_config()).await;
    h.start_and_establish().await;

    h.widen().await;
    let status = wait_until(&h.handle, |s| s.open_trades == 1 && s.state == ArbitrageState::Monitoring).await;

    assert_eq!(status.position.long_qty, dec!(1.5));
    assert_eq!(status.position.hedge_qty, dec!(1.5));
    assert_eq!(status.delta, Decimal::ZERO);
    assert_eq!(h.spot.balance("BTC").await, dec!(1.5));
    assert_eq!(h.futures.position(&h.symbol).await, dec!(-1.5));

    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::OpportunityDetected { spread_pct, exit: false, .. } if *spread_pct == dec!(0.6)
    )));
    assert!(!events
        .iter()
        .any(|e| matches!(e, EngineEvent::CompensationIssued { .. })));

    // Position limit reached: further entries are rejected, not executed.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let status = h.handle.get_status();
    assert_eq!(status.position.long_qty, dec!(1.5));
    assert!(h
        .drain_events()
        .iter()
        .any(|e| matches!(e, EngineEvent::ValidationRejected { .. })));

    h.handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_leg_timeout_compensates_back_to_pre_trade_position() {
    let mut h = Harness::new(test_config()).await;
    h.start_and_establish().await;

    h.futures.inject(Fault::Delay(Duration::from_millis(1000)));
    h.widen().await;

    let status = wait_until(&h.handle, |s| s.state == ArbitrageState::ErrorRecovery).await;
    assert_eq!(status.position.long_qty, dec!(1));
    assert_eq!(status.position.hedge_qty, dec!(1));
    assert!(status.last_error.as_deref().unwrap_or("").contains("timed out"));
    assert_eq!(h.spot.balance("BTC").await, dec!(1));

    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::CompensationIssued { role: ExchangeRole::Spot, side: OrderSide::Sell, quantity, success: true }
            if *quantity == dec!(0.5)
    )));

    // Recovery returns to monitoring and the next tick trades normally.
    wait_until(&h.handle, |s| s.state == ArbitrageState::Monitoring).await;
    h.widen().await;
    let status = wait_until(&h.handle, |s| s.open_trades == 1).await;
    assert_eq!(status.position.long_qty, dec!(1.5));

    h.handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_spread_below_entry_never_trades() {
    let mut h = Harness::new(test_config()).await;
    h.start_and_establish().await;

    for _ in 0..10 {
        h.spot.set_quote(&h.symbol, dec!(99.95), dec!(100.00), dec!(5)).await;
        h.futures.set_quote(&h.symbol, dec!(100.05), dec!(100.10), dec!(5)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let status = h.handle.get_status();
    assert_eq!(status.cycles, 1);
    assert_eq!(status.position.long_qty, dec!(1));
    assert!(!h
        .drain_events()
        .iter()
        .any(|e| matches!(e, EngineEvent::OpportunityDetected { .. })));

    h.handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_partial_hedge_is_rebalanced() {
    let mut config = test_config();
    config.execution.min_fill_ratio = dec!(0.9);
    let mut h = Harness::new(config).await;
    h.futures.inject(Fault::PartialFill(dec!(0.92)));

    h.handle.start().await.unwrap();
    let status = wait_until(&h.handle, |s| s.state == ArbitrageState::Monitoring && s.cycles >= 2).await;

    assert_eq!(status.position.long_qty, dec!(1));
    assert_eq!(status.position.hedge_qty, dec!(1));
    assert_eq!(h.futures.position(&h.symbol).await, dec!(-1));

    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::RebalanceIssued { role: ExchangeRole::Futures, side: OrderSide::Sell, quantity, delta_before }
            if *quantity == dec!(0.08) && *delta_before == dec!(0.08)
    )));
    assert!(transitions(&events).contains(&(
        ArbitrageState::EstablishingDeltaNeutral,
        ArbitrageState::Rebalancing,
        false
    )));

    h.handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_is_idempotent_and_flattens() {
    let mut h = Harness::new(test_config()).await;

    // Nothing running yet.
    h.handle.stop().await.unwrap();

    h.start_and_establish().await;
    let (first, second) = tokio::join!(h.handle.stop(), h.handle.stop());
    first.unwrap();
    second.unwrap();
    h.handle.stop().await.unwrap();

    let status = h.handle.get_status();
    assert_eq!(status.state, ArbitrageState::Idle);
    assert!(status.position.is_flat());
    assert_eq!(h.spot.balance("BTC").await, Decimal::ZERO);
    assert_eq!(h.futures.position(&h.symbol).await, Decimal::ZERO);

    let events = h.drain_events();
    assert_legal_chain(&events);
    let tail: Vec<_> = transitions(&events).into_iter().rev().take(3).collect();
    assert_eq!(
        tail,
        vec![
            (ArbitrageState::Closing, ArbitrageState::Idle, false),
            (ArbitrageState::Completing, ArbitrageState::Closing, false),
            (ArbitrageState::Monitoring, ArbitrageState::Completing, false),
        ]
    );
}

#[tokio::test]
async fn test_restart_after_stop() {
    let h = Harness::new(test_config()).await;
    h.start_and_establish().await;
    h.handle.stop().await.unwrap();

    // Establish, flatten, establish again.
    let status = h.start_and_establish().await;
    assert_eq!(status.position.long_qty, dec!(1));
    assert_eq!(status.cycles, 3);
    h.handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_failed_compensation_forces_close() {
    let mut h = Harness::new(test_config()).await;
    h.start_and_establish().await;

    // Spot entry leg fills, futures leg times out, spot compensation is refused.
    h.spot.inject(Fault::Delay(Duration::from_millis(1)));
    h.spot.inject(Fault::Reject("trading halted".into()));
    h.futures.inject(Fault::Delay(Duration::from_millis(1000)));
    h.widen().await;

    let status = wait_until(&h.handle, |s| s.state == ArbitrageState::Idle && s.last_error.is_some()).await;
    assert!(status
        .last_error
        .as_deref()
        .unwrap_or("")
        .contains("compensation failed"));
    assert!(status.position.is_flat());
    assert_eq!(h.spot.balance("BTC").await, Decimal::ZERO);
    assert_eq!(h.futures.position(&h.symbol).await, Decimal::ZERO);

    let events = h.drain_events();
    assert!(transitions(&events).contains(&(ArbitrageState::Executing, ArbitrageState::Closing, true)));
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::ErrorRecorded { fatal: true, .. })));
    assert_legal_chain(&events);
}

#[tokio::test]
async fn test_unreachable_venue_exhausts_recovery_and_closes() {
    let mut config = test_config();
    config.strategy.recovery_backoff_ms = 10;
    config.strategy.max_recovery_attempts = 2;
    let mut h = Harness::new(config).await;
    h.start_and_establish().await;

    h.futures.set_reachable(false);
    h.futures.disconnect("link down");

    let status = wait_until(&h.handle, |s| s.state == ArbitrageState::Idle && s.last_error.is_some()).await;
    // The futures hedge cannot be bought back while the venue is down, so
    // the spot sell is bought back and the pair stays hedged.
    assert_eq!(status.position.long_qty, dec!(1));
    assert_eq!(status.position.hedge_qty, dec!(1));
    assert_eq!(status.delta, Decimal::ZERO);
    assert!(status.last_error.as_deref().unwrap_or("").contains("residual position"));
    assert_eq!(h.spot.balance("BTC").await, dec!(1));
    assert_eq!(h.futures.position(&h.symbol).await, dec!(-1));

    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::RoleHealthChanged { role: ExchangeRole::Futures, healthy: false, .. }
    )));
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::ErrorRecorded { error, .. } if error.contains("recovery budget exhausted"))));
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::CompensationIssued { role: ExchangeRole::Spot, side: OrderSide::Buy, quantity, success: true }
            if *quantity == dec!(1)
    )));

    h.futures.set_reachable(true);
    h.handle.stop().await.unwrap();
    assert_legal_chain(&h.drain_events());
}

#[tokio::test]
async fn test_late_fill_after_failed_cancel_is_rebalanced() {
    let mut config = test_config();
    config.strategy.recovery_backoff_ms = 200;
    let mut h = Harness::new(config).await;
    h.start_and_establish().await;

    // The spot entry leg cannot be canceled and fills well after the
    // futures leg has been compensated.
    h.spot.inject(Fault::LateFill(Duration::from_millis(900)));
    h.widen().await;

    let status = wait_until(&h.handle, |s| s.state == ArbitrageState::ErrorRecovery).await;
    assert!(status.last_error.as_deref().unwrap_or("").contains("still open"));
    assert_eq!(status.delta, Decimal::ZERO);
    h.neutral().await;

    let status = wait_until(&h.handle, |s| {
        s.state == ArbitrageState::Monitoring && s.cycles >= 3 && s.position.long_qty == dec!(1)
    })
    .await;
    assert_eq!(status.position.hedge_qty, dec!(1));
    assert_eq!(status.delta, Decimal::ZERO);
    assert_eq!(h.spot.balance("BTC").await, dec!(1));
    assert_eq!(h.futures.position(&h.symbol).await, dec!(-1));

    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::CompensationIssued { role: ExchangeRole::Futures, side: OrderSide::Buy, quantity, success: true }
            if *quantity == dec!(0.5)
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::RebalanceIssued { role: ExchangeRole::Spot, side: OrderSide::Sell, quantity, .. }
            if *quantity == dec!(0.5)
    )));
    assert!(transitions(&events).contains(&(ArbitrageState::Monitoring, ArbitrageState::Rebalancing, false)));

    h.handle.stop().await.unwrap();
    assert_legal_chain(&h.drain_events());
}

#[tokio::test]
async fn test_late_fill_while_idle_is_reported() {
    let mut h = Harness::new(test_config()).await;
    h.start_and_establish().await;

    h.spot.inject(Fault::LateFill(Duration::from_millis(1500)));
    h.widen().await;
    wait_until(&h.handle, |s| s.state == ArbitrageState::ErrorRecovery).await;
    h.neutral().await;
    h.handle.stop().await.unwrap();
    assert!(h.handle.get_status().position.is_flat());

    let status = wait_until(&h.handle, |s| {
        s.state == ArbitrageState::Idle && s.last_error.as_deref().unwrap_or("").contains("while idle")
    })
    .await;
    assert_eq!(status.position.long_qty, dec!(0.5));
    assert_eq!(status.position.hedge_qty, Decimal::ZERO);
    assert_eq!(h.spot.balance("BTC").await, dec!(0.5));
    assert_legal_chain(&h.drain_events());
}

#[derive(Debug, Clone)]
enum Injection {
    HedgeDelay,
    SpotReject,
    HedgePartial,
    SpotTransient,
    HedgeDrop,
    Quiet,
}

fn injection() -> impl Strategy<Value = Injection> {
    prop_oneof![
        1 => Just(Injection::HedgeDelay),
        1 => Just(Injection::SpotReject),
        1 => Just(Injection::HedgePartial),
        1 => Just(Injection::SpotTransient),
        1 => Just(Injection::HedgeDrop),
        2 => Just(Injection::Quiet),
    ]
}

/// Drive a running coordinator through `steps` of injected faults and
/// quote moves, checking delta every time an execution settles.
async fn run_fault_sequence(steps: Vec<(Injection, bool)>) {
    let mut config = test_config();
    config.strategy.recovery_backoff_ms = 10;
    config.risk.max_position_size = dec!(3);
    let tolerance = config.strategy.delta_tolerance();
    let mut h = Harness::new(config).await;
    h.start_and_establish().await;

    let violations = Arc::new(Mutex::new(Vec::new()));
    let mut status_rx = h.handle.subscribe();
    let watcher = tokio::spawn({
        let violations = violations.clone();
        async move {
            let mut previous = status_rx.borrow_and_update().clone();
            while status_rx.changed().await.is_ok() {
                let current = status_rx.borrow_and_update().clone();
                let settled = matches!(previous.state, ArbitrageState::Executing | ArbitrageState::Rebalancing)
                    && current.state == ArbitrageState::Monitoring
                    && current.transitions == previous.transitions + 1;
                if settled && current.delta.abs() > tolerance {
                    violations
                        .lock()
                        .unwrap()
                        .push(format!("{} -> Monitoring with delta {}", previous.state, current.delta));
                }
                previous = current;
            }
        }
    });

    for (injection, wide) in steps {
        match injection {
            Injection::HedgeDelay => h.futures.inject(Fault::Delay(Duration::from_millis(400))),
            Injection::SpotReject => h.spot.inject(Fault::Reject("random reject".into())),
            Injection::HedgePartial => h.futures.inject(Fault::PartialFill(dec!(0.5))),
            Injection::SpotTransient => h.spot.inject(Fault::Error(ExchangeError::Transient("blip".into()))),
            Injection::HedgeDrop => h.futures.disconnect("random drop"),
            Injection::Quiet => {}
        }
        if wide {
            h.widen().await;
        } else {
            h.neutral().await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
    }

    h.spot.clear_faults();
    h.futures.clear_faults();
    tokio::time::timeout(Duration::from_secs(10), h.handle.stop())
        .await
        .expect("stop timed out")
        .unwrap();
    watcher.abort();

    let status = h.handle.get_status();
    assert_eq!(status.state, ArbitrageState::Idle);
    assert!(status.position.is_flat() || status.last_error.is_some());
    assert_legal_chain(&h.drain_events());
    let violations = violations.lock().unwrap();
    assert!(violations.is_empty(), "delta left tolerance: {violations:?}");
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 6, ..ProptestConfig::default() })]

    #[test]
    fn random_faults_keep_transitions_legal_and_delta_bounded(
        steps in prop::collection::vec((injection(), any::<bool>()), 8..14)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(run_fault_sequence(steps));
    }
}
