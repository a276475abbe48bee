//! Arbitrage coordinator.
//!
//! One coordinator task owns the state machine, the position ledger, the
//! market data view and every component that acts on them. Callers talk to
//! it through a [`CoordinatorHandle`]: commands go in over a channel and the
//! latest [`CoordinatorStatus`] comes back over a watch.
//!
//! Each loop iteration dispatches on the current state to exactly one
//! handler. A handler returns the next state, and the loop validates that
//! move against the transition table before applying it. Stop requests and
//! health changes are only acted on between handlers, never mid-leg.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::analyzer::{ArbitrageOpportunity, Direction, OpenTrade, SpreadAnalyzer, SpreadStats, TradePurpose};
use super::executor::{ExecutionCoordinator, ExecutionReport};
use super::market_view::MarketDataView;
use super::rebalancer::HedgeRebalancer;
use super::state::{ArbitrageState, StateCell};
use crate::config::Config;
use crate::error::EngineError;
use crate::events::{EngineEvent, EventBus};
use crate::exchange::{BalanceSnapshot, BookTicker, ExchangeEvent, ExchangeManager, ExchangeRole, Symbol};
use crate::persistence::{CycleKind, CycleRecord, RecordEmitter};
use crate::risk::{PositionLedger, PositionState, RiskValidator, ValidationContext};

use ArbitrageState::*;

const COMMAND_CHANNEL_CAPACITY: usize = 16;
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Snapshot published after every transition and ledger change.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub strategy: String,
    pub state: ArbitrageState,
    pub state_since: DateTime<Utc>,
    /// Transitions taken since spawn
    pub transitions: u64,
    pub position: PositionState,
    pub delta: Decimal,
    /// Realized PnL net of fees
    pub cumulative_pnl: Decimal,
    pub drawdown_pct: Decimal,
    pub session_mdd_pct: Decimal,
    pub last_error: Option<String>,
    /// Completed execution cycles since spawn
    pub cycles: u64,
    pub open_trades: usize,
    pub recovery_attempts: u32,
    pub updated_at: DateTime<Utc>,
}

enum Command {
    Start(oneshot::Sender<ArbitrageState>),
    Stop(oneshot::Sender<()>),
}

/// Cloneable control surface for a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<CoordinatorStatus>,
}

impl CoordinatorHandle {
    /// Leave `Idle` and begin establishing the base hedge. Resolves once the
    /// coordinator has left `Idle`; a no-op when it is already running.
    pub async fn start(&self) -> Result<ArbitrageState, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Start(tx))
            .await
            .map_err(|_| EngineError::Shutdown)?;
        rx.await.map_err(|_| EngineError::Shutdown)
    }

    /// Unwind everything and return to `Idle`. Resolves once `Idle` is
    /// reached. Safe to call any number of times, from any state.
    pub async fn stop(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Stop(tx)).await.is_err() {
            return if self.status.borrow().state == Idle {
                Ok(())
            } else {
                Err(EngineError::Shutdown)
            };
        }
        rx.await.map_err(|_| EngineError::Shutdown)
    }

    pub fn get_status(&self) -> CoordinatorStatus {
        self.status.borrow().clone()
    }

    /// Receiver that observes every published status.
    pub fn subscribe(&self) -> watch::Receiver<CoordinatorStatus> {
        self.status.clone()
    }
}

/// Trade selected by analysis and carried through validation to execution.
struct PendingTrade {
    opportunity: ArbitrageOpportunity,
    quantity: Decimal,
    /// Open trade being unwound, for exits
    trade_index: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventEffect {
    Tick,
    Other,
}

pub struct ArbitrageCoordinator {
    config: Config,
    symbol: Symbol,
    long_role: ExchangeRole,
    hedge_role: ExchangeRole,

    exchanges: Arc<ExchangeManager>,
    executor: ExecutionCoordinator,
    analyzer: SpreadAnalyzer,
    rebalancer: HedgeRebalancer,
    validator: RiskValidator,
    events: EventBus,
    records: RecordEmitter,

    state: StateCell,
    ledger: PositionLedger,
    view: MarketDataView,
    stats: SpreadStats,
    open_trades: Vec<OpenTrade>,
    pending: Option<PendingTrade>,
    balances: HashMap<ExchangeRole, BalanceSnapshot>,
    unhealthy: HashSet<ExchangeRole>,

    commands: mpsc::Receiver<Command>,
    start_acks: Vec<oneshot::Sender<ArbitrageState>>,
    stop_acks: Vec<oneshot::Sender<()>>,
    stop_requested: bool,
    detached: bool,

    event_tx: mpsc::Sender<ExchangeEvent>,
    event_rx: mpsc::Receiver<ExchangeEvent>,
    subscribed: bool,
    heartbeat: Interval,
    last_analysis: Instant,

    status_tx: watch::Sender<CoordinatorStatus>,
    last_error: Option<String>,
    cycles: u64,
    recovery_attempts: u32,
}

impl ArbitrageCoordinator {
    /// Build a coordinator for `config` and run it on a new task.
    pub fn spawn(
        config: Config,
        exchanges: Arc<ExchangeManager>,
        events: EventBus,
        records: RecordEmitter,
    ) -> (CoordinatorHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let coordinator = Self::new(config, exchanges, events, records, command_rx);
        let handle = CoordinatorHandle {
            commands: command_tx,
            status: coordinator.status_tx.subscribe(),
        };
        (handle, tokio::spawn(coordinator.run()))
    }

    fn new(
        config: Config,
        exchanges: Arc<ExchangeManager>,
        events: EventBus,
        records: RecordEmitter,
        commands: mpsc::Receiver<Command>,
    ) -> Self {
        let strategy = &config.strategy;
        let symbol = strategy.symbol();
        let long_role = strategy.long_role;
        let hedge_role = strategy.hedge_role;

        let executor = ExecutionCoordinator::new(
            exchanges.clone(),
            symbol.clone(),
            config.execution.clone(),
            config.thresholds.max_slippage_pct,
        );
        let analyzer = SpreadAnalyzer::new(
            config.thresholds.clone(),
            long_role,
            hedge_role,
            strategy.staleness(),
        );
        let rebalancer = HedgeRebalancer::new(strategy.base_position_size, strategy.rebalance_tolerance_pct);
        let validator = RiskValidator::new(
            config.risk.clone(),
            symbol.clone(),
            strategy.staleness(),
            strategy.initial_equity,
        );
        let stats = SpreadStats::new(config.thresholds.zscore.window);
        let ledger = PositionLedger::new(long_role, hedge_role);

        let mut heartbeat = interval(Duration::from_millis(strategy.heartbeat_ms.max(1)));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (status_tx, _) = watch::channel(CoordinatorStatus {
            strategy: events.strategy().to_string(),
            state: Idle,
            state_since: Utc::now(),
            transitions: 0,
            position: ledger.position().clone(),
            delta: Decimal::ZERO,
            cumulative_pnl: Decimal::ZERO,
            drawdown_pct: Decimal::ZERO,
            session_mdd_pct: Decimal::ZERO,
            last_error: None,
            cycles: 0,
            open_trades: 0,
            recovery_attempts: 0,
            updated_at: Utc::now(),
        });

        Self {
            symbol,
            long_role,
            hedge_role,
            exchanges,
            executor,
            analyzer,
            rebalancer,
            validator,
            events,
            records,
            state: StateCell::default(),
            ledger,
            view: MarketDataView::new(),
            stats,
            open_trades: Vec::new(),
            pending: None,
            balances: HashMap::new(),
            unhealthy: HashSet::new(),
            commands,
            start_acks: Vec::new(),
            stop_acks: Vec::new(),
            stop_requested: false,
            detached: false,
            event_tx,
            event_rx,
            subscribed: false,
            heartbeat,
            last_analysis: Instant::now(),
            status_tx,
            last_error: None,
            cycles: 0,
            recovery_attempts: 0,
            config,
        }
    }

    /// Main loop. Returns once every handle is dropped and the coordinator is idle.
    pub async fn run(mut self) {
        info!(strategy = %self.events.strategy(), symbol = %self.symbol, "Coordinator started");

        loop {
            self.poll_commands();
            let state = self.state.current();

            if state == Idle && self.detached && self.start_acks.is_empty() {
                break;
            }
            if self.stop_requested {
                if let Some(target) = state.stop_target() {
                    info!(%state, %target, "Stop requested");
                    self.advance(target);
                    continue;
                }
            }

            let next = match state {
                Idle => self.on_idle().await,
                Initializing => self.on_initializing().await,
                EstablishingDeltaNeutral => self.on_establishing().await,
                Monitoring => self.on_monitoring().await,
                Analyzing => self.on_analyzing().await,
                Preparing => self.on_preparing().await,
                Executing => self.on_executing().await,
                Rebalancing => self.on_rebalancing().await,
                Completing => self.on_completing().await,
                ErrorRecovery => self.on_error_recovery().await,
                Closing => self.on_closing().await,
            };

            match next {
                Ok(next) if next == state => {}
                Ok(next) => self.advance(next),
                Err(e) => self.fail(state, e),
            }
        }

        info!(strategy = %self.events.strategy(), "Coordinator stopped");
    }

    // ---- handlers ----

    async fn on_idle(&mut self) -> Result<ArbitrageState, EngineError> {
        if !self.start_acks.is_empty() {
            return Ok(Initializing);
        }
        tokio::select! {
            command = self.commands.recv() => match command {
                Some(command) => self.handle_command(command),
                None => self.detach(),
            },
            Some(event) = self.event_rx.recv() => {
                self.apply_event(event)?;
            }
        }
        Ok(Idle)
    }

    async fn on_initializing(&mut self) -> Result<ArbitrageState, EngineError> {
        for role in self.legs() {
            self.exchanges.check_health(role).await?;
        }

        if !self.subscribed {
            for role in self.legs() {
                self.exchanges
                    .subscribe_book_ticker(role, &self.symbol, self.event_tx.clone())
                    .await?;
                self.exchanges
                    .subscribe_order_updates(role, self.event_tx.clone())
                    .await?;
            }
            self.subscribed = true;
        }

        self.refresh_balances().await?;
        self.drain_events()?;
        self.unhealthy.clear();
        Ok(EstablishingDeltaNeutral)
    }

    async fn on_establishing(&mut self) -> Result<ArbitrageState, EngineError> {
        let now = Utc::now();
        let long = self.ticker(self.long_role, now).await?;
        let hedge = self.ticker(self.hedge_role, now).await?;
        let size = self.config.strategy.base_position_size;

        let opportunity = self.analyzer.opportunity_for(
            Direction::SpotToFutures,
            &long,
            &hedge,
            now,
            None,
            TradePurpose::Entry,
        );

        let ctx = ValidationContext {
            balances: &self.balances,
            position: self.ledger.position(),
            cumulative_pnl: self.ledger.cumulative_pnl(),
            open_trades: &self.open_trades,
            now: Utc::now(),
        };
        let validation = self.validator.validate(&opportunity, size, &ctx);
        if !validation.valid {
            self.last_error = Some(format!("base hedge rejected: {}", validation.reason));
            self.events.emit(EngineEvent::ValidationRejected {
                reason: validation.reason,
            });
            return Ok(Closing);
        }

        info!(%size, long_ask = %long.ask_price, hedge_bid = %hedge.bid_price, "Establishing base hedge");
        let report = self
            .executor
            .execute_opportunity(&opportunity, size, &mut self.ledger, &self.events)
            .await?;
        self.finish_cycle(CycleKind::Establish, Some(&opportunity), &report);

        if !report.success {
            return Err(EngineError::LegFailure(report.error.unwrap_or_default()));
        }
        Ok(self.after_fill())
    }

    async fn on_monitoring(&mut self) -> Result<ArbitrageState, EngineError> {
        let check_interval = Duration::from_millis(self.config.strategy.min_check_interval_ms);
        let mut tick_pending = false;

        loop {
            if self.stop_requested {
                return Ok(Completing);
            }
            if let Some(role) = self.unhealthy.iter().next().copied() {
                self.last_error = Some(format!("{role} unhealthy"));
                return Ok(ErrorRecovery);
            }

            let next_check = self.last_analysis + check_interval;
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => self.detach(),
                },
                event = self.event_rx.recv() => {
                    let Some(event) = event else {
                        return Err(EngineError::InvariantViolation("exchange event channel closed".into()));
                    };
                    if self.apply_event(event)? == EventEffect::Tick {
                        if Instant::now() >= next_check {
                            return Ok(Analyzing);
                        }
                        tick_pending = true;
                    }
                }
                _ = sleep_until(next_check), if tick_pending => {
                    return Ok(Analyzing);
                }
                _ = self.heartbeat.tick() => {
                    if let Some(next) = self.on_heartbeat().await {
                        return Ok(next);
                    }
                }
            }
        }
    }

    /// Periodic drift and health check while monitoring.
    async fn on_heartbeat(&mut self) -> Option<ArbitrageState> {
        if !self.rebalancer.within_tolerance(self.ledger.position()) {
            info!(
                delta = %self.ledger.delta(),
                drift_pct = %self.rebalancer.drift_pct(self.ledger.position()),
                "Delta drift outside tolerance"
            );
            return Some(Rebalancing);
        }
        for role in self.legs() {
            if !self.exchanges.is_healthy(role).await {
                self.unhealthy.insert(role);
                self.last_error = Some(format!("{role} unhealthy"));
                return Some(ErrorRecovery);
            }
        }
        // Age-limit exits need evaluating even on a quiet feed.
        if !self.open_trades.is_empty() {
            return Some(Analyzing);
        }
        None
    }

    async fn on_analyzing(&mut self) -> Result<ArbitrageState, EngineError> {
        self.drain_events()?;
        self.last_analysis = Instant::now();

        let now = Utc::now();
        let staleness = self.config.strategy.staleness();
        let long = self.view.fresh(self.long_role, &self.symbol, now, staleness).cloned();
        let hedge = self.view.fresh(self.hedge_role, &self.symbol, now, staleness).cloned();
        let (Some(long), Some(hedge)) = (long, hedge) else {
            debug!("No fresh snapshot pair, skipping analysis");
            return Ok(Monitoring);
        };
        let basis = SpreadStats::basis_pct(&long, &hedge);

        let exit = self.open_trades.iter().enumerate().find_map(|(index, trade)| {
            self.analyzer
                .evaluate_exit(trade, &long, &hedge, now)
                .map(|opportunity| {
                    let quantity = trade.quantity.min(opportunity.max_quantity);
                    (index, opportunity, quantity)
                })
        });
        if let Some((index, opportunity, quantity)) = exit {
            self.stats.push(basis);
            return Ok(self.select(opportunity, quantity, Some(index)));
        }

        let entry = self.analyzer.analyze(&long, &hedge, &self.stats, now);
        self.stats.push(basis);
        let Some(opportunity) = entry else {
            return Ok(Monitoring);
        };

        let quantity = self.config.strategy.trade_quantity.min(opportunity.max_quantity);
        Ok(self.select(opportunity, quantity, None))
    }

    fn select(
        &mut self,
        opportunity: ArbitrageOpportunity,
        quantity: Decimal,
        trade_index: Option<usize>,
    ) -> ArbitrageState {
        if quantity <= Decimal::ZERO {
            debug!(direction = opportunity.direction.as_str(), "No size available at the touch");
            return Monitoring;
        }

        info!(
            direction = opportunity.direction.as_str(),
            spread_pct = %opportunity.spread_pct,
            confidence = %opportunity.confidence,
            %quantity,
            exit = opportunity.is_exit(),
            "Opportunity detected"
        );
        self.events.emit(EngineEvent::OpportunityDetected {
            direction: opportunity.direction,
            spread_pct: opportunity.spread_pct,
            confidence: opportunity.confidence,
            quantity,
            exit: opportunity.is_exit(),
        });
        self.pending = Some(PendingTrade {
            opportunity,
            quantity,
            trade_index,
        });
        Preparing
    }

    async fn on_preparing(&mut self) -> Result<ArbitrageState, EngineError> {
        let Some(roles) = self
            .pending
            .as_ref()
            .map(|p| [p.opportunity.buy_role, p.opportunity.sell_role])
        else {
            return Ok(Monitoring);
        };

        let mut balances = HashMap::new();
        for role in roles {
            match self.exchanges.get_balances(role).await {
                Ok(snapshot) => {
                    balances.insert(role, snapshot);
                }
                Err(e) => {
                    self.reject(format!("balance fetch failed for {role}: {e}"));
                    return Ok(Monitoring);
                }
            }
        }

        let Some(pending) = self.pending.as_ref() else {
            return Ok(Monitoring);
        };
        let ctx = ValidationContext {
            balances: &balances,
            position: self.ledger.position(),
            cumulative_pnl: self.ledger.cumulative_pnl(),
            open_trades: &self.open_trades,
            now: Utc::now(),
        };
        let validation = self
            .validator
            .validate(&pending.opportunity, pending.quantity, &ctx);
        self.balances.extend(balances);

        if !validation.valid {
            self.reject(validation.reason);
            return Ok(Monitoring);
        }
        Ok(Executing)
    }

    async fn on_executing(&mut self) -> Result<ArbitrageState, EngineError> {
        let Some(PendingTrade {
            opportunity,
            quantity,
            trade_index,
        }) = self.pending.take()
        else {
            return Ok(Monitoring);
        };

        let kind = if opportunity.is_exit() {
            CycleKind::Exit
        } else {
            CycleKind::Entry
        };
        let report = self
            .executor
            .execute_opportunity(&opportunity, quantity, &mut self.ledger, &self.events)
            .await?;

        match trade_index {
            Some(index) => {
                if let Some(trade) = self.open_trades.get_mut(index) {
                    trade.quantity -= report.hedged_qty;
                    if trade.quantity <= Decimal::ZERO {
                        let closed = self.open_trades.remove(index);
                        info!(direction = closed.direction.as_str(), "Trade closed");
                    }
                }
            }
            None if report.hedged_qty > Decimal::ZERO => {
                self.open_trades.push(OpenTrade {
                    direction: opportunity.direction,
                    quantity: report.hedged_qty,
                    entry_spread_pct: opportunity.spread_pct,
                    opened_at: Utc::now(),
                });
            }
            None => {}
        }
        self.finish_cycle(kind, Some(&opportunity), &report);

        if !report.success {
            return Err(EngineError::LegFailure(report.error.unwrap_or_default()));
        }
        self.recovery_attempts = 0;
        Ok(self.after_fill())
    }

    async fn on_rebalancing(&mut self) -> Result<ArbitrageState, EngineError> {
        self.drain_events()?;
        let target = self.target_leg_qty();
        let result = self
            .rebalancer
            .rebalance(target, &self.executor, &mut self.ledger, &self.events)
            .await?;
        if let Some(report) = &result.report {
            self.finish_cycle(CycleKind::Rebalance, None, report);
        }

        if !result.success {
            return Err(EngineError::LegFailure(format!(
                "delta {} still outside tolerance after rebalance",
                result.new_delta
            )));
        }
        self.recovery_attempts = 0;
        Ok(Monitoring)
    }

    async fn on_completing(&mut self) -> Result<ArbitrageState, EngineError> {
        self.drain_events()?;
        self.pending = None;
        self.open_trades.clear();

        if let Some(report) = self.executor.flatten(&mut self.ledger, &self.events).await? {
            self.finish_cycle(CycleKind::Flatten, None, &report);
            if !report.success {
                self.record_error(&EngineError::LegFailure(report.error.unwrap_or_default()));
            }
        }
        Ok(Closing)
    }

    async fn on_error_recovery(&mut self) -> Result<ArbitrageState, EngineError> {
        let max_attempts = self.config.strategy.max_recovery_attempts;
        loop {
            if self.stop_requested {
                return Ok(Closing);
            }
            self.recovery_attempts += 1;
            self.publish();
            if self.recovery_attempts > max_attempts {
                self.record_error(&EngineError::RetryBudgetExhausted(max_attempts));
                return Ok(Closing);
            }

            let exponent = (self.recovery_attempts - 1).min(10);
            let backoff = Duration::from_millis(self.config.strategy.recovery_backoff_ms.saturating_mul(1 << exponent));
            warn!(attempt = self.recovery_attempts, max_attempts, backoff_ms = backoff.as_millis() as u64, "Recovering");
            if self.pause(backoff).await {
                continue;
            }

            let mut recovered = true;
            for role in self.legs() {
                if let Err(e) = self.exchanges.check_health(role).await {
                    self.record_error(&e.into());
                    recovered = false;
                    break;
                }
            }
            if recovered {
                self.drain_events()?;
                self.unhealthy.clear();
                info!(attempt = self.recovery_attempts, "Recovered");
                return Ok(Monitoring);
            }
        }
    }

    async fn on_closing(&mut self) -> Result<ArbitrageState, EngineError> {
        if let Err(e) = self.drain_events() {
            self.record_error(&e);
        }

        if !self.ledger.position().is_flat() {
            match self.executor.flatten(&mut self.ledger, &self.events).await {
                Ok(Some(report)) => self.finish_cycle(CycleKind::Flatten, None, &report),
                Ok(None) => {}
                Err(e) => self.record_error(&e),
            }
        }

        let position = self.ledger.position().clone();
        if position.is_flat() {
            self.ledger.reset();
        } else {
            error!(long = %position.long_qty, hedge = %position.hedge_qty, "Residual position left after close");
            self.last_error = Some(format!(
                "residual position after close: {} {}, {} {}",
                position.long_role, position.long_qty, position.hedge_role, position.hedge_qty
            ));
        }

        self.pending = None;
        self.open_trades.clear();
        self.view.clear();
        self.stats.clear();
        self.unhealthy.clear();
        self.recovery_attempts = 0;
        Ok(Idle)
    }

    // ---- transitions ----

    fn advance(&mut self, to: ArbitrageState) {
        match self.state.transition(to) {
            Ok(from) => {
                self.events.emit(EngineEvent::StateTransition {
                    from,
                    to,
                    forced: false,
                });
                if to == Idle {
                    self.stop_requested = false;
                }
                // Acks go out after the status so callers observe the new state.
                self.publish();
                if from == Idle {
                    for ack in self.start_acks.drain(..) {
                        let _ = ack.send(to);
                    }
                }
                if to == Idle {
                    for ack in self.stop_acks.drain(..) {
                        let _ = ack.send(());
                    }
                }
            }
            Err(e) => {
                self.record_error(&e);
                self.force_close();
            }
        }
    }

    fn fail(&mut self, state: ArbitrageState, error: EngineError) {
        self.record_error(&error);
        if error.is_fatal() {
            self.force_close();
        } else if state.can_transition_to(ErrorRecovery) {
            self.advance(ErrorRecovery);
        } else if state.can_transition_to(Closing) {
            self.advance(Closing);
        } else {
            self.force_close();
        }
    }

    fn force_close(&mut self) {
        if let Some(from) = self.state.force_close() {
            self.pending = None;
            self.events.emit(EngineEvent::StateTransition {
                from,
                to: Closing,
                forced: true,
            });
            self.publish();
        }
    }

    fn record_error(&mut self, error: &EngineError) {
        let fatal = error.is_fatal();
        if fatal {
            error!(state = %self.state.current(), error = %error, "Fatal error");
        } else {
            warn!(state = %self.state.current(), error = %error, "Error");
        }
        self.last_error = Some(error.to_string());
        self.events.emit(EngineEvent::ErrorRecorded {
            error: error.to_string(),
            fatal,
        });
        self.publish();
    }

    fn reject(&mut self, reason: String) {
        debug!(%reason, "Opportunity rejected");
        self.pending = None;
        self.events.emit(EngineEvent::ValidationRejected { reason });
    }

    // ---- commands ----

    fn poll_commands(&mut self) {
        loop {
            match self.commands.try_recv() {
                Ok(command) => self.handle_command(command),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if !self.detached {
                        self.detach();
                    }
                    break;
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        let state = self.state.current();
        match command {
            Command::Start(ack) if state == Idle => self.start_acks.push(ack),
            Command::Start(ack) => {
                debug!(%state, "Start ignored, already running");
                let _ = ack.send(state);
            }
            Command::Stop(ack) if state == Idle && self.start_acks.is_empty() => {
                let _ = ack.send(());
            }
            Command::Stop(ack) => {
                self.stop_requested = true;
                self.stop_acks.push(ack);
            }
        }
    }

    /// Every handle is gone: wind down and let the loop exit.
    fn detach(&mut self) {
        self.detached = true;
        if self.state.current() != Idle {
            self.stop_requested = true;
        }
    }

    /// Sleep for `duration`, serving commands meanwhile. Returns true if a
    /// stop was requested.
    async fn pause(&mut self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return self.stop_requested,
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => self.detach(),
                    }
                    if self.stop_requested {
                        return true;
                    }
                }
            }
        }
    }

    // ---- market data and fills ----

    fn apply_event(&mut self, event: ExchangeEvent) -> Result<EventEffect, EngineError> {
        match event {
            ExchangeEvent::BookTicker(ticker) => {
                if ticker.symbol == self.symbol && self.is_leg(ticker.role) && self.view.update(ticker) {
                    return Ok(EventEffect::Tick);
                }
            }
            ExchangeEvent::OrderUpdate { role, update } => {
                if update.symbol == self.symbol && self.is_leg(role) {
                    if let Some(fill) = self.ledger.apply_update(role, &update)? {
                        info!(%role, order_id = %update.order_id, quantity = %fill.quantity, "Late fill applied");
                        let position = self.ledger.position();
                        if self.state.current() == Idle && !position.is_flat() {
                            error!(
                                %role,
                                order_id = %update.order_id,
                                long = %position.long_qty,
                                hedge = %position.hedge_qty,
                                "Late fill left a position while idle"
                            );
                            self.last_error = Some(format!(
                                "late fill on {role} order {} while idle: position not flat",
                                update.order_id
                            ));
                        }
                        self.publish();
                    }
                }
            }
            ExchangeEvent::Health { role, healthy, reason } => {
                if self.is_leg(role) {
                    if healthy {
                        self.unhealthy.remove(&role);
                    } else {
                        self.unhealthy.insert(role);
                    }
                    self.events.emit(EngineEvent::RoleHealthChanged { role, healthy, reason });
                }
            }
        }
        Ok(EventEffect::Other)
    }

    fn drain_events(&mut self) -> Result<(), EngineError> {
        while let Ok(event) = self.event_rx.try_recv() {
            self.apply_event(event)?;
        }
        Ok(())
    }

    /// Fresh snapshot for `role`, from the view or fetched from the venue.
    async fn ticker(&mut self, role: ExchangeRole, now: DateTime<Utc>) -> Result<BookTicker, EngineError> {
        let staleness = self.config.strategy.staleness();
        if let Some(ticker) = self.view.fresh(role, &self.symbol, now, staleness) {
            return Ok(ticker.clone());
        }
        match self.exchanges.get_book_ticker(role, &self.symbol, now, staleness).await? {
            Some(ticker) => {
                self.view.update(ticker.clone());
                Ok(ticker)
            }
            None => Err(EngineError::MarketDataUnavailable(role)),
        }
    }

    async fn refresh_balances(&mut self) -> Result<(), EngineError> {
        for role in self.legs() {
            let snapshot = self.exchanges.get_balances(role).await?;
            debug!(%role, assets = snapshot.balances.len(), "Balances fetched");
            self.balances.insert(role, snapshot);
        }
        Ok(())
    }

    // ---- bookkeeping ----

    fn legs(&self) -> [ExchangeRole; 2] {
        [self.long_role, self.hedge_role]
    }

    fn is_leg(&self, role: ExchangeRole) -> bool {
        role == self.long_role || role == self.hedge_role
    }

    /// Size both legs should hold: the base hedge plus open trades.
    fn target_leg_qty(&self) -> Decimal {
        self.open_trades
            .iter()
            .fold(self.config.strategy.base_position_size, |acc, trade| match trade.direction {
                Direction::SpotToFutures => acc + trade.quantity,
                Direction::FuturesToSpot => acc - trade.quantity,
            })
    }

    fn after_fill(&self) -> ArbitrageState {
        if self.rebalancer.within_tolerance(self.ledger.position()) {
            Monitoring
        } else {
            Rebalancing
        }
    }

    fn finish_cycle(&mut self, kind: CycleKind, opportunity: Option<&ArbitrageOpportunity>, report: &ExecutionReport) {
        self.cycles += 1;
        let outcome = if report.success {
            "filled"
        } else if !report.compensations.is_empty() {
            "compensated"
        } else {
            "failed"
        };

        self.events.emit(EngineEvent::ExecutionCompleted {
            cycle_id: self.cycles,
            kind,
            hedged_qty: report.hedged_qty,
            success: report.success,
        });
        self.records.emit(CycleRecord {
            strategy: self.events.strategy().to_string(),
            cycle_id: self.cycles,
            kind,
            direction: opportunity.map(|o| o.direction.as_str().to_string()),
            spread_pct: opportunity.map(|o| o.spread_pct),
            orders: serde_json::to_value(&report.legs).unwrap_or_default(),
            compensations: serde_json::to_value(&report.compensations).unwrap_or_default(),
            hedged_qty: report.hedged_qty,
            pnl: self.ledger.cumulative_pnl(),
            outcome: outcome.to_string(),
            started_at: report.started_at,
            finished_at: report.finished_at,
        });
        self.publish();
    }

    fn publish(&self) {
        let position = self.ledger.position().clone();
        self.status_tx.send_replace(CoordinatorStatus {
            strategy: self.events.strategy().to_string(),
            state: self.state.current(),
            state_since: self.state.entered_at(),
            transitions: self.state.transitions(),
            delta: position.delta(),
            position,
            cumulative_pnl: self.ledger.cumulative_pnl(),
            drawdown_pct: self.validator.drawdown().current_drawdown_pct(),
            session_mdd_pct: self.validator.drawdown().session_mdd_pct(),
            last_error: self.last_error.clone(),
            cycles: self.cycles,
            open_trades: self.open_trades.len(),
            recovery_attempts: self.recovery_attempts,
            updated_at: Utc::now(),
        });
    }
}
