//! Role-keyed access to exchange clients.
//!
//! The manager owns one client handle per logical role, retries transient
//! failures with bounded exponential backoff, tracks per-role health and
//! latency, and forwards push events tagged with their role. It is shared by
//! every coordinator through an `Arc` and is safe for concurrent use.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use super::traits::ExchangeClient;
use super::types::*;
use crate::config::ExchangeConfig;
use crate::error::ExchangeError;

const VENUE_CHANNEL_CAPACITY: usize = 1024;
const LATENCY_EWMA_ALPHA: f64 = 0.2;

/// Per-role call statistics.
#[derive(Debug, Clone, Serialize)]
pub struct RoleMetrics {
    pub calls: u64,
    pub errors: u64,
    pub consecutive_errors: u32,
    pub last_latency_ms: u64,
    pub avg_latency_ms: f64,
    pub healthy: bool,
    pub last_error: Option<String>,
    pub last_call: Option<DateTime<Utc>>,
}

impl Default for RoleMetrics {
    fn default() -> Self {
        Self {
            calls: 0,
            errors: 0,
            consecutive_errors: 0,
            last_latency_ms: 0,
            avg_latency_ms: 0.0,
            healthy: true,
            last_error: None,
            last_call: None,
        }
    }
}

impl RoleMetrics {
    fn record<T>(&mut self, latency: Duration, result: &Result<T, ExchangeError>) {
        let latency_ms = latency.as_millis() as u64;
        self.calls += 1;
        self.last_latency_ms = latency_ms;
        self.avg_latency_ms = if self.calls == 1 {
            latency_ms as f64
        } else {
            LATENCY_EWMA_ALPHA * latency_ms as f64 + (1.0 - LATENCY_EWMA_ALPHA) * self.avg_latency_ms
        };
        self.last_call = Some(Utc::now());

        match result {
            Ok(_) => self.consecutive_errors = 0,
            Err(e) => {
                self.errors += 1;
                self.consecutive_errors += 1;
                self.last_error = Some(e.to_string());
            }
        }
    }
}

struct RoleHandle {
    client: Arc<dyn ExchangeClient>,
    metrics: RwLock<RoleMetrics>,
}

/// Uniform order, balance and market-data calls keyed by role.
pub struct ExchangeManager {
    roles: HashMap<ExchangeRole, Arc<RoleHandle>>,
    config: ExchangeConfig,
    /// Coordinator channels that receive health changes.
    listeners: Arc<Mutex<Vec<mpsc::Sender<ExchangeEvent>>>>,
}

impl ExchangeManager {
    pub fn new(config: ExchangeConfig) -> Self {
        Self {
            roles: HashMap::new(),
            config,
            listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Bind a client to a role. Roles are fixed once the manager is shared.
    pub fn with_role(mut self, role: ExchangeRole, client: Arc<dyn ExchangeClient>) -> Self {
        info!(%role, venue = client.venue(), "Bound exchange role");
        self.roles.insert(
            role,
            Arc::new(RoleHandle {
                client,
                metrics: RwLock::new(RoleMetrics::default()),
            }),
        );
        self
    }

    pub fn roles(&self) -> Vec<ExchangeRole> {
        ExchangeRole::ALL
            .into_iter()
            .filter(|r| self.roles.contains_key(r))
            .collect()
    }

    fn handle(&self, role: ExchangeRole) -> Result<&Arc<RoleHandle>, ExchangeError> {
        self.roles.get(&role).ok_or(ExchangeError::UnknownRole(role))
    }

    pub fn account_kind(&self, role: ExchangeRole) -> Result<AccountKind, ExchangeError> {
        Ok(self.handle(role)?.client.account_kind())
    }

    pub async fn role_metrics(&self, role: ExchangeRole) -> Result<RoleMetrics, ExchangeError> {
        Ok(self.handle(role)?.metrics.read().await.clone())
    }

    pub async fn is_healthy(&self, role: ExchangeRole) -> bool {
        match self.handle(role) {
            Ok(handle) => handle.metrics.read().await.healthy,
            Err(_) => false,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .base_backoff_ms
            .saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
        Duration::from_millis(exp.min(self.config.max_backoff_ms))
    }

    /// Run a client call with metrics and bounded retry.
    async fn call<T, F, Fut>(
        &self,
        role: ExchangeRole,
        operation: &'static str,
        mut f: F,
    ) -> Result<T, ExchangeError>
    where
        F: FnMut(Arc<dyn ExchangeClient>) -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let handle = self.handle(role)?.clone();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let started = Instant::now();
            let result = f(handle.client.clone()).await;
            let latency = started.elapsed();
            handle.metrics.write().await.record(latency, &result);

            match result {
                Ok(value) => {
                    debug!(%role, operation, latency_ms = latency.as_millis() as u64, "Exchange call ok");
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < self.config.max_attempts => {
                    let delay = match &e {
                        ExchangeError::RateLimited { retry_after_ms } => {
                            Duration::from_millis(*retry_after_ms).max(self.backoff(attempt))
                        }
                        _ => self.backoff(attempt),
                    };
                    warn!(
                        %role,
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying exchange call"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(%role, operation, attempt, error = %e, "Exchange call failed");
                    if e.is_connection_loss() {
                        self.set_health(role, &handle, false, Some(e.to_string())).await;
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn set_health(
        &self,
        role: ExchangeRole,
        handle: &RoleHandle,
        healthy: bool,
        reason: Option<String>,
    ) {
        update_health(role, handle, &self.listeners, healthy, reason).await;
    }

    /// Place a market order for `quantity` base units.
    #[instrument(skip(self))]
    pub async fn place_market_order(
        &self,
        role: ExchangeRole,
        symbol: &Symbol,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<OrderResult, ExchangeError> {
        self.place(role, symbol, &OrderSpec::market(role, side, quantity)).await
    }

    #[instrument(skip(self))]
    pub async fn place_limit_order(
        &self,
        role: ExchangeRole,
        symbol: &Symbol,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<OrderResult, ExchangeError> {
        self.place(role, symbol, &OrderSpec::limit(role, side, quantity, price)).await
    }

    /// Place the order described by `spec` on `role`.
    pub async fn place(
        &self,
        role: ExchangeRole,
        symbol: &Symbol,
        spec: &OrderSpec,
    ) -> Result<OrderResult, ExchangeError> {
        let request = OrderRequest {
            symbol: symbol.clone(),
            side: spec.side,
            order_type: spec.order_type(),
            quantity: spec.quantity,
            price: spec.price,
        };

        let mut result = self
            .call(role, "place_order", move |client| {
                let request = request.clone();
                async move { client.place_order(&request).await }
            })
            .await?;
        result.role = role;
        Ok(result)
    }

    #[instrument(skip(self))]
    pub async fn cancel_order(
        &self,
        role: ExchangeRole,
        symbol: &Symbol,
        order_id: &OrderId,
    ) -> Result<OrderResult, ExchangeError> {
        let symbol = symbol.clone();
        let order_id = order_id.clone();
        let mut result = self
            .call(role, "cancel_order", move |client| {
                let symbol = symbol.clone();
                let order_id = order_id.clone();
                async move { client.cancel_order(&symbol, &order_id).await }
            })
            .await?;
        result.role = role;
        Ok(result)
    }

    /// Fresh balance fetch. Never cached.
    #[instrument(skip(self))]
    pub async fn get_balances(&self, role: ExchangeRole) -> Result<BalanceSnapshot, ExchangeError> {
        let mut snapshot = self
            .call(role, "get_balances", |client| async move { client.get_balances().await })
            .await?;
        snapshot.role = role;
        Ok(snapshot)
    }

    /// Fresh top-of-book fetch; `None` when the venue has no data or it is
    /// older than `max_age` at `now`. The bound belongs to the calling strategy.
    pub async fn get_book_ticker(
        &self,
        role: ExchangeRole,
        symbol: &Symbol,
        now: DateTime<Utc>,
        max_age: chrono::Duration,
    ) -> Result<Option<BookTicker>, ExchangeError> {
        let symbol = symbol.clone();
        let quote = self
            .call(role, "get_book_ticker", move |client| {
                let symbol = symbol.clone();
                async move { client.get_book_ticker(&symbol).await }
            })
            .await?;

        Ok(quote
            .map(|q| BookTicker::from_quote(role, q))
            .filter(|t| !t.is_stale(now, max_age)))
    }

    /// Reconnect or ping the role and restore its health on success.
    #[instrument(skip(self))]
    pub async fn check_health(&self, role: ExchangeRole) -> Result<(), ExchangeError> {
        let handle = self.handle(role)?.clone();
        let result = self
            .call(role, "connect", |client| async move { client.connect().await })
            .await;
        match result {
            Ok(()) => {
                self.set_health(role, &handle, true, None).await;
                Ok(())
            }
            Err(e) => {
                self.set_health(role, &handle, false, Some(e.to_string())).await;
                Err(e)
            }
        }
    }

    /// Stream role-tagged book tickers for `symbol` into `tx`.
    pub async fn subscribe_book_ticker(
        &self,
        role: ExchangeRole,
        symbol: &Symbol,
        tx: mpsc::Sender<ExchangeEvent>,
    ) -> Result<(), ExchangeError> {
        let handle = self.handle(role)?.clone();
        let (venue_tx, venue_rx) = mpsc::channel(VENUE_CHANNEL_CAPACITY);
        handle.client.subscribe_book_ticker(symbol, venue_tx).await?;
        self.register_listener(&tx).await;

        tokio::spawn(forward_events(role, handle, venue_rx, tx, self.listeners.clone()));
        info!(%role, %symbol, "Subscribed to book ticker");
        Ok(())
    }

    /// Stream role-tagged order updates into `tx`.
    pub async fn subscribe_order_updates(
        &self,
        role: ExchangeRole,
        tx: mpsc::Sender<ExchangeEvent>,
    ) -> Result<(), ExchangeError> {
        let handle = self.handle(role)?.clone();
        let (venue_tx, venue_rx) = mpsc::channel(VENUE_CHANNEL_CAPACITY);
        handle.client.subscribe_order_updates(venue_tx).await?;
        self.register_listener(&tx).await;

        tokio::spawn(forward_events(role, handle, venue_rx, tx, self.listeners.clone()));
        info!(%role, "Subscribed to order updates");
        Ok(())
    }

    async fn register_listener(&self, tx: &mpsc::Sender<ExchangeEvent>) {
        let mut listeners = self.listeners.lock().await;
        listeners.retain(|l| !l.is_closed());
        if !listeners.iter().any(|l| l.same_channel(tx)) {
            listeners.push(tx.clone());
        }
    }
}

/// Flip the role's health flag and notify listeners if it changed.
async fn update_health(
    role: ExchangeRole,
    handle: &RoleHandle,
    listeners: &Mutex<Vec<mpsc::Sender<ExchangeEvent>>>,
    healthy: bool,
    reason: Option<String>,
) {
    {
        let mut metrics = handle.metrics.write().await;
        if metrics.healthy == healthy {
            return;
        }
        metrics.healthy = healthy;
    }

    if healthy {
        info!(%role, "Role healthy");
    } else {
        warn!(%role, reason = reason.as_deref().unwrap_or(""), "Role unhealthy");
    }
    let listeners = listeners.lock().await;
    for tx in listeners.iter() {
        let _ = tx.try_send(ExchangeEvent::Health {
            role,
            healthy,
            reason: reason.clone(),
        });
    }
}

/// Tag venue events with their role and pass them on.
///
/// Book tickers are dropped when the receiver is full (a newer one will
/// follow); order updates and health changes are always delivered.
async fn forward_events(
    role: ExchangeRole,
    handle: Arc<RoleHandle>,
    mut venue_rx: mpsc::Receiver<VenueEvent>,
    tx: mpsc::Sender<ExchangeEvent>,
    listeners: Arc<Mutex<Vec<mpsc::Sender<ExchangeEvent>>>>,
) {
    while let Some(event) = venue_rx.recv().await {
        let delivered = match event {
            VenueEvent::Quote(quote) => {
                match tx.try_send(ExchangeEvent::BookTicker(BookTicker::from_quote(role, quote))) {
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(%role, "Dropped book ticker, receiver full");
                        true
                    }
                    Ok(()) => true,
                }
            }
            VenueEvent::OrderUpdate(update) => tx
                .send(ExchangeEvent::OrderUpdate { role, update })
                .await
                .is_ok(),
            VenueEvent::Connected => {
                update_health(role, &handle, &listeners, true, None).await;
                !tx.is_closed()
            }
            VenueEvent::Disconnected { reason } => {
                update_health(role, &handle, &listeners, false, Some(reason)).await;
                !tx.is_closed()
            }
        };

        if !delivered {
            debug!(%role, "Event receiver closed, stopping forwarder");
            break;
        }
    }
}
