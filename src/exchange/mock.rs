//! Mock venue for paper trading and tests.
//!
//! Fills at the touch price of the last quote, charges a taker fee, pushes
//! quotes and order updates to subscribers, and consumes a FIFO queue of
//! injected faults (one per order placement).
//!
//! Faults model venue misbehavior: rejections, slow or dropped calls,
//! partial fills, and orders that cannot be canceled but fill later.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use super::traits::ExchangeClient;
use super::types::*;
use crate::error::ExchangeError;
use crate::utils::decimal::{round_down_to_lot, safe_div};

/// Quantity precision of the simulated venue.
const LOT_SIZE: Decimal = dec!(0.00000001);

/// Fault applied to the next order placement.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Venue rejects the order.
    Reject(String),
    /// Call fails with the given error.
    Error(ExchangeError),
    /// Venue answers after the delay, then fills normally.
    Delay(Duration),
    /// Only this fraction of the quantity fills; the rest stays open.
    PartialFill(Decimal),
    /// Order rests on the book without filling.
    Rest,
    /// Connection drops before the order is accepted.
    Disconnect,
    /// Order rests and refuses cancels, then fills in full after the delay.
    LateFill(Duration),
}

/// Simulated account state.
#[derive(Debug, Default)]
pub struct MockVenueState {
    pub balances: HashMap<String, Decimal>,
    pub quotes: HashMap<Symbol, Quote>,
    /// Signed position per symbol for margin accounts (negative = short).
    pub positions: HashMap<Symbol, Decimal>,
    pub open_orders: HashMap<OrderId, OrderResult>,
    /// Open orders whose cancels fail until they fill
    pub stuck_orders: HashSet<OrderId>,
    pub total_fees: Decimal,
    pub order_count: u64,
}

/// Mock client that simulates a venue behind the `ExchangeClient` trait.
pub struct MockExchange {
    name: String,
    account: AccountKind,
    state: Arc<RwLock<MockVenueState>>,
    order_id_counter: AtomicU64,
    /// Trading fee rate (0.04% taker)
    fee_rate: Decimal,
    faults: Mutex<VecDeque<Fault>>,
    quote_subscribers: Mutex<Vec<(Symbol, mpsc::Sender<VenueEvent>)>>,
    order_subscribers: Arc<Mutex<Vec<mpsc::Sender<VenueEvent>>>>,
    connected: AtomicBool,
    reachable: AtomicBool,
}

impl MockExchange {
    /// Create a mock venue with an empty account.
    pub fn new(name: impl Into<String>, account: AccountKind) -> Self {
        Self {
            name: name.into(),
            account,
            state: Arc::new(RwLock::new(MockVenueState::default())),
            order_id_counter: AtomicU64::new(1),
            fee_rate: dec!(0.0004),
            faults: Mutex::new(VecDeque::new()),
            quote_subscribers: Mutex::new(Vec::new()),
            order_subscribers: Arc::new(Mutex::new(Vec::new())),
            connected: AtomicBool::new(true),
            reachable: AtomicBool::new(true),
        }
    }

    /// Override the taker fee rate.
    pub fn with_fee_rate(mut self, fee_rate: Decimal) -> Self {
        self.fee_rate = fee_rate;
        self
    }

    /// Credit an asset balance.
    pub async fn fund(&self, asset: &str, amount: Decimal) {
        let mut state = self.state.write().await;
        *state.balances.entry(asset.to_uppercase()).or_default() += amount;
    }

    /// Set the top of book and push it to subscribers.
    pub async fn set_quote(&self, symbol: &Symbol, bid: Decimal, ask: Decimal, qty: Decimal) {
        self.set_quote_at(symbol, bid, ask, qty, Utc::now()).await;
    }

    /// Set the top of book with an explicit timestamp.
    pub async fn set_quote_at(
        &self,
        symbol: &Symbol,
        bid: Decimal,
        ask: Decimal,
        qty: Decimal,
        timestamp: DateTime<Utc>,
    ) {
        let quote = Quote {
            symbol: symbol.clone(),
            bid_price: bid,
            ask_price: ask,
            bid_qty: qty,
            ask_qty: qty,
            timestamp,
        };
        self.state
            .write()
            .await
            .quotes
            .insert(symbol.clone(), quote.clone());

        let subscribers = self.quote_subscribers.lock().unwrap_or_else(|e| e.into_inner());
        for (subscribed, tx) in subscribers.iter() {
            if subscribed == symbol {
                let _ = tx.try_send(VenueEvent::Quote(quote.clone()));
            }
        }
    }

    /// Queue a fault for a future order placement.
    pub fn inject(&self, fault: Fault) {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(fault);
    }

    /// Drop every queued fault.
    pub fn clear_faults(&self) {
        self.faults.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Drop the connection and notify subscribers.
    pub fn disconnect(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        warn!(venue = %self.name, %reason, "Mock venue disconnected");
        self.broadcast(VenueEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    /// Control whether `connect()` succeeds.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub async fn balance(&self, asset: &str) -> Decimal {
        self.state
            .read()
            .await
            .balances
            .get(&asset.to_uppercase())
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Signed margin position for `symbol`.
    pub async fn position(&self, symbol: &Symbol) -> Decimal {
        self.state
            .read()
            .await
            .positions
            .get(symbol)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub async fn order_count(&self) -> u64 {
        self.state.read().await.order_count
    }

    fn next_order_id(&self) -> OrderId {
        format!("{}-{}", self.name, self.order_id_counter.fetch_add(1, Ordering::SeqCst))
    }

    fn next_fault(&self) -> Option<Fault> {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    fn role_tag(&self) -> ExchangeRole {
        match self.account {
            AccountKind::Cash => ExchangeRole::Spot,
            AccountKind::Margin => ExchangeRole::Futures,
        }
    }

    fn ensure_connected(&self) -> Result<(), ExchangeError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ExchangeError::Disconnected(format!("{} not connected", self.name)))
        }
    }

    fn broadcast(&self, event: VenueEvent) {
        for (_, tx) in self
            .quote_subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
        {
            let _ = tx.try_send(event.clone());
        }
        for tx in self
            .order_subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
        {
            let _ = tx.try_send(event.clone());
        }
    }

    fn publish_order(&self, result: &OrderResult) {
        publish_order(&self.order_subscribers, result);
    }

    /// Fill the rest of a stuck order at the touch once `delay` has passed.
    fn spawn_late_fill(&self, order_id: OrderId, delay: Duration) {
        let state = self.state.clone();
        let subscribers = self.order_subscribers.clone();
        let name = self.name.clone();
        let (account, fee_rate) = (self.account, self.fee_rate);

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut guard = state.write().await;
            guard.stuck_orders.remove(&order_id);
            let Some(mut order) = guard.open_orders.remove(&order_id) else {
                return;
            };
            let Some(quote) = guard.quotes.get(&order.symbol).cloned() else {
                warn!(venue = %name, %order_id, "No quote for late fill, order dropped");
                return;
            };
            let touch = match order.side {
                OrderSide::Buy => quote.ask_price,
                OrderSide::Sell => quote.bid_price,
            };
            let remaining = order.requested_qty - order.filled_qty;

            match settle(account, fee_rate, &mut guard, &order.symbol, order.side, remaining, touch) {
                Ok(fee) => {
                    order.avg_price = safe_div(order.avg_price * order.filled_qty + touch * remaining, order.requested_qty);
                    order.filled_qty = order.requested_qty;
                    order.fee += fee;
                    order.status = OrderStatus::Filled;
                }
                Err(e) => {
                    warn!(venue = %name, %order_id, error = %e, "Late fill failed, order canceled");
                    order.status = OrderStatus::Canceled;
                }
            }
            order.timestamp = Utc::now();
            drop(guard);

            info!(venue = %name, %order_id, filled = %order.filled_qty, price = %touch, "Mock order filled late");
            publish_order(&subscribers, &order);
        });
    }
}

fn publish_order(subscribers: &Mutex<Vec<mpsc::Sender<VenueEvent>>>, result: &OrderResult) {
    let update = VenueEvent::OrderUpdate(OrderUpdate::from(result));
    for tx in subscribers.lock().unwrap_or_else(|e| e.into_inner()).iter() {
        let _ = tx.try_send(update.clone());
    }
}

/// Apply a fill to balances. Fails without side effects if funds are short.
fn settle(
    account: AccountKind,
    fee_rate: Decimal,
    state: &mut MockVenueState,
    symbol: &Symbol,
    side: OrderSide,
    qty: Decimal,
    price: Decimal,
) -> Result<Decimal, ExchangeError> {
    let notional = qty * price;
    let fee = notional * fee_rate;
    let quote_free = state.balances.get(&symbol.quote).copied().unwrap_or(Decimal::ZERO);

    match (account, side) {
        (AccountKind::Cash, OrderSide::Buy) => {
            if quote_free < notional + fee {
                return Err(ExchangeError::InsufficientBalance {
                    asset: symbol.quote.clone(),
                    required: notional + fee,
                    available: quote_free,
                });
            }
            *state.balances.entry(symbol.quote.clone()).or_default() -= notional + fee;
            *state.balances.entry(symbol.base.clone()).or_default() += qty;
        }
        (AccountKind::Cash, OrderSide::Sell) => {
            let base_free = state.balances.get(&symbol.base).copied().unwrap_or(Decimal::ZERO);
            if base_free < qty {
                return Err(ExchangeError::InsufficientBalance {
                    asset: symbol.base.clone(),
                    required: qty,
                    available: base_free,
                });
            }
            *state.balances.entry(symbol.base.clone()).or_default() -= qty;
            *state.balances.entry(symbol.quote.clone()).or_default() += notional - fee;
        }
        (AccountKind::Margin, side) => {
            if quote_free < fee {
                return Err(ExchangeError::InsufficientBalance {
                    asset: symbol.quote.clone(),
                    required: fee,
                    available: quote_free,
                });
            }
            let position = state.positions.entry(symbol.clone()).or_default();
            match side {
                OrderSide::Buy => *position += qty,
                OrderSide::Sell => *position -= qty,
            }
            *state.balances.entry(symbol.quote.clone()).or_default() -= fee;
        }
    }

    state.total_fees += fee;
    Ok(fee)
}

#[async_trait]
impl ExchangeClient for MockExchange {
    fn venue(&self) -> &str {
        &self.name
    }

    fn account_kind(&self) -> AccountKind {
        self.account
    }

    async fn connect(&self) -> Result<(), ExchangeError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(ExchangeError::Disconnected(format!("{} unreachable", self.name)));
        }
        let was_connected = self.connected.swap(true, Ordering::SeqCst);
        if !was_connected {
            info!(venue = %self.name, "Mock venue reconnected");
            self.broadcast(VenueEvent::Connected);
        }
        Ok(())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResult, ExchangeError> {
        self.ensure_connected()?;

        let mut fill_ratio = Decimal::ONE;
        let mut rest = false;
        let mut late_fill = None;
        match self.next_fault() {
            Some(Fault::Reject(reason)) => return Err(ExchangeError::Rejected(reason)),
            Some(Fault::Error(error)) => return Err(error),
            Some(Fault::Disconnect) => {
                self.disconnect("injected disconnect");
                return Err(ExchangeError::Disconnected(format!("{} dropped", self.name)));
            }
            Some(Fault::Delay(delay)) => tokio::time::sleep(delay).await,
            Some(Fault::PartialFill(ratio)) => fill_ratio = ratio,
            Some(Fault::Rest) => rest = true,
            Some(Fault::LateFill(delay)) => {
                rest = true;
                late_fill = Some(delay);
            }
            None => {}
        }

        let mut state = self.state.write().await;
        let quote = state
            .quotes
            .get(&request.symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::Rejected(format!("no market for {}", request.symbol)))?;

        let touch = match request.side {
            OrderSide::Buy => quote.ask_price,
            OrderSide::Sell => quote.bid_price,
        };
        let marketable = match (request.order_type, request.price) {
            (OrderType::Limit, Some(limit)) => match request.side {
                OrderSide::Buy => limit >= touch,
                OrderSide::Sell => limit <= touch,
            },
            _ => true,
        };

        let fill_qty = if rest || !marketable {
            Decimal::ZERO
        } else {
            round_down_to_lot(request.quantity * fill_ratio, LOT_SIZE)
        };

        let fee = if fill_qty > Decimal::ZERO {
            settle(self.account, self.fee_rate, &mut state, &request.symbol, request.side, fill_qty, touch)?
        } else {
            Decimal::ZERO
        };

        let status = if fill_qty == request.quantity {
            OrderStatus::Filled
        } else if fill_qty > Decimal::ZERO {
            OrderStatus::PartiallyFilled
        } else {
            OrderStatus::New
        };

        let result = OrderResult {
            order_id: self.next_order_id(),
            role: self.role_tag(),
            symbol: request.symbol.clone(),
            side: request.side,
            status,
            requested_qty: request.quantity,
            filled_qty: fill_qty,
            avg_price: if fill_qty > Decimal::ZERO { touch } else { Decimal::ZERO },
            fee,
            timestamp: Utc::now(),
        };

        state.order_count += 1;
        if status.is_open() {
            state.open_orders.insert(result.order_id.clone(), result.clone());
        }
        if late_fill.is_some() {
            state.stuck_orders.insert(result.order_id.clone());
        }
        drop(state);
        if let Some(delay) = late_fill {
            self.spawn_late_fill(result.order_id.clone(), delay);
        }

        info!(
            venue = %self.name,
            order_id = %result.order_id,
            symbol = %result.symbol,
            side = ?result.side,
            quantity = %request.quantity,
            filled = %result.filled_qty,
            price = %touch,
            fee = %fee,
            "Mock order executed"
        );

        self.publish_order(&result);
        Ok(result)
    }

    async fn cancel_order(
        &self,
        symbol: &Symbol,
        order_id: &OrderId,
    ) -> Result<OrderResult, ExchangeError> {
        self.ensure_connected()?;
        let mut state = self.state.write().await;
        if state.stuck_orders.contains(order_id) {
            return Err(ExchangeError::Transient(format!("cancel pending for {order_id}")));
        }
        let mut order = state
            .open_orders
            .remove(order_id)
            .ok_or_else(|| ExchangeError::OrderNotFound(order_id.clone()))?;
        drop(state);

        order.status = OrderStatus::Canceled;
        order.timestamp = Utc::now();
        debug!(venue = %self.name, %symbol, %order_id, filled = %order.filled_qty, "Mock order canceled");

        self.publish_order(&order);
        Ok(order)
    }

    async fn get_balances(&self) -> Result<BalanceSnapshot, ExchangeError> {
        self.ensure_connected()?;
        let state = self.state.read().await;
        let balances = state
            .balances
            .iter()
            .map(|(asset, free)| {
                (
                    asset.clone(),
                    AssetBalance {
                        free: *free,
                        locked: Decimal::ZERO,
                    },
                )
            })
            .collect();

        Ok(BalanceSnapshot {
            role: self.role_tag(),
            account: self.account,
            balances,
            timestamp: Utc::now(),
        })
    }

    async fn get_book_ticker(&self, symbol: &Symbol) -> Result<Option<Quote>, ExchangeError> {
        self.ensure_connected()?;
        Ok(self.state.read().await.quotes.get(symbol).cloned())
    }

    async fn subscribe_book_ticker(
        &self,
        symbol: &Symbol,
        tx: mpsc::Sender<VenueEvent>,
    ) -> Result<(), ExchangeError> {
        self.ensure_connected()?;
        self.quote_subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((symbol.clone(), tx));
        debug!(venue = %self.name, %symbol, "Subscribed to book ticker");
        Ok(())
    }

    async fn subscribe_order_updates(&self, tx: mpsc::Sender<VenueEvent>) -> Result<(), ExchangeError> {
        self.ensure_connected()?;
        self.order_subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        Ok(())
    }
}
