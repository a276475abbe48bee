//! Venue-neutral types shared by the exchange layer and the strategy core.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Base/quote instrument identifier.
///
/// Venue-specific symbol strings are the client's concern; the core only
/// ever sees this normalized form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol {
    pub base: String,
    pub quote: String,
}

impl Symbol {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into().to_uppercase(),
            quote: quote.into().to_uppercase(),
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

/// Logical exchange slot a strategy trades through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeRole {
    Spot,
    Futures,
    Target,
}

impl ExchangeRole {
    pub const ALL: [ExchangeRole; 3] = [ExchangeRole::Spot, ExchangeRole::Futures, ExchangeRole::Target];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeRole::Spot => "spot",
            ExchangeRole::Futures => "futures",
            ExchangeRole::Target => "target",
        }
    }
}

impl fmt::Display for ExchangeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a venue account holds exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    /// Holds base and quote assets outright.
    Cash,
    /// Quote collateral, positions margined at leverage.
    Margin,
}

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    Market,
}

/// Order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Whether the order can still receive fills.
    pub fn is_open(&self) -> bool {
        matches!(self, OrderStatus::New | OrderStatus::PartiallyFilled)
    }
}

/// Exchange-assigned order identifier.
pub type OrderId = String;

/// Top-of-book quote as reported by a venue, before role tagging.
#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    pub symbol: Symbol,
    pub bid_price: Decimal,
    pub ask_price: Decimal,
    pub bid_qty: Decimal,
    pub ask_qty: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Best bid/ask for one role, produced from push events.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookTicker {
    pub role: ExchangeRole,
    pub symbol: Symbol,
    pub bid_price: Decimal,
    pub ask_price: Decimal,
    pub bid_qty: Decimal,
    pub ask_qty: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl BookTicker {
    pub fn from_quote(role: ExchangeRole, quote: Quote) -> Self {
        Self {
            role,
            symbol: quote.symbol,
            bid_price: quote.bid_price,
            ask_price: quote.ask_price,
            bid_qty: quote.bid_qty,
            ask_qty: quote.ask_qty,
            timestamp: quote.timestamp,
        }
    }

    /// Age of the snapshot at `now`. Future-dated snapshots count as age zero.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.timestamp).max(Duration::zero())
    }

    /// A snapshot older than `max_age` must not drive a trading decision.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        self.age(now) > max_age
    }

    pub fn mid_price(&self) -> Decimal {
        (self.bid_price + self.ask_price) / Decimal::TWO
    }
}

/// One leg of a multi-venue trade. `price == None` means market order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderSpec {
    pub role: ExchangeRole,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
}

impl OrderSpec {
    pub fn market(role: ExchangeRole, side: OrderSide, quantity: Decimal) -> Self {
        Self {
            role,
            side,
            quantity,
            price: None,
        }
    }

    pub fn limit(role: ExchangeRole, side: OrderSide, quantity: Decimal, price: Decimal) -> Self {
        Self {
            role,
            side,
            quantity,
            price: Some(price),
        }
    }

    pub fn order_type(&self) -> OrderType {
        if self.price.is_some() {
            OrderType::Limit
        } else {
            OrderType::Market
        }
    }
}

/// Order request as handed to a venue client.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
}

/// Order outcome reported by the venue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderResult {
    pub order_id: OrderId,
    pub role: ExchangeRole,
    pub symbol: Symbol,
    pub side: OrderSide,
    pub status: OrderStatus,
    pub requested_qty: Decimal,
    pub filled_qty: Decimal,
    pub avg_price: Decimal,
    pub fee: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl OrderResult {
    /// Filled share of the requested quantity (0..1).
    pub fn fill_ratio(&self) -> Decimal {
        if self.requested_qty == Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.filled_qty / self.requested_qty
    }
}

/// Push update for an order's lifecycle. `filled_qty` is cumulative.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderUpdate {
    pub order_id: OrderId,
    pub symbol: Symbol,
    pub side: OrderSide,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    pub avg_price: Decimal,
    pub fee: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl From<&OrderResult> for OrderUpdate {
    fn from(result: &OrderResult) -> Self {
        Self {
            order_id: result.order_id.clone(),
            symbol: result.symbol.clone(),
            side: result.side,
            status: result.status,
            filled_qty: result.filled_qty,
            avg_price: result.avg_price,
            fee: result.fee,
            timestamp: result.timestamp,
        }
    }
}

/// Balance of a single asset.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct AssetBalance {
    pub free: Decimal,
    pub locked: Decimal,
}

/// Point-in-time account balances. Never cached.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceSnapshot {
    pub role: ExchangeRole,
    pub account: AccountKind,
    pub balances: HashMap<String, AssetBalance>,
    pub timestamp: DateTime<Utc>,
}

impl BalanceSnapshot {
    pub fn free(&self, asset: &str) -> Decimal {
        self.balances
            .get(asset)
            .map(|b| b.free)
            .unwrap_or(Decimal::ZERO)
    }
}

/// Push events emitted by a venue client, not yet tagged with a role.
#[derive(Debug, Clone)]
pub enum VenueEvent {
    Quote(Quote),
    OrderUpdate(OrderUpdate),
    Connected,
    Disconnected { reason: String },
}

/// Role-tagged events delivered to a coordinator.
#[derive(Debug, Clone)]
pub enum ExchangeEvent {
    BookTicker(BookTicker),
    OrderUpdate {
        role: ExchangeRole,
        update: OrderUpdate,
    },
    Health {
        role: ExchangeRole,
        healthy: bool,
        reason: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ticker(age_ms: i64) -> BookTicker {
        BookTicker {
            role: ExchangeRole::Spot,
            symbol: Symbol::new("btc", "usdt"),
            bid_price: dec!(99.9),
            ask_price: dec!(100.1),
            bid_qty: dec!(2),
            ask_qty: dec!(3),
            timestamp: Utc::now() - Duration::milliseconds(age_ms),
        }
    }

    #[test]
    fn test_symbol_normalized() {
        let symbol = Symbol::new("btc", "usdt");
        assert_eq!(symbol.to_string(), "BTC/USDT");
    }

    #[test]
    fn test_ticker_staleness() {
        let now = Utc::now();
        assert!(!ticker(100).is_stale(now, Duration::seconds(5)));
        assert!(ticker(6_000).is_stale(now, Duration::seconds(5)));
        assert_eq!(ticker(0).mid_price(), dec!(100));
    }

    #[test]
    fn test_order_spec_type() {
        let market = OrderSpec::market(ExchangeRole::Spot, OrderSide::Buy, dec!(1));
        let limit = OrderSpec::limit(ExchangeRole::Futures, OrderSide::Sell, dec!(1), dec!(100));
        assert_eq!(market.order_type(), OrderType::Market);
        assert_eq!(limit.order_type(), OrderType::Limit);
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
    }

    #[test]
    fn test_fill_ratio() {
        let result = OrderResult {
            order_id: "1".to_string(),
            role: ExchangeRole::Spot,
            symbol: Symbol::new("BTC", "USDT"),
            side: OrderSide::Buy,
            status: OrderStatus::PartiallyFilled,
            requested_qty: dec!(2),
            filled_qty: dec!(1.5),
            avg_price: dec!(100),
            fee: Decimal::ZERO,
            timestamp: Utc::now(),
        };
        assert_eq!(result.fill_ratio(), dec!(0.75));
    }
}
