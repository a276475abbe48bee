//! Latest known top of book per role.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use crate::exchange::{BookTicker, ExchangeRole, Symbol};

/// Latest book ticker per (role, symbol), updated only by push events.
#[derive(Debug, Default)]
pub struct MarketDataView {
    tickers: HashMap<(ExchangeRole, Symbol), BookTicker>,
}

impl MarketDataView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a snapshot unless an equal or newer one is already held.
    /// Returns whether the view changed.
    pub fn update(&mut self, ticker: BookTicker) -> bool {
        let key = (ticker.role, ticker.symbol.clone());
        match self.tickers.get(&key) {
            Some(existing) if existing.timestamp > ticker.timestamp => false,
            _ => {
                self.tickers.insert(key, ticker);
                true
            }
        }
    }

    /// Latest snapshot regardless of age.
    pub fn latest(&self, role: ExchangeRole, symbol: &Symbol) -> Option<&BookTicker> {
        self.tickers.get(&(role, symbol.clone()))
    }

    /// Latest snapshot if it is not older than `max_age` at `now`.
    pub fn fresh(
        &self,
        role: ExchangeRole,
        symbol: &Symbol,
        now: DateTime<Utc>,
        max_age: Duration,
    ) -> Option<&BookTicker> {
        self.latest(role, symbol).filter(|t| !t.is_stale(now, max_age))
    }

    pub fn clear(&mut self) {
        self.tickers.clear();
    }

    pub fn len(&self) -> usize {
        self.tickers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickers.is_empty()
    }
}
