//! Venue-agnostic client trait.
//!
//! Concrete venue adapters (REST signing, WebSocket parsing, symbol
//! translation) live outside the engine and implement this trait. The engine
//! only ever talks to a venue through it, bound to a logical role.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::types::{
    AccountKind, BalanceSnapshot, OrderId, OrderRequest, OrderResult, Quote, Symbol, VenueEvent,
};
use crate::error::ExchangeError;

/// Trait for exchange connections usable by the coordinator.
///
/// Implementations must be safe for concurrent use: several coordinators may
/// share one client through the `ExchangeManager`.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Venue name, for logs.
    fn venue(&self) -> &str;

    /// How the account on this venue holds exposure.
    fn account_kind(&self) -> AccountKind;

    /// Establish or verify connectivity.
    async fn connect(&self) -> Result<(), ExchangeError>;

    /// Place an order. Returns the venue's view of the order after submission;
    /// the role field of the result is filled in by the manager.
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResult, ExchangeError>;

    /// Cancel an open order and return its final state.
    async fn cancel_order(
        &self,
        symbol: &Symbol,
        order_id: &OrderId,
    ) -> Result<OrderResult, ExchangeError>;

    /// Fetch balances. Always a fresh request.
    async fn get_balances(&self) -> Result<BalanceSnapshot, ExchangeError>;

    /// Latest top-of-book snapshot, if the venue has one.
    async fn get_book_ticker(&self, symbol: &Symbol) -> Result<Option<Quote>, ExchangeError>;

    /// Stream top-of-book updates for `symbol` into `tx`.
    async fn subscribe_book_ticker(
        &self,
        symbol: &Symbol,
        tx: mpsc::Sender<VenueEvent>,
    ) -> Result<(), ExchangeError>;

    /// Stream order lifecycle updates for this account into `tx`.
    async fn subscribe_order_updates(&self, tx: mpsc::Sender<VenueEvent>) -> Result<(), ExchangeError>;
}
