//! Venue gateway boundary.
//!
//! Everything the engine needs from a venue:
//! - Market and trigger order submission, cancellation
//! - Fresh position, open order, and balance queries
//! - Exact order lookup plus recent history for broad scans
//! - Best bid/ask
//!
//! Implementations own signing, transport, and id formats. A lookup that
//! finds nothing returns `Ok(None)`, not an error.

use super::types::*;
use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

/// Errors reported by a venue gateway.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum VenueError {
    #[error("venue request timed out: {operation}")]
    Timeout { operation: String },

    #[error("venue unavailable: {0}")]
    Unavailable(String),

    #[error("order rejected: {reason}")]
    Rejected { reason: String },

    #[error("insufficient balance on account {account}")]
    InsufficientBalance { account: AccountId },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown market {0}")]
    UnknownMarket(MarketId),
}

impl VenueError {
    /// Timeouts and outages may succeed on retry; rejections will not.
    pub fn is_transient(&self) -> bool {
        matches!(self, VenueError::Timeout { .. } | VenueError::Unavailable(_))
    }
}

/// Operations a trading venue must expose.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VenueGateway: Send + Sync {
    /// Submit a market order.
    async fn submit_market_order(
        &self,
        account: AccountId,
        market: MarketId,
        side: Side,
        quantity: Decimal,
    ) -> Result<OrderHandle, VenueError>;

    /// Submit a reduce-only stop-loss or take-profit trigger order.
    async fn submit_protective_order(
        &self,
        request: &ProtectiveOrderRequest,
    ) -> Result<OrderHandle, VenueError>;

    /// Cancel an order. `Ok(false)` when it was no longer cancellable.
    async fn cancel_order(
        &self,
        account: AccountId,
        market: MarketId,
        order_id: &str,
    ) -> Result<bool, VenueError>;

    /// Open positions of one account on one market.
    async fn get_positions(
        &self,
        account: AccountId,
        market: MarketId,
    ) -> Result<Vec<RemotePosition>, VenueError>;

    /// Live orders of one account on one market.
    async fn get_open_orders(
        &self,
        account: AccountId,
        market: MarketId,
    ) -> Result<Vec<RemoteOrder>, VenueError>;

    /// Exact-id lookup.
    async fn get_order(
        &self,
        account: AccountId,
        market: MarketId,
        order_id: &str,
    ) -> Result<Option<RemoteOrder>, VenueError>;

    /// Most recent terminal orders, newest first.
    async fn get_order_history(
        &self,
        account: AccountId,
        market: MarketId,
        limit: usize,
    ) -> Result<Vec<RemoteOrder>, VenueError>;

    async fn get_best_bid_ask(&self, market: MarketId) -> Result<BookTop, VenueError>;

    async fn get_balance(&self, account: AccountId) -> Result<AccountBalance, VenueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(VenueError::Timeout {
            operation: "get_order".into()
        }
        .is_transient());
        assert!(VenueError::Unavailable("503".into()).is_transient());
        assert!(!VenueError::Rejected {
            reason: "reduce only".into()
        }
        .is_transient());
        assert!(!VenueError::InsufficientBalance { account: 1 }.is_transient());
    }
}
