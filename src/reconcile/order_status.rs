//! Remote order status lookup.
//!
//! Exact-id lookups are retried under a [`RetryPolicy`] because a fresh
//! order may not be visible yet. When they run out, a broad scan walks
//! the account's open orders and recent history and matches ids loosely,
//! since the id a venue echoes back may be formatted differently from the
//! one the handle carried. Nothing found means [`OrderLookup::Unknown`].

use super::retry::{retry_until, Attempt, RetryPolicy};
use crate::venue::{AccountId, MarketId, OrderState, RemoteOrder, VenueGateway};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of a status lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderLookup {
    Found(RemoteOrder),
    /// Not confirmed either way. Never treat as filled.
    Unknown,
}

impl OrderLookup {
    pub fn order(&self) -> Option<&RemoteOrder> {
        match self {
            OrderLookup::Found(order) => Some(order),
            OrderLookup::Unknown => None,
        }
    }

    pub fn state(&self) -> Option<OrderState> {
        self.order().map(|o| o.state)
    }

    pub fn is_filled(&self) -> bool {
        self.state() == Some(OrderState::Filled)
    }

    /// Confirmed live at the venue.
    pub fn is_live(&self) -> bool {
        self.state().is_some_and(OrderState::is_live)
    }
}

pub struct OrderStatusResolver {
    venue: Arc<dyn VenueGateway>,
    policy: RetryPolicy,
    history_limit: usize,
}

impl OrderStatusResolver {
    pub fn new(venue: Arc<dyn VenueGateway>, policy: RetryPolicy, history_limit: usize) -> Self {
        Self {
            venue,
            policy,
            history_limit,
        }
    }

    /// Look up `order_id`, falling back to a broad scan.
    pub async fn resolve(&self, order_id: &str, account: AccountId, market: MarketId) -> OrderLookup {
        let venue = &self.venue;
        let exact = retry_until(self.policy, "order_status", |_| async move {
            match venue.get_order(account, market, order_id).await {
                Ok(Some(order)) => Attempt::Done(order),
                Ok(None) => Attempt::Retry("not found".to_string()),
                Err(e) => Attempt::Retry(e.to_string()),
            }
        })
        .await;

        if let Some(order) = exact {
            return OrderLookup::Found(order);
        }

        match self.broad_scan(order_id, account, market).await {
            Some(order) => {
                info!(
                    %order_id,
                    venue_id = %order.order_id,
                    account,
                    state = ?order.state,
                    "Order found by history scan"
                );
                OrderLookup::Found(order)
            }
            None => {
                warn!(%order_id, account, market, "Order status unknown after scan");
                OrderLookup::Unknown
            }
        }
    }

    async fn broad_scan(
        &self,
        order_id: &str,
        account: AccountId,
        market: MarketId,
    ) -> Option<RemoteOrder> {
        match self.venue.get_open_orders(account, market).await {
            Ok(orders) => {
                if let Some(order) = orders.into_iter().find(|o| ids_match(order_id, o)) {
                    return Some(order);
                }
            }
            Err(e) => debug!(%order_id, error = %e, "Open order scan failed"),
        }

        match self
            .venue
            .get_order_history(account, market, self.history_limit)
            .await
        {
            Ok(orders) => orders.into_iter().find(|o| ids_match(order_id, o)),
            Err(e) => {
                debug!(%order_id, error = %e, "History scan failed");
                None
            }
        }
    }
}

/// Loose id comparison for the broad scan.
///
/// Matches the venue id or echoed client id exactly, or the trailing
/// numeric part of both ids (`"paper-17"` vs `"17"`). Substring matching
/// is avoided: `"1"` must not match `"paper-17"`.
pub fn ids_match(local_id: &str, remote: &RemoteOrder) -> bool {
    if remote.order_id == local_id || remote.client_order_id.as_deref() == Some(local_id) {
        return true;
    }
    match (numeric_tail(local_id), numeric_tail(&remote.order_id)) {
        (Some(local), Some(venue)) => local == venue,
        _ => false,
    }
}

fn numeric_tail(id: &str) -> Option<&str> {
    let start = id
        .char_indices()
        .rev()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    let tail = &id[start..];
    (!tail.is_empty()).then_some(tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::{MockVenueGateway, OrderKind, Side, VenueError};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn remote(order_id: &str, client: Option<&str>, state: OrderState) -> RemoteOrder {
        RemoteOrder {
            order_id: order_id.to_string(),
            client_order_id: client.map(str::to_string),
            account: 1,
            market: 7,
            kind: OrderKind::StopLoss,
            side: Side::Sell,
            quantity: dec!(1),
            filled_quantity: dec!(1),
            trigger_price: Some(dec!(95)),
            avg_fill_price: Some(dec!(95)),
            state,
            created_at: Utc::now(),
        }
    }

    fn resolver(mock: MockVenueGateway) -> OrderStatusResolver {
        OrderStatusResolver::new(Arc::new(mock), RetryPolicy::from_millis(3, 2000), 100)
    }

    #[test]
    fn test_ids_match() {
        let order = remote("17", None, OrderState::Filled);
        assert!(ids_match("paper-17", &order));
        assert!(ids_match("17", &order));
        assert!(!ids_match("paper-1", &order));
        assert!(!ids_match("paper-170", &order));

        let echoed = remote("abc", Some("paper-5"), OrderState::Filled);
        assert!(ids_match("paper-5", &echoed));
        assert!(!ids_match("xyz", &echoed));
    }

    #[test]
    fn test_numeric_tail() {
        assert_eq!(numeric_tail("paper-42"), Some("42"));
        assert_eq!(numeric_tail("42"), Some("42"));
        assert_eq!(numeric_tail("ordé9"), Some("9"));
        assert_eq!(numeric_tail("abc"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exact_hit_skips_scan() {
        let mut mock = MockVenueGateway::new();
        mock.expect_get_order()
            .times(1)
            .returning(|_, _, _| Ok(Some(remote("paper-3", None, OrderState::Open))));
        mock.expect_get_open_orders().never();
        mock.expect_get_order_history().never();

        let lookup = resolver(mock).resolve("paper-3", 1, 7).await;
        assert!(lookup.is_live());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_finds_in_history() {
        let mut mock = MockVenueGateway::new();
        mock.expect_get_order().times(3).returning(|_, _, _| Ok(None));
        mock.expect_get_open_orders().times(1).returning(|_, _| Ok(vec![]));
        mock.expect_get_order_history()
            .times(1)
            .withf(|_, _, limit| *limit == 100)
            .returning(|_, _, _| {
                Ok(vec![
                    remote("9", None, OrderState::Cancelled),
                    remote("12", None, OrderState::Filled),
                ])
            });

        let lookup = resolver(mock).resolve("paper-12", 1, 7).await;
        assert!(lookup.is_filled());
        assert_eq!(lookup.order().unwrap().order_id, "12");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let mut mock = MockVenueGateway::new();
        let mut calls = 0;
        mock.expect_get_order().times(2).returning(move |_, _, _| {
            calls += 1;
            if calls == 1 {
                Err(VenueError::Timeout {
                    operation: "get_order".into(),
                })
            } else {
                Ok(Some(remote("paper-3", None, OrderState::Filled)))
            }
        });

        let lookup = resolver(mock).resolve("paper-3", 1, 7).await;
        assert!(lookup.is_filled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_anywhere_is_unknown() {
        let mut mock = MockVenueGateway::new();
        mock.expect_get_order().times(3).returning(|_, _, _| Ok(None));
        mock.expect_get_open_orders()
            .returning(|_, _| Err(VenueError::Unavailable("down".into())));
        mock.expect_get_order_history()
            .returning(|_, _, _| Ok(vec![remote("1", None, OrderState::Filled)]));

        let lookup = resolver(mock).resolve("paper-17", 1, 7).await;
        assert_eq!(lookup, OrderLookup::Unknown);
        assert!(!lookup.is_filled());
        assert!(!lookup.is_live());
    }
}
