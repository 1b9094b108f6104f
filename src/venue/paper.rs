//! In-memory paper venue.
//!
//! Simulates the parts of a perpetuals venue the engine touches:
//! - Market orders filled at the quoted bid/ask with a taker fee
//! - Margin usage by market leverage, realized PnL on reduction
//! - Reduce-only stop-loss/take-profit orders triggered by price updates
//! - Fault injection (rejections, skewed fills, stuck positions, slow
//!   submits, venue-native order ids) for exercising reconciliation paths

use super::traits::{VenueError, VenueGateway};
use super::types::*;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Simulated position on one market.
#[derive(Debug, Clone, Default)]
pub struct PaperPosition {
    pub size: Decimal,
    pub entry_price: Decimal,
}

/// Simulated account.
#[derive(Debug, Clone, Default)]
pub struct PaperAccount {
    /// Cash balance including realized PnL and fees
    pub balance: Decimal,
    pub positions: HashMap<MarketId, PaperPosition>,
}

/// Injected misbehaviour.
#[derive(Debug, Default)]
struct Faults {
    reject_market_orders: HashSet<AccountId>,
    reject_protective_orders: bool,
    fill_price_override: HashMap<AccountId, Decimal>,
    /// Orders are acknowledged as filled but positions never change
    frozen_positions: HashSet<AccountId>,
    submit_delay: HashMap<AccountId, Duration>,
    /// Stored order ids drop the `paper-` prefix the handle carries
    venue_native_ids: bool,
    query_failures: HashSet<AccountId>,
}

/// Paper trading state.
#[derive(Debug, Default)]
pub struct PaperVenueState {
    pub accounts: HashMap<AccountId, PaperAccount>,
    pub mids: HashMap<MarketId, Decimal>,
    pub leverage: HashMap<MarketId, Decimal>,
    /// Accepted orders, oldest first. Terminal ones are evicted past the
    /// retention limit; live ones are always kept.
    pub orders: VecDeque<RemoteOrder>,
    pub total_fees: Decimal,
    pub cancel_count: u64,
    faults: Faults,
}

impl PaperVenueState {
    fn record_order(&mut self, order: RemoteOrder, retention: usize) {
        self.orders.push_back(order);
        while self.orders.len() > retention {
            match self.orders.iter().position(|o| o.state.is_terminal()) {
                Some(idx) => {
                    self.orders.remove(idx);
                }
                None => break,
            }
        }
    }
}

/// Default number of orders kept by a paper venue.
pub const DEFAULT_ORDER_RETENTION: usize = 5_000;

/// Paper venue implementing [`VenueGateway`].
pub struct PaperVenue {
    state: Arc<RwLock<PaperVenueState>>,
    order_id_counter: AtomicU64,
    /// Taker fee rate (0.04% default)
    fee_rate: Decimal,
    /// Half of the quoted spread as a fraction of mid
    half_spread: Decimal,
    order_retention: usize,
}

impl PaperVenue {
    pub fn new(fee_rate: Decimal, half_spread: Decimal) -> Self {
        Self {
            state: Arc::new(RwLock::new(PaperVenueState::default())),
            order_id_counter: AtomicU64::new(1),
            fee_rate,
            half_spread,
            order_retention: DEFAULT_ORDER_RETENTION,
        }
    }

    /// Cap the stored order book at `retention` orders.
    pub fn with_order_retention(mut self, retention: usize) -> Self {
        self.order_retention = retention.max(1);
        self
    }

    /// Zero fees and a zero spread, so fills land exactly on mid.
    pub fn frictionless() -> Self {
        Self::new(Decimal::ZERO, Decimal::ZERO)
    }

    pub async fn add_account(&self, account: AccountId, balance: Decimal) {
        let mut state = self.state.write().await;
        state.accounts.insert(
            account,
            PaperAccount {
                balance,
                positions: HashMap::new(),
            },
        );
    }

    pub async fn set_leverage(&self, market: MarketId, leverage: Decimal) {
        self.state
            .write()
            .await
            .leverage
            .insert(market, leverage.max(Decimal::ONE));
    }

    /// Move the mid price and fire any protective orders it crosses.
    pub async fn set_mid_price(&self, market: MarketId, price: Decimal) {
        let mut state = self.state.write().await;
        state.mids.insert(market, price);
        self.trigger_protective_orders(&mut state, market, price);
    }

    pub async fn mid_price(&self, market: MarketId) -> Option<Decimal> {
        self.state.read().await.mids.get(&market).copied()
    }

    /// Place an exposure directly, bypassing order flow.
    pub async fn force_position(
        &self,
        account: AccountId,
        market: MarketId,
        size: Decimal,
        entry_price: Decimal,
    ) {
        let mut state = self.state.write().await;
        let acct = state.accounts.entry(account).or_default();
        acct.positions
            .insert(market, PaperPosition { size, entry_price });
    }

    pub async fn position_size(&self, account: AccountId, market: MarketId) -> Decimal {
        let state = self.state.read().await;
        state
            .accounts
            .get(&account)
            .and_then(|a| a.positions.get(&market))
            .map(|p| p.size)
            .unwrap_or(Decimal::ZERO)
    }

    pub async fn live_orders(&self, account: AccountId, market: MarketId) -> Vec<RemoteOrder> {
        let state = self.state.read().await;
        state
            .orders
            .iter()
            .filter(|o| o.account == account && o.market == market && o.state.is_live())
            .cloned()
            .collect()
    }

    pub async fn cancel_count(&self) -> u64 {
        self.state.read().await.cancel_count
    }

    pub async fn market_order_count(&self, account: AccountId) -> usize {
        let state = self.state.read().await;
        state
            .orders
            .iter()
            .filter(|o| o.account == account && o.kind == OrderKind::Market)
            .count()
    }

    // Fault injection

    pub async fn reject_market_orders(&self, account: AccountId, reject: bool) {
        let mut state = self.state.write().await;
        if reject {
            state.faults.reject_market_orders.insert(account);
        } else {
            state.faults.reject_market_orders.remove(&account);
        }
    }

    pub async fn reject_protective_orders(&self, reject: bool) {
        self.state.write().await.faults.reject_protective_orders = reject;
    }

    pub async fn override_fill_price(&self, account: AccountId, price: Option<Decimal>) {
        let mut state = self.state.write().await;
        match price {
            Some(p) => {
                state.faults.fill_price_override.insert(account, p);
            }
            None => {
                state.faults.fill_price_override.remove(&account);
            }
        }
    }

    pub async fn freeze_positions(&self, account: AccountId, frozen: bool) {
        let mut state = self.state.write().await;
        if frozen {
            state.faults.frozen_positions.insert(account);
        } else {
            state.faults.frozen_positions.remove(&account);
        }
    }

    pub async fn delay_submits(&self, account: AccountId, delay: Option<Duration>) {
        let mut state = self.state.write().await;
        match delay {
            Some(d) => {
                state.faults.submit_delay.insert(account, d);
            }
            None => {
                state.faults.submit_delay.remove(&account);
            }
        }
    }

    pub async fn use_venue_native_ids(&self, enabled: bool) {
        self.state.write().await.faults.venue_native_ids = enabled;
    }

    pub async fn fail_queries(&self, account: AccountId, fail: bool) {
        let mut state = self.state.write().await;
        if fail {
            state.faults.query_failures.insert(account);
        } else {
            state.faults.query_failures.remove(&account);
        }
    }

    /// Park an unfilled entry order submitted `age` ago.
    pub async fn rest_order(
        &self,
        account: AccountId,
        market: MarketId,
        side: Side,
        quantity: Decimal,
        age: ChronoDuration,
    ) -> String {
        let mut state = self.state.write().await;
        let (handle_id, stored_id, client_id) = self.assign_ids(&state);
        let order = RemoteOrder {
            order_id: stored_id,
            client_order_id: client_id,
            account,
            market,
            kind: OrderKind::Market,
            side,
            quantity,
            filled_quantity: Decimal::ZERO,
            trigger_price: None,
            avg_fill_price: None,
            state: OrderState::Open,
            created_at: Utc::now() - age,
        };
        state.record_order(order, self.order_retention);
        handle_id
    }

    fn next_order_id(&self) -> u64 {
        self.order_id_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// `(handle id, stored id)` for a fresh order.
    fn assign_ids(&self, state: &PaperVenueState) -> (String, String, Option<String>) {
        let n = self.next_order_id();
        let handle_id = format!("paper-{}", n);
        if state.faults.venue_native_ids {
            (handle_id, n.to_string(), None)
        } else {
            (handle_id.clone(), handle_id.clone(), Some(handle_id))
        }
    }

    fn book_top(&self, state: &PaperVenueState, market: MarketId) -> Result<BookTop, VenueError> {
        let mid = state
            .mids
            .get(&market)
            .copied()
            .ok_or(VenueError::UnknownMarket(market))?;
        Ok(BookTop {
            market,
            bid: mid * (Decimal::ONE - self.half_spread),
            ask: mid * (Decimal::ONE + self.half_spread),
        })
    }

    fn check_query(state: &PaperVenueState, account: AccountId) -> Result<(), VenueError> {
        if state.faults.query_failures.contains(&account) {
            return Err(VenueError::Unavailable(format!(
                "account {} query failed",
                account
            )));
        }
        if !state.accounts.contains_key(&account) {
            return Err(VenueError::InvalidRequest(format!(
                "unknown account {}",
                account
            )));
        }
        Ok(())
    }

    fn margin_used(state: &PaperVenueState, account: &PaperAccount) -> Decimal {
        account
            .positions
            .iter()
            .map(|(market, pos)| {
                let leverage = state.leverage.get(market).copied().unwrap_or(Decimal::ONE);
                pos.size.abs() * pos.entry_price / leverage
            })
            .sum()
    }

    fn unrealized(state: &PaperVenueState, account: &PaperAccount) -> Decimal {
        account
            .positions
            .iter()
            .map(|(market, pos)| {
                let mid = state.mids.get(market).copied().unwrap_or(pos.entry_price);
                (mid - pos.entry_price) * pos.size
            })
            .sum()
    }

    fn balance_of(state: &PaperVenueState, account: AccountId) -> Option<AccountBalance> {
        let acct = state.accounts.get(&account)?;
        let total = acct.balance + Self::unrealized(state, acct);
        let available = (total - Self::margin_used(state, acct)).max(Decimal::ZERO);
        Some(AccountBalance {
            account,
            total,
            available,
        })
    }

    /// Apply a fill to an account position, returning realized PnL.
    fn apply_fill(
        &self,
        state: &mut PaperVenueState,
        account: AccountId,
        market: MarketId,
        side: Side,
        quantity: Decimal,
        price: Decimal,
    ) -> Decimal {
        let fee = quantity * price * self.fee_rate;
        state.total_fees += fee;

        let frozen = state.faults.frozen_positions.contains(&account);
        let acct = state.accounts.entry(account).or_default();
        acct.balance -= fee;
        if frozen {
            return Decimal::ZERO;
        }

        let pos = acct.positions.entry(market).or_default();
        let delta = side.sign() * quantity;
        let mut realized = Decimal::ZERO;

        if pos.size == Decimal::ZERO || pos.size.is_sign_positive() == delta.is_sign_positive() {
            let new_size = pos.size + delta;
            pos.entry_price =
                (pos.entry_price * pos.size.abs() + price * quantity) / new_size.abs();
            pos.size = new_size;
        } else {
            let closed = quantity.min(pos.size.abs());
            realized = (price - pos.entry_price) * closed * pos.size.signum();
            let new_size = pos.size + delta;
            if new_size == Decimal::ZERO {
                pos.size = Decimal::ZERO;
            } else if new_size.is_sign_positive() != pos.size.is_sign_positive() {
                pos.size = new_size;
                pos.entry_price = price;
            } else {
                pos.size = new_size;
            }
        }

        if pos.size == Decimal::ZERO {
            acct.positions.remove(&market);
        }
        acct.balance += realized;
        realized
    }

    fn trigger_protective_orders(&self, state: &mut PaperVenueState, market: MarketId, mid: Decimal) {
        let triggered: Vec<usize> = state
            .orders
            .iter()
            .enumerate()
            .filter(|(_, o)| o.market == market && o.kind.is_protective() && o.state.is_live())
            .filter(|(_, o)| {
                let Some(trigger) = o.trigger_price else {
                    return false;
                };
                match (o.kind, o.side) {
                    (OrderKind::StopLoss, Side::Sell) | (OrderKind::TakeProfit, Side::Buy) => {
                        mid <= trigger
                    }
                    (OrderKind::StopLoss, Side::Buy) | (OrderKind::TakeProfit, Side::Sell) => {
                        mid >= trigger
                    }
                    _ => false,
                }
            })
            .map(|(idx, _)| idx)
            .collect();

        for idx in triggered {
            let order = state.orders[idx].clone();
            let position = state
                .accounts
                .get(&order.account)
                .and_then(|a| a.positions.get(&market))
                .map(|p| p.size)
                .unwrap_or(Decimal::ZERO);

            // Reduce-only: the order must shrink the current exposure
            let reducible = if position.signum() == -order.side.sign() {
                order.quantity.min(position.abs())
            } else {
                Decimal::ZERO
            };

            if reducible == Decimal::ZERO {
                state.orders[idx].state = OrderState::Cancelled;
                debug!(order_id = %order.order_id, "Paper protective order cancelled, nothing to reduce");
                continue;
            }

            self.apply_fill(state, order.account, market, order.side, reducible, mid);
            let stored = &mut state.orders[idx];
            stored.state = OrderState::Filled;
            stored.filled_quantity = reducible;
            stored.avg_fill_price = Some(mid);

            info!(
                order_id = %order.order_id,
                account = order.account,
                kind = ?order.kind,
                price = %mid,
                quantity = %reducible,
                "Paper protective order triggered"
            );
        }
    }
}

#[async_trait]
impl VenueGateway for PaperVenue {
    async fn submit_market_order(
        &self,
        account: AccountId,
        market: MarketId,
        side: Side,
        quantity: Decimal,
    ) -> Result<OrderHandle, VenueError> {
        let delay = self.state.read().await.faults.submit_delay.get(&account).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.write().await;
        if quantity <= Decimal::ZERO {
            return Err(VenueError::InvalidRequest("quantity must be positive".into()));
        }
        if state.faults.reject_market_orders.contains(&account) {
            return Err(VenueError::Rejected {
                reason: format!("account {} rejected by paper venue", account),
            });
        }
        if !state.accounts.contains_key(&account) {
            return Err(VenueError::InvalidRequest(format!(
                "unknown account {}",
                account
            )));
        }

        let book = self.book_top(&state, market)?;
        let price = state
            .faults
            .fill_price_override
            .get(&account)
            .copied()
            .unwrap_or(match side {
                Side::Buy => book.ask,
                Side::Sell => book.bid,
            });

        // Only exposure-increasing orders need free margin
        let current = state
            .accounts
            .get(&account)
            .and_then(|a| a.positions.get(&market))
            .map(|p| p.size)
            .unwrap_or(Decimal::ZERO);
        let increases = current == Decimal::ZERO || current.signum() == side.sign();
        if increases {
            let leverage = state.leverage.get(&market).copied().unwrap_or(Decimal::ONE);
            let required = quantity * price / leverage + quantity * price * self.fee_rate;
            let available = Self::balance_of(&state, account)
                .map(|b| b.available)
                .unwrap_or(Decimal::ZERO);
            if available < required {
                return Err(VenueError::InsufficientBalance { account });
            }
        }

        let realized = self.apply_fill(&mut state, account, market, side, quantity, price);
        let (handle_id, stored_id, client_id) = self.assign_ids(&state);
        let now = Utc::now();

        let order = RemoteOrder {
            order_id: stored_id,
            client_order_id: client_id,
            account,
            market,
            kind: OrderKind::Market,
            side,
            quantity,
            filled_quantity: quantity,
            trigger_price: None,
            avg_fill_price: Some(price),
            state: OrderState::Filled,
            created_at: now,
        };
        state.record_order(order, self.order_retention);

        info!(
            order_id = %handle_id,
            account,
            market,
            %side,
            quantity = %quantity,
            price = %price,
            realized = %realized,
            "Paper market order executed"
        );

        Ok(OrderHandle {
            order_id: handle_id,
            account,
            market,
            side,
            quantity,
            filled_quantity: quantity,
            avg_fill_price: Some(price),
            state: OrderState::Filled,
            submitted_at: now,
        })
    }

    async fn submit_protective_order(
        &self,
        request: &ProtectiveOrderRequest,
    ) -> Result<OrderHandle, VenueError> {
        let mut state = self.state.write().await;
        if !request.kind.is_protective() {
            return Err(VenueError::InvalidRequest(
                "protective order must be stop-loss or take-profit".into(),
            ));
        }
        if request.quantity <= Decimal::ZERO || request.trigger_price <= Decimal::ZERO {
            return Err(VenueError::InvalidRequest(
                "protective order needs positive quantity and trigger".into(),
            ));
        }
        if state.faults.reject_protective_orders {
            return Err(VenueError::Rejected {
                reason: "protective orders disabled".into(),
            });
        }
        if !state.accounts.contains_key(&request.account) {
            return Err(VenueError::InvalidRequest(format!(
                "unknown account {}",
                request.account
            )));
        }

        let (handle_id, stored_id, client_id) = self.assign_ids(&state);
        let now = Utc::now();
        let order = RemoteOrder {
            order_id: stored_id,
            client_order_id: client_id,
            account: request.account,
            market: request.market,
            kind: request.kind,
            side: request.side,
            quantity: request.quantity,
            filled_quantity: Decimal::ZERO,
            trigger_price: Some(request.trigger_price),
            avg_fill_price: None,
            state: OrderState::Open,
            created_at: now,
        };
        state.record_order(order, self.order_retention);

        debug!(
            order_id = %handle_id,
            account = request.account,
            kind = ?request.kind,
            trigger = %request.trigger_price,
            "Paper protective order accepted"
        );

        Ok(OrderHandle {
            order_id: handle_id,
            account: request.account,
            market: request.market,
            side: request.side,
            quantity: request.quantity,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            state: OrderState::Open,
            submitted_at: now,
        })
    }

    async fn cancel_order(
        &self,
        account: AccountId,
        market: MarketId,
        order_id: &str,
    ) -> Result<bool, VenueError> {
        let mut state = self.state.write().await;
        Self::check_query(&state, account)?;
        state.cancel_count += 1;

        let native = order_id.trim_start_matches("paper-");
        let found = state.orders.iter_mut().find(|o| {
            o.account == account
                && o.market == market
                && (o.order_id == order_id || o.order_id == native)
        });

        match found {
            Some(order) if order.state.is_live() => {
                order.state = OrderState::Cancelled;
                debug!(order_id, account, "Paper order cancelled");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_positions(
        &self,
        account: AccountId,
        market: MarketId,
    ) -> Result<Vec<RemotePosition>, VenueError> {
        let state = self.state.read().await;
        Self::check_query(&state, account)?;
        let mid = state.mids.get(&market).copied();

        Ok(state
            .accounts
            .get(&account)
            .and_then(|a| a.positions.get(&market))
            .filter(|p| p.size != Decimal::ZERO)
            .map(|p| RemotePosition {
                account,
                market,
                size: p.size,
                entry_price: p.entry_price,
                unrealized_pnl: mid
                    .map(|m| (m - p.entry_price) * p.size)
                    .unwrap_or(Decimal::ZERO),
            })
            .into_iter()
            .collect())
    }

    async fn get_open_orders(
        &self,
        account: AccountId,
        market: MarketId,
    ) -> Result<Vec<RemoteOrder>, VenueError> {
        let state = self.state.read().await;
        Self::check_query(&state, account)?;
        Ok(state
            .orders
            .iter()
            .filter(|o| o.account == account && o.market == market && o.state.is_live())
            .cloned()
            .collect())
    }

    async fn get_order(
        &self,
        account: AccountId,
        market: MarketId,
        order_id: &str,
    ) -> Result<Option<RemoteOrder>, VenueError> {
        let state = self.state.read().await;
        Self::check_query(&state, account)?;
        Ok(state
            .orders
            .iter()
            .find(|o| o.account == account && o.market == market && o.order_id == order_id)
            .cloned())
    }

    async fn get_order_history(
        &self,
        account: AccountId,
        market: MarketId,
        limit: usize,
    ) -> Result<Vec<RemoteOrder>, VenueError> {
        let state = self.state.read().await;
        Self::check_query(&state, account)?;
        Ok(state
            .orders
            .iter()
            .rev()
            .filter(|o| o.account == account && o.market == market && o.state.is_terminal())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_best_bid_ask(&self, market: MarketId) -> Result<BookTop, VenueError> {
        let state = self.state.read().await;
        self.book_top(&state, market)
    }

    async fn get_balance(&self, account: AccountId) -> Result<AccountBalance, VenueError> {
        let state = self.state.read().await;
        Self::check_query(&state, account)?;
        Self::balance_of(&state, account)
            .ok_or_else(|| VenueError::InvalidRequest(format!("unknown account {}", account)))
    }
}

impl Default for PaperVenue {
    fn default() -> Self {
        Self::new(dec!(0.0004), dec!(0.0005))
    }
}

/// Bounded pseudo-random walk driving paper mid prices.
///
/// Xorshift64; deterministic for a given seed.
#[derive(Debug, Clone)]
pub struct PriceWalk {
    state: u64,
    max_step_bps: u32,
}

impl PriceWalk {
    pub fn new(seed: u64, max_step_bps: u32) -> Self {
        Self {
            state: seed.max(1),
            max_step_bps,
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Move `price` by at most `max_step_bps` in either direction.
    pub fn step(&mut self, price: Decimal) -> Decimal {
        let span = u64::from(self.max_step_bps) * 2 + 1;
        let bps = (self.next_u64() % span) as i64 - i64::from(self.max_step_bps);
        let next = price * (Decimal::ONE + Decimal::new(bps, 4));
        next.round_dp(8).max(Decimal::new(1, 8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn venue_with_price(price: Decimal) -> PaperVenue {
        let venue = PaperVenue::frictionless();
        venue.add_account(1, dec!(10000)).await;
        venue.add_account(2, dec!(10000)).await;
        venue.set_mid_price(7, price).await;
        venue
    }

    #[tokio::test]
    async fn test_market_order_opens_and_closes() {
        let venue = venue_with_price(dec!(100)).await;

        let handle = venue
            .submit_market_order(1, 7, Side::Buy, dec!(2))
            .await
            .unwrap();
        assert!(handle.is_filled());
        assert_eq!(venue.position_size(1, 7).await, dec!(2));

        venue.set_mid_price(7, dec!(110)).await;
        venue
            .submit_market_order(1, 7, Side::Sell, dec!(2))
            .await
            .unwrap();
        assert_eq!(venue.position_size(1, 7).await, Decimal::ZERO);

        let balance = venue.get_balance(1).await.unwrap();
        assert_eq!(balance.total, dec!(10020));
        assert!(venue.get_positions(1, 7).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fee_and_spread_applied() {
        let venue = PaperVenue::new(dec!(0.001), dec!(0.01));
        venue.add_account(1, dec!(1000)).await;
        venue.set_mid_price(7, dec!(100)).await;

        let handle = venue
            .submit_market_order(1, 7, Side::Buy, dec!(1))
            .await
            .unwrap();
        assert_eq!(handle.avg_fill_price, Some(dec!(101)));
        let state = venue.state.read().await;
        assert_eq!(state.total_fees, dec!(0.101));
    }

    #[tokio::test]
    async fn test_insufficient_margin_rejected() {
        let venue = venue_with_price(dec!(100)).await;
        let result = venue.submit_market_order(1, 7, Side::Buy, dec!(200)).await;
        assert_eq!(result, Err(VenueError::InsufficientBalance { account: 1 }));

        venue.set_leverage(7, dec!(5)).await;
        assert!(venue.submit_market_order(1, 7, Side::Buy, dec!(200)).await.is_ok());
    }

    #[tokio::test]
    async fn test_stop_loss_triggers_on_price_cross() {
        let venue = venue_with_price(dec!(100)).await;
        venue
            .submit_market_order(1, 7, Side::Buy, dec!(1))
            .await
            .unwrap();
        venue
            .submit_market_order(2, 7, Side::Sell, dec!(1))
            .await
            .unwrap();

        let long_sl = venue
            .submit_protective_order(&ProtectiveOrderRequest {
                account: 1,
                market: 7,
                kind: OrderKind::StopLoss,
                side: Side::Sell,
                quantity: dec!(1),
                trigger_price: dec!(95),
            })
            .await
            .unwrap();
        let short_tp = venue
            .submit_protective_order(&ProtectiveOrderRequest {
                account: 2,
                market: 7,
                kind: OrderKind::TakeProfit,
                side: Side::Buy,
                quantity: dec!(1),
                trigger_price: dec!(95),
            })
            .await
            .unwrap();

        venue.set_mid_price(7, dec!(96)).await;
        assert_eq!(venue.position_size(1, 7).await, dec!(1));

        venue.set_mid_price(7, dec!(94)).await;
        assert_eq!(venue.position_size(1, 7).await, Decimal::ZERO);
        assert_eq!(venue.position_size(2, 7).await, Decimal::ZERO);

        let sl = venue.get_order(1, 7, &long_sl.order_id).await.unwrap().unwrap();
        assert_eq!(sl.state, OrderState::Filled);
        let tp = venue.get_order(2, 7, &short_tp.order_id).await.unwrap().unwrap();
        assert_eq!(tp.state, OrderState::Filled);
    }

    #[tokio::test]
    async fn test_venue_native_ids_hide_exact_lookup() {
        let venue = venue_with_price(dec!(100)).await;
        venue.use_venue_native_ids(true).await;

        let handle = venue
            .submit_market_order(1, 7, Side::Buy, dec!(1))
            .await
            .unwrap();
        assert!(venue.get_order(1, 7, &handle.order_id).await.unwrap().is_none());

        let history = venue.get_order_history(1, 7, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(handle.order_id.ends_with(&history[0].order_id));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let venue = venue_with_price(dec!(100)).await;
        venue
            .submit_market_order(1, 7, Side::Buy, dec!(1))
            .await
            .unwrap();
        let sl = venue
            .submit_protective_order(&ProtectiveOrderRequest {
                account: 1,
                market: 7,
                kind: OrderKind::StopLoss,
                side: Side::Sell,
                quantity: dec!(1),
                trigger_price: dec!(90),
            })
            .await
            .unwrap();

        assert!(venue.cancel_order(1, 7, &sl.order_id).await.unwrap());
        assert!(!venue.cancel_order(1, 7, &sl.order_id).await.unwrap());
        assert!(venue.live_orders(1, 7).await.is_empty());
    }

    #[tokio::test]
    async fn test_order_store_evicts_terminal_orders_only() {
        let venue = PaperVenue::frictionless().with_order_retention(3);
        venue.add_account(1, dec!(10000)).await;
        venue.set_mid_price(7, dec!(100)).await;

        venue.submit_market_order(1, 7, Side::Buy, dec!(1)).await.unwrap();
        let sl = venue
            .submit_protective_order(&ProtectiveOrderRequest {
                account: 1,
                market: 7,
                kind: OrderKind::StopLoss,
                side: Side::Sell,
                quantity: dec!(1),
                trigger_price: dec!(90),
            })
            .await
            .unwrap();
        for _ in 0..4 {
            venue.submit_market_order(1, 7, Side::Buy, dec!(1)).await.unwrap();
        }

        let state = venue.state.read().await;
        assert_eq!(state.orders.len(), 3);
        assert_eq!(state.orders[0].order_id, sl.order_id);
        drop(state);
        assert_eq!(venue.market_order_count(1).await, 2);
        assert_eq!(venue.live_orders(1, 7).await.len(), 1);
    }

    #[tokio::test]
    async fn test_rested_order_is_live_and_aged() {
        let venue = venue_with_price(dec!(100)).await;
        let id = venue.rest_order(1, 7, Side::Buy, dec!(1), ChronoDuration::seconds(90)).await;

        let open = venue.get_open_orders(1, 7).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].order_id, id);
        assert!(Utc::now() - open[0].created_at >= ChronoDuration::seconds(90));
        assert_eq!(venue.position_size(1, 7).await, Decimal::ZERO);
    }

    #[test]
    fn test_price_walk_stays_within_step() {
        let mut walk = PriceWalk::new(42, 10);
        let mut price = dec!(100);
        for _ in 0..1000 {
            let next = walk.step(price);
            assert!((next - price).abs() <= price * dec!(0.001) + dec!(0.00000001));
            price = next;
        }
        assert!(price > Decimal::ZERO);
    }
}
