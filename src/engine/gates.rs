//! Opportunity gates.
//!
//! A pair opens a hedge only when every gate passes, checked in order and
//! short-circuiting on the first refusal:
//! 1. No manual-intervention hold and no OPENING, CLOSING or PENDING_CLOSE
//!    position for the pair. Passing reserves an OPENING position under the
//!    state lock.
//! 2. No live entry order younger than the order timeout; older ones are
//!    cancelled
//! 3. At least two eligible, funded accounts
//! 4. No remote position or entry order on those accounts. Hedges whose
//!    protective orders already flattened them are settled first
//! 5. Risk gate approval
//! 6. Pair cooldown elapsed since its last trade

use super::HedgeEngine;
use crate::config::PairConfig;
use crate::hedge::{margin_capacity, HedgeId, HedgePosition, HedgeStatus, LegStatus};
use crate::venue::{AccountBalance, AccountId};
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use std::fmt;
use tracing::{debug, info, warn};

/// The gate that refused an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    PairBusy,
    StaleOrders,
    Accounts,
    Overlap,
    Risk,
    Cooldown,
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Gate::PairBusy => "pair_busy",
            Gate::StaleOrders => "stale_orders",
            Gate::Accounts => "accounts",
            Gate::Overlap => "overlap",
            Gate::Risk => "risk",
            Gate::Cooldown => "cooldown",
        };
        f.write_str(name)
    }
}

/// Result of evaluating one pair.
#[derive(Debug, Clone, PartialEq)]
pub enum OpenAttempt {
    Skipped { gate: Gate, reason: String },
    Opened(HedgeId),
    Failed { position_id: HedgeId, reason: String },
}

type GateResult<T> = Result<T, (Gate, String)>;

impl HedgeEngine {
    /// Evaluate every enabled pair once.
    pub async fn run_opportunity_tick(&self) -> Vec<(String, OpenAttempt)> {
        let mut attempts = Vec::new();
        for pair in self.enabled_pairs() {
            let attempt = self.try_open_pair(pair).await;
            match &attempt {
                OpenAttempt::Skipped { gate, reason } => {
                    debug!(pair = %pair.id, %gate, %reason, "Open skipped");
                }
                OpenAttempt::Opened(id) => info!(pair = %pair.id, position = %id, "Hedge opened"),
                OpenAttempt::Failed { position_id, reason } => {
                    warn!(pair = %pair.id, position = %position_id, %reason, "Hedge open failed");
                }
            }
            attempts.push((pair.id.clone(), attempt));
        }
        attempts
    }

    /// Run the gates for `pair` and open a hedge if they all pass.
    pub async fn try_open_pair(&self, pair: &PairConfig) -> OpenAttempt {
        let mut position = {
            let mut state = self.state.lock().await;
            if let Some(reason) = state.manual_holds.get(&pair.id) {
                return OpenAttempt::Skipped {
                    gate: Gate::PairBusy,
                    reason: format!("manual intervention required: {}", reason),
                };
            }
            let blocking = [HedgeStatus::Opening, HedgeStatus::Closing, HedgeStatus::PendingClose];
            if let Some(existing) = state.pair_positions(&pair.id).find(|p| blocking.contains(&p.status)) {
                return OpenAttempt::Skipped {
                    gate: Gate::PairBusy,
                    reason: format!("position {} is {}", existing.id, existing.status),
                };
            }
            let position = HedgePosition::opening(&pair.id, pair.market, pair.leverage);
            state.reserve(position.clone());
            position
        };

        let accounts = match self.check_gates(pair, &position.id).await {
            Ok(accounts) => accounts,
            Err((gate, reason)) => {
                self.state.lock().await.release(&position.id);
                return OpenAttempt::Skipped { gate, reason };
            }
        };

        let assignment = self.state.lock().await.rotation.assign(&pair.id, &accounts);
        let result = self.executor.open(&mut position, pair, &assignment).await;

        if result.is_ok() {
            let now = Utc::now();
            let cooldown = self.pair_cooldown(&pair.id);
            let mut state = self.state.lock().await;
            state.rotation.record(&pair.id, &assignment);
            for account in &accounts {
                state.accounts.record_trade(*account, cooldown, now);
            }
            state.last_trade.insert(pair.id.clone(), now);
        }

        let id = position.id.clone();
        let reason = position.metadata.failure_reason.clone();
        self.checkin(position).await;

        match result {
            Ok(()) => OpenAttempt::Opened(id),
            Err(e) => OpenAttempt::Failed {
                position_id: id,
                reason: reason.unwrap_or_else(|| e.to_string()),
            },
        }
    }

    /// Gates 2 through 6. Returns the accounts to use.
    async fn check_gates(&self, pair: &PairConfig, reservation: &str) -> GateResult<Vec<AccountId>> {
        self.expire_stale_orders(pair, reservation).await?;
        let (accounts, balances) = self.available_accounts(pair).await?;
        self.check_overlap(pair, &accounts, reservation).await?;

        let estimated_margin = balances
            .iter()
            .map(|b| margin_capacity(b.available, pair.risk_limits.min_balance))
            .min()
            .unwrap_or(Decimal::ZERO)
            .min(pair.risk_limits.max_position_size);
        let mut participating = pair.clone();
        participating.accounts = accounts.clone();
        let decision = self.risk.check_open_risk(&participating, estimated_margin, &balances);
        if !decision.allowed {
            return Err((
                Gate::Risk,
                decision.reason.unwrap_or_else(|| "risk gate refused".to_string()),
            ));
        }

        let last_trade = self.state.lock().await.last_trade.get(&pair.id).copied();
        if let Some(last) = last_trade {
            let cooldown = self.pair_cooldown(&pair.id);
            let elapsed = Utc::now() - last;
            if elapsed < cooldown {
                return Err((
                    Gate::Cooldown,
                    format!("{}s of {}s cooldown elapsed", elapsed.num_seconds(), cooldown.num_seconds()),
                ));
            }
        }

        Ok(accounts)
    }

    /// Gate 2. Cancels entry orders past the timeout; younger ones block.
    async fn expire_stale_orders(&self, pair: &PairConfig, reservation: &str) -> GateResult<()> {
        let timeout = Duration::seconds(self.config.engine.order_timeout_secs as i64);
        let now = Utc::now();

        {
            let mut state = self.state.lock().await;
            let busy = state.busy.clone();
            for position in state
                .positions
                .values_mut()
                .filter(|p| p.pair_id == pair.id && p.id != reservation && !busy.contains(&p.id))
            {
                let mut expired = false;
                for leg in &mut position.legs {
                    let stale = leg.submitted_at.is_some_and(|at| now - at >= timeout);
                    if leg.status == LegStatus::Pending && stale {
                        warn!(position = %position.id, account = leg.account, "Pending leg expired");
                        leg.status = LegStatus::Failed;
                        expired = true;
                    }
                }
                if expired && position.status == HedgeStatus::Opening {
                    position.mark_failed("pending order expired");
                }
            }
        }

        for account in &pair.accounts {
            let orders = self
                .venue
                .get_open_orders(*account, pair.market)
                .await
                .map_err(|e| (Gate::StaleOrders, format!("order query for account {} failed: {}", account, e)))?;

            for order in orders.iter().filter(|o| !o.kind.is_protective() && o.state.is_live()) {
                let age = now - order.created_at;
                if age < timeout {
                    return Err((
                        Gate::StaleOrders,
                        format!("order {} on account {} pending for {}s", order.order_id, account, age.num_seconds()),
                    ));
                }
                warn!(account, order_id = %order.order_id, age_secs = age.num_seconds(), "Cancelling stale order");
                if let Err(e) = self.venue.cancel_order(*account, pair.market, &order.order_id).await {
                    return Err((Gate::StaleOrders, format!("stale order {} not cancelled: {}", order.order_id, e)));
                }
            }
        }
        Ok(())
    }

    /// Gate 3. Eligible accounts with a fresh balance above the pair
    /// minimum, trimmed to an even count.
    async fn available_accounts(&self, pair: &PairConfig) -> GateResult<(Vec<AccountId>, Vec<AccountBalance>)> {
        let candidates = self.state.lock().await.accounts.eligible(&pair.accounts, Utc::now());

        let mut accounts = Vec::new();
        let mut balances = Vec::new();
        for account in candidates {
            match self.venue.get_balance(account).await {
                Ok(balance) => {
                    self.state.lock().await.accounts.update_balance(balance);
                    if balance.available >= pair.risk_limits.min_balance {
                        accounts.push(account);
                        balances.push(balance);
                    } else {
                        debug!(account, available = %balance.available, "Account below minimum balance");
                    }
                }
                Err(e) => warn!(account, error = %e, "Balance query failed"),
            }
        }

        let funded = accounts.len();
        let usable = funded - funded % 2;
        if usable < 2 {
            return Err((
                Gate::Accounts,
                format!(
                    "{} of {} accounts funded, need an even count of at least 2",
                    funded,
                    pair.accounts.len()
                ),
            ));
        }
        accounts.truncate(usable);
        balances.truncate(usable);
        Ok((accounts, balances))
    }

    /// Gate 4. Remote exposure blocks; a clean remote purges local records.
    async fn check_overlap(&self, pair: &PairConfig, accounts: &[AccountId], reservation: &str) -> GateResult<()> {
        self.check_remote_flat(pair, accounts).await?;
        self.settle_unseen_exits(pair, reservation).await?;
        self.purge_flat_records(pair, reservation).await;
        Ok(())
    }

    async fn check_remote_flat(&self, pair: &PairConfig, accounts: &[AccountId]) -> GateResult<()> {
        let epsilon = self.config.reconciliation.flat_size_epsilon;
        for account in accounts {
            let positions = self
                .venue
                .get_positions(*account, pair.market)
                .await
                .map_err(|e| (Gate::Overlap, format!("position query for account {} failed: {}", account, e)))?;
            if let Some(open) = positions.iter().find(|p| p.is_open(epsilon)) {
                return Err((Gate::Overlap, format!("account {} holds {} remotely", account, open.size)));
            }

            let orders = self
                .venue
                .get_open_orders(*account, pair.market)
                .await
                .map_err(|e| (Gate::Overlap, format!("order query for account {} failed: {}", account, e)))?;
            if let Some(order) = orders.iter().find(|o| !o.kind.is_protective() && o.state.is_live()) {
                return Err((Gate::Overlap, format!("account {} has live order {}", account, order.order_id)));
            }
        }
        Ok(())
    }

    /// ACTIVE hedges still holding protective orders may have been closed
    /// by them since the last management tick. Run OCO on each and book
    /// the close before anything is purged.
    async fn settle_unseen_exits(&self, pair: &PairConfig, reservation: &str) -> GateResult<()> {
        let protected: Vec<HedgeId> = {
            let state = self.state.lock().await;
            state
                .pair_positions(&pair.id)
                .filter(|p| {
                    p.status == HedgeStatus::Active
                        && p.id != reservation
                        && !state.busy.contains(&p.id)
                        && p.legs.iter().any(|l| l.has_protection())
                })
                .map(|p| p.id.clone())
                .collect()
        };

        for id in protected {
            let mut position = self
                .state
                .lock()
                .await
                .checkout(&id)
                .map_err(|e| (Gate::Overlap, e.to_string()))?;
            self.executor.protection().enforce(&mut position).await;

            let exited = !position.legs.is_empty() && position.legs.iter().all(|l| l.is_settled());
            let outcome = if exited {
                match self.executor.complete_protective_exit(&mut position).await {
                    Ok(true) => {
                        self.record_close(&position).await;
                        Ok(())
                    }
                    Ok(false) => Err(format!("position {} exited but exposure remains", id)),
                    Err(e) => Err(format!("position {} exit not settled: {}", id, e)),
                }
            } else {
                Ok(())
            };
            self.checkin(position).await;
            outcome.map_err(|reason| (Gate::Overlap, reason))?;
        }
        Ok(())
    }

    /// Fail local records the flat remote no longer backs, booking any
    /// loss their settled legs already realized.
    async fn purge_flat_records(&self, pair: &PairConfig, reservation: &str) {
        let mut state = self.state.lock().await;
        let stale: Vec<HedgeId> = state
            .pair_positions(&pair.id)
            .filter(|p| {
                !p.status.is_terminal()
                    && p.status != HedgeStatus::PendingClose
                    && p.id != reservation
                    && !state.busy.contains(&p.id)
            })
            .map(|p| p.id.clone())
            .collect();
        for id in stale {
            if let Some(mut position) = state.positions.remove(&id) {
                warn!(position = %id, status = %position.status, "Purging local record, remote shows no exposure");
                for leg in position.legs.iter().filter(|l| l.realized_pnl != Decimal::ZERO) {
                    self.risk.record_trade_pnl(leg.account, &position.pair_id, leg.realized_pnl);
                }
                position.mark_failed("purged: remote shows no exposure");
                self.persist(&position);
                state.retire(position);
            }
        }
        state.anomalies.reset_pair(&pair.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::fixtures::{account, pair, two_account_config};
    use crate::engine::test_support::{harness, harness_with};
    use crate::hedge::Leg;
    use crate::venue::{PositionSide, Side, VenueGateway};
    use rust_decimal_macros::dec;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test(start_paused = true)]
    async fn test_open_uses_shared_margin() {
        let h = harness().await;
        let id = h.open().await;

        let position = h.engine.position(&id).await.unwrap();
        assert_eq!(position.status, HedgeStatus::Active);
        assert_eq!(position.metadata.notional_per_leg, dec!(700));
        assert!(position.net_exposure_ratio() <= dec!(0.05));
        assert_eq!(h.sink.count("position_opened"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_opens_have_one_winner() {
        let h = harness().await;
        let pair = h.pair();

        let attempts = futures_util::future::join_all((0..4).map(|_| {
            let engine = h.engine.clone();
            let pair = pair.clone();
            async move { engine.try_open_pair(&pair).await }
        }))
        .await;

        let opened = attempts.iter().filter(|a| matches!(a, OpenAttempt::Opened(_))).count();
        assert_eq!(opened, 1);
        assert_eq!(h.engine.positions_for_pair("ETH").await.len(), 1);
        assert_eq!(h.venue.position_size(1, 7).await.abs(), dec!(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_hedge_blocks_with_overlap() {
        let h = harness().await;
        h.open().await;

        match h.engine.try_open_pair(&h.pair()).await {
            OpenAttempt::Skipped { gate, .. } => assert_eq!(gate, Gate::Overlap),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_protective_orders_do_not_count_as_stale() {
        let h = harness().await;
        h.venue
            .submit_protective_order(&crate::venue::ProtectiveOrderRequest {
                account: 1,
                market: 7,
                kind: crate::venue::OrderKind::StopLoss,
                side: Side::Sell,
                quantity: dec!(1),
                trigger_price: dec!(50),
            })
            .await
            .unwrap();
        // Protective orders never block
        assert_ok!(h.engine.expire_stale_orders(&h.pair(), "none").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_young_entry_order_blocks() {
        let h = harness().await;
        let order_id = h.venue.rest_order(2, 7, Side::Buy, dec!(1), Duration::seconds(5)).await;

        let (gate, reason) = assert_err!(h.engine.expire_stale_orders(&h.pair(), "none").await);
        assert_eq!(gate, Gate::StaleOrders);
        assert!(reason.contains(&order_id));
        assert_eq!(h.venue.live_orders(2, 7).await.len(), 1);
        assert_eq!(h.venue.cancel_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_order_past_timeout_is_cancelled() {
        let h = harness().await;
        h.venue.rest_order(1, 7, Side::Sell, dec!(1), Duration::seconds(45)).await;

        assert_ok!(h.engine.expire_stale_orders(&h.pair(), "none").await);
        assert!(h.venue.live_orders(1, 7).await.is_empty());
        assert_eq!(h.venue.cancel_count().await, 1);

        // Nothing left in the way, so the pair opens
        h.open().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_local_pending_leg_fails_opening_position() {
        let h = harness().await;
        let mut stuck = HedgePosition::opening("ETH", 7, 1);
        let mut leg = Leg::new(1, PositionSide::Long, dec!(3));
        leg.submitted_at = Some(Utc::now() - Duration::seconds(31));
        stuck.legs.push(leg);
        stuck.legs.push(Leg::new(2, PositionSide::Short, dec!(3)));
        let id = stuck.id.clone();
        h.engine.state.lock().await.positions.insert(id.clone(), stuck);

        assert_ok!(h.engine.expire_stale_orders(&h.pair(), "none").await);

        let position = h.engine.position(&id).await.unwrap();
        assert_eq!(position.status, HedgeStatus::Failed);
        assert_eq!(position.metadata.failure_reason.as_deref(), Some("pending order expired"));
        assert_eq!(position.leg(1).unwrap().status, LegStatus::Failed);
        // Never submitted, so never expired
        assert_eq!(position.leg(2).unwrap().status, LegStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_order_query_failure_blocks() {
        let h = harness().await;
        h.venue.fail_queries(2, true).await;

        let (gate, reason) = assert_err!(h.engine.expire_stale_orders(&h.pair(), "none").await);
        assert_eq!(gate, Gate::StaleOrders);
        assert!(reason.starts_with("order query for account 2 failed"));

        match h.engine.try_open_pair(&h.pair()).await {
            OpenAttempt::Skipped { gate, .. } => assert_eq!(gate, Gate::StaleOrders),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.venue.market_order_count(1).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_odd_account_dropped() {
        let mut config = two_account_config();
        config.accounts.push(account(3));
        config.pairs = vec![pair("ETH", 7, &[1, 2, 3])];
        let h = harness_with(config).await;
        h.venue.add_account(3, dec!(900)).await;

        let id = h.open().await;
        let position = h.engine.position(&id).await.unwrap();
        assert_eq!(position.legs.len(), 2);
        assert_eq!(h.venue.position_size(3, 7).await, Decimal::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_underfunded_account_leaves_too_few() {
        let h = harness().await;
        let mut pair = h.pair();
        pair.risk_limits.min_balance = dec!(900);

        match h.engine.try_open_pair(&pair).await {
            OpenAttempt::Skipped { gate, reason } => {
                assert_eq!(gate, Gate::Accounts);
                assert_eq!(reason, "1 of 2 accounts funded, need an even count of at least 2");
            }
            other => panic!("unexpected {:?}", other),
        }
        // Reservation released
        assert!(h.engine.positions_for_pair("ETH").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_stop_refuses_at_risk_gate() {
        let h = harness().await;
        h.engine.risk().activate_emergency_stop("test");

        match h.engine.try_open_pair(&h.pair()).await {
            OpenAttempt::Skipped { gate, reason } => {
                assert_eq!(gate, Gate::Risk);
                assert_eq!(reason, "emergency stop active");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.venue.market_order_count(1).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pair_cooldown_after_close() {
        let mut config = two_account_config();
        config.pairs[0].cooldown_minutes = 10;
        let h = harness_with(config).await;
        let id = h.open().await;
        h.engine.close_position(&id, "manual").await.unwrap();

        // Accounts cool down too, so the account gate refuses first
        match h.engine.try_open_pair(&h.pair()).await {
            OpenAttempt::Skipped { gate, .. } => assert_eq!(gate, Gate::Accounts),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pair_cooldown_gate() {
        let mut config = two_account_config();
        config.pairs[0].cooldown_minutes = 10;
        let h = harness_with(config).await;
        h.engine
            .state
            .lock()
            .await
            .last_trade
            .insert("ETH".to_string(), Utc::now() - Duration::minutes(3));

        match h.engine.try_open_pair(&h.pair()).await {
            OpenAttempt::Skipped { gate, reason } => {
                assert_eq!(gate, Gate::Cooldown);
                assert!(reason.contains("of 600s"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_local_record_purged_when_remote_is_flat() {
        let h = harness().await;
        let id = h.open().await;

        // Someone flattened both accounts outside the engine
        h.venue.force_position(1, 7, Decimal::ZERO, dec!(100)).await;
        h.venue.force_position(2, 7, Decimal::ZERO, dec!(100)).await;
        assert_ok!(h.engine.check_overlap(&h.pair(), &[1, 2], "none").await);

        let purged = h.engine.position(&id).await.unwrap();
        assert_eq!(purged.status, HedgeStatus::Failed);
        assert_eq!(purged.metadata.failure_reason.as_deref(), Some("purged: remote shows no exposure"));
        assert!(h.engine.positions_for_pair("ETH").await.is_empty());
        assert_eq!(h.engine.risk().ledger_snapshot().global, Decimal::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_protective_exit_settled_before_reopening() {
        let h = harness().await;
        let first = h.open().await;

        // Both protective orders fill before any management tick runs
        h.venue.set_mid_price(7, dec!(110)).await;
        let attempts = h.engine.run_opportunity_tick().await;

        let closed = h.engine.position(&first).await.unwrap();
        assert_eq!(closed.status, HedgeStatus::Closed);
        assert_eq!(closed.metadata.close_reason.as_deref(), Some("protective_exit"));
        assert_eq!(h.sink.count("oco_triggered"), 2);
        assert_eq!(h.sink.count("position_closed"), 1);

        // The stop-loss leg's loss reached the daily ledger
        let ledger = h.engine.risk().ledger_snapshot();
        assert_eq!(ledger.global, dec!(70));
        assert_eq!(ledger.pair_loss("ETH"), dec!(70));
        let short_account = closed.legs.iter().find(|l| l.side == PositionSide::Short).unwrap().account;
        assert_eq!(ledger.account_loss(short_account), dec!(70));

        match &attempts[0].1 {
            OpenAttempt::Opened(id) => assert_ne!(id, &first),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_open_reports_reason() {
        let h = harness().await;
        h.venue.override_fill_price(2, Some(dec!(102.5))).await;

        match h.engine.try_open_pair(&h.pair()).await {
            OpenAttempt::Failed { reason, .. } => assert!(reason.contains("fill prices diverge")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.venue.position_size(1, 7).await, Decimal::ZERO);
        assert_eq!(h.venue.position_size(2, 7).await, Decimal::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_flips_sides_between_hedges() {
        let h = harness().await;
        let first = h.open().await;
        let first_side: PositionSide = h.engine.position(&first).await.unwrap().leg(1).unwrap().side;
        h.engine.close_position(&first, "manual").await.unwrap();

        let second = h.open().await;
        let second_position = h.engine.position(&second).await.unwrap();
        let second_side = second_position.leg(1).map(|l| l.side);
        assert_eq!(second_side, Some(first_side.opposite()));
        assert_ne!(second_side, second_position.leg(2).map(|l| l.side));
    }
}
