//! Dual-leg execution protocol.
//!
//! Opening runs clean slate, sizing, and one shared reference price before
//! a bounded fan-out of entry orders. Any leg failure unwinds every leg.
//! Closing sizes each opposing order from the account's current remote
//! position and verifies flatness before calling the hedge CLOSED.

use super::error::HedgeError;
use super::model::{HedgePosition, HedgeStatus, Leg, LegStatus};
use super::protection::ProtectionManager;
use super::sizing::{resolve_stop_distance, size_legs, ProtectiveLevels, StopPolicy};
use crate::config::{Config, PairConfig, StopDistanceMode};
use crate::events::{EngineEvent, EventBus, Residual};
use crate::reconcile::{retry_transient, retry_until, Attempt, OrderStatusResolver, RetryPolicy};
use crate::utils::{divergence_from_max, divergence_from_min, safe_div, to_basis_points, weighted_average};
use crate::venue::{AccountId, MarketId, OrderHandle, OrderState, PositionSide, Side, VenueError, VenueGateway};
use chrono::Utc;
use futures_util::future::join_all;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Tolerances and retry budgets for the protocol.
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub leg_timeout: Duration,
    pub fill_price_tolerance: Decimal,
    pub size_tolerance: Decimal,
    pub flat_epsilon: Decimal,
    pub stop_policy: StopPolicy,
    pub close_verify: RetryPolicy,
    pub query_retry: RetryPolicy,
}

impl ExecutionSettings {
    pub fn from_config(config: &Config) -> Self {
        let recon = &config.reconciliation;
        Self {
            leg_timeout: config.engine.leg_submit_timeout(),
            fill_price_tolerance: config.execution.fill_price_tolerance,
            size_tolerance: config.execution.size_tolerance,
            flat_epsilon: recon.flat_size_epsilon,
            stop_policy: StopPolicy::from_config(&config.execution),
            close_verify: RetryPolicy::from_millis(recon.close_verify_attempts, recon.close_verify_delay_ms),
            query_retry: RetryPolicy::from_millis(recon.status_attempts, recon.status_retry_delay_ms),
        }
    }
}

/// One market order in a fan-out group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegOrder {
    pub account: AccountId,
    pub side: Side,
    pub quantity: Decimal,
}

/// How a close attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseOutcome {
    Closed { realized_pnl: Decimal },
    PendingClose { residual: Vec<Residual> },
}

pub struct HedgeExecutor {
    venue: Arc<dyn VenueGateway>,
    resolver: Arc<OrderStatusResolver>,
    protection: ProtectionManager,
    events: EventBus,
    settings: ExecutionSettings,
}

impl HedgeExecutor {
    pub fn new(venue: Arc<dyn VenueGateway>, config: &Config, events: EventBus) -> Self {
        let recon = &config.reconciliation;
        let resolver = Arc::new(OrderStatusResolver::new(
            venue.clone(),
            RetryPolicy::from_millis(recon.status_attempts, recon.status_retry_delay_ms),
            recon.history_scan_limit,
        ));
        let protection = ProtectionManager::new(venue.clone(), resolver.clone(), events.clone());

        Self {
            venue,
            resolver,
            protection,
            events,
            settings: ExecutionSettings::from_config(config),
        }
    }

    pub fn settings(&self) -> &ExecutionSettings {
        &self.settings
    }

    pub fn protection(&self) -> &ProtectionManager {
        &self.protection
    }

    pub fn resolver(&self) -> &OrderStatusResolver {
        &self.resolver
    }

    /// Open `position` on `pair` with the given account sides.
    ///
    /// On error the position is FAILED with a reason, every leg has been
    /// unwound best-effort, and an `open_failed` event was published.
    pub async fn open(
        &self,
        position: &mut HedgePosition,
        pair: &PairConfig,
        assignment: &[(AccountId, PositionSide)],
    ) -> Result<(), HedgeError> {
        match self.try_open(position, pair, assignment).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(position = %position.id, pair = %pair.id, error = %e, "Hedge open failed");
                position.mark_failed(e.to_string());
                self.events.publish(EngineEvent::OpenFailed {
                    position_id: position.id.clone(),
                    pair_id: position.pair_id.clone(),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn try_open(
        &self,
        position: &mut HedgePosition,
        pair: &PairConfig,
        assignment: &[(AccountId, PositionSide)],
    ) -> Result<(), HedgeError> {
        if assignment.len() < 2 {
            return Err(HedgeError::InsufficientAccounts {
                available: assignment.len(),
                required: 2,
            });
        }
        let market = pair.market;

        // Clean slate, best-effort
        for (account, _) in assignment {
            if let Err(e) = self.flatten(*account, market).await {
                warn!(account, market, error = %e, "Clean slate incomplete");
            }
        }

        let mut balances = Vec::with_capacity(assignment.len());
        for (account, _) in assignment {
            let balance = retry_transient(self.settings.query_retry, "get_balance", || {
                self.venue.get_balance(*account)
            })
            .await?;
            balances.push(balance.available);
        }

        let book = retry_transient(self.settings.query_retry, "get_best_bid_ask", || {
            self.venue.get_best_bid_ask(market)
        })
        .await?;
        let spread = book.spread_ratio().ok_or(HedgeError::InvalidBook(market))?;
        if spread > pair.max_spread {
            return Err(HedgeError::SpreadTooWide {
                spread,
                max: pair.max_spread,
            });
        }
        let reference_price = book.mid();

        let sizing = size_legs(
            &balances,
            pair.risk_limits.min_balance,
            pair.risk_limits.max_position_size,
            pair.leverage_decimal(),
            reference_price,
            pair.quantity_step,
        )?;
        position.metadata.reference_price = Some(reference_price);
        position.metadata.margin_per_leg = sizing.margin_per_leg;
        position.metadata.notional_per_leg = sizing.notional_per_leg;
        position.legs = assignment
            .iter()
            .map(|(account, side)| Leg::new(*account, *side, sizing.quantity))
            .collect();

        info!(
            position = %position.id,
            pair = %pair.id,
            market,
            reference = %reference_price,
            quantity = %sizing.quantity,
            margin = %sizing.margin_per_leg,
            "Submitting hedge legs"
        );

        let orders: Vec<LegOrder> = position
            .legs
            .iter()
            .map(|l| LegOrder {
                account: l.account,
                side: l.side.entry_side(),
                quantity: l.target_size,
            })
            .collect();
        let results = self.submit_group(market, &orders).await;

        let mut first_error = None;
        for (leg, result) in position.legs.iter_mut().zip(results) {
            leg.submitted_at = Some(Utc::now());
            match result {
                Ok(handle) => record_entry(leg, &handle),
                Err(e) => {
                    warn!(account = leg.account, error = %e, "Entry leg failed");
                    leg.status = LegStatus::Failed;
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            self.unwind(position).await;
            return Err(e);
        }

        // Fills the handle did not acknowledge are confirmed remotely
        for idx in 0..position.legs.len() {
            if position.legs[idx].status == LegStatus::Filled && position.legs[idx].entry_price.is_some() {
                continue;
            }
            let account = position.legs[idx].account;
            let lookup = match position.legs[idx].open_order_id.clone() {
                Some(order_id) => Some(self.resolver.resolve(&order_id, account, market).await),
                None => None,
            };
            match lookup.as_ref().and_then(|l| l.order()) {
                Some(order) if order.state == OrderState::Filled && order.avg_fill_price.is_some() => {
                    let leg = &mut position.legs[idx];
                    leg.filled_size = order.filled_quantity;
                    leg.entry_price = order.avg_fill_price;
                    leg.status = LegStatus::Filled;
                }
                _ => {
                    self.unwind(position).await;
                    return Err(HedgeError::Unconfirmed { account });
                }
            }
        }

        for leg in &position.legs {
            let Some(fill) = leg.entry_price else { continue };
            let slippage = safe_div((fill - reference_price).abs(), reference_price);
            if slippage > pair.risk_limits.max_slippage {
                warn!(
                    account = leg.account,
                    %fill,
                    reference = %reference_price,
                    slippage_bps = %to_basis_points(slippage).round_dp(1),
                    "Entry slippage above limit"
                );
            }
        }

        let prices: Vec<Decimal> = position.legs.iter().filter_map(|l| l.entry_price).collect();
        let price_divergence = divergence_from_min(&prices);
        position.metadata.entry_prices = prices;
        position.metadata.fill_divergence = Some(price_divergence);
        if price_divergence > self.settings.fill_price_tolerance {
            self.unwind(position).await;
            return Err(HedgeError::FillDivergence {
                divergence: price_divergence,
                tolerance: self.settings.fill_price_tolerance,
            });
        }

        let sizes: Vec<Decimal> = position.legs.iter().map(|l| l.filled_size).collect();
        let size_divergence = divergence_from_max(&sizes);
        if size_divergence > self.settings.size_tolerance {
            self.unwind(position).await;
            return Err(HedgeError::SizeDivergence {
                divergence: size_divergence,
                tolerance: self.settings.size_tolerance,
            });
        }

        let fills: Vec<(Decimal, Decimal)> = position
            .legs
            .iter()
            .filter_map(|l| l.entry_price.map(|p| (p, l.filled_size)))
            .collect();
        let basis = weighted_average(&fills);
        position.metadata.avg_entry_price = Some(basis);
        position.update_marks(reference_price);
        position.transition(HedgeStatus::Active)?;

        let mode = pair.stop_distance_mode().unwrap_or_else(|e| {
            warn!(pair = %pair.id, error = %e, "Unreadable stop distance, using auto");
            StopDistanceMode::Auto
        });
        let stop = resolve_stop_distance(mode, pair.leverage, &self.settings.stop_policy);
        if stop.capped {
            warn!(
                pair = %pair.id,
                configured = %pair.stop_take_distance,
                used = %stop.distance,
                "Manual stop distance capped"
            );
        }
        let levels = ProtectiveLevels::new(basis, stop.distance);
        position.metadata.stop_distance = Some(stop.distance);
        position.metadata.stop_distance_capped = stop.capped;
        position.metadata.lower_trigger = Some(levels.lower);
        position.metadata.upper_trigger = Some(levels.upper);

        let placed = self.protection.place(position, &levels).await;

        info!(
            position = %position.id,
            pair = %pair.id,
            basis = %basis,
            distance = %stop.distance,
            protective_orders = placed,
            "Hedge active"
        );
        self.events.publish(EngineEvent::PositionOpened {
            position_id: position.id.clone(),
            pair_id: position.pair_id.clone(),
            legs: position.leg_summaries(),
            reference_price,
            avg_entry_price: basis,
            stop_distance: stop.distance,
        });
        Ok(())
    }

    /// Close every leg at its current remote size.
    ///
    /// Every submit failing returns the position to ACTIVE. Exposure that
    /// survives verification leaves it in PENDING_CLOSE.
    pub async fn close(&self, position: &mut HedgePosition, reason: &str) -> Result<CloseOutcome, HedgeError> {
        position.transition(HedgeStatus::Closing)?;
        position.metadata.close_reason = Some(reason.to_string());
        let market = position.market;
        info!(position = %position.id, pair = %position.pair_id, reason, "Closing hedge");

        let reference = match retry_transient(self.settings.query_retry, "get_best_bid_ask", || {
            self.venue.get_best_bid_ask(market)
        })
        .await
        {
            Ok(book) => Some(book.mid()),
            Err(e) => {
                warn!(position = %position.id, error = %e, "No reference price for close");
                None
            }
        };

        let mut orders = Vec::new();
        for leg in &position.legs {
            let net = match self.remote_net(leg.account, market).await {
                Ok(net) => net,
                Err(e) => {
                    warn!(account = leg.account, error = %e, "Position query failed, using recorded size");
                    if leg.is_settled() {
                        Decimal::ZERO
                    } else {
                        leg.signed_size()
                    }
                }
            };
            if net.abs() <= self.settings.flat_epsilon {
                continue;
            }
            orders.push(LegOrder {
                account: leg.account,
                side: if net > Decimal::ZERO { Side::Sell } else { Side::Buy },
                quantity: net.abs(),
            });
        }

        let results = self.submit_group(market, &orders).await;
        let failures = results.iter().filter(|r| r.is_err()).count();
        if !orders.is_empty() && failures == orders.len() {
            error!(position = %position.id, "Every close order failed, hedge stays active");
            position.transition(HedgeStatus::Active)?;
            position.metadata.close_reason = Some(format!("close rejected ({})", reason));
            return Err(HedgeError::CloseRejected);
        }

        for (order, result) in orders.iter().zip(results) {
            match result {
                Ok(handle) => {
                    let exit = handle.avg_fill_price.or(reference);
                    let quantity = if handle.filled_quantity > Decimal::ZERO {
                        handle.filled_quantity
                    } else {
                        order.quantity
                    };
                    let mut pnl = Decimal::ZERO;
                    if let (Some(leg), Some(exit)) = (position.leg_mut(order.account), exit) {
                        pnl = leg.exit_pnl(exit, quantity.min(leg.filled_size));
                        leg.realized_pnl += pnl;
                        leg.exit_price = Some(exit);
                    }
                    position.realized_pnl += pnl;
                    info!(account = order.account, side = %order.side, quantity = %order.quantity, "Close leg submitted");
                }
                Err(e) => warn!(account = order.account, error = %e, "Close leg failed"),
            }
        }

        self.cancel_protection(position).await;
        self.verify_closed(position).await
    }

    /// Every leg exited through a protective fill; confirm flatness and
    /// record the close. Returns false when exposure remains.
    pub async fn complete_protective_exit(&self, position: &mut HedgePosition) -> Result<bool, HedgeError> {
        let accounts = position.accounts();
        let residual = self.residuals(&accounts, position.market).await?;
        if !residual.is_empty() {
            return Ok(false);
        }

        position.transition(HedgeStatus::Closing)?;
        position.metadata.close_reason = Some("protective_exit".to_string());
        self.cancel_protection(position).await;
        self.finish_closed(position)?;
        Ok(true)
    }

    /// Re-check a PENDING_CLOSE hedge. Returns the remaining exposure.
    pub async fn recheck_pending(&self, position: &mut HedgePosition) -> Result<Vec<Residual>, HedgeError> {
        let residual = self.residuals(&position.accounts(), position.market).await?;
        if residual.is_empty() {
            self.finish_closed(position)?;
        }
        Ok(residual)
    }

    async fn verify_closed(&self, position: &mut HedgePosition) -> Result<CloseOutcome, HedgeError> {
        let accounts = position.accounts();
        let accounts_ref = &accounts;
        let market = position.market;

        let flat = retry_until(self.settings.close_verify, "close_verify", |_| async move {
            match self.residuals(accounts_ref, market).await {
                Ok(residual) if residual.is_empty() => Attempt::Done(()),
                Ok(residual) => Attempt::Retry(format!("{} accounts still exposed", residual.len())),
                Err(e) => Attempt::Retry(e.to_string()),
            }
        })
        .await;

        if flat.is_some() {
            let realized_pnl = position.realized_pnl;
            self.finish_closed(position)?;
            return Ok(CloseOutcome::Closed { realized_pnl });
        }

        let residual = self.residuals(&accounts, market).await.unwrap_or_default();
        position.transition(HedgeStatus::PendingClose)?;
        position.metadata.manual_intervention = true;
        error!(
            position = %position.id,
            pair = %position.pair_id,
            residual = ?residual,
            "Exposure remains after close, awaiting confirmation"
        );
        self.events.publish(EngineEvent::PendingClose {
            position_id: position.id.clone(),
            pair_id: position.pair_id.clone(),
            residual: residual.clone(),
        });
        Ok(CloseOutcome::PendingClose { residual })
    }

    fn finish_closed(&self, position: &mut HedgePosition) -> Result<(), HedgeError> {
        position.transition(HedgeStatus::Closed)?;
        position.metadata.manual_intervention = false;
        position.unrealized_pnl = Decimal::ZERO;
        let reason = position
            .metadata
            .close_reason
            .clone()
            .unwrap_or_else(|| "closed".to_string());

        info!(
            position = %position.id,
            pair = %position.pair_id,
            %reason,
            realized = %position.realized_pnl,
            "Hedge closed"
        );
        self.events.publish(EngineEvent::PositionClosed {
            position_id: position.id.clone(),
            pair_id: position.pair_id.clone(),
            reason,
            realized_pnl: position.realized_pnl,
        });
        Ok(())
    }

    async fn cancel_protection(&self, position: &mut HedgePosition) {
        let market = position.market;
        for leg in &mut position.legs {
            let ids = [leg.stop_loss_order_id.take(), leg.take_profit_order_id.take()];
            for order_id in ids.into_iter().flatten() {
                if let Err(e) = self.venue.cancel_order(leg.account, market, &order_id).await {
                    warn!(account = leg.account, %order_id, error = %e, "Protective cancel failed");
                }
            }
        }
    }

    /// Cancel live entry orders and flatten every leg's account.
    pub async fn unwind(&self, position: &mut HedgePosition) {
        warn!(position = %position.id, pair = %position.pair_id, "Unwinding hedge legs");
        let market = position.market;

        for leg in &mut position.legs {
            if leg.status == LegStatus::Pending {
                if let Some(order_id) = &leg.open_order_id {
                    if let Err(e) = self.venue.cancel_order(leg.account, market, order_id).await {
                        warn!(account = leg.account, %order_id, error = %e, "Entry cancel failed");
                    }
                }
            }

            match self.flatten(leg.account, market).await {
                Ok(closed) if closed > Decimal::ZERO => {
                    info!(account = leg.account, quantity = %closed, "Leg unwound");
                }
                Ok(_) => {}
                Err(e) => {
                    error!(account = leg.account, error = %e, "Unwind incomplete, left to reconciliation");
                }
            }
            if leg.status != LegStatus::Failed {
                leg.status = LegStatus::Cancelled;
            }
        }
    }

    /// Cancel every open order and close any position on one account.
    /// Returns the quantity closed; a flat account is a no-op.
    pub async fn flatten(&self, account: AccountId, market: MarketId) -> Result<Decimal, VenueError> {
        for order in self.venue.get_open_orders(account, market).await? {
            if let Err(e) = self.venue.cancel_order(account, market, &order.order_id).await {
                warn!(account, order_id = %order.order_id, error = %e, "Cancel during flatten failed");
            }
        }

        let mut closed = Decimal::ZERO;
        for position in self.venue.get_positions(account, market).await? {
            if !position.is_open(self.settings.flat_epsilon) {
                continue;
            }
            let Some(side) = position.side() else {
                continue;
            };
            self.venue
                .submit_market_order(account, market, side.exit_side(), position.abs_size())
                .await?;
            closed += position.abs_size();
        }
        Ok(closed)
    }

    /// Accounts whose fresh remote position is not flat.
    pub async fn residuals(&self, accounts: &[AccountId], market: MarketId) -> Result<Vec<Residual>, VenueError> {
        let mut residual = Vec::new();
        for account in accounts {
            let net = self.remote_net(*account, market).await?;
            if net.abs() > self.settings.flat_epsilon {
                residual.push(Residual {
                    account: *account,
                    size: net,
                });
            }
        }
        Ok(residual)
    }

    async fn remote_net(&self, account: AccountId, market: MarketId) -> Result<Decimal, VenueError> {
        let positions = self.venue.get_positions(account, market).await?;
        Ok(positions
            .iter()
            .filter(|p| p.is_open(self.settings.flat_epsilon))
            .map(|p| p.size)
            .sum())
    }

    /// Submit `orders` concurrently under one shared deadline.
    async fn submit_group(&self, market: MarketId, orders: &[LegOrder]) -> Vec<Result<OrderHandle, HedgeError>> {
        let timeout = self.settings.leg_timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        let venue = &self.venue;

        let submits = orders.iter().map(|order| async move {
            match tokio::time::timeout_at(
                deadline,
                venue.submit_market_order(order.account, market, order.side, order.quantity),
            )
            .await
            {
                Ok(Ok(handle)) => Ok(handle),
                Ok(Err(source)) => Err(HedgeError::LegFailed {
                    account: order.account,
                    source,
                }),
                Err(_) => Err(HedgeError::LegTimeout {
                    account: order.account,
                    after: timeout,
                }),
            }
        });
        join_all(submits).await
    }
}

fn record_entry(leg: &mut Leg, handle: &OrderHandle) {
    leg.open_order_id = Some(handle.order_id.clone());
    if handle.is_filled() {
        leg.filled_size = handle.filled_quantity;
        leg.entry_price = handle.avg_fill_price;
        leg.status = LegStatus::Filled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::fixtures::two_account_config;
    use crate::events::RecordingSink;
    use crate::venue::PaperVenue;
    use rust_decimal_macros::dec;

    struct Harness {
        venue: Arc<PaperVenue>,
        executor: HedgeExecutor,
        sink: Arc<RecordingSink>,
        config: Config,
    }

    async fn harness() -> Harness {
        let config = two_account_config();
        let venue = Arc::new(PaperVenue::frictionless());
        venue.add_account(1, dec!(1000)).await;
        venue.add_account(2, dec!(800)).await;
        venue.set_mid_price(7, dec!(100)).await;

        let sink = Arc::new(RecordingSink::new());
        let events = EventBus::new().with_sink(sink.clone());
        let executor = HedgeExecutor::new(venue.clone(), &config, events);
        Harness {
            venue,
            executor,
            sink,
            config,
        }
    }

    fn sides() -> Vec<(AccountId, PositionSide)> {
        vec![(1, PositionSide::Long), (2, PositionSide::Short)]
    }

    async fn open_active(h: &Harness) -> HedgePosition {
        let pair = h.config.pair("ETH").unwrap().clone();
        let mut position = HedgePosition::opening("ETH", 7, 1);
        h.executor.open(&mut position, &pair, &sides()).await.unwrap();
        position
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_sizes_from_smallest_account() {
        let h = harness().await;
        let position = open_active(&h).await;

        assert_eq!(position.status, HedgeStatus::Active);
        assert_eq!(position.metadata.margin_per_leg, dec!(700));
        assert_eq!(position.metadata.notional_per_leg, dec!(700));
        assert_eq!(h.venue.position_size(1, 7).await, dec!(7));
        assert_eq!(h.venue.position_size(2, 7).await, dec!(-7));
        assert!(position.is_balanced(dec!(0.05)));

        // Mirrored triggers at 5% around the average fill
        let long = &position.legs[0];
        assert!(long.stop_loss_order_id.is_some() && long.take_profit_order_id.is_some());
        assert_eq!(position.metadata.lower_trigger, Some(dec!(95)));
        assert_eq!(position.metadata.upper_trigger, Some(dec!(105)));
        assert_eq!(h.venue.live_orders(2, 7).await.len(), 2);
        assert_eq!(h.sink.count("position_opened"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_divergent_fills_fail_and_unwind() {
        let h = harness().await;
        h.venue.override_fill_price(2, Some(dec!(102.5))).await;
        let pair = h.config.pair("ETH").unwrap().clone();
        let mut position = HedgePosition::opening("ETH", 7, 1);

        let err = h.executor.open(&mut position, &pair, &sides()).await.unwrap_err();

        assert!(matches!(err, HedgeError::FillDivergence { .. }));
        assert_eq!(position.status, HedgeStatus::Failed);
        assert_eq!(position.metadata.fill_divergence, Some(dec!(0.025)));
        assert_eq!(h.venue.position_size(1, 7).await, Decimal::ZERO);
        assert_eq!(h.venue.position_size(2, 7).await, Decimal::ZERO);
        assert!(h.venue.live_orders(1, 7).await.is_empty());
        assert_eq!(h.sink.count("open_failed"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_leg_unwinds_filled_leg() {
        let h = harness().await;
        h.venue.reject_market_orders(2, true).await;
        let pair = h.config.pair("ETH").unwrap().clone();
        let mut position = HedgePosition::opening("ETH", 7, 1);

        let err = h.executor.open(&mut position, &pair, &sides()).await.unwrap_err();

        assert!(matches!(err, HedgeError::LegFailed { account: 2, .. }));
        assert_eq!(position.status, HedgeStatus::Failed);
        assert_eq!(h.venue.position_size(1, 7).await, Decimal::ZERO);
        assert_eq!(position.legs[0].status, LegStatus::Cancelled);
        assert_eq!(position.legs[1].status, LegStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_leg_times_out_and_unwinds() {
        let h = harness().await;
        h.venue.delay_submits(2, Some(Duration::from_secs(60))).await;
        let pair = h.config.pair("ETH").unwrap().clone();
        let mut position = HedgePosition::opening("ETH", 7, 1);

        let err = h.executor.open(&mut position, &pair, &sides()).await.unwrap_err();

        assert!(matches!(err, HedgeError::LegTimeout { account: 2, .. }));
        assert_eq!(position.status, HedgeStatus::Failed);
        assert_eq!(h.venue.position_size(1, 7).await, Decimal::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wide_spread_aborts_before_orders() {
        let config = two_account_config();
        let venue = Arc::new(PaperVenue::new(Decimal::ZERO, dec!(0.02)));
        venue.add_account(1, dec!(1000)).await;
        venue.add_account(2, dec!(1000)).await;
        venue.set_mid_price(7, dec!(100)).await;
        let executor = HedgeExecutor::new(venue.clone(), &config, EventBus::new());

        let pair = config.pair("ETH").unwrap().clone();
        let mut position = HedgePosition::opening("ETH", 7, 1);
        let err = executor.open(&mut position, &pair, &sides()).await.unwrap_err();

        assert!(matches!(err, HedgeError::SpreadTooWide { .. }));
        assert_eq!(venue.market_order_count(1).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_protection_failure_keeps_hedge_open() {
        let h = harness().await;
        h.venue.reject_protective_orders(true).await;
        let position = open_active(&h).await;

        assert_eq!(position.status, HedgeStatus::Active);
        assert!(!position.legs[0].has_protection());
        assert_eq!(h.sink.count("protection_failed"), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_with_native_ids_confirms_by_handle() {
        let h = harness().await;
        h.venue.use_venue_native_ids(true).await;
        let position = open_active(&h).await;
        assert_eq!(position.status, HedgeStatus::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_flattens_and_cancels_protection() {
        let h = harness().await;
        let mut position = open_active(&h).await;
        h.venue.set_mid_price(7, dec!(102)).await;

        let outcome = h.executor.close(&mut position, "manual").await.unwrap();

        assert_eq!(outcome, CloseOutcome::Closed { realized_pnl: Decimal::ZERO });
        assert_eq!(position.status, HedgeStatus::Closed);
        assert_eq!(position.legs[0].realized_pnl, dec!(14));
        assert_eq!(position.legs[1].realized_pnl, dec!(-14));
        assert!(h.venue.live_orders(1, 7).await.is_empty());
        assert!(h.venue.live_orders(2, 7).await.is_empty());
        assert_eq!(h.sink.count("position_closed"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sticky_position_goes_pending_close() {
        let h = harness().await;
        let mut position = open_active(&h).await;
        h.venue.freeze_positions(2, true).await;

        let outcome = h.executor.close(&mut position, "manual").await.unwrap();

        match outcome {
            CloseOutcome::PendingClose { residual } => {
                assert_eq!(residual, vec![Residual { account: 2, size: dec!(-7) }]);
            }
            other => panic!("expected pending close, got {:?}", other),
        }
        assert_eq!(position.status, HedgeStatus::PendingClose);
        assert!(position.metadata.manual_intervention);
        assert_eq!(h.sink.count("pending_close"), 1);

        h.venue.freeze_positions(2, false).await;
        h.venue.force_position(2, 7, Decimal::ZERO, dec!(100)).await;
        let residual = h.executor.recheck_pending(&mut position).await.unwrap();
        assert!(residual.is_empty());
        assert_eq!(position.status, HedgeStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_close_orders_failing_reverts_to_active() {
        let h = harness().await;
        let mut position = open_active(&h).await;
        h.venue.reject_market_orders(1, true).await;
        h.venue.reject_market_orders(2, true).await;

        let err = h.executor.close(&mut position, "manual").await.unwrap_err();

        assert_eq!(err, HedgeError::CloseRejected);
        assert_eq!(position.status, HedgeStatus::Active);
        assert!(position.legs[0].has_protection());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flatten_is_idempotent() {
        let h = harness().await;
        h.venue.force_position(1, 7, dec!(3), dec!(100)).await;

        assert_eq!(h.executor.flatten(1, 7).await.unwrap(), dec!(3));
        assert_eq!(h.executor.flatten(1, 7).await.unwrap(), Decimal::ZERO);
        assert_eq!(h.venue.position_size(1, 7).await, Decimal::ZERO);
    }
}
