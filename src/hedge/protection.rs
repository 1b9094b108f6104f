//! Protective orders and one-cancels-other enforcement.
//!
//! Every filled leg carries a stop-loss and a take-profit at the shared
//! trigger levels. The venue does not link them, so when one fills the
//! engine cancels its sibling here.

use super::model::{HedgePosition, Leg};
use super::sizing::ProtectiveLevels;
use crate::events::{EngineEvent, EventBus};
use crate::reconcile::{OrderLookup, OrderStatusResolver};
use crate::venue::{MarketId, OrderKind, OrderState, ProtectiveOrderRequest, VenueGateway};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info, warn};

/// What OCO enforcement did for one leg.
#[derive(Debug, Clone, PartialEq)]
pub enum OcoOutcome {
    /// Nothing filled
    Unchanged,
    /// One protective order filled; the sibling was cancelled if still live
    Settled {
        filled: OrderKind,
        fill_price: Option<Decimal>,
        cancelled_order_id: Option<String>,
    },
    /// Both orders report filled; the leg needs review
    BothFilled,
    /// A protective order died without filling and was forgotten
    Dropped(OrderKind),
}

pub struct ProtectionManager {
    venue: Arc<dyn VenueGateway>,
    resolver: Arc<OrderStatusResolver>,
    events: EventBus,
}

impl ProtectionManager {
    pub fn new(venue: Arc<dyn VenueGateway>, resolver: Arc<OrderStatusResolver>, events: EventBus) -> Self {
        Self {
            venue,
            resolver,
            events,
        }
    }

    /// Place stop-loss and take-profit on every filled leg.
    ///
    /// Failures are reported, not rolled back: an unprotected leg is picked
    /// up by the missing-protection check. Returns the number placed.
    pub async fn place(&self, position: &mut HedgePosition, levels: &ProtectiveLevels) -> usize {
        let position_id = position.id.clone();
        let pair_id = position.pair_id.clone();
        let market = position.market;
        let mut placed = 0;

        for leg in position.legs.iter_mut().filter(|l| l.filled_size > Decimal::ZERO) {
            for (kind, trigger) in [
                (OrderKind::StopLoss, levels.stop_loss_for(leg.side)),
                (OrderKind::TakeProfit, levels.take_profit_for(leg.side)),
            ] {
                let request = ProtectiveOrderRequest {
                    account: leg.account,
                    market,
                    kind,
                    side: leg.side.exit_side(),
                    quantity: leg.filled_size,
                    trigger_price: trigger,
                };

                match self.venue.submit_protective_order(&request).await {
                    Ok(handle) => {
                        info!(
                            position = %position_id,
                            account = leg.account,
                            ?kind,
                            trigger = %trigger,
                            order_id = %handle.order_id,
                            "Protective order placed"
                        );
                        match kind {
                            OrderKind::StopLoss => leg.stop_loss_order_id = Some(handle.order_id),
                            _ => leg.take_profit_order_id = Some(handle.order_id),
                        }
                        placed += 1;
                    }
                    Err(e) => {
                        warn!(
                            position = %position_id,
                            account = leg.account,
                            ?kind,
                            error = %e,
                            "Protective order failed"
                        );
                        self.events.publish(EngineEvent::ProtectionFailed {
                            position_id: position_id.clone(),
                            pair_id: pair_id.clone(),
                            account: leg.account,
                            order_kind: kind,
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }
        placed
    }

    /// Enforce OCO on every leg of `position`.
    pub async fn enforce(&self, position: &mut HedgePosition) -> Vec<OcoOutcome> {
        let market = position.market;
        let mut outcomes = Vec::with_capacity(position.legs.len());

        for idx in 0..position.legs.len() {
            let outcome = self.enforce_leg(market, &mut position.legs[idx]).await;
            if let OcoOutcome::Settled {
                filled,
                fill_price,
                cancelled_order_id,
            } = &outcome
            {
                let leg = &mut position.legs[idx];
                let exit = fill_price.or(leg.current_price).or(leg.entry_price);
                if let Some(exit) = exit {
                    let pnl = leg.exit_pnl(exit, leg.filled_size);
                    leg.realized_pnl += pnl;
                    leg.exit_price = Some(exit);
                    position.realized_pnl += pnl;
                }

                self.events.publish(EngineEvent::OcoTriggered {
                    position_id: position.id.clone(),
                    pair_id: position.pair_id.clone(),
                    account: position.legs[idx].account,
                    filled: *filled,
                    cancelled_order_id: cancelled_order_id.clone(),
                });
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Resolve both protective orders of a leg and cancel the survivor
    /// if its sibling filled. Unknown status never counts as filled.
    pub async fn enforce_leg(&self, market: MarketId, leg: &mut Leg) -> OcoOutcome {
        let stop = self.lookup(leg.stop_loss_order_id.as_deref(), leg, market).await;
        let take = self.lookup(leg.take_profit_order_id.as_deref(), leg, market).await;

        let stop_filled = stop.as_ref().is_some_and(OrderLookup::is_filled);
        let take_filled = take.as_ref().is_some_and(OrderLookup::is_filled);

        match (stop_filled, take_filled) {
            (true, true) => {
                error!(account = leg.account, "Both protective orders filled");
                leg.stop_loss_order_id = None;
                leg.take_profit_order_id = None;
                OcoOutcome::BothFilled
            }
            (true, false) => {
                let cancelled = self.cancel_sibling(leg, market, leg.take_profit_order_id.clone(), take.as_ref()).await;
                leg.stop_loss_order_id = None;
                leg.take_profit_order_id = None;
                OcoOutcome::Settled {
                    filled: OrderKind::StopLoss,
                    fill_price: fill_price(stop.as_ref()),
                    cancelled_order_id: cancelled,
                }
            }
            (false, true) => {
                let cancelled = self.cancel_sibling(leg, market, leg.stop_loss_order_id.clone(), stop.as_ref()).await;
                leg.stop_loss_order_id = None;
                leg.take_profit_order_id = None;
                OcoOutcome::Settled {
                    filled: OrderKind::TakeProfit,
                    fill_price: fill_price(take.as_ref()),
                    cancelled_order_id: cancelled,
                }
            }
            (false, false) => {
                // Cancelled or expired without a fill: forget the id
                if is_dead(stop.as_ref()) {
                    warn!(account = leg.account, "Stop-loss gone without fill");
                    leg.stop_loss_order_id = None;
                    return OcoOutcome::Dropped(OrderKind::StopLoss);
                }
                if is_dead(take.as_ref()) {
                    warn!(account = leg.account, "Take-profit gone without fill");
                    leg.take_profit_order_id = None;
                    return OcoOutcome::Dropped(OrderKind::TakeProfit);
                }
                OcoOutcome::Unchanged
            }
        }
    }

    async fn lookup(&self, order_id: Option<&str>, leg: &Leg, market: MarketId) -> Option<OrderLookup> {
        match order_id {
            Some(id) => Some(self.resolver.resolve(id, leg.account, market).await),
            None => None,
        }
    }

    /// Cancel the sibling unless it is already known to be terminal.
    async fn cancel_sibling(
        &self,
        leg: &Leg,
        market: MarketId,
        sibling_id: Option<String>,
        sibling: Option<&OrderLookup>,
    ) -> Option<String> {
        let sibling_id = sibling_id?;
        let terminal = sibling
            .and_then(OrderLookup::state)
            .is_some_and(|s| s.is_terminal());
        if terminal {
            return None;
        }

        match self.venue.cancel_order(leg.account, market, &sibling_id).await {
            Ok(cancelled) => {
                info!(account = leg.account, order_id = %sibling_id, cancelled, "OCO sibling cancelled");
                Some(sibling_id)
            }
            Err(e) => {
                warn!(account = leg.account, order_id = %sibling_id, error = %e, "OCO sibling cancel failed");
                None
            }
        }
    }
}

fn fill_price(lookup: Option<&OrderLookup>) -> Option<Decimal> {
    lookup.and_then(OrderLookup::order).and_then(|o| o.avg_fill_price)
}

fn is_dead(lookup: Option<&OrderLookup>) -> bool {
    lookup
        .and_then(OrderLookup::state)
        .is_some_and(|s| s.is_terminal() && s != OrderState::Filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use crate::hedge::model::LegStatus;
    use crate::reconcile::RetryPolicy;
    use crate::venue::{MockVenueGateway, PositionSide, RemoteOrder, Side};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn remote(order_id: &str, kind: OrderKind, state: OrderState) -> RemoteOrder {
        RemoteOrder {
            order_id: order_id.to_string(),
            client_order_id: None,
            account: 1,
            market: 7,
            kind,
            side: Side::Sell,
            quantity: dec!(1),
            filled_quantity: if state == OrderState::Filled { dec!(1) } else { Decimal::ZERO },
            trigger_price: Some(dec!(95)),
            avg_fill_price: (state == OrderState::Filled).then_some(dec!(95)),
            state,
            created_at: Utc::now(),
        }
    }

    fn protected_leg() -> Leg {
        let mut leg = Leg::new(1, PositionSide::Long, dec!(1));
        leg.filled_size = dec!(1);
        leg.entry_price = Some(dec!(100));
        leg.status = LegStatus::Filled;
        leg.stop_loss_order_id = Some("sl-1".into());
        leg.take_profit_order_id = Some("tp-1".into());
        leg
    }

    fn manager(mock: MockVenueGateway) -> ProtectionManager {
        let venue: Arc<dyn VenueGateway> = Arc::new(mock);
        let resolver = Arc::new(OrderStatusResolver::new(venue.clone(), RetryPolicy::once(), 10));
        ProtectionManager::new(venue, resolver, EventBus::new())
    }

    #[tokio::test]
    async fn test_stop_fill_cancels_live_take_profit_once() {
        let mut mock = MockVenueGateway::new();
        mock.expect_get_order().returning(|_, _, id| {
            Ok(Some(if id == "sl-1" {
                remote("sl-1", OrderKind::StopLoss, OrderState::Filled)
            } else {
                remote("tp-1", OrderKind::TakeProfit, OrderState::Open)
            }))
        });
        mock.expect_cancel_order()
            .times(1)
            .withf(|_, _, id| id == "tp-1")
            .returning(|_, _, _| Ok(true));

        let mut leg = protected_leg();
        let outcome = manager(mock).enforce_leg(7, &mut leg).await;

        assert_eq!(
            outcome,
            OcoOutcome::Settled {
                filled: OrderKind::StopLoss,
                fill_price: Some(dec!(95)),
                cancelled_order_id: Some("tp-1".into()),
            }
        );
        assert!(!leg.has_protection());
    }

    #[tokio::test]
    async fn test_terminal_sibling_is_not_cancelled() {
        let mut mock = MockVenueGateway::new();
        mock.expect_get_order().returning(|_, _, id| {
            Ok(Some(if id == "tp-1" {
                remote("tp-1", OrderKind::TakeProfit, OrderState::Filled)
            } else {
                remote("sl-1", OrderKind::StopLoss, OrderState::Cancelled)
            }))
        });
        mock.expect_cancel_order().never();

        let mut leg = protected_leg();
        let outcome = manager(mock).enforce_leg(7, &mut leg).await;
        assert!(matches!(
            outcome,
            OcoOutcome::Settled {
                filled: OrderKind::TakeProfit,
                cancelled_order_id: None,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unknown_status_takes_no_action() {
        let mut mock = MockVenueGateway::new();
        mock.expect_get_order().returning(|_, _, _| Ok(None));
        mock.expect_get_open_orders().returning(|_, _| Ok(vec![]));
        mock.expect_get_order_history().returning(|_, _, _| Ok(vec![]));
        mock.expect_cancel_order().never();

        let mut leg = protected_leg();
        let outcome = manager(mock).enforce_leg(7, &mut leg).await;
        assert_eq!(outcome, OcoOutcome::Unchanged);
        assert!(leg.has_protection());
    }

    #[tokio::test]
    async fn test_settled_leg_books_pnl_and_event() {
        let mut mock = MockVenueGateway::new();
        mock.expect_get_order().returning(|_, _, id| {
            Ok(Some(if id == "sl-1" {
                remote("sl-1", OrderKind::StopLoss, OrderState::Filled)
            } else {
                remote("tp-1", OrderKind::TakeProfit, OrderState::Open)
            }))
        });
        mock.expect_cancel_order().returning(|_, _, _| Ok(true));

        let venue: Arc<dyn VenueGateway> = Arc::new(mock);
        let resolver = Arc::new(OrderStatusResolver::new(venue.clone(), RetryPolicy::once(), 10));
        let sink = Arc::new(RecordingSink::new());
        let manager = ProtectionManager::new(venue, resolver, EventBus::new().with_sink(sink.clone()));

        let mut position = HedgePosition::opening("ETH", 7, 1);
        position.legs = vec![protected_leg()];
        manager.enforce(&mut position).await;

        assert_eq!(position.legs[0].exit_price, Some(dec!(95)));
        assert_eq!(position.realized_pnl, dec!(-5));
        assert_eq!(sink.count("oco_triggered"), 1);
    }
}
