//! Position management tick.
//!
//! For each pair:
//! 1. ACTIVE hedges get OCO enforcement, fresh marks, protective exit
//!    completion and the emergency move check
//! 2. Remote state is fingerprinted and fed to the strike trackers
//! 3. A confirmed anomaly flattens every account of the pair
//!
//! Pairs with a hedge in flight (OPENING, CLOSING, PENDING_CLOSE, or
//! checked out) are not fingerprinted; their remote state is expected to
//! be transient or already awaiting confirmation.

use super::{residual_fingerprint, HedgeEngine};
use crate::config::PairConfig;
use crate::events::EngineEvent;
use crate::hedge::{emergency_move_threshold, HedgeId, HedgePosition, HedgeStatus};
use crate::reconcile::{
    imbalance_fingerprint, inconsistency_fingerprint, missing_protection_fingerprint, AccountObservation,
    AnomalyKind,
};
use crate::utils::safe_div;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

impl HedgeEngine {
    /// One pass over every configured pair.
    pub async fn run_management_tick(&self) {
        self.retire_terminal().await;
        for pair in &self.config.pairs {
            self.manage_pair(pair).await;
        }
    }

    /// Move CLOSED and FAILED positions into the history ring. Positions
    /// awaiting manual intervention stay until acknowledged.
    async fn retire_terminal(&self) {
        let mut state = self.state.lock().await;
        let done: Vec<HedgeId> = state
            .positions
            .values()
            .filter(|p| p.status.is_terminal() && !p.metadata.manual_intervention && !state.busy.contains(&p.id))
            .map(|p| p.id.clone())
            .collect();
        for id in done {
            if let Some(position) = state.positions.remove(&id) {
                debug!(position = %id, status = %position.status, "Retired position");
                state.retire(position);
            }
        }
    }

    async fn manage_pair(&self, pair: &PairConfig) {
        let active: Vec<HedgeId> = {
            let state = self.state.lock().await;
            state
                .pair_positions(&pair.id)
                .filter(|p| p.status == HedgeStatus::Active && !state.busy.contains(&p.id))
                .map(|p| p.id.clone())
                .collect()
        };

        for id in active {
            let Ok(mut position) = self.state.lock().await.checkout(&id) else {
                continue;
            };
            self.manage_active(&mut position, pair).await;
            self.checkin(position).await;
        }

        self.detect_anomalies(pair).await;
    }

    async fn manage_active(&self, position: &mut HedgePosition, pair: &PairConfig) {
        self.executor.protection().enforce(position).await;

        match self.venue.get_best_bid_ask(position.market).await {
            Ok(book) if book.spread_ratio().is_some() => position.update_marks(book.mid()),
            Ok(_) => debug!(market = position.market, "Empty book, marks unchanged"),
            Err(e) => warn!(market = position.market, error = %e, "Mark price query failed"),
        }

        if !position.legs.is_empty() && position.legs.iter().all(|l| l.is_settled()) {
            match self.executor.complete_protective_exit(position).await {
                Ok(true) => self.record_close(position).await,
                Ok(false) => debug!(position = %position.id, "Protective exit filled, waiting for flat accounts"),
                Err(e) => warn!(position = %position.id, error = %e, "Protective exit check failed"),
            }
            return;
        }

        let (Some(avg), Some(mark)) = (
            position.metadata.avg_entry_price,
            position.legs.first().and_then(|l| l.current_price),
        ) else {
            return;
        };
        let moved = safe_div((mark - avg).abs(), avg);
        let threshold = emergency_move_threshold(pair.leverage, &self.config.execution);
        if moved <= threshold {
            return;
        }

        error!(
            position = %position.id,
            pair = %position.pair_id,
            %avg,
            %mark,
            %moved,
            %threshold,
            "🚨 Emergency move, closing hedge"
        );
        match self.executor.close(position, "emergency_stop").await {
            Ok(_) => self.record_close(position).await,
            Err(e) => error!(position = %position.id, error = %e, "Emergency close failed"),
        }
    }

    /// Fingerprint remote state for the pair and act on confirmed anomalies.
    async fn detect_anomalies(&self, pair: &PairConfig) {
        {
            let state = self.state.lock().await;
            if state.manual_holds.contains_key(&pair.id) {
                return;
            }
            let in_flight = [HedgeStatus::Opening, HedgeStatus::Closing, HedgeStatus::PendingClose];
            if state.pair_has(&pair.id, &in_flight)
                || state.pair_positions(&pair.id).any(|p| state.busy.contains(&p.id))
            {
                return;
            }
        }

        let Some(observations) = self.observe_pair(pair).await else {
            return;
        };
        let epsilon = self.config.reconciliation.flat_size_epsilon;
        let tolerance = self.config.execution.size_tolerance;

        for kind in AnomalyKind::ALL {
            let fingerprint = match kind {
                AnomalyKind::PositionInconsistency => inconsistency_fingerprint(&observations, epsilon),
                AnomalyKind::SizeImbalance => imbalance_fingerprint(&observations, epsilon, tolerance),
                AnomalyKind::MissingProtection => missing_protection_fingerprint(&observations, epsilon),
            };

            let fired = {
                let mut state = self.state.lock().await;
                match &fingerprint {
                    None => {
                        state.anomalies.resolve(&pair.id, kind);
                        false
                    }
                    Some(fp) => state.anomalies.observe(&pair.id, kind, fp),
                }
            };

            if let (true, Some(fp)) = (fired, fingerprint) {
                self.remediate_pair(pair, kind, &fp).await;
                return;
            }
        }
    }

    /// Fresh positions and open orders for every account of the pair.
    /// `None` if any query fails.
    async fn observe_pair(&self, pair: &PairConfig) -> Option<Vec<AccountObservation>> {
        let mut observations = Vec::with_capacity(pair.accounts.len());
        for account in &pair.accounts {
            let positions = self.venue.get_positions(*account, pair.market).await;
            let orders = self.venue.get_open_orders(*account, pair.market).await;
            match (positions, orders) {
                (Ok(positions), Ok(orders)) => {
                    observations.push(AccountObservation::new(*account, positions, orders));
                }
                (Err(e), _) | (_, Err(e)) => {
                    warn!(pair = %pair.id, account, error = %e, "Observation failed, skipping detection");
                    return None;
                }
            }
        }
        Some(observations)
    }

    /// Flatten every account of the pair and drop its local records.
    ///
    /// Exposure that survives leaves the local positions FAILED with
    /// manual intervention requested and holds the pair until an operator
    /// acknowledges it. Otherwise the trackers restart.
    async fn remediate_pair(&self, pair: &PairConfig, kind: AnomalyKind, fingerprint: &str) {
        warn!(pair = %pair.id, %kind, fingerprint, "🔧 Remediating pair");

        for account in &pair.accounts {
            match self.executor.flatten(*account, pair.market).await {
                Ok(closed) if closed > Decimal::ZERO => info!(account, quantity = %closed, "Flattened account"),
                Ok(_) => {}
                Err(e) => warn!(account, error = %e, "Flatten failed"),
            }
        }

        let (success, detail) = match self.executor.residuals(&pair.accounts, pair.market).await {
            Ok(residual) if residual.is_empty() => (true, "all accounts flat".to_string()),
            Ok(residual) => (false, format!("exposure remains: {}", residual_fingerprint(&residual))),
            Err(e) => (false, format!("verification failed: {}", e)),
        };

        {
            let mut state = self.state.lock().await;
            let affected: Vec<HedgeId> = state
                .pair_positions(&pair.id)
                .filter(|p| {
                    !p.status.is_terminal()
                        && p.status != HedgeStatus::PendingClose
                        && !state.busy.contains(&p.id)
                })
                .map(|p| p.id.clone())
                .collect();

            for id in affected {
                let Some(mut position) = state.positions.remove(&id) else {
                    continue;
                };
                if success {
                    position.mark_failed(format!("remediated: {}", kind));
                    self.persist(&position);
                    state.retire(position);
                } else {
                    position.mark_failed(format!("remediation failed: {}", detail));
                    position.metadata.manual_intervention = true;
                    self.persist(&position);
                    state.positions.insert(id, position);
                }
            }
            if success {
                state.anomalies.reset_pair(&pair.id);
            } else {
                state.hold_for_operator(&pair.id, format!("{}: {}", kind, detail));
            }
        }

        let strikes = self.config.reconciliation.strike_threshold;
        self.publish_remediation(&pair.id, kind, fingerprint, strikes, success, detail);
    }

    pub(crate) fn publish_remediation(
        &self,
        pair_id: &str,
        kind: AnomalyKind,
        fingerprint: &str,
        strikes: u32,
        success: bool,
        detail: String,
    ) {
        if success {
            info!(pair = %pair_id, %kind, %detail, "Remediation complete");
        } else {
            error!(pair = %pair_id, %kind, %detail, "❌ Remediation failed, manual intervention required");
        }
        self.events.publish(EngineEvent::Remediation {
            pair_id: pair_id.to_string(),
            anomaly: kind,
            fingerprint: fingerprint.to_string(),
            strikes,
            success,
            detail,
        });
    }
}

#[cfg(test)]
mod tests {
    use crate::config::fixtures::two_account_config;
    use crate::engine::test_support::{harness, harness_with};
    use crate::engine::{Gate, OpenAttempt};
    use crate::events::EngineEvent;
    use crate::hedge::HedgeStatus;
    use crate::reconcile::AnomalyKind;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn eager_strikes() -> crate::config::Config {
        let mut config = two_account_config();
        config.reconciliation.strike_threshold = 3;
        config.reconciliation.min_strike_span_secs = 0;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_protective_exit_closes_hedge() {
        let h = harness().await;
        let id = h.open().await;

        // Long take-profit and short stop-loss share the upper trigger
        h.venue.set_mid_price(7, dec!(110)).await;
        h.engine.run_management_tick().await;

        let position = h.engine.position(&id).await.unwrap();
        assert_eq!(position.status, HedgeStatus::Closed);
        assert_eq!(position.metadata.close_reason.as_deref(), Some("protective_exit"));
        assert_eq!(h.sink.count("oco_triggered"), 2);
        assert_eq!(h.sink.count("position_closed"), 1);
        assert_eq!(h.venue.live_orders(1, 7).await.len(), 0);
        assert_eq!(h.venue.live_orders(2, 7).await.len(), 0);

        // Next tick retires it
        h.engine.run_management_tick().await;
        assert!(h.engine.positions_for_pair("ETH").await.is_empty());
        assert_eq!(h.engine.snapshot().await.recent.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_move_closes_unprotected_hedge() {
        let h = harness().await;
        h.venue.reject_protective_orders(true).await;
        let id = h.open().await;

        // Within 0.5 for an unleveraged pair: nothing happens
        h.venue.set_mid_price(7, dec!(140)).await;
        h.engine.run_management_tick().await;
        assert_eq!(h.engine.position(&id).await.unwrap().status, HedgeStatus::Active);

        h.venue.set_mid_price(7, dec!(160)).await;
        h.engine.run_management_tick().await;

        let position = h.engine.position(&id).await.unwrap();
        assert_eq!(position.status, HedgeStatus::Closed);
        assert_eq!(position.metadata.close_reason.as_deref(), Some("emergency_stop"));
        assert_eq!(h.venue.position_size(1, 7).await, Decimal::ZERO);
        assert_eq!(h.venue.position_size(2, 7).await, Decimal::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inconsistency_remediated_after_strikes() {
        let h = harness_with(eager_strikes()).await;
        h.venue.force_position(1, 7, dec!(5), dec!(100)).await;

        h.engine.run_management_tick().await;
        h.engine.run_management_tick().await;
        assert_eq!(h.sink.count("remediation"), 0);
        assert_eq!(
            h.engine.snapshot().await.trackers.iter().map(|t| t.strikes).max(),
            Some(2)
        );

        h.engine.run_management_tick().await;
        assert_eq!(h.venue.position_size(1, 7).await, Decimal::ZERO);
        let remediation = h
            .sink
            .events()
            .into_iter()
            .find(|e| e.name() == "remediation")
            .unwrap();
        match remediation {
            EngineEvent::Remediation {
                anomaly,
                success,
                strikes,
                ..
            } => {
                assert_eq!(anomaly, AnomalyKind::PositionInconsistency);
                assert!(success);
                assert_eq!(strikes, 3);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(h.engine.snapshot().await.trackers.is_empty());

        // Idempotent on an already flat pair
        h.engine.run_management_tick().await;
        assert_eq!(h.sink.count("remediation"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_remediation_requests_manual_intervention() {
        let h = harness_with(eager_strikes()).await;
        let id = h.open().await;

        // Account 2 flattened behind the engine's back; account 1 is stuck
        h.venue.force_position(2, 7, Decimal::ZERO, dec!(100)).await;
        h.venue.freeze_positions(1, true).await;
        for _ in 0..3 {
            h.engine.run_management_tick().await;
        }

        let position = h.engine.position(&id).await.unwrap();
        assert_eq!(position.status, HedgeStatus::Failed);
        assert!(position.metadata.manual_intervention);
        assert!(h
            .sink
            .events()
            .iter()
            .any(|e| matches!(e, EngineEvent::Remediation { success: false, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_remediation_holds_pair_until_acknowledged() {
        let h = harness_with(eager_strikes()).await;
        let id = h.open().await;
        h.venue.force_position(2, 7, Decimal::ZERO, dec!(100)).await;
        h.venue.freeze_positions(1, true).await;

        for _ in 0..12 {
            h.engine.run_management_tick().await;
        }

        // One attempt, then the pair waits for an operator
        assert_eq!(h.sink.count("remediation"), 1);
        let held = h.engine.positions_for_pair("ETH").await;
        assert_eq!(held.len(), 1);
        assert!(held[0].metadata.manual_intervention);
        let snapshot = h.engine.snapshot().await;
        assert!(snapshot.pairs[0].manual_hold.is_some());
        assert!(snapshot.trackers.is_empty());

        match h.engine.try_open_pair(&h.pair()).await {
            OpenAttempt::Skipped { gate, reason } => {
                assert_eq!(gate, Gate::PairBusy);
                assert!(reason.starts_with("manual intervention required"));
            }
            other => panic!("unexpected {:?}", other),
        }

        h.venue.freeze_positions(1, false).await;
        h.venue.force_position(1, 7, Decimal::ZERO, dec!(100)).await;
        assert_eq!(h.engine.acknowledge_manual_intervention("ETH").await, Some(1));
        assert_eq!(h.engine.acknowledge_manual_intervention("ETH").await, None);

        assert!(h.engine.positions_for_pair("ETH").await.is_empty());
        assert_eq!(h.engine.position(&id).await.unwrap().status, HedgeStatus::Failed);
        assert!(h.engine.snapshot().await.pairs[0].manual_hold.is_none());
        h.open().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_close_skips_detection_until_confirmed() {
        let h = harness_with(eager_strikes()).await;
        let id = h.open().await;

        h.venue.freeze_positions(1, true).await;
        h.venue.freeze_positions(2, true).await;
        h.engine.close_position(&id, "manual").await.unwrap();
        assert_eq!(h.engine.position(&id).await.unwrap().status, HedgeStatus::PendingClose);

        for _ in 0..4 {
            h.engine.run_management_tick().await;
        }
        assert_eq!(h.sink.count("remediation"), 0);
        assert_eq!(h.engine.position(&id).await.unwrap().status, HedgeStatus::PendingClose);

        h.venue.freeze_positions(1, false).await;
        h.venue.freeze_positions(2, false).await;
        let status = h.engine.confirm_pending_close(&id).await.unwrap();
        assert_eq!(status, HedgeStatus::Closed);
        assert_eq!(h.venue.position_size(1, 7).await, Decimal::ZERO);
        assert_eq!(h.sink.count("remediation"), 1);
    }
}
