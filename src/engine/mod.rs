//! Hedge engine loop.
//!
//! Two periodic tasks share one [`HedgeEngine`]:
//! - the opportunity tick walks enabled pairs through the open gates
//! - the management tick enforces OCO, checks the emergency trigger,
//!   detects anomalies and remediates
//!
//! Positions live in an arena keyed by id. An operation checks a position
//! out, works on it without holding the state lock, and checks it back in.
//! A checked-out position is skipped by every other operation.

mod accounts;
mod gates;
mod monitor;

pub use accounts::{AccountBook, AccountState};
pub use gates::{Gate, OpenAttempt};

use crate::config::{Config, PairConfig};
use crate::events::{EventBus, LegSummary};
use crate::hedge::{CloseOutcome, DirectionRotation, HedgeError, HedgeExecutor, HedgeId, HedgePosition, HedgeStatus};
use crate::persistence::JournalStore;
use crate::reconcile::{AnomalyBook, StrikePolicy, TrackerStatus};
use crate::risk::{RiskGate, RiskSummary};
use crate::venue::VenueGateway;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Mutable engine state behind one async lock.
pub(crate) struct EngineState {
    positions: HashMap<HedgeId, HedgePosition>,
    busy: HashSet<HedgeId>,
    accounts: AccountBook,
    anomalies: AnomalyBook,
    rotation: DirectionRotation,
    last_trade: HashMap<String, DateTime<Utc>>,
    /// Pairs waiting for an operator, with the reason. No opens, no
    /// detection until acknowledged.
    manual_holds: HashMap<String, String>,
    history: VecDeque<HedgePosition>,
    retention: usize,
}

impl EngineState {
    fn new(config: &Config) -> Self {
        let recon = &config.reconciliation;
        Self {
            positions: HashMap::new(),
            busy: HashSet::new(),
            accounts: AccountBook::from_config(config),
            anomalies: AnomalyBook::new(StrikePolicy::new(recon.strike_threshold, recon.min_strike_span_secs)),
            rotation: DirectionRotation::new(),
            last_trade: HashMap::new(),
            manual_holds: HashMap::new(),
            history: VecDeque::new(),
            retention: config.engine.history_retention,
        }
    }

    fn pair_positions<'a>(&'a self, pair_id: &'a str) -> impl Iterator<Item = &'a HedgePosition> + 'a {
        self.positions.values().filter(move |p| p.pair_id == pair_id)
    }

    fn pair_has(&self, pair_id: &str, statuses: &[HedgeStatus]) -> bool {
        self.pair_positions(pair_id).any(|p| statuses.contains(&p.status))
    }

    /// Insert a fresh position already checked out by the caller.
    fn reserve(&mut self, position: HedgePosition) {
        self.busy.insert(position.id.clone());
        self.positions.insert(position.id.clone(), position);
    }

    fn checkout(&mut self, id: &str) -> Result<HedgePosition, HedgeError> {
        let position = self
            .positions
            .get(id)
            .ok_or_else(|| HedgeError::NotFound(id.to_string()))?;
        if !self.busy.insert(id.to_string()) {
            return Err(HedgeError::Busy(id.to_string()));
        }
        Ok(position.clone())
    }

    fn checkin(&mut self, position: HedgePosition) {
        self.busy.remove(&position.id);
        self.positions.insert(position.id.clone(), position);
    }

    /// Drop a reservation that never left OPENING.
    fn release(&mut self, id: &str) {
        self.busy.remove(id);
        self.positions.remove(id);
    }

    fn hold_for_operator(&mut self, pair_id: &str, reason: String) {
        error!(pair = %pair_id, %reason, "✋ Pair held for manual intervention");
        self.anomalies.reset_pair(pair_id);
        self.manual_holds.insert(pair_id.to_string(), reason);
    }

    fn retire(&mut self, position: HedgePosition) {
        self.positions.remove(&position.id);
        self.history.push_front(position);
        self.history.truncate(self.retention);
    }
}

/// Compact view of one position for status output.
#[derive(Debug, Clone, Serialize)]
pub struct PositionSummary {
    pub id: HedgeId,
    pub pair_id: String,
    pub status: HedgeStatus,
    pub legs: Vec<LegSummary>,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub reason: Option<String>,
    pub manual_intervention: bool,
    pub updated_at: DateTime<Utc>,
}

impl From<&HedgePosition> for PositionSummary {
    fn from(position: &HedgePosition) -> Self {
        Self {
            id: position.id.clone(),
            pair_id: position.pair_id.clone(),
            status: position.status,
            legs: position.leg_summaries(),
            unrealized_pnl: position.unrealized_pnl,
            realized_pnl: position.realized_pnl,
            reason: position
                .metadata
                .failure_reason
                .clone()
                .or_else(|| position.metadata.close_reason.clone()),
            manual_intervention: position.metadata.manual_intervention,
            updated_at: position.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PairSnapshot {
    pub pair_id: String,
    pub enabled: bool,
    pub last_trade: Option<DateTime<Utc>>,
    pub manual_hold: Option<String>,
    pub positions: Vec<PositionSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub taken_at: DateTime<Utc>,
    pub emergency_stop: bool,
    pub pairs: Vec<PairSnapshot>,
    pub recent: Vec<PositionSummary>,
    pub trackers: Vec<TrackerStatus>,
    pub accounts: Vec<AccountState>,
    pub risk: RiskSummary,
}

pub struct HedgeEngine {
    config: Arc<Config>,
    venue: Arc<dyn VenueGateway>,
    risk: Arc<RiskGate>,
    executor: HedgeExecutor,
    events: EventBus,
    journal: Option<Arc<JournalStore>>,
    state: Mutex<EngineState>,
}

impl HedgeEngine {
    pub fn new(config: Arc<Config>, venue: Arc<dyn VenueGateway>, risk: Arc<RiskGate>, events: EventBus) -> Self {
        let executor = HedgeExecutor::new(venue.clone(), &config, events.clone());
        let state = Mutex::new(EngineState::new(&config));
        Self {
            config,
            venue,
            risk,
            executor,
            events,
            journal: None,
            state,
        }
    }

    /// Persist every position change to `journal`.
    pub fn with_journal(mut self, journal: Arc<JournalStore>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn risk(&self) -> &Arc<RiskGate> {
        &self.risk
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Load positions saved by a previous run.
    ///
    /// ACTIVE and PENDING_CLOSE resume as they were. An interrupted open is
    /// FAILED; an interrupted close needs confirmation.
    pub async fn restore_positions(&self, positions: Vec<HedgePosition>) -> usize {
        let mut state = self.state.lock().await;
        let mut restored = 0;

        for mut position in positions {
            match position.status {
                HedgeStatus::Opening => {
                    position.mark_failed("interrupted while opening");
                    position.metadata.manual_intervention = true;
                }
                HedgeStatus::Closing => {
                    if position.transition(HedgeStatus::PendingClose).is_ok() {
                        position.metadata.manual_intervention = true;
                    }
                }
                _ => {}
            }
            info!(position = %position.id, pair = %position.pair_id, status = %position.status, "Restored position");
            self.persist(&position);

            if position.status.is_terminal() {
                state.retire(position);
            } else {
                state.positions.insert(position.id.clone(), position);
                restored += 1;
            }
        }
        restored
    }

    /// Position by id, live or recently retired.
    pub async fn position(&self, id: &str) -> Option<HedgePosition> {
        let state = self.state.lock().await;
        state
            .positions
            .get(id)
            .or_else(|| state.history.iter().find(|p| p.id == id))
            .cloned()
    }

    /// Live (non-retired) positions of one pair.
    pub async fn positions_for_pair(&self, pair_id: &str) -> Vec<HedgePosition> {
        let state = self.state.lock().await;
        state.pair_positions(pair_id).cloned().collect()
    }

    /// Positions still in the arena, for persistence at shutdown.
    pub async fn live_positions(&self) -> Vec<HedgePosition> {
        self.state.lock().await.positions.values().cloned().collect()
    }

    /// Close an ACTIVE hedge now.
    pub async fn close_position(&self, id: &str, reason: &str) -> Result<CloseOutcome, HedgeError> {
        let mut position = self.state.lock().await.checkout(id)?;
        let result = self.executor.close(&mut position, reason).await;
        if result.is_ok() {
            self.record_close(&position).await;
        }
        self.checkin(position).await;
        result
    }

    /// Re-verify a PENDING_CLOSE hedge.
    ///
    /// Flat accounts close it. Otherwise the residue is flattened once more;
    /// exposure that still survives fails it for manual intervention.
    pub async fn confirm_pending_close(&self, id: &str) -> Result<HedgeStatus, HedgeError> {
        let mut position = self.state.lock().await.checkout(id)?;
        if position.status != HedgeStatus::PendingClose {
            let status = position.status;
            self.checkin(position).await;
            return Err(HedgeError::InvalidTransition {
                from: status,
                to: HedgeStatus::Closed,
            });
        }

        let result = self.settle_pending(&mut position).await;
        self.checkin(position).await;
        result
    }

    async fn settle_pending(&self, position: &mut HedgePosition) -> Result<HedgeStatus, HedgeError> {
        let residual = self.executor.recheck_pending(position).await?;
        if residual.is_empty() {
            self.state.lock().await.anomalies.reset_pair(&position.pair_id);
            return Ok(position.status);
        }

        warn!(position = %position.id, residual = ?residual, "Pending close still exposed, flattening");
        for r in &residual {
            if let Err(e) = self.executor.flatten(r.account, position.market).await {
                warn!(account = r.account, error = %e, "Flatten during confirmation failed");
            }
        }

        let remaining = self.executor.recheck_pending(position).await?;
        self.publish_remediation(
            &position.pair_id,
            crate::reconcile::AnomalyKind::PositionInconsistency,
            &residual_fingerprint(&residual),
            0,
            remaining.is_empty(),
            format!("pending close confirmation for {}", position.id),
        );
        let mut state = self.state.lock().await;
        if remaining.is_empty() {
            state.anomalies.reset_pair(&position.pair_id);
        } else {
            let reason = format!("exposure remains after confirmation: {:?}", remaining);
            position.mark_failed(reason.clone());
            position.metadata.manual_intervention = true;
            state.hold_for_operator(&position.pair_id, reason);
        }
        Ok(position.status)
    }

    /// Operator confirmation that a held pair was dealt with. Lifts the
    /// hold and retires the positions kept for inspection. Returns how many
    /// were retired, or `None` if the pair was not held.
    pub async fn acknowledge_manual_intervention(&self, pair_id: &str) -> Option<usize> {
        let mut state = self.state.lock().await;
        let reason = state.manual_holds.remove(pair_id)?;
        let held: Vec<HedgeId> = state
            .pair_positions(pair_id)
            .filter(|p| p.status.is_terminal() && p.metadata.manual_intervention && !state.busy.contains(&p.id))
            .map(|p| p.id.clone())
            .collect();
        for id in &held {
            if let Some(position) = state.positions.remove(id) {
                state.retire(position);
            }
        }
        state.anomalies.reset_pair(pair_id);
        info!(pair = %pair_id, %reason, retired = held.len(), "Manual intervention acknowledged");
        Some(held.len())
    }

    pub async fn snapshot(&self) -> EngineSnapshot {
        let state = self.state.lock().await;
        let pairs = self
            .config
            .pairs
            .iter()
            .map(|pair| {
                let mut positions: Vec<PositionSummary> =
                    state.pair_positions(&pair.id).map(PositionSummary::from).collect();
                positions.sort_by(|a, b| a.id.cmp(&b.id));
                PairSnapshot {
                    pair_id: pair.id.clone(),
                    enabled: pair.is_enabled,
                    last_trade: state.last_trade.get(&pair.id).copied(),
                    manual_hold: state.manual_holds.get(&pair.id).cloned(),
                    positions,
                }
            })
            .collect();

        EngineSnapshot {
            taken_at: Utc::now(),
            emergency_stop: self.risk.is_emergency_stopped(),
            pairs,
            recent: state.history.iter().map(PositionSummary::from).collect(),
            trackers: state.anomalies.snapshot(),
            accounts: state.accounts.snapshot(),
            risk: self.risk.summary(),
        }
    }

    /// Run both periodic tasks until `shutdown` is set.
    pub async fn run(self: Arc<Self>, shutdown: Arc<AtomicBool>) {
        let opportunity = {
            let engine = self.clone();
            let shutdown = shutdown.clone();
            let period = Duration::from_secs(self.config.engine.opportunity_interval_secs.max(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    engine.run_opportunity_tick().await;
                }
                debug!("Opportunity task stopped");
            })
        };

        let management = {
            let engine = self.clone();
            let shutdown = shutdown.clone();
            let period = Duration::from_secs(self.config.engine.management_interval_secs.max(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    engine.run_management_tick().await;
                }
                debug!("Management task stopped");
            })
        };

        info!(
            pairs = self.config.pairs.len(),
            accounts = self.config.accounts.len(),
            "Engine running"
        );
        let (opportunity, management) = tokio::join!(opportunity, management);
        if let Err(e) = opportunity.and(management) {
            warn!(error = %e, "Engine task ended abnormally");
        }
        info!("Engine stopped");
    }

    async fn checkin(&self, position: HedgePosition) {
        self.persist(&position);
        self.state.lock().await.checkin(position);
    }

    fn persist(&self, position: &HedgePosition) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.save_position(position) {
                warn!(position = %position.id, error = %e, "Failed to journal position");
            }
        }
    }

    /// Book a finished close: realized PnL into the risk gate, cooldowns,
    /// and the pair's last trade time.
    async fn record_close(&self, position: &HedgePosition) {
        if !matches!(position.status, HedgeStatus::Closed | HedgeStatus::PendingClose) {
            return;
        }
        for leg in &position.legs {
            if leg.realized_pnl != Decimal::ZERO {
                self.risk.record_trade_pnl(leg.account, &position.pair_id, leg.realized_pnl);
            }
        }

        let now = Utc::now();
        let cooldown = self.pair_cooldown(&position.pair_id);
        let mut state = self.state.lock().await;
        for leg in &position.legs {
            state.accounts.start_cooldown(leg.account, cooldown, now);
        }
        state.last_trade.insert(position.pair_id.clone(), now);
    }

    fn pair_cooldown(&self, pair_id: &str) -> ChronoDuration {
        self.config
            .pair(pair_id)
            .map(|p| ChronoDuration::minutes(p.cooldown_minutes as i64))
            .unwrap_or_else(ChronoDuration::zero)
    }

    fn enabled_pairs(&self) -> impl Iterator<Item = &PairConfig> {
        self.config.pairs.iter().filter(|p| p.is_enabled)
    }
}

fn residual_fingerprint(residual: &[crate::events::Residual]) -> String {
    residual
        .iter()
        .map(|r| format!("{}:{}", r.account, r.size.normalize()))
        .collect::<Vec<_>>()
        .join("|")
}

/// Engine wired to a paper venue, shared by the engine tests.
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::fixtures::two_account_config;
    use crate::events::RecordingSink;
    use crate::venue::PaperVenue;
    use rust_decimal_macros::dec;

    pub struct Harness {
        pub engine: Arc<HedgeEngine>,
        pub venue: Arc<PaperVenue>,
        pub sink: Arc<RecordingSink>,
    }

    /// Accounts 1 (1000) and 2 (800) on market 7 at mid 100, no fees.
    pub async fn harness_with(config: Config) -> Harness {
        let venue = Arc::new(PaperVenue::frictionless());
        venue.add_account(1, dec!(1000)).await;
        venue.add_account(2, dec!(800)).await;
        venue.set_mid_price(7, dec!(100)).await;

        let sink = Arc::new(RecordingSink::new());
        let events = EventBus::new().with_sink(sink.clone());
        let risk = Arc::new(RiskGate::new(&config, events.clone()));
        let engine = Arc::new(HedgeEngine::new(Arc::new(config), venue.clone(), risk, events));
        Harness { engine, venue, sink }
    }

    pub async fn harness() -> Harness {
        harness_with(two_account_config()).await
    }

    impl Harness {
        pub fn pair(&self) -> PairConfig {
            self.engine.config().pairs[0].clone()
        }

        /// Open a hedge on the first pair and return its id.
        pub async fn open(&self) -> HedgeId {
            match self.engine.try_open_pair(&self.pair()).await {
                OpenAttempt::Opened(id) => id,
                other => panic!("expected an open, got {:?}", other),
            }
        }
    }
}
