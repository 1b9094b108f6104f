//! Risk gate for opening new hedges.
//!
//! Checks, in order:
//! 1. Emergency stop flag
//! 2. Global daily loss (a breach trips the emergency stop)
//! 3. Pair daily loss
//! 4. Requested margin vs pair max position size
//! 5. Available balance of every participating account vs its minimum
//! 6. Daily loss of every participating account
//!
//! Loss counters only grow within a UTC day and are updated under a single
//! lock so pairs sharing an account never race.

use super::alert::{AlertSeverity, RiskEvent, RiskEventKind};
use crate::config::{Config, PairConfig, RiskLimits};
use crate::events::{EngineEvent, EventBus};
use crate::venue::{AccountBalance, AccountId};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

/// Outcome of [`RiskGate::check_open_risk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl RiskDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Accumulated losses for one UTC day. Losses are positive numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossLedger {
    pub day: NaiveDate,
    pub global: Decimal,
    pub accounts: HashMap<AccountId, Decimal>,
    pub pairs: HashMap<String, Decimal>,
}

impl LossLedger {
    pub fn new(day: NaiveDate) -> Self {
        Self {
            day,
            global: Decimal::ZERO,
            accounts: HashMap::new(),
            pairs: HashMap::new(),
        }
    }

    pub fn account_loss(&self, account: AccountId) -> Decimal {
        self.accounts.get(&account).copied().unwrap_or(Decimal::ZERO)
    }

    pub fn pair_loss(&self, pair_id: &str) -> Decimal {
        self.pairs.get(pair_id).copied().unwrap_or(Decimal::ZERO)
    }
}

/// Usage vs ceiling, for status output.
#[derive(Debug, Clone, Serialize)]
pub struct LimitUsage {
    pub id: String,
    pub loss: Decimal,
    pub limit: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskSummary {
    pub day: NaiveDate,
    pub emergency_stop: bool,
    pub global_loss: Decimal,
    pub global_limit: Decimal,
    pub accounts: Vec<LimitUsage>,
    pub pairs: Vec<LimitUsage>,
}

/// Synchronous, local risk decisions plus loss accounting.
pub struct RiskGate {
    global_max_daily_loss: Decimal,
    warning_ratio: Decimal,
    account_limits: HashMap<AccountId, RiskLimits>,
    pair_limits: HashMap<String, RiskLimits>,
    ledger: Mutex<LossLedger>,
    emergency_stop: AtomicBool,
    events: EventBus,
}

impl RiskGate {
    pub fn new(config: &Config, events: EventBus) -> Self {
        Self {
            global_max_daily_loss: config.risk.global_max_daily_loss,
            warning_ratio: config.risk.warning_ratio,
            account_limits: config
                .accounts
                .iter()
                .map(|a| (a.id, a.risk_limits.clone()))
                .collect(),
            pair_limits: config
                .pairs
                .iter()
                .map(|p| (p.id.clone(), p.risk_limits.clone()))
                .collect(),
            ledger: Mutex::new(LossLedger::new(Utc::now().date_naive())),
            emergency_stop: AtomicBool::new(false),
            events,
        }
    }

    /// Decide whether `pair` may open a hedge committing `estimated_margin` per leg.
    ///
    /// `balances` must hold a fresh balance for every account of the pair.
    pub fn check_open_risk(
        &self,
        pair: &PairConfig,
        estimated_margin: Decimal,
        balances: &[AccountBalance],
    ) -> RiskDecision {
        if self.is_emergency_stopped() {
            return RiskDecision::deny("emergency stop active");
        }

        let ledger = self.current_ledger();

        if ledger.global >= self.global_max_daily_loss {
            let global = ledger.global;
            drop(ledger);
            self.trip_emergency_stop(global);
            return RiskDecision::deny(format!(
                "global daily loss {} reached limit {}",
                global, self.global_max_daily_loss
            ));
        }

        let pair_loss = ledger.pair_loss(&pair.id);
        if pair_loss >= pair.risk_limits.max_daily_loss {
            return RiskDecision::deny(format!(
                "pair {} daily loss {} reached limit {}",
                pair.id, pair_loss, pair.risk_limits.max_daily_loss
            ));
        }

        if estimated_margin > pair.risk_limits.max_position_size {
            return RiskDecision::deny(format!(
                "margin {} exceeds pair {} max position size {}",
                estimated_margin, pair.id, pair.risk_limits.max_position_size
            ));
        }

        for account in &pair.accounts {
            let limits = self.account_limits(*account);

            let Some(balance) = balances.iter().find(|b| b.account == *account) else {
                return RiskDecision::deny(format!("no balance for account {}", account));
            };
            if balance.available < limits.min_balance {
                self.events.publish(EngineEvent::Risk(
                    RiskEvent::new(
                        RiskEventKind::BalanceLow,
                        balance.available,
                        limits.min_balance,
                        AlertSeverity::Warning,
                        "block_open",
                    )
                    .for_account(*account)
                    .for_pair(&pair.id),
                ));
                return RiskDecision::deny(format!(
                    "account {} available balance {} below minimum {}",
                    account, balance.available, limits.min_balance
                ));
            }

            let account_loss = ledger.account_loss(*account);
            if account_loss >= limits.max_daily_loss {
                return RiskDecision::deny(format!(
                    "account {} daily loss {} reached limit {}",
                    account, account_loss, limits.max_daily_loss
                ));
            }
        }

        RiskDecision::allow()
    }

    /// Record a realized trade result. Profits are ignored, losses accumulate.
    pub fn record_trade_pnl(&self, account: AccountId, pair_id: &str, pnl: Decimal) {
        if pnl >= Decimal::ZERO {
            return;
        }
        let loss = -pnl;

        let mut ledger = self.current_ledger();
        let account_before = ledger.account_loss(account);
        let pair_before = ledger.pair_loss(pair_id);
        let global_before = ledger.global;

        *ledger.accounts.entry(account).or_insert(Decimal::ZERO) += loss;
        *ledger.pairs.entry(pair_id.to_string()).or_insert(Decimal::ZERO) += loss;
        ledger.global += loss;

        let account_after = ledger.account_loss(account);
        let pair_after = ledger.pair_loss(pair_id);
        let global_after = ledger.global;
        drop(ledger);

        info!(account, pair = %pair_id, %loss, "Recorded trade loss");

        let account_limit = self.account_limits(account).max_daily_loss;
        let pair_limit = self
            .pair_limits
            .get(pair_id)
            .map(|l| l.max_daily_loss)
            .unwrap_or_else(|| RiskLimits::default().max_daily_loss);

        let mut pending = Vec::new();
        if let Some(event) = self.threshold_event(
            account_before,
            account_after,
            account_limit,
            RiskEventKind::AccountLossWarning,
            RiskEventKind::AccountLossLimit,
        ) {
            pending.push(event.for_account(account).for_pair(pair_id));
        }
        if let Some(event) = self.threshold_event(
            pair_before,
            pair_after,
            pair_limit,
            RiskEventKind::PairLossWarning,
            RiskEventKind::PairLossLimit,
        ) {
            pending.push(event.for_pair(pair_id));
        }
        if let Some(event) = self.threshold_event(
            global_before,
            global_after,
            self.global_max_daily_loss,
            RiskEventKind::GlobalLossWarning,
            RiskEventKind::GlobalLossLimit,
        ) {
            pending.push(event);
        }

        for event in pending {
            warn!(kind = ?event.kind, value = %event.value, limit = %event.limit, "Risk threshold crossed");
            self.events.publish(EngineEvent::Risk(event));
        }

        if self.global_max_daily_loss > Decimal::ZERO && global_after >= self.global_max_daily_loss {
            self.trip_emergency_stop(global_after);
        }
    }

    pub fn activate_emergency_stop(&self, reason: &str) {
        if !self.emergency_stop.swap(true, Ordering::SeqCst) {
            error!(%reason, "EMERGENCY STOP activated");
        }
    }

    pub fn deactivate_emergency_stop(&self) {
        if self.emergency_stop.swap(false, Ordering::SeqCst) {
            info!("Emergency stop cleared");
            self.events.publish(EngineEvent::Risk(RiskEvent::new(
                RiskEventKind::EmergencyStopCleared,
                Decimal::ZERO,
                Decimal::ZERO,
                AlertSeverity::Info,
                "resume",
            )));
        }
    }

    pub fn is_emergency_stopped(&self) -> bool {
        self.emergency_stop.load(Ordering::SeqCst)
    }

    /// Start a fresh day now.
    pub fn reset_daily_counters(&self) {
        let mut ledger = self.lock_ledger();
        *ledger = LossLedger::new(Utc::now().date_naive());
        info!("Daily risk counters reset");
    }

    pub fn ledger_snapshot(&self) -> LossLedger {
        self.current_ledger().clone()
    }

    /// Restore a persisted ledger if it belongs to the current day.
    pub fn restore_ledger(&self, ledger: LossLedger) -> bool {
        let mut current = self.current_ledger();
        if ledger.day != current.day {
            return false;
        }
        *current = ledger;
        true
    }

    pub fn summary(&self) -> RiskSummary {
        let ledger = self.current_ledger();

        let mut accounts: Vec<LimitUsage> = self
            .account_limits
            .iter()
            .map(|(id, limits)| LimitUsage {
                id: id.to_string(),
                loss: ledger.account_loss(*id),
                limit: limits.max_daily_loss,
            })
            .collect();
        accounts.sort_by(|a, b| a.id.cmp(&b.id));

        let mut pairs: Vec<LimitUsage> = self
            .pair_limits
            .iter()
            .map(|(id, limits)| LimitUsage {
                id: id.clone(),
                loss: ledger.pair_loss(id),
                limit: limits.max_daily_loss,
            })
            .collect();
        pairs.sort_by(|a, b| a.id.cmp(&b.id));

        RiskSummary {
            day: ledger.day,
            emergency_stop: self.is_emergency_stopped(),
            global_loss: ledger.global,
            global_limit: self.global_max_daily_loss,
            accounts,
            pairs,
        }
    }

    fn account_limits(&self, account: AccountId) -> RiskLimits {
        self.account_limits.get(&account).cloned().unwrap_or_default()
    }

    fn lock_ledger(&self) -> MutexGuard<'_, LossLedger> {
        self.ledger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ledger for today, rolled over if the UTC day changed.
    fn current_ledger(&self) -> MutexGuard<'_, LossLedger> {
        let mut ledger = self.lock_ledger();
        let today = Utc::now().date_naive();
        if ledger.day != today {
            info!(previous = %ledger.day, %today, "New trading day, risk counters reset");
            *ledger = LossLedger::new(today);
        }
        ledger
    }

    fn trip_emergency_stop(&self, global_loss: Decimal) {
        if self.emergency_stop.swap(true, Ordering::SeqCst) {
            return;
        }
        error!(
            loss = %global_loss,
            limit = %self.global_max_daily_loss,
            "EMERGENCY STOP: global daily loss limit reached"
        );
        self.events.publish(EngineEvent::Risk(RiskEvent::new(
            RiskEventKind::EmergencyStop,
            global_loss,
            self.global_max_daily_loss,
            AlertSeverity::Critical,
            "halt_trading",
        )));
    }

    /// Event for crossing the warning ratio or the limit itself, if either happened.
    fn threshold_event(
        &self,
        before: Decimal,
        after: Decimal,
        limit: Decimal,
        warning: RiskEventKind,
        breach: RiskEventKind,
    ) -> Option<RiskEvent> {
        if limit <= Decimal::ZERO {
            return None;
        }
        let warn_at = limit * self.warning_ratio;

        if before < limit && after >= limit {
            Some(RiskEvent::new(breach, after, limit, AlertSeverity::Error, "block_open"))
        } else if before < warn_at && after >= warn_at {
            Some(RiskEvent::new(warning, after, limit, AlertSeverity::Warning, "monitor"))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::fixtures::two_account_config;
    use crate::events::RecordingSink;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn gate() -> (RiskGate, Arc<RecordingSink>, Config) {
        let mut config = two_account_config();
        config.risk.global_max_daily_loss = dec!(5000);
        config.pairs[0].risk_limits.max_daily_loss = dec!(500);
        config.pairs[0].risk_limits.max_position_size = dec!(2000);
        for account in &mut config.accounts {
            account.risk_limits.max_daily_loss = dec!(300);
            account.risk_limits.min_balance = dec!(100);
        }
        let sink = Arc::new(RecordingSink::new());
        let gate = RiskGate::new(&config, EventBus::new().with_sink(sink.clone()));
        (gate, sink, config)
    }

    fn balances(a: Decimal, b: Decimal) -> Vec<AccountBalance> {
        vec![
            AccountBalance {
                account: 1,
                total: a,
                available: a,
            },
            AccountBalance {
                account: 2,
                total: b,
                available: b,
            },
        ]
    }

    #[test]
    fn test_allows_when_within_limits() {
        let (gate, sink, config) = gate();
        let decision = gate.check_open_risk(&config.pairs[0], dec!(700), &balances(dec!(1000), dec!(800)));
        assert_eq!(decision, RiskDecision::allow());
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_emergency_stop_checked_first() {
        let (gate, _, config) = gate();
        gate.activate_emergency_stop("manual");
        // Balance also too low, but the stop wins
        let decision = gate.check_open_risk(&config.pairs[0], dec!(700), &balances(dec!(10), dec!(10)));
        assert!(!decision.allowed);
        assert_eq!(decision.reason.as_deref(), Some("emergency stop active"));

        gate.deactivate_emergency_stop();
        assert!(!gate.is_emergency_stopped());
    }

    #[test]
    fn test_global_breach_trips_emergency_stop() {
        let (gate, sink, config) = gate();
        let mut ledger = gate.ledger_snapshot();
        ledger.global = dec!(5000);
        assert!(gate.restore_ledger(ledger));

        let decision = gate.check_open_risk(&config.pairs[0], dec!(700), &balances(dec!(1000), dec!(1000)));
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("global daily loss"));
        assert!(gate.is_emergency_stopped());
        assert_eq!(sink.count("risk"), 1);

        // Subsequent checks short-circuit on the flag
        let decision = gate.check_open_risk(&config.pairs[0], dec!(700), &balances(dec!(1000), dec!(1000)));
        assert_eq!(decision.reason.as_deref(), Some("emergency stop active"));
        assert_eq!(sink.count("risk"), 1);
    }

    #[test]
    fn test_global_breach_at_record_time_stops_trading() {
        let (gate, sink, config) = gate();
        // Spread over pairs and accounts so only the global ceiling is hit
        for (i, pair) in ["ETH", "BTC", "SOL", "ARB", "OP", "DOGE", "XRP", "ADA", "LINK", "AVAX"]
            .iter()
            .enumerate()
        {
            gate.record_trade_pnl(10 + i as AccountId, pair, dec!(-490));
        }
        assert!(!gate.is_emergency_stopped());

        gate.record_trade_pnl(30, "DOT", dec!(-100));
        assert!(gate.is_emergency_stopped());

        let kinds: Vec<RiskEventKind> = sink
            .events()
            .iter()
            .filter_map(|e| match e {
                EngineEvent::Risk(r) if r.pair_id.is_none() => Some(r.kind),
                _ => None,
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                RiskEventKind::GlobalLossWarning,
                RiskEventKind::GlobalLossLimit,
                RiskEventKind::EmergencyStop
            ]
        );
        let decision = gate.check_open_risk(&config.pairs[0], dec!(700), &balances(dec!(1000), dec!(1000)));
        assert_eq!(decision.reason.as_deref(), Some("emergency stop active"));
    }

    #[test]
    fn test_pair_loss_checked_before_position_size() {
        let (gate, _, config) = gate();
        gate.record_trade_pnl(1, "ETH", dec!(-250));
        gate.record_trade_pnl(2, "ETH", dec!(-250));

        let decision = gate.check_open_risk(&config.pairs[0], dec!(9999), &balances(dec!(1000), dec!(1000)));
        assert!(decision.reason.unwrap().starts_with("pair ETH daily loss"));
    }

    #[test]
    fn test_position_size_limit() {
        let (gate, _, config) = gate();
        let decision = gate.check_open_risk(&config.pairs[0], dec!(2500), &balances(dec!(5000), dec!(5000)));
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("max position size"));
    }

    #[test]
    fn test_low_balance_emits_event() {
        let (gate, sink, config) = gate();
        let decision = gate.check_open_risk(&config.pairs[0], dec!(700), &balances(dec!(1000), dec!(50)));
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("account 2"));

        match &sink.events()[0] {
            EngineEvent::Risk(event) => {
                assert_eq!(event.kind, RiskEventKind::BalanceLow);
                assert_eq!(event.account, Some(2));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_missing_balance_denied() {
        let (gate, _, config) = gate();
        let only_one = vec![balances(dec!(1000), dec!(1000))[0]];
        assert!(!gate.check_open_risk(&config.pairs[0], dec!(700), &only_one).allowed);
    }

    #[test]
    fn test_account_daily_loss_limit() {
        let (gate, _, config) = gate();
        gate.record_trade_pnl(1, "BTC", dec!(-300));
        let decision = gate.check_open_risk(&config.pairs[0], dec!(700), &balances(dec!(1000), dec!(1000)));
        assert_eq!(
            decision.reason.as_deref(),
            Some("account 1 daily loss 300 reached limit 300")
        );
    }

    #[test]
    fn test_profits_do_not_offset_losses() {
        let (gate, _, _) = gate();
        gate.record_trade_pnl(1, "ETH", dec!(-100));
        gate.record_trade_pnl(1, "ETH", dec!(400));
        let ledger = gate.ledger_snapshot();
        assert_eq!(ledger.account_loss(1), dec!(100));
        assert_eq!(ledger.global, dec!(100));
    }

    #[test]
    fn test_warning_emitted_once_when_crossing_80_percent() {
        let (gate, sink, _) = gate();
        // Account limit 300 -> warn at 240; pair limit 500 -> warn at 400
        gate.record_trade_pnl(1, "ETH", dec!(-200));
        assert_eq!(sink.count("risk"), 0);

        gate.record_trade_pnl(1, "ETH", dec!(-50));
        let kinds: Vec<RiskEventKind> = sink
            .events()
            .iter()
            .filter_map(|e| match e {
                EngineEvent::Risk(r) => Some(r.kind),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec![RiskEventKind::AccountLossWarning]);

        // Still above 80% but no new crossing
        gate.record_trade_pnl(1, "ETH", dec!(-10));
        assert_eq!(sink.count("risk"), 1);

        // Crossing the account limit and the pair warning together
        gate.record_trade_pnl(1, "ETH", dec!(-150));
        assert_eq!(sink.count("risk"), 3);
    }

    #[test]
    fn test_reset_clears_counters() {
        let (gate, _, _) = gate();
        gate.record_trade_pnl(1, "ETH", dec!(-100));
        gate.reset_daily_counters();
        assert_eq!(gate.ledger_snapshot().global, Decimal::ZERO);
    }

    #[test]
    fn test_stale_ledger_not_restored() {
        let (gate, _, _) = gate();
        let mut old = LossLedger::new(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap());
        old.global = dec!(999);
        assert!(!gate.restore_ledger(old));
        assert_eq!(gate.ledger_snapshot().global, Decimal::ZERO);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_are_atomic() {
        let (gate, _, _) = gate();
        let gate = Arc::new(gate);

        let mut handles = Vec::new();
        for i in 0..50 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                let pair = if i % 2 == 0 { "ETH" } else { "BTC" };
                gate.record_trade_pnl(1, pair, dec!(-1));
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let ledger = gate.ledger_snapshot();
        assert_eq!(ledger.account_loss(1), dec!(50));
        assert_eq!(ledger.pair_loss("ETH"), dec!(25));
        assert_eq!(ledger.global, dec!(50));
    }
}
