//! Structured risk events.

use crate::venue::AccountId;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Severity levels for alerts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    /// Get display name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "INFO",
            AlertSeverity::Warning => "WARNING",
            AlertSeverity::Error => "ERROR",
            AlertSeverity::Critical => "CRITICAL",
        }
    }
}

/// What a risk event is about.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RiskEventKind {
    /// Global daily loss reached its ceiling, trading halted
    EmergencyStop,
    /// Operator cleared the emergency stop
    EmergencyStopCleared,
    GlobalLossWarning,
    /// Global daily loss crossed its ceiling; followed by an emergency stop
    GlobalLossLimit,
    PairLossWarning,
    AccountLossWarning,
    PairLossLimit,
    AccountLossLimit,
    PositionSizeLimit,
    BalanceLow,
}

/// A risk observation, published to every event sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskEvent {
    pub kind: RiskEventKind,
    pub account: Option<AccountId>,
    pub pair_id: Option<String>,
    pub value: Decimal,
    pub limit: Decimal,
    pub severity: AlertSeverity,
    /// What the gate did about it
    pub action: String,
    pub observed_at: DateTime<Utc>,
}

impl RiskEvent {
    pub fn new(
        kind: RiskEventKind,
        value: Decimal,
        limit: Decimal,
        severity: AlertSeverity,
        action: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            account: None,
            pair_id: None,
            value,
            limit,
            severity,
            action: action.into(),
            observed_at: Utc::now(),
        }
    }

    pub fn for_account(mut self, account: AccountId) -> Self {
        self.account = Some(account);
        self
    }

    pub fn for_pair(mut self, pair_id: &str) -> Self {
        self.pair_id = Some(pair_id.to_string());
        self
    }
}
