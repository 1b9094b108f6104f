//! Lifecycle events.
//!
//! The engine reports what it did as [`EngineEvent`]s. An [`EventBus`]
//! stamps each one and fans it out to every registered [`EventSink`]:
//! - [`LogSink`] writes JSON lines under the `hedge_event` target
//! - [`RecordingSink`] keeps them in memory
//! - the SQLite journal persists them (see `persistence`)

use crate::reconcile::AnomalyKind;
use crate::risk::{AlertSeverity, RiskEvent};
use crate::venue::{AccountId, OrderKind, PositionSide};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// One leg as reported in an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegSummary {
    pub account: AccountId,
    pub side: PositionSide,
    pub size: Decimal,
    pub entry_price: Option<Decimal>,
}

/// Remote exposure left on an account after a close attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Residual {
    pub account: AccountId,
    pub size: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    PositionOpened {
        position_id: String,
        pair_id: String,
        legs: Vec<LegSummary>,
        reference_price: Decimal,
        avg_entry_price: Decimal,
        stop_distance: Decimal,
    },
    OpenFailed {
        position_id: String,
        pair_id: String,
        reason: String,
    },
    PositionClosed {
        position_id: String,
        pair_id: String,
        reason: String,
        realized_pnl: Decimal,
    },
    PendingClose {
        position_id: String,
        pair_id: String,
        residual: Vec<Residual>,
    },
    ProtectionFailed {
        position_id: String,
        pair_id: String,
        account: AccountId,
        order_kind: OrderKind,
        reason: String,
    },
    OcoTriggered {
        position_id: String,
        pair_id: String,
        account: AccountId,
        filled: OrderKind,
        cancelled_order_id: Option<String>,
    },
    Remediation {
        pair_id: String,
        anomaly: AnomalyKind,
        fingerprint: String,
        strikes: u32,
        success: bool,
        detail: String,
    },
    Risk(RiskEvent),
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::PositionOpened { .. } => "position_opened",
            EngineEvent::OpenFailed { .. } => "open_failed",
            EngineEvent::PositionClosed { .. } => "position_closed",
            EngineEvent::PendingClose { .. } => "pending_close",
            EngineEvent::ProtectionFailed { .. } => "protection_failed",
            EngineEvent::OcoTriggered { .. } => "oco_triggered",
            EngineEvent::Remediation { .. } => "remediation",
            EngineEvent::Risk(_) => "risk",
        }
    }

    pub fn pair_id(&self) -> Option<&str> {
        match self {
            EngineEvent::PositionOpened { pair_id, .. }
            | EngineEvent::OpenFailed { pair_id, .. }
            | EngineEvent::PositionClosed { pair_id, .. }
            | EngineEvent::PendingClose { pair_id, .. }
            | EngineEvent::ProtectionFailed { pair_id, .. }
            | EngineEvent::OcoTriggered { pair_id, .. }
            | EngineEvent::Remediation { pair_id, .. } => Some(pair_id),
            EngineEvent::Risk(event) => event.pair_id.as_deref(),
        }
    }

    pub fn position_id(&self) -> Option<&str> {
        match self {
            EngineEvent::PositionOpened { position_id, .. }
            | EngineEvent::OpenFailed { position_id, .. }
            | EngineEvent::PositionClosed { position_id, .. }
            | EngineEvent::PendingClose { position_id, .. }
            | EngineEvent::ProtectionFailed { position_id, .. }
            | EngineEvent::OcoTriggered { position_id, .. } => Some(position_id),
            EngineEvent::Remediation { .. } | EngineEvent::Risk(_) => None,
        }
    }

    pub fn severity(&self) -> AlertSeverity {
        match self {
            EngineEvent::PositionOpened { .. }
            | EngineEvent::PositionClosed { .. }
            | EngineEvent::OcoTriggered { .. } => AlertSeverity::Info,
            EngineEvent::OpenFailed { .. } | EngineEvent::ProtectionFailed { .. } => {
                AlertSeverity::Warning
            }
            EngineEvent::PendingClose { .. } => AlertSeverity::Error,
            EngineEvent::Remediation { success, .. } => {
                if *success {
                    AlertSeverity::Warning
                } else {
                    AlertSeverity::Critical
                }
            }
            EngineEvent::Risk(event) => event.severity,
        }
    }
}

/// An event stamped at publication time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: EngineEvent,
}

/// Receives published events. Must not block for long.
pub trait EventSink: Send + Sync {
    fn record(&self, record: &EventRecord);
}

/// Fan-out to registered sinks.
#[derive(Clone, Default)]
pub struct EventBus {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn publish(&self, event: EngineEvent) {
        let record = EventRecord {
            timestamp: Utc::now(),
            event,
        };
        for sink in &self.sinks {
            sink.record(&record);
        }
    }
}

/// Writes events as JSON lines through `tracing`.
pub struct LogSink;

impl EventSink for LogSink {
    fn record(&self, record: &EventRecord) {
        let json = serde_json::to_string(record).unwrap_or_default();

        match record.event.severity() {
            AlertSeverity::Info => info!(target: "hedge_event", "HEDGE_EVENT: {}", json),
            AlertSeverity::Warning => warn!(target: "hedge_event", "HEDGE_EVENT: {}", json),
            AlertSeverity::Error => error!(target: "hedge_event", "HEDGE_EVENT: {}", json),
            AlertSeverity::Critical => error!(target: "hedge_event", "HEDGE_EVENT: {}", json),
        }
    }
}

/// Keeps every event in memory.
#[derive(Default)]
pub struct RecordingSink {
    records: Mutex<Vec<EventRecord>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|r| r.event.clone())
            .collect()
    }

    /// Number of recorded events with the given [`EngineEvent::name`].
    pub fn count(&self, name: &str) -> usize {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|r| r.event.name() == name)
            .count()
    }
}

impl EventSink for RecordingSink {
    fn record(&self, record: &EventRecord) {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::RiskEventKind;
    use rust_decimal_macros::dec;

    #[test]
    fn test_bus_fans_out_to_every_sink() {
        let a = Arc::new(RecordingSink::new());
        let b = Arc::new(RecordingSink::new());
        let bus = EventBus::new().with_sink(a.clone()).with_sink(b.clone());

        bus.publish(EngineEvent::OpenFailed {
            position_id: "h1".into(),
            pair_id: "ETH".into(),
            reason: "spread too wide".into(),
        });

        assert_eq!(a.count("open_failed"), 1);
        assert_eq!(b.events().len(), 1);
    }

    #[test]
    fn test_record_serializes_with_tag_and_timestamp() {
        let record = EventRecord {
            timestamp: Utc::now(),
            event: EngineEvent::Risk(
                RiskEvent::new(
                    RiskEventKind::BalanceLow,
                    dec!(50),
                    dec!(100),
                    AlertSeverity::Warning,
                    "skip_account",
                )
                .for_account(3),
            ),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["event"], "risk");
        assert_eq!(json["kind"], "balance_low");
        assert!(json.get("timestamp").is_some());
        assert_eq!(record.event.severity(), AlertSeverity::Warning);
    }

    #[test]
    fn test_remediation_failure_is_critical() {
        let event = EngineEvent::Remediation {
            pair_id: "ETH".into(),
            anomaly: AnomalyKind::PositionInconsistency,
            fingerprint: "1:true:1|2:false:0".into(),
            strikes: 3,
            success: false,
            detail: "account 1 still open".into(),
        };
        assert_eq!(event.severity(), AlertSeverity::Critical);
        assert_eq!(event.pair_id(), Some("ETH"));
        assert_eq!(event.position_id(), None);
    }
}
