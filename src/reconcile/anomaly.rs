//! N-strike anomaly confirmation.
//!
//! Remote state is eventually consistent: one account's position update can
//! land a tick before its hedge partner's. A condition therefore has to be
//! observed with an identical fingerprint `threshold` times, spanning at
//! least `min_span`, before remediation fires. A changed fingerprint starts
//! over at strike 1.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

/// The three conditions tracked per pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// Some accounts hold a position and some do not
    PositionInconsistency,
    /// Leg sizes diverge beyond tolerance or do not offset
    SizeImbalance,
    /// A position without any live protective order
    MissingProtection,
}

impl AnomalyKind {
    pub const ALL: [AnomalyKind; 3] = [
        AnomalyKind::PositionInconsistency,
        AnomalyKind::SizeImbalance,
        AnomalyKind::MissingProtection,
    ];
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnomalyKind::PositionInconsistency => write!(f, "position_inconsistency"),
            AnomalyKind::SizeImbalance => write!(f, "size_imbalance"),
            AnomalyKind::MissingProtection => write!(f, "missing_protection"),
        }
    }
}

/// How much confirmation a condition needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrikePolicy {
    pub threshold: u32,
    pub min_span: Duration,
}

impl StrikePolicy {
    pub fn new(threshold: u32, min_span_secs: u64) -> Self {
        Self {
            threshold: threshold.max(1),
            min_span: Duration::seconds(min_span_secs as i64),
        }
    }
}

impl Default for StrikePolicy {
    fn default() -> Self {
        Self::new(3, 30)
    }
}

/// Strike state for one condition on one pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnomalyTracker {
    pub fingerprint: String,
    pub strikes: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl AnomalyTracker {
    pub fn new(fingerprint: &str, now: DateTime<Utc>) -> Self {
        Self {
            fingerprint: fingerprint.to_string(),
            strikes: 1,
            first_seen: now,
            last_seen: now,
        }
    }

    /// Record an observation. Returns true when remediation is due.
    pub fn update(&mut self, fingerprint: &str, now: DateTime<Utc>, policy: &StrikePolicy) -> bool {
        if self.fingerprint != fingerprint {
            *self = Self::new(fingerprint, now);
            return self.is_due(policy);
        }

        self.strikes += 1;
        self.last_seen = now;
        self.is_due(policy)
    }

    fn is_due(&self, policy: &StrikePolicy) -> bool {
        self.strikes >= policy.threshold && self.last_seen - self.first_seen >= policy.min_span
    }
}

/// Tracker status for snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct TrackerStatus {
    pub pair_id: String,
    pub kind: AnomalyKind,
    pub fingerprint: String,
    pub strikes: u32,
    pub first_seen: DateTime<Utc>,
}

/// All trackers, keyed by pair and condition.
#[derive(Debug, Default)]
pub struct AnomalyBook {
    policy: StrikePolicy,
    trackers: HashMap<(String, AnomalyKind), AnomalyTracker>,
}

impl AnomalyBook {
    pub fn new(policy: StrikePolicy) -> Self {
        Self {
            policy,
            trackers: HashMap::new(),
        }
    }

    pub fn observe(&mut self, pair_id: &str, kind: AnomalyKind, fingerprint: &str) -> bool {
        self.observe_at(pair_id, kind, fingerprint, Utc::now())
    }

    /// Feed one observation. A tracker that fires is removed, so the same
    /// streak never fires twice.
    pub fn observe_at(
        &mut self,
        pair_id: &str,
        kind: AnomalyKind,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let key = (pair_id.to_string(), kind);
        let policy = self.policy;

        let fire = match self.trackers.get_mut(&key) {
            Some(tracker) => tracker.update(fingerprint, now, &policy),
            None => {
                let tracker = AnomalyTracker::new(fingerprint, now);
                let due = tracker.is_due(&policy);
                self.trackers.insert(key.clone(), tracker);
                due
            }
        };

        if let Some(tracker) = self.trackers.get(&key) {
            debug!(
                pair = %pair_id,
                %kind,
                fingerprint,
                strikes = tracker.strikes,
                "Anomaly observed"
            );
        }

        if fire {
            warn!(pair = %pair_id, %kind, fingerprint, "Anomaly confirmed, remediation due");
            self.trackers.remove(&key);
        }
        fire
    }

    /// Condition observed as consistent; forget it.
    pub fn resolve(&mut self, pair_id: &str, kind: AnomalyKind) -> bool {
        self.trackers.remove(&(pair_id.to_string(), kind)).is_some()
    }

    pub fn reset_pair(&mut self, pair_id: &str) {
        self.trackers.retain(|(pair, _), _| pair != pair_id);
    }

    pub fn tracker(&self, pair_id: &str, kind: AnomalyKind) -> Option<&AnomalyTracker> {
        self.trackers.get(&(pair_id.to_string(), kind))
    }

    pub fn strikes(&self, pair_id: &str, kind: AnomalyKind) -> u32 {
        self.tracker(pair_id, kind).map(|t| t.strikes).unwrap_or(0)
    }

    pub fn snapshot(&self) -> Vec<TrackerStatus> {
        let mut out: Vec<TrackerStatus> = self
            .trackers
            .iter()
            .map(|((pair_id, kind), t)| TrackerStatus {
                pair_id: pair_id.clone(),
                kind: *kind,
                fingerprint: t.fingerprint.clone(),
                strikes: t.strikes,
                first_seen: t.first_seen,
            })
            .collect();
        out.sort_by(|a, b| a.pair_id.cmp(&b.pair_id).then(a.first_seen.cmp(&b.first_seen)));
        out
    }
}
