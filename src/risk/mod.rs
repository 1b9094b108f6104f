//! Risk management for hedge opening.
//!
//! Provides the pre-open risk gate and its loss accounting:
//! - Emergency stop (manual or tripped by the global daily loss)
//! - Per-pair and per-account daily loss ceilings
//! - Position size and minimum balance checks
//! - Warning events at 80% of any ceiling

mod alert;
mod gate;

pub use alert::{AlertSeverity, RiskEvent, RiskEventKind};
pub use gate::{LimitUsage, LossLedger, RiskDecision, RiskGate, RiskSummary};
