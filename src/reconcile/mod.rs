//! Reconciliation primitives.
//!
//! - [`retry`]: the bounded retry used for every remote re-check
//! - [`order_status`]: exact-id lookup with a broad history scan fallback
//! - [`anomaly`]: N-strike confirmation of suspicious conditions
//! - [`fingerprint`]: compact summaries of fresh remote state
//!
//! Remote state always wins over local records. Callers purge local
//! entries that a fresh query contradicts rather than merging them.

pub mod anomaly;
pub mod fingerprint;
pub mod order_status;
pub mod retry;

pub use anomaly::{AnomalyBook, AnomalyKind, AnomalyTracker, StrikePolicy, TrackerStatus};
pub use fingerprint::{
    imbalance_fingerprint, inconsistency_fingerprint, missing_protection_fingerprint,
    AccountObservation,
};
pub use order_status::{ids_match, OrderLookup, OrderStatusResolver};
pub use retry::{retry_transient, retry_until, Attempt, RetryPolicy};
