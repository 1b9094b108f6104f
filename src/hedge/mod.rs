//! Hedge positions and the dual-leg execution protocol.
//!
//! - [`model`]: legs, positions, and the lifecycle state machine
//! - [`sizing`]: shared margin, quantity, stop distance, trigger levels
//! - [`rotation`]: per-pair long/short alternation
//! - [`executor`]: open, close, unwind, flatten
//! - [`protection`]: stop-loss/take-profit placement and OCO enforcement

pub mod error;
pub mod executor;
pub mod model;
pub mod protection;
pub mod rotation;
pub mod sizing;

pub use error::HedgeError;
pub use executor::{CloseOutcome, ExecutionSettings, HedgeExecutor, LegOrder};
pub use model::{HedgeId, HedgeMetadata, HedgePosition, HedgeStatus, Leg, LegStatus};
pub use protection::{OcoOutcome, ProtectionManager};
pub use rotation::DirectionRotation;
pub use sizing::{
    auto_stop_distance, emergency_move_threshold, margin_capacity, resolve_stop_distance, size_legs,
    LegSizing, ProtectiveLevels, StopDistance, StopPolicy,
};
