//! # Hedge Keeper
//!
//! Opens, protects and closes synchronized opposite positions on one
//! market across several venue accounts, and keeps them consistent with
//! what the venue actually reports.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `venue`: Venue gateway trait, value types, and a paper venue
//! - `risk`: Pre-open risk gate and daily loss accounting
//! - `reconcile`: Bounded retries, order status resolution, N-strike anomaly tracking
//! - `hedge`: Hedge model, sizing, and the dual-leg open/close protocol
//! - `engine`: Opportunity gates, management tick, remediation
//! - `events`: Structured lifecycle events and sinks
//! - `persistence`: SQLite journal for restart recovery
//! - `utils`: Shared utilities and decimal arithmetic

pub mod config;
pub mod engine;
pub mod events;
pub mod hedge;
pub mod persistence;
pub mod reconcile;
pub mod risk;
pub mod utils;
pub mod venue;

pub use config::Config;
