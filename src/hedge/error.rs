//! Hedge protocol errors.

use super::model::HedgeStatus;
use crate::venue::{AccountId, MarketId, VenueError};
use rust_decimal::Decimal;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum HedgeError {
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: HedgeStatus, to: HedgeStatus },

    #[error("need at least {required} accounts, have {available}")]
    InsufficientAccounts { available: usize, required: usize },

    #[error("spread {spread} exceeds max {max}")]
    SpreadTooWide { spread: Decimal, max: Decimal },

    #[error("no usable book for market {0}")]
    InvalidBook(MarketId),

    #[error("no margin capacity: {0}")]
    NoCapacity(String),

    #[error("leg on account {account} failed: {source}")]
    LegFailed {
        account: AccountId,
        #[source]
        source: VenueError,
    },

    #[error("leg on account {account} timed out after {after:?}")]
    LegTimeout { account: AccountId, after: Duration },

    #[error("leg on account {account} not confirmed filled")]
    Unconfirmed { account: AccountId },

    #[error("fill prices diverge by {divergence} (tolerance {tolerance})")]
    FillDivergence { divergence: Decimal, tolerance: Decimal },

    #[error("filled sizes diverge by {divergence} (tolerance {tolerance})")]
    SizeDivergence { divergence: Decimal, tolerance: Decimal },

    #[error("every close order failed")]
    CloseRejected,

    #[error("position {0} not found")]
    NotFound(String),

    #[error("position {0} is being worked on")]
    Busy(String),

    #[error(transparent)]
    Venue(#[from] VenueError),
}
