//! Hedge position data model and lifecycle state machine.
//!
//! ```text
//! OPENING -> ACTIVE -> CLOSING -> CLOSED
//!                         |  \-> PENDING_CLOSE -> CLOSED
//!                         \-> ACTIVE (every close order failed)
//! any non-terminal stage -> FAILED
//! ```

use super::error::HedgeError;
use crate::events::LegSummary;
use crate::utils::{divergence_from_max, safe_div};
use crate::venue::{AccountId, MarketId, PositionSide};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

pub type HedgeId = String;

static POSITION_SEQ: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HedgeStatus {
    Opening,
    Active,
    Closing,
    Closed,
    Failed,
    /// Close submitted but remote exposure remains; needs confirmation
    PendingClose,
}

impl HedgeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, HedgeStatus::Closed | HedgeStatus::Failed)
    }

    /// Holds the pair: no new hedge may open next to it.
    pub fn blocks_pair(self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(self, next: HedgeStatus) -> bool {
        use HedgeStatus::*;

        if next == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Opening, Active)
                | (Active, Closing)
                | (Closing, Closed)
                | (Closing, PendingClose)
                | (Closing, Active)
                | (PendingClose, Closed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HedgeStatus::Opening => "opening",
            HedgeStatus::Active => "active",
            HedgeStatus::Closing => "closing",
            HedgeStatus::Closed => "closed",
            HedgeStatus::Failed => "failed",
            HedgeStatus::PendingClose => "pending_close",
        }
    }
}

impl fmt::Display for HedgeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegStatus {
    Pending,
    Filled,
    Cancelled,
    Failed,
}

/// One side of a hedge, held on one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leg {
    pub account: AccountId,
    pub side: PositionSide,
    pub target_size: Decimal,
    pub filled_size: Decimal,
    pub entry_price: Option<Decimal>,
    pub current_price: Option<Decimal>,
    /// Price of the protective fill or close order that flattened the leg
    pub exit_price: Option<Decimal>,
    pub status: LegStatus,
    pub open_order_id: Option<String>,
    pub stop_loss_order_id: Option<String>,
    pub take_profit_order_id: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub realized_pnl: Decimal,
}

impl Leg {
    pub fn new(account: AccountId, side: PositionSide, target_size: Decimal) -> Self {
        Self {
            account,
            side,
            target_size,
            filled_size: Decimal::ZERO,
            entry_price: None,
            current_price: None,
            exit_price: None,
            status: LegStatus::Pending,
            open_order_id: None,
            stop_loss_order_id: None,
            take_profit_order_id: None,
            submitted_at: None,
            realized_pnl: Decimal::ZERO,
        }
    }

    pub fn signed_size(&self) -> Decimal {
        self.side.sign() * self.filled_size
    }

    pub fn has_protection(&self) -> bool {
        self.stop_loss_order_id.is_some() || self.take_profit_order_id.is_some()
    }

    /// Exited through a protective fill or a close order.
    pub fn is_settled(&self) -> bool {
        self.exit_price.is_some()
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        match (self.entry_price, self.current_price) {
            (Some(entry), Some(current)) if !self.is_settled() => {
                (current - entry) * self.signed_size()
            }
            _ => Decimal::ZERO,
        }
    }

    /// PnL of exiting `quantity` at `exit_price`.
    pub fn exit_pnl(&self, exit_price: Decimal, quantity: Decimal) -> Decimal {
        match self.entry_price {
            Some(entry) => (exit_price - entry) * quantity * self.side.sign(),
            None => Decimal::ZERO,
        }
    }

    pub fn summary(&self) -> LegSummary {
        LegSummary {
            account: self.account,
            side: self.side,
            size: self.filled_size,
            entry_price: self.entry_price,
        }
    }
}

/// Pricing and bookkeeping captured while a hedge is opened and closed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HedgeMetadata {
    pub leverage: u32,
    pub reference_price: Option<Decimal>,
    pub avg_entry_price: Option<Decimal>,
    pub entry_prices: Vec<Decimal>,
    pub margin_per_leg: Decimal,
    pub notional_per_leg: Decimal,
    pub stop_distance: Option<Decimal>,
    /// Manual distance was reduced to the leverage-derived maximum
    pub stop_distance_capped: bool,
    pub lower_trigger: Option<Decimal>,
    pub upper_trigger: Option<Decimal>,
    pub fill_divergence: Option<Decimal>,
    pub close_reason: Option<String>,
    pub failure_reason: Option<String>,
    pub manual_intervention: bool,
}

/// A set of opposite legs opened together on one market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HedgePosition {
    pub id: HedgeId,
    pub pair_id: String,
    pub market: MarketId,
    pub status: HedgeStatus,
    pub legs: Vec<Leg>,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub metadata: HedgeMetadata,
}

impl HedgePosition {
    /// Fresh OPENING position with no legs yet.
    pub fn opening(pair_id: &str, market: MarketId, leverage: u32) -> Self {
        let now = Utc::now();
        let seq = POSITION_SEQ.fetch_add(1, Ordering::SeqCst);
        Self {
            id: format!("hedge_{}_{}_{}", pair_id, now.timestamp_millis(), seq),
            pair_id: pair_id.to_string(),
            market,
            status: HedgeStatus::Opening,
            legs: Vec::new(),
            unrealized_pnl: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            created_at: now,
            updated_at: now,
            closed_at: None,
            metadata: HedgeMetadata {
                leverage,
                ..Default::default()
            },
        }
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: HedgeStatus) -> Result<(), HedgeError> {
        if !self.status.can_transition_to(next) {
            return Err(HedgeError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        debug!(position = %self.id, from = %self.status, to = %next, "Hedge status change");

        self.status = next;
        self.updated_at = Utc::now();
        if next.is_terminal() {
            self.closed_at = Some(self.updated_at);
        }
        Ok(())
    }

    /// Mark FAILED with a reason. Already-terminal positions keep their status.
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.transition(HedgeStatus::Failed).is_err() {
            warn!(position = %self.id, status = %self.status, %reason, "Failure on terminal position");
        }
        self.metadata.failure_reason = Some(reason);
    }

    pub fn accounts(&self) -> Vec<AccountId> {
        self.legs.iter().map(|l| l.account).collect()
    }

    pub fn leg(&self, account: AccountId) -> Option<&Leg> {
        self.legs.iter().find(|l| l.account == account)
    }

    pub fn leg_mut(&mut self, account: AccountId) -> Option<&mut Leg> {
        self.legs.iter_mut().find(|l| l.account == account)
    }

    pub fn net_signed_size(&self) -> Decimal {
        self.legs.iter().map(Leg::signed_size).sum()
    }

    /// `|sum of signed sizes| / largest leg`; 0 is perfectly hedged.
    pub fn net_exposure_ratio(&self) -> Decimal {
        let largest = self
            .legs
            .iter()
            .map(|l| l.filled_size)
            .max()
            .unwrap_or(Decimal::ZERO);
        safe_div(self.net_signed_size().abs(), largest)
    }

    /// `(max - min) / max` over leg sizes.
    pub fn size_divergence(&self) -> Decimal {
        let sizes: Vec<Decimal> = self.legs.iter().map(|l| l.filled_size).collect();
        divergence_from_max(&sizes)
    }

    /// Legs point in opposite directions, sizes within `tolerance`, and the
    /// net exposure within `tolerance` of zero.
    pub fn is_balanced(&self, tolerance: Decimal) -> bool {
        let has_long = self.legs.iter().any(|l| l.side == PositionSide::Long);
        let has_short = self.legs.iter().any(|l| l.side == PositionSide::Short);
        has_long
            && has_short
            && self.size_divergence() <= tolerance
            && self.net_exposure_ratio() <= tolerance
    }

    /// Refresh marks and aggregate unrealized PnL.
    pub fn update_marks(&mut self, price: Decimal) {
        for leg in &mut self.legs {
            leg.current_price = Some(price);
        }
        self.unrealized_pnl = self.legs.iter().map(Leg::unrealized_pnl).sum();
        self.updated_at = Utc::now();
    }

    pub fn leg_summaries(&self) -> Vec<LegSummary> {
        self.legs.iter().map(Leg::summary).collect()
    }
}
