//! Venue value types.
//!
//! Fixed schema for everything crossing the gateway boundary. Optional
//! venue fields are `Option`s, never queried at runtime.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Venue account index.
pub type AccountId = u64;

/// Venue market index.
pub type MarketId = u32;

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// `+1` for buys, `-1` for sells.
    pub fn sign(self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// Direction of an exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Order side that opens this exposure.
    pub fn entry_side(self) -> Side {
        match self {
            PositionSide::Long => Side::Buy,
            PositionSide::Short => Side::Sell,
        }
    }

    /// Order side that reduces this exposure.
    pub fn exit_side(self) -> Side {
        self.entry_side().opposite()
    }

    pub fn opposite(self) -> Self {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }

    pub fn sign(self) -> Decimal {
        self.entry_side().sign()
    }

    /// Side of a signed size, `None` when flat.
    pub fn from_signed(size: Decimal) -> Option<Self> {
        if size > Decimal::ZERO {
            Some(PositionSide::Long)
        } else if size < Decimal::ZERO {
            Some(PositionSide::Short)
        } else {
            None
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "long"),
            PositionSide::Short => write!(f, "short"),
        }
    }
}

/// What an order is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Market,
    StopLoss,
    TakeProfit,
}

impl OrderKind {
    /// Stop-loss and take-profit orders protect a position; they never open one.
    pub fn is_protective(self) -> bool {
        matches!(self, OrderKind::StopLoss | OrderKind::TakeProfit)
    }
}

/// Remote order lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderState {
    /// Still able to trade.
    pub fn is_live(self) -> bool {
        matches!(self, OrderState::Open | OrderState::PartiallyFilled)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_live()
    }
}

/// Acknowledgement returned by a submit call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderHandle {
    pub order_id: String,
    pub account: AccountId,
    pub market: MarketId,
    pub side: Side,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    /// Present once the venue has reported a fill
    pub avg_fill_price: Option<Decimal>,
    pub state: OrderState,
    pub submitted_at: DateTime<Utc>,
}

impl OrderHandle {
    pub fn is_filled(&self) -> bool {
        self.state == OrderState::Filled && self.avg_fill_price.is_some()
    }
}

/// An order as reported by a fresh venue query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteOrder {
    pub order_id: String,
    /// Client-assigned id echoed back by the venue, when it has one
    pub client_order_id: Option<String>,
    pub account: AccountId,
    pub market: MarketId,
    pub kind: OrderKind,
    pub side: Side,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub trigger_price: Option<Decimal>,
    pub avg_fill_price: Option<Decimal>,
    pub state: OrderState,
    pub created_at: DateTime<Utc>,
}

/// A position as reported by a fresh venue query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemotePosition {
    pub account: AccountId,
    pub market: MarketId,
    /// Positive for long, negative for short
    pub size: Decimal,
    pub entry_price: Decimal,
    pub unrealized_pnl: Decimal,
}

impl RemotePosition {
    pub fn side(&self) -> Option<PositionSide> {
        PositionSide::from_signed(self.size)
    }

    pub fn abs_size(&self) -> Decimal {
        self.size.abs()
    }

    /// Non-zero beyond `epsilon`.
    pub fn is_open(&self, epsilon: Decimal) -> bool {
        self.abs_size() > epsilon
    }
}

/// Account balances.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub account: AccountId,
    pub total: Decimal,
    pub available: Decimal,
}

/// Best bid and ask.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookTop {
    pub market: MarketId,
    pub bid: Decimal,
    pub ask: Decimal,
}

impl BookTop {
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }

    /// `(ask - bid) / mid`, `None` for a crossed or empty book.
    pub fn spread_ratio(&self) -> Option<Decimal> {
        let mid = self.mid();
        if self.bid <= Decimal::ZERO || self.ask < self.bid || mid <= Decimal::ZERO {
            return None;
        }
        Some((self.ask - self.bid) / mid)
    }
}

/// Reduce-only trigger order protecting a leg.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectiveOrderRequest {
    pub account: AccountId,
    pub market: MarketId,
    pub kind: OrderKind,
    pub side: Side,
    pub quantity: Decimal,
    pub trigger_price: Decimal,
}
