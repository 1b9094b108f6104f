//! Leg sizing and protective price math.
//!
//! All legs of a hedge share one margin, one reference price, one basis
//! price, and one stop distance, so their exits line up.

use super::error::HedgeError;
use crate::config::{ExecutionConfig, StopDistanceMode};
use crate::utils::{round_down_to_lot, weighted_average};
use crate::venue::PositionSide;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Margin an account can commit while keeping `min_balance` untouched.
pub fn margin_capacity(available: Decimal, min_balance: Decimal) -> Decimal {
    (available - min_balance).max(Decimal::ZERO)
}

/// Shared size of every leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegSizing {
    pub margin_per_leg: Decimal,
    pub notional_per_leg: Decimal,
    pub quantity: Decimal,
    pub reference_price: Decimal,
}

/// Size legs from fresh available balances.
///
/// The smallest capacity across accounts bounds every leg, capped at
/// `max_position_size`. Quantity is rounded down to `quantity_step`.
pub fn size_legs(
    available_balances: &[Decimal],
    min_balance: Decimal,
    max_position_size: Decimal,
    leverage: Decimal,
    reference_price: Decimal,
    quantity_step: Decimal,
) -> Result<LegSizing, HedgeError> {
    let shared = available_balances
        .iter()
        .map(|available| margin_capacity(*available, min_balance))
        .min()
        .ok_or_else(|| HedgeError::NoCapacity("no accounts".to_string()))?;

    let margin_per_leg = shared.min(max_position_size);
    if margin_per_leg <= Decimal::ZERO {
        return Err(HedgeError::NoCapacity(format!(
            "smallest account has no margin above minimum balance {}",
            min_balance
        )));
    }
    if reference_price <= Decimal::ZERO {
        return Err(HedgeError::NoCapacity("reference price is not positive".to_string()));
    }

    let notional_per_leg = margin_per_leg * leverage;
    let quantity = round_down_to_lot(notional_per_leg / reference_price, quantity_step);
    if quantity <= Decimal::ZERO {
        return Err(HedgeError::NoCapacity(format!(
            "notional {} below one lot at price {}",
            notional_per_leg, reference_price
        )));
    }

    Ok(LegSizing {
        margin_per_leg,
        notional_per_leg,
        quantity,
        reference_price,
    })
}

/// Inputs of the leverage-derived stop distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopPolicy {
    pub max_loss_fraction: Decimal,
    pub safety_factor: Decimal,
    pub unleveraged_distance: Decimal,
}

impl StopPolicy {
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            max_loss_fraction: config.max_loss_fraction,
            safety_factor: config.safety_factor,
            unleveraged_distance: config.unleveraged_stop_distance,
        }
    }
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self::from_config(&ExecutionConfig::default())
    }
}

/// `safety_factor * max_loss_fraction / leverage`, or the unleveraged floor.
pub fn auto_stop_distance(leverage: u32, policy: &StopPolicy) -> Decimal {
    if leverage <= 1 {
        return policy.unleveraged_distance;
    }
    policy.safety_factor * (policy.max_loss_fraction / Decimal::from(leverage))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopDistance {
    pub distance: Decimal,
    /// A manual distance was reduced to the auto distance
    pub capped: bool,
}

/// Resolve a pair's configured mode into the distance actually used.
pub fn resolve_stop_distance(mode: StopDistanceMode, leverage: u32, policy: &StopPolicy) -> StopDistance {
    let auto = auto_stop_distance(leverage, policy);
    match mode {
        StopDistanceMode::Auto => StopDistance {
            distance: auto,
            capped: false,
        },
        StopDistanceMode::Manual(manual) if manual > auto => StopDistance {
            distance: auto,
            capped: true,
        },
        StopDistanceMode::Manual(manual) => StopDistance {
            distance: manual,
            capped: false,
        },
    }
}

/// Shared trigger prices around one basis price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectiveLevels {
    pub basis: Decimal,
    pub lower: Decimal,
    pub upper: Decimal,
}

impl ProtectiveLevels {
    pub fn new(basis: Decimal, distance: Decimal) -> Self {
        Self {
            basis,
            lower: basis * (Decimal::ONE - distance),
            upper: basis * (Decimal::ONE + distance),
        }
    }

    /// Basis is the size-weighted average of `(price, quantity)` fills.
    pub fn from_fills(fills: &[(Decimal, Decimal)], distance: Decimal) -> Option<Self> {
        let basis = weighted_average(fills);
        (basis > Decimal::ZERO).then(|| Self::new(basis, distance))
    }

    pub fn stop_loss_for(&self, side: PositionSide) -> Decimal {
        match side {
            PositionSide::Long => self.lower,
            PositionSide::Short => self.upper,
        }
    }

    pub fn take_profit_for(&self, side: PositionSide) -> Decimal {
        match side {
            PositionSide::Long => self.upper,
            PositionSide::Short => self.lower,
        }
    }
}

/// Relative price move from entry that forces an active close.
pub fn emergency_move_threshold(leverage: u32, config: &ExecutionConfig) -> Decimal {
    if leverage > 1 {
        config.emergency_move_leveraged / Decimal::from(leverage)
    } else {
        config.emergency_move_unleveraged
    }
}
