//! Decimal arithmetic utilities for order sizing and hedge checks.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Round down to lot size (quantity precision).
pub fn round_down_to_lot(value: Decimal, lot_size: Decimal) -> Decimal {
    if lot_size == Decimal::ZERO {
        return value;
    }
    (value / lot_size).floor() * lot_size
}

/// Calculate basis points (1 bp = 0.01%)
pub fn to_basis_points(rate: Decimal) -> Decimal {
    rate * dec!(10000)
}

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Calculate weighted average of `(value, weight)` pairs.
pub fn weighted_average(values: &[(Decimal, Decimal)]) -> Decimal {
    let (sum, weight_sum) = values.iter().fold(
        (Decimal::ZERO, Decimal::ZERO),
        |(sum, weight_sum), (val, weight)| (sum + val * weight, weight_sum + weight),
    );

    safe_div(sum, weight_sum)
}

/// `(max - min) / min` over a set of prices.
///
/// Used for fill price agreement between legs: 100 vs 102.5 is 0.025.
pub fn divergence_from_min(values: &[Decimal]) -> Decimal {
    match min_max(values) {
        Some((min, max)) => safe_div(max - min, min),
        None => Decimal::ZERO,
    }
}

/// `(max - min) / max` over a set of sizes.
///
/// Used for leg size imbalance, bounded to `[0, 1]` for non-negative input.
pub fn divergence_from_max(values: &[Decimal]) -> Decimal {
    match min_max(values) {
        Some((min, max)) => safe_div(max - min, max),
        None => Decimal::ZERO,
    }
}

fn min_max(values: &[Decimal]) -> Option<(Decimal, Decimal)> {
    let first = *values.first()?;
    Some(values.iter().fold((first, first), |(lo, hi), v| {
        (lo.min(*v), hi.max(*v))
    }))
}
