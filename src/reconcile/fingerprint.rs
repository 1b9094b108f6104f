//! Fingerprints of observed remote state.
//!
//! Each function returns `None` when the pair looks consistent for that
//! condition, or a compact string summarising what was seen. Identical
//! strings across ticks mean "nothing changed".

use crate::utils::divergence_from_max;
use crate::venue::{AccountId, PositionSide, RemoteOrder, RemotePosition};
use rust_decimal::Decimal;

/// Fresh remote state of one account on a pair's market.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountObservation {
    pub account: AccountId,
    pub positions: Vec<RemotePosition>,
    pub open_orders: Vec<RemoteOrder>,
}

impl AccountObservation {
    pub fn new(
        account: AccountId,
        positions: Vec<RemotePosition>,
        open_orders: Vec<RemoteOrder>,
    ) -> Self {
        Self {
            account,
            positions,
            open_orders,
        }
    }

    /// Positions above the flat threshold.
    pub fn open_positions(&self, epsilon: Decimal) -> impl Iterator<Item = &RemotePosition> {
        self.positions.iter().filter(move |p| p.is_open(epsilon))
    }

    pub fn has_position(&self, epsilon: Decimal) -> bool {
        self.open_positions(epsilon).next().is_some()
    }

    pub fn net_size(&self, epsilon: Decimal) -> Decimal {
        self.open_positions(epsilon).map(|p| p.size).sum()
    }

    /// Live stop-loss and take-profit orders.
    pub fn protective_orders(&self) -> impl Iterator<Item = &RemoteOrder> {
        self.open_orders
            .iter()
            .filter(|o| o.kind.is_protective() && o.state.is_live())
    }

    /// Live orders that could open or grow a position.
    pub fn entry_orders(&self) -> impl Iterator<Item = &RemoteOrder> {
        self.open_orders
            .iter()
            .filter(|o| !o.kind.is_protective() && o.state.is_live())
    }
}

fn sorted(observations: &[AccountObservation]) -> Vec<&AccountObservation> {
    let mut sorted: Vec<&AccountObservation> = observations.iter().collect();
    sorted.sort_by_key(|o| o.account);
    sorted
}

fn size_token(size: Decimal) -> String {
    size.round_dp(8).normalize().to_string()
}

/// Some accounts hold a position and some do not.
///
/// Format: `account:has_position:count` per account, sorted by account, `|` separated.
pub fn inconsistency_fingerprint(
    observations: &[AccountObservation],
    epsilon: Decimal,
) -> Option<String> {
    let holding = observations
        .iter()
        .filter(|o| o.has_position(epsilon))
        .count();
    if holding == 0 || holding == observations.len() {
        return None;
    }

    Some(
        sorted(observations)
            .iter()
            .map(|o| {
                format!(
                    "{}:{}:{}",
                    o.account,
                    o.has_position(epsilon),
                    o.open_positions(epsilon).count()
                )
            })
            .collect::<Vec<_>>()
            .join("|"),
    )
}

/// Every account holds a position but sizes diverge beyond `tolerance`
/// (`(max - min) / max`), or the exposures do not offset.
///
/// Format: `account:side:size` per holding account, plus `|same_side`
/// when no opposing leg exists.
pub fn imbalance_fingerprint(
    observations: &[AccountObservation],
    epsilon: Decimal,
    tolerance: Decimal,
) -> Option<String> {
    let holding: Vec<&AccountObservation> = sorted(observations)
        .into_iter()
        .filter(|o| o.has_position(epsilon))
        .collect();
    if holding.len() < 2 {
        return None;
    }

    let nets: Vec<Decimal> = holding.iter().map(|o| o.net_size(epsilon)).collect();
    let sizes: Vec<Decimal> = nets.iter().map(|n| n.abs()).collect();
    let has_long = nets.iter().any(|n| *n > Decimal::ZERO);
    let has_short = nets.iter().any(|n| *n < Decimal::ZERO);
    let one_sided = !(has_long && has_short);
    let diverged = divergence_from_max(&sizes) > tolerance;

    if !diverged && !one_sided {
        return None;
    }

    let mut fingerprint = holding
        .iter()
        .zip(&nets)
        .map(|(o, net)| {
            let side = PositionSide::from_signed(*net)
                .map(|s| s.to_string())
                .unwrap_or_else(|| "flat".to_string());
            format!("{}:{}:{}", o.account, side, size_token(net.abs()))
        })
        .collect::<Vec<_>>()
        .join("|");
    if one_sided {
        fingerprint.push_str("|same_side");
    }
    Some(fingerprint)
}

/// Accounts holding a position with no live protective order.
///
/// Format: `account:size` per unprotected account.
pub fn missing_protection_fingerprint(
    observations: &[AccountObservation],
    epsilon: Decimal,
) -> Option<String> {
    let unprotected: Vec<String> = sorted(observations)
        .into_iter()
        .filter(|o| o.has_position(epsilon) && o.protective_orders().next().is_none())
        .map(|o| format!("{}:{}", o.account, size_token(o.net_size(epsilon).abs())))
        .collect();

    if unprotected.is_empty() {
        None
    } else {
        Some(unprotected.join("|"))
    }
}
