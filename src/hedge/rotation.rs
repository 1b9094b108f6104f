//! Per-pair direction rotation.
//!
//! Each account takes the opposite side from its previous hedge on the
//! same pair so no account accumulates directional history. When flipping
//! would leave the group unbalanced (new accounts, changed membership),
//! sides alternate instead, starting from the first account's flipped side.

use crate::venue::{AccountId, PositionSide};
use std::collections::HashMap;

#[derive(Debug, Default, Clone)]
pub struct DirectionRotation {
    last: HashMap<String, HashMap<AccountId, PositionSide>>,
}

impl DirectionRotation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sides for `accounts` on `pair_id`; always as many longs as shorts.
    ///
    /// `accounts` must have even length.
    pub fn assign(&self, pair_id: &str, accounts: &[AccountId]) -> Vec<(AccountId, PositionSide)> {
        let previous = self.last.get(pair_id);
        let flipped: Vec<Option<PositionSide>> = accounts
            .iter()
            .map(|a| previous.and_then(|p| p.get(a)).map(|s| s.opposite()))
            .collect();

        let all_known = flipped.iter().all(Option::is_some);
        let longs = flipped
            .iter()
            .filter(|s| **s == Some(PositionSide::Long))
            .count();
        if all_known && longs * 2 == accounts.len() {
            return accounts
                .iter()
                .zip(flipped)
                .filter_map(|(a, s)| s.map(|s| (*a, s)))
                .collect();
        }

        let mut side = flipped
            .first()
            .copied()
            .flatten()
            .unwrap_or(PositionSide::Long);
        accounts
            .iter()
            .map(|a| {
                let assigned = (*a, side);
                side = side.opposite();
                assigned
            })
            .collect()
    }

    /// Remember the sides of a hedge that went ACTIVE.
    pub fn record(&mut self, pair_id: &str, assignment: &[(AccountId, PositionSide)]) {
        let sides = self.last.entry(pair_id.to_string()).or_default();
        for (account, side) in assignment {
            sides.insert(*account, *side);
        }
    }

    pub fn last_side(&self, pair_id: &str, account: AccountId) -> Option<PositionSide> {
        self.last.get(pair_id).and_then(|p| p.get(&account)).copied()
    }
}
