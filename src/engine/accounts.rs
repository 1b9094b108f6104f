//! Per-account bookkeeping: cooldowns, daily trade counts, cached balances.
//!
//! Cached balances are hints for status output only. Eligibility checks
//! that move money always use a fresh venue balance.

use crate::config::Config;
use crate::venue::{AccountBalance, AccountId};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize)]
pub struct AccountState {
    pub id: AccountId,
    pub label: String,
    pub is_active: bool,
    pub max_daily_trades: u32,
    pub trades_today: u32,
    pub trade_day: NaiveDate,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_balance: Option<AccountBalance>,
}

impl AccountState {
    fn roll_day(&mut self, today: NaiveDate) {
        if self.trade_day != today {
            self.trade_day = today;
            self.trades_today = 0;
        }
    }
}

#[derive(Debug, Default)]
pub struct AccountBook {
    accounts: BTreeMap<AccountId, AccountState>,
}

impl AccountBook {
    pub fn from_config(config: &Config) -> Self {
        let today = Utc::now().date_naive();
        let accounts = config
            .accounts
            .iter()
            .map(|a| {
                (
                    a.id,
                    AccountState {
                        id: a.id,
                        label: a.label.clone(),
                        is_active: a.is_active,
                        max_daily_trades: a.max_daily_trades,
                        trades_today: 0,
                        trade_day: today,
                        cooldown_until: None,
                        last_balance: None,
                    },
                )
            })
            .collect();
        Self { accounts }
    }

    /// Why `id` cannot trade at `now`, or `None` if it can.
    pub fn ineligibility(&self, id: AccountId, now: DateTime<Utc>) -> Option<String> {
        let Some(account) = self.accounts.get(&id) else {
            return Some(format!("account {} not configured", id));
        };
        if !account.is_active {
            return Some(format!("account {} inactive", id));
        }
        if let Some(until) = account.cooldown_until {
            if now < until {
                return Some(format!("account {} cooling down until {}", id, until));
            }
        }
        let trades = if account.trade_day == now.date_naive() {
            account.trades_today
        } else {
            0
        };
        if trades >= account.max_daily_trades {
            return Some(format!(
                "account {} reached {} trades today",
                id, account.max_daily_trades
            ));
        }
        None
    }

    /// Accounts among `ids` that may trade at `now`, in the given order.
    pub fn eligible(&self, ids: &[AccountId], now: DateTime<Utc>) -> Vec<AccountId> {
        ids.iter()
            .copied()
            .filter(|id| self.ineligibility(*id, now).is_none())
            .collect()
    }

    /// Count a trade and start the cooldown.
    pub fn record_trade(&mut self, id: AccountId, cooldown: Duration, now: DateTime<Utc>) {
        if let Some(account) = self.accounts.get_mut(&id) {
            account.roll_day(now.date_naive());
            account.trades_today += 1;
            account.cooldown_until = Some(now + cooldown);
        }
    }

    pub fn start_cooldown(&mut self, id: AccountId, cooldown: Duration, now: DateTime<Utc>) {
        if let Some(account) = self.accounts.get_mut(&id) {
            account.cooldown_until = Some(now + cooldown);
        }
    }

    pub fn update_balance(&mut self, balance: AccountBalance) {
        if let Some(account) = self.accounts.get_mut(&balance.account) {
            account.last_balance = Some(balance);
        }
    }

    pub fn snapshot(&self) -> Vec<AccountState> {
        self.accounts.values().cloned().collect()
    }
}
