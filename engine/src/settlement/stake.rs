//! Stake manager
//!
//! Stake is a collateral deposit proportional to a participant's gross
//! outgoing value, drawn through their ranked token preferences and held
//! in engine custody for the duration of the cycle. On default the
//! defaulter's stake is seized and redistributed to the surviving
//! participants pro rata to their gross outgoing.
//!
//! Rates are basis points; the quota is the floor of `gross × bps / 10⁴`,
//! so collected stake never exceeds the configured fraction.

use crate::models::UserId;
use crate::token::TokenId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Stake quota for one participant.
///
/// Split multiply-divide keeps the arithmetic inside u128 for any amount
/// the order book accepts.
///
/// # Example
/// ```
/// use clearing_engine_core_rs::settlement::stake_quota;
///
/// assert_eq!(stake_quota(1_000, 2_000), 200); // 20%
/// assert_eq!(stake_quota(1_001, 2_000), 200); // floor, never above the rate
/// ```
pub fn stake_quota(gross: u128, rate_bps: u32) -> u128 {
    let bps = rate_bps as u128;
    (gross / 10_000) * bps + (gross % 10_000) * bps / 10_000
}

/// Collected stake per participant and token for one cycle.
///
/// # Example
/// ```
/// use clearing_engine_core_rs::settlement::StakeLedger;
///
/// let mut ledger = StakeLedger::new();
/// ledger.record("alice", "T0", 200);
/// assert_eq!(ledger.total("alice"), 200);
///
/// let taken = ledger.remove_user("alice");
/// assert_eq!(taken.get("T0"), Some(&200));
/// assert_eq!(ledger.total("alice"), 0);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeLedger {
    collected: BTreeMap<UserId, BTreeMap<TokenId, u128>>,
}

impl StakeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, user: &str, token: &str, amount: u128) {
        if amount == 0 {
            return;
        }
        *self
            .collected
            .entry(user.to_string())
            .or_default()
            .entry(token.to_string())
            .or_insert(0) += amount;
    }

    /// Total stake held for `user` across tokens.
    pub fn total(&self, user: &str) -> u128 {
        self.collected
            .get(user)
            .map(|tokens| tokens.values().sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.collected.values().all(|tokens| tokens.is_empty())
    }

    pub fn users(&self) -> Vec<UserId> {
        self.collected.keys().cloned().collect()
    }

    /// Per-token holdings for `user`, ascending by token id.
    pub fn tokens_of(&self, user: &str) -> Vec<(TokenId, u128)> {
        self.collected
            .get(user)
            .map(|tokens| tokens.iter().map(|(t, a)| (t.clone(), *a)).collect())
            .unwrap_or_default()
    }

    /// Remove and return everything held for `user` (seizure or refund).
    pub fn remove_user(&mut self, user: &str) -> BTreeMap<TokenId, u128> {
        self.collected.remove(user).unwrap_or_default()
    }

    /// Apply up to `owed` of `user`'s stake toward their pay-in, draining
    /// the ranked preference order first and any remaining holdings in
    /// token-id order. Returns the slices moved.
    ///
    /// # Example
    /// ```
    /// use clearing_engine_core_rs::settlement::StakeLedger;
    ///
    /// let mut ledger = StakeLedger::new();
    /// ledger.record("alice", "T0", 100);
    /// ledger.record("alice", "T1", 100);
    ///
    /// let ranked = vec!["T1".to_string(), "T0".to_string()];
    /// let applied = ledger.apply_toward("alice", 150, &ranked);
    /// assert_eq!(applied, vec![("T1".to_string(), 100), ("T0".to_string(), 50)]);
    /// assert_eq!(ledger.total("alice"), 50);
    /// ```
    pub fn apply_toward(
        &mut self,
        user: &str,
        owed: u128,
        ranked: &[TokenId],
    ) -> Vec<(TokenId, u128)> {
        let Some(tokens) = self.collected.get_mut(user) else {
            return Vec::new();
        };
        let mut order: Vec<TokenId> = ranked
            .iter()
            .filter(|t| tokens.contains_key(*t))
            .cloned()
            .collect();
        for token in tokens.keys() {
            if !order.contains(token) {
                order.push(token.clone());
            }
        }

        let mut remaining = owed;
        let mut applied = Vec::new();
        for token in order {
            if remaining == 0 {
                break;
            }
            let held = tokens.get_mut(&token).unwrap();
            let take = remaining.min(*held);
            if take == 0 {
                continue;
            }
            *held -= take;
            if *held == 0 {
                tokens.remove(&token);
            }
            remaining -= take;
            applied.push((token, take));
        }
        applied
    }
}

/// Split `pool_amount` across `weights` pro rata, ascending by user id.
///
/// Floor shares are handed out first; the integer remainder goes to the
/// lowest-id participant with a nonzero weight so the pool always drains
/// exactly.
///
/// # Example
/// ```
/// use clearing_engine_core_rs::settlement::pro_rata_shares;
/// use std::collections::BTreeMap;
///
/// let mut weights = BTreeMap::new();
/// weights.insert("alice".to_string(), 3u128);
/// weights.insert("bob".to_string(), 7u128);
///
/// let shares = pro_rata_shares(100, &weights);
/// assert_eq!(shares, vec![("alice".to_string(), 30), ("bob".to_string(), 70)]);
/// ```
pub fn pro_rata_shares(
    pool_amount: u128,
    weights: &BTreeMap<UserId, u128>,
) -> Vec<(UserId, u128)> {
    let total: u128 = weights.values().sum();
    if pool_amount == 0 || total == 0 {
        return Vec::new();
    }

    let mut shares = Vec::new();
    let mut distributed: u128 = 0;
    for (user, weight) in weights {
        if *weight == 0 {
            continue;
        }
        let share = match pool_amount.checked_mul(*weight) {
            Some(product) => product / total,
            None => (pool_amount / total) * weight,
        };
        distributed += share;
        shares.push((user.clone(), share));
    }

    let remainder = pool_amount - distributed;
    if remainder > 0 {
        if let Some(first) = shares.first_mut() {
            first.1 += remainder;
        }
    }
    shares.retain(|(_, amount)| *amount > 0);
    shares
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stake_quota_floor() {
        assert_eq!(stake_quota(1_000, 2_000), 200);
        assert_eq!(stake_quota(1_001, 2_000), 200);
        assert_eq!(stake_quota(0, 2_000), 0);
        assert_eq!(stake_quota(10_000, 10_000), 10_000);
    }

    #[test]
    fn test_apply_toward_prefers_ranked_order() {
        let mut ledger = StakeLedger::new();
        ledger.record("alice", "T0", 100);
        ledger.record("alice", "T1", 100);

        let ranked = vec!["T1".to_string(), "T0".to_string()];
        let applied = ledger.apply_toward("alice", 150, &ranked);
        assert_eq!(
            applied,
            vec![("T1".to_string(), 100), ("T0".to_string(), 50)]
        );
        assert_eq!(ledger.total("alice"), 50);
    }

    #[test]
    fn test_pro_rata_drains_exactly() {
        let mut weights = BTreeMap::new();
        weights.insert("alice".to_string(), 3u128);
        weights.insert("bob".to_string(), 7u128);

        let shares = pro_rata_shares(100, &weights);
        let total: u128 = shares.iter().map(|(_, a)| a).sum();
        assert_eq!(total, 100);
        // bob carries 70, alice 30 (floor shares leave no remainder here)
        assert_eq!(shares, vec![("alice".to_string(), 30), ("bob".to_string(), 70)]);

        let shares = pro_rata_shares(101, &weights);
        let total: u128 = shares.iter().map(|(_, a)| a).sum();
        assert_eq!(total, 101, "remainder must not leak");
    }
}
