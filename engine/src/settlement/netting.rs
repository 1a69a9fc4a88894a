//! Netting engine
//!
//! Accumulates signed per-(user, token) deltas and folds them into a
//! single aggregate position per user, treating all stablecoins as 1:1
//! equivalents. All arithmetic is checked i128; the conservation check
//! (every token sums to zero, and so does the aggregate) runs before any
//! ledger movement so a violation can abort the cycle with nothing to
//! unwind.

use crate::error::EngineError;
use crate::models::UserId;
use crate::token::TokenId;
use std::collections::BTreeMap;

/// Signed obligations by user and token for one cycle attempt.
///
/// # Example
/// ```
/// use clearing_engine_core_rs::settlement::NetPositions;
///
/// let mut nets = NetPositions::new();
/// nets.add("alice", "T0", 1_000).unwrap();
/// nets.add("bob", "T0", -1_000).unwrap();
/// nets.assert_conservation().unwrap();
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetPositions {
    per_token: BTreeMap<UserId, BTreeMap<TokenId, i128>>,
}

impl NetPositions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one signed delta.
    ///
    /// # Example
    /// ```
    /// use clearing_engine_core_rs::settlement::NetPositions;
    ///
    /// let mut nets = NetPositions::new();
    /// nets.add("alice", "T0", 500).unwrap();
    /// nets.add("alice", "T0", -200).unwrap();
    /// assert_eq!(nets.user_tokens("alice").unwrap()["T0"], 300);
    /// ```
    pub fn add(&mut self, user: &str, token: &str, delta: i128) -> Result<(), EngineError> {
        let slot = self
            .per_token
            .entry(user.to_string())
            .or_default()
            .entry(token.to_string())
            .or_insert(0);
        *slot = slot.checked_add(delta).ok_or_else(|| {
            EngineError::InternalInvariantViolation(format!(
                "net position overflow for {} on {}",
                user, token
            ))
        })?;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.per_token.is_empty()
    }

    pub fn users(&self) -> impl Iterator<Item = &UserId> {
        self.per_token.keys()
    }

    /// Per-token positions for one user.
    pub fn user_tokens(&self, user: &str) -> Option<&BTreeMap<TokenId, i128>> {
        self.per_token.get(user)
    }

    /// Aggregate net position per user: the cross-stablecoin sum.
    ///
    /// # Example
    /// ```
    /// use clearing_engine_core_rs::settlement::NetPositions;
    ///
    /// let mut nets = NetPositions::new();
    /// nets.add("alice", "T0", 1_000).unwrap();
    /// nets.add("alice", "T1", 500).unwrap();
    /// assert_eq!(nets.aggregate().unwrap()["alice"], 1_500);
    /// ```
    pub fn aggregate(&self) -> Result<BTreeMap<UserId, i128>, EngineError> {
        let mut agg = BTreeMap::new();
        for (user, tokens) in &self.per_token {
            let mut sum: i128 = 0;
            for delta in tokens.values() {
                sum = sum.checked_add(*delta).ok_or_else(|| {
                    EngineError::InternalInvariantViolation(format!(
                        "aggregate overflow for {}",
                        user
                    ))
                })?;
            }
            agg.insert(user.clone(), sum);
        }
        Ok(agg)
    }

    /// Sum of positions per token across all users.
    pub fn token_sums(&self) -> BTreeMap<TokenId, i128> {
        let mut sums: BTreeMap<TokenId, i128> = BTreeMap::new();
        for tokens in self.per_token.values() {
            for (token, delta) in tokens {
                *sums.entry(token.clone()).or_insert(0) += delta;
            }
        }
        sums
    }

    /// Verify conservation: every token nets to zero across users, and so
    /// does the aggregate. A violation means the engine combined items
    /// incorrectly and the cycle must abort.
    ///
    /// # Example
    /// ```
    /// use clearing_engine_core_rs::settlement::NetPositions;
    ///
    /// let mut nets = NetPositions::new();
    /// nets.add("alice", "T0", 1_000).unwrap();
    /// assert!(nets.assert_conservation().is_err());
    ///
    /// nets.add("bob", "T0", -1_000).unwrap();
    /// assert!(nets.assert_conservation().is_ok());
    /// ```
    pub fn assert_conservation(&self) -> Result<(), EngineError> {
        for (token, sum) in self.token_sums() {
            if sum != 0 {
                return Err(EngineError::InternalInvariantViolation(format!(
                    "token {} nets to {}, expected 0",
                    token, sum
                )));
            }
        }
        let total: i128 = self.aggregate()?.values().sum();
        if total != 0 {
            return Err(EngineError::InternalInvariantViolation(format!(
                "aggregate nets to {}, expected 0",
                total
            )));
        }
        Ok(())
    }
}
