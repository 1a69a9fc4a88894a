//! User registry
//!
//! Stores per-participant configuration: the ranked accepted-stablecoin
//! list and, implicitly, whether the participant may submit at all (a user
//! is configured iff present here). Every mutation revalidates the whole
//! list against the token hub so a registry entry is always usable for
//! stake collection and disbursement routing.

use crate::error::EngineError;
use crate::models::{UserConfig, UserId};
use crate::token::{TokenHub, TokenId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Per-user ranked accepted-token configuration.
///
/// # Example
/// ```
/// use clearing_engine_core_rs::{FungibleToken, TokenAdapter, TokenHub, UserRegistry};
///
/// let mut hub = TokenHub::new();
/// hub.register(TokenAdapter::Fungible(FungibleToken::new("T0".to_string())));
///
/// let mut registry = UserRegistry::new();
/// registry.configure("alice", vec!["T0".to_string()], &hub).unwrap();
/// assert!(registry.accepts("alice", "T0"));
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserRegistry {
    users: BTreeMap<UserId, UserConfig>,
}

impl UserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace `user`'s ranked list atomically.
    ///
    /// Fails with `InvalidConfig` if the list is empty, contains
    /// duplicates, references an unknown or non-fungible token, or the
    /// user id collides with the custody namespace.
    ///
    /// # Example
    /// ```
    /// use clearing_engine_core_rs::{FungibleToken, TokenAdapter, TokenHub, UserRegistry};
    ///
    /// let mut hub = TokenHub::new();
    /// hub.register(TokenAdapter::Fungible(FungibleToken::new("T0".to_string())));
    ///
    /// let mut registry = UserRegistry::new();
    /// registry.configure("alice", vec!["T0".to_string()], &hub).unwrap();
    /// assert!(registry.is_configured("alice"));
    ///
    /// // A rejected list leaves the previous configuration in place
    /// let dup = vec!["T0".to_string(), "T0".to_string()];
    /// assert!(registry.configure("alice", dup, &hub).is_err());
    /// assert_eq!(registry.ranked_tokens("alice").unwrap(), vec!["T0".to_string()]);
    /// ```
    pub fn configure(
        &mut self,
        user: &str,
        tokens: Vec<TokenId>,
        hub: &TokenHub,
    ) -> Result<(), EngineError> {
        if user.is_empty() || user.starts_with('$') {
            return Err(EngineError::InvalidConfig(format!(
                "invalid user id: {:?}",
                user
            )));
        }
        Self::validate_tokens(&tokens, hub)?;
        self.users
            .entry(user.to_string())
            .or_insert_with(|| UserConfig::new(Vec::new()))
            .replace(tokens);
        Ok(())
    }

    /// Append one token at the lowest rank.
    ///
    /// # Example
    /// ```
    /// use clearing_engine_core_rs::{FungibleToken, TokenAdapter, TokenHub, UserRegistry};
    ///
    /// let mut hub = TokenHub::new();
    /// for token in ["T0", "T1"] {
    ///     hub.register(TokenAdapter::Fungible(FungibleToken::new(token.to_string())));
    /// }
    ///
    /// let mut registry = UserRegistry::new();
    /// registry.configure("alice", vec!["T0".to_string()], &hub).unwrap();
    /// registry.add_token("alice", "T1".to_string(), &hub).unwrap();
    /// assert_eq!(
    ///     registry.ranked_tokens("alice").unwrap(),
    ///     vec!["T0".to_string(), "T1".to_string()]
    /// );
    /// ```
    pub fn add_token(&mut self, user: &str, token: TokenId, hub: &TokenHub) -> Result<(), EngineError> {
        let mut tokens = self.get_mut(user)?.accepted_tokens().to_vec();
        tokens.push(token.clone());
        Self::validate_tokens(&tokens, hub)?;
        self.users.get_mut(user).unwrap().push_token(token);
        Ok(())
    }

    /// Remove one token; the remaining list must stay non-empty.
    ///
    /// # Example
    /// ```
    /// use clearing_engine_core_rs::{FungibleToken, TokenAdapter, TokenHub, UserRegistry};
    ///
    /// let mut hub = TokenHub::new();
    /// for token in ["T0", "T1"] {
    ///     hub.register(TokenAdapter::Fungible(FungibleToken::new(token.to_string())));
    /// }
    ///
    /// let mut registry = UserRegistry::new();
    /// registry
    ///     .configure("alice", vec!["T0".to_string(), "T1".to_string()], &hub)
    ///     .unwrap();
    /// registry.remove_token("alice", "T0").unwrap();
    /// assert_eq!(registry.ranked_tokens("alice").unwrap(), vec!["T1".to_string()]);
    ///
    /// // The last token cannot be removed
    /// assert!(registry.remove_token("alice", "T1").is_err());
    /// ```
    pub fn remove_token(&mut self, user: &str, token: &str) -> Result<(), EngineError> {
        let config = self.get_mut(user)?;
        if !config.accepts(token) {
            return Err(EngineError::InvalidConfig(format!(
                "{} does not accept {}",
                user, token
            )));
        }
        if config.accepted_tokens().len() == 1 {
            return Err(EngineError::InvalidConfig(
                "accepted list must stay non-empty".to_string(),
            ));
        }
        config.remove_token(token);
        Ok(())
    }

    /// Re-rank the full list. Must be a permutation-compatible valid list.
    ///
    /// # Example
    /// ```
    /// use clearing_engine_core_rs::{FungibleToken, TokenAdapter, TokenHub, UserRegistry};
    ///
    /// let mut hub = TokenHub::new();
    /// for token in ["T0", "T1"] {
    ///     hub.register(TokenAdapter::Fungible(FungibleToken::new(token.to_string())));
    /// }
    ///
    /// let mut registry = UserRegistry::new();
    /// registry
    ///     .configure("alice", vec!["T0".to_string(), "T1".to_string()], &hub)
    ///     .unwrap();
    /// registry
    ///     .set_rank("alice", vec!["T1".to_string(), "T0".to_string()], &hub)
    ///     .unwrap();
    /// assert_eq!(registry.get("alice").unwrap().top_preference(), "T1");
    /// ```
    pub fn set_rank(
        &mut self,
        user: &str,
        tokens: Vec<TokenId>,
        hub: &TokenHub,
    ) -> Result<(), EngineError> {
        self.get_mut(user)?;
        Self::validate_tokens(&tokens, hub)?;
        self.users.get_mut(user).unwrap().replace(tokens);
        Ok(())
    }

    /// Snapshot view of one participant's configuration.
    ///
    /// # Example
    /// ```
    /// use clearing_engine_core_rs::{FungibleToken, TokenAdapter, TokenHub, UserRegistry};
    ///
    /// let mut hub = TokenHub::new();
    /// hub.register(TokenAdapter::Fungible(FungibleToken::new("T0".to_string())));
    ///
    /// let mut registry = UserRegistry::new();
    /// registry.configure("alice", vec!["T0".to_string()], &hub).unwrap();
    /// assert!(registry.get("alice").is_some());
    /// assert!(registry.get("ghost").is_none());
    /// ```
    pub fn get(&self, user: &str) -> Option<&UserConfig> {
        self.users.get(user)
    }

    /// True iff the user has been configured.
    pub fn is_configured(&self, user: &str) -> bool {
        self.users.contains_key(user)
    }

    /// True iff the user is configured and accepts `token`.
    ///
    /// # Example
    /// ```
    /// use clearing_engine_core_rs::{FungibleToken, TokenAdapter, TokenHub, UserRegistry};
    ///
    /// let mut hub = TokenHub::new();
    /// hub.register(TokenAdapter::Fungible(FungibleToken::new("T0".to_string())));
    ///
    /// let mut registry = UserRegistry::new();
    /// registry.configure("alice", vec!["T0".to_string()], &hub).unwrap();
    /// assert!(registry.accepts("alice", "T0"));
    /// assert!(!registry.accepts("alice", "T1"));
    /// assert!(!registry.accepts("ghost", "T0"));
    /// ```
    pub fn accepts(&self, user: &str, token: &str) -> bool {
        self.users.get(user).map(|c| c.accepts(token)).unwrap_or(false)
    }

    /// Ranked accepted tokens for `user`, or an `InvalidConfig` error for
    /// an unconfigured user.
    ///
    /// # Example
    /// ```
    /// use clearing_engine_core_rs::{FungibleToken, TokenAdapter, TokenHub, UserRegistry};
    ///
    /// let mut hub = TokenHub::new();
    /// for token in ["T0", "T1"] {
    ///     hub.register(TokenAdapter::Fungible(FungibleToken::new(token.to_string())));
    /// }
    ///
    /// let mut registry = UserRegistry::new();
    /// registry
    ///     .configure("alice", vec!["T1".to_string(), "T0".to_string()], &hub)
    ///     .unwrap();
    /// assert_eq!(
    ///     registry.ranked_tokens("alice").unwrap(),
    ///     vec!["T1".to_string(), "T0".to_string()]
    /// );
    /// assert!(registry.ranked_tokens("ghost").is_err());
    /// ```
    pub fn ranked_tokens(&self, user: &str) -> Result<Vec<TokenId>, EngineError> {
        self.users
            .get(user)
            .map(|c| c.accepted_tokens().to_vec())
            .ok_or_else(|| EngineError::InvalidConfig(format!("user {} is not configured", user)))
    }

    fn get_mut(&mut self, user: &str) -> Result<&mut UserConfig, EngineError> {
        self.users
            .get_mut(user)
            .ok_or_else(|| EngineError::InvalidConfig(format!("user {} is not configured", user)))
    }

    fn validate_tokens(tokens: &[TokenId], hub: &TokenHub) -> Result<(), EngineError> {
        if tokens.is_empty() {
            return Err(EngineError::InvalidConfig(
                "accepted list must be non-empty".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for token in tokens {
            if !seen.insert(token) {
                return Err(EngineError::InvalidConfig(format!(
                    "duplicate token {}",
                    token
                )));
            }
            if !hub.is_fungible(token) {
                return Err(EngineError::InvalidConfig(format!(
                    "unknown or non-fungible token {}",
                    token
                )));
            }
        }
        Ok(())
    }
}
