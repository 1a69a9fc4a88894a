//! Token adapters
//!
//! The engine settles against external token ledgers through a minimal
//! adapter surface: balance, allowance, debit into custody, credit out of
//! custody, and the non-fungible equivalents. The set of adapter kinds is
//! closed (fungible stablecoins and non-fungible assets), so adapters are a
//! tagged sum type rather than a trait object.
//!
//! CRITICAL: All fungible amounts are u128 minor units.
//!
//! # Custody model
//!
//! Every fungible ledger carries a reserved custody account owned by the
//! engine. `transfer_from` moves value owner → custody (consuming the
//! owner's allowance), `transfer` moves value custody → receiver. The
//! custody account must be empty outside a settlement cycle.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Account identifier (participant or custody).
pub type AccountId = String;

/// Token identifier (fungible or non-fungible ledger).
pub type TokenId = String;

/// Reserved ledger account holding engine custody during a cycle.
///
/// User ids starting with `$` are rejected at configuration so no
/// participant can alias this account.
pub const ENGINE_ACCOUNT: &str = "$engine";

/// Errors surfaced by token adapters
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("Unknown token: {0}")]
    UnknownToken(TokenId),

    #[error("Unknown asset serial {serial} in {asset}")]
    UnknownAsset { asset: TokenId, serial: u64 },

    #[error("Token {token} is not fungible")]
    NotFungible { token: TokenId },

    #[error("Token {token} is not an asset ledger")]
    NotNonFungible { token: TokenId },

    #[error("Insufficient balance on {token}: required {required}, available {available}")]
    InsufficientBalance {
        token: TokenId,
        required: u128,
        available: u128,
    },

    #[error("Insufficient allowance on {token}: required {required}, available {available}")]
    InsufficientAllowance {
        token: TokenId,
        required: u128,
        available: u128,
    },

    #[error("Account {claimed} does not own serial {serial} of {asset}")]
    NotAssetOwner {
        asset: TokenId,
        serial: u64,
        claimed: AccountId,
    },
}

/// A fungible stablecoin ledger.
///
/// Balances and engine allowances are kept per account. Accounts absent
/// from the maps hold zero.
///
/// # Example
/// ```
/// use clearing_engine_core_rs::token::FungibleToken;
///
/// let mut t0 = FungibleToken::new("T0".to_string());
/// t0.mint("alice", 1_000);
/// t0.approve("alice", 400);
/// assert_eq!(t0.balance_of("alice"), 1_000);
/// assert_eq!(t0.allowance_of("alice"), 400);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FungibleToken {
    id: TokenId,
    balances: BTreeMap<AccountId, u128>,
    /// Allowance granted by each owner to the engine.
    allowances: BTreeMap<AccountId, u128>,
}

impl FungibleToken {
    pub fn new(id: TokenId) -> Self {
        Self {
            id,
            balances: BTreeMap::new(),
            allowances: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn balance_of(&self, owner: &str) -> u128 {
        self.balances.get(owner).copied().unwrap_or(0)
    }

    /// Allowance the owner has granted to the engine.
    pub fn allowance_of(&self, owner: &str) -> u128 {
        self.allowances.get(owner).copied().unwrap_or(0)
    }

    /// Credit freshly issued units to an account. Test and scenario setup.
    pub fn mint(&mut self, owner: &str, amount: u128) {
        *self.balances.entry(owner.to_string()).or_insert(0) += amount;
    }

    /// Set the owner's engine allowance (replace, not add).
    pub fn approve(&mut self, owner: &str, amount: u128) {
        self.allowances.insert(owner.to_string(), amount);
    }

    /// Sum of all balances, custody included. Conservation checks only.
    pub fn total_supply(&self) -> u128 {
        self.balances.values().sum()
    }

    /// Move `amount` from `owner` into engine custody, consuming allowance.
    ///
    /// No state changes on failure.
    ///
    /// # Example
    /// ```
    /// use clearing_engine_core_rs::token::{FungibleToken, ENGINE_ACCOUNT};
    ///
    /// let mut t0 = FungibleToken::new("T0".to_string());
    /// t0.mint("alice", 1_000);
    /// t0.approve("alice", 400);
    ///
    /// t0.transfer_from("alice", 400).unwrap();
    /// assert_eq!(t0.balance_of("alice"), 600);
    /// assert_eq!(t0.balance_of(ENGINE_ACCOUNT), 400);
    ///
    /// // The allowance is spent; further draws fail
    /// assert!(t0.transfer_from("alice", 1).is_err());
    /// ```
    pub fn transfer_from(&mut self, owner: &str, amount: u128) -> Result<(), TokenError> {
        let balance = self.balance_of(owner);
        if balance < amount {
            return Err(TokenError::InsufficientBalance {
                token: self.id.clone(),
                required: amount,
                available: balance,
            });
        }
        let allowance = self.allowance_of(owner);
        if allowance < amount {
            return Err(TokenError::InsufficientAllowance {
                token: self.id.clone(),
                required: amount,
                available: allowance,
            });
        }
        self.balances.insert(owner.to_string(), balance - amount);
        self.allowances.insert(owner.to_string(), allowance - amount);
        *self.balances.entry(ENGINE_ACCOUNT.to_string()).or_insert(0) += amount;
        Ok(())
    }

    /// Move `amount` out of engine custody to `receiver`.
    ///
    /// # Example
    /// ```
    /// use clearing_engine_core_rs::token::{FungibleToken, ENGINE_ACCOUNT};
    ///
    /// let mut t0 = FungibleToken::new("T0".to_string());
    /// t0.mint("alice", 100);
    /// t0.approve("alice", 100);
    /// t0.transfer_from("alice", 100).unwrap();
    ///
    /// t0.transfer("bob", 60).unwrap();
    /// assert_eq!(t0.balance_of("bob"), 60);
    /// assert_eq!(t0.balance_of(ENGINE_ACCOUNT), 40);
    /// ```
    pub fn transfer(&mut self, receiver: &str, amount: u128) -> Result<(), TokenError> {
        let custody = self.balance_of(ENGINE_ACCOUNT);
        if custody < amount {
            return Err(TokenError::InsufficientBalance {
                token: self.id.clone(),
                required: amount,
                available: custody,
            });
        }
        self.balances
            .insert(ENGINE_ACCOUNT.to_string(), custody - amount);
        *self.balances.entry(receiver.to_string()).or_insert(0) += amount;
        Ok(())
    }
}

/// A non-fungible asset ledger: one owner per serial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonFungibleToken {
    id: TokenId,
    owners: BTreeMap<u64, AccountId>,
}

impl NonFungibleToken {
    pub fn new(id: TokenId) -> Self {
        Self {
            id,
            owners: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner_of(&self, serial: u64) -> Option<&str> {
        self.owners.get(&serial).map(|s| s.as_str())
    }

    pub fn mint(&mut self, serial: u64, owner: &str) {
        self.owners.insert(serial, owner.to_string());
    }

    /// Take `serial` into engine custody. `from` must be the current owner.
    ///
    /// # Example
    /// ```
    /// use clearing_engine_core_rs::token::{NonFungibleToken, ENGINE_ACCOUNT};
    ///
    /// let mut bonds = NonFungibleToken::new("BOND".to_string());
    /// bonds.mint(7, "alice");
    ///
    /// bonds.asset_transfer_from(7, "alice").unwrap();
    /// assert_eq!(bonds.owner_of(7), Some(ENGINE_ACCOUNT));
    ///
    /// // Only the current owner can surrender the asset
    /// assert!(bonds.asset_transfer_from(7, "alice").is_err());
    /// ```
    pub fn asset_transfer_from(&mut self, serial: u64, from: &str) -> Result<(), TokenError> {
        match self.owners.get(&serial) {
            None => Err(TokenError::UnknownAsset {
                asset: self.id.clone(),
                serial,
            }),
            Some(owner) if owner != from => Err(TokenError::NotAssetOwner {
                asset: self.id.clone(),
                serial,
                claimed: from.to_string(),
            }),
            Some(_) => {
                self.owners.insert(serial, ENGINE_ACCOUNT.to_string());
                Ok(())
            }
        }
    }

    /// Release `serial` from engine custody to `to`.
    ///
    /// # Example
    /// ```
    /// use clearing_engine_core_rs::token::NonFungibleToken;
    ///
    /// let mut bonds = NonFungibleToken::new("BOND".to_string());
    /// bonds.mint(7, "alice");
    /// bonds.asset_transfer_from(7, "alice").unwrap();
    ///
    /// bonds.asset_transfer(7, "bob").unwrap();
    /// assert_eq!(bonds.owner_of(7), Some("bob"));
    /// ```
    pub fn asset_transfer(&mut self, serial: u64, to: &str) -> Result<(), TokenError> {
        match self.owners.get(&serial) {
            None => Err(TokenError::UnknownAsset {
                asset: self.id.clone(),
                serial,
            }),
            Some(owner) if owner != ENGINE_ACCOUNT => Err(TokenError::NotAssetOwner {
                asset: self.id.clone(),
                serial,
                claimed: ENGINE_ACCOUNT.to_string(),
            }),
            Some(_) => {
                self.owners.insert(serial, to.to_string());
                Ok(())
            }
        }
    }

    /// Serials currently held in engine custody.
    pub fn custody_serials(&self) -> Vec<u64> {
        self.owners
            .iter()
            .filter(|(_, owner)| owner.as_str() == ENGINE_ACCOUNT)
            .map(|(serial, _)| *serial)
            .collect()
    }
}

/// Closed adapter sum. The engine never needs open polymorphism here: a
/// token ledger is either fungible or an asset registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TokenAdapter {
    Fungible(FungibleToken),
    NonFungible(NonFungibleToken),
}

impl TokenAdapter {
    pub fn id(&self) -> &str {
        match self {
            TokenAdapter::Fungible(t) => t.id(),
            TokenAdapter::NonFungible(t) => t.id(),
        }
    }

    pub fn is_fungible(&self) -> bool {
        matches!(self, TokenAdapter::Fungible(_))
    }
}

/// Registry of all token adapters known to the engine, keyed by token id.
///
/// Iteration order is the token id order (BTreeMap), which keeps every
/// ledger scan deterministic.
///
/// # Example
/// ```
/// use clearing_engine_core_rs::token::{FungibleToken, NonFungibleToken, TokenAdapter, TokenHub};
///
/// let mut hub = TokenHub::new();
/// hub.register(TokenAdapter::Fungible(FungibleToken::new("T0".to_string())));
/// hub.register(TokenAdapter::NonFungible(NonFungibleToken::new("BOND".to_string())));
///
/// assert!(hub.is_fungible("T0"));
/// assert!(hub.is_non_fungible("BOND"));
/// assert_eq!(hub.fungible_ids(), vec!["T0".to_string()]);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenHub {
    adapters: BTreeMap<TokenId, TokenAdapter>,
}

impl TokenHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter. Replaces any previous adapter under the same id.
    ///
    /// # Example
    /// ```
    /// use clearing_engine_core_rs::token::{FungibleToken, TokenAdapter, TokenHub};
    ///
    /// let mut hub = TokenHub::new();
    /// hub.register(TokenAdapter::Fungible(FungibleToken::new("T0".to_string())));
    /// assert!(hub.contains("T0"));
    /// assert!(!hub.contains("T1"));
    /// ```
    pub fn register(&mut self, adapter: TokenAdapter) {
        self.adapters.insert(adapter.id().to_string(), adapter);
    }

    pub fn contains(&self, token: &str) -> bool {
        self.adapters.contains_key(token)
    }

    pub fn is_fungible(&self, token: &str) -> bool {
        matches!(self.adapters.get(token), Some(TokenAdapter::Fungible(_)))
    }

    pub fn is_non_fungible(&self, token: &str) -> bool {
        matches!(self.adapters.get(token), Some(TokenAdapter::NonFungible(_)))
    }

    /// All fungible token ids, ascending.
    pub fn fungible_ids(&self) -> Vec<TokenId> {
        self.adapters
            .values()
            .filter(|a| a.is_fungible())
            .map(|a| a.id().to_string())
            .collect()
    }

    pub fn fungible(&self, token: &str) -> Result<&FungibleToken, TokenError> {
        match self.adapters.get(token) {
            Some(TokenAdapter::Fungible(t)) => Ok(t),
            Some(TokenAdapter::NonFungible(_)) => Err(TokenError::NotFungible {
                token: token.to_string(),
            }),
            None => Err(TokenError::UnknownToken(token.to_string())),
        }
    }

    pub fn fungible_mut(&mut self, token: &str) -> Result<&mut FungibleToken, TokenError> {
        match self.adapters.get_mut(token) {
            Some(TokenAdapter::Fungible(t)) => Ok(t),
            Some(TokenAdapter::NonFungible(_)) => Err(TokenError::NotFungible {
                token: token.to_string(),
            }),
            None => Err(TokenError::UnknownToken(token.to_string())),
        }
    }

    pub fn non_fungible(&self, token: &str) -> Result<&NonFungibleToken, TokenError> {
        match self.adapters.get(token) {
            Some(TokenAdapter::NonFungible(t)) => Ok(t),
            Some(TokenAdapter::Fungible(_)) => Err(TokenError::NotNonFungible {
                token: token.to_string(),
            }),
            None => Err(TokenError::UnknownToken(token.to_string())),
        }
    }

    pub fn non_fungible_mut(&mut self, token: &str) -> Result<&mut NonFungibleToken, TokenError> {
        match self.adapters.get_mut(token) {
            Some(TokenAdapter::NonFungible(t)) => Ok(t),
            Some(TokenAdapter::Fungible(_)) => Err(TokenError::NotNonFungible {
                token: token.to_string(),
            }),
            None => Err(TokenError::UnknownToken(token.to_string())),
        }
    }

    /// Balance on one fungible token; errors on unknown or non-fungible ids.
    ///
    /// # Example
    /// ```
    /// use clearing_engine_core_rs::token::{FungibleToken, TokenAdapter, TokenHub};
    ///
    /// let mut t0 = FungibleToken::new("T0".to_string());
    /// t0.mint("alice", 500);
    /// let mut hub = TokenHub::new();
    /// hub.register(TokenAdapter::Fungible(t0));
    ///
    /// assert_eq!(hub.balance_of("T0", "alice").unwrap(), 500);
    /// assert!(hub.balance_of("T9", "alice").is_err());
    /// ```
    pub fn balance_of(&self, token: &str, owner: &str) -> Result<u128, TokenError> {
        Ok(self.fungible(token)?.balance_of(owner))
    }

    pub fn allowance_of(&self, token: &str, owner: &str) -> Result<u128, TokenError> {
        Ok(self.fungible(token)?.allowance_of(owner))
    }

    pub fn transfer_from(&mut self, token: &str, owner: &str, amount: u128) -> Result<(), TokenError> {
        self.fungible_mut(token)?.transfer_from(owner, amount)
    }

    pub fn transfer(&mut self, token: &str, receiver: &str, amount: u128) -> Result<(), TokenError> {
        self.fungible_mut(token)?.transfer(receiver, amount)
    }

    pub fn asset_transfer_from(&mut self, asset: &str, serial: u64, from: &str) -> Result<(), TokenError> {
        self.non_fungible_mut(asset)?.asset_transfer_from(serial, from)
    }

    pub fn asset_transfer(&mut self, asset: &str, serial: u64, to: &str) -> Result<(), TokenError> {
        self.non_fungible_mut(asset)?.asset_transfer(serial, to)
    }

    /// Engine custody balance on one fungible token.
    pub fn custody_balance(&self, token: &str) -> Result<u128, TokenError> {
        Ok(self.fungible(token)?.balance_of(ENGINE_ACCOUNT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_from_requires_allowance() {
        let mut t0 = FungibleToken::new("T0".to_string());
        t0.mint("alice", 1_000);
        t0.approve("alice", 300);

        let err = t0.transfer_from("alice", 500).unwrap_err();
        assert!(matches!(err, TokenError::InsufficientAllowance { .. }));
        assert_eq!(t0.balance_of("alice"), 1_000, "failed debit must not move funds");

        t0.transfer_from("alice", 300).unwrap();
        assert_eq!(t0.balance_of("alice"), 700);
        assert_eq!(t0.balance_of(ENGINE_ACCOUNT), 300);
        assert_eq!(t0.allowance_of("alice"), 0);
    }

    #[test]
    fn test_asset_custody_round_trip() {
        let mut bonds = NonFungibleToken::new("BOND".to_string());
        bonds.mint(7, "alice");

        bonds.asset_transfer_from(7, "alice").unwrap();
        assert_eq!(bonds.owner_of(7), Some(ENGINE_ACCOUNT));
        assert_eq!(bonds.custody_serials(), vec![7]);

        bonds.asset_transfer(7, "bob").unwrap();
        assert_eq!(bonds.owner_of(7), Some("bob"));
    }

    #[test]
    fn test_asset_transfer_from_rejects_non_owner() {
        let mut bonds = NonFungibleToken::new("BOND".to_string());
        bonds.mint(7, "alice");

        let err = bonds.asset_transfer_from(7, "mallory").unwrap_err();
        assert!(matches!(err, TokenError::NotAssetOwner { .. }));
        assert_eq!(bonds.owner_of(7), Some("alice"));
    }

    #[test]
    fn test_hub_kind_mismatch() {
        let mut hub = TokenHub::new();
        hub.register(TokenAdapter::Fungible(FungibleToken::new("T0".to_string())));
        hub.register(TokenAdapter::NonFungible(NonFungibleToken::new(
            "BOND".to_string(),
        )));

        assert!(matches!(
            hub.non_fungible("T0"),
            Err(TokenError::NotNonFungible { .. })
        ));
        assert!(matches!(
            hub.fungible("BOND"),
            Err(TokenError::NotFungible { .. })
        ));
        assert!(matches!(
            hub.fungible("T9"),
            Err(TokenError::UnknownToken(_))
        ));
    }
}
