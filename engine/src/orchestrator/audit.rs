//! Ledger audit - conservation and drain checks
//!
//! A settlement cycle must neither create nor destroy fungible value, and
//! the engine custody account must be empty whenever the engine is idle.
//! `LedgerAudit` captures per-token supply at cycle start and verifies
//! both properties at cycle end, whichever way the cycle ended.
//!
//! Canonical sha2 digests (sorted-key JSON) of the configuration and of
//! the ledger state are exposed for external observers.

use crate::error::EngineError;
use crate::token::{TokenHub, TokenId};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Per-token supply captured at cycle start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerAudit {
    supplies: BTreeMap<TokenId, u128>,
}

impl LedgerAudit {
    /// Record the total supply of every fungible token, custody included.
    pub fn capture(hub: &TokenHub) -> Self {
        let mut supplies = BTreeMap::new();
        for token in hub.fungible_ids() {
            if let Ok(ledger) = hub.fungible(&token) {
                supplies.insert(token, ledger.total_supply());
            }
        }
        Self { supplies }
    }

    /// Verify supply conservation and an empty custody account.
    ///
    /// Returns `InternalInvariantViolation` naming the first offending
    /// token; the engine halts the cycle on that.
    pub fn verify_drained(&self, hub: &TokenHub) -> Result<(), EngineError> {
        for (token, expected) in &self.supplies {
            let ledger = hub.fungible(token)?;
            let supply = ledger.total_supply();
            if supply != *expected {
                return Err(EngineError::InternalInvariantViolation(format!(
                    "supply of {} changed across cycle: {} -> {}",
                    token, expected, supply
                )));
            }
            let custody = hub.custody_balance(token)?;
            if custody != 0 {
                return Err(EngineError::InternalInvariantViolation(format!(
                    "custody pool holds {} of {} after cycle end",
                    custody, token
                )));
            }
        }
        Ok(())
    }
}

/// Deterministic sha256 over the canonical (sorted-key) JSON encoding.
///
/// Used for both the configuration digest and the ledger digest so a
/// digest computed anywhere compares bytewise.
pub fn canonical_digest<T: Serialize>(value: &T) -> Result<String, EngineError> {
    use serde_json::Value;

    let value = serde_json::to_value(value)
        .map_err(|e| EngineError::Serialization(format!("digest serialization failed: {}", e)))?;

    fn canonicalize(value: Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: BTreeMap<String, Value> =
                    map.into_iter().map(|(k, v)| (k, canonicalize(v))).collect();
                Value::Object(sorted.into_iter().collect())
            }
            Value::Array(arr) => Value::Array(arr.into_iter().map(canonicalize).collect()),
            other => other,
        }
    }

    let json = serde_json::to_string(&canonicalize(value))
        .map_err(|e| EngineError::Serialization(format!("digest serialization failed: {}", e)))?;

    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}
