//! Participant configuration
//!
//! Each participant carries a ranked list of accepted stablecoins. The
//! first entry is the payout preference; the full list is the fallback
//! order for both disbursement and stake collection.

use crate::token::TokenId;
use serde::{Deserialize, Serialize};

/// Snapshot of one participant's configuration.
///
/// Invariants (enforced by the registry): the list is non-empty, free of
/// duplicates, and every entry resolves to a known fungible token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    accepted_tokens: Vec<TokenId>,
}

impl UserConfig {
    pub(crate) fn new(accepted_tokens: Vec<TokenId>) -> Self {
        Self { accepted_tokens }
    }

    /// Ranked accepted tokens, top preference first.
    pub fn accepted_tokens(&self) -> &[TokenId] {
        &self.accepted_tokens
    }

    /// Top-ranked payout preference.
    pub fn top_preference(&self) -> &str {
        &self.accepted_tokens[0]
    }

    pub fn accepts(&self, token: &str) -> bool {
        self.accepted_tokens.iter().any(|t| t == token)
    }

    pub(crate) fn push_token(&mut self, token: TokenId) {
        self.accepted_tokens.push(token);
    }

    pub(crate) fn remove_token(&mut self, token: &str) {
        self.accepted_tokens.retain(|t| t != token);
    }

    pub(crate) fn replace(&mut self, tokens: Vec<TokenId>) {
        self.accepted_tokens = tokens;
    }
}
