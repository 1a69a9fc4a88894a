//! Engine error taxonomy
//!
//! Per-submission errors fail the caller immediately with no state change.
//! `StakeShortfall` is handled inside the cycle (the user is marked
//! ineligible) and never escapes the public API. `SettlementDefault` and
//! `InternalInvariantViolation` are returned from `perform_settlement`
//! after the cycle has been rolled back and the failure event emitted.

use crate::token::TokenError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Token {token} is not in {user}'s accepted list")]
    TokenNotAccepted { user: String, token: String },

    #[error("Unknown id: {0}")]
    UnknownId(u64),

    #[error("Caller {caller} does not own item {id}")]
    NotOwner { id: u64, caller: String },

    #[error("Item {0} is already matched")]
    AlreadyMatched(u64),

    #[error("Item {0} is already settled")]
    AlreadySettled(u64),

    #[error("Item {0} is inactive")]
    Inactive(u64),

    #[error("Cycle interval not elapsed: now {now}, ready at {ready_at}")]
    TooSoon { now: u64, ready_at: u64 },

    #[error("A settlement cycle is in progress")]
    Busy,

    #[error("Invalid amount: {0}")]
    InvalidAmount(u128),

    #[error("Stake shortfall for {user}: missing {missing}")]
    StakeShortfall { user: String, missing: u128 },

    #[error("Settlement default by: {}", .defaulters.join(", "))]
    SettlementDefault { defaulters: Vec<String> },

    #[error("Internal invariant violation: {0}")]
    InternalInvariantViolation(String),

    #[error("Token adapter error: {0}")]
    Token(#[from] TokenError),

    #[error("Serialization failed: {0}")]
    Serialization(String),
}
