//! Swap order model
//!
//! One leg of a payment-versus-payment exchange. A leg names what its maker
//! sends and how much it expects back; the token received is whatever the
//! matched peer sends, constrained at match time to the maker's accepted
//! list. Matched legs reference each other by id.

use crate::models::UserId;
use crate::token::TokenId;
use serde::{Deserialize, Serialize};

/// One swap leg, unmatched until a mirrored peer arrives.
///
/// # Example
/// ```
/// use clearing_engine_core_rs::OrderBook;
///
/// let mut book = OrderBook::new();
/// let id = book.insert_swap("alice".to_string(), 500, "T0".to_string(), 400);
///
/// let leg = book.swap(id).unwrap();
/// assert_eq!(leg.send_amount(), 500);
/// assert_eq!(leg.receive_amount(), 400);
/// assert_eq!(leg.matched_peer(), None);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapOrder {
    id: u64,
    maker: UserId,
    send_amount: u128,
    send_token: TokenId,
    receive_amount: u128,
    active: bool,
    matched_peer: Option<u64>,
    failed_cycles: u32,
}

impl SwapOrder {
    pub(crate) fn new(
        id: u64,
        maker: UserId,
        send_amount: u128,
        send_token: TokenId,
        receive_amount: u128,
    ) -> Self {
        Self {
            id,
            maker,
            send_amount,
            send_token,
            receive_amount,
            active: true,
            matched_peer: None,
            failed_cycles: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn maker(&self) -> &str {
        &self.maker
    }

    pub fn send_amount(&self) -> u128 {
        self.send_amount
    }

    pub fn send_token(&self) -> &str {
        &self.send_token
    }

    pub fn receive_amount(&self) -> u128 {
        self.receive_amount
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_matched(&self) -> bool {
        self.matched_peer.is_some()
    }

    pub fn matched_peer(&self) -> Option<u64> {
        self.matched_peer
    }

    pub fn failed_cycles(&self) -> u32 {
        self.failed_cycles
    }

    pub(crate) fn record_match(&mut self, peer: u64) {
        self.matched_peer = Some(peer);
    }

    /// Revert to unmatched and clear the retry counter; the leg becomes
    /// available for re-matching in a future cycle.
    pub(crate) fn clear_match(&mut self) {
        self.matched_peer = None;
        self.failed_cycles = 0;
    }

    pub(crate) fn deactivate(&mut self) {
        self.active = false;
    }

    pub(crate) fn bump_failed_cycles(&mut self) -> u32 {
        self.failed_cycles += 1;
        self.failed_cycles
    }
}
