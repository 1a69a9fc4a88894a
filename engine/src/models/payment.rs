//! Payment request model
//!
//! A directed fungible transfer: the recipient creates the request (open to
//! any sender or pinned to one), a sender fulfills it by committing a token
//! from the recipient's accepted list, and the next settlement cycle nets
//! the transfer.
//!
//! Lifecycle: created → fulfilled → settled → inactive.

use crate::models::UserId;
use crate::token::TokenId;
use serde::{Deserialize, Serialize};

/// A fungible transfer obligation awaiting fulfillment and settlement.
///
/// # Example
/// ```
/// use clearing_engine_core_rs::OrderBook;
///
/// let mut book = OrderBook::new();
/// let id = book.insert_payment("alice".to_string(), None, 500);
///
/// let payment = book.payment(id).unwrap();
/// assert_eq!(payment.recipient(), "alice");
/// assert_eq!(payment.sender(), None); // open to any sender
/// assert!(!payment.is_fulfilled());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    id: u64,
    recipient: UserId,
    /// Pinned sender, or `None` for an open request any sender may fulfill.
    sender: Option<UserId>,
    amount: u128,
    fulfilled_token: Option<TokenId>,
    /// Sender that committed at fulfillment time.
    fulfilled_by: Option<UserId>,
    active: bool,
    settled: bool,
    failed_cycles: u32,
}

impl PaymentRequest {
    pub(crate) fn new(id: u64, recipient: UserId, sender: Option<UserId>, amount: u128) -> Self {
        Self {
            id,
            recipient,
            sender,
            amount,
            fulfilled_token: None,
            fulfilled_by: None,
            active: true,
            settled: false,
            failed_cycles: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn amount(&self) -> u128 {
        self.amount
    }

    pub fn fulfilled_token(&self) -> Option<&str> {
        self.fulfilled_token.as_deref()
    }

    pub fn fulfilled_by(&self) -> Option<&str> {
        self.fulfilled_by.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_fulfilled(&self) -> bool {
        self.fulfilled_token.is_some()
    }

    pub fn is_settled(&self) -> bool {
        self.settled
    }

    pub fn failed_cycles(&self) -> u32 {
        self.failed_cycles
    }

    pub(crate) fn record_fulfillment(&mut self, sender: UserId, token: TokenId) {
        self.fulfilled_by = Some(sender);
        self.fulfilled_token = Some(token);
    }

    pub(crate) fn mark_settled(&mut self) {
        self.settled = true;
        self.active = false;
    }

    pub(crate) fn deactivate(&mut self) {
        self.active = false;
    }

    pub(crate) fn bump_failed_cycles(&mut self) -> u32 {
        self.failed_cycles += 1;
        self.failed_cycles
    }
}
