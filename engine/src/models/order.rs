//! DvP order model
//!
//! One half of a delivery-versus-payment exchange: a unique asset serial
//! against a fungible price. Buy and sell halves are separate orders that
//! reference each other by id once matched; the order book is the sole
//! owner of both.

use crate::models::UserId;
use crate::token::TokenId;
use serde::{Deserialize, Serialize};

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

/// A payment-token/price pair a DvP order trades at.
///
/// # Example
/// ```
/// use clearing_engine_core_rs::Quote;
///
/// let quote = Quote::new("T0", 1_000);
/// assert_eq!(quote.payment_token, "T0");
/// assert_eq!(quote.price, 1_000);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub payment_token: TokenId,
    pub price: u128,
}

impl Quote {
    pub fn new(payment_token: impl Into<TokenId>, price: u128) -> Self {
        Self {
            payment_token: payment_token.into(),
            price,
        }
    }
}

/// One half of a DvP pair.
///
/// A buy order carries exactly one quote; a sell order may list several
/// acceptable quotes. At match time the agreed quote is frozen on both
/// halves.
///
/// # Example
/// ```
/// use clearing_engine_core_rs::{OrderBook, Quote, Side};
///
/// let mut book = OrderBook::new();
/// let id = book.insert_dvp(
///     "alice".to_string(),
///     Side::Sell,
///     "BOND".to_string(),
///     7,
///     vec![Quote::new("T0", 1_000), Quote::new("T1", 900)],
///     "bob".to_string(),
/// );
///
/// let order = book.order(id).unwrap();
/// assert_eq!(order.side(), Side::Sell);
/// assert_eq!(order.quotes().len(), 2);
/// assert_eq!(order.agreed(), None); // frozen at match time
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DvpOrder {
    id: u64,
    maker: UserId,
    side: Side,
    asset_id: TokenId,
    token_serial: u64,
    quotes: Vec<Quote>,
    counterparty: UserId,
    active: bool,
    locked: bool,
    matched_with: Option<u64>,
    agreed: Option<Quote>,
    failed_cycles: u32,
}

impl DvpOrder {
    pub(crate) fn new(
        id: u64,
        maker: UserId,
        side: Side,
        asset_id: TokenId,
        token_serial: u64,
        quotes: Vec<Quote>,
        counterparty: UserId,
    ) -> Self {
        Self {
            id,
            maker,
            side,
            asset_id,
            token_serial,
            quotes,
            counterparty,
            active: true,
            locked: false,
            matched_with: None,
            agreed: None,
            failed_cycles: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn maker(&self) -> &str {
        &self.maker
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn asset_id(&self) -> &str {
        &self.asset_id
    }

    pub fn token_serial(&self) -> u64 {
        self.token_serial
    }

    pub fn quotes(&self) -> &[Quote] {
        &self.quotes
    }

    pub fn counterparty(&self) -> &str {
        &self.counterparty
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn is_matched(&self) -> bool {
        self.matched_with.is_some()
    }

    pub fn matched_with(&self) -> Option<u64> {
        self.matched_with
    }

    /// Quote both halves agreed on, set at match time.
    pub fn agreed(&self) -> Option<&Quote> {
        self.agreed.as_ref()
    }

    pub fn failed_cycles(&self) -> u32 {
        self.failed_cycles
    }

    pub(crate) fn record_match(&mut self, peer: u64, agreed: Quote) {
        self.matched_with = Some(peer);
        self.agreed = Some(agreed);
    }

    pub(crate) fn clear_match(&mut self) {
        self.matched_with = None;
        self.agreed = None;
        self.failed_cycles = 0;
    }

    pub(crate) fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }

    pub(crate) fn deactivate(&mut self) {
        self.active = false;
        self.locked = false;
    }

    pub(crate) fn bump_failed_cycles(&mut self) -> u32 {
        self.failed_cycles += 1;
        self.failed_cycles
    }
}
