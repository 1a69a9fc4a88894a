//! Obligation calculator
//!
//! Walks the matched items of one cycle attempt and converts them into
//! bookkeeping inputs for the later phases: the participant set with gross
//! outgoing value (Phase 1) and signed per-(user, token) deltas (Phase 3).
//! Pure bookkeeping; nothing here touches a ledger.

use crate::book::OrderBook;
use crate::error::EngineError;
use crate::models::UserId;
use crate::settlement::netting::NetPositions;
use std::collections::{BTreeMap, BTreeSet};

/// Reference to one settleable item of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ItemRef {
    Dvp { buy_id: u64, sell_id: u64 },
    Payment { id: u64 },
    Swap { leg_a: u64, leg_b: u64 },
}

/// The matched items entering one cycle attempt, each list ascending by id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleItems {
    pub dvp_pairs: Vec<(u64, u64)>,
    pub payments: Vec<u64>,
    pub swap_pairs: Vec<(u64, u64)>,
}

impl CycleItems {
    /// Snapshot the book's matched DvP pairs, fulfilled payment requests
    /// and matched swap pairs.
    ///
    /// # Example
    /// ```
    /// use clearing_engine_core_rs::matching::match_dvp_orders;
    /// use clearing_engine_core_rs::settlement::CycleItems;
    /// use clearing_engine_core_rs::{OrderBook, Quote, Side};
    ///
    /// let mut book = OrderBook::new();
    /// assert!(CycleItems::collect(&book).is_empty());
    ///
    /// book.insert_dvp(
    ///     "alice".to_string(),
    ///     Side::Sell,
    ///     "BOND".to_string(),
    ///     7,
    ///     vec![Quote::new("T0", 1_000)],
    ///     "bob".to_string(),
    /// );
    /// book.insert_dvp(
    ///     "bob".to_string(),
    ///     Side::Buy,
    ///     "BOND".to_string(),
    ///     7,
    ///     vec![Quote::new("T0", 1_000)],
    ///     "alice".to_string(),
    /// );
    /// match_dvp_orders(&mut book);
    ///
    /// let items = CycleItems::collect(&book);
    /// assert_eq!(items.dvp_pairs.len(), 1);
    /// assert_eq!(items.len(), 1);
    /// ```
    pub fn collect(book: &OrderBook) -> Self {
        Self {
            dvp_pairs: book.matched_dvp_pairs(),
            payments: book.fulfilled_payment_ids(),
            swap_pairs: book.matched_swap_pairs(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.dvp_pairs.is_empty() && self.payments.is_empty() && self.swap_pairs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.dvp_pairs.len() + self.payments.len() + self.swap_pairs.len()
    }

    pub fn refs(&self) -> Vec<ItemRef> {
        let mut refs = Vec::with_capacity(self.len());
        refs.extend(
            self.dvp_pairs
                .iter()
                .map(|&(buy_id, sell_id)| ItemRef::Dvp { buy_id, sell_id }),
        );
        refs.extend(self.payments.iter().map(|&id| ItemRef::Payment { id }));
        refs.extend(
            self.swap_pairs
                .iter()
                .map(|&(leg_a, leg_b)| ItemRef::Swap { leg_a, leg_b }),
        );
        refs
    }

    /// Split into (kept, dropped) where an item is dropped iff any of its
    /// parties is in `users`.
    pub fn partition_excluding(
        &self,
        users: &BTreeSet<UserId>,
        book: &OrderBook,
    ) -> (CycleItems, Vec<ItemRef>) {
        let mut kept = CycleItems::default();
        let mut dropped = Vec::new();

        for &(buy_id, sell_id) in &self.dvp_pairs {
            let item = ItemRef::Dvp { buy_id, sell_id };
            if item_parties(item, book).iter().any(|u| users.contains(u)) {
                dropped.push(item);
            } else {
                kept.dvp_pairs.push((buy_id, sell_id));
            }
        }
        for &id in &self.payments {
            let item = ItemRef::Payment { id };
            if item_parties(item, book).iter().any(|u| users.contains(u)) {
                dropped.push(item);
            } else {
                kept.payments.push(id);
            }
        }
        for &(leg_a, leg_b) in &self.swap_pairs {
            let item = ItemRef::Swap { leg_a, leg_b };
            if item_parties(item, book).iter().any(|u| users.contains(u)) {
                dropped.push(item);
            } else {
                kept.swap_pairs.push((leg_a, leg_b));
            }
        }

        (kept, dropped)
    }
}

/// The parties an item obligates.
pub fn item_parties(item: ItemRef, book: &OrderBook) -> Vec<UserId> {
    match item {
        ItemRef::Dvp { buy_id, sell_id } => {
            let mut parties = Vec::with_capacity(2);
            if let Some(buy) = book.order(buy_id) {
                parties.push(buy.maker().to_string());
            }
            if let Some(sell) = book.order(sell_id) {
                parties.push(sell.maker().to_string());
            }
            parties
        }
        ItemRef::Payment { id } => {
            let Some(payment) = book.payment(id) else {
                return Vec::new();
            };
            let mut parties = vec![payment.recipient().to_string()];
            if let Some(sender) = payment.fulfilled_by() {
                parties.push(sender.to_string());
            }
            parties
        }
        ItemRef::Swap { leg_a, leg_b } => {
            let mut parties = Vec::with_capacity(2);
            if let Some(a) = book.swap(leg_a) {
                parties.push(a.maker().to_string());
            }
            if let Some(b) = book.swap(leg_b) {
                parties.push(b.maker().to_string());
            }
            parties
        }
    }
}

/// Participant set and cross-token gross outgoing value (Phase 1).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrossOut {
    pub participants: BTreeSet<UserId>,
    pub gross: BTreeMap<UserId, u128>,
}

impl GrossOut {
    fn touch(&mut self, user: &str) {
        self.participants.insert(user.to_string());
    }

    fn add_outgoing(&mut self, user: &str, amount: u128) -> Result<(), EngineError> {
        self.touch(user);
        let slot = self.gross.entry(user.to_string()).or_insert(0);
        *slot = slot.checked_add(amount).ok_or_else(|| {
            EngineError::InternalInvariantViolation(format!("gross_out overflow for {}", user))
        })?;
        Ok(())
    }

    pub fn gross_of(&self, user: &str) -> u128 {
        self.gross.get(user).copied().unwrap_or(0)
    }
}

/// Walk `items` and attribute outgoing value:
/// - DvP: the buyer owes the agreed price
/// - payment: the committed sender owes the amount
/// - swap: each maker owes their own send amount
///
/// # Example
/// ```
/// use clearing_engine_core_rs::matching::match_dvp_orders;
/// use clearing_engine_core_rs::settlement::{collect_gross_out, CycleItems};
/// use clearing_engine_core_rs::{OrderBook, Quote, Side};
///
/// let mut book = OrderBook::new();
/// book.insert_dvp(
///     "alice".to_string(),
///     Side::Sell,
///     "BOND".to_string(),
///     7,
///     vec![Quote::new("T0", 1_000)],
///     "bob".to_string(),
/// );
/// book.insert_dvp(
///     "bob".to_string(),
///     Side::Buy,
///     "BOND".to_string(),
///     7,
///     vec![Quote::new("T0", 1_000)],
///     "alice".to_string(),
/// );
/// match_dvp_orders(&mut book);
///
/// let items = CycleItems::collect(&book);
/// let gross = collect_gross_out(&items, &book).unwrap();
/// assert_eq!(gross.gross_of("bob"), 1_000); // the buyer owes the price
/// assert_eq!(gross.gross_of("alice"), 0);   // the seller only receives
/// assert!(gross.participants.contains("alice"));
/// ```
pub fn collect_gross_out(items: &CycleItems, book: &OrderBook) -> Result<GrossOut, EngineError> {
    let mut out = GrossOut::default();

    for &(buy_id, sell_id) in &items.dvp_pairs {
        let buy = book.order(buy_id).ok_or(EngineError::UnknownId(buy_id))?;
        let sell = book.order(sell_id).ok_or(EngineError::UnknownId(sell_id))?;
        let quote = buy.agreed().ok_or_else(|| {
            EngineError::InternalInvariantViolation(format!("pair {} has no agreed quote", buy_id))
        })?;
        out.add_outgoing(buy.maker(), quote.price)?;
        out.touch(sell.maker());
    }

    for &id in &items.payments {
        let payment = book.payment(id).ok_or(EngineError::UnknownId(id))?;
        let sender = payment.fulfilled_by().ok_or_else(|| {
            EngineError::InternalInvariantViolation(format!("payment {} has no sender", id))
        })?;
        out.add_outgoing(sender, payment.amount())?;
        out.touch(payment.recipient());
    }

    for &(leg_a, leg_b) in &items.swap_pairs {
        let a = book.swap(leg_a).ok_or(EngineError::UnknownId(leg_a))?;
        let b = book.swap(leg_b).ok_or(EngineError::UnknownId(leg_b))?;
        out.add_outgoing(a.maker(), a.send_amount())?;
        out.add_outgoing(b.maker(), b.send_amount())?;
    }

    Ok(out)
}

/// Emit signed per-token deltas for `items`. The caller has already
/// excluded items touching ineligible parties.
///
/// # Example
/// ```
/// use clearing_engine_core_rs::matching::match_dvp_orders;
/// use clearing_engine_core_rs::settlement::{compute_obligations, CycleItems};
/// use clearing_engine_core_rs::{OrderBook, Quote, Side};
///
/// let mut book = OrderBook::new();
/// book.insert_dvp(
///     "alice".to_string(),
///     Side::Sell,
///     "BOND".to_string(),
///     7,
///     vec![Quote::new("T0", 1_000)],
///     "bob".to_string(),
/// );
/// book.insert_dvp(
///     "bob".to_string(),
///     Side::Buy,
///     "BOND".to_string(),
///     7,
///     vec![Quote::new("T0", 1_000)],
///     "alice".to_string(),
/// );
/// match_dvp_orders(&mut book);
///
/// let items = CycleItems::collect(&book);
/// let nets = compute_obligations(&items, &book).unwrap();
/// let agg = nets.aggregate().unwrap();
/// assert_eq!(agg["bob"], -1_000);
/// assert_eq!(agg["alice"], 1_000);
/// nets.assert_conservation().unwrap();
/// ```
pub fn compute_obligations(items: &CycleItems, book: &OrderBook) -> Result<NetPositions, EngineError> {
    let mut nets = NetPositions::new();

    for &(buy_id, sell_id) in &items.dvp_pairs {
        let buy = book.order(buy_id).ok_or(EngineError::UnknownId(buy_id))?;
        let sell = book.order(sell_id).ok_or(EngineError::UnknownId(sell_id))?;
        let quote = buy.agreed().ok_or_else(|| {
            EngineError::InternalInvariantViolation(format!("pair {} has no agreed quote", buy_id))
        })?;
        let price = quote.price as i128;
        nets.add(buy.maker(), &quote.payment_token, -price)?;
        nets.add(sell.maker(), &quote.payment_token, price)?;
    }

    for &id in &items.payments {
        let payment = book.payment(id).ok_or(EngineError::UnknownId(id))?;
        let sender = payment.fulfilled_by().ok_or_else(|| {
            EngineError::InternalInvariantViolation(format!("payment {} has no sender", id))
        })?;
        let token = payment.fulfilled_token().ok_or_else(|| {
            EngineError::InternalInvariantViolation(format!("payment {} has no token", id))
        })?;
        let amount = payment.amount() as i128;
        let (sender, token) = (sender.to_string(), token.to_string());
        nets.add(&sender, &token, -amount)?;
        nets.add(payment.recipient(), &token, amount)?;
    }

    for &(leg_a, leg_b) in &items.swap_pairs {
        let a = book.swap(leg_a).ok_or(EngineError::UnknownId(leg_a))?;
        let b = book.swap(leg_b).ok_or(EngineError::UnknownId(leg_b))?;
        let a_amount = a.send_amount() as i128;
        let b_amount = b.send_amount() as i128;
        nets.add(a.maker(), a.send_token(), -a_amount)?;
        nets.add(b.maker(), a.send_token(), a_amount)?;
        nets.add(b.maker(), b.send_token(), -b_amount)?;
        nets.add(a.maker(), b.send_token(), b_amount)?;
    }

    Ok(nets)
}
