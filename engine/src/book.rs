//! Order book
//!
//! Sole owner of every DvP order, payment request, and swap leg. Matched
//! partners store peer ids only; nothing in the book holds a reference
//! into the book. Ids are issued from a single monotonic counter shared by
//! all three item kinds, so an id names one item engine-wide.
//!
//! # Critical Invariants
//!
//! 1. **Match symmetry**: a matched item's peer references it back
//! 2. **Inactive items are never reconsidered** by matching or settlement
//! 3. **Deterministic iteration**: all scans ascend by id (BTreeMap order)

use crate::error::EngineError;
use crate::models::{DvpOrder, PaymentRequest, Quote, Side, SwapOrder, UserId};
use crate::token::TokenId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Peer order id unmatched as a side effect of a cancellation.
pub(crate) type UnmatchedPeer = Option<u64>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBook {
    next_id: u64,
    dvp_orders: BTreeMap<u64, DvpOrder>,
    payments: BTreeMap<u64, PaymentRequest>,
    swaps: BTreeMap<u64, SwapOrder>,
    /// DvP buy orders bucketed by (maker, counterparty) to accelerate
    /// matching. May hold ids of inactive orders; readers filter.
    buy_index: BTreeMap<(UserId, UserId), Vec<u64>>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Self::default()
        }
    }

    fn issue_id(&mut self) -> u64 {
        let id = self.next_id.max(1);
        self.next_id = id + 1;
        id
    }

    // ========================================================================
    // Submissions
    // ========================================================================
    //
    // The book records what it is given; domain validation (amounts,
    // configuration, known tokens) happens at the engine surface.

    /// Store one DvP half and issue its id.
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
    ///     vec![Quote::new("T0", 1_000)],
    ///     "bob".to_string(),
    /// );
    /// assert!(book.order(id).unwrap().is_active());
    /// ```
    pub fn insert_dvp(
        &mut self,
        maker: UserId,
        side: Side,
        asset_id: TokenId,
        token_serial: u64,
        quotes: Vec<Quote>,
        counterparty: UserId,
    ) -> u64 {
        let id = self.issue_id();
        if side == Side::Buy {
            self.buy_index
                .entry((maker.clone(), counterparty.clone()))
                .or_default()
                .push(id);
        }
        let order = DvpOrder::new(id, maker, side, asset_id, token_serial, quotes, counterparty);
        self.dvp_orders.insert(id, order);
        id
    }

    /// Store one payment request and issue its id.
    ///
    /// # Example
    /// ```
    /// use clearing_engine_core_rs::OrderBook;
    ///
    /// let mut book = OrderBook::new();
    /// let id = book.insert_payment("alice".to_string(), None, 500);
    /// assert_eq!(book.payment(id).unwrap().amount(), 500);
    /// assert!(!book.payment(id).unwrap().is_fulfilled());
    /// ```
    pub fn insert_payment(
        &mut self,
        recipient: UserId,
        sender: Option<UserId>,
        amount: u128,
    ) -> u64 {
        let id = self.issue_id();
        self.payments
            .insert(id, PaymentRequest::new(id, recipient, sender, amount));
        id
    }

    /// Store one swap leg and issue its id.
    ///
    /// # Example
    /// ```
    /// use clearing_engine_core_rs::OrderBook;
    ///
    /// let mut book = OrderBook::new();
    /// let id = book.insert_swap("alice".to_string(), 500, "T0".to_string(), 500);
    /// assert!(book.swap(id).unwrap().is_active());
    /// assert!(!book.swap(id).unwrap().is_matched());
    /// ```
    pub fn insert_swap(
        &mut self,
        maker: UserId,
        send_amount: u128,
        send_token: TokenId,
        receive_amount: u128,
    ) -> u64 {
        let id = self.issue_id();
        self.swaps.insert(
            id,
            SwapOrder::new(id, maker, send_amount, send_token, receive_amount),
        );
        id
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn order(&self, id: u64) -> Option<&DvpOrder> {
        self.dvp_orders.get(&id)
    }

    pub(crate) fn order_mut(&mut self, id: u64) -> Option<&mut DvpOrder> {
        self.dvp_orders.get_mut(&id)
    }

    pub fn payment(&self, id: u64) -> Option<&PaymentRequest> {
        self.payments.get(&id)
    }

    pub(crate) fn payment_mut(&mut self, id: u64) -> Option<&mut PaymentRequest> {
        self.payments.get_mut(&id)
    }

    pub fn swap(&self, id: u64) -> Option<&SwapOrder> {
        self.swaps.get(&id)
    }

    pub(crate) fn swap_mut(&mut self, id: u64) -> Option<&mut SwapOrder> {
        self.swaps.get_mut(&id)
    }

    pub fn num_orders(&self) -> usize {
        self.dvp_orders.len()
    }

    /// Ids of active unmatched sell orders, ascending.
    pub(crate) fn open_sell_ids(&self) -> Vec<u64> {
        self.dvp_orders
            .values()
            .filter(|o| o.side() == Side::Sell && o.is_active() && !o.is_matched())
            .map(|o| o.id())
            .collect()
    }

    /// Ids of active unmatched buy orders from `buyer` targeting `seller`,
    /// ascending.
    pub(crate) fn open_buy_ids(&self, buyer: &str, seller: &str) -> Vec<u64> {
        let Some(bucket) = self
            .buy_index
            .get(&(buyer.to_string(), seller.to_string()))
        else {
            return Vec::new();
        };
        let mut ids: Vec<u64> = bucket
            .iter()
            .copied()
            .filter(|id| {
                self.dvp_orders
                    .get(id)
                    .map(|o| o.is_active() && !o.is_matched())
                    .unwrap_or(false)
            })
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Ids of active unmatched swap legs, ascending.
    pub(crate) fn open_swap_ids(&self) -> Vec<u64> {
        self.swaps
            .values()
            .filter(|s| s.is_active() && !s.is_matched())
            .map(|s| s.id())
            .collect()
    }

    /// Matched DvP pairs as (buy id, sell id), ascending by buy id.
    pub fn matched_dvp_pairs(&self) -> Vec<(u64, u64)> {
        self.dvp_orders
            .values()
            .filter(|o| o.side() == Side::Buy && o.is_active() && o.is_matched())
            .filter_map(|buy| {
                let sell_id = buy.matched_with()?;
                let sell = self.dvp_orders.get(&sell_id)?;
                sell.is_active().then_some((buy.id(), sell_id))
            })
            .collect()
    }

    /// Fulfilled, unsettled payment request ids, ascending.
    pub fn fulfilled_payment_ids(&self) -> Vec<u64> {
        self.payments
            .values()
            .filter(|p| p.is_active() && p.is_fulfilled() && !p.is_settled())
            .map(|p| p.id())
            .collect()
    }

    /// Matched swap pairs as (lower id, higher id), ascending.
    pub fn matched_swap_pairs(&self) -> Vec<(u64, u64)> {
        self.swaps
            .values()
            .filter(|s| s.is_active() && s.is_matched())
            .filter_map(|a| {
                let b_id = a.matched_peer()?;
                if a.id() >= b_id {
                    return None;
                }
                let b = self.swaps.get(&b_id)?;
                b.is_active().then_some((a.id(), b_id))
            })
            .collect()
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    /// Cancel a DvP order on behalf of `caller`.
    ///
    /// The maker may cancel while the order is active and unsettled.
    /// Cancelling a matched order reactivates the peer as unmatched;
    /// the unmatched peer id is returned for event emission.
    pub(crate) fn cancel_order(&mut self, caller: &str, id: u64) -> Result<UnmatchedPeer, EngineError> {
        let order = self.dvp_orders.get(&id).ok_or(EngineError::UnknownId(id))?;
        if !order.is_active() {
            return Err(EngineError::Inactive(id));
        }
        if order.maker() != caller {
            return Err(EngineError::NotOwner {
                id,
                caller: caller.to_string(),
            });
        }
        let peer = order.matched_with();
        self.dvp_orders.get_mut(&id).unwrap().deactivate();
        if let Some(peer_id) = peer {
            if let Some(peer_order) = self.dvp_orders.get_mut(&peer_id) {
                peer_order.clear_match();
            }
        }
        Ok(peer)
    }

    /// Cancel a payment request on behalf of `caller`.
    ///
    /// The recipient may cancel while unfulfilled; the committed sender
    /// may cancel while fulfilled but unsettled.
    pub(crate) fn cancel_payment(&mut self, caller: &str, id: u64) -> Result<(), EngineError> {
        let payment = self.payments.get(&id).ok_or(EngineError::UnknownId(id))?;
        if payment.is_settled() {
            return Err(EngineError::AlreadySettled(id));
        }
        if !payment.is_active() {
            return Err(EngineError::Inactive(id));
        }
        let allowed = if payment.is_fulfilled() {
            payment.fulfilled_by() == Some(caller)
        } else {
            payment.recipient() == caller
        };
        if !allowed {
            return Err(EngineError::NotOwner {
                id,
                caller: caller.to_string(),
            });
        }
        self.payments.get_mut(&id).unwrap().deactivate();
        Ok(())
    }

    /// Cancel a swap leg on behalf of `caller`; a matched peer reverts to
    /// unmatched and stays in the book.
    pub(crate) fn cancel_swap(&mut self, caller: &str, id: u64) -> Result<UnmatchedPeer, EngineError> {
        let swap = self.swaps.get(&id).ok_or(EngineError::UnknownId(id))?;
        if !swap.is_active() {
            return Err(EngineError::Inactive(id));
        }
        if swap.maker() != caller {
            return Err(EngineError::NotOwner {
                id,
                caller: caller.to_string(),
            });
        }
        let peer = swap.matched_peer();
        self.swaps.get_mut(&id).unwrap().deactivate();
        if let Some(peer_id) = peer {
            if let Some(peer_swap) = self.swaps.get_mut(&peer_id) {
                peer_swap.clear_match();
            }
        }
        Ok(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_across_item_kinds() {
        let mut book = OrderBook::new();
        let a = book.insert_payment("alice".to_string(), None, 100);
        let b = book.insert_swap("bob".to_string(), 100, "T0".to_string(), 100);
        let c = book.insert_dvp(
            "carol".to_string(),
            Side::Buy,
            "BOND".to_string(),
            1,
            vec![Quote::new("T0", 500)],
            "dave".to_string(),
        );
        assert!(a < b && b < c);
    }

    #[test]
    fn test_cancel_matched_order_unmatches_peer() {
        let mut book = OrderBook::new();
        let buy = book.insert_dvp(
            "bob".to_string(),
            Side::Buy,
            "BOND".to_string(),
            7,
            vec![Quote::new("T0", 1_000)],
            "alice".to_string(),
        );
        let sell = book.insert_dvp(
            "alice".to_string(),
            Side::Sell,
            "BOND".to_string(),
            7,
            vec![Quote::new("T0", 1_000)],
            "bob".to_string(),
        );
        book.order_mut(buy)
            .unwrap()
            .record_match(sell, Quote::new("T0", 1_000));
        book.order_mut(sell)
            .unwrap()
            .record_match(buy, Quote::new("T0", 1_000));

        let peer = book.cancel_order("bob", buy).unwrap();
        assert_eq!(peer, Some(sell));
        assert!(!book.order(buy).unwrap().is_active());
        let sell_order = book.order(sell).unwrap();
        assert!(sell_order.is_active() && !sell_order.is_matched());
    }

    #[test]
    fn test_cancel_rejects_non_owner() {
        let mut book = OrderBook::new();
        let id = book.insert_payment("alice".to_string(), None, 100);
        let err = book.cancel_payment("mallory", id).unwrap_err();
        assert!(matches!(err, EngineError::NotOwner { .. }));
        assert!(book.payment(id).unwrap().is_active());
    }

    #[test]
    fn test_fulfilled_sender_may_cancel_unfulfilled_recipient_may_not() {
        let mut book = OrderBook::new();
        let id = book.insert_payment("alice".to_string(), None, 100);
        book.payment_mut(id)
            .unwrap()
            .record_fulfillment("bob".to_string(), "T0".to_string());

        assert!(matches!(
            book.cancel_payment("alice", id),
            Err(EngineError::NotOwner { .. })
        ));
        book.cancel_payment("bob", id).unwrap();
        assert!(!book.payment(id).unwrap().is_active());
    }
}
