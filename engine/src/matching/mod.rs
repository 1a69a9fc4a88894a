//! Matcher
//!
//! Pairs DvP buy/sell halves and symmetric swap legs. Matching only
//! updates bookkeeping (peer cross-references and the agreed quote); it
//! never touches balances. Both entry points are idempotent: already
//! matched items are skipped, so a second pass over an unchanged book is
//! a no-op.
//!
//! Determinism: scans ascend by id. A sell pairs with the lowest
//! compatible buy id; a swap leg pairs with the lowest compatible peer id.

use crate::book::OrderBook;
use crate::models::Quote;
use crate::registry::UserRegistry;

/// A DvP pair produced by one matching pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DvpMatch {
    pub buy_id: u64,
    pub sell_id: u64,
    pub quote: Quote,
}

/// A swap pair produced by one matching pass, lower id first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapMatch {
    pub leg_a: u64,
    pub leg_b: u64,
}

/// Pair active unmatched DvP halves.
///
/// Two halves match when asset, serial and counterparties agree
/// bidirectionally and the buy's quote appears in the sell's quote list.
/// The agreed quote is frozen on both orders.
///
/// # Example
/// ```
/// use clearing_engine_core_rs::matching::match_dvp_orders;
/// use clearing_engine_core_rs::{OrderBook, Quote, Side};
///
/// let mut book = OrderBook::new();
/// let sell = book.insert_dvp(
///     "alice".to_string(),
///     Side::Sell,
///     "BOND".to_string(),
///     7,
///     vec![Quote::new("T0", 1_000)],
///     "bob".to_string(),
/// );
/// let buy = book.insert_dvp(
///     "bob".to_string(),
///     Side::Buy,
///     "BOND".to_string(),
///     7,
///     vec![Quote::new("T0", 1_000)],
///     "alice".to_string(),
/// );
///
/// let matches = match_dvp_orders(&mut book);
/// assert_eq!(matches.len(), 1);
/// assert_eq!(book.order(buy).unwrap().matched_with(), Some(sell));
/// assert_eq!(book.order(sell).unwrap().matched_with(), Some(buy));
///
/// // A second pass over the unchanged book is a no-op
/// assert!(match_dvp_orders(&mut book).is_empty());
/// ```
pub fn match_dvp_orders(book: &mut OrderBook) -> Vec<DvpMatch> {
    let mut matches = Vec::new();

    for sell_id in book.open_sell_ids() {
        let (seller, buyer, asset_id, token_serial, sell_quotes) = {
            let sell = book.order(sell_id).expect("open sell id is present");
            if sell.is_matched() || !sell.is_active() {
                continue;
            }
            (
                sell.maker().to_string(),
                sell.counterparty().to_string(),
                sell.asset_id().to_string(),
                sell.token_serial(),
                sell.quotes().to_vec(),
            )
        };

        for buy_id in book.open_buy_ids(&buyer, &seller) {
            let agreed = {
                let buy = book.order(buy_id).expect("open buy id is present");
                if buy.asset_id() != asset_id || buy.token_serial() != token_serial {
                    continue;
                }
                let Some(quote) = buy.quotes().first() else {
                    continue;
                };
                if !sell_quotes.contains(quote) {
                    continue;
                }
                quote.clone()
            };

            book.order_mut(buy_id)
                .unwrap()
                .record_match(sell_id, agreed.clone());
            book.order_mut(sell_id)
                .unwrap()
                .record_match(buy_id, agreed.clone());
            matches.push(DvpMatch {
                buy_id,
                sell_id,
                quote: agreed,
            });
            break;
        }
    }

    matches
}

/// Pair active unmatched swap legs.
///
/// Legs A and B match when amounts mirror each other
/// (`A.send_amount == B.receive_amount` and vice versa) and each side's
/// send token is in the other's accepted list.
///
/// # Example
/// ```
/// use clearing_engine_core_rs::matching::match_swap_orders;
/// use clearing_engine_core_rs::{FungibleToken, OrderBook, TokenAdapter, TokenHub, UserRegistry};
///
/// let mut hub = TokenHub::new();
/// for token in ["T0", "T1"] {
///     hub.register(TokenAdapter::Fungible(FungibleToken::new(token.to_string())));
/// }
/// let mut registry = UserRegistry::new();
/// let both = vec!["T0".to_string(), "T1".to_string()];
/// registry.configure("alice", both.clone(), &hub).unwrap();
/// registry.configure("bob", both, &hub).unwrap();
///
/// let mut book = OrderBook::new();
/// let leg_a = book.insert_swap("alice".to_string(), 500, "T0".to_string(), 500);
/// let leg_b = book.insert_swap("bob".to_string(), 500, "T1".to_string(), 500);
///
/// let matches = match_swap_orders(&mut book, &registry);
/// assert_eq!(matches.len(), 1);
/// assert_eq!(book.swap(leg_a).unwrap().matched_peer(), Some(leg_b));
/// assert_eq!(book.swap(leg_b).unwrap().matched_peer(), Some(leg_a));
/// ```
pub fn match_swap_orders(book: &mut OrderBook, registry: &UserRegistry) -> Vec<SwapMatch> {
    let mut matches = Vec::new();
    let ids = book.open_swap_ids();

    for (i, &a_id) in ids.iter().enumerate() {
        if book.swap(a_id).map(|s| s.is_matched()).unwrap_or(true) {
            continue;
        }
        let (a_maker, a_send_amount, a_send_token, a_receive_amount) = {
            let a = book.swap(a_id).unwrap();
            (
                a.maker().to_string(),
                a.send_amount(),
                a.send_token().to_string(),
                a.receive_amount(),
            )
        };

        for &b_id in &ids[i + 1..] {
            let compatible = {
                let Some(b) = book.swap(b_id) else { continue };
                !b.is_matched()
                    && b.maker() != a_maker
                    && a_send_amount == b.receive_amount()
                    && b.send_amount() == a_receive_amount
                    && registry.accepts(b.maker(), &a_send_token)
                    && registry.accepts(&a_maker, b.send_token())
            };
            if compatible {
                book.swap_mut(a_id).unwrap().record_match(b_id);
                book.swap_mut(b_id).unwrap().record_match(a_id);
                matches.push(SwapMatch {
                    leg_a: a_id,
                    leg_b: b_id,
                });
                break;
            }
        }
    }

    matches
}
