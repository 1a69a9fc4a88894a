//! Clearing engine - cycle state machine
//!
//! The engine is a single-writer, serialized state machine. A settlement
//! cycle runs from `Idle` back to `Idle` inside one call to
//! `perform_settlement`; every externally observable debit is matched by a
//! symmetric credit or a refund by the time the call returns. Mutating
//! entry points are rejected with `Busy` while a cycle is in progress.
//!
//! # Cycle phases
//!
//! ```text
//! Idle → CollectParticipants → CollectStake → ComputeObligations
//!      → Aggregate → LockNet → LockAssets → Disburse → RefundStake
//!      → Finalize → Idle
//! ```
//!
//! A pay-in default seizes the defaulters' stake, unwinds the attempt and
//! restarts the cycle once without their items; a second default ends the
//! cycle in `Rollback`. Seized stake is redistributed to the surviving
//! participants pro rata to their gross outgoing, whichever way the cycle
//! ends.

use crate::book::OrderBook;
use crate::core::SettlementClock;
use crate::error::EngineError;
use crate::matching;
use crate::models::{
    DvpOrder, Event, EventLog, PaymentRequest, Quote, Side, SwapOrder, UserConfig, UserId,
    MAX_AMOUNT,
};
use crate::orchestrator::audit::{canonical_digest, LedgerAudit};
use crate::registry::UserRegistry;
use crate::settlement::{
    collect_gross_out, compute_obligations, item_parties, pro_rata_shares, stake_quota,
    CycleItems, ItemRef, StakeLedger,
};
use crate::token::{TokenHub, TokenId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

// ============================================================================
// Configuration
// ============================================================================

/// Engine configuration, read once at initialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Minimum seconds between completed settlement cycles.
    pub cycle_interval_secs: u64,

    /// Stake quota as basis points of gross outgoing (2000 = 20%).
    pub stake_rate_bps: u32,

    /// Cycles an item may fail before it is cancelled or unmatched.
    pub max_failed_cycles: u32,

    /// Minor units per whole token for all fungible amounts.
    pub amount_scale: u128,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: 300,
            stake_rate_bps: 2_000,
            max_failed_cycles: 2,
            amount_scale: 1_000_000_000_000_000_000,
        }
    }
}

impl EngineConfig {
    /// Validate configuration constants.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.cycle_interval_secs == 0 {
            return Err(EngineError::InvalidConfig(
                "cycle_interval_secs must be > 0".to_string(),
            ));
        }
        if self.stake_rate_bps > 10_000 {
            return Err(EngineError::InvalidConfig(
                "stake_rate_bps must be <= 10000".to_string(),
            ));
        }
        if self.max_failed_cycles == 0 {
            return Err(EngineError::InvalidConfig(
                "max_failed_cycles must be >= 1".to_string(),
            ));
        }
        if self.amount_scale == 0 {
            return Err(EngineError::InvalidConfig(
                "amount_scale must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Cycle state machine phase, observable through the view API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CyclePhase {
    Idle,
    CollectParticipants,
    CollectStake,
    ComputeObligations,
    Aggregate,
    LockNet,
    LockAssets,
    Disburse,
    RefundStake,
    Finalize,
    Rollback,
}

/// Summary of one completed settlement cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: u64,
    /// Correlation id, unique across engine restarts.
    pub run_id: Uuid,
    pub timestamp: u64,
    pub participants: usize,
    pub settled_dvp_pairs: usize,
    pub settled_payments: usize,
    pub settled_swaps: usize,
    /// Users that defaulted in this cycle (their items were carried over).
    pub defaulters: Vec<UserId>,
    pub restarted: bool,
    pub total_disbursed: u128,
}

// ============================================================================
// Internal cycle bookkeeping
// ============================================================================

/// An asset taken into custody during LockAssets.
#[derive(Debug, Clone)]
struct LockedAsset {
    buy_id: u64,
    sell_id: u64,
    buyer: UserId,
    seller: UserId,
    asset: TokenId,
    serial: u64,
}

/// Custody bookkeeping for one cycle attempt. Everything here mirrors
/// value physically sitting in the engine custody account and must drain
/// to zero before the attempt ends.
#[derive(Debug, Default)]
struct AttemptLedgers {
    stake: StakeLedger,
    /// Stake value applied toward pay-in, per user and token. Counted in
    /// the pool, but kept apart from fresh debits: a defaulter's applied
    /// stake is seized with the rest of their stake, not refunded.
    applied_stake: BTreeMap<UserId, BTreeMap<TokenId, u128>>,
    /// Tokens freshly debited at pay-in, per user, for exact-token
    /// refunds on unwind.
    pay_in: BTreeMap<UserId, BTreeMap<TokenId, u128>>,
    /// Pay-in pool available for disbursement, by token.
    pool: BTreeMap<TokenId, u128>,
    locked: Vec<LockedAsset>,
}

/// How one cycle attempt ended.
enum AttemptEnd {
    Finalized {
        participants: usize,
        settled_dvp_pairs: usize,
        settled_payments: usize,
        settled_swaps: usize,
        total_disbursed: u128,
    },
    /// Attempt unwound; defaulters' stake was seized and is still held in
    /// custody, keyed by defaulter for provenance.
    Defaulted {
        defaulters: BTreeSet<UserId>,
        seized: BTreeMap<UserId, BTreeMap<TokenId, u128>>,
        /// Gross outgoing of the surviving eligible participants.
        weights: BTreeMap<UserId, u128>,
    },
    /// Attempt unwound after an unrecoverable failure.
    Failed { error: EngineError },
}

// ============================================================================
// Engine
// ============================================================================

/// The clearing and settlement engine handle.
///
/// Owns the order book, user registry, token adapters, event log and the
/// settlement clock. All mutating entry points go through this handle;
/// there is no ambient global state.
pub struct ClearingEngine {
    config: EngineConfig,
    tokens: TokenHub,
    registry: UserRegistry,
    book: OrderBook,
    clock: SettlementClock,
    event_log: EventLog,
    cycle_seq: u64,
    in_cycle: bool,
    phase: CyclePhase,
}

impl ClearingEngine {
    /// Create an engine over the given token adapters.
    ///
    /// # Example
    /// ```
    /// use clearing_engine_core_rs::{ClearingEngine, EngineConfig, FungibleToken, TokenAdapter, TokenHub};
    ///
    /// let mut hub = TokenHub::new();
    /// hub.register(TokenAdapter::Fungible(FungibleToken::new("T0".to_string())));
    ///
    /// let engine = ClearingEngine::new(EngineConfig::default(), hub).unwrap();
    /// assert_eq!(engine.cycle_interval(), 300);
    /// assert_eq!(engine.stake_rate_bps(), 2_000);
    /// assert_eq!(engine.last_settlement_time(), None);
    /// ```
    pub fn new(config: EngineConfig, tokens: TokenHub) -> Result<Self, EngineError> {
        config.validate()?;
        let clock = SettlementClock::new(config.cycle_interval_secs);
        Ok(Self {
            config,
            tokens,
            registry: UserRegistry::new(),
            book: OrderBook::new(),
            clock,
            event_log: EventLog::new(),
            cycle_seq: 0,
            in_cycle: false,
            phase: CyclePhase::Idle,
        })
    }

    fn ensure_idle(&self) -> Result<(), EngineError> {
        if self.in_cycle {
            return Err(EngineError::Busy);
        }
        Ok(())
    }

    fn validate_amount(&self, amount: u128) -> Result<(), EngineError> {
        if amount == 0 || amount > MAX_AMOUNT {
            return Err(EngineError::InvalidAmount(amount));
        }
        Ok(())
    }

    fn ensure_configured(&self, user: &str) -> Result<(), EngineError> {
        if !self.registry.is_configured(user) {
            return Err(EngineError::InvalidConfig(format!(
                "user {} is not configured",
                user
            )));
        }
        Ok(())
    }

    // ========================================================================
    // Submission API
    // ========================================================================

    /// Replace `user`'s ranked accepted-stablecoin list.
    pub fn configure_user(&mut self, user: &str, tokens: Vec<TokenId>) -> Result<(), EngineError> {
        self.ensure_idle()?;
        self.registry.configure(user, tokens.clone(), &self.tokens)?;
        self.event_log.log(Event::UserConfigured {
            user: user.to_string(),
            accepted_tokens: tokens,
        });
        Ok(())
    }

    /// Append one token at the lowest preference rank.
    pub fn add_accepted_token(&mut self, user: &str, token: TokenId) -> Result<(), EngineError> {
        self.ensure_idle()?;
        self.registry.add_token(user, token, &self.tokens)?;
        self.log_user_configured(user);
        Ok(())
    }

    /// Drop one token; the list must stay non-empty.
    pub fn remove_accepted_token(&mut self, user: &str, token: &str) -> Result<(), EngineError> {
        self.ensure_idle()?;
        self.registry.remove_token(user, token)?;
        self.log_user_configured(user);
        Ok(())
    }

    /// Re-rank the accepted list.
    pub fn set_token_rank(&mut self, user: &str, tokens: Vec<TokenId>) -> Result<(), EngineError> {
        self.ensure_idle()?;
        self.registry.set_rank(user, tokens, &self.tokens)?;
        self.log_user_configured(user);
        Ok(())
    }

    fn log_user_configured(&mut self, user: &str) {
        let accepted = self
            .registry
            .get(user)
            .map(|c| c.accepted_tokens().to_vec())
            .unwrap_or_default();
        self.event_log.log(Event::UserConfigured {
            user: user.to_string(),
            accepted_tokens: accepted,
        });
    }

    /// Submit the buy half of a DvP pair: `maker` offers `price` in
    /// `payment_token` for one asset serial held by `counterparty`.
    pub fn submit_dvp_buy(
        &mut self,
        maker: &str,
        asset_id: &str,
        token_serial: u64,
        payment_token: &str,
        price: u128,
        counterparty: &str,
    ) -> Result<u64, EngineError> {
        self.ensure_idle()?;
        self.validate_dvp_submission(maker, asset_id, counterparty)?;
        let quote = Quote::new(payment_token, price);
        self.validate_quote(&quote)?;
        let id = self.book.insert_dvp(
            maker.to_string(),
            Side::Buy,
            asset_id.to_string(),
            token_serial,
            vec![quote],
            counterparty.to_string(),
        );
        self.event_log.log(Event::OrderPlaced {
            order_id: id,
            maker: maker.to_string(),
            side: Side::Buy,
            asset_id: asset_id.to_string(),
            token_serial,
        });
        Ok(id)
    }

    /// Submit the sell half of a DvP pair. A sell may list several
    /// acceptable (payment token, price) quotes; the buy's quote must
    /// appear among them to match.
    pub fn submit_dvp_sell(
        &mut self,
        maker: &str,
        asset_id: &str,
        token_serial: u64,
        quotes: Vec<Quote>,
        counterparty: &str,
    ) -> Result<u64, EngineError> {
        self.ensure_idle()?;
        self.validate_dvp_submission(maker, asset_id, counterparty)?;
        if quotes.is_empty() {
            return Err(EngineError::InvalidConfig(
                "sell order needs at least one quote".to_string(),
            ));
        }
        for quote in &quotes {
            self.validate_quote(quote)?;
        }
        let id = self.book.insert_dvp(
            maker.to_string(),
            Side::Sell,
            asset_id.to_string(),
            token_serial,
            quotes,
            counterparty.to_string(),
        );
        self.event_log.log(Event::OrderPlaced {
            order_id: id,
            maker: maker.to_string(),
            side: Side::Sell,
            asset_id: asset_id.to_string(),
            token_serial,
        });
        Ok(id)
    }

    fn validate_dvp_submission(
        &self,
        maker: &str,
        asset_id: &str,
        counterparty: &str,
    ) -> Result<(), EngineError> {
        self.ensure_configured(maker)?;
        self.ensure_configured(counterparty)?;
        if !self.tokens.is_non_fungible(asset_id) {
            return Err(EngineError::InvalidConfig(format!(
                "unknown asset ledger {}",
                asset_id
            )));
        }
        Ok(())
    }

    fn validate_quote(&self, quote: &Quote) -> Result<(), EngineError> {
        self.validate_amount(quote.price)?;
        if !self.tokens.is_fungible(&quote.payment_token) {
            return Err(EngineError::InvalidConfig(format!(
                "unknown payment token {}",
                quote.payment_token
            )));
        }
        Ok(())
    }

    /// Create a payment request on behalf of `recipient`. `sender` pins
    /// the payer; `None` leaves the request open to any sender.
    pub fn create_payment_request(
        &mut self,
        recipient: &str,
        sender: Option<&str>,
        amount: u128,
    ) -> Result<u64, EngineError> {
        self.ensure_idle()?;
        self.ensure_configured(recipient)?;
        if let Some(sender) = sender {
            self.ensure_configured(sender)?;
        }
        self.validate_amount(amount)?;
        let id = self
            .book
            .insert_payment(recipient.to_string(), sender.map(str::to_string), amount);
        self.event_log.log(Event::PaymentRequestCreated {
            payment_id: id,
            recipient: recipient.to_string(),
            sender: sender.map(str::to_string),
            amount,
        });
        Ok(id)
    }

    /// Commit `caller` as the sender of a payment request, paying in
    /// `token`. Rejected with `TokenNotAccepted` if the recipient does
    /// not accept `token`.
    pub fn fulfill_payment_request(
        &mut self,
        caller: &str,
        payment_id: u64,
        token: &str,
    ) -> Result<(), EngineError> {
        self.ensure_idle()?;
        self.ensure_configured(caller)?;
        let (recipient, pinned) = {
            let payment = self
                .book
                .payment(payment_id)
                .ok_or(EngineError::UnknownId(payment_id))?;
            if !payment.is_active() {
                return Err(EngineError::Inactive(payment_id));
            }
            if payment.is_fulfilled() {
                return Err(EngineError::AlreadyMatched(payment_id));
            }
            (
                payment.recipient().to_string(),
                payment.sender().map(str::to_string),
            )
        };
        if let Some(pinned) = pinned {
            if pinned != caller {
                return Err(EngineError::NotOwner {
                    id: payment_id,
                    caller: caller.to_string(),
                });
            }
        }
        if !self.registry.accepts(&recipient, token) {
            return Err(EngineError::TokenNotAccepted {
                user: recipient,
                token: token.to_string(),
            });
        }
        self.book
            .payment_mut(payment_id)
            .unwrap()
            .record_fulfillment(caller.to_string(), token.to_string());
        self.event_log.log(Event::PaymentRequestFulfilled {
            payment_id,
            sender: caller.to_string(),
            token: token.to_string(),
        });
        Ok(())
    }

    /// Submit one swap leg and immediately attempt to match it.
    pub fn submit_swap_order(
        &mut self,
        maker: &str,
        send_amount: u128,
        send_token: &str,
        receive_amount: u128,
    ) -> Result<u64, EngineError> {
        self.ensure_idle()?;
        self.ensure_configured(maker)?;
        self.validate_amount(send_amount)?;
        self.validate_amount(receive_amount)?;
        if !self.tokens.is_fungible(send_token) {
            return Err(EngineError::InvalidConfig(format!(
                "unknown send token {}",
                send_token
            )));
        }
        let id = self.book.insert_swap(
            maker.to_string(),
            send_amount,
            send_token.to_string(),
            receive_amount,
        );
        self.event_log.log(Event::SwapOrderSubmitted {
            swap_id: id,
            maker: maker.to_string(),
            send_amount,
            send_token: send_token.to_string(),
            receive_amount,
        });
        self.run_swap_matching();
        Ok(id)
    }

    /// Cancel a DvP order; only the maker may cancel.
    pub fn cancel_order(&mut self, caller: &str, id: u64) -> Result<(), EngineError> {
        self.ensure_idle()?;
        self.book.cancel_order(caller, id)?;
        self.event_log.log(Event::OrderCancelled {
            order_id: id,
            maker: caller.to_string(),
        });
        Ok(())
    }

    /// Cancel a payment request (recipient while unfulfilled, committed
    /// sender while fulfilled but unsettled).
    pub fn cancel_payment_request(&mut self, caller: &str, id: u64) -> Result<(), EngineError> {
        self.ensure_idle()?;
        self.book.cancel_payment(caller, id)?;
        self.event_log
            .log(Event::PaymentRequestCancelled { payment_id: id });
        Ok(())
    }

    /// Cancel a swap leg; a matched peer reverts to unmatched.
    pub fn cancel_swap_order(&mut self, caller: &str, id: u64) -> Result<(), EngineError> {
        self.ensure_idle()?;
        self.book.cancel_swap(caller, id)?;
        self.event_log.log(Event::SwapOrderCancelled { swap_id: id });
        Ok(())
    }

    // ========================================================================
    // Matching API
    // ========================================================================

    /// Pair matchable DvP halves. Idempotent; returns pairs formed.
    pub fn match_dvp_orders(&mut self) -> Result<usize, EngineError> {
        self.ensure_idle()?;
        let matches = matching::match_dvp_orders(&mut self.book);
        for m in &matches {
            self.event_log.log(Event::OrderMatched {
                buy_id: m.buy_id,
                sell_id: m.sell_id,
                payment_token: m.quote.payment_token.clone(),
                price: m.quote.price,
            });
        }
        Ok(matches.len())
    }

    /// Pair matchable swap legs. Idempotent; returns pairs formed.
    pub fn match_swap_orders(&mut self) -> Result<usize, EngineError> {
        self.ensure_idle()?;
        Ok(self.run_swap_matching())
    }

    fn run_swap_matching(&mut self) -> usize {
        let matches = matching::match_swap_orders(&mut self.book, &self.registry);
        for m in &matches {
            self.event_log.log(Event::SwapOrderMatched {
                swap_id_a: m.leg_a,
                swap_id_b: m.leg_b,
            });
        }
        matches.len()
    }

    // ========================================================================
    // View API
    // ========================================================================

    pub fn get_user_config(&self, user: &str) -> Option<&UserConfig> {
        self.registry.get(user)
    }

    pub fn get_order(&self, id: u64) -> Option<&DvpOrder> {
        self.book.order(id)
    }

    pub fn get_payment_request(&self, id: u64) -> Option<&PaymentRequest> {
        self.book.payment(id)
    }

    pub fn get_swap_order(&self, id: u64) -> Option<&SwapOrder> {
        self.book.swap(id)
    }

    pub fn last_settlement_time(&self) -> Option<u64> {
        self.clock.last_settlement()
    }

    pub fn cycle_interval(&self) -> u64 {
        self.clock.cycle_interval_secs()
    }

    pub fn stake_rate_bps(&self) -> u32 {
        self.config.stake_rate_bps
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycle_seq
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Canonical digest of the engine configuration.
    pub fn config_digest(&self) -> Result<String, EngineError> {
        canonical_digest(&self.config)
    }

    pub fn event_log(&self) -> &EventLog {
        &self.event_log
    }

    pub fn tokens(&self) -> &TokenHub {
        &self.tokens
    }

    /// Mutable adapter access for host wiring and scenario setup.
    ///
    /// Direct ledger mutation bypasses engine invariants; hosts should
    /// only mint, approve and read between cycles.
    pub fn tokens_mut(&mut self) -> &mut TokenHub {
        &mut self.tokens
    }

    // ========================================================================
    // Settlement cycle
    // ========================================================================

    /// Run one settlement cycle at wall-clock `now` (unix seconds).
    ///
    /// Rejects with `TooSoon` inside the configured interval and `Busy`
    /// on re-entry. On success the report summarizes the cycle; on
    /// failure the cycle has been fully rolled back, the failure event
    /// emitted, and the gate left where it was.
    ///
    /// # Example
    /// ```
    /// use clearing_engine_core_rs::{ClearingEngine, EngineConfig, FungibleToken, TokenAdapter, TokenHub};
    ///
    /// let mut hub = TokenHub::new();
    /// hub.register(TokenAdapter::Fungible(FungibleToken::new("T0".to_string())));
    /// let mut engine = ClearingEngine::new(EngineConfig::default(), hub).unwrap();
    ///
    /// engine.configure_user("alice", vec!["T0".to_string()]).unwrap();
    /// engine.configure_user("bob", vec!["T0".to_string()]).unwrap();
    /// {
    ///     let ledger = engine.tokens_mut().fungible_mut("T0").unwrap();
    ///     ledger.mint("bob", 1_000);
    ///     ledger.approve("bob", 1_000);
    /// }
    ///
    /// let id = engine.create_payment_request("alice", Some("bob"), 1_000).unwrap();
    /// engine.fulfill_payment_request("bob", id, "T0").unwrap();
    ///
    /// let report = engine.perform_settlement(1_000).unwrap();
    /// assert_eq!(report.settled_payments, 1);
    /// assert_eq!(engine.tokens().balance_of("T0", "alice").unwrap(), 1_000);
    /// assert_eq!(engine.tokens().custody_balance("T0").unwrap(), 0);
    /// ```
    pub fn perform_settlement(&mut self, now: u64) -> Result<CycleReport, EngineError> {
        self.ensure_idle()?;
        if !self.clock.may_begin(now) {
            return Err(EngineError::TooSoon {
                now,
                ready_at: self.clock.ready_at(),
            });
        }

        self.in_cycle = true;
        self.cycle_seq += 1;
        let cycle_id = self.cycle_seq;
        let run_id = Uuid::new_v4();
        let audit = LedgerAudit::capture(&self.tokens);

        let span = tracing::info_span!("settlement_cycle", cycle_id, run_id = %run_id);
        let _enter = span.enter();

        let result = self.run_cycle(cycle_id, run_id, now);

        self.phase = CyclePhase::Idle;
        self.in_cycle = false;

        // The custody pool must be empty however the cycle ended.
        audit.verify_drained(&self.tokens)?;
        result
    }

    fn run_cycle(
        &mut self,
        cycle_id: u64,
        run_id: Uuid,
        now: u64,
    ) -> Result<CycleReport, EngineError> {
        let mut items = CycleItems::collect(&self.book);
        let mut excluded: Vec<ItemRef> = Vec::new();
        let mut seizure: BTreeMap<UserId, BTreeMap<TokenId, u128>> = BTreeMap::new();
        let mut seizure_weights: BTreeMap<UserId, u128> = BTreeMap::new();
        let mut all_defaulters: Vec<UserId> = Vec::new();
        let mut restarted = false;

        loop {
            let (end, newly_excluded) = self.run_attempt(cycle_id, &items);
            excluded.extend(newly_excluded);

            match end {
                AttemptEnd::Finalized {
                    participants,
                    settled_dvp_pairs,
                    settled_payments,
                    settled_swaps,
                    total_disbursed,
                } => {
                    self.distribute_seizure(cycle_id, &mut seizure, &seizure_weights)?;
                    self.penalize_items(&excluded);
                    self.event_log.log(Event::SettlementCompleted {
                        cycle_id,
                        timestamp: now,
                    });
                    self.clock.mark_settled(now);
                    tracing::info!(
                        participants,
                        settled_dvp_pairs,
                        settled_payments,
                        settled_swaps,
                        restarted,
                        "cycle finalized"
                    );
                    return Ok(CycleReport {
                        cycle_id,
                        run_id,
                        timestamp: now,
                        participants,
                        settled_dvp_pairs,
                        settled_payments,
                        settled_swaps,
                        defaulters: all_defaulters,
                        restarted,
                        total_disbursed,
                    });
                }

                AttemptEnd::Defaulted {
                    defaulters,
                    seized,
                    weights,
                } => {
                    for (user, tokens) in seized {
                        let slot = seizure.entry(user).or_default();
                        for (token, amount) in tokens {
                            *slot.entry(token).or_insert(0) += amount;
                        }
                    }
                    seizure_weights = weights;
                    all_defaulters.extend(defaulters.iter().cloned());

                    if restarted {
                        // Second default terminates the cycle.
                        self.phase = CyclePhase::Rollback;
                        self.distribute_seizure(cycle_id, &mut seizure, &seizure_weights)?;
                        let mut refs = items.refs();
                        refs.extend(excluded.iter().copied());
                        self.penalize_items(&refs);
                        self.event_log.log(Event::SettlementFailed {
                            cycle_id,
                            reason: format!(
                                "default on restart by {}",
                                all_defaulters.join(", ")
                            ),
                        });
                        return Err(EngineError::SettlementDefault {
                            defaulters: all_defaulters,
                        });
                    }

                    tracing::info!(defaulters = defaulters.len(), "restarting cycle without defaulters");
                    restarted = true;
                    let (kept, dropped) = items.partition_excluding(&defaulters, &self.book);
                    items = kept;
                    excluded.extend(dropped);
                }

                AttemptEnd::Failed { error } => {
                    self.phase = CyclePhase::Rollback;
                    self.distribute_seizure(cycle_id, &mut seizure, &seizure_weights)?;
                    let mut refs = items.refs();
                    refs.extend(excluded.iter().copied());
                    self.penalize_items(&refs);
                    self.event_log.log(Event::SettlementFailed {
                        cycle_id,
                        reason: error.to_string(),
                    });
                    return Err(error);
                }
            }
        }
    }

    /// Run one attempt over `items`. Any failure path unwinds this
    /// attempt's custody before returning; on `Defaulted`, the seized
    /// stake is the only value left in custody.
    fn run_attempt(&mut self, cycle_id: u64, items: &CycleItems) -> (AttemptEnd, Vec<ItemRef>) {
        let mut newly_excluded: Vec<ItemRef> = Vec::new();

        // Phase 1: participants and gross outgoing
        self.phase = CyclePhase::CollectParticipants;
        let gross = match collect_gross_out(items, &self.book) {
            Ok(g) => g,
            Err(error) => return (AttemptEnd::Failed { error }, newly_excluded),
        };
        tracing::debug!(participants = gross.participants.len(), "participants collected");

        if items.is_empty() {
            return (
                AttemptEnd::Finalized {
                    participants: 0,
                    settled_dvp_pairs: 0,
                    settled_payments: 0,
                    settled_swaps: 0,
                    total_disbursed: 0,
                },
                newly_excluded,
            );
        }

        // Phase 2: stake collection
        self.phase = CyclePhase::CollectStake;
        let mut ledgers = AttemptLedgers::default();
        let mut ineligible: BTreeSet<UserId> = BTreeSet::new();

        for user in gross.participants.iter().cloned().collect::<Vec<_>>() {
            let quota = stake_quota(gross.gross_of(&user), self.config.stake_rate_bps);
            let mut remaining = quota;
            let ranked = match self.registry.ranked_tokens(&user) {
                Ok(ranked) => ranked,
                Err(_) => {
                    ineligible.insert(user.clone());
                    continue;
                }
            };
            for token in &ranked {
                if remaining == 0 {
                    break;
                }
                let balance = self.tokens.balance_of(token, &user).unwrap_or(0);
                let allowance = self.tokens.allowance_of(token, &user).unwrap_or(0);
                let draw = remaining.min(balance).min(allowance);
                if draw == 0 {
                    continue;
                }
                if self.tokens.transfer_from(token, &user, draw).is_ok() {
                    ledgers.stake.record(&user, token, draw);
                    remaining -= draw;
                    self.event_log.log(Event::StakeCollected {
                        cycle_id,
                        user: user.clone(),
                        token: token.clone(),
                        amount: draw,
                    });
                }
            }
            if remaining > 0 {
                // StakeShortfall is local: the user sits this cycle out and
                // any partial stake goes straight back so later phases never
                // touch their ledger.
                tracing::debug!(user = %user, missing = %remaining, "stake shortfall");
                ineligible.insert(user.clone());
                let taken = ledgers.stake.remove_user(&user);
                for (token, amount) in taken {
                    if let Err(error) = self.tokens.transfer(&token, &user, amount) {
                        return (
                            self.fail_attempt(cycle_id, &mut ledgers, error.into()),
                            newly_excluded,
                        );
                    }
                    self.event_log.log(Event::StakeRefunded {
                        cycle_id,
                        user: user.clone(),
                        token,
                        amount,
                    });
                }
            }
        }

        // Phase 3: obligations, excluding items that touch ineligible users
        self.phase = CyclePhase::ComputeObligations;
        let (mut active_items, dropped) = items.partition_excluding(&ineligible, &self.book);
        newly_excluded.extend(dropped);
        let nets = match compute_obligations(&active_items, &self.book) {
            Ok(nets) => nets,
            Err(error) => {
                return (
                    self.fail_attempt(cycle_id, &mut ledgers, error),
                    newly_excluded,
                )
            }
        };

        // Phase 4: aggregation and conservation check
        self.phase = CyclePhase::Aggregate;
        if let Err(error) = nets.assert_conservation() {
            return (
                self.fail_attempt(cycle_id, &mut ledgers, error),
                newly_excluded,
            );
        }
        let mut agg = match nets.aggregate() {
            Ok(agg) => agg,
            Err(error) => {
                return (
                    self.fail_attempt(cycle_id, &mut ledgers, error),
                    newly_excluded,
                )
            }
        };

        // Phase 5: lock net (pay-in), stake first, then ranked debits
        self.phase = CyclePhase::LockNet;
        let mut defaulters: BTreeSet<UserId> = BTreeSet::new();
        for (user, net) in agg.clone() {
            if net >= 0 {
                continue;
            }
            let owed = net.unsigned_abs();
            let ranked = self.registry.ranked_tokens(&user).unwrap_or_default();

            let mut covered: u128 = 0;
            for (token, amount) in ledgers.stake.apply_toward(&user, owed, &ranked) {
                covered += amount;
                *ledgers.pool.entry(token.clone()).or_insert(0) += amount;
                *ledgers
                    .applied_stake
                    .entry(user.clone())
                    .or_default()
                    .entry(token)
                    .or_insert(0) += amount;
            }

            let mut residual = owed - covered;
            for token in &ranked {
                if residual == 0 {
                    break;
                }
                let balance = self.tokens.balance_of(token, &user).unwrap_or(0);
                let allowance = self.tokens.allowance_of(token, &user).unwrap_or(0);
                let draw = residual.min(balance).min(allowance);
                if draw == 0 {
                    continue;
                }
                if self.tokens.transfer_from(token, &user, draw).is_ok() {
                    *ledgers.pool.entry(token.clone()).or_insert(0) += draw;
                    *ledgers
                        .pay_in
                        .entry(user.clone())
                        .or_default()
                        .entry(token.clone())
                        .or_insert(0) += draw;
                    residual -= draw;
                }
            }
            if residual > 0 {
                defaulters.insert(user.clone());
            }
        }

        if !defaulters.is_empty() {
            for user in &defaulters {
                self.event_log.log(Event::ParticipantDefaulted {
                    cycle_id,
                    user: user.clone(),
                });
            }
            // Seize defaulters' stake, the applied part included;
            // everything else is returned.
            let mut seized: BTreeMap<UserId, BTreeMap<TokenId, u128>> = BTreeMap::new();
            for user in &defaulters {
                let mut taken = ledgers.stake.remove_user(user);
                for (token, amount) in ledgers.applied_stake.remove(user).unwrap_or_default() {
                    if let Some(pool_slot) = ledgers.pool.get_mut(&token) {
                        *pool_slot = pool_slot.saturating_sub(amount);
                    }
                    *taken.entry(token).or_insert(0) += amount;
                }
                if taken.is_empty() {
                    continue;
                }
                for (token, amount) in &taken {
                    self.event_log.log(Event::StakeSeized {
                        cycle_id,
                        user: user.clone(),
                        token: token.clone(),
                        amount: *amount,
                    });
                }
                seized.insert(user.clone(), taken);
            }
            if let Err(error) = self.unwind_attempt(cycle_id, &mut ledgers) {
                return (AttemptEnd::Failed { error }, newly_excluded);
            }
            let mut weights = BTreeMap::new();
            for user in &gross.participants {
                if ineligible.contains(user) || defaulters.contains(user) {
                    continue;
                }
                let weight = gross.gross_of(user);
                if weight > 0 {
                    weights.insert(user.clone(), weight);
                }
            }
            return (
                AttemptEnd::Defaulted {
                    defaulters,
                    seized,
                    weights,
                },
                newly_excluded,
            );
        }

        // Phase 6: lock DvP assets into custody
        self.phase = CyclePhase::LockAssets;
        for (buy_id, sell_id) in active_items.dvp_pairs.clone() {
            let (buyer, seller, asset, serial, quote) = {
                let buy = self.book.order(buy_id).expect("cycle pair exists");
                let sell = self.book.order(sell_id).expect("cycle pair exists");
                (
                    buy.maker().to_string(),
                    sell.maker().to_string(),
                    sell.asset_id().to_string(),
                    sell.token_serial(),
                    buy.agreed().cloned().expect("matched pair has agreed quote"),
                )
            };
            match self.tokens.asset_transfer_from(&asset, serial, &seller) {
                Ok(()) => {
                    if let Some(order) = self.book.order_mut(buy_id) {
                        order.set_locked(true);
                    }
                    if let Some(order) = self.book.order_mut(sell_id) {
                        order.set_locked(true);
                    }
                    ledgers.locked.push(LockedAsset {
                        buy_id,
                        sell_id,
                        buyer,
                        seller,
                        asset,
                        serial,
                    });
                }
                Err(lock_error) => {
                    // Unwind just this pair when both parties are otherwise
                    // uninvolved; their nets then cancel exactly. Anything
                    // more entangled rolls the cycle back.
                    let item = ItemRef::Dvp { buy_id, sell_id };
                    let solo = self.parties_are_solo(&active_items, item, &buyer, &seller);
                    if !solo {
                        return (
                            self.fail_attempt(cycle_id, &mut ledgers, lock_error.into()),
                            newly_excluded,
                        );
                    }
                    tracing::debug!(buy_id, sell_id, "asset lock failed, dropping pair");
                    if let Err(error) =
                        self.refund_pay_in_slice(cycle_id, &mut ledgers, &buyer, quote.price)
                    {
                        return (
                            self.fail_attempt(cycle_id, &mut ledgers, error),
                            newly_excluded,
                        );
                    }
                    agg.insert(buyer.clone(), 0);
                    agg.insert(seller.clone(), 0);
                    active_items.dvp_pairs.retain(|&pair| pair != (buy_id, sell_id));
                    newly_excluded.push(item);
                }
            }
        }

        // Phase 7: disbursement through ranked preferences
        self.phase = CyclePhase::Disburse;
        let mut total_disbursed: u128 = 0;
        for (user, net) in agg.clone() {
            if net <= 0 {
                continue;
            }
            let mut due = net.unsigned_abs();
            let ranked = self.registry.ranked_tokens(&user).unwrap_or_default();
            let mut route: Vec<TokenId> = ranked;
            for token in ledgers.pool.keys() {
                if !route.contains(token) {
                    route.push(token.clone());
                }
            }
            for token in route {
                if due == 0 {
                    break;
                }
                let available = ledgers.pool.get(&token).copied().unwrap_or(0);
                let slice = due.min(available);
                if slice == 0 {
                    continue;
                }
                if let Err(error) = self.tokens.transfer(&token, &user, slice) {
                    return (
                        self.fail_attempt(cycle_id, &mut ledgers, error.into()),
                        newly_excluded,
                    );
                }
                *ledgers.pool.get_mut(&token).unwrap() -= slice;
                due -= slice;
                total_disbursed += slice;
                self.event_log.log(Event::CrossStablecoinNetted {
                    cycle_id,
                    user: user.clone(),
                    aggregate: net,
                    token,
                    amount: slice,
                });
            }
            if due > 0 {
                let error = EngineError::InternalInvariantViolation(format!(
                    "pool exhausted disbursing to {}: {} still due",
                    user, due
                ));
                return (
                    self.fail_attempt(cycle_id, &mut ledgers, error),
                    newly_excluded,
                );
            }
        }

        // Phase 8: refund unused stake
        self.phase = CyclePhase::RefundStake;
        for user in ledgers.stake.users() {
            for (token, amount) in ledgers.stake.remove_user(&user) {
                if let Err(error) = self.tokens.transfer(&token, &user, amount) {
                    return (AttemptEnd::Failed { error: error.into() }, newly_excluded);
                }
                self.event_log.log(Event::StakeRefunded {
                    cycle_id,
                    user: user.clone(),
                    token,
                    amount,
                });
            }
        }

        // Phase 9: finalize items
        self.phase = CyclePhase::Finalize;
        for locked in std::mem::take(&mut ledgers.locked) {
            if let Err(error) = self
                .tokens
                .asset_transfer(&locked.asset, locked.serial, &locked.buyer)
            {
                return (AttemptEnd::Failed { error: error.into() }, newly_excluded);
            }
            if let Some(order) = self.book.order_mut(locked.buy_id) {
                order.deactivate();
            }
            if let Some(order) = self.book.order_mut(locked.sell_id) {
                order.deactivate();
            }
        }
        for &id in &active_items.payments {
            if let Some(payment) = self.book.payment_mut(id) {
                payment.mark_settled();
            }
        }
        for &(leg_a, leg_b) in &active_items.swap_pairs {
            if let Some(swap) = self.book.swap_mut(leg_a) {
                swap.deactivate();
            }
            if let Some(swap) = self.book.swap_mut(leg_b) {
                swap.deactivate();
            }
        }

        (
            AttemptEnd::Finalized {
                participants: gross.participants.len(),
                settled_dvp_pairs: active_items.dvp_pairs.len(),
                settled_payments: active_items.payments.len(),
                settled_swaps: active_items.swap_pairs.len(),
                total_disbursed,
            },
            newly_excluded,
        )
    }

    /// Both parties of `item` appear in no other item of the attempt.
    fn parties_are_solo(
        &self,
        active_items: &CycleItems,
        item: ItemRef,
        buyer: &str,
        seller: &str,
    ) -> bool {
        for other in active_items.refs() {
            if other == item {
                continue;
            }
            let parties = item_parties(other, &self.book);
            if parties.iter().any(|p| p == buyer || p == seller) {
                return false;
            }
        }
        true
    }

    /// Return `amount` of `user`'s pay-in from the pool: fresh debits
    /// first, applied stake after (with its refund event).
    fn refund_pay_in_slice(
        &mut self,
        cycle_id: u64,
        ledgers: &mut AttemptLedgers,
        user: &str,
        amount: u128,
    ) -> Result<(), EngineError> {
        let mut remaining = amount;

        if let Some(entries) = ledgers.pay_in.get_mut(user) {
            let tokens: Vec<TokenId> = entries.keys().cloned().collect();
            for token in tokens {
                if remaining == 0 {
                    break;
                }
                let held = entries.get_mut(&token).unwrap();
                let take = remaining.min(*held);
                if take == 0 {
                    continue;
                }
                self.tokens.transfer(&token, user, take)?;
                *held -= take;
                if *held == 0 {
                    entries.remove(&token);
                }
                *ledgers.pool.get_mut(&token).ok_or_else(|| {
                    EngineError::InternalInvariantViolation(format!("pool missing token {}", token))
                })? -= take;
                remaining -= take;
            }
        }
        if entries_is_empty(&ledgers.pay_in, user) {
            ledgers.pay_in.remove(user);
        }

        if remaining > 0 {
            if let Some(entries) = ledgers.applied_stake.get_mut(user) {
                let tokens: Vec<TokenId> = entries.keys().cloned().collect();
                for token in tokens {
                    if remaining == 0 {
                        break;
                    }
                    let held = entries.get_mut(&token).unwrap();
                    let take = remaining.min(*held);
                    if take == 0 {
                        continue;
                    }
                    self.tokens.transfer(&token, user, take)?;
                    *held -= take;
                    if *held == 0 {
                        entries.remove(&token);
                    }
                    *ledgers.pool.get_mut(&token).ok_or_else(|| {
                        EngineError::InternalInvariantViolation(format!(
                            "pool missing token {}",
                            token
                        ))
                    })? -= take;
                    remaining -= take;
                    self.event_log.log(Event::StakeRefunded {
                        cycle_id,
                        user: user.to_string(),
                        token,
                        amount: take,
                    });
                }
            }
        }

        if remaining > 0 {
            return Err(EngineError::InternalInvariantViolation(format!(
                "pay-in of {} short by {}",
                user, remaining
            )));
        }
        Ok(())
    }

    /// Unwind one attempt: return custody assets, refund pay-ins, refund
    /// all remaining stake.
    fn unwind_attempt(
        &mut self,
        cycle_id: u64,
        ledgers: &mut AttemptLedgers,
    ) -> Result<(), EngineError> {
        for locked in std::mem::take(&mut ledgers.locked) {
            self.tokens
                .asset_transfer(&locked.asset, locked.serial, &locked.seller)?;
            if let Some(order) = self.book.order_mut(locked.buy_id) {
                order.set_locked(false);
            }
            if let Some(order) = self.book.order_mut(locked.sell_id) {
                order.set_locked(false);
            }
        }

        let pay_in = std::mem::take(&mut ledgers.pay_in);
        for (user, entries) in pay_in {
            for (token, amount) in entries {
                self.tokens.transfer(&token, &user, amount)?;
            }
        }
        let applied = std::mem::take(&mut ledgers.applied_stake);
        for (user, entries) in applied {
            for (token, amount) in entries {
                self.tokens.transfer(&token, &user, amount)?;
                self.event_log.log(Event::StakeRefunded {
                    cycle_id,
                    user: user.clone(),
                    token,
                    amount,
                });
            }
        }
        ledgers.pool.clear();

        for user in ledgers.stake.users() {
            for (token, amount) in ledgers.stake.remove_user(&user) {
                self.tokens.transfer(&token, &user, amount)?;
                self.event_log.log(Event::StakeRefunded {
                    cycle_id,
                    user: user.clone(),
                    token,
                    amount,
                });
            }
        }
        Ok(())
    }

    fn fail_attempt(
        &mut self,
        cycle_id: u64,
        ledgers: &mut AttemptLedgers,
        error: EngineError,
    ) -> AttemptEnd {
        if let Err(unwind_error) = self.unwind_attempt(cycle_id, ledgers) {
            return AttemptEnd::Failed {
                error: unwind_error,
            };
        }
        AttemptEnd::Failed { error }
    }

    /// Pay the seizure pool out to the surviving participants pro rata to
    /// their gross outgoing. With no survivors the seized stake goes back
    /// to its contributors; custody may not retain residue either way.
    fn distribute_seizure(
        &mut self,
        cycle_id: u64,
        seizure: &mut BTreeMap<UserId, BTreeMap<TokenId, u128>>,
        weights: &BTreeMap<UserId, u128>,
    ) -> Result<(), EngineError> {
        if seizure.is_empty() {
            return Ok(());
        }
        let pool = std::mem::take(seizure);

        if weights.is_empty() {
            for (user, entries) in pool {
                for (token, amount) in entries {
                    self.tokens.transfer(&token, &user, amount)?;
                    self.event_log.log(Event::StakeRefunded {
                        cycle_id,
                        user: user.clone(),
                        token,
                        amount,
                    });
                }
            }
            return Ok(());
        }

        let mut by_token: BTreeMap<TokenId, u128> = BTreeMap::new();
        for entries in pool.values() {
            for (token, amount) in entries {
                *by_token.entry(token.clone()).or_insert(0) += amount;
            }
        }
        for (token, amount) in by_token {
            for (user, share) in pro_rata_shares(amount, weights) {
                self.tokens.transfer(&token, &user, share)?;
                self.event_log.log(Event::StakeRedistributed {
                    cycle_id,
                    user,
                    token: token.clone(),
                    amount: share,
                });
            }
        }
        Ok(())
    }

    /// Charge one failed cycle to every item in `refs` and apply the
    /// retry cap: DvP pairs and payment requests are cancelled, swap
    /// pairs are unmatched and reactivated for future matching.
    fn penalize_items(&mut self, refs: &[ItemRef]) {
        let mut seen: BTreeSet<ItemRef> = BTreeSet::new();
        let max = self.config.max_failed_cycles;

        for &item in refs {
            if !seen.insert(item) {
                continue;
            }
            match item {
                ItemRef::Dvp { buy_id, sell_id } => {
                    let mut capped = false;
                    for id in [buy_id, sell_id] {
                        if let Some(order) = self.book.order_mut(id) {
                            if order.is_active() && order.bump_failed_cycles() >= max {
                                capped = true;
                            }
                        }
                    }
                    if capped {
                        for id in [buy_id, sell_id] {
                            let maker = match self.book.order_mut(id) {
                                Some(order) if order.is_active() => {
                                    order.deactivate();
                                    order.maker().to_string()
                                }
                                _ => continue,
                            };
                            self.event_log.log(Event::OrderCancelled {
                                order_id: id,
                                maker,
                            });
                        }
                    }
                }
                ItemRef::Payment { id } => {
                    let capped = match self.book.payment_mut(id) {
                        Some(payment) if payment.is_active() => {
                            payment.bump_failed_cycles() >= max
                        }
                        _ => false,
                    };
                    if capped {
                        self.book.payment_mut(id).unwrap().deactivate();
                        self.event_log
                            .log(Event::PaymentRequestCancelled { payment_id: id });
                    }
                }
                ItemRef::Swap { leg_a, leg_b } => {
                    let mut capped = false;
                    for id in [leg_a, leg_b] {
                        if let Some(swap) = self.book.swap_mut(id) {
                            if swap.is_active() && swap.bump_failed_cycles() >= max {
                                capped = true;
                            }
                        }
                    }
                    if capped {
                        for id in [leg_a, leg_b] {
                            if let Some(swap) = self.book.swap_mut(id) {
                                swap.clear_match();
                            }
                        }
                    }
                }
            }
        }
    }
}

fn entries_is_empty(pay_in: &BTreeMap<UserId, BTreeMap<TokenId, u128>>, user: &str) -> bool {
    pay_in.get(user).map(|e| e.is_empty()).unwrap_or(true)
}
