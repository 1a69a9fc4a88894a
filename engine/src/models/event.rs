//! Event logging for external observers and auditing.
//!
//! Every lifecycle transition the engine performs is appended here in the
//! order it happened; within a cycle, emission order mirrors the phase
//! order of the state machine. The log is append-only and enables:
//! - Auditing (verify correctness of settlements)
//! - Debugging (understand what happened and when)
//! - Analysis (extract netting efficiency and default patterns)

use crate::models::{Side, UserId};
use crate::token::TokenId;
use serde::{Deserialize, Serialize};

/// Engine event capturing a state change.
///
/// Submission events carry no cycle id; cycle events carry the id of the
/// settlement cycle that emitted them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    /// Participant configured or reconfigured their accepted-token list
    UserConfigured {
        user: UserId,
        accepted_tokens: Vec<TokenId>,
    },

    /// DvP order accepted into the book
    OrderPlaced {
        order_id: u64,
        maker: UserId,
        side: Side,
        asset_id: TokenId,
        token_serial: u64,
    },

    /// DvP buy/sell halves matched; the agreed quote is frozen
    OrderMatched {
        buy_id: u64,
        sell_id: u64,
        payment_token: TokenId,
        price: u128,
    },

    /// DvP order cancelled (by its maker, or by the retry cap)
    OrderCancelled { order_id: u64, maker: UserId },

    /// Payment request created by its recipient
    PaymentRequestCreated {
        payment_id: u64,
        recipient: UserId,
        sender: Option<UserId>,
        amount: u128,
    },

    /// Sender committed a token to a payment request
    PaymentRequestFulfilled {
        payment_id: u64,
        sender: UserId,
        token: TokenId,
    },

    /// Payment request cancelled (recipient, sender, or retry cap)
    PaymentRequestCancelled { payment_id: u64 },

    /// Swap leg accepted into the book
    SwapOrderSubmitted {
        swap_id: u64,
        maker: UserId,
        send_amount: u128,
        send_token: TokenId,
        receive_amount: u128,
    },

    /// Two swap legs matched
    SwapOrderMatched { swap_id_a: u64, swap_id_b: u64 },

    /// Swap leg cancelled by its maker
    SwapOrderCancelled { swap_id: u64 },

    /// Stake drawn from a participant during Phase 2
    StakeCollected {
        cycle_id: u64,
        user: UserId,
        token: TokenId,
        amount: u128,
    },

    /// Defaulter's stake moved to the seizure pool
    StakeSeized {
        cycle_id: u64,
        user: UserId,
        token: TokenId,
        amount: u128,
    },

    /// Seizure pool slice paid out to a surviving participant
    StakeRedistributed {
        cycle_id: u64,
        user: UserId,
        token: TokenId,
        amount: u128,
    },

    /// Unused stake returned to its contributor
    StakeRefunded {
        cycle_id: u64,
        user: UserId,
        token: TokenId,
        amount: u128,
    },

    /// One disbursement slice of a participant's aggregate net position
    CrossStablecoinNetted {
        cycle_id: u64,
        user: UserId,
        aggregate: i128,
        token: TokenId,
        amount: u128,
    },

    /// Participant failed to cover their net obligation at pay-in
    ParticipantDefaulted { cycle_id: u64, user: UserId },

    /// Cycle ran to Finalize
    SettlementCompleted { cycle_id: u64, timestamp: u64 },

    /// Cycle ended in Rollback
    SettlementFailed { cycle_id: u64, reason: String },
}

impl Event {
    /// Short description of the event type
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::UserConfigured { .. } => "UserConfigured",
            Event::OrderPlaced { .. } => "OrderPlaced",
            Event::OrderMatched { .. } => "OrderMatched",
            Event::OrderCancelled { .. } => "OrderCancelled",
            Event::PaymentRequestCreated { .. } => "PaymentRequestCreated",
            Event::PaymentRequestFulfilled { .. } => "PaymentRequestFulfilled",
            Event::PaymentRequestCancelled { .. } => "PaymentRequestCancelled",
            Event::SwapOrderSubmitted { .. } => "SwapOrderSubmitted",
            Event::SwapOrderMatched { .. } => "SwapOrderMatched",
            Event::SwapOrderCancelled { .. } => "SwapOrderCancelled",
            Event::StakeCollected { .. } => "StakeCollected",
            Event::StakeSeized { .. } => "StakeSeized",
            Event::StakeRedistributed { .. } => "StakeRedistributed",
            Event::StakeRefunded { .. } => "StakeRefunded",
            Event::CrossStablecoinNetted { .. } => "CrossStablecoinNetted",
            Event::ParticipantDefaulted { .. } => "ParticipantDefaulted",
            Event::SettlementCompleted { .. } => "SettlementCompleted",
            Event::SettlementFailed { .. } => "SettlementFailed",
        }
    }

    /// Cycle id, for cycle-phase events
    pub fn cycle_id(&self) -> Option<u64> {
        match self {
            Event::StakeCollected { cycle_id, .. }
            | Event::StakeSeized { cycle_id, .. }
            | Event::StakeRedistributed { cycle_id, .. }
            | Event::StakeRefunded { cycle_id, .. }
            | Event::CrossStablecoinNetted { cycle_id, .. }
            | Event::ParticipantDefaulted { cycle_id, .. }
            | Event::SettlementCompleted { cycle_id, .. }
            | Event::SettlementFailed { cycle_id, .. } => Some(*cycle_id),
            _ => None,
        }
    }

    /// Participant the event concerns, if any
    pub fn user(&self) -> Option<&str> {
        match self {
            Event::UserConfigured { user, .. } => Some(user),
            Event::OrderPlaced { maker, .. } => Some(maker),
            Event::OrderCancelled { maker, .. } => Some(maker),
            Event::PaymentRequestCreated { recipient, .. } => Some(recipient),
            Event::PaymentRequestFulfilled { sender, .. } => Some(sender),
            Event::SwapOrderSubmitted { maker, .. } => Some(maker),
            Event::StakeCollected { user, .. }
            | Event::StakeSeized { user, .. }
            | Event::StakeRedistributed { user, .. }
            | Event::StakeRefunded { user, .. }
            | Event::CrossStablecoinNetted { user, .. }
            | Event::ParticipantDefaulted { user, .. } => Some(user),
            _ => None,
        }
    }
}

/// Append-only event log with convenience queries.
///
/// # Example
/// ```
/// use clearing_engine_core_rs::{Event, EventLog};
///
/// let mut log = EventLog::new();
/// log.log(Event::ParticipantDefaulted {
///     cycle_id: 1,
///     user: "carol".to_string(),
/// });
/// log.log(Event::SettlementCompleted {
///     cycle_id: 1,
///     timestamp: 10,
/// });
///
/// assert_eq!(log.len(), 2);
/// assert_eq!(log.events_for_cycle(1).len(), 2);
/// assert_eq!(log.events_of_type("SettlementCompleted").len(), 1);
/// assert_eq!(log.events_for_user("carol").len(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Vec<Event>,
}

impl EventLog {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn log(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<&Event> {
        self.events
            .iter()
            .filter(|e| e.event_type() == event_type)
            .collect()
    }

    pub fn events_for_cycle(&self, cycle_id: u64) -> Vec<&Event> {
        self.events
            .iter()
            .filter(|e| e.cycle_id() == Some(cycle_id))
            .collect()
    }

    pub fn events_for_user(&self, user: &str) -> Vec<&Event> {
        self.events
            .iter()
            .filter(|e| e.user() == Some(user))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_and_cycle_id() {
        let event = Event::SettlementCompleted {
            cycle_id: 3,
            timestamp: 1_700_000_000,
        };
        assert_eq!(event.event_type(), "SettlementCompleted");
        assert_eq!(event.cycle_id(), Some(3));

        let event = Event::SwapOrderMatched {
            swap_id_a: 1,
            swap_id_b: 2,
        };
        assert_eq!(event.cycle_id(), None);
    }

    #[test]
    fn test_log_queries() {
        let mut log = EventLog::new();
        log.log(Event::ParticipantDefaulted {
            cycle_id: 1,
            user: "carol".to_string(),
        });
        log.log(Event::SettlementCompleted {
            cycle_id: 1,
            timestamp: 10,
        });
        log.log(Event::SettlementCompleted {
            cycle_id: 2,
            timestamp: 400,
        });

        assert_eq!(log.events_for_cycle(1).len(), 2);
        assert_eq!(log.events_of_type("SettlementCompleted").len(), 2);
        assert_eq!(log.events_for_user("carol").len(), 1);
    }
}
