//! Default handling, seizure, restart, and the retry cap
//!
//! Covers the default-with-restart path (S3), the terminal second
//! default, the failed-cycle retry cap on starved payment requests (S4),
//! and swap pairs reverting to unmatched after repeated failures (S6).

use clearing_engine_core_rs::{
    ClearingEngine, EngineConfig, EngineError, FungibleToken, NonFungibleToken, TokenAdapter,
    TokenHub,
};

// ============================================================================
// Test Helpers
// ============================================================================

fn new_engine(stablecoins: &[&str]) -> ClearingEngine {
    let mut hub = TokenHub::new();
    for token in stablecoins {
        hub.register(TokenAdapter::Fungible(FungibleToken::new(token.to_string())));
    }
    hub.register(TokenAdapter::NonFungible(NonFungibleToken::new(
        "BOND".to_string(),
    )));
    ClearingEngine::new(EngineConfig::default(), hub).unwrap()
}

fn fund(engine: &mut ClearingEngine, user: &str, token: &str, amount: u128) {
    let ledger = engine.tokens_mut().fungible_mut(token).unwrap();
    ledger.mint(user, amount);
    ledger.approve(user, amount);
}

fn balance(engine: &ClearingEngine, token: &str, user: &str) -> u128 {
    engine.tokens().balance_of(token, user).unwrap()
}

// ============================================================================
// S3: default with restart
// ============================================================================

#[test]
fn test_default_seizes_stake_and_restarts() {
    let mut engine = new_engine(&["T0"]);
    for user in ["alice", "bob", "carol", "dave"] {
        engine.configure_user(user, vec!["T0".to_string()]).unwrap();
    }
    // Dave's allowance covers his stake quota but not his pay-in.
    {
        let ledger = engine.tokens_mut().fungible_mut("T0").unwrap();
        ledger.mint("dave", 1_000);
        ledger.approve("dave", 200);
    }
    fund(&mut engine, "bob", "T0", 500);

    let failing = engine
        .create_payment_request("alice", Some("dave"), 1_000)
        .unwrap();
    engine.fulfill_payment_request("dave", failing, "T0").unwrap();
    let good = engine
        .create_payment_request("carol", Some("bob"), 500)
        .unwrap();
    engine.fulfill_payment_request("bob", good, "T0").unwrap();

    let report = engine.perform_settlement(10).unwrap();
    assert!(report.restarted);
    assert_eq!(report.defaulters, vec!["dave".to_string()]);
    assert_eq!(report.settled_payments, 1);

    // Dave's 200 stake was seized; the rest of his funds never moved
    assert_eq!(balance(&engine, "T0", "dave"), 800);
    // Carol received her 500; Bob paid 500 and, as the only surviving
    // participant with outgoing volume, received the seized 200
    assert_eq!(balance(&engine, "T0", "carol"), 500);
    assert_eq!(balance(&engine, "T0", "bob"), 200);
    assert_eq!(balance(&engine, "T0", "alice"), 0);
    assert_eq!(engine.tokens().custody_balance("T0").unwrap(), 0);

    // Dave's payment is carried over with one failed cycle on the clock
    let payment = engine.get_payment_request(failing).unwrap();
    assert!(payment.is_active() && payment.is_fulfilled() && !payment.is_settled());
    assert_eq!(payment.failed_cycles(), 1);
    assert!(engine.get_payment_request(good).unwrap().is_settled());

    // ParticipantDefaulted precedes the successful completion
    let events = engine.event_log().events();
    let default_pos = events
        .iter()
        .position(|e| e.event_type() == "ParticipantDefaulted")
        .unwrap();
    let completed_pos = events
        .iter()
        .position(|e| e.event_type() == "SettlementCompleted")
        .unwrap();
    assert!(default_pos < completed_pos);
    assert_eq!(engine.event_log().events_of_type("StakeSeized").len(), 1);
    assert_eq!(
        engine.event_log().events_of_type("StakeRedistributed").len(),
        1
    );
}

// ============================================================================
// Second default terminates the cycle
// ============================================================================

#[test]
fn test_second_default_rolls_back_cycle() {
    let mut engine = new_engine(&["T0"]);
    for user in ["wendy", "xavier", "zoe"] {
        engine.configure_user(user, vec!["T0".to_string()]).unwrap();
    }
    // Xavier can stake but not pay in; Zoe's books balance only while
    // Xavier's payment stands, so she defaults on the restart.
    {
        let ledger = engine.tokens_mut().fungible_mut("T0").unwrap();
        ledger.mint("xavier", 1_000);
        ledger.approve("xavier", 200);
        ledger.mint("zoe", 200);
        ledger.approve("zoe", 400);
    }

    let chain_in = engine
        .create_payment_request("zoe", Some("xavier"), 1_000)
        .unwrap();
    engine
        .fulfill_payment_request("xavier", chain_in, "T0")
        .unwrap();
    let chain_out = engine
        .create_payment_request("wendy", Some("zoe"), 1_000)
        .unwrap();
    engine.fulfill_payment_request("zoe", chain_out, "T0").unwrap();

    let err = engine.perform_settlement(10).unwrap_err();
    match err {
        EngineError::SettlementDefault { defaulters } => {
            assert_eq!(defaulters, vec!["xavier".to_string(), "zoe".to_string()]);
        }
        other => panic!("expected SettlementDefault, got {:?}", other),
    }

    // Full rollback: every balance restored, nothing settled. With no
    // surviving participant to redistribute to, the seized stake went
    // back to its contributors.
    assert_eq!(balance(&engine, "T0", "xavier"), 1_000);
    assert_eq!(balance(&engine, "T0", "zoe"), 200);
    assert_eq!(balance(&engine, "T0", "wendy"), 0);
    assert_eq!(engine.tokens().custody_balance("T0").unwrap(), 0);

    for id in [chain_in, chain_out] {
        let payment = engine.get_payment_request(id).unwrap();
        assert!(payment.is_active() && !payment.is_settled());
        assert_eq!(payment.failed_cycles(), 1);
    }

    assert_eq!(
        engine.event_log().events_of_type("ParticipantDefaulted").len(),
        2
    );
    assert_eq!(
        engine.event_log().events_of_type("SettlementFailed").len(),
        1
    );
    // The gate did not advance; the cycle may be retried immediately
    assert_eq!(engine.last_settlement_time(), None);
}

// ============================================================================
// S4: retry cap cancels a starved payment request
// ============================================================================

#[test]
fn test_retry_cap_cancels_starved_payment() {
    let mut engine = new_engine(&["T0"]);
    engine.configure_user("alice", vec!["T0".to_string()]).unwrap();
    engine.configure_user("bob", vec!["T0".to_string()]).unwrap();
    // Bob holds nothing at all; his stake fails every cycle.

    let payment = engine
        .create_payment_request("alice", Some("bob"), 1_000)
        .unwrap();
    engine.fulfill_payment_request("bob", payment, "T0").unwrap();

    engine.perform_settlement(10).unwrap();
    {
        let p = engine.get_payment_request(payment).unwrap();
        assert!(p.is_active());
        assert_eq!(p.failed_cycles(), 1);
    }

    engine.perform_settlement(400).unwrap();
    {
        let p = engine.get_payment_request(payment).unwrap();
        assert!(!p.is_active(), "request is cancelled at the retry cap");
        assert!(!p.is_settled());
        assert_eq!(p.failed_cycles(), 2);
    }
    assert_eq!(
        engine
            .event_log()
            .events_of_type("PaymentRequestCancelled")
            .len(),
        1
    );

    // Bob was never touched: no stake taken, nothing disbursed
    assert_eq!(balance(&engine, "T0", "bob"), 0);
    assert_eq!(balance(&engine, "T0", "alice"), 0);
    assert!(engine.event_log().events_of_type("StakeCollected").is_empty());
}

// ============================================================================
// S6: swap pair unmatches after repeated failures
// ============================================================================

#[test]
fn test_swap_pair_unmatches_after_retry_cap() {
    let mut engine = new_engine(&["T0", "T1"]);
    engine
        .configure_user("alice", vec!["T0".to_string(), "T1".to_string()])
        .unwrap();
    engine
        .configure_user("bob", vec!["T0".to_string(), "T1".to_string()])
        .unwrap();

    let leg_a = engine.submit_swap_order("alice", 500, "T0", 500).unwrap();
    let leg_b = engine.submit_swap_order("bob", 500, "T1", 500).unwrap();
    assert_eq!(engine.get_swap_order(leg_a).unwrap().matched_peer(), Some(leg_b));

    // Neither side can stake; the pair fails two cycles running.
    engine.perform_settlement(10).unwrap();
    assert_eq!(engine.get_swap_order(leg_a).unwrap().failed_cycles(), 1);
    assert!(engine.get_swap_order(leg_a).unwrap().is_matched());

    engine.perform_settlement(400).unwrap();

    // Both legs revert to active unmatched with a clean slate
    for id in [leg_a, leg_b] {
        let leg = engine.get_swap_order(id).unwrap();
        assert!(leg.is_active());
        assert!(!leg.is_matched());
        assert_eq!(leg.failed_cycles(), 0);
    }

    // Once funded, the same legs match and settle; equal values net to
    // zero per maker, so only stake moves and comes straight back.
    fund(&mut engine, "alice", "T0", 100);
    fund(&mut engine, "bob", "T1", 100);
    assert_eq!(engine.match_swap_orders().unwrap(), 1);
    let report = engine.perform_settlement(800).unwrap();
    assert_eq!(report.settled_swaps, 1);
    assert_eq!(balance(&engine, "T0", "alice"), 100);
    assert_eq!(balance(&engine, "T1", "bob"), 100);
    assert!(!engine.get_swap_order(leg_a).unwrap().is_active());
    assert!(!engine.get_swap_order(leg_b).unwrap().is_active());
}
