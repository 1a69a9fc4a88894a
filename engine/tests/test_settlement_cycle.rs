//! Settlement cycle scenarios
//!
//! End-to-end cycles over the in-memory token adapters: a pure DvP
//! exchange, a three-party cross-stablecoin net, preference-routed
//! disbursement with fallback, and the cycle interval gate.

use clearing_engine_core_rs::{
    ClearingEngine, EngineConfig, EngineError, FungibleToken, NonFungibleToken, Quote,
    TokenAdapter, TokenHub,
};

// ============================================================================
// Test Helpers
// ============================================================================

/// Engine over the given stablecoins plus a "BOND" asset ledger.
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

/// Mint `amount` of `token` to `user` and approve the engine for it.
fn fund(engine: &mut ClearingEngine, user: &str, token: &str, amount: u128) {
    let ledger = engine.tokens_mut().fungible_mut(token).unwrap();
    ledger.mint(user, amount);
    ledger.approve(user, amount);
}

fn balance(engine: &ClearingEngine, token: &str, user: &str) -> u128 {
    engine.tokens().balance_of(token, user).unwrap()
}

// ============================================================================
// S1: pure DvP
// ============================================================================

#[test]
fn test_pure_dvp_settlement() {
    let mut engine = new_engine(&["T0"]);
    engine
        .configure_user("alice", vec!["T0".to_string()])
        .unwrap();
    engine.configure_user("bob", vec!["T0".to_string()]).unwrap();
    engine
        .tokens_mut()
        .non_fungible_mut("BOND")
        .unwrap()
        .mint(7, "alice");
    fund(&mut engine, "bob", "T0", 1_000);

    let sell = engine
        .submit_dvp_sell("alice", "BOND", 7, vec![Quote::new("T0", 1_000)], "bob")
        .unwrap();
    let buy = engine
        .submit_dvp_buy("bob", "BOND", 7, "T0", 1_000, "alice")
        .unwrap();
    assert_eq!(engine.match_dvp_orders().unwrap(), 1);

    let report = engine.perform_settlement(1_000).unwrap();
    assert_eq!(report.settled_dvp_pairs, 1);
    assert_eq!(report.participants, 2);
    assert!(report.defaulters.is_empty());
    assert!(!report.restarted);

    // Bob paid 1000, Alice received 1000, Bond#7 went Alice -> Engine -> Bob
    assert_eq!(balance(&engine, "T0", "alice"), 1_000);
    assert_eq!(balance(&engine, "T0", "bob"), 0);
    assert_eq!(
        engine.tokens().non_fungible("BOND").unwrap().owner_of(7),
        Some("bob")
    );
    assert!(!engine.get_order(buy).unwrap().is_active());
    assert!(!engine.get_order(sell).unwrap().is_active());

    // Pool drains, the gate advances
    assert_eq!(engine.tokens().custody_balance("T0").unwrap(), 0);
    assert_eq!(engine.last_settlement_time(), Some(1_000));
}

// ============================================================================
// S2: cross-stablecoin netting across DvP + payment + swap
// ============================================================================

#[test]
fn test_cross_stablecoin_netting() {
    let mut engine = new_engine(&["T0", "T1", "T2"]);
    engine
        .configure_user(
            "alice",
            vec!["T0".to_string(), "T1".to_string(), "T2".to_string()],
        )
        .unwrap();
    // Bob also accepts T1 so Carol's swap leg can match him.
    engine
        .configure_user("bob", vec!["T0".to_string(), "T1".to_string()])
        .unwrap();
    engine
        .configure_user("carol", vec!["T1".to_string(), "T0".to_string()])
        .unwrap();

    engine
        .tokens_mut()
        .non_fungible_mut("BOND")
        .unwrap()
        .mint(1, "alice");
    fund(&mut engine, "bob", "T0", 1_000);
    fund(&mut engine, "carol", "T1", 500);

    // DvP: Alice sells the asset to Bob for 1000 T0
    engine
        .submit_dvp_sell("alice", "BOND", 1, vec![Quote::new("T0", 1_000)], "bob")
        .unwrap();
    engine
        .submit_dvp_buy("bob", "BOND", 1, "T0", 1_000, "alice")
        .unwrap();
    assert_eq!(engine.match_dvp_orders().unwrap(), 1);

    // Payment: Carol pays Alice 500 T1
    let payment = engine
        .create_payment_request("alice", Some("carol"), 500)
        .unwrap();
    engine
        .fulfill_payment_request("carol", payment, "T1")
        .unwrap();

    // Swap: Bob sends 800 T0 against Carol's 800 T1 (auto-matched)
    let leg_a = engine.submit_swap_order("bob", 800, "T0", 800).unwrap();
    let leg_b = engine.submit_swap_order("carol", 800, "T1", 800).unwrap();
    assert_eq!(engine.get_swap_order(leg_a).unwrap().matched_peer(), Some(leg_b));

    // Aggregates: Alice +1500, Bob -1000, Carol -500. The swap legs offset
    // inside each maker's own position, so Bob pays 1000 and Carol 500.
    let report = engine.perform_settlement(50).unwrap();
    assert_eq!(report.settled_dvp_pairs, 1);
    assert_eq!(report.settled_payments, 1);
    assert_eq!(report.settled_swaps, 1);
    assert_eq!(report.total_disbursed, 1_500);

    // Alice is paid in preference order: 1000 T0, then 500 T1
    assert_eq!(balance(&engine, "T0", "alice"), 1_000);
    assert_eq!(balance(&engine, "T1", "alice"), 500);
    assert_eq!(balance(&engine, "T0", "bob"), 0);
    assert_eq!(balance(&engine, "T1", "carol"), 0);
    assert_eq!(
        engine.tokens().non_fungible("BOND").unwrap().owner_of(1),
        Some("bob")
    );

    for token in ["T0", "T1", "T2"] {
        assert_eq!(engine.tokens().custody_balance(token).unwrap(), 0);
    }

    // The netted disbursement is visible per slice
    let netted = engine.event_log().events_of_type("CrossStablecoinNetted");
    assert_eq!(netted.len(), 2);
    assert!(engine.get_payment_request(payment).unwrap().is_settled());
    assert!(!engine.get_swap_order(leg_a).unwrap().is_active());
    assert!(!engine.get_swap_order(leg_b).unwrap().is_active());
}

// ============================================================================
// S5: disbursement preference fallback
// ============================================================================

#[test]
fn test_disbursement_preference_fallback() {
    let mut engine = new_engine(&["T0", "T1"]);
    engine
        .configure_user("alice", vec!["T0".to_string(), "T1".to_string()])
        .unwrap();
    engine.configure_user("bob", vec!["T1".to_string()]).unwrap();
    engine
        .configure_user("carol", vec!["T0".to_string()])
        .unwrap();
    fund(&mut engine, "carol", "T0", 300);
    fund(&mut engine, "bob", "T1", 700);

    let from_carol = engine
        .create_payment_request("alice", Some("carol"), 300)
        .unwrap();
    engine
        .fulfill_payment_request("carol", from_carol, "T0")
        .unwrap();
    let from_bob = engine
        .create_payment_request("alice", Some("bob"), 700)
        .unwrap();
    engine
        .fulfill_payment_request("bob", from_bob, "T1")
        .unwrap();

    let report = engine.perform_settlement(10).unwrap();

    // Alice's preferred T0 pool only holds 300; the remainder arrives in T1
    assert_eq!(balance(&engine, "T0", "alice"), 300);
    assert_eq!(balance(&engine, "T1", "alice"), 700);
    assert_eq!(report.total_disbursed, 1_000);

    let netted = engine.event_log().events_of_type("CrossStablecoinNetted");
    assert_eq!(netted.len(), 2);

    assert_eq!(engine.tokens().custody_balance("T0").unwrap(), 0);
    assert_eq!(engine.tokens().custody_balance("T1").unwrap(), 0);
}

// ============================================================================
// Interval gate
// ============================================================================

#[test]
fn test_interval_gate_rejects_early_cycle() {
    let mut engine = new_engine(&["T0"]);
    engine.configure_user("alice", vec!["T0".to_string()]).unwrap();

    engine.perform_settlement(1_000).unwrap();
    assert_eq!(engine.last_settlement_time(), Some(1_000));

    let err = engine.perform_settlement(1_299).unwrap_err();
    assert_eq!(
        err,
        EngineError::TooSoon {
            now: 1_299,
            ready_at: 1_300
        }
    );

    // The boundary itself is allowed
    engine.perform_settlement(1_300).unwrap();
    assert_eq!(engine.last_settlement_time(), Some(1_300));
}

#[test]
fn test_stake_collected_before_disbursement_in_event_order() {
    let mut engine = new_engine(&["T0"]);
    engine.configure_user("alice", vec!["T0".to_string()]).unwrap();
    engine.configure_user("bob", vec!["T0".to_string()]).unwrap();
    fund(&mut engine, "bob", "T0", 1_000);

    let payment = engine
        .create_payment_request("alice", Some("bob"), 1_000)
        .unwrap();
    engine.fulfill_payment_request("bob", payment, "T0").unwrap();
    engine.perform_settlement(5).unwrap();

    let events = engine.event_log().events();
    let stake_pos = events
        .iter()
        .position(|e| e.event_type() == "StakeCollected")
        .unwrap();
    let netted_pos = events
        .iter()
        .position(|e| e.event_type() == "CrossStablecoinNetted")
        .unwrap();
    let completed_pos = events
        .iter()
        .position(|e| e.event_type() == "SettlementCompleted")
        .unwrap();
    assert!(stake_pos < netted_pos);
    assert!(netted_pos < completed_pos);
    assert_eq!(completed_pos, events.len() - 1);
}
