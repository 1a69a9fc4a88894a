//! User registry: ranked accepted-token configuration and its edits.

use clearing_engine_core_rs::{
    ClearingEngine, EngineConfig, EngineError, FungibleToken, NonFungibleToken, TokenAdapter,
    TokenHub,
};

fn new_engine() -> ClearingEngine {
    let mut hub = TokenHub::new();
    for token in ["T0", "T1", "T2"] {
        hub.register(TokenAdapter::Fungible(FungibleToken::new(token.to_string())));
    }
    hub.register(TokenAdapter::NonFungible(NonFungibleToken::new(
        "BOND".to_string(),
    )));
    ClearingEngine::new(EngineConfig::default(), hub).unwrap()
}

fn tokens(list: &[&str]) -> Vec<String> {
    list.iter().map(|t| t.to_string()).collect()
}

#[test]
fn test_configure_and_snapshot() {
    let mut engine = new_engine();
    engine
        .configure_user("alice", tokens(&["T1", "T0"]))
        .unwrap();

    let config = engine.get_user_config("alice").unwrap();
    assert_eq!(config.accepted_tokens(), &["T1".to_string(), "T0".to_string()]);
    assert_eq!(config.top_preference(), "T1");
    assert!(config.accepts("T0"));
    assert!(!config.accepts("T2"));

    // Reconfiguration replaces the whole list atomically
    engine.configure_user("alice", tokens(&["T2"])).unwrap();
    assert_eq!(
        engine.get_user_config("alice").unwrap().accepted_tokens(),
        &["T2".to_string()]
    );

    let configured = engine.event_log().events_of_type("UserConfigured");
    assert_eq!(configured.len(), 2);
}

#[test]
fn test_configure_rejects_invalid_lists() {
    let mut engine = new_engine();

    assert!(matches!(
        engine.configure_user("alice", vec![]).unwrap_err(),
        EngineError::InvalidConfig(_)
    ));
    assert!(matches!(
        engine
            .configure_user("alice", tokens(&["T0", "T0"]))
            .unwrap_err(),
        EngineError::InvalidConfig(_)
    ));
    assert!(matches!(
        engine.configure_user("alice", tokens(&["T9"])).unwrap_err(),
        EngineError::InvalidConfig(_)
    ));
    // An asset ledger is not an accepted-stablecoin candidate
    assert!(matches!(
        engine
            .configure_user("alice", tokens(&["BOND"]))
            .unwrap_err(),
        EngineError::InvalidConfig(_)
    ));
    // The custody namespace is reserved
    assert!(matches!(
        engine
            .configure_user("$engine", tokens(&["T0"]))
            .unwrap_err(),
        EngineError::InvalidConfig(_)
    ));
    assert!(engine.get_user_config("alice").is_none());
}

#[test]
fn test_add_remove_and_rerank() {
    let mut engine = new_engine();
    engine.configure_user("alice", tokens(&["T0"])).unwrap();

    engine.add_accepted_token("alice", "T1".to_string()).unwrap();
    assert_eq!(
        engine.get_user_config("alice").unwrap().accepted_tokens(),
        &["T0".to_string(), "T1".to_string()]
    );

    // Duplicates rejected
    assert!(matches!(
        engine
            .add_accepted_token("alice", "T0".to_string())
            .unwrap_err(),
        EngineError::InvalidConfig(_)
    ));

    // Re-rank swaps the preference order
    engine
        .set_token_rank("alice", tokens(&["T1", "T0"]))
        .unwrap();
    assert_eq!(
        engine.get_user_config("alice").unwrap().top_preference(),
        "T1"
    );

    engine.remove_accepted_token("alice", "T0").unwrap();
    assert_eq!(
        engine.get_user_config("alice").unwrap().accepted_tokens(),
        &["T1".to_string()]
    );

    // The list must stay non-empty
    assert!(matches!(
        engine.remove_accepted_token("alice", "T1").unwrap_err(),
        EngineError::InvalidConfig(_)
    ));
    // Removing a token that is not on the list fails
    assert!(matches!(
        engine.remove_accepted_token("alice", "T2").unwrap_err(),
        EngineError::InvalidConfig(_)
    ));
}

#[test]
fn test_edits_require_configuration() {
    let mut engine = new_engine();
    assert!(matches!(
        engine
            .add_accepted_token("ghost", "T0".to_string())
            .unwrap_err(),
        EngineError::InvalidConfig(_)
    ));
    assert!(matches!(
        engine.set_token_rank("ghost", tokens(&["T0"])).unwrap_err(),
        EngineError::InvalidConfig(_)
    ));
}
