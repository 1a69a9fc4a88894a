//! Settlement orchestrator
//!
//! Drives the cycle state machine over the order book, registry and token
//! adapters: participant collection, stake, obligations, aggregation,
//! pay-in, asset locking, disbursement, refunds and finalization, or a
//! full rollback.

pub mod audit;
pub mod engine;

pub use audit::{canonical_digest, LedgerAudit};
pub use engine::{ClearingEngine, CyclePhase, CycleReport, EngineConfig};
