//! Settlement building blocks
//!
//! The orchestrator drives a cycle through three pure-bookkeeping layers:
//! - **obligations**: matched items → participants, gross outgoing, and
//!   per-(user, token) signed deltas
//! - **netting**: per-token deltas → aggregate net positions, with
//!   sum-to-zero conservation checks
//! - **stake**: quota arithmetic, the collected-stake ledger, and the
//!   pro-rata seizure redistribution used on default
//!
//! None of these touch token ledgers; all ledger movement happens in the
//! orchestrator so a cycle has a single place to unwind from.

pub mod obligations;
pub mod netting;
pub mod stake;

pub use obligations::{
    collect_gross_out, compute_obligations, item_parties, CycleItems, GrossOut, ItemRef,
};
pub use netting::NetPositions;
pub use stake::{pro_rata_shares, stake_quota, StakeLedger};
