//! Domain models for the clearing engine

pub mod event;
pub mod order;
pub mod payment;
pub mod swap;
pub mod user;

// Re-exports
pub use event::{Event, EventLog};
pub use order::{DvpOrder, Quote, Side};
pub use payment::PaymentRequest;
pub use swap::SwapOrder;
pub use user::UserConfig;

/// Participant identifier.
pub type UserId = String;

/// Largest amount accepted at submission time.
///
/// Chosen so that any realistic cycle-wide combination of amounts fits
/// i128 with checked arithmetic; larger submissions are rejected with
/// `InvalidAmount` rather than risking overflow at netting time.
pub const MAX_AMOUNT: u128 = 1 << 100;
