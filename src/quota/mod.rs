//! Quota Reservations
//!
//! Pending-usage ledger entries created before a mutating operation starts and
//! resolved exactly once by the owning task's outcome.

pub mod ledger;

pub use ledger::*;
