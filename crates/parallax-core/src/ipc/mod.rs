//! Inter-process communication for cross-process backends.
//!
//! Units travel as JSON files; workers are re-launched copies of the binary
//! that recorded them.

pub mod protocol;
pub mod worker;

pub use protocol::{UnitFile, UnitGroup, UnitOutcome, outcome_path};
