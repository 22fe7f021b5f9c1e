//! Transaction isolation.
//!
//! The isolation level decides two things for a branch:
//! - whether a dataset pins its base state (`Snapshot` and above)
//! - whether a sink records read patterns for conflict detection
//!   (`Serializable`)

mod isolation;

pub use isolation::IsolationLevel;
