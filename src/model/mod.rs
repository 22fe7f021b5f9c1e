//! Statement data model.
//!
//! Terms are opaque comparable values; the store only needs equality,
//! ordering and hashing over them. Patterns use `None` as a wildcard.

mod pattern;
mod types;

pub use pattern::Pattern;
pub use types::{Namespace, Statement, Term};
