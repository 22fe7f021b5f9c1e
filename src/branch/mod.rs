//! Branches - copy-on-write layers over a source.
//!
//! A [`Branch`] buffers flushed [`Changeset`]s over a parent source and
//! replays them into the parent when flushed itself. Reads are served by
//! stacking one overlay per history entry on top of the parent's view:
//!
//! ```text
//!   ObservingDataset        (serializable reads only)
//!         │
//!   OverlayDataset (newest changeset)
//!         │
//!   OverlayDataset (oldest changeset)
//!         │
//!   PinnedDataset / parent dataset
//! ```
//!
//! [`UnionSource`] joins two sources, e.g. asserted and inferred
//! statements, into one.

mod branch;
mod changeset;
mod decorators;
mod overlay;
mod union;

pub use branch::{Branch, HistoryEntry};
pub(crate) use changeset::Delta;
pub use changeset::Changeset;
pub use decorators::{ObservingDataset, PinnedDataset};
pub use overlay::OverlayDataset;
pub use union::UnionSource;
