//! Transaction isolation levels.
//!
//! Levels form a total order. A level is compatible with every level at or
//! below it, so `Serializable` satisfies any request for `Snapshot`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Transaction isolation level.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    /// No isolation: writes go straight to the shared state.
    None,

    /// Reads may see writes other transactions have not committed.
    ReadUncommitted,

    /// Each read sees the latest committed state at the time of the read.
    ReadCommitted,

    /// Each individual read is consistent, but two reads in the same
    /// transaction may see different committed states.
    #[default]
    SnapshotRead,

    /// All reads see the state pinned when the transaction first read.
    ///
    /// Later commits by other transactions never become visible.
    Snapshot,

    /// Snapshot reads plus conflict detection on everything observed.
    ///
    /// Commit fails if a concurrent transaction wrote a statement matching
    /// any pattern this transaction read.
    Serializable,
}

impl IsolationLevel {
    /// All levels, weakest first.
    pub const ALL: [IsolationLevel; 6] = [
        IsolationLevel::None,
        IsolationLevel::ReadUncommitted,
        IsolationLevel::ReadCommitted,
        IsolationLevel::SnapshotRead,
        IsolationLevel::Snapshot,
        IsolationLevel::Serializable,
    ];

    /// Check if this level provides at least the guarantees of `other`.
    pub fn is_compatible_with(&self, other: IsolationLevel) -> bool {
        *self >= other
    }

    /// Whether a transaction at this level gets its own branch.
    pub fn is_isolated(&self) -> bool {
        *self > IsolationLevel::None
    }

    /// Check if this isolation level pins a snapshot for its lifetime.
    pub fn uses_snapshot(&self) -> bool {
        self.is_compatible_with(IsolationLevel::Snapshot)
    }

    /// Check if reads at this level must be recorded for conflict checks.
    pub fn tracks_observations(&self) -> bool {
        self.is_compatible_with(IsolationLevel::Serializable)
    }

    /// Get a human-readable description of this isolation level.
    pub fn description(&self) -> &'static str {
        match self {
            IsolationLevel::None => "Writes are applied directly without a transaction branch",
            IsolationLevel::ReadUncommitted => "Reads may see uncommitted writes",
            IsolationLevel::ReadCommitted => "Each read sees the latest committed data",
            IsolationLevel::SnapshotRead => "Each read sees a consistent committed state",
            IsolationLevel::Snapshot => {
                "All reads see a consistent snapshot from the first read"
            }
            IsolationLevel::Serializable => {
                "Snapshot reads plus conflict detection on observed patterns"
            }
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IsolationLevel::None => "NONE",
            IsolationLevel::ReadUncommitted => "READ_UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ_COMMITTED",
            IsolationLevel::SnapshotRead => "SNAPSHOT_READ",
            IsolationLevel::Snapshot => "SNAPSHOT",
            IsolationLevel::Serializable => "SERIALIZABLE",
        };
        write!(f, "{}", name)
    }
}

/// Parse isolation level from string.
impl std::str::FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .to_uppercase()
            .chars()
            .map(|c| if c == ' ' || c == '-' { '_' } else { c })
            .collect();
        match normalized.as_str() {
            "NONE" => Ok(IsolationLevel::None),
            "READ_UNCOMMITTED" | "READUNCOMMITTED" => Ok(IsolationLevel::ReadUncommitted),
            "READ_COMMITTED" | "READCOMMITTED" => Ok(IsolationLevel::ReadCommitted),
            "SNAPSHOT_READ" | "SNAPSHOTREAD" => Ok(IsolationLevel::SnapshotRead),
            "SNAPSHOT" | "REPEATABLE_READ" => Ok(IsolationLevel::Snapshot),
            "SERIALIZABLE" => Ok(IsolationLevel::Serializable),
            _ => Err(format!("unknown isolation level: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_isolation() {
        assert_eq!(IsolationLevel::default(), IsolationLevel::SnapshotRead);
    }

    #[test]
    fn test_total_order() {
        for pair in IsolationLevel::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[1].is_compatible_with(pair[0]));
            assert!(!pair[0].is_compatible_with(pair[1]));
        }
    }

    #[test]
    fn test_uses_snapshot() {
        assert!(!IsolationLevel::SnapshotRead.uses_snapshot());
        assert!(IsolationLevel::Snapshot.uses_snapshot());
        assert!(IsolationLevel::Serializable.uses_snapshot());
        assert!(!IsolationLevel::Snapshot.tracks_observations());
        assert!(IsolationLevel::Serializable.tracks_observations());
        assert!(!IsolationLevel::None.is_isolated());
    }

    #[test]
    fn test_parse_isolation() {
        assert_eq!(
            "READ COMMITTED".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::ReadCommitted
        );
        assert_eq!(
            "snapshot_read".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::SnapshotRead
        );
        assert_eq!(
            "serializable".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::Serializable
        );
        assert!("eventual".parse::<IsolationLevel>().is_err());
    }

    #[test]
    fn test_display_roundtrips_through_parse() {
        for level in IsolationLevel::ALL {
            assert_eq!(level.to_string().parse::<IsolationLevel>().unwrap(), level);
        }
    }

    #[test]
    fn test_serde_token() {
        let json = serde_json::to_string(&IsolationLevel::SnapshotRead).unwrap();
        assert_eq!(json, "\"SNAPSHOT_READ\"");
    }
}
