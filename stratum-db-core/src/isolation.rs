//! Transaction isolation levels.
//!
//! Levels form a strict ladder: a stronger level satisfies the guarantees of
//! every weaker one. A connection negotiates the requested level against the
//! store's declared supported set and uses the weakest supported level that
//! still satisfies the request.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported isolation levels, weakest to strongest
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    /// No transactional semantics; writes apply directly
    None,
    /// Reads may see pending uncommitted writes
    ReadUncommitted,
    /// Reads see only committed state
    ReadCommitted,
    /// Reads are repeatable within a transaction
    SnapshotRead,
    /// Full snapshot isolation with first-committer-wins conflict detection
    Snapshot,
    /// Snapshot isolation plus observation-based write-skew detection
    Serializable,
}

impl IsolationLevel {
    /// All levels, weakest first
    pub const ALL: [IsolationLevel; 6] = [
        IsolationLevel::None,
        IsolationLevel::ReadUncommitted,
        IsolationLevel::ReadCommitted,
        IsolationLevel::SnapshotRead,
        IsolationLevel::Snapshot,
        IsolationLevel::Serializable,
    ];

    /// True when this level satisfies the guarantees of `requested`
    pub fn is_compatible_with(self, requested: IsolationLevel) -> bool {
        self >= requested
    }

    /// True when transactions at this level run on an isolated branch
    pub fn is_isolated(self) -> bool {
        self > IsolationLevel::None
    }

    /// The weakest supported level that satisfies `requested`, if any
    pub fn closest_compatible(
        requested: IsolationLevel,
        supported: &[IsolationLevel],
    ) -> Option<IsolationLevel> {
        supported
            .iter()
            .copied()
            .filter(|level| level.is_compatible_with(requested))
            .min()
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
        f.write_str(name)
    }
}
