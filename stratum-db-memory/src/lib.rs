//! # Stratum DB Memory
//!
//! In-memory [`StatementStore`] for Stratum DB. Explicit and inferred
//! statements live in two independently versioned backings whose snapshots
//! are `Arc`-swapped immutable states: O(1) to take and stable for as long
//! as a reader holds them.
//!
//! Durability is process-lifetime only; the root-commit atomicity contract
//! is satisfied by the state swap under the store mutex.

mod stats;
mod store;

pub use stats::MemoryStatistics;
pub use store::MemoryBacking;

use std::sync::Arc;
use stratum_db_store::{EvaluationStatistics, Source, SourceRoot, StatementStore};

/// An embeddable in-memory statement store
pub struct MemoryStore {
    explicit: Arc<MemoryBacking>,
    explicit_root: Arc<SourceRoot>,
    inferred_root: Arc<SourceRoot>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        let explicit = Arc::new(MemoryBacking::new());
        let inferred = Arc::new(MemoryBacking::new());
        MemoryStore {
            explicit_root: Arc::new(SourceRoot::new(explicit.clone())),
            inferred_root: Arc::new(SourceRoot::new(inferred)),
            explicit,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StatementStore for MemoryStore {
    fn explicit_source(&self) -> Source {
        Source::from_root(self.explicit_root.clone())
    }

    fn inferred_source(&self) -> Source {
        Source::from_root(self.inferred_root.clone())
    }

    fn statistics(&self) -> Arc<dyn EvaluationStatistics> {
        Arc::new(MemoryStatistics::new(self.explicit.clone()))
    }
}
