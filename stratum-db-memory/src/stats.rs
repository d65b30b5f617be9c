//! Cardinality estimates from the live index sizes.
//!
//! The estimate for a pattern is the size of the smallest index set among
//! its bound positions, falling back to the full statement count when
//! nothing is bound. Estimates track the current committed state; they are
//! hints for join ordering, not guarantees.

use crate::store::MemoryBacking;
use std::sync::Arc;
use stratum_db_core::StatementPattern;
use stratum_db_store::EvaluationStatistics;

/// Statistics over a memory backing
pub struct MemoryStatistics {
    backing: Arc<MemoryBacking>,
}

impl MemoryStatistics {
    pub fn new(backing: Arc<MemoryBacking>) -> Self {
        MemoryStatistics { backing }
    }
}

impl EvaluationStatistics for MemoryStatistics {
    fn cardinality(&self, pattern: &StatementPattern) -> f64 {
        self.backing.current().statements.candidate_len(pattern) as f64
    }
}
