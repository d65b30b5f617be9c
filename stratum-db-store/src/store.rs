//! Storage traits the transactional layer is built on.
//!
//! A backing store is the ultimate source of truth: it produces O(1)
//! point-in-time snapshots and applies committed change-sets atomically.
//! Implementations live in their own crates (e.g. `stratum-db-memory`); this
//! crate only layers transactions on top.

use crate::changeset::Changeset;
use crate::source::Source;
use std::fmt::Debug;
use std::sync::Arc;
use stratum_db_core::{
    CloseableIter, Iri, IsolationLevel, Namespace, Resource, Result, Statement, StatementPattern,
    Value, ValueFactory,
};

/// A stable point-in-time view of a backing store's state.
///
/// Snapshots never change after creation; iterators returned from them own
/// the data they yield.
pub trait BackingSnapshot: Send + Sync {
    /// Statements matching the given positions. Unbound positions match
    /// everything; `contexts` is the variadic selection (empty means all
    /// graphs, a `None` entry the default graph).
    fn statements(
        &self,
        subject: Option<&Resource>,
        predicate: Option<&Iri>,
        object: Option<&Value>,
        contexts: &[Option<Resource>],
    ) -> Box<dyn Iterator<Item = Statement> + Send>;

    /// Distinct named contexts
    fn contexts(&self) -> Box<dyn Iterator<Item = Resource> + Send>;

    /// All namespace bindings
    fn namespaces(&self) -> Vec<Namespace>;

    /// The name bound to a prefix, if any
    fn namespace(&self, prefix: &str) -> Option<String>;

    /// Number of statements in the snapshot
    fn len(&self) -> usize;

    /// True when the snapshot holds no statements
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A backing statement store: snapshots plus atomic commits.
pub trait BackingStore: Send + Sync + Debug {
    /// A point-in-time view of the current state; O(1) and never blocking
    fn snapshot(&self) -> Arc<dyn BackingSnapshot>;

    /// Apply a change-set atomically. Durable on return for a root commit;
    /// the backing store defines the durability semantics.
    fn commit(&self, changeset: &Changeset) -> Result<()>;
}

/// Per-pattern cardinality estimates consumed by query optimizers
pub trait EvaluationStatistics: Send + Sync {
    /// Estimated number of statements matching the pattern
    fn cardinality(&self, pattern: &StatementPattern) -> f64;
}

/// The store seam the connection layer is built over.
///
/// Explicit (asserted) and inferred statements live in two independently
/// versioned sources; the connection layer unions them when a view over both
/// is requested.
pub trait StatementStore: Send + Sync {
    /// A source over explicit statements
    fn explicit_source(&self) -> Source;

    /// A source over inferred statements
    fn inferred_source(&self) -> Source;

    /// Cardinality estimates for the optimizer
    fn statistics(&self) -> Arc<dyn EvaluationStatistics>;

    /// Isolation levels this store can honor
    fn supported_isolation_levels(&self) -> Vec<IsolationLevel> {
        IsolationLevel::ALL.to_vec()
    }
}

/// The statement-algebra capability handed to query evaluators.
///
/// Implementations hold their dataset and branch open for the life of the
/// evaluation; releasing happens through the interlock adapter when the
/// result iterator closes.
pub trait TripleSource {
    /// Statements matching the given positions
    fn get_statements(
        &self,
        subject: Option<&Resource>,
        predicate: Option<&Iri>,
        object: Option<&Value>,
        contexts: &[Option<Resource>],
    ) -> Result<CloseableIter<Statement>>;

    /// The factory used to construct values for this source
    fn value_factory(&self) -> &Arc<ValueFactory>;
}
