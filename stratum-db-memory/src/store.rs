//! The in-memory backing store.
//!
//! State is an immutable `Arc<StoreState>` swapped under the store mutex on
//! commit, so snapshots are `Arc` clones: O(1), stable, and point-in-time.
//! Each commit bumps an epoch for cache differentiation and diagnostics.
//!
//! Explicit and inferred statements live in two independently versioned
//! backings; the namespace table is owned by the explicit backing (the
//! inferred one keeps statements only).

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use stratum_db_core::{Iri, Namespace, QuadModel, Resource, Result, Statement, Value};
use stratum_db_store::{BackingSnapshot, BackingStore, Changeset};
use tracing::debug;

/// Immutable store state shared by snapshots
#[derive(Debug, Default)]
pub(crate) struct StoreState {
    pub(crate) statements: QuadModel,
    pub(crate) namespaces: FxHashMap<String, String>,
}

impl StoreState {
    /// Apply a change-set: full clear, context clears, deprecations,
    /// approvals, namespace edits, in that order.
    fn apply(&self, changeset: &Changeset) -> StoreState {
        let mut statements = if changeset.is_statement_cleared() {
            QuadModel::new()
        } else {
            let mut statements = self.statements.clone();
            for ctx in changeset.deprecated_contexts() {
                statements.remove_context(ctx);
            }
            for st in changeset.deprecated().iter() {
                statements.remove(st);
            }
            statements
        };
        for st in changeset.approved().iter() {
            statements.insert(st.clone());
        }

        let mut namespaces = if changeset.is_namespace_cleared() {
            FxHashMap::default()
        } else {
            self.namespaces.clone()
        };
        for prefix in changeset.removed_prefixes() {
            namespaces.remove(prefix);
        }
        for (prefix, name) in changeset.added_namespaces() {
            namespaces.insert(prefix.clone(), name.clone());
        }

        StoreState {
            statements,
            namespaces,
        }
    }
}

/// One independently versioned statement backing
#[derive(Debug)]
pub struct MemoryBacking {
    state: Mutex<Arc<StoreState>>,
    epoch: Mutex<u64>,
}

impl MemoryBacking {
    pub fn new() -> Self {
        MemoryBacking {
            state: Mutex::new(Arc::new(StoreState::default())),
            epoch: Mutex::new(0),
        }
    }

    /// The current state; snapshots keep the returned `Arc`
    pub(crate) fn current(&self) -> Arc<StoreState> {
        self.state.lock().clone()
    }

    /// Commits applied so far
    pub fn epoch(&self) -> u64 {
        *self.epoch.lock()
    }
}

impl Default for MemoryBacking {
    fn default() -> Self {
        Self::new()
    }
}

impl BackingStore for MemoryBacking {
    fn snapshot(&self) -> Arc<dyn BackingSnapshot> {
        Arc::new(MemorySnapshot(self.current()))
    }

    fn commit(&self, changeset: &Changeset) -> Result<()> {
        let mut state = self.state.lock();
        let next = state.apply(changeset);
        *state = Arc::new(next);
        let mut epoch = self.epoch.lock();
        *epoch += 1;
        debug!(epoch = *epoch, changeset = %changeset, "committed changeset");
        Ok(())
    }
}

/// A point-in-time view of one backing's state
struct MemorySnapshot(Arc<StoreState>);

impl BackingSnapshot for MemorySnapshot {
    fn statements(
        &self,
        subject: Option<&Resource>,
        predicate: Option<&Iri>,
        object: Option<&Value>,
        contexts: &[Option<Resource>],
    ) -> Box<dyn Iterator<Item = Statement> + Send> {
        let matched: Vec<Statement> = self
            .0
            .statements
            .matching(subject, predicate, object, contexts)
            .cloned()
            .collect();
        Box::new(matched.into_iter())
    }

    fn contexts(&self) -> Box<dyn Iterator<Item = Resource> + Send> {
        let contexts: Vec<Resource> = self.0.statements.contexts().cloned().collect();
        Box::new(contexts.into_iter())
    }

    fn namespaces(&self) -> Vec<Namespace> {
        self.0
            .namespaces
            .iter()
            .map(|(prefix, name)| Namespace::new(prefix.clone(), name.clone()))
            .collect()
    }

    fn namespace(&self, prefix: &str) -> Option<String> {
        self.0.namespaces.get(prefix).cloned()
    }

    fn len(&self) -> usize {
        self.0.statements.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iri(s: &str) -> Iri {
        Iri::new(s)
    }

    fn st(s: &str, p: &str, o: &str, c: Option<&str>) -> Statement {
        Statement::with_context(
            Resource::Iri(iri(s)),
            iri(p),
            Value::Iri(iri(o)),
            c.map(|c| Resource::Iri(iri(c))),
        )
    }

    #[test]
    fn test_commit_applies_approvals_and_deprecations() {
        let backing = MemoryBacking::new();
        let mut cs = Changeset::new();
        cs.approve(st("a", "p", "o", None));
        cs.approve(st("b", "p", "o", None));
        backing.commit(&cs).unwrap();

        let mut cs2 = Changeset::new();
        cs2.deprecate(st("a", "p", "o", None));
        backing.commit(&cs2).unwrap();

        let snap = backing.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(backing.epoch(), 2);
    }

    #[test]
    fn test_snapshot_is_stable_across_commits() {
        let backing = MemoryBacking::new();
        let mut cs = Changeset::new();
        cs.approve(st("a", "p", "o", None));
        backing.commit(&cs).unwrap();

        let before = backing.snapshot();
        let mut cs2 = Changeset::new();
        cs2.approve(st("b", "p", "o", None));
        backing.commit(&cs2).unwrap();

        assert_eq!(before.len(), 1);
        assert_eq!(backing.snapshot().len(), 2);
    }

    #[test]
    fn test_statement_clear_keeps_approvals_only() {
        let backing = MemoryBacking::new();
        let mut seed = Changeset::new();
        seed.approve(st("old1", "p", "o", None));
        seed.approve(st("old2", "p", "o", Some("g")));
        backing.commit(&seed).unwrap();

        let mut cs = Changeset::new();
        cs.clear(&[]);
        cs.approve(st("new", "p", "o", None));
        backing.commit(&cs).unwrap();

        let snap = backing.snapshot();
        assert_eq!(snap.len(), 1);
        let remaining: Vec<Statement> = snap.statements(None, None, None, &[]).collect();
        assert_eq!(remaining, vec![st("new", "p", "o", None)]);
    }

    #[test]
    fn test_context_clear_removes_graph() {
        let backing = MemoryBacking::new();
        let mut seed = Changeset::new();
        seed.approve(st("s1", "p", "o", Some("g1")));
        seed.approve(st("s2", "p", "o", Some("g2")));
        backing.commit(&seed).unwrap();

        let mut cs = Changeset::new();
        cs.clear(&[Some(Resource::Iri(iri("g1")))]);
        backing.commit(&cs).unwrap();

        let snap = backing.snapshot();
        let contexts: Vec<Resource> = snap.contexts().collect();
        assert_eq!(contexts, vec![Resource::Iri(iri("g2"))]);
    }

    #[test]
    fn test_namespace_edits() {
        let backing = MemoryBacking::new();
        let mut cs = Changeset::new();
        cs.set_namespace("ex", "http://example.org/");
        backing.commit(&cs).unwrap();
        assert_eq!(
            backing.snapshot().namespace("ex"),
            Some("http://example.org/".to_string())
        );

        let mut cs2 = Changeset::new();
        cs2.clear_namespaces();
        backing.commit(&cs2).unwrap();
        assert_eq!(backing.snapshot().namespace("ex"), None);
        assert!(backing.snapshot().namespaces().is_empty());
    }
}
