//! Cross-module layering behavior: branch chains, unions over separate
//! roots, and the visibility rules the dataset merge provides end to end.
//!
//! These go through the public source API only; a small in-file backing
//! store stands in for a real one.

use parking_lot::Mutex;
use std::sync::Arc;
use stratum_db_core::{Iri, IsolationLevel, Namespace, QuadModel, Resource, Result, Statement, Value};
use stratum_db_store::{
    BackingSnapshot, BackingStore, BoxedDataset, Changeset, Dataset, Source, SourceRoot,
};

fn iri(s: &str) -> Iri {
    Iri::new(format!("http://example.org/{}", s))
}

fn st(s: &str, p: &str, o: &str, c: Option<&str>) -> Statement {
    Statement::with_context(
        Resource::Iri(iri(s)),
        iri(p),
        Value::Iri(iri(o)),
        c.map(|c| Resource::Iri(iri(c))),
    )
}

#[derive(Debug, Default)]
struct TestBacking {
    state: Mutex<Arc<TestState>>,
}

#[derive(Debug, Default)]
struct TestState {
    statements: QuadModel,
    namespaces: Vec<Namespace>,
}

struct TestSnapshot(Arc<TestState>);

impl BackingStore for TestBacking {
    fn snapshot(&self) -> Arc<dyn BackingSnapshot> {
        Arc::new(TestSnapshot(self.state.lock().clone()))
    }

    fn commit(&self, changeset: &Changeset) -> Result<()> {
        let mut state = self.state.lock();
        let mut statements = if changeset.is_statement_cleared() {
            QuadModel::new()
        } else {
            let mut statements = state.statements.clone();
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
        let mut namespaces: Vec<Namespace> = if changeset.is_namespace_cleared() {
            Vec::new()
        } else {
            state
                .namespaces
                .iter()
                .filter(|ns| !changeset.removed_prefixes().contains(&ns.prefix))
                .cloned()
                .collect()
        };
        for (prefix, name) in changeset.added_namespaces() {
            namespaces.retain(|ns| ns.prefix != *prefix);
            namespaces.push(Namespace::new(prefix.clone(), name.clone()));
        }
        *state = Arc::new(TestState {
            statements,
            namespaces,
        });
        Ok(())
    }
}

impl BackingSnapshot for TestSnapshot {
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
        self.0.namespaces.clone()
    }

    fn namespace(&self, prefix: &str) -> Option<String> {
        self.0
            .namespaces
            .iter()
            .find(|ns| ns.prefix == prefix)
            .map(|ns| ns.name.clone())
    }

    fn len(&self) -> usize {
        self.0.statements.len()
    }
}

fn source() -> Source {
    Source::from_root(Arc::new(SourceRoot::new(Arc::new(TestBacking::default()))))
}

fn write(source: &Source, level: IsolationLevel, statements: &[Statement]) {
    let mut sink = source.sink(level).unwrap();
    for st in statements {
        sink.approve(st.clone()).unwrap();
    }
    sink.flush().unwrap();
    sink.close();
}

fn all(dataset: &BoxedDataset) -> Vec<Statement> {
    dataset
        .statements(None, None, None, &[])
        .collect::<Result<Vec<_>>>()
        .unwrap()
}

/// Three generations of forks each see their ancestors' pending changes and
/// nothing from their descendants.
#[test]
fn test_three_level_chain_visibility() {
    let root = source();
    write(&root, IsolationLevel::None, &[st("base", "p", "o", None)]);

    let parent = root.fork().unwrap();
    write(&parent, IsolationLevel::Snapshot, &[st("mid", "p", "o", None)]);

    let child = parent.fork().unwrap();
    write(&child, IsolationLevel::Snapshot, &[st("leaf", "p", "o", None)]);

    let child_view = child.snapshot(IsolationLevel::Snapshot).unwrap();
    assert_eq!(all(&child_view).len(), 3);

    let parent_view = parent.snapshot(IsolationLevel::ReadCommitted).unwrap();
    assert_eq!(all(&parent_view).len(), 2);

    let root_view = root.snapshot(IsolationLevel::ReadCommitted).unwrap();
    assert_eq!(all(&root_view).len(), 1);

    // Flushing bottom-up carries everything into the backing store.
    child.flush().unwrap();
    child.release();
    parent.flush().unwrap();
    parent.release();

    let final_view = root.snapshot(IsolationLevel::ReadCommitted).unwrap();
    assert_eq!(all(&final_view).len(), 3);
}

/// A deprecation staged in a child suppresses a statement pending in its
/// parent without touching the parent's own view.
#[test]
fn test_child_deprecation_masks_parent_pending() {
    let root = source();
    let parent = root.fork().unwrap();
    write(&parent, IsolationLevel::Snapshot, &[st("a", "p", "o", None)]);

    let child = parent.fork().unwrap();
    let mut sink = child.sink(IsolationLevel::Snapshot).unwrap();
    sink.deprecate(st("a", "p", "o", None)).unwrap();
    sink.flush().unwrap();
    sink.close();

    let child_view = child.snapshot(IsolationLevel::Snapshot).unwrap();
    assert!(all(&child_view).is_empty());

    let parent_view = parent.snapshot(IsolationLevel::ReadCommitted).unwrap();
    assert_eq!(all(&parent_view).len(), 1);

    child.release();
    parent.release();
}

/// A clear staged mid-chain suppresses the backing state but keeps later
/// approvals, through to the committed result.
#[test]
fn test_clear_layer_through_commit() {
    let root = source();
    write(&root, IsolationLevel::None, &[st("old", "p", "o", None)]);

    let branch = root.fork().unwrap();
    let mut sink = branch.sink(IsolationLevel::Snapshot).unwrap();
    sink.clear(&[]).unwrap();
    sink.approve(st("new", "p", "o", None)).unwrap();
    sink.flush().unwrap();
    sink.close();

    let view = branch.snapshot(IsolationLevel::Snapshot).unwrap();
    assert_eq!(all(&view), vec![st("new", "p", "o", None)]);

    branch.prepare().unwrap();
    branch.flush().unwrap();
    branch.release();

    let committed = root.snapshot(IsolationLevel::ReadCommitted).unwrap();
    assert_eq!(all(&committed), vec![st("new", "p", "o", None)]);
}

/// Namespace edits layer through a branch and land in the backing store on
/// flush.
#[test]
fn test_namespace_edits_through_branch() {
    let root = source();
    let mut seed = root.sink(IsolationLevel::None).unwrap();
    seed.set_namespace("ex", "http://example.org/").unwrap();
    seed.flush().unwrap();
    seed.close();

    let branch = root.fork().unwrap();
    let mut sink = branch.sink(IsolationLevel::Snapshot).unwrap();
    sink.remove_namespace("ex").unwrap();
    sink.set_namespace("ex2", "http://example.org/2/").unwrap();
    sink.flush().unwrap();
    sink.close();

    let view = branch.snapshot(IsolationLevel::Snapshot).unwrap();
    assert_eq!(view.namespace("ex").unwrap(), None);
    assert_eq!(
        view.namespace("ex2").unwrap(),
        Some("http://example.org/2/".to_string())
    );

    branch.flush().unwrap();
    branch.release();

    let committed = root.snapshot(IsolationLevel::ReadCommitted).unwrap();
    assert_eq!(committed.namespace("ex").unwrap(), None);
    assert_eq!(
        committed.namespace("ex2").unwrap(),
        Some("http://example.org/2/".to_string())
    );
}

/// A union over two roots reads both and routes writes to the primary; a
/// committed union shows up in new union snapshots.
#[test]
fn test_union_over_two_roots() {
    let primary = source();
    let secondary = source();
    write(&secondary, IsolationLevel::None, &[st("b", "p", "o", None)]);

    let union = Source::union(primary.fork().unwrap(), secondary.fork().unwrap());
    write(&union, IsolationLevel::Snapshot, &[st("a", "p", "o", None)]);

    let view = union.snapshot(IsolationLevel::Snapshot).unwrap();
    assert_eq!(all(&view).len(), 2);

    union.prepare().unwrap();
    union.flush().unwrap();
    union.release();

    let primary_view = primary.snapshot(IsolationLevel::ReadCommitted).unwrap();
    assert_eq!(all(&primary_view), vec![st("a", "p", "o", None)]);
    let secondary_view = secondary.snapshot(IsolationLevel::ReadCommitted).unwrap();
    assert_eq!(all(&secondary_view), vec![st("b", "p", "o", None)]);
}

/// Observations only reach the branch when the observing dataset closes,
/// and an observation-only branch flush changes nothing.
#[test]
fn test_observation_flush_on_dataset_close() {
    let root = source();
    let reader = root.fork().unwrap();

    let dataset = reader.snapshot(IsolationLevel::Serializable).unwrap();
    let p = iri("p");
    let _ = dataset.statements(None, Some(&p), None, &[]).count();

    // The sibling's commit lands before the dataset closes; the observation
    // has not been recorded on the branch yet, so this write is still
    // checked once it is.
    let writer = root.fork().unwrap();
    write(&writer, IsolationLevel::Serializable, &[st("x", "p", "o", None)]);
    writer.flush().unwrap();
    writer.release();

    drop(dataset);

    let err = reader.prepare().unwrap_err();
    assert!(err.is_conflict());
    reader.release();
}
