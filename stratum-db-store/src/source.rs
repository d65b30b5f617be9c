//! Sources: forkable overlays that produce datasets and sinks.
//!
//! A source is a cheap handle. The variants compose the same way the
//! connection layer consumes them:
//!
//! - a *root* source sits directly over a backing store; its sinks commit on
//!   flush and its snapshots are plain backing snapshots
//! - a *branch* source is one layer of change in the owning root's arena
//! - a *union* source presents two sources (inferred over explicit, or the
//!   reverse) as one; sinks target the primary member
//! - a *delegating* source passes everything through but never releases the
//!   underlying source, so read paths can safely borrow a transaction branch
//!
//! Forking is O(1). After `prepare()` succeeds, `flush()` cannot fail for
//! isolation-related reasons: the commit lock is held in between.

use crate::branch::{BranchId, SourceRoot};
use crate::dataset::{BoxedDataset, LayeredDataset, Observer, UnionDataset};
use crate::sink::{Sink, SinkTarget};
use std::sync::Arc;
use stratum_db_core::{IsolationLevel, Result};

/// A forkable source of statements and namespaces
#[derive(Clone)]
pub struct Source {
    inner: SourceInner,
}

#[derive(Clone)]
enum SourceInner {
    Root(Arc<SourceRoot>),
    Branch { root: Arc<SourceRoot>, id: BranchId },
    Union(Box<Source>, Box<Source>),
    Delegating(Box<Source>),
}

impl Source {
    /// A source directly over a backing store's root
    pub fn from_root(root: Arc<SourceRoot>) -> Source {
        Source {
            inner: SourceInner::Root(root),
        }
    }

    /// Present two sources as one; sinks target `primary`
    pub fn union(primary: Source, secondary: Source) -> Source {
        Source {
            inner: SourceInner::Union(Box::new(primary), Box::new(secondary)),
        }
    }

    /// A pass-through wrapper whose `release()` leaves the underlying source
    /// open
    pub fn delegating(&self) -> Source {
        Source {
            inner: SourceInner::Delegating(Box::new(self.clone())),
        }
    }

    /// Create a child branch with an empty change-set; O(1)
    pub fn fork(&self) -> Result<Source> {
        match &self.inner {
            SourceInner::Root(root) => {
                let id = root.fork_from(None)?;
                Ok(Source {
                    inner: SourceInner::Branch {
                        root: root.clone(),
                        id,
                    },
                })
            }
            SourceInner::Branch { root, id } => {
                let child = root.fork_from(Some(*id))?;
                Ok(Source {
                    inner: SourceInner::Branch {
                        root: root.clone(),
                        id: child,
                    },
                })
            }
            SourceInner::Union(primary, secondary) => {
                Ok(Source::union(primary.fork()?, secondary.fork()?))
            }
            SourceInner::Delegating(inner) => inner.fork(),
        }
    }

    /// A read view at the given isolation level. Serializable views record
    /// their read patterns as observations on the owning branch.
    pub fn snapshot(&self, level: IsolationLevel) -> Result<BoxedDataset> {
        match &self.inner {
            SourceInner::Root(root) => Ok(Box::new(LayeredDataset::new(
                root.backing_snapshot(),
                Vec::new(),
                None,
                None,
            ))),
            SourceInner::Branch { root, id } => {
                let view = root.snapshot_view(*id, level)?;
                let observer = (level >= IsolationLevel::Serializable)
                    .then(|| Observer::new(root.clone(), *id));
                Ok(Box::new(LayeredDataset::new(
                    view.snapshot,
                    view.layers,
                    Some((root.clone(), *id)),
                    observer,
                )))
            }
            SourceInner::Union(primary, secondary) => Ok(Box::new(UnionDataset::new(
                primary.snapshot(level)?,
                secondary.snapshot(level)?,
            ))),
            SourceInner::Delegating(inner) => inner.snapshot(level),
        }
    }

    /// A writer accumulating into this source's change-set
    pub fn sink(&self, level: IsolationLevel) -> Result<Sink> {
        match &self.inner {
            SourceInner::Root(root) => Ok(Sink::new(SinkTarget::Direct(root.clone()), level)),
            SourceInner::Branch { root, id } => Ok(Sink::new(
                SinkTarget::Branch {
                    root: root.clone(),
                    id: *id,
                },
                level,
            )),
            SourceInner::Union(primary, _) => primary.sink(level),
            SourceInner::Delegating(inner) => inner.sink(level),
        }
    }

    /// Run conflict detection and take the commit lock. After a successful
    /// prepare, `flush()` cannot fail for isolation-related reasons.
    pub fn prepare(&self) -> Result<()> {
        match &self.inner {
            SourceInner::Root(_) => Ok(()),
            SourceInner::Branch { root, id } => root.prepare(*id),
            SourceInner::Union(primary, secondary) => {
                primary.prepare()?;
                secondary.prepare()
            }
            SourceInner::Delegating(inner) => inner.prepare(),
        }
    }

    /// Transfer this source's accumulated change-set into its parent
    /// atomically
    pub fn flush(&self) -> Result<()> {
        match &self.inner {
            SourceInner::Root(_) => Ok(()),
            SourceInner::Branch { root, id } => root.flush(*id),
            SourceInner::Union(primary, secondary) => {
                primary.flush()?;
                secondary.flush()
            }
            SourceInner::Delegating(inner) => inner.flush(),
        }
    }

    /// Discard the source; unflushed changes are lost. No-op on a released
    /// branch and on delegating wrappers.
    pub fn release(&self) {
        match &self.inner {
            SourceInner::Root(_) => {}
            SourceInner::Branch { root, id } => root.release(*id),
            SourceInner::Union(primary, secondary) => {
                primary.release();
                secondary.release();
            }
            SourceInner::Delegating(_) => {}
        }
    }

    /// True when the source has pending change-sets or open datasets
    pub fn is_active(&self) -> bool {
        match &self.inner {
            SourceInner::Root(_) => false,
            SourceInner::Branch { root, id } => root.is_active(*id),
            SourceInner::Union(primary, secondary) => primary.is_active() || secondary.is_active(),
            SourceInner::Delegating(inner) => inner.is_active(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Dataset;
    use crate::test_support::MemBacking;
    use stratum_db_core::{Iri, Resource, Statement, Value};

    fn iri(s: &str) -> Iri {
        Iri::new(s)
    }

    fn st(s: &str, p: &str, o: &str) -> Statement {
        Statement::new(Resource::Iri(iri(s)), iri(p), Value::Iri(iri(o)))
    }

    fn root_source() -> (Arc<SourceRoot>, Source) {
        let root = Arc::new(SourceRoot::new(Arc::new(MemBacking::new())));
        (root.clone(), Source::from_root(root))
    }

    fn count(dataset: &BoxedDataset) -> usize {
        dataset
            .statements(None, None, None, &[])
            .filter(|r| r.is_ok())
            .count()
    }

    #[test]
    fn test_root_sink_commits_directly() {
        let (_, source) = root_source();
        let mut sink = source.sink(IsolationLevel::None).unwrap();
        sink.approve(st("a", "p", "o")).unwrap();
        sink.flush().unwrap();
        sink.close();

        let dataset = source.snapshot(IsolationLevel::None).unwrap();
        assert_eq!(count(&dataset), 1);
    }

    #[test]
    fn test_branch_isolates_until_flush() {
        let (_, source) = root_source();
        let branch = source.fork().unwrap();

        let mut sink = branch.sink(IsolationLevel::Snapshot).unwrap();
        sink.approve(st("a", "p", "o")).unwrap();
        sink.flush().unwrap();
        sink.close();

        // Visible inside the branch, not outside.
        let inside = branch.snapshot(IsolationLevel::Snapshot).unwrap();
        assert_eq!(count(&inside), 1);
        let outside = source.snapshot(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(count(&outside), 0);

        branch.prepare().unwrap();
        branch.flush().unwrap();
        branch.release();

        let after = source.snapshot(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(count(&after), 1);
    }

    #[test]
    fn test_snapshot_level_repeatable_read() {
        let (_, source) = root_source();
        let reader = source.fork().unwrap();

        // Capture the branch view before a sibling commits.
        let before = reader.snapshot(IsolationLevel::Snapshot).unwrap();
        assert_eq!(count(&before), 0);

        let writer = source.fork().unwrap();
        let mut sink = writer.sink(IsolationLevel::Snapshot).unwrap();
        sink.approve(st("a", "p", "o")).unwrap();
        sink.flush().unwrap();
        sink.close();
        writer.prepare().unwrap();
        writer.flush().unwrap();
        writer.release();

        // Still the captured view.
        let repeat = reader.snapshot(IsolationLevel::Snapshot).unwrap();
        assert_eq!(count(&repeat), 0);
        reader.release();

        // Read-committed views recompute.
        let fresh = source.fork().unwrap();
        let rc = fresh.snapshot(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(count(&rc), 1);
        fresh.release();
    }

    #[test]
    fn test_read_committed_sees_sibling_commits() {
        let (_, source) = root_source();
        let reader = source.fork().unwrap();
        let before = reader.snapshot(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(count(&before), 0);

        let writer = source.fork().unwrap();
        let mut sink = writer.sink(IsolationLevel::ReadCommitted).unwrap();
        sink.approve(st("a", "p", "o")).unwrap();
        sink.flush().unwrap();
        sink.close();
        writer.flush().unwrap();
        writer.release();

        let after = reader.snapshot(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(count(&after), 1);
    }

    #[test]
    fn test_serializable_observation_conflict() {
        let (_, source) = root_source();

        // Reader observes a pattern through a serializable snapshot.
        let reader = source.fork().unwrap();
        let dataset = reader.snapshot(IsolationLevel::Serializable).unwrap();
        let rdf_type = iri("rdfType");
        let painter = Value::Iri(iri("Painter"));
        let _ = dataset
            .statements(None, Some(&rdf_type), Some(&painter), &[])
            .count();
        drop(dataset); // close flushes the observation

        // Reader also stages a write so its changeset participates.
        let mut sink = reader.sink(IsolationLevel::Serializable).unwrap();
        sink.approve(st("guernica", "rdfType", "Painting")).unwrap();
        sink.flush().unwrap();
        sink.close();

        // A sibling commits a statement matching the observed pattern.
        let writer = source.fork().unwrap();
        let mut wsink = writer.sink(IsolationLevel::Serializable).unwrap();
        wsink.approve(st("picasso", "rdfType", "Painter")).unwrap();
        wsink.flush().unwrap();
        wsink.close();
        writer.prepare().unwrap();
        writer.flush().unwrap();
        writer.release();

        let err = reader.prepare().unwrap_err();
        assert!(err.is_conflict());
        reader.release();
    }

    #[test]
    fn test_prepare_then_flush_cannot_conflict() {
        let (_, source) = root_source();
        let writer = source.fork().unwrap();
        let mut sink = writer.sink(IsolationLevel::Serializable).unwrap();
        sink.approve(st("a", "p", "o")).unwrap();
        sink.flush().unwrap();
        sink.close();

        writer.prepare().unwrap();
        writer.flush().unwrap();
        writer.release();
    }

    #[test]
    fn test_disjoint_writes_do_not_conflict() {
        let (_, source) = root_source();

        let t1 = source.fork().unwrap();
        let ds = t1.snapshot(IsolationLevel::Serializable).unwrap();
        let g1 = vec![Some(Resource::Iri(iri("g1")))];
        let _ = ds.statements(None, None, None, &g1).count();
        drop(ds);
        let mut sink = t1.sink(IsolationLevel::Serializable).unwrap();
        sink.approve(Statement::with_context(
            Resource::Iri(iri("x")),
            iri("p"),
            Value::Iri(iri("o")),
            Some(Resource::Iri(iri("g1"))),
        ))
        .unwrap();
        sink.flush().unwrap();
        sink.close();

        let t2 = source.fork().unwrap();
        let mut sink2 = t2.sink(IsolationLevel::Serializable).unwrap();
        sink2
            .approve(Statement::with_context(
                Resource::Iri(iri("y")),
                iri("p"),
                Value::Iri(iri("o")),
                Some(Resource::Iri(iri("g2"))),
            ))
            .unwrap();
        sink2.flush().unwrap();
        sink2.close();
        t2.prepare().unwrap();
        t2.flush().unwrap();
        t2.release();

        // g2 write does not touch the g1 observation.
        t1.prepare().unwrap();
        t1.flush().unwrap();
        t1.release();
    }

    #[test]
    fn test_release_is_idempotent_and_discards() {
        let (_, source) = root_source();
        let branch = source.fork().unwrap();
        let mut sink = branch.sink(IsolationLevel::Snapshot).unwrap();
        sink.approve(st("a", "p", "o")).unwrap();
        sink.flush().unwrap();
        sink.close();

        branch.release();
        branch.release(); // no-op

        let dataset = source.snapshot(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(count(&dataset), 0);
    }

    #[test]
    fn test_union_source_reads_both_writes_primary() {
        let (_, primary) = root_source();
        let (_, secondary) = root_source();

        let mut seed = secondary.sink(IsolationLevel::None).unwrap();
        seed.approve(st("b", "p", "o")).unwrap();
        seed.flush().unwrap();
        seed.close();

        let union = Source::union(primary.clone(), secondary.clone());
        let mut sink = union.sink(IsolationLevel::None).unwrap();
        sink.approve(st("a", "p", "o")).unwrap();
        sink.flush().unwrap();
        sink.close();

        let dataset = union.snapshot(IsolationLevel::None).unwrap();
        assert_eq!(count(&dataset), 2);

        // The write landed in the primary only.
        let p = primary.snapshot(IsolationLevel::None).unwrap();
        assert_eq!(count(&p), 1);
        let s = secondary.snapshot(IsolationLevel::None).unwrap();
        assert_eq!(count(&s), 1);
    }

    #[test]
    fn test_delegating_release_keeps_underlying_alive() {
        let (_, source) = root_source();
        let branch = source.fork().unwrap();
        let mut sink = branch.sink(IsolationLevel::Snapshot).unwrap();
        sink.approve(st("a", "p", "o")).unwrap();
        sink.flush().unwrap();
        sink.close();

        let delegate = branch.delegating();
        delegate.release();

        // Branch still holds its pending changeset.
        let inside = branch.snapshot(IsolationLevel::Snapshot).unwrap();
        assert_eq!(count(&inside), 1);
        branch.release();
    }

    #[test]
    fn test_nested_fork_sees_parent_pending() {
        let (_, source) = root_source();
        let parent = source.fork().unwrap();
        let mut sink = parent.sink(IsolationLevel::Snapshot).unwrap();
        sink.approve(st("a", "p", "o")).unwrap();
        sink.flush().unwrap();
        sink.close();

        let child = parent.fork().unwrap();
        let dataset = child.snapshot(IsolationLevel::Snapshot).unwrap();
        assert_eq!(count(&dataset), 1);

        // Child flush lands in the parent, not the backing store.
        let mut csink = child.sink(IsolationLevel::Snapshot).unwrap();
        csink.approve(st("b", "p", "o")).unwrap();
        csink.flush().unwrap();
        csink.close();
        child.flush().unwrap();
        child.release();

        let parent_view = parent.snapshot(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(count(&parent_view), 2);
        let outside = source.snapshot(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(count(&outside), 0);
        parent.release();
    }
}
