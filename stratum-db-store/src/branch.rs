//! The branch arena: one layer of change over a parent source.
//!
//! Branches live in a slab owned by their [`SourceRoot`], indexed by
//! `BranchId`. Handles (sources, datasets, sinks) keep the root `Arc` plus
//! an id and re-validate the slot on every use; parent links are ids, never
//! back-pointers, so there is no reference cycle to manage.
//!
//! A branch accumulates flushed sink change-sets in a FIFO pending list.
//! When a change-set is flushed into a parent (or committed into the backing
//! store), it is appended to the *prepend list* of every other live branch
//! forked from that parent; that list is the raw material for serializable
//! conflict detection at `prepare()`.
//!
//! The per-source commit lock serializes flushes. `prepare()` acquires it
//! and holds it until `flush()` or `release()`, so a successful prepare
//! cannot be invalidated by a sibling commit. The arena lock is held across
//! the backing commit itself; snapshot acquisition on a sibling blocks for
//! that window, never observing a half-applied flush.

use crate::changeset::Changeset;
use crate::store::{BackingSnapshot, BackingStore};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use stratum_db_core::{Error, IsolationLevel, Result};
use tracing::trace;

pub(crate) type BranchId = usize;

type Slab = Vec<Option<BranchNode>>;

/// Mutual exclusion for flushes into one source, with explicit ownership so
/// the lock can be held across `prepare()` and `flush()` calls.
struct CommitLock {
    owner: Mutex<Option<u64>>,
    released: Condvar,
    next_token: AtomicU64,
}

impl CommitLock {
    fn new() -> Self {
        CommitLock {
            owner: Mutex::new(None),
            released: Condvar::new(),
            next_token: AtomicU64::new(1),
        }
    }

    /// Block until the lock is free, then take it; returns the owner token
    fn acquire(&self) -> u64 {
        let mut owner = self.owner.lock();
        while owner.is_some() {
            self.released.wait(&mut owner);
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        *owner = Some(token);
        token
    }

    /// Release the lock if `token` still owns it
    fn release(&self, token: u64) {
        let mut owner = self.owner.lock();
        if *owner == Some(token) {
            *owner = None;
            self.released.notify_one();
        }
    }
}

/// The view below a branch: a backing snapshot plus the change-set layers of
/// the ancestor chain, oldest first.
#[derive(Clone)]
pub(crate) struct LayerStack {
    pub snapshot: Arc<dyn BackingSnapshot>,
    pub layers: Vec<Arc<Changeset>>,
}

struct BranchNode {
    parent: Option<BranchId>,
    /// Sink change-sets flushed into this branch, FIFO
    pending: Vec<Arc<Changeset>>,
    /// Sibling change-sets committed into the parent since this branch
    /// forked; read-only once added
    prepend: Vec<Arc<Changeset>>,
    /// Parent view captured at the first snapshot under repeatable-read
    /// levels
    captured: Option<LayerStack>,
    open_datasets: usize,
    commit_token: Option<u64>,
    prepared: bool,
}

impl BranchNode {
    fn fresh(parent: Option<BranchId>) -> Self {
        BranchNode {
            parent,
            pending: Vec::new(),
            prepend: Vec::new(),
            captured: None,
            open_datasets: 0,
            commit_token: None,
            prepared: false,
        }
    }
}

/// One source stack: a backing store plus its arena of branches.
pub struct SourceRoot {
    backing: Arc<dyn BackingStore>,
    branches: Mutex<Slab>,
    commit_lock: CommitLock,
}

impl SourceRoot {
    /// Create a root over a backing store
    pub fn new(backing: Arc<dyn BackingStore>) -> Self {
        SourceRoot {
            backing,
            branches: Mutex::new(Vec::new()),
            commit_lock: CommitLock::new(),
        }
    }

    /// A point-in-time view of the backing state
    pub(crate) fn backing_snapshot(&self) -> Arc<dyn BackingSnapshot> {
        self.backing.snapshot()
    }

    /// Allocate a branch slot; O(1) apart from slot reuse
    pub(crate) fn fork_from(&self, parent: Option<BranchId>) -> Result<BranchId> {
        let mut branches = self.branches.lock();
        if let Some(pid) = parent {
            slot(&branches, pid)?;
        }
        let node = BranchNode::fresh(parent);
        let id = match branches.iter().position(Option::is_none) {
            Some(free) => {
                branches[free] = Some(node);
                free
            }
            None => {
                branches.push(Some(node));
                branches.len() - 1
            }
        };
        trace!(branch = id, parent = ?parent, "forked branch");
        Ok(id)
    }

    /// The merged view for a snapshot of `id` at `level`: the parent stack
    /// (captured once for repeatable-read levels) plus this branch's current
    /// pending change-sets. Registers an open dataset on the branch.
    pub(crate) fn snapshot_view(&self, id: BranchId, level: IsolationLevel) -> Result<LayerStack> {
        let mut branches = self.branches.lock();
        let (parent, captured) = {
            let node = slot(&branches, id)?;
            (node.parent, node.captured.clone())
        };
        let repeatable = level >= IsolationLevel::SnapshotRead;

        let below = if let (true, Some(captured)) = (repeatable, captured) {
            captured
        } else {
            let fresh = self.parent_stack(&branches, parent)?;
            if repeatable {
                slot_mut(&mut branches, id)?.captured = Some(fresh.clone());
            }
            fresh
        };

        let node = slot_mut(&mut branches, id)?;
        node.open_datasets += 1;
        let mut layers = below.layers;
        layers.extend(node.pending.iter().cloned());
        Ok(LayerStack {
            snapshot: below.snapshot,
            layers,
        })
    }

    /// The merged view below a node: the parent's captured view when it has
    /// one, otherwise recomputed down to the backing store.
    fn parent_stack(&self, branches: &Slab, parent: Option<BranchId>) -> Result<LayerStack> {
        let Some(pid) = parent else {
            return Ok(LayerStack {
                snapshot: self.backing.snapshot(),
                layers: Vec::new(),
            });
        };
        let node = slot(branches, pid)?;
        let below = match &node.captured {
            Some(captured) => captured.clone(),
            None => self.parent_stack(branches, node.parent)?,
        };
        let mut layers = below.layers;
        layers.extend(node.pending.iter().cloned());
        Ok(LayerStack {
            snapshot: below.snapshot,
            layers,
        })
    }

    /// A dataset over branch `id` was closed
    pub(crate) fn dataset_closed(&self, id: BranchId) {
        let mut branches = self.branches.lock();
        if let Some(Some(node)) = branches.get_mut(id) {
            node.open_datasets = node.open_datasets.saturating_sub(1);
        }
    }

    /// Append a flushed sink change-set to the branch's pending list
    pub(crate) fn push_changeset(&self, id: BranchId, changeset: Changeset) -> Result<()> {
        let mut branches = self.branches.lock();
        let node = slot_mut(&mut branches, id)?;
        node.pending.push(Arc::new(changeset));
        Ok(())
    }

    /// Conflict-check the branch's observations, taking the commit lock so a
    /// successful prepare cannot be invalidated before `flush()`.
    pub(crate) fn prepare(&self, id: BranchId) -> Result<()> {
        self.ensure_commit_lock(id)?;
        {
            let branches = self.branches.lock();
            check_conflicts(&branches, id)?;
        }
        let mut branches = self.branches.lock();
        slot_mut(&mut branches, id)?.prepared = true;
        Ok(())
    }

    fn ensure_commit_lock(&self, id: BranchId) -> Result<()> {
        {
            let branches = self.branches.lock();
            if slot(&branches, id)?.commit_token.is_some() {
                return Ok(());
            }
        }
        // Acquire outside the arena lock; a flushing sibling holds it the
        // other way around.
        let token = self.commit_lock.acquire();
        let mut branches = self.branches.lock();
        let alive = branches.get(id).map_or(false, Option::is_some);
        if !alive {
            drop(branches);
            self.commit_lock.release(token);
            return Err(Error::store("branch has been released"));
        }
        slot_mut(&mut branches, id)?.commit_token = Some(token);
        Ok(())
    }

    /// Merge the branch's pending change-sets FIFO and transfer the result
    /// into the parent (or commit it into the backing store for a root-level
    /// branch). Siblings forked from the same parent before this flush get
    /// the merged change-set prepended for conflict detection.
    pub(crate) fn flush(&self, id: BranchId) -> Result<()> {
        self.ensure_commit_lock(id)?;
        let result = self.flush_with_lock(id);
        let token = {
            let mut branches = self.branches.lock();
            match slot_mut(&mut branches, id) {
                Ok(node) => {
                    node.prepared = false;
                    node.commit_token.take()
                }
                Err(_) => None,
            }
        };
        if let Some(token) = token {
            self.commit_lock.release(token);
        }
        result
    }

    fn flush_with_lock(&self, id: BranchId) -> Result<()> {
        let mut branches = self.branches.lock();
        if !slot(&branches, id)?.prepared {
            check_conflicts(&branches, id)?;
        }

        let (merged, parent) = {
            let node = slot_mut(&mut branches, id)?;
            if node.pending.is_empty() {
                return Ok(());
            }
            let mut merged = Changeset::new();
            for staged in node.pending.drain(..) {
                merged.merge_from(&staged);
            }
            (merged, node.parent)
        };
        if !merged.has_changes() {
            trace!(branch = id, "dropping observation-only changeset");
            return Ok(());
        }

        let shared = Arc::new(merged);
        match parent {
            None => {
                // Atomic root commit; the arena stays locked so no sibling
                // can fork or snapshot around a half-delivered flush.
                self.backing.commit(&shared)?;
            }
            Some(pid) => {
                slot_mut(&mut branches, pid)?.pending.push(shared.clone());
            }
        }
        prepend_to_siblings(&mut branches, parent, Some(id), &shared);
        trace!(branch = id, changeset = %shared, "flushed branch");
        Ok(())
    }

    /// Discard the branch; unflushed changes are lost. No-op when already
    /// released.
    pub(crate) fn release(&self, id: BranchId) {
        let node = {
            let mut branches = self.branches.lock();
            match branches.get_mut(id) {
                Some(entry) => entry.take(),
                None => None,
            }
        };
        if let Some(node) = node {
            if let Some(token) = node.commit_token {
                self.commit_lock.release(token);
            }
            if !node.pending.is_empty() {
                trace!(
                    branch = id,
                    pending = node.pending.len(),
                    "released branch with unflushed changesets"
                );
            }
        }
    }

    /// True when the branch exists and has pending change-sets or open
    /// datasets
    pub(crate) fn is_active(&self, id: BranchId) -> bool {
        let branches = self.branches.lock();
        match branches.get(id) {
            Some(Some(node)) => !node.pending.is_empty() || node.open_datasets > 0,
            _ => false,
        }
    }

    /// Commit a change-set straight into the backing store (root-level
    /// sinks, non-isolated transactions). Live root-level branches get it
    /// prepended for conflict detection.
    pub(crate) fn commit_direct(&self, changeset: Changeset) -> Result<()> {
        if !changeset.has_changes() {
            return Ok(());
        }
        let token = self.commit_lock.acquire();
        let result = {
            let mut branches = self.branches.lock();
            match self.backing.commit(&changeset) {
                Ok(()) => {
                    let shared = Arc::new(changeset);
                    prepend_to_siblings(&mut branches, None, None, &shared);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };
        self.commit_lock.release(token);
        result
    }
}

impl std::fmt::Debug for SourceRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let live = self
            .branches
            .lock()
            .iter()
            .filter(|entry| entry.is_some())
            .count();
        f.debug_struct("SourceRoot")
            .field("backing", &self.backing)
            .field("live_branches", &live)
            .finish()
    }
}

/// Walk a branch and its ancestors, checking each one's observations against
/// the change-sets prepended to it since it forked.
fn check_conflicts(branches: &Slab, id: BranchId) -> Result<()> {
    let mut cursor = Some(id);
    while let Some(cur) = cursor {
        let node = slot(branches, cur)?;
        if !node.prepend.is_empty() {
            for staged in &node.pending {
                staged.check_observations(&node.prepend)?;
            }
        }
        cursor = node.parent;
    }
    Ok(())
}

/// Append a committed change-set to every live branch forked from `parent`,
/// excluding the flushing branch itself.
fn prepend_to_siblings(
    branches: &mut Slab,
    parent: Option<BranchId>,
    exclude: Option<BranchId>,
    shared: &Arc<Changeset>,
) {
    for (other, entry) in branches.iter_mut().enumerate() {
        if Some(other) == exclude {
            continue;
        }
        if let Some(node) = entry {
            if node.parent == parent {
                node.prepend.push(shared.clone());
            }
        }
    }
}

fn slot<'a>(branches: &'a Slab, id: BranchId) -> Result<&'a BranchNode> {
    branches
        .get(id)
        .and_then(Option::as_ref)
        .ok_or_else(|| Error::store("branch has been released"))
}

fn slot_mut<'a>(branches: &'a mut Slab, id: BranchId) -> Result<&'a mut BranchNode> {
    branches
        .get_mut(id)
        .and_then(Option::as_mut)
        .ok_or_else(|| Error::store("branch has been released"))
}
