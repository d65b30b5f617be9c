//! The client-facing connection.
//!
//! A connection composes two parallel branch stacks (explicit and inferred)
//! and exposes them as one store. It owns the transaction lifecycle
//! (Open → Active → Prepared → back to Open), the buffered-update table
//! keyed by update context, the inferred-statement protocol, change
//! notification, and the active-iteration registry.
//!
//! ## Locks
//!
//! - the connection lock: public operations hold it shared, `close()`
//!   exclusively
//! - the update lock: mutual exclusion across begin/commit/rollback and each
//!   write operation
//! - the inner state mutex, always taken after the other two
//!
//! The per-source commit lock lives in the store layer.

use crate::iterations::IterationRegistry;
use crate::listener::{ConnectionListener, ListenerSet};
use crate::triple_source::ConnectionTripleSource;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::panic::Location;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stratum_db_core::{
    CloseableIter, Error, Iri, IsolationLevel, Namespace, Resource, Result, Statement,
    StoreConfig, Value, ValueFactory,
};
use stratum_db_store::{
    BoxedDataset, EvaluationStatistics, Sink, Source, StatementStore,
};
use tracing::{debug, warn};

/// Opaque handle for one outstanding update operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UpdateContext {
    id: u64,
}

/// A buffered removal; unbound positions are wildcards, an empty context
/// selection means all graphs.
struct RemovePattern {
    subject: Option<Resource>,
    predicate: Option<Iri>,
    object: Option<Value>,
    contexts: Vec<Option<Resource>>,
}

/// Per-update-context state: the pre-state dataset/sink pair (created
/// eagerly for explicit contexts, lazily for the anonymous one) plus the
/// pending buffers.
#[derive(Default)]
struct OpState {
    dataset: Option<BoxedDataset>,
    sink: Option<Sink>,
    source: Option<Source>,
    added: Vec<Statement>,
    removed: Vec<RemovePattern>,
    buffered: usize,
}

/// The inferred-statement working set: inferred dataset + sink plus the
/// explicit-only dataset used to suppress already-explicit facts.
struct InferredOp {
    dataset: BoxedDataset,
    sink: Sink,
    explicit_dataset: BoxedDataset,
    source: Source,
    explicit_source: Source,
}

#[derive(Default)]
struct Inner {
    open: bool,
    txn_active: bool,
    txn_prepared: bool,
    isolation: Option<IsolationLevel>,
    doomed: Option<Error>,
    explicit_branch: Option<Source>,
    inferred_branch: Option<Source>,
    union_branch: Option<Source>,
    ops: FxHashMap<Option<u64>, OpState>,
    inferred_op: Option<InferredOp>,
    next_op_id: u64,
}

/// A client connection to a statement store
pub struct Connection {
    store: Arc<dyn StatementStore>,
    config: StoreConfig,
    supported_levels: Vec<IsolationLevel>,
    value_factory: Arc<ValueFactory>,
    connection_lock: RwLock<()>,
    update_lock: Mutex<()>,
    inner: Mutex<Inner>,
    iterations: IterationRegistry,
    listeners: ListenerSet,
}

impl Connection {
    /// Open a connection over a store
    pub fn new(store: Arc<dyn StatementStore>, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let supported_levels = if config.supported_isolation_levels.is_empty() {
            store.supported_isolation_levels()
        } else {
            config.supported_isolation_levels.clone()
        };
        let iterations =
            IterationRegistry::new(config.track_resource_sites, config.leak_collection_interval_ms);
        Ok(Connection {
            store,
            config,
            supported_levels,
            value_factory: Arc::new(ValueFactory::new()),
            connection_lock: RwLock::new(()),
            update_lock: Mutex::new(()),
            inner: Mutex::new(Inner {
                open: true,
                ..Inner::default()
            }),
            iterations,
            listeners: ListenerSet::default(),
        })
    }

    /// The factory used to construct values for this connection
    pub fn value_factory(&self) -> &Arc<ValueFactory> {
        &self.value_factory
    }

    /// Cardinality statistics of the underlying store
    pub fn statistics(&self) -> Arc<dyn EvaluationStatistics> {
        self.store.statistics()
    }

    /// Register a change listener
    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.add(listener);
    }

    /// Remove a previously registered listener
    pub fn remove_listener(&self, listener: &Arc<dyn ConnectionListener>) {
        self.listeners.remove(listener);
    }

    /// True until `close()`
    pub fn is_open(&self) -> bool {
        self.inner.lock().open
    }

    /// True while a transaction is active
    pub fn is_active(&self) -> bool {
        self.inner.lock().txn_active
    }

    // ------------------------------------------------------------------
    // Transaction lifecycle
    // ------------------------------------------------------------------

    /// Begin a transaction at the default isolation level
    pub fn begin(&self) -> Result<()> {
        self.begin_with(self.config.default_isolation_level)
    }

    /// Begin a transaction, clamping the requested level to the weakest
    /// supported level that still satisfies it
    pub fn begin_with(&self, requested: IsolationLevel) -> Result<()> {
        let level = IsolationLevel::closest_compatible(requested, &self.supported_levels)
            .ok_or_else(|| Error::UnsupportedIsolation(requested.to_string()))?;

        let _conn = self.connection_lock.read();
        let _update = self.update_lock.lock();
        let mut inner = self.inner.lock();
        verify_open(&inner)?;
        if inner.txn_active {
            return Err(Error::TransactionActive);
        }

        if level.is_isolated() {
            let explicit = self.store.explicit_source().fork()?;
            let inferred = self.store.inferred_source().fork()?;
            inner.union_branch = Some(Source::union(inferred.clone(), explicit.clone()));
            inner.explicit_branch = Some(explicit);
            inner.inferred_branch = Some(inferred);
        }
        inner.isolation = Some(level);
        inner.txn_active = true;
        inner.txn_prepared = false;
        inner.ops.insert(None, OpState::default());
        debug!(%level, "transaction started");
        Ok(())
    }

    /// Run conflict detection; a success guarantees `commit()` cannot fail
    /// for isolation reasons
    pub fn prepare(&self) -> Result<()> {
        self.flush_updates()?;
        let _conn = self.connection_lock.read();
        let _update = self.update_lock.lock();
        let mut inner = self.inner.lock();
        verify_open(&inner)?;
        if inner.txn_active {
            check_doomed(&inner)?;
            if let Some(union) = &inner.union_branch {
                union.prepare()?;
            }
            inner.txn_prepared = true;
        }
        Ok(())
    }

    /// Commit the active transaction, preparing implicitly when needed. Any
    /// failure rolls the transaction back; the connection stays open with
    /// all buffers cleared.
    pub fn commit(&self) -> Result<()> {
        if self.is_active() {
            if let Err(e) = self.flush_updates() {
                let _conn = self.connection_lock.read();
                let _update = self.update_lock.lock();
                let mut inner = self.inner.lock();
                if inner.txn_active {
                    rollback_internal(&mut inner);
                }
                return Err(e);
            }
        }
        let _conn = self.connection_lock.read();
        let _update = self.update_lock.lock();
        let mut inner = self.inner.lock();
        verify_open(&inner)?;
        if !inner.txn_active {
            return Ok(());
        }
        if let Some(doom) = inner.doomed.clone() {
            rollback_internal(&mut inner);
            return Err(doom);
        }

        let commit_result = (|| -> Result<()> {
            if let Some(union) = &inner.union_branch {
                if !inner.txn_prepared {
                    union.prepare()?;
                }
                union.flush()?;
            }
            Ok(())
        })();

        match commit_result {
            Ok(()) => {
                if let Some(union) = inner.union_branch.take() {
                    union.release();
                }
                inner.explicit_branch = None;
                inner.inferred_branch = None;
                inner.txn_active = false;
                inner.txn_prepared = false;
                inner.isolation = None;
                inner.ops.clear();
                debug!("transaction committed");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "commit failed, rolling back");
                rollback_internal(&mut inner);
                Err(e)
            }
        }
    }

    /// Discard the active transaction's staged changes. A no-op without an
    /// active transaction.
    pub fn rollback(&self) -> Result<()> {
        let _conn = self.connection_lock.read();
        let _update = self.update_lock.lock();
        let mut inner = self.inner.lock();
        verify_open(&inner)?;
        if inner.txn_active {
            rollback_internal(&mut inner);
        }
        Ok(())
    }

    /// Close the connection. Force-closes leftover iterations and rolls back
    /// an active transaction with a warning. Idempotent.
    pub fn close(&self) -> Result<()> {
        let _conn = self.connection_lock.write();
        let mut inner = self.inner.lock();
        if !inner.open {
            return Ok(());
        }
        self.iterations.force_close_all();
        if inner.txn_active {
            warn!("rolling back transaction due to connection close");
            rollback_internal(&mut inner);
        }
        inner.open = false;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Statements matching the given positions. The returned iteration owns
    /// a snapshot and must be closed.
    #[track_caller]
    pub fn statements(
        &self,
        subject: Option<&Resource>,
        predicate: Option<&Iri>,
        object: Option<&Value>,
        include_inferred: bool,
        contexts: &[Option<Resource>],
    ) -> Result<CloseableIter<Statement>> {
        let site = Location::caller();
        self.flush_pending_updates()?;
        let _conn = self.connection_lock.read();
        let (branch, level) = {
            let inner = self.inner.lock();
            verify_open(&inner)?;
            check_doomed(&inner)?;
            (self.branch(&inner, include_inferred)?, self.current_level(&inner))
        };
        self.open_iteration(branch, level, site, move |dataset| {
            dataset.statements(subject, predicate, object, contexts)
        })
    }

    /// True when at least one statement matches
    pub fn has_statement(
        &self,
        subject: Option<&Resource>,
        predicate: Option<&Iri>,
        object: Option<&Value>,
        include_inferred: bool,
        contexts: &[Option<Resource>],
    ) -> Result<bool> {
        let mut iter = self.statements(subject, predicate, object, include_inferred, contexts)?;
        let found = iter.next()?.is_some();
        iter.close()?;
        Ok(found)
    }

    /// The number of distinct explicit statements in the selected contexts
    #[track_caller]
    pub fn size(&self, contexts: &[Option<Resource>]) -> Result<usize> {
        let mut iter = self.statements(None, None, None, false, contexts)?;
        Ok(iter.collect_all()?.len())
    }

    /// Distinct named contexts
    #[track_caller]
    pub fn contexts(&self) -> Result<CloseableIter<Resource>> {
        let site = Location::caller();
        self.flush_pending_updates()?;
        let _conn = self.connection_lock.read();
        let (branch, level) = {
            let inner = self.inner.lock();
            verify_open(&inner)?;
            check_doomed(&inner)?;
            (self.branch(&inner, false)?, self.current_level(&inner))
        };
        self.open_iteration(branch, level, site, |dataset| dataset.contexts())
    }

    /// All namespace bindings
    #[track_caller]
    pub fn namespaces(&self) -> Result<CloseableIter<Namespace>> {
        let site = Location::caller();
        let _conn = self.connection_lock.read();
        let (branch, level) = {
            let inner = self.inner.lock();
            verify_open(&inner)?;
            (self.branch(&inner, false)?, self.current_level(&inner))
        };
        self.open_iteration(branch, level, site, |dataset| dataset.namespaces())
    }

    /// The name bound to a prefix, if any
    pub fn namespace(&self, prefix: &str) -> Result<Option<String>> {
        let _conn = self.connection_lock.read();
        let (branch, level) = {
            let inner = self.inner.lock();
            verify_open(&inner)?;
            (self.branch(&inner, false)?, self.current_level(&inner))
        };
        let mut dataset = branch.snapshot(level)?;
        let result = dataset.namespace(prefix);
        let closed = dataset.close();
        branch.release();
        closed?;
        result
    }

    /// A statement-algebra capability over a consistent snapshot; the
    /// evaluator interlocks it with its result iterator
    pub fn triple_source(&self, include_inferred: bool) -> Result<ConnectionTripleSource> {
        self.flush_pending_updates()?;
        let _conn = self.connection_lock.read();
        let (branch, level) = {
            let inner = self.inner.lock();
            verify_open(&inner)?;
            check_doomed(&inner)?;
            (self.branch(&inner, include_inferred)?, self.current_level(&inner))
        };
        let dataset = match branch.snapshot(level) {
            Ok(dataset) => dataset,
            Err(e) => {
                branch.release();
                return Err(e);
            }
        };
        Ok(ConnectionTripleSource::new(
            dataset,
            branch,
            self.value_factory.clone(),
            self.deadline(),
        ))
    }

    // ------------------------------------------------------------------
    // Updates
    // ------------------------------------------------------------------

    /// Begin an explicit update operation with its own consistent pre-state
    pub fn start_update(&self) -> Result<UpdateContext> {
        self.flush_pending_updates()?;
        let _conn = self.connection_lock.read();
        let _update = self.update_lock.lock();
        let mut inner = self.inner.lock();
        verify_open(&inner)?;
        verify_active(&inner)?;

        let level = self.current_level(&inner);
        let source = self.branch(&inner, false)?;
        let dataset = source.snapshot(level)?;
        let sink = source.sink(level)?;

        inner.next_op_id += 1;
        let id = inner.next_op_id;
        inner.ops.insert(
            Some(id),
            OpState {
                dataset: Some(dataset),
                sink: Some(sink),
                source: Some(source),
                ..OpState::default()
            },
        );
        Ok(UpdateContext { id })
    }

    /// Realize and flush an explicit update operation
    pub fn end_update(&self, op: UpdateContext) -> Result<()> {
        {
            let _conn = self.connection_lock.read();
            let _update = self.update_lock.lock();
            let mut inner = self.inner.lock();
            verify_open(&inner)?;
            verify_active(&inner)?;
            self.end_update_internal(&mut inner, Some(op.id))?;
        }
        self.flush_updates()
    }

    /// Realize the anonymous update and restart it, making buffered writes
    /// visible to subsequent reads in this transaction
    pub fn flush_updates(&self) -> Result<()> {
        let _conn = self.connection_lock.read();
        let _update = self.update_lock.lock();
        let mut inner = self.inner.lock();
        verify_open(&inner)?;
        if !inner.txn_active {
            return Ok(());
        }
        self.end_update_internal(&mut inner, None)?;
        inner.ops.insert(None, OpState::default());
        Ok(())
    }

    /// Buffer a statement addition in the anonymous update
    pub fn add_statement(
        &self,
        subject: Resource,
        predicate: Iri,
        object: Value,
        contexts: &[Option<Resource>],
    ) -> Result<()> {
        self.add_statement_to(None, subject, predicate, object, contexts)
    }

    /// Buffer a statement addition in an explicit update operation
    pub fn add_statement_in(
        &self,
        op: UpdateContext,
        subject: Resource,
        predicate: Iri,
        object: Value,
        contexts: &[Option<Resource>],
    ) -> Result<()> {
        self.add_statement_to(Some(op.id), subject, predicate, object, contexts)
    }

    fn add_statement_to(
        &self,
        key: Option<u64>,
        subject: Resource,
        predicate: Iri,
        object: Value,
        contexts: &[Option<Resource>],
    ) -> Result<()> {
        let _conn = self.connection_lock.read();
        let _update = self.update_lock.lock();
        let mut inner = self.inner.lock();
        verify_open(&inner)?;
        verify_active(&inner)?;
        check_doomed(&inner)?;

        let op = inner
            .ops
            .get_mut(&key)
            .ok_or_else(|| Error::store("unknown update context"))?;
        if contexts.is_empty() {
            op.added
                .push(Statement::new(subject, predicate, object));
            op.buffered += 1;
        } else {
            for ctx in contexts {
                op.added.push(Statement::with_context(
                    subject.clone(),
                    predicate.clone(),
                    object.clone(),
                    ctx.clone(),
                ));
                op.buffered += 1;
            }
        }
        self.auto_flush(&mut inner, key)
    }

    /// Buffer a removal in the anonymous update; unbound positions are
    /// wildcards and an empty context selection means all graphs
    pub fn remove_statements(
        &self,
        subject: Option<&Resource>,
        predicate: Option<&Iri>,
        object: Option<&Value>,
        contexts: &[Option<Resource>],
    ) -> Result<()> {
        self.flush_pending_updates()?;
        self.remove_statements_from(None, subject, predicate, object, contexts)
    }

    /// Buffer a removal in an explicit update operation
    pub fn remove_statements_in(
        &self,
        op: UpdateContext,
        subject: Option<&Resource>,
        predicate: Option<&Iri>,
        object: Option<&Value>,
        contexts: &[Option<Resource>],
    ) -> Result<()> {
        self.remove_statements_from(Some(op.id), subject, predicate, object, contexts)
    }

    fn remove_statements_from(
        &self,
        key: Option<u64>,
        subject: Option<&Resource>,
        predicate: Option<&Iri>,
        object: Option<&Value>,
        contexts: &[Option<Resource>],
    ) -> Result<()> {
        let _conn = self.connection_lock.read();
        let _update = self.update_lock.lock();
        let mut inner = self.inner.lock();
        verify_open(&inner)?;
        verify_active(&inner)?;
        check_doomed(&inner)?;

        let op = inner
            .ops
            .get_mut(&key)
            .ok_or_else(|| Error::store("unknown update context"))?;
        op.removed.push(RemovePattern {
            subject: subject.cloned(),
            predicate: predicate.cloned(),
            object: object.cloned(),
            contexts: contexts.to_vec(),
        });
        op.buffered += 1;
        self.auto_flush(&mut inner, key)
    }

    /// Clear the selected contexts (all statements when the selection is
    /// empty)
    pub fn clear(&self, contexts: &[Option<Resource>]) -> Result<()> {
        self.flush_pending_updates()?;
        let _conn = self.connection_lock.read();
        let _update = self.update_lock.lock();
        let mut inner = self.inner.lock();
        verify_open(&inner)?;
        verify_active(&inner)?;
        check_doomed(&inner)?;

        let level = self.current_level(&inner);
        let source = self.branch(&inner, false)?;
        let mut dataset = source.snapshot(level)?;
        let mut sink = source.sink(level)?;
        let result = (|| -> Result<()> {
            if !self.listeners.is_empty() {
                let mut matched = dataset.statements(None, None, None, contexts);
                while let Some(st) = matched.next().transpose()? {
                    self.listeners.notify_removed(&st);
                }
            }
            sink.clear(contexts)?;
            sink.flush()
        })();
        sink.close();
        let closed = dataset.close();
        source.release();
        if let Err(e) = &result {
            note_doom(&mut inner, e);
        }
        result.and(closed)
    }

    // ------------------------------------------------------------------
    // Namespace updates
    // ------------------------------------------------------------------

    /// Bind a namespace prefix
    pub fn set_namespace(&self, prefix: &str, name: &str) -> Result<()> {
        self.namespace_update(|sink| sink.set_namespace(prefix, name))
    }

    /// Remove a namespace binding
    pub fn remove_namespace(&self, prefix: &str) -> Result<()> {
        self.namespace_update(|sink| sink.remove_namespace(prefix))
    }

    /// Remove all namespace bindings
    pub fn clear_namespaces(&self) -> Result<()> {
        self.namespace_update(|sink| sink.clear_namespaces())
    }

    fn namespace_update(&self, edit: impl FnOnce(&mut Sink) -> Result<()>) -> Result<()> {
        let _conn = self.connection_lock.read();
        let _update = self.update_lock.lock();
        let mut inner = self.inner.lock();
        verify_open(&inner)?;
        verify_active(&inner)?;
        check_doomed(&inner)?;

        let level = self.current_level(&inner);
        let source = self.branch(&inner, false)?;
        let mut sink = source.sink(level)?;
        let result = edit(&mut sink).and_then(|_| sink.flush());
        sink.close();
        source.release();
        if let Err(e) = &result {
            note_doom(&mut inner, e);
        }
        result
    }

    // ------------------------------------------------------------------
    // Inferred statements
    // ------------------------------------------------------------------

    /// Add an inferred statement. Returns `true` only when the statement was
    /// neither already explicit nor already inferred; listeners are notified
    /// exactly once per newly inferred fact.
    pub fn add_inferred_statement(
        &self,
        subject: Resource,
        predicate: Iri,
        object: Value,
        contexts: &[Option<Resource>],
    ) -> Result<bool> {
        let _conn = self.connection_lock.read();
        let _update = self.update_lock.lock();
        let mut inner = self.inner.lock();
        verify_open(&inner)?;
        verify_active(&inner)?;
        check_doomed(&inner)?;
        self.ensure_inferred_op(&mut inner)?;

        let Some(op) = inner.inferred_op.as_mut() else {
            return Err(Error::store("inferred operation unavailable"));
        };
        let mut modified = false;
        let targets: Vec<Option<Resource>> = if contexts.is_empty() {
            vec![None]
        } else {
            contexts.to_vec()
        };
        for ctx in targets {
            let st = Statement::with_context(
                subject.clone(),
                predicate.clone(),
                object.clone(),
                ctx,
            );
            let selection = std::slice::from_ref(&st.context);
            let already_explicit = op.explicit_dataset.has_statement(
                Some(&st.subject),
                Some(&st.predicate),
                Some(&st.object),
                selection,
            )?;
            if already_explicit {
                continue;
            }
            let already_inferred = op.dataset.has_statement(
                Some(&st.subject),
                Some(&st.predicate),
                Some(&st.object),
                selection,
            )? || op.sink.staged().approved().contains(&st);
            if !already_inferred {
                self.listeners.notify_added(&st);
                modified = true;
            }
            op.sink.approve(st)?;
        }
        Ok(modified)
    }

    /// Remove inferred statements matching the bound positions. Returns
    /// `true` when anything was removed.
    pub fn remove_inferred_statement(
        &self,
        subject: &Resource,
        predicate: &Iri,
        object: &Value,
        contexts: &[Option<Resource>],
    ) -> Result<bool> {
        let _conn = self.connection_lock.read();
        let _update = self.update_lock.lock();
        let mut inner = self.inner.lock();
        verify_open(&inner)?;
        verify_active(&inner)?;
        check_doomed(&inner)?;
        self.ensure_inferred_op(&mut inner)?;

        let Some(op) = inner.inferred_op.as_mut() else {
            return Err(Error::store("inferred operation unavailable"));
        };
        let mut removed = false;
        let mut matched = op
            .dataset
            .statements(Some(subject), Some(predicate), Some(object), contexts);
        while let Some(st) = matched.next().transpose()? {
            op.sink.deprecate(st.clone())?;
            self.listeners.notify_removed(&st);
            removed = true;
        }
        Ok(removed)
    }

    /// Clear inferred statements in the selected contexts
    pub fn clear_inferred(&self, contexts: &[Option<Resource>]) -> Result<()> {
        let _conn = self.connection_lock.read();
        let _update = self.update_lock.lock();
        let mut inner = self.inner.lock();
        verify_open(&inner)?;
        verify_active(&inner)?;
        check_doomed(&inner)?;
        self.ensure_inferred_op(&mut inner)?;

        let has_listeners = !self.listeners.is_empty();
        let Some(op) = inner.inferred_op.as_mut() else {
            return Err(Error::store("inferred operation unavailable"));
        };
        if has_listeners {
            let mut matched = op.dataset.statements(None, None, None, contexts);
            while let Some(st) = matched.next().transpose()? {
                self.listeners.notify_removed(&st);
            }
        }
        op.sink.clear(contexts)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn deadline(&self) -> Option<Instant> {
        if self.config.max_execution_time_ms == 0 {
            None
        } else {
            Some(Instant::now() + Duration::from_millis(self.config.max_execution_time_ms))
        }
    }

    fn current_level(&self, inner: &Inner) -> IsolationLevel {
        if inner.txn_active {
            inner
                .isolation
                .unwrap_or(self.config.default_isolation_level)
        } else {
            self.config.default_isolation_level
        }
    }

    /// Branch selection for reads: the transaction branch when isolated, a
    /// pass-through over the store sources when not, a fresh fork outside a
    /// transaction.
    fn branch(&self, inner: &Inner, include_inferred: bool) -> Result<Source> {
        let active = inner.txn_active;
        let isolated = inner
            .isolation
            .map_or(false, IsolationLevel::is_isolated);
        match (active && isolated, include_inferred) {
            (true, true) => inner
                .union_branch
                .as_ref()
                .map(Source::delegating)
                .ok_or_else(|| Error::store("transaction branch missing")),
            (true, false) => inner
                .explicit_branch
                .as_ref()
                .map(Source::delegating)
                .ok_or_else(|| Error::store("transaction branch missing")),
            (false, true) if active => Ok(Source::union(
                self.store.inferred_source(),
                self.store.explicit_source(),
            )),
            (false, false) if active => Ok(self.store.explicit_source()),
            (false, true) => Ok(Source::union(
                self.store.inferred_source().fork()?,
                self.store.explicit_source().fork()?,
            )),
            (false, false) => self.store.explicit_source().fork(),
        }
    }

    /// Snapshot a branch and hand out a registered, interlocked iteration
    fn open_iteration<T: Send + 'static>(
        &self,
        branch: Source,
        level: IsolationLevel,
        site: &'static Location<'static>,
        produce: impl FnOnce(&BoxedDataset) -> Box<dyn Iterator<Item = Result<T>> + Send>,
    ) -> Result<CloseableIter<T>> {
        let dataset = match branch.snapshot(level) {
            Ok(dataset) => dataset,
            Err(e) => {
                branch.release();
                return Err(e);
            }
        };
        let raw = produce(&dataset);
        let iter = CloseableIter::from_results(raw)
            .with_cleanup(move || {
                let mut dataset = dataset;
                let _ = dataset.close();
                branch.release();
            })
            .with_deadline(self.deadline());
        self.iterations
            .register(Arc::downgrade(&iter.handle()), iter.close_marker(), site);
        Ok(iter)
    }

    /// Flush buffered updates unless an active iteration depends on the
    /// current view at a repeatable-read level
    fn flush_pending_updates(&self) -> Result<()> {
        let weak_isolation = {
            let inner = self.inner.lock();
            if !inner.txn_active {
                return Ok(());
            }
            inner
                .isolation
                .map_or(true, |level| level < IsolationLevel::SnapshotRead)
        };
        if !self.iterations.has_active() || weak_isolation {
            self.flush_updates()?;
        }
        Ok(())
    }

    /// End one update: flush the inferred working set, realize the buffered
    /// removals then additions against the op's pre-state, flush the sink,
    /// and release the pair.
    fn end_update_internal(&self, inner: &mut Inner, key: Option<u64>) -> Result<()> {
        if let Some(mut op) = inner.inferred_op.take() {
            let result = op.sink.flush();
            op.sink.close();
            let _ = op.dataset.close();
            let _ = op.explicit_dataset.close();
            op.source.release();
            op.explicit_source.release();
            if let Err(e) = result {
                note_doom(inner, &e);
                return Err(e);
            }
        }

        let Some(mut op) = inner.ops.remove(&key) else {
            return Ok(());
        };
        if op.added.is_empty() && op.removed.is_empty() && op.sink.is_none() {
            return Ok(());
        }

        // The anonymous pair is created lazily, at realize time.
        if op.sink.is_none() {
            let level = self.current_level(inner);
            let source = self.branch(inner, false)?;
            op.dataset = Some(source.snapshot(level)?);
            op.sink = Some(source.sink(level)?);
            op.source = Some(source);
        }
        let result = self.realize(&mut op);
        if let Some(mut sink) = op.sink.take() {
            sink.close();
        }
        if let Some(mut dataset) = op.dataset.take() {
            let _ = dataset.close();
        }
        if let Some(source) = op.source.take() {
            source.release();
        }
        if let Err(e) = &result {
            note_doom(inner, e);
        }
        result
    }

    /// Realize buffered removals then additions into the op's sink and
    /// flush it
    fn realize(&self, op: &mut OpState) -> Result<()> {
        let (Some(dataset), Some(sink)) = (op.dataset.as_ref(), op.sink.as_mut()) else {
            return Ok(());
        };
        let has_listeners = !self.listeners.is_empty();

        for pattern in op.removed.drain(..) {
            let mut matched = dataset.statements(
                pattern.subject.as_ref(),
                pattern.predicate.as_ref(),
                pattern.object.as_ref(),
                &pattern.contexts,
            );
            while let Some(st) = matched.next().transpose()? {
                sink.deprecate(st.clone())?;
                if has_listeners {
                    self.listeners.notify_removed(&st);
                }
            }
        }

        for st in op.added.drain(..) {
            if has_listeners {
                let selection = std::slice::from_ref(&st.context);
                let present = dataset.has_statement(
                    Some(&st.subject),
                    Some(&st.predicate),
                    Some(&st.object),
                    selection,
                )? || sink.staged().approved().contains(&st);
                if !present {
                    self.listeners.notify_added(&st);
                }
            }
            sink.approve(st)?;
        }
        op.buffered = 0;
        sink.flush()
    }

    /// Auto-flush a bulk-loading update every `auto_flush_block_size`
    /// buffered entries, keeping memory bounded
    fn auto_flush(&self, inner: &mut Inner, key: Option<u64>) -> Result<()> {
        let due = inner
            .ops
            .get(&key)
            .map_or(false, |op| op.buffered >= self.config.auto_flush_block_size);
        if !due || self.iterations.has_active() {
            return Ok(());
        }
        self.end_update_internal(inner, key)?;
        match key {
            None => {
                inner.ops.insert(None, OpState::default());
            }
            Some(id) => {
                // Restart the explicit op with a fresh pre-state pair.
                let level = self.current_level(inner);
                let source = self.branch(inner, false)?;
                let dataset = source.snapshot(level)?;
                let sink = source.sink(level)?;
                inner.ops.insert(
                    Some(id),
                    OpState {
                        dataset: Some(dataset),
                        sink: Some(sink),
                        source: Some(source),
                        ..OpState::default()
                    },
                );
            }
        }
        Ok(())
    }

    /// Create the inferred dataset/sink working set on first use
    fn ensure_inferred_op(&self, inner: &mut Inner) -> Result<()> {
        if inner.inferred_op.is_some() {
            return Ok(());
        }
        let level = self.current_level(inner);
        let source = self.branch(inner, true)?;
        let dataset = source.snapshot(level)?;
        let sink = source.sink(level)?;
        let explicit_source = self.branch(inner, false)?;
        let explicit_dataset = explicit_source.snapshot(level)?;
        inner.inferred_op = Some(InferredOp {
            dataset,
            sink,
            explicit_dataset,
            source,
            explicit_source,
        });
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn verify_open(inner: &Inner) -> Result<()> {
    if !inner.open {
        return Err(Error::ConnectionClosed);
    }
    Ok(())
}

fn verify_active(inner: &Inner) -> Result<()> {
    if !inner.txn_active {
        return Err(Error::NoActiveTransaction);
    }
    Ok(())
}

fn check_doomed(inner: &Inner) -> Result<()> {
    if inner.txn_active {
        if let Some(doom) = &inner.doomed {
            return Err(doom.clone());
        }
    }
    Ok(())
}

/// Pin the first store failure so later operations on the same transaction
/// fail with the same root cause
fn note_doom(inner: &mut Inner, error: &Error) {
    if matches!(error, Error::Store(_) | Error::Io(_)) && inner.doomed.is_none() {
        inner.doomed = Some(error.clone());
    }
}

/// Discard all transaction state: buffers, pairs, branches, flags
fn rollback_internal(inner: &mut Inner) {
    for (_, mut op) in inner.ops.drain() {
        if let Some(mut sink) = op.sink.take() {
            sink.close();
        }
        if let Some(mut dataset) = op.dataset.take() {
            let _ = dataset.close();
        }
        if let Some(source) = op.source.take() {
            source.release();
        }
    }
    if let Some(mut op) = inner.inferred_op.take() {
        op.sink.close();
        let _ = op.dataset.close();
        let _ = op.explicit_dataset.close();
        op.source.release();
        op.explicit_source.release();
    }
    if let Some(union) = inner.union_branch.take() {
        union.release();
    }
    inner.explicit_branch = None;
    inner.inferred_branch = None;
    inner.txn_active = false;
    inner.txn_prepared = false;
    inner.isolation = None;
    inner.doomed = None;
    debug!("transaction rolled back");
}
