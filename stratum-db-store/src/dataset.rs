//! Read-only dataset views.
//!
//! A dataset is a snapshot produced by a source at an isolation level. The
//! layered view merges a backing snapshot with the change-set layers above
//! it, oldest first:
//!
//! 1. start from the backing statements (suppressed entirely when a layer
//!    cleared all statements)
//! 2. suppress backing statements deprecated by any layer, or whose context
//!    a layer cleared wholesale
//! 3. append each layer's approvals, minus what later layers deprecate
//! 4. de-duplicate by full quad identity
//!
//! Namespaces follow the parallel logic. Under serializable isolation a
//! dataset records every read pattern; the observations flush into the
//! owning branch when the dataset closes.

use crate::branch::{BranchId, SourceRoot};
use crate::changeset::Changeset;
use crate::store::BackingSnapshot;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use stratum_db_core::{Iri, Namespace, Resource, Result, Statement, StatementPattern, Value};

/// A read-only snapshot of a source. Must be closed; `close` is idempotent.
pub trait Dataset: Send {
    /// Statements matching the given positions, lazily. Unbound positions
    /// match everything; `contexts` is the variadic selection (empty means
    /// all graphs, a `None` entry the default graph).
    fn statements(
        &self,
        subject: Option<&Resource>,
        predicate: Option<&Iri>,
        object: Option<&Value>,
        contexts: &[Option<Resource>],
    ) -> Box<dyn Iterator<Item = Result<Statement>> + Send>;

    /// Distinct named contexts, no order guarantee
    fn contexts(&self) -> Box<dyn Iterator<Item = Result<Resource>> + Send>;

    /// Namespace bindings visible in this view
    fn namespaces(&self) -> Box<dyn Iterator<Item = Result<Namespace>> + Send>;

    /// The name bound to a prefix, if any
    fn namespace(&self, prefix: &str) -> Result<Option<String>>;

    /// Release the snapshot. Idempotent.
    fn close(&mut self) -> Result<()>;

    /// True when at least one statement matches
    fn has_statement(
        &self,
        subject: Option<&Resource>,
        predicate: Option<&Iri>,
        object: Option<&Value>,
        contexts: &[Option<Resource>],
    ) -> Result<bool> {
        match self.statements(subject, predicate, object, contexts).next() {
            Some(Ok(_)) => Ok(true),
            Some(Err(e)) => Err(e),
            None => Ok(false),
        }
    }
}

/// Owned dataset handle
pub type BoxedDataset = Box<dyn Dataset>;

/// Read patterns recorded for serializable conflict detection, flushed into
/// the owning branch when the dataset closes.
pub(crate) struct Observer {
    root: Arc<SourceRoot>,
    id: BranchId,
    patterns: Mutex<FxHashSet<StatementPattern>>,
}

impl Observer {
    pub(crate) fn new(root: Arc<SourceRoot>, id: BranchId) -> Self {
        Observer {
            root,
            id,
            patterns: Mutex::new(FxHashSet::default()),
        }
    }

    fn record(
        &self,
        subject: Option<&Resource>,
        predicate: Option<&Iri>,
        object: Option<&Value>,
        contexts: &[Option<Resource>],
    ) {
        let mut patterns = self.patterns.lock();
        for pattern in StatementPattern::expand(subject, predicate, object, contexts) {
            patterns.insert(pattern);
        }
    }

    fn flush(&self) -> Result<()> {
        let patterns = std::mem::take(&mut *self.patterns.lock());
        if patterns.is_empty() {
            return Ok(());
        }
        let mut changeset = Changeset::new();
        for pattern in patterns {
            changeset.observe(pattern);
        }
        self.root.push_changeset(self.id, changeset)
    }
}

/// True when a statement from layer `from - 1` (or the base, `from == 0`)
/// is suppressed by a later layer's deprecations or context clears.
fn suppressed_by(layers: &[Arc<Changeset>], from: usize, st: &Statement) -> bool {
    layers[from..].iter().any(|layer| {
        layer.deprecated().contains(st) || layer.deprecated_contexts().contains(&st.context)
    })
}

/// The layered merge of a backing snapshot and pending change-sets.
pub(crate) struct LayeredDataset {
    base: Arc<dyn BackingSnapshot>,
    layers: Vec<Arc<Changeset>>,
    /// Branch to notify on close, if this dataset counts as an open reader
    guard: Option<(Arc<SourceRoot>, BranchId)>,
    observer: Option<Observer>,
    closed: bool,
}

impl LayeredDataset {
    pub(crate) fn new(
        base: Arc<dyn BackingSnapshot>,
        layers: Vec<Arc<Changeset>>,
        guard: Option<(Arc<SourceRoot>, BranchId)>,
        observer: Option<Observer>,
    ) -> Self {
        LayeredDataset {
            base,
            layers,
            guard,
            observer,
            closed: false,
        }
    }

    /// The merged statement stream, without observation recording
    fn merged(
        &self,
        subject: Option<&Resource>,
        predicate: Option<&Iri>,
        object: Option<&Value>,
        contexts: &[Option<Resource>],
    ) -> Box<dyn Iterator<Item = Statement> + Send> {
        let layers = self.layers.clone();
        let cleared_at = layers.iter().rposition(|l| l.is_statement_cleared());

        let mut parts: Vec<Box<dyn Iterator<Item = Statement> + Send>> = Vec::new();

        if cleared_at.is_none() {
            let base = self.base.statements(subject, predicate, object, contexts);
            let for_base = layers.clone();
            parts.push(Box::new(
                base.filter(move |st| !suppressed_by(&for_base, 0, st)),
            ));
        }

        for (i, layer) in layers.iter().enumerate().skip(cleared_at.unwrap_or(0)) {
            let matched: Vec<Statement> = layer
                .approved()
                .matching(subject, predicate, object, contexts)
                .cloned()
                .collect();
            let later = layers.clone();
            let from = i + 1;
            parts.push(Box::new(
                matched
                    .into_iter()
                    .filter(move |st| !suppressed_by(&later, from, st)),
            ));
        }

        let mut seen: FxHashSet<Statement> = FxHashSet::default();
        Box::new(
            parts
                .into_iter()
                .flatten()
                .filter(move |st| seen.insert(st.clone())),
        )
    }

    /// Namespace bindings after applying every layer in order
    fn merged_namespaces(&self) -> FxHashMap<String, String> {
        let mut map: FxHashMap<String, String> = self
            .base
            .namespaces()
            .into_iter()
            .map(|ns| (ns.prefix, ns.name))
            .collect();
        for layer in &self.layers {
            if layer.is_namespace_cleared() {
                map.clear();
            }
            for prefix in layer.removed_prefixes() {
                map.remove(prefix);
            }
            for (prefix, name) in layer.added_namespaces() {
                map.insert(prefix.clone(), name.clone());
            }
        }
        map
    }
}

impl Dataset for LayeredDataset {
    fn statements(
        &self,
        subject: Option<&Resource>,
        predicate: Option<&Iri>,
        object: Option<&Value>,
        contexts: &[Option<Resource>],
    ) -> Box<dyn Iterator<Item = Result<Statement>> + Send> {
        if let Some(observer) = &self.observer {
            observer.record(subject, predicate, object, contexts);
        }
        Box::new(self.merged(subject, predicate, object, contexts).map(Ok))
    }

    fn contexts(&self) -> Box<dyn Iterator<Item = Result<Resource>> + Send> {
        let mut seen: FxHashSet<Resource> = FxHashSet::default();
        Box::new(
            self.merged(None, None, None, &[])
                .filter_map(|st| st.context)
                .filter(move |ctx| seen.insert(ctx.clone()))
                .map(Ok),
        )
    }

    fn namespaces(&self) -> Box<dyn Iterator<Item = Result<Namespace>> + Send> {
        let map = self.merged_namespaces();
        Box::new(
            map.into_iter()
                .map(|(prefix, name)| Ok(Namespace { prefix, name })),
        )
    }

    fn namespace(&self, prefix: &str) -> Result<Option<String>> {
        // Walk layers newest-first so a later edit shadows an earlier one.
        for layer in self.layers.iter().rev() {
            if let Some(name) = layer.added_namespaces().get(prefix) {
                return Ok(Some(name.clone()));
            }
            if layer.removed_prefixes().contains(prefix) || layer.is_namespace_cleared() {
                return Ok(None);
            }
        }
        Ok(self.base.namespace(prefix))
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let flushed = match self.observer.take() {
            Some(observer) => observer.flush(),
            None => Ok(()),
        };
        if let Some((root, id)) = self.guard.take() {
            root.dataset_closed(id);
        }
        flushed
    }
}

impl Drop for LayeredDataset {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Union of two datasets; the members are disjoint by protocol (explicit vs
/// inferred) but the merge still de-duplicates by full quad identity.
pub(crate) struct UnionDataset {
    first: BoxedDataset,
    second: BoxedDataset,
}

impl UnionDataset {
    pub(crate) fn new(first: BoxedDataset, second: BoxedDataset) -> Self {
        UnionDataset { first, second }
    }
}

impl Dataset for UnionDataset {
    fn statements(
        &self,
        subject: Option<&Resource>,
        predicate: Option<&Iri>,
        object: Option<&Value>,
        contexts: &[Option<Resource>],
    ) -> Box<dyn Iterator<Item = Result<Statement>> + Send> {
        let mut seen: FxHashSet<Statement> = FxHashSet::default();
        Box::new(
            self.first
                .statements(subject, predicate, object, contexts)
                .chain(self.second.statements(subject, predicate, object, contexts))
                .filter(move |item| match item {
                    Ok(st) => seen.insert(st.clone()),
                    Err(_) => true,
                }),
        )
    }

    fn contexts(&self) -> Box<dyn Iterator<Item = Result<Resource>> + Send> {
        let mut seen: FxHashSet<Resource> = FxHashSet::default();
        Box::new(
            self.first
                .contexts()
                .chain(self.second.contexts())
                .filter(move |item| match item {
                    Ok(ctx) => seen.insert(ctx.clone()),
                    Err(_) => true,
                }),
        )
    }

    fn namespaces(&self) -> Box<dyn Iterator<Item = Result<Namespace>> + Send> {
        let mut seen: FxHashSet<String> = FxHashSet::default();
        Box::new(
            self.first
                .namespaces()
                .chain(self.second.namespaces())
                .filter(move |item| match item {
                    Ok(ns) => seen.insert(ns.prefix.clone()),
                    Err(_) => true,
                }),
        )
    }

    fn namespace(&self, prefix: &str) -> Result<Option<String>> {
        match self.first.namespace(prefix)? {
            Some(name) => Ok(Some(name)),
            None => self.second.namespace(prefix),
        }
    }

    fn close(&mut self) -> Result<()> {
        let first = self.first.close();
        let second = self.second.close();
        first.and(second)
    }
}

impl Drop for UnionDataset {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
