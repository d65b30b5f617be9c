//! An indexed, in-memory statement set.
//!
//! `QuadModel` keeps the full statement set plus four secondary indexes
//! (subject, predicate, object, context). Pattern scans walk the smallest
//! candidate set among the bound dimensions; an unbound dimension imposes no
//! constraint, and when nothing is bound the full set is scanned.
//!
//! Statements are `Arc`-backed, so the per-index copies are cheap.

use crate::statement::{context_matches, Statement, StatementPattern};
use crate::value::{Iri, Resource, Value};
use rustc_hash::{FxHashMap, FxHashSet};

/// Indexed statement set with smallest-set pattern scans
#[derive(Clone, Debug, Default)]
pub struct QuadModel {
    all: FxHashSet<Statement>,
    by_subject: FxHashMap<Resource, FxHashSet<Statement>>,
    by_predicate: FxHashMap<Iri, FxHashSet<Statement>>,
    by_object: FxHashMap<Value, FxHashSet<Statement>>,
    by_context: FxHashMap<Option<Resource>, FxHashSet<Statement>>,
}

impl QuadModel {
    /// Create an empty model
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of statements
    pub fn len(&self) -> usize {
        self.all.len()
    }

    /// True when the model holds no statements
    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    /// True when the exact statement is present
    pub fn contains(&self, st: &Statement) -> bool {
        self.all.contains(st)
    }

    /// Insert a statement; returns false if it was already present
    pub fn insert(&mut self, st: Statement) -> bool {
        if !self.all.insert(st.clone()) {
            return false;
        }
        self.by_subject
            .entry(st.subject.clone())
            .or_default()
            .insert(st.clone());
        self.by_predicate
            .entry(st.predicate.clone())
            .or_default()
            .insert(st.clone());
        self.by_object
            .entry(st.object.clone())
            .or_default()
            .insert(st.clone());
        self.by_context
            .entry(st.context.clone())
            .or_default()
            .insert(st);
        true
    }

    /// Remove a statement; returns false if it was absent
    pub fn remove(&mut self, st: &Statement) -> bool {
        if !self.all.remove(st) {
            return false;
        }
        Self::prune(&mut self.by_subject, &st.subject, st);
        Self::prune(&mut self.by_predicate, &st.predicate, st);
        Self::prune(&mut self.by_object, &st.object, st);
        Self::prune(&mut self.by_context, &st.context, st);
        true
    }

    fn prune<K: std::hash::Hash + Eq>(
        index: &mut FxHashMap<K, FxHashSet<Statement>>,
        key: &K,
        st: &Statement,
    ) {
        if let Some(set) = index.get_mut(key) {
            set.remove(st);
            if set.is_empty() {
                index.remove(key);
            }
        }
    }

    /// Remove all statements
    pub fn clear(&mut self) {
        self.all.clear();
        self.by_subject.clear();
        self.by_predicate.clear();
        self.by_object.clear();
        self.by_context.clear();
    }

    /// Iterate over every statement
    pub fn iter(&self) -> impl Iterator<Item = &Statement> {
        self.all.iter()
    }

    /// The smallest candidate index set for the bound dimensions.
    ///
    /// Returns `None` when no dimension narrows the scan (nothing bound, or
    /// a multi-context selection), in which case the caller scans the full
    /// set. A bound dimension with no index entry short-circuits to empty.
    fn candidates(
        &self,
        subject: Option<&Resource>,
        predicate: Option<&Iri>,
        object: Option<&Value>,
        contexts: &[Option<Resource>],
    ) -> Option<&FxHashSet<Statement>> {
        static EMPTY: std::sync::OnceLock<FxHashSet<Statement>> = std::sync::OnceLock::new();
        let empty = || EMPTY.get_or_init(FxHashSet::default);

        fn consider<'a>(
            smallest: &mut Option<&'a FxHashSet<Statement>>,
            set: Option<&'a FxHashSet<Statement>>,
            empty: impl FnOnce() -> &'a FxHashSet<Statement>,
        ) {
            match set {
                Some(set) => {
                    if smallest.map_or(true, |s| set.len() < s.len()) {
                        *smallest = Some(set);
                    }
                }
                // Bound dimension with no entry: nothing can match.
                None => *smallest = Some(empty()),
            }
        }

        let mut smallest: Option<&FxHashSet<Statement>> = None;

        if let Some(s) = subject {
            consider(&mut smallest, self.by_subject.get(s), empty);
        }
        if let Some(p) = predicate {
            consider(&mut smallest, self.by_predicate.get(p), empty);
        }
        if let Some(o) = object {
            consider(&mut smallest, self.by_object.get(o), empty);
        }
        if let [ctx] = contexts {
            consider(&mut smallest, self.by_context.get(ctx), empty);
        }
        smallest
    }

    /// Iterate over statements matching the given positions.
    ///
    /// Unbound positions match everything; `contexts` is the variadic
    /// selection (empty means all graphs, a `None` entry the default graph).
    pub fn matching<'a>(
        &'a self,
        subject: Option<&'a Resource>,
        predicate: Option<&'a Iri>,
        object: Option<&'a Value>,
        contexts: &'a [Option<Resource>],
    ) -> impl Iterator<Item = &'a Statement> + 'a {
        let candidates = self.candidates(subject, predicate, object, contexts);
        candidates
            .unwrap_or(&self.all)
            .iter()
            .filter(move |st| {
                subject.map_or(true, |s| *s == st.subject)
                    && predicate.map_or(true, |p| *p == st.predicate)
                    && object.map_or(true, |o| *o == st.object)
                    && context_matches(contexts, &st.context)
            })
    }

    /// Iterate over statements matching a pattern
    pub fn matching_pattern<'a>(
        &'a self,
        pattern: &'a StatementPattern,
    ) -> Box<dyn Iterator<Item = &'a Statement> + 'a> {
        match &pattern.context {
            None => Box::new(self.matching(
                pattern.subject.as_ref(),
                pattern.predicate.as_ref(),
                pattern.object.as_ref(),
                &[],
            )),
            Some(ctx) => Box::new(
                self.matching(
                    pattern.subject.as_ref(),
                    pattern.predicate.as_ref(),
                    pattern.object.as_ref(),
                    std::slice::from_ref(ctx),
                ),
            ),
        }
    }

    /// True when any statement matches the pattern
    pub fn contains_match(&self, pattern: &StatementPattern) -> bool {
        self.matching_pattern(pattern).next().is_some()
    }

    /// Estimated result cardinality for a pattern (the candidate set size)
    pub fn candidate_len(&self, pattern: &StatementPattern) -> usize {
        let ctxs: &[Option<Resource>] = match &pattern.context {
            None => &[],
            Some(ctx) => std::slice::from_ref(ctx),
        };
        self.candidates(
            pattern.subject.as_ref(),
            pattern.predicate.as_ref(),
            pattern.object.as_ref(),
            ctxs,
        )
        .map(|s| s.len())
        .unwrap_or(self.all.len())
    }

    /// Remove all statements matching the given positions; returns the count
    pub fn remove_matching(
        &mut self,
        subject: Option<&Resource>,
        predicate: Option<&Iri>,
        object: Option<&Value>,
        contexts: &[Option<Resource>],
    ) -> usize {
        let doomed: Vec<Statement> = self
            .matching(subject, predicate, object, contexts)
            .cloned()
            .collect();
        for st in &doomed {
            self.remove(st);
        }
        doomed.len()
    }

    /// Remove every statement in the given context; returns the count
    pub fn remove_context(&mut self, context: &Option<Resource>) -> usize {
        let doomed: Vec<Statement> = self
            .by_context
            .get(context)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        for st in &doomed {
            self.remove(st);
        }
        doomed.len()
    }

    /// True when any statement lives in the given context
    pub fn has_context(&self, context: &Option<Resource>) -> bool {
        self.by_context.contains_key(context)
    }

    /// Distinct named contexts present in the model
    pub fn contexts(&self) -> impl Iterator<Item = &Resource> {
        self.by_context.keys().filter_map(|c| c.as_ref())
    }
}

impl FromIterator<Statement> for QuadModel {
    fn from_iter<I: IntoIterator<Item = Statement>>(iter: I) -> Self {
        let mut model = QuadModel::new();
        for st in iter {
            model.insert(st);
        }
        model
    }
}

impl Extend<Statement> for QuadModel {
    fn extend<I: IntoIterator<Item = Statement>>(&mut self, iter: I) {
        for st in iter {
            self.insert(st);
        }
    }
}
