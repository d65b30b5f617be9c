//! Single-pass closeable lazy sequences.
//!
//! Every iteration handed to a client owns the resources backing it and must
//! be closed. `close()` is idempotent; `next()` after `close()` fails.
//! Cleanup actions attached with [`CloseableIter::with_cleanup`] run on close
//! in attachment order, which lets callers interlock sub-resources (close the
//! dataset first, release the branch second) on every exit path.
//!
//! Dropping an unclosed iteration closes it. A [`ForceCloseable`] handle lets
//! another thread cancel the iteration: the next access fails with
//! `Error::Interrupted`. An optional deadline makes every access past the
//! per-operation execution budget fail with `Error::QueryTimeout`.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

type Source<T> = Box<dyn Iterator<Item = Result<T>> + Send>;
type Cleanup = Box<dyn FnOnce() + Send>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Status {
    Open,
    Closed,
    Cancelled,
}

struct IterState<T> {
    source: Option<Source<T>>,
    cleanup: Vec<Cleanup>,
    deadline: Option<Instant>,
    status: Status,
}

/// Shared core of an iteration; the handle type given to registries.
pub struct IterShared<T> {
    state: Mutex<IterState<T>>,
}

impl<T> IterShared<T> {
    /// Transition to `target` if still open, releasing resources exactly once.
    fn close_with(&self, target: Status) {
        let mut state = self.state.lock();
        if state.status == Status::Open {
            state.status = target;
            state.source = None;
            for cleanup in state.cleanup.drain(..) {
                cleanup();
            }
        }
    }
}

/// Cancellation handle for an iteration owned elsewhere
pub trait ForceCloseable: Send + Sync {
    /// Cancel the iteration and release its resources. Subsequent accesses
    /// through the owning iterator fail with `Error::Interrupted`.
    fn force_close(&self);
}

impl<T: Send> ForceCloseable for IterShared<T> {
    fn force_close(&self) {
        self.close_with(Status::Cancelled);
    }
}

/// A single-pass closeable iteration over `T`
pub struct CloseableIter<T> {
    shared: Arc<IterShared<T>>,
    /// Set only by an explicit `close()`; lets leak diagnosis distinguish a
    /// released iteration from an abandoned one.
    explicitly_closed: Arc<AtomicBool>,
}

impl<T: Send + 'static> CloseableIter<T> {
    /// Wrap a fallible source iterator
    pub fn from_results(source: impl Iterator<Item = Result<T>> + Send + 'static) -> Self {
        CloseableIter {
            shared: Arc::new(IterShared {
                state: Mutex::new(IterState {
                    source: Some(Box::new(source)),
                    cleanup: Vec::new(),
                    deadline: None,
                    status: Status::Open,
                }),
            }),
            explicitly_closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Wrap an infallible source iterator
    pub fn from_iter(source: impl Iterator<Item = T> + Send + 'static) -> Self {
        Self::from_results(source.map(Ok))
    }

    /// An iteration over owned items
    pub fn from_vec(items: Vec<T>) -> Self {
        Self::from_iter(items.into_iter())
    }

    /// The empty iteration
    pub fn empty() -> Self {
        Self::from_iter(std::iter::empty())
    }

    /// Attach a cleanup action, run once on close (in attachment order)
    pub fn with_cleanup(self, cleanup: impl FnOnce() + Send + 'static) -> Self {
        self.shared.state.lock().cleanup.push(Box::new(cleanup));
        self
    }

    /// Attach an execution deadline
    pub fn with_deadline(self, deadline: Option<Instant>) -> Self {
        self.shared.state.lock().deadline = deadline;
        self
    }

    /// Advance the iteration.
    ///
    /// Returns `Ok(None)` when exhausted. Fails with `IterationClosed` after
    /// `close()`, `Interrupted` after a force-close, and `QueryTimeout` once
    /// the deadline has passed.
    pub fn next(&mut self) -> Result<Option<T>> {
        let mut state = self.shared.state.lock();
        match state.status {
            Status::Closed => return Err(Error::IterationClosed),
            Status::Cancelled => return Err(Error::Interrupted),
            Status::Open => {}
        }
        if let Some(deadline) = state.deadline {
            if Instant::now() > deadline {
                return Err(Error::QueryTimeout);
            }
        }
        match state.source.as_mut() {
            Some(source) => source.next().transpose(),
            None => Ok(None),
        }
    }

    /// Close the iteration and release its resources. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        self.explicitly_closed.store(true, Ordering::Release);
        self.shared.close_with(Status::Closed);
        Ok(())
    }

    /// A cancellation handle for registries and cross-thread close
    pub fn handle(&self) -> Arc<dyn ForceCloseable> {
        self.shared.clone()
    }

    /// The explicit-close marker shared with leak diagnosis
    pub fn close_marker(&self) -> Arc<AtomicBool> {
        self.explicitly_closed.clone()
    }

    /// Drain the remaining items and close
    pub fn collect_all(&mut self) -> Result<Vec<T>> {
        let mut out = Vec::new();
        loop {
            match self.next() {
                Ok(Some(item)) => out.push(item),
                Ok(None) => break,
                Err(e) => {
                    let _ = self.close();
                    return Err(e);
                }
            }
        }
        self.close()?;
        Ok(out)
    }
}

impl<T> Drop for CloseableIter<T> {
    fn drop(&mut self) {
        // Release resources even when the caller forgot to close; the
        // explicit-close marker stays false so the registry can report the
        // abandonment.
        self.shared.close_with(Status::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_single_pass_and_exhaustion() {
        let mut iter = CloseableIter::from_vec(vec![1, 2]);
        assert_eq!(iter.next().unwrap(), Some(1));
        assert_eq!(iter.next().unwrap(), Some(2));
        assert_eq!(iter.next().unwrap(), None);
        assert_eq!(iter.next().unwrap(), None);
    }

    #[test]
    fn test_next_after_close_fails() {
        let mut iter = CloseableIter::from_vec(vec![1]);
        iter.close().unwrap();
        assert!(matches!(iter.next(), Err(Error::IterationClosed)));
    }

    #[test]
    fn test_close_idempotent_runs_cleanup_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let mut iter =
            CloseableIter::from_vec(vec![1]).with_cleanup(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        iter.close().unwrap();
        iter.close().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cleanup_order_is_attachment_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let (o1, o2) = (order.clone(), order.clone());
        let mut iter = CloseableIter::from_vec(vec![1])
            .with_cleanup(move || o1.lock().push("dataset"))
            .with_cleanup(move || o2.lock().push("branch"));
        iter.close().unwrap();
        assert_eq!(*order.lock(), vec!["dataset", "branch"]);
    }

    #[test]
    fn test_drop_runs_cleanup() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        {
            let _iter = CloseableIter::from_vec(vec![1]).with_cleanup(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_force_close_interrupts() {
        let mut iter = CloseableIter::from_vec(vec![1, 2, 3]);
        let handle = iter.handle();
        assert_eq!(iter.next().unwrap(), Some(1));
        handle.force_close();
        assert!(matches!(iter.next(), Err(Error::Interrupted)));
        // Explicit close afterwards is still fine.
        iter.close().unwrap();
    }

    #[test]
    fn test_deadline_times_out_all_subsequent_accesses() {
        let mut iter = CloseableIter::from_vec(vec![1, 2])
            .with_deadline(Some(Instant::now() - Duration::from_millis(1)));
        assert!(matches!(iter.next(), Err(Error::QueryTimeout)));
        assert!(matches!(iter.next(), Err(Error::QueryTimeout)));
    }

    #[test]
    fn test_collect_all_closes() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let mut iter = CloseableIter::from_vec(vec![1, 2, 3]).with_cleanup(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(iter.collect_all().unwrap(), vec![1, 2, 3]);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(matches!(iter.next(), Err(Error::IterationClosed)));
    }
}
