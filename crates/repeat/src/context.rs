//! Iteration contexts: the scoped state holders of nested loops.
//!
//! One context is started per logical scope (job, step, chunk, item loop) and
//! parented to the scope that encloses it. A context carries:
//!
//! - a started counter (iterations begun in this scope),
//! - complete-only / terminate-only flags (terminate implies complete),
//! - typed named attributes,
//! - cleanup actions that run exactly once when the scope closes.
//!
//! ## Threading
//!
//! A context is driven by one logical thread of control at a time, but
//! monitoring code may read it from elsewhere, so every attribute and cleanup
//! accessor goes through a single mutex. Flags and the started counter are
//! atomics.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use forgebatch_core::{BatchError, BatchResult};
use tracing::{debug, warn};

type Attribute = Arc<dyn Any + Send + Sync>;
type CleanupAction = Box<dyn FnOnce() -> BatchResult<()> + Send>;

#[derive(Default)]
struct ContextState {
    attributes: HashMap<String, Attribute>,
    cleanups: Vec<(String, CleanupAction)>,
    closed: bool,
}

/// Scoped, hierarchical state holder for one level of iteration.
pub struct IterationContext {
    parent: Option<Arc<IterationContext>>,
    started: AtomicU64,
    complete_only: AtomicBool,
    terminate_only: AtomicBool,
    state: Mutex<ContextState>,
}

impl std::fmt::Debug for IterationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("IterationContext")
            .field("has_parent", &self.parent.is_some())
            .field("started", &self.started_count())
            .field("complete_only", &self.is_complete_only())
            .field("terminate_only", &self.is_terminate_only())
            .field("attributes", &state.attributes.keys().collect::<Vec<_>>())
            .field("pending_cleanups", &state.cleanups.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl IterationContext {
    /// Start a new scope nested inside `parent` (if any).
    pub fn start(parent: Option<&Arc<IterationContext>>) -> Arc<Self> {
        Arc::new(Self {
            parent: parent.cloned(),
            started: AtomicU64::new(0),
            complete_only: AtomicBool::new(false),
            terminate_only: AtomicBool::new(false),
            state: Mutex::new(ContextState::default()),
        })
    }

    /// Start a top-level scope.
    pub fn root() -> Arc<Self> {
        Self::start(None)
    }

    pub fn parent(&self) -> Option<&Arc<IterationContext>> {
        self.parent.as_ref()
    }

    fn lock(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn started_count(&self) -> u64 {
        self.started.load(Ordering::SeqCst)
    }

    /// Record that one more iteration started in this scope.
    pub fn increment(&self) -> u64 {
        self.started.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Mark this scope complete: the enclosing loop stops at its next check.
    pub fn set_complete_only(&self) {
        self.complete_only.store(true, Ordering::SeqCst);
    }

    pub fn is_complete_only(&self) -> bool {
        self.complete_only.load(Ordering::SeqCst)
    }

    /// Mark this scope for abnormal termination (implies complete).
    pub fn set_terminate_only(&self) {
        self.terminate_only.store(true, Ordering::SeqCst);
        self.set_complete_only();
    }

    pub fn is_terminate_only(&self) -> bool {
        self.terminate_only.load(Ordering::SeqCst)
    }

    /// True if this scope or any enclosing scope was marked complete.
    pub fn is_complete(&self) -> bool {
        if self.is_complete_only() {
            return true;
        }
        match &self.parent {
            Some(parent) => parent.is_complete(),
            None => false,
        }
    }

    pub fn set_attribute<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.lock().attributes.insert(key.into(), Arc::new(value));
    }

    /// Typed read; `None` if missing or stored with another type.
    pub fn attribute<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let attr = self.lock().attributes.get(key).cloned()?;
        attr.downcast::<T>().ok()
    }

    /// Read the attribute, inserting `init()` first if it is missing.
    ///
    /// Insert-if-absent happens under the context lock, so concurrent callers
    /// always observe the same value.
    pub fn attribute_or_insert_with<T, F>(&self, key: &str, init: F) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let mut state = self.lock();
        let attr = state
            .attributes
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(init()))
            .clone();
        drop(state);
        attr.downcast::<T>().ok()
    }

    pub fn has_attribute(&self, key: &str) -> bool {
        self.lock().attributes.contains_key(key)
    }

    pub fn remove_attribute(&self, key: &str) -> bool {
        self.lock().attributes.remove(key).is_some()
    }

    pub fn attribute_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.lock().attributes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Register an action to run when this scope closes.
    ///
    /// Registering twice under the same key replaces the earlier action. If the
    /// scope is already closed the action runs immediately and its result is
    /// returned.
    pub fn register_cleanup<F>(&self, key: impl Into<String>, action: F) -> BatchResult<()>
    where
        F: FnOnce() -> BatchResult<()> + Send + 'static,
    {
        let key = key.into();
        let mut state = self.lock();
        if state.closed {
            drop(state);
            debug!(key = %key, "context already closed; running cleanup immediately");
            return action();
        }
        let action: CleanupAction = Box::new(action);
        match state.cleanups.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = action,
            None => state.cleanups.push((key, action)),
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Close the scope, running every cleanup action in reverse registration
    /// order.
    ///
    /// All actions run even if some fail; the first failure is returned after
    /// the last action finished. Closing twice is a no-op.
    pub fn close(&self) -> BatchResult<()> {
        let cleanups = {
            let mut state = self.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            std::mem::take(&mut state.cleanups)
        };

        let mut first_error: Option<BatchError> = None;
        for (key, action) in cleanups.into_iter().rev() {
            if let Err(e) = action() {
                warn!(key = %key, error = %e, "cleanup action failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Counter stored as an attribute of this scope, or of the parent scope
    /// when `use_parent` is set and a parent exists, so sibling scopes share
    /// one tally.
    pub fn counter(&self, name: &str, use_parent: bool) -> SharedCounter {
        let owner = match (&self.parent, use_parent) {
            (Some(parent), true) => parent.as_ref(),
            _ => self,
        };
        owner
            .attribute_or_insert_with(name, SharedCounter::new)
            .map(|c| c.as_ref().clone())
            .unwrap_or_else(|| {
                warn!(name = %name, "attribute is not a counter; using a detached counter");
                SharedCounter::new()
            })
    }
}

/// Explicit handle to a tally shared between iteration scopes.
///
/// Clones refer to the same count.
#[derive(Debug, Clone, Default)]
pub struct SharedCounter(Arc<AtomicU64>);

impl SharedCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Add one; returns the new count.
    pub fn increment(&self) -> u64 {
        self.add(1)
    }

    /// Add `n`; returns the new count.
    pub fn add(&self, n: u64) -> u64 {
        self.0.fetch_add(n, Ordering::SeqCst) + n
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::thread;

    #[test]
    fn terminate_implies_complete() {
        let ctx = IterationContext::root();
        assert!(!ctx.is_complete());
        ctx.set_terminate_only();
        assert!(ctx.is_complete_only());
        assert!(ctx.is_terminate_only());
    }

    #[test]
    fn completion_of_parent_is_visible_to_children() {
        let parent = IterationContext::root();
        let child = IterationContext::start(Some(&parent));
        assert!(!child.is_complete());

        parent.set_complete_only();
        assert!(child.is_complete());
        assert!(!child.is_complete_only());
    }

    #[test]
    fn typed_attributes() {
        let ctx = IterationContext::root();
        ctx.set_attribute("chunk.items", vec![1, 2, 3]);

        assert!(ctx.has_attribute("chunk.items"));
        assert_eq!(
            ctx.attribute::<Vec<i32>>("chunk.items").as_deref(),
            Some(&vec![1, 2, 3])
        );
        assert!(ctx.attribute::<String>("chunk.items").is_none());

        assert!(ctx.remove_attribute("chunk.items"));
        assert!(!ctx.remove_attribute("chunk.items"));
    }

    #[test]
    fn close_runs_every_cleanup_in_reverse_order_and_reraises_first_error() {
        let ctx = IterationContext::root();
        let order = Arc::new(StdMutex::new(Vec::new()));

        for name in ["a", "b", "c", "d"] {
            let order = order.clone();
            ctx.register_cleanup(name, move || {
                order.lock().unwrap().push(name);
                match name {
                    "c" => Err(BatchError::cleanup("c failed")),
                    "a" => Err(BatchError::cleanup("a failed")),
                    _ => Ok(()),
                }
            })
            .unwrap();
        }

        let result = ctx.close();

        assert_eq!(*order.lock().unwrap(), vec!["d", "c", "b", "a"]);
        assert_eq!(result, Err(BatchError::cleanup("c failed")));
    }

    #[test]
    fn close_is_idempotent() {
        let ctx = IterationContext::root();
        let runs = SharedCounter::new();
        let r = runs.clone();
        ctx.register_cleanup("count", move || {
            r.increment();
            Ok(())
        })
        .unwrap();

        ctx.close().unwrap();
        ctx.close().unwrap();

        assert_eq!(runs.get(), 1);
        assert!(ctx.is_closed());
    }

    #[test]
    fn registering_same_key_replaces_action() {
        let ctx = IterationContext::root();
        let hits = SharedCounter::new();
        let first = hits.clone();
        let second = hits.clone();
        ctx.register_cleanup("release", move || {
            first.add(10);
            Ok(())
        })
        .unwrap();
        ctx.register_cleanup("release", move || {
            second.add(1);
            Ok(())
        })
        .unwrap();

        ctx.close().unwrap();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn cleanup_registered_after_close_runs_immediately() {
        let ctx = IterationContext::root();
        ctx.close().unwrap();

        let result = ctx.register_cleanup("late", || Err(BatchError::cleanup("late")));
        assert_eq!(result, Err(BatchError::cleanup("late")));
    }

    #[test]
    fn sibling_scopes_share_parent_counter() {
        let parent = IterationContext::root();
        let first = IterationContext::start(Some(&parent));
        let second = IterationContext::start(Some(&parent));

        first.counter("attempts", true).increment();
        second.counter("attempts", true).add(2);
        first.counter("local", false).increment();

        assert_eq!(parent.counter("attempts", false).get(), 3);
        assert_eq!(second.counter("local", false).get(), 0);
    }

    #[test]
    fn attributes_are_safe_to_read_from_another_thread() {
        let ctx = IterationContext::root();
        let writer = ctx.clone();
        let handle = thread::spawn(move || {
            for i in 0..100u64 {
                writer.set_attribute("progress", i);
            }
        });
        for _ in 0..100 {
            let _ = ctx.attribute::<u64>("progress");
        }
        handle.join().unwrap();
        assert_eq!(ctx.attribute::<u64>("progress").as_deref(), Some(&99));
    }
}
