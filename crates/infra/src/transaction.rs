//! Transaction manager contract, attributes and the scoped transaction helper.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, error};
use uuid::Uuid;

use forgebatch_core::{BatchError, BatchResult};

type RollbackRule = Arc<dyn Fn(&BatchError) -> bool + Send + Sync>;

/// How a chunk transaction is opened and which failures roll it back.
///
/// By default every failure rolls back. Kinds listed with
/// [`no_rollback_for`](Self::no_rollback_for) are tolerated instead. Fatal and
/// interruption failures always roll back.
#[derive(Clone)]
pub struct TransactionAttributes {
    name: String,
    timeout: Option<Duration>,
    no_rollback_for: HashSet<String>,
    rule: Option<RollbackRule>,
}

impl fmt::Debug for TransactionAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionAttributes")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("no_rollback_for", &self.no_rollback_for)
            .field("custom_rule", &self.rule.is_some())
            .finish()
    }
}

impl Default for TransactionAttributes {
    fn default() -> Self {
        Self::new("chunk")
    }
}

impl TransactionAttributes {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout: None,
            no_rollback_for: HashSet::new(),
            rule: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Tolerate failures of this kind without rolling back.
    pub fn no_rollback_for(mut self, kind: impl Into<String>) -> Self {
        self.no_rollback_for.insert(kind.into());
        self
    }

    /// Replace the kind table with a custom predicate (`true` = roll back).
    pub fn with_rollback_rule<F>(mut self, rule: F) -> Self
    where
        F: Fn(&BatchError) -> bool + Send + Sync + 'static,
    {
        self.rule = Some(Arc::new(rule));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn rollback_on(&self, error: &BatchError) -> bool {
        if error.is_fatal() || error.is_interruption() {
            return true;
        }
        match &self.rule {
            Some(rule) => rule(error),
            None => !self.no_rollback_for.contains(error.kind()),
        }
    }
}

/// Opaque handle to an open transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionHandle {
    id: Uuid,
    name: String,
}

impl TransactionHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.id)
    }
}

/// Transaction manager abstraction.
pub trait TransactionManager: Send + Sync {
    fn begin(&self, attributes: &TransactionAttributes) -> BatchResult<TransactionHandle>;

    fn commit(&self, handle: &TransactionHandle) -> BatchResult<()>;

    fn rollback(&self, handle: &TransactionHandle) -> BatchResult<()>;
}

impl<T: TransactionManager + ?Sized> TransactionManager for Arc<T> {
    fn begin(&self, attributes: &TransactionAttributes) -> BatchResult<TransactionHandle> {
        (**self).begin(attributes)
    }

    fn commit(&self, handle: &TransactionHandle) -> BatchResult<()> {
        (**self).commit(handle)
    }

    fn rollback(&self, handle: &TransactionHandle) -> BatchResult<()> {
        (**self).rollback(handle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeState {
    Open,
    Committed,
    RolledBack,
}

/// One transaction, ended exactly once.
///
/// Dropping a scope that was neither committed nor rolled back rolls it back.
/// A failed commit leaves the scope open so the caller can roll back
/// explicitly.
pub struct TransactionScope<'a> {
    manager: &'a dyn TransactionManager,
    handle: TransactionHandle,
    state: ScopeState,
}

impl fmt::Debug for TransactionScope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionScope")
            .field("handle", &self.handle)
            .field("state", &self.state)
            .finish()
    }
}

impl<'a> TransactionScope<'a> {
    pub fn begin(
        manager: &'a dyn TransactionManager,
        attributes: &TransactionAttributes,
    ) -> BatchResult<Self> {
        let handle = manager.begin(attributes)?;
        debug!(transaction = %handle, "transaction started");
        Ok(Self {
            manager,
            handle,
            state: ScopeState::Open,
        })
    }

    pub fn handle(&self) -> &TransactionHandle {
        &self.handle
    }

    pub fn is_open(&self) -> bool {
        self.state == ScopeState::Open
    }

    pub fn commit(&mut self) -> BatchResult<()> {
        if self.state != ScopeState::Open {
            return Err(BatchError::transaction(format!(
                "transaction {} already ended",
                self.handle
            )));
        }
        self.manager.commit(&self.handle)?;
        self.state = ScopeState::Committed;
        debug!(transaction = %self.handle, "transaction committed");
        Ok(())
    }

    /// Roll back. The scope counts as ended even if the rollback fails.
    pub fn rollback(&mut self) -> BatchResult<()> {
        if self.state != ScopeState::Open {
            return Ok(());
        }
        self.state = ScopeState::RolledBack;
        let result = self.manager.rollback(&self.handle);
        debug!(transaction = %self.handle, ok = result.is_ok(), "transaction rolled back");
        result
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if self.state == ScopeState::Open {
            if let Err(e) = self.rollback() {
                error!(transaction = %self.handle, error = %e, "rollback on scope exit failed");
            }
        }
    }
}

/// Counters kept by [`InMemoryTransactionManager`].
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct TransactionStats {
    pub begun: u64,
    pub committed: u64,
    pub rolled_back: u64,
    pub active: usize,
}

#[derive(Debug, Default)]
struct ManagerState {
    active: HashMap<Uuid, String>,
    stats: TransactionStats,
}

/// Bookkeeping-only transaction manager.
#[derive(Debug, Default)]
pub struct InMemoryTransactionManager {
    state: Mutex<ManagerState>,
}

impl InMemoryTransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn stats(&self) -> TransactionStats {
        let state = self.lock();
        TransactionStats {
            active: state.active.len(),
            ..state.stats.clone()
        }
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn end(&self, handle: &TransactionHandle) -> BatchResult<MutexGuard<'_, ManagerState>> {
        let mut state = self.lock();
        if state.active.remove(&handle.id()).is_none() {
            return Err(BatchError::transaction(format!(
                "transaction {handle} is not active"
            )));
        }
        Ok(state)
    }
}

impl TransactionManager for InMemoryTransactionManager {
    fn begin(&self, attributes: &TransactionAttributes) -> BatchResult<TransactionHandle> {
        let handle = TransactionHandle::new(attributes.name());
        let mut state = self.lock();
        state.active.insert(handle.id(), handle.name().to_string());
        state.stats.begun += 1;
        Ok(handle)
    }

    fn commit(&self, handle: &TransactionHandle) -> BatchResult<()> {
        self.end(handle)?.stats.committed += 1;
        Ok(())
    }

    fn rollback(&self, handle: &TransactionHandle) -> BatchResult<()> {
        self.end(handle).map_err(|e| BatchError::rollback(e.to_string()))?.stats.rolled_back += 1;
        Ok(())
    }
}
