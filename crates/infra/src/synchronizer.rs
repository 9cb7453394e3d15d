//! Per-execution mutual exclusion.
//!
//! Chunks that mutate the same step execution (and the job-level bookkeeping of
//! the same job execution) serialize on a gate keyed by the execution id.
//! Gates for different keys are independent.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use forgebatch_core::{BatchError, BatchResult, CancellationToken, JobExecutionId, StepExecutionId};

const CANCEL_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionKey {
    Job(JobExecutionId),
    Step(StepExecutionId),
}

impl fmt::Display for ExecutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionKey::Job(id) => write!(f, "job:{id}"),
            ExecutionKey::Step(id) => write!(f, "step:{id}"),
        }
    }
}

impl From<JobExecutionId> for ExecutionKey {
    fn from(id: JobExecutionId) -> Self {
        ExecutionKey::Job(id)
    }
}

impl From<StepExecutionId> for ExecutionKey {
    fn from(id: StepExecutionId) -> Self {
        ExecutionKey::Step(id)
    }
}

#[derive(Debug, Default)]
struct Gate {
    held: Mutex<bool>,
    released: Condvar,
}

impl Gate {
    fn held(&self) -> MutexGuard<'_, bool> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self) {
        *self.held() = false;
        self.released.notify_one();
    }
}

/// Registry of gates, one per execution key.
#[derive(Debug, Default)]
pub struct ExecutionSynchronizer {
    gates: Mutex<HashMap<ExecutionKey, Arc<Gate>>>,
}

impl ExecutionSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn gate(&self, key: ExecutionKey) -> Arc<Gate> {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(gates.entry(key).or_default())
    }

    /// Block until the gate for `key` is free, then hold it.
    pub fn acquire(&self, key: impl Into<ExecutionKey>) -> ExecutionGuard {
        let key = key.into();
        let gate = self.gate(key);
        {
            let mut held = gate.held();
            while *held {
                held = gate
                    .released
                    .wait(held)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            *held = true;
        }
        ExecutionGuard::new(key, gate)
    }

    /// Hold the gate only if it is free right now.
    pub fn try_acquire(&self, key: impl Into<ExecutionKey>) -> Option<ExecutionGuard> {
        let key = key.into();
        let gate = self.gate(key);
        {
            let mut held = gate.held();
            if *held {
                return None;
            }
            *held = true;
        }
        Some(ExecutionGuard::new(key, gate))
    }

    /// Like [`acquire`](Self::acquire) but gives up with
    /// [`BatchError::Interrupted`] once `token` is cancelled.
    pub fn acquire_cancellable(
        &self,
        key: impl Into<ExecutionKey>,
        token: &CancellationToken,
    ) -> BatchResult<ExecutionGuard> {
        let key = key.into();
        let gate = self.gate(key);
        {
            let mut held = gate.held();
            while *held {
                if let Some(reason) = token.reason() {
                    return Err(BatchError::interrupted(reason));
                }
                held = gate
                    .released
                    .wait_timeout(held, CANCEL_POLL)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            *held = true;
        }
        Ok(ExecutionGuard::new(key, gate))
    }

    pub fn is_locked(&self, key: impl Into<ExecutionKey>) -> bool {
        let gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        gates.get(&key.into()).is_some_and(|gate| *gate.held())
    }

    /// Forget the gate for a finished execution. Outstanding guards stay valid.
    pub fn remove(&self, key: impl Into<ExecutionKey>) {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        gates.remove(&key.into());
    }

    pub fn len(&self) -> usize {
        self.gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Held gate. Released on drop.
pub struct ExecutionGuard {
    key: ExecutionKey,
    gate: Option<Arc<Gate>>,
}

impl fmt::Debug for ExecutionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionGuard")
            .field("key", &self.key)
            .field("held", &self.gate.is_some())
            .finish()
    }
}

impl ExecutionGuard {
    fn new(key: ExecutionKey, gate: Arc<Gate>) -> Self {
        Self {
            key,
            gate: Some(gate),
        }
    }

    pub fn key(&self) -> ExecutionKey {
        self.key
    }

    pub fn release(mut self) {
        self.release_gate();
    }

    fn release_gate(&mut self) {
        if let Some(gate) = self.gate.take() {
            gate.release();
        }
    }
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        self.release_gate();
    }
}
