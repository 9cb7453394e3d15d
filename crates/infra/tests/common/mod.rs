//! Test doubles shared by the scenario tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use forgebatch_core::{
    BatchError, BatchResult, JobExecution, JobExecutionId, JobInstance, JobParameters,
    RepeatStatus, StepContribution, StepExecution, StepExecutionId,
};
use forgebatch_infra::item::{ItemReader, ItemStream, ListItemReader};
use forgebatch_infra::repository::{InMemoryJobRepository, JobRepository, RepositoryError};
use forgebatch_infra::step::{ChunkContext, ChunkHandler};
use forgebatch_infra::transaction::{
    InMemoryTransactionManager, TransactionAttributes, TransactionHandle, TransactionManager,
};
use uuid::Uuid;

type StepPredicate = Box<dyn Fn(&StepExecution) -> bool + Send + Sync>;

/// In-memory repository whose step-context writes fail once, the first time
/// the predicate matches.
pub struct FailingRepository {
    inner: InMemoryJobRepository,
    fail_when: StepPredicate,
    armed: AtomicBool,
}

impl FailingRepository {
    pub fn new<F>(fail_when: F) -> Self
    where
        F: Fn(&StepExecution) -> bool + Send + Sync + 'static,
    {
        Self {
            inner: InMemoryJobRepository::new(),
            fail_when: Box::new(fail_when),
            armed: AtomicBool::new(true),
        }
    }

    pub fn has_fired(&self) -> bool {
        !self.armed.load(Ordering::SeqCst)
    }
}

impl JobRepository for FailingRepository {
    fn create_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<JobExecution, RepositoryError> {
        self.inner.create_job_execution(job_name, parameters)
    }

    fn update_job_execution(&self, execution: &mut JobExecution) -> Result<(), RepositoryError> {
        self.inner.update_job_execution(execution)
    }

    fn add_step_execution(&self, step: &mut StepExecution) -> Result<(), RepositoryError> {
        self.inner.add_step_execution(step)
    }

    fn update_step_execution(&self, step: &mut StepExecution) -> Result<(), RepositoryError> {
        self.inner.update_step_execution(step)
    }

    fn update_step_execution_context(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        if (self.fail_when)(step) && self.armed.swap(false, Ordering::SeqCst) {
            return Err(RepositoryError::Storage("connection reset".into()));
        }
        self.inner.update_step_execution_context(step)
    }

    fn update_job_execution_context(
        &self,
        execution: &JobExecution,
    ) -> Result<(), RepositoryError> {
        self.inner.update_job_execution_context(execution)
    }

    fn last_step_execution(
        &self,
        instance: &JobInstance,
        step_name: &str,
    ) -> Result<Option<StepExecution>, RepositoryError> {
        self.inner.last_step_execution(instance, step_name)
    }

    fn step_execution_count(
        &self,
        instance: &JobInstance,
        step_name: &str,
    ) -> Result<usize, RepositoryError> {
        self.inner.step_execution_count(instance, step_name)
    }

    fn last_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobExecution>, RepositoryError> {
        self.inner.last_job_execution(job_name, parameters)
    }

    fn job_instance_exists(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<bool, RepositoryError> {
        self.inner.job_instance_exists(job_name, parameters)
    }

    fn job_execution(&self, id: JobExecutionId) -> Result<Option<JobExecution>, RepositoryError> {
        self.inner.job_execution(id)
    }

    fn step_execution(
        &self,
        id: StepExecutionId,
    ) -> Result<Option<StepExecution>, RepositoryError> {
        self.inner.step_execution(id)
    }
}

/// Transactional sink: writes are staged per transaction and only become
/// visible on commit. Can be told to fail a given commit.
#[derive(Default)]
pub struct StagedStore {
    transactions: InMemoryTransactionManager,
    pending: Mutex<HashMap<Uuid, Vec<u32>>>,
    committed: Mutex<Vec<u32>>,
    commits: AtomicU64,
    fail_commit: Mutex<Option<u64>>,
}

impl StagedStore {
    pub fn arc() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the `n`th commit (1-based), once.
    pub fn fail_commit_number(&self, n: u64) {
        *self.fail_commit.lock().unwrap_or_else(PoisonError::into_inner) = Some(n);
    }

    pub fn stage(&self, transaction: &TransactionHandle, items: &[u32]) {
        self.pending
            .lock()
            .unwrap()
            .entry(transaction.id())
            .or_default()
            .extend_from_slice(items);
    }

    pub fn committed(&self) -> Vec<u32> {
        self.committed.lock().unwrap().clone()
    }

    pub fn pending_transactions(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn stats(&self) -> forgebatch_infra::transaction::TransactionStats {
        self.transactions.stats()
    }
}

impl TransactionManager for StagedStore {
    fn begin(&self, attributes: &TransactionAttributes) -> BatchResult<TransactionHandle> {
        self.transactions.begin(attributes)
    }

    fn commit(&self, handle: &TransactionHandle) -> BatchResult<()> {
        let number = self.commits.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut fail = self.fail_commit.lock().unwrap();
            if *fail == Some(number) {
                *fail = None;
                return Err(BatchError::transaction("commit rejected by resource"));
            }
        }
        self.transactions.commit(handle)?;
        let staged = self.pending.lock().unwrap().remove(&handle.id()).unwrap_or_default();
        self.committed.lock().unwrap().extend(staged);
        Ok(())
    }

    fn rollback(&self, handle: &TransactionHandle) -> BatchResult<()> {
        self.pending.lock().unwrap().remove(&handle.id());
        self.transactions.rollback(handle)
    }
}

/// Chunk handler reading from a list and staging writes into a
/// [`StagedStore`] under the chunk's transaction.
pub struct StagingHandler {
    reader: Mutex<ListItemReader<u32>>,
    store: Arc<StagedStore>,
    chunk_size: usize,
}

impl StagingHandler {
    pub fn new(items: Vec<u32>, chunk_size: usize, store: Arc<StagedStore>) -> Self {
        Self {
            reader: Mutex::new(ListItemReader::new("input", items)),
            store,
            chunk_size,
        }
    }
}

impl ChunkHandler for StagingHandler {
    fn handle(
        &self,
        contribution: &mut StepContribution,
        chunk: &ChunkContext,
    ) -> BatchResult<RepeatStatus> {
        let mut reader = self.reader.lock().unwrap();
        let mut items = Vec::with_capacity(self.chunk_size);
        let mut exhausted = false;
        while items.len() < self.chunk_size {
            match reader.read()? {
                Some(item) => items.push(item),
                None => {
                    exhausted = true;
                    break;
                }
            }
        }
        contribution.increment_read_count_by(items.len() as u64);
        self.store.stage(chunk.transaction(), &items);
        contribution.increment_write_count(items.len() as u64);
        Ok(RepeatStatus::continue_if(!exhausted))
    }

    fn open(&self, context: &forgebatch_core::ExecutionContext) -> BatchResult<()> {
        self.reader.lock().unwrap().open(context)
    }

    fn update(&self, context: &mut forgebatch_core::ExecutionContext) -> BatchResult<()> {
        self.reader.lock().unwrap().update(context)
    }
}

pub fn numbers(n: u32) -> Vec<u32> {
    (1..=n).collect()
}
