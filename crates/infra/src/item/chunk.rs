use std::fmt;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use forgebatch_core::{BatchError, BatchResult, ExecutionContext, RepeatStatus, StepContribution};
use forgebatch_repeat::{
    CompletionPolicy, RepeatTemplate, RetryTemplate, SimpleCompletionPolicy,
};

use super::{ItemProcessor, ItemReader, ItemWriter, NeverSkipItemPolicy, SkipPolicy};
use crate::step::{ChunkContext, ChunkHandler};

/// Read-process-write chunk handler.
///
/// Items are read one at a time by a nested repeat loop until the chunk
/// completion policy is satisfied or the reader is exhausted, then processed,
/// then written in one call. Counts land on the contribution: reads even when
/// a later read fails, filters for items the processor dropped, writes only
/// after the writer succeeded.
///
/// Failures the skip policy accepts do not fail the chunk. A skipped read or
/// process failure drops that item. A skippable write failure makes the
/// handler write the chunk again one item at a time, skipping the items that
/// still fail; writers must leave nothing behind from a failed call.
pub struct ChunkOrientedHandler<I, O> {
    reader: Mutex<Box<dyn ItemReader<I>>>,
    processor: Arc<dyn ItemProcessor<I, O>>,
    writer: Mutex<Box<dyn ItemWriter<O>>>,
    chunk_policy: Arc<dyn CompletionPolicy>,
    skip_policy: Arc<dyn SkipPolicy>,
    retry: Option<RetryTemplate>,
}

impl<I, O> fmt::Debug for ChunkOrientedHandler<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkOrientedHandler")
            .field("retry", &self.retry.is_some())
            .finish_non_exhaustive()
    }
}

impl<I: Send + 'static, O: Send + 'static> ChunkOrientedHandler<I, O> {
    pub fn new<R, P, W>(reader: R, processor: P, writer: W) -> Self
    where
        R: ItemReader<I> + 'static,
        P: ItemProcessor<I, O> + 'static,
        W: ItemWriter<O> + 'static,
    {
        Self {
            reader: Mutex::new(Box::new(reader)),
            processor: Arc::new(processor),
            writer: Mutex::new(Box::new(writer)),
            chunk_policy: Arc::new(SimpleCompletionPolicy::default()),
            skip_policy: Arc::new(NeverSkipItemPolicy),
            retry: None,
        }
    }

    /// Items per chunk. Zero is treated as one.
    pub fn with_commit_interval(mut self, commit_interval: usize) -> Self {
        self.chunk_policy = Arc::new(SimpleCompletionPolicy::new(commit_interval));
        self
    }

    pub fn with_chunk_completion_policy(mut self, policy: Arc<dyn CompletionPolicy>) -> Self {
        self.chunk_policy = policy;
        self
    }

    pub fn with_skip_policy<S: SkipPolicy + 'static>(mut self, policy: S) -> Self {
        self.skip_policy = Arc::new(policy);
        self
    }

    /// Retry failed writes of a chunk's processed items.
    pub fn with_retry(mut self, retry: RetryTemplate) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Items read, reads skipped and the outcome of the item loop.
    fn read_chunk(&self, chunk: &ChunkContext) -> (Vec<I>, u64, BatchResult<RepeatStatus>) {
        let buffer = Mutex::new(Vec::new());
        let skipped = AtomicU64::new(0);
        let item_loop = RepeatTemplate::new()
            .with_shared_completion_policy(Arc::clone(&self.chunk_policy))
            .with_cancellation_token(chunk.token().clone());

        let outcome = item_loop.iterate(Some(chunk.iteration()), |_| {
            match self.read_skipping(chunk, &skipped)? {
                Some(item) => {
                    lock(&buffer).push(item);
                    Ok(RepeatStatus::Continuable)
                }
                None => Ok(RepeatStatus::Finished),
            }
        });
        let items = buffer.into_inner().unwrap_or_else(PoisonError::into_inner);
        (items, skipped.into_inner(), outcome)
    }

    fn read_skipping(&self, chunk: &ChunkContext, skipped: &AtomicU64) -> BatchResult<Option<I>> {
        loop {
            let error = match lock(&self.reader).read() {
                Ok(item) => return Ok(item),
                Err(error) => error,
            };
            let so_far = chunk.skip_count() + skipped.load(Ordering::SeqCst);
            if !self.skip_policy.should_skip(&error, so_far)? {
                return Err(error);
            }
            skipped.fetch_add(1, Ordering::SeqCst);
            debug!(
                step = %chunk.step_name(),
                chunk = chunk.chunk_number(),
                error = %error,
                "read skipped"
            );
        }
    }

    fn should_skip(
        &self,
        error: &BatchError,
        contribution: &StepContribution,
        chunk: &ChunkContext,
    ) -> BatchResult<bool> {
        self.skip_policy
            .should_skip(error, chunk.skip_count() + contribution.skip_count())
    }

    fn write(&self, items: &[O], chunk: &ChunkContext) -> BatchResult<()> {
        match &self.retry {
            Some(retry) => retry.execute(Some(chunk.iteration()), chunk.token(), |_| {
                lock(&self.writer).write(items)
            }),
            None => lock(&self.writer).write(items),
        }
    }

    /// Write `outputs`, falling back to item-by-item writes when the chunk
    /// write fails with a skippable error. Returns the number of items written.
    fn write_skipping(
        &self,
        outputs: &[O],
        contribution: &mut StepContribution,
        chunk: &ChunkContext,
    ) -> BatchResult<u64> {
        let error = match self.write(outputs, chunk) {
            Ok(()) => return Ok(outputs.len() as u64),
            Err(error) => error,
        };
        if !self.should_skip(&error, contribution, chunk)? {
            return Err(error);
        }

        debug!(
            step = %chunk.step_name(),
            chunk = chunk.chunk_number(),
            error = %error,
            "scanning chunk item by item"
        );
        let mut written = 0;
        for output in outputs {
            match self.write(slice::from_ref(output), chunk) {
                Ok(()) => written += 1,
                Err(error) if self.should_skip(&error, contribution, chunk)? => {
                    contribution.increment_write_skip_count();
                    debug!(
                        step = %chunk.step_name(),
                        chunk = chunk.chunk_number(),
                        error = %error,
                        "write skipped"
                    );
                }
                Err(error) => return Err(error),
            }
        }
        Ok(written)
    }
}

impl<I: Send + 'static, O: Send + 'static> ChunkHandler for ChunkOrientedHandler<I, O> {
    fn handle(
        &self,
        contribution: &mut StepContribution,
        chunk: &ChunkContext,
    ) -> BatchResult<RepeatStatus> {
        let (items, read_skips, outcome) = self.read_chunk(chunk);
        contribution.increment_read_count_by(items.len() as u64);
        for _ in 0..read_skips {
            contribution.increment_read_skip_count();
        }
        let status = outcome?;
        if items.is_empty() && read_skips == 0 && status.is_continuable() {
            return Err(BatchError::validation(format!(
                "chunk {} of step {} read nothing before its completion policy closed it",
                chunk.chunk_number(),
                chunk.step_name()
            )));
        }

        let mut outputs = Vec::with_capacity(items.len());
        for item in items {
            match self.processor.process(item) {
                Ok(Some(output)) => outputs.push(output),
                Ok(None) => contribution.increment_filter_count(),
                Err(error) if self.should_skip(&error, contribution, chunk)? => {
                    contribution.increment_process_skip_count();
                    debug!(
                        step = %chunk.step_name(),
                        chunk = chunk.chunk_number(),
                        error = %error,
                        "process skipped"
                    );
                }
                Err(error) => return Err(error),
            }
        }

        if !outputs.is_empty() {
            let written = self.write_skipping(&outputs, contribution, chunk)?;
            contribution.increment_write_count(written);
        }

        debug!(
            step = %chunk.step_name(),
            chunk = chunk.chunk_number(),
            read = contribution.read_count(),
            written = contribution.write_count(),
            filtered = contribution.filter_count(),
            skipped = contribution.skip_count(),
            "chunk items handled"
        );
        Ok(status)
    }

    fn open(&self, context: &ExecutionContext) -> BatchResult<()> {
        lock(&self.reader).open(context)?;
        lock(&self.writer).open(context)
    }

    fn update(&self, context: &mut ExecutionContext) -> BatchResult<()> {
        lock(&self.reader).update(context)?;
        lock(&self.writer).update(context)
    }

    fn close(&self) -> BatchResult<()> {
        let reader = lock(&self.reader).close();
        let writer = lock(&self.writer).close();
        match (reader, writer) {
            (Err(first), Err(second)) => Err(first.prefer(second)),
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => Ok(()),
        }
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
