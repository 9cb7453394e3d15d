//! Item-level contracts consumed by chunk-oriented steps.
//!
//! Readers and writers are streams: they are opened with the step's restored
//! [`ExecutionContext`], asked to save their position into it before every
//! commit, and closed when the step ends.

mod chunk;
mod list;
mod skip;

pub use chunk::ChunkOrientedHandler;
pub use list::{ListItemReader, ListItemWriter};
pub use skip::{LimitCheckingSkipPolicy, NeverSkipItemPolicy, SkipPolicy};

use forgebatch_core::{BatchResult, ExecutionContext};

/// Restartable resource bound to a step's execution context.
pub trait ItemStream {
    fn open(&mut self, _context: &ExecutionContext) -> BatchResult<()> {
        Ok(())
    }

    /// Save restart state. Called inside the chunk transaction, before the
    /// context is persisted.
    fn update(&mut self, _context: &mut ExecutionContext) -> BatchResult<()> {
        Ok(())
    }

    fn close(&mut self) -> BatchResult<()> {
        Ok(())
    }
}

/// Source of items. `Ok(None)` means the input is exhausted.
pub trait ItemReader<T>: ItemStream + Send {
    fn read(&mut self) -> BatchResult<Option<T>>;
}

/// Transforms one item. Returning `Ok(None)` filters the item out.
pub trait ItemProcessor<I, O>: Send + Sync {
    fn process(&self, item: I) -> BatchResult<Option<O>>;
}

impl<I, O, F> ItemProcessor<I, O> for F
where
    F: Fn(I) -> BatchResult<Option<O>> + Send + Sync,
{
    fn process(&self, item: I) -> BatchResult<Option<O>> {
        self(item)
    }
}

/// Identity processor.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughItemProcessor;

impl<T> ItemProcessor<T, T> for PassThroughItemProcessor {
    fn process(&self, item: T) -> BatchResult<Option<T>> {
        Ok(Some(item))
    }
}

/// Sink for a chunk's processed items.
pub trait ItemWriter<T>: ItemStream + Send {
    fn write(&mut self, items: &[T]) -> BatchResult<()>;
}
