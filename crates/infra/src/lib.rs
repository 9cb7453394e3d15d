//! `forgebatch-infra`: execution layer.
//!
//! - [`repository`] and [`transaction`]: the collaborator contracts the engine
//!   calls, with in-memory implementations.
//! - [`synchronizer`]: per-execution gates.
//! - [`step`]: the chunk executor.
//! - [`item`]: reader/processor/writer contracts and the chunk-oriented handler.
//! - [`job`]: sequential jobs and the launcher.
//! - [`config`]: environment-driven engine settings.

pub mod config;
pub mod item;
pub mod job;
pub mod repository;
pub mod step;
pub mod synchronizer;
pub mod transaction;

pub use config::BatchConfig;
pub use item::{
    ChunkOrientedHandler, ItemProcessor, ItemReader, ItemStream, ItemWriter,
    LimitCheckingSkipPolicy, ListItemReader, ListItemWriter, NeverSkipItemPolicy,
    PassThroughItemProcessor, SkipPolicy,
};
pub use job::{Job, JobLauncher, JobRunHandle, SimpleJob};
pub use repository::{InMemoryJobRepository, JobRepository, RepositoryError};
pub use step::{ChunkContext, ChunkHandler, ChunkPhase, ChunkStep, Step, StepListener};
pub use synchronizer::{ExecutionGuard, ExecutionKey, ExecutionSynchronizer};
pub use transaction::{
    InMemoryTransactionManager, TransactionAttributes, TransactionHandle, TransactionManager,
    TransactionScope, TransactionStats,
};
