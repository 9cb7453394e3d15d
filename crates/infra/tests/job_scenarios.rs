//! Launch, restart and stop scenarios through the job launcher.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use forgebatch_core::{
    BatchError, BatchResult, BatchStatus, ExitStatus, JobParameters, RepeatStatus,
    StepContribution,
};
use forgebatch_infra::item::{ChunkOrientedHandler, ListItemReader, ListItemWriter};
use forgebatch_infra::repository::{InMemoryJobRepository, JobRepository};
use forgebatch_infra::step::{ChunkContext, ChunkStep};
use forgebatch_infra::transaction::InMemoryTransactionManager;
use forgebatch_infra::{Job, JobLauncher, SimpleJob};

use common::{numbers, FailingRepository, StagedStore, StagingHandler};

fn run_date() -> JobParameters {
    JobParameters::new().with("run.date", "2026-10-18")
}

#[test]
fn restart_resumes_after_the_last_committed_chunk() -> Result<()> {
    forgebatch_observability::init();
    let repository = InMemoryJobRepository::arc();
    let transactions = InMemoryTransactionManager::arc();
    let writer = ListItemWriter::new();

    let failed_once = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&failed_once);
    let processor = move |item: u32| -> BatchResult<Option<u32>> {
        if item == 3 && !flag.swap(true, Ordering::SeqCst) {
            return Err(BatchError::item("parse", "record 3 is malformed"));
        }
        Ok(Some(item))
    };
    let handler = ChunkOrientedHandler::new(
        ListItemReader::new("input", numbers(6)),
        processor,
        writer.clone(),
    )
    .with_commit_interval(2);
    let job = SimpleJob::new("import", repository.clone()).with_step(ChunkStep::new(
        "load",
        handler,
        repository.clone(),
        transactions.clone(),
    ));
    let launcher = JobLauncher::new(repository.clone());

    let first = launcher.run(&job, &run_date())?;
    assert_eq!(first.status(), BatchStatus::Failed);
    assert_eq!(first.exit_status().exit_code(), ExitStatus::FAILED);
    let load = first.step_execution("load").expect("load ran");
    assert_eq!(load.read_count(), 2);
    assert_eq!(load.commit_count(), 1);
    assert_eq!(load.rollback_count(), 1);
    assert_eq!(writer.written(), vec![1, 2]);

    let second = launcher.run(&job, &run_date())?;
    assert_eq!(second.status(), BatchStatus::Completed);
    assert_eq!(second.job_instance().id(), first.job_instance().id());
    let load = second.step_execution("load").expect("load ran again");
    assert_eq!(load.read_count(), 4);
    assert_eq!(load.write_count(), 4);
    assert_eq!(writer.written(), numbers(6));

    let stored = repository
        .last_step_execution(second.job_instance(), "load")?
        .expect("load is recorded");
    assert_eq!(stored.execution_context.get_long("input.read.count"), Some(6));

    let third = launcher.run(&job, &run_date());
    assert!(matches!(third, Err(BatchError::JobInstanceAlreadyComplete(_))));
    Ok(())
}

#[test]
fn unknown_outcome_blocks_automatic_restart() -> Result<()> {
    let repository = Arc::new(FailingRepository::new(|step| step.read_count() == 4));
    let store = StagedStore::arc();
    let job = SimpleJob::new("import", repository.clone()).with_step(ChunkStep::new(
        "load",
        StagingHandler::new(numbers(5), 2, Arc::clone(&store)),
        repository.clone(),
        store.clone(),
    ));
    let launcher = JobLauncher::new(repository.clone());

    let first = launcher.run(&job, &run_date())?;
    assert_eq!(first.status(), BatchStatus::Unknown);
    assert_eq!(first.exit_status().exit_code(), ExitStatus::UNKNOWN);
    assert!(first.all_failures().iter().any(BatchError::is_fatal));
    let stored = repository
        .job_execution(first.id())?
        .expect("execution is stored");
    assert_eq!(stored.status(), BatchStatus::Unknown);

    let again = launcher.run(&job, &run_date());
    assert!(matches!(again, Err(BatchError::JobRestart(_))));
    assert_eq!(store.committed(), vec![1, 2]);
    Ok(())
}

/// Job whose single step never runs out of input; each chunk takes `pause`.
fn endless_job(
    repository: Arc<InMemoryJobRepository>,
    transactions: Arc<InMemoryTransactionManager>,
    pause: Duration,
) -> (SimpleJob, mpsc::Receiver<u64>) {
    let (started, chunks) = mpsc::sync_channel(64);
    let handler = move |contribution: &mut StepContribution,
                        chunk: &ChunkContext|
          -> BatchResult<RepeatStatus> {
        let _ = started.try_send(chunk.chunk_number());
        thread::sleep(pause);
        contribution.increment_read_count_by(10);
        contribution.increment_write_count(10);
        Ok(RepeatStatus::Continuable)
    };
    let job = SimpleJob::new("tail", repository.clone()).with_step(ChunkStep::new(
        "follow",
        handler,
        repository,
        transactions,
    ));
    (job, chunks)
}

#[test]
fn stop_request_ends_the_job_at_a_chunk_boundary() -> Result<()> {
    let repository = InMemoryJobRepository::arc();
    let transactions = InMemoryTransactionManager::arc();
    let (job, chunks) = endless_job(
        repository.clone(),
        transactions.clone(),
        Duration::from_millis(50),
    );
    let launcher = Arc::new(JobLauncher::new(repository.clone()));

    let handle = launcher.spawn(Arc::new(job), run_date())?;
    assert_eq!(chunks.recv_timeout(Duration::from_secs(5))?, 1);
    launcher.stop(handle.execution_id())?;
    let execution = handle.join()?;

    assert_eq!(execution.status(), BatchStatus::Stopped);
    assert_eq!(execution.exit_status().exit_code(), ExitStatus::STOPPED);
    let step = execution.step_execution("follow").expect("step ran");
    assert_eq!(step.status(), BatchStatus::Stopped);
    assert!(step.commit_count() >= 1);
    assert_eq!(step.rollback_count(), 0);
    assert_eq!(step.read_count(), 10 * step.commit_count());

    let stats = transactions.stats();
    assert_eq!(stats.committed, step.commit_count());
    assert_eq!((stats.rolled_back, stats.active), (0, 0));

    let stored = repository
        .job_execution(execution.id())?
        .expect("execution is stored");
    assert_eq!(stored.status(), BatchStatus::Stopped);
    assert!(stored.end_time.is_some());
    assert!(launcher.running_executions().is_empty());

    let idle = launcher.stop(execution.id());
    assert!(matches!(idle, Err(BatchError::Validation(_))));
    Ok(())
}

#[test]
fn running_instance_cannot_be_launched_twice() -> Result<()> {
    let repository = InMemoryJobRepository::arc();
    let transactions = InMemoryTransactionManager::arc();
    let (job, chunks) = endless_job(repository.clone(), transactions, Duration::from_millis(5));
    let job: Arc<dyn Job> = Arc::new(job);
    let launcher = Arc::new(JobLauncher::new(repository.clone()));

    let handle = launcher.spawn(Arc::clone(&job), run_date())?;
    chunks.recv_timeout(Duration::from_secs(5))?;
    assert_eq!(launcher.running_executions(), vec![handle.execution_id()]);

    let second = launcher.run(job.as_ref(), &run_date());
    assert!(matches!(second, Err(BatchError::JobExecutionAlreadyRunning(_))));

    launcher.stop(handle.execution_id())?;
    let execution = handle.join()?;
    assert_eq!(execution.status(), BatchStatus::Stopped);

    // A stopped instance may be restarted.
    let (restart_job, _chunks) = endless_job(
        repository.clone(),
        InMemoryTransactionManager::arc(),
        Duration::from_millis(5),
    );
    let restarted = launcher.spawn(Arc::new(restart_job), run_date())?;
    assert_ne!(restarted.execution_id(), execution.id());
    launcher.stop(restarted.execution_id())?;
    assert_eq!(restarted.join()?.status(), BatchStatus::Stopped);
    Ok(())
}
