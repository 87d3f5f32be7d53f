//! Stage workers and their daemon runner.
//!
//! Each enrichment stage has one worker consuming from its own queue
//! under a bounded-concurrency daemon. Workers share a common contract:
//! claim the record's stage via compare-and-set, execute under the stage's
//! rate limiter and the shared retry policy, write the terminal outcome
//! through the store, and emit a [`StageEvent`]. A worker never dispatches
//! work to another stage; composition is the orchestrator's job.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::policy::{RateLimiter, RetryPolicy};
use crate::store::RecordStore;
use crate::types::{BatchId, BatchStatus, Record, RecordId, Stage, StageEvent, StageOutcome};

pub mod address;
pub mod classify;
pub mod merchant;
pub mod predict;
pub mod supplier;

pub use address::AddressWorker;
pub use classify::ClassifyWorker;
pub use merchant::MerchantDaemon;
pub use predict::PredictWorker;
pub use supplier::SupplierWorker;

/// One unit of stage work: a record within its batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageJob {
    pub batch_id: BatchId,
    pub record_id: RecordId,
}

/// Shared dependencies handed to every stage worker.
#[derive(Clone)]
pub struct StageContext {
    pub store: Arc<dyn RecordStore>,
    pub events: mpsc::UnboundedSender<StageEvent>,
    pub limiter: Arc<RateLimiter>,
    pub retry: RetryPolicy,
}

impl StageContext {
    /// Claim a job's stage for processing.
    ///
    /// Returns `None` (doing nothing) when the batch is cancelled or the
    /// stage already left `pending` — a duplicate dispatch or a late job
    /// against a terminal stage.
    pub async fn begin(&self, job: &StageJob, stage: Stage) -> Result<Option<Record>> {
        let batch = self.store.get_batch(job.batch_id).await?;
        if batch.status == BatchStatus::Cancelled {
            tracing::debug!(batch_id = %job.batch_id, stage = %stage, "Dropping job for cancelled batch");
            return Ok(None);
        }
        if !self.store.mark_stage_in_progress(job.record_id, stage).await? {
            tracing::debug!(record_id = %job.record_id, stage = %stage, "Stage already claimed or terminal");
            return Ok(None);
        }
        let record = self.store.get_record(job.record_id).await?;
        Ok(Some(record))
    }

    /// Write a terminal outcome and notify the orchestrator.
    ///
    /// The store's compare-and-set drops the write silently if some other
    /// path already finished the stage; in that case no event is emitted.
    pub async fn finish(&self, job: &StageJob, stage: Stage, outcome: StageOutcome) -> Result<()> {
        let status = outcome.status;
        let applied = self
            .store
            .complete_stage(job.record_id, stage, outcome)
            .await?;
        if applied {
            let _ = self.events.send(StageEvent {
                batch_id: job.batch_id,
                record_id: job.record_id,
                stage,
                status,
            });
        }
        Ok(())
    }

    /// Common short-circuit: skip the stage for excluded records.
    pub async fn skip_if_excluded(
        &self,
        job: &StageJob,
        stage: Stage,
        record: &Record,
    ) -> Result<bool> {
        if record.is_excluded {
            self.finish(job, stage, StageOutcome::skipped("excluded"))
                .await?;
            return Ok(true);
        }
        Ok(false)
    }
}

/// A single-record stage worker.
#[async_trait]
pub trait StageWorker: Send + Sync + 'static {
    fn stage(&self) -> Stage;

    /// Process one job to a terminal stage status. Errors are daemon-level
    /// (store unavailable); collaborator failures terminate the stage for
    /// the record instead of erroring here.
    async fn process(&self, job: StageJob) -> Result<()>;
}

/// Daemon driving one stage's queue with bounded concurrency.
pub struct StageDaemon<W: StageWorker> {
    worker: Arc<W>,
    queue: mpsc::UnboundedReceiver<StageJob>,
    concurrency: usize,
    cancel: CancellationToken,
}

impl<W: StageWorker> StageDaemon<W> {
    pub fn new(
        worker: Arc<W>,
        queue: mpsc::UnboundedReceiver<StageJob>,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            worker,
            queue,
            concurrency: concurrency.max(1),
            cancel,
        }
    }

    /// Spawn the daemon as a background task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    #[tracing::instrument(skip(self), fields(stage = %self.worker.stage()))]
    async fn run(mut self) {
        tracing::info!(concurrency = self.concurrency, "Stage daemon starting");
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut join_set: JoinSet<()> = JoinSet::new();

        loop {
            // Reap finished tasks without blocking.
            while let Some(result) = join_set.try_join_next() {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Stage task panicked");
                }
            }

            let job = tokio::select! {
                _ = self.cancel.cancelled() => break,
                job = self.queue.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let permit = tokio::select! {
                _ = self.cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let worker = self.worker.clone();
            join_set.spawn(async move {
                let _permit = permit;
                if let Err(e) = worker.process(job).await {
                    tracing::error!(
                        record_id = %job.record_id,
                        stage = %worker.stage(),
                        error = %e,
                        "Stage job failed at the store layer"
                    );
                }
            });
        }

        // Drain in-flight work before exiting.
        while join_set.join_next().await.is_some() {}
        tracing::info!("Stage daemon stopped");
    }
}

/// The senders side of the per-stage queues, injected into the
/// orchestrator.
#[derive(Clone)]
pub struct StageQueues {
    pub classify: mpsc::UnboundedSender<StageJob>,
    pub supplier: mpsc::UnboundedSender<StageJob>,
    pub address: mpsc::UnboundedSender<StageJob>,
    pub merchant: mpsc::UnboundedSender<StageJob>,
    pub predict: mpsc::UnboundedSender<StageJob>,
}

impl StageQueues {
    pub fn sender(&self, stage: Stage) -> &mpsc::UnboundedSender<StageJob> {
        match stage {
            Stage::Classification => &self.classify,
            Stage::Supplier => &self.supplier,
            Stage::Address => &self.address,
            Stage::Merchant => &self.merchant,
            Stage::Prediction => &self.predict,
        }
    }

    /// Enqueue a job for a stage; drops are logged, not fatal (the daemon
    /// side closing means shutdown is underway).
    pub fn dispatch(&self, stage: Stage, job: StageJob) {
        if self.sender(stage).send(job).is_err() {
            tracing::warn!(stage = %stage, record_id = %job.record_id, "Stage queue closed, job dropped");
        }
    }
}

/// Build the queue pair for one stage.
pub fn stage_queue() -> (
    mpsc::UnboundedSender<StageJob>,
    mpsc::UnboundedReceiver<StageJob>,
) {
    mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use crate::types::{Batch, EnabledStages, StageStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingWorker {
        ctx: StageContext,
        processed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl StageWorker for CountingWorker {
        fn stage(&self) -> Stage {
            Stage::Supplier
        }

        async fn process(&self, job: StageJob) -> Result<()> {
            if let Some(_record) = self.ctx.begin(&job, Stage::Supplier).await? {
                self.processed.fetch_add(1, Ordering::SeqCst);
                self.ctx
                    .finish(
                        &job,
                        Stage::Supplier,
                        StageOutcome::completed(crate::types::StageFields::Supplier(None)),
                    )
                    .await?;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_daemon_processes_jobs_and_dedupes() {
        let store = Arc::new(InMemoryStore::new());
        let batch = Batch::new("a.csv".into(), "a-1.csv".into(), EnabledStages::default());
        store.create_batch(&batch).await.unwrap();
        let record = Record::new(batch.id, "Acme".into(), "acme".into(), serde_json::Map::new());
        store.insert_records(&[record.clone()]).await.unwrap();

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let ctx = StageContext {
            store: store.clone(),
            events: events_tx,
            limiter: Arc::new(RateLimiter::unlimited()),
            retry: RetryPolicy::default(),
        };
        let processed = Arc::new(AtomicUsize::new(0));
        let worker = Arc::new(CountingWorker {
            ctx,
            processed: processed.clone(),
        });

        let (tx, rx) = stage_queue();
        let cancel = CancellationToken::new();
        let handle = StageDaemon::new(worker, rx, 2, cancel.clone()).spawn();

        let job = StageJob {
            batch_id: batch.id,
            record_id: record.id,
        };
        tx.send(job).unwrap();
        // Duplicate dispatch: the CAS claim makes the second a no-op.
        tx.send(job).unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(2), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.stage, Stage::Supplier);
        assert_eq!(event.status, StageStatus::Completed);

        // Give the duplicate a moment; it must not produce a second event.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(processed.load(Ordering::SeqCst), 1);
        assert!(events_rx.try_recv().is_err());

        cancel.cancel();
        let _ = handle.await;
    }
}
