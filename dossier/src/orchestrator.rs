//! Pipeline orchestrator.
//!
//! Per-batch coordinator: dispatches classification for every record,
//! applies the exclusion filter before any merchant dispatch, fans
//! enrichment out as records finish classifying, keeps the batch's
//! per-stage counters, detects completion and drives cancellation.
//! Workers report terminal stage transitions over the event channel;
//! this is the only component that composes stages.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::exclusion::ExclusionFilter;
use crate::search::SearchTracker;
use crate::stages::{StageJob, StageQueues};
use crate::store::RecordStore;
use crate::types::{
    Batch, BatchId, BatchStatus, RecordId, Stage, StageEvent, StageOutcome, StageStatus,
};

/// Orchestrator-level tunables.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Page size when walking a batch's records at dispatch time.
    pub sub_batch_size: u32,
    /// Defer prediction until the record's other enabled enrichment
    /// stages are terminal.
    pub predict_after_enrichment: bool,
    /// Warn when an enriching batch shows no forward progress for this
    /// long. Never auto-cancels.
    pub stale_warning_after: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            sub_batch_size: 500,
            predict_after_enrichment: true,
            stale_warning_after: Duration::from_secs(30 * 60),
        }
    }
}

pub struct Orchestrator {
    store: Arc<dyn RecordStore>,
    filter: Arc<ExclusionFilter>,
    tracker: Arc<SearchTracker>,
    queues: StageQueues,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        filter: Arc<ExclusionFilter>,
        tracker: Arc<SearchTracker>,
        queues: StageQueues,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            filter,
            tracker,
            queues,
            config,
        }
    }

    /// Spawn the event loop consuming worker stage events.
    pub fn spawn_event_loop(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<StageEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("Orchestrator event loop starting");
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                if let Err(e) = self.handle_event(event).await {
                    tracing::error!(
                        batch_id = %event.batch_id,
                        record_id = %event.record_id,
                        stage = %event.stage,
                        error = %e,
                        "Stage event handling failed"
                    );
                }
            }
            tracing::info!("Orchestrator event loop stopped");
        })
    }

    /// Spawn the stale-batch monitor.
    pub fn spawn_monitor(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let period = Duration::from_secs(60);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = self.warn_stale_batches().await {
                    tracing::error!(error = %e, "Stale batch scan failed");
                }
            }
        })
    }

    // ------------------------------------------------------------------
    // Batch entry points
    // ------------------------------------------------------------------

    /// Dispatch a freshly seeded batch: run the exclusion filter over
    /// every record, then enqueue classification. Enrichment follows per
    /// record as classification lands.
    #[tracing::instrument(skip(self), fields(batch_id = %batch_id))]
    pub async fn submit_batch(&self, batch_id: BatchId) -> Result<()> {
        let total = self.store.count_records(batch_id).await? as u32;
        self.store
            .update_batch_status(batch_id, BatchStatus::Processing, None)
            .await?;
        self.store
            .set_stage_progress(
                batch_id,
                Stage::Classification,
                Some(StageStatus::InProgress),
                Some(total),
            )
            .await?;

        let mut offset: u32 = 0;
        let mut excluded: u32 = 0;
        loop {
            let page = self
                .store
                .list_records(batch_id, offset, self.config.sub_batch_size)
                .await?;
            if page.is_empty() {
                break;
            }
            offset += page.len() as u32;

            for record in page {
                // Exclusion runs before anything is dispatched, so the
                // merchant stage can never be reached by an excluded
                // record. Classification still runs for them.
                if let Some(keyword) = self.filter.match_name(&record.cleaned_name).await? {
                    tracing::debug!(record_id = %record.id, keyword = %keyword, "Record excluded");
                    self.store.mark_excluded(record.id, &keyword).await?;
                    excluded += 1;
                }
                self.queues.dispatch(
                    Stage::Classification,
                    StageJob {
                        batch_id,
                        record_id: record.id,
                    },
                );
            }
        }

        if excluded > 0 {
            self.store.add_skipped_records(batch_id, excluded).await?;
        }
        tracing::info!(total, excluded, "Batch dispatched for classification");
        Ok(())
    }

    /// Cancel a batch: mark it, cancel its outstanding searches, and let
    /// the workers drop any queued jobs for it at their next claim.
    #[tracing::instrument(skip(self), fields(batch_id = %batch_id))]
    pub async fn cancel_batch(&self, batch_id: BatchId) -> Result<()> {
        self.store
            .update_batch_status(batch_id, BatchStatus::Cancelled, Some(Utc::now()))
            .await?;
        self.tracker.cancel_batch(batch_id, "cancelled").await?;
        tracing::info!("Batch cancelled");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Event handling
    // ------------------------------------------------------------------

    async fn handle_event(&self, event: StageEvent) -> Result<()> {
        let succeeded = event.status == StageStatus::Completed;
        let batch = self
            .store
            .record_stage_result(event.batch_id, event.stage, succeeded)
            .await?;

        if batch.status == BatchStatus::Cancelled {
            return Ok(());
        }

        if event.stage == Stage::Classification {
            self.fan_out(&batch, event.record_id).await?;
            self.settle_classification_stage(&batch).await?;
        } else if self.config.predict_after_enrichment
            && batch.enabled.prediction
            && event.stage != Stage::Prediction
        {
            self.maybe_dispatch_prediction(&batch, event.record_id)
                .await?;
        }

        self.check_completion(event.batch_id).await
    }

    /// Dispatch the enabled enrichment stages for one freshly classified
    /// record. Excluded records keep their classification but have
    /// supplier, merchant and prediction skipped; address validation
    /// still runs when enabled.
    async fn fan_out(&self, batch: &Batch, record_id: RecordId) -> Result<()> {
        let record = self.store.get_record(record_id).await?;
        let job = StageJob {
            batch_id: batch.id,
            record_id,
        };

        for stage in batch.enabled.enrichment_stages() {
            if record.stages.get(stage).status.is_terminal() {
                continue;
            }

            // Excluded records never enter the stage's counters: their
            // per-record status goes straight to skipped, and a stage
            // whose total stays at zero aggregates as skipped rather
            // than failed.
            if record.is_excluded && stage != Stage::Address {
                self.store
                    .complete_stage(record_id, stage, StageOutcome::skipped("excluded"))
                    .await?;
                continue;
            }

            self.store.increment_stage_total(batch.id, stage, 1).await?;
            self.store
                .set_stage_progress(batch.id, stage, Some(StageStatus::InProgress), None)
                .await?;

            match stage {
                Stage::Prediction if self.config.predict_after_enrichment => {
                    // Deferred: dispatched once the record's other
                    // enabled stages are terminal.
                    self.maybe_dispatch_prediction(batch, record_id).await?;
                }
                stage => self.queues.dispatch(stage, job),
            }
        }
        Ok(())
    }

    /// Dispatch prediction for a record once every other enabled
    /// enrichment stage is terminal. The worker's claim CAS makes
    /// duplicate dispatches harmless.
    async fn maybe_dispatch_prediction(&self, batch: &Batch, record_id: RecordId) -> Result<()> {
        let record = self.store.get_record(record_id).await?;
        if record.stages.prediction.status != StageStatus::Pending {
            return Ok(());
        }
        if record.is_excluded {
            return Ok(());
        }
        let ready = batch
            .enabled
            .enrichment_stages()
            .into_iter()
            .filter(|s| *s != Stage::Prediction)
            .all(|s| record.stages.get(s).status.is_terminal());
        if ready {
            self.queues.dispatch(
                Stage::Prediction,
                StageJob {
                    batch_id: batch.id,
                    record_id,
                },
            );
        }
        Ok(())
    }

    /// Mark the classification stage complete and move the batch to
    /// `enriching` once every record has classified.
    async fn settle_classification_stage(&self, batch: &Batch) -> Result<()> {
        let counters = batch.stages.classification;
        if counters.total == 0 || counters.processed < counters.total {
            return Ok(());
        }
        self.store
            .set_stage_progress(
                batch.id,
                Stage::Classification,
                Some(StageStatus::Completed),
                None,
            )
            .await?;
        if !batch.enabled.enrichment_stages().is_empty() {
            self.store
                .update_batch_status(batch.id, BatchStatus::Enriching, None)
                .await?;
        }
        Ok(())
    }

    /// Completion detection: the batch terminates once every enabled
    /// stage of every record is terminal. A batch fails only when every
    /// enabled stage of every record failed.
    async fn check_completion(&self, batch_id: BatchId) -> Result<()> {
        let batch = self.store.get_batch(batch_id).await?;
        if batch.status.is_terminal() {
            return Ok(());
        }
        let enabled = batch.enabled.stages();
        let unfinished = self.store.unfinished_stage_count(batch_id, &enabled).await?;
        if unfinished > 0 {
            return Ok(());
        }

        for stage in batch.enabled.enrichment_stages() {
            let counters = *batch.stages.get(stage);
            let status = if counters.total > 0 && counters.succeeded == 0 && counters.processed > 0
            {
                // Nothing in this stage succeeded; the per-record rows
                // hold the detail.
                StageStatus::Failed
            } else if counters.total == 0 {
                StageStatus::Skipped
            } else {
                StageStatus::Completed
            };
            self.store
                .set_stage_progress(batch_id, stage, Some(status), None)
                .await?;
        }

        let all_failed = self.store.all_stages_failed(batch_id, &enabled).await?;
        let final_status = if all_failed {
            BatchStatus::Failed
        } else {
            BatchStatus::Completed
        };
        self.store
            .update_batch_status(batch_id, final_status, Some(Utc::now()))
            .await?;
        tracing::info!(batch_id = %batch_id, status = %final_status, "Batch finished");
        Ok(())
    }

    /// Warn on batches whose outstanding searches have shown no forward
    /// progress past the threshold. Never cancels anything.
    async fn warn_stale_batches(&self) -> Result<()> {
        let threshold = chrono::Duration::from_std(self.config.stale_warning_after)
            .unwrap_or_else(|_| chrono::Duration::minutes(30));
        let cutoff = Utc::now() - threshold;

        for batch in self.store.list_batches().await? {
            if batch.status.is_terminal() {
                continue;
            }
            for search in self.store.searches_for_batch(batch.id).await? {
                if !search.is_terminal() && search.last_activity_at() < cutoff {
                    tracing::warn!(
                        batch_id = %batch.id,
                        search_id = %search.id(),
                        last_activity = %search.last_activity_at(),
                        poll_attempts = search.poll_attempts(),
                        "Merchant search stalled past threshold"
                    );
                }
            }
        }
        Ok(())
    }
}
