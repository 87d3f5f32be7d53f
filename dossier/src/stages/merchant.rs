//! Merchant-enrich worker.
//!
//! Unlike the other stages this worker never produces a result
//! synchronously: it groups pending records from the same batch into bulk
//! submissions (bounded by the collaborator's batch-size ceiling), builds
//! the persisted correlation mapping, and hands the group to the search
//! tracker. Completion is driven later by webhook or the polling sweeper.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use super::{StageContext, StageJob};
use crate::clients::MerchantSearchRow;
use crate::error::Result;
use crate::search::SearchTracker;
use crate::types::{BatchId, BatchStatus, Record, SearchIdMapping, Stage};

#[derive(Debug, Clone)]
pub struct MerchantConfig {
    /// Collaborator ceiling on searches per submission. Larger groups are
    /// split.
    pub max_records_per_search: usize,
    /// How long to linger after the first job to let a sub-batch
    /// accumulate before submitting.
    pub linger: Duration,
    /// Concurrent group submissions.
    pub concurrency: usize,
}

impl Default for MerchantConfig {
    fn default() -> Self {
        Self {
            max_records_per_search: 3000,
            linger: Duration::from_millis(250),
            concurrency: 2,
        }
    }
}

/// Daemon grouping merchant jobs into bulk submissions.
pub struct MerchantDaemon {
    inner: Arc<MerchantInner>,
    queue: mpsc::UnboundedReceiver<StageJob>,
    cancel: CancellationToken,
}

struct MerchantInner {
    ctx: StageContext,
    tracker: Arc<SearchTracker>,
    config: MerchantConfig,
}

impl MerchantDaemon {
    pub fn new(
        ctx: StageContext,
        tracker: Arc<SearchTracker>,
        queue: mpsc::UnboundedReceiver<StageJob>,
        config: MerchantConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(MerchantInner {
                ctx,
                tracker,
                config,
            }),
            queue,
            cancel,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    #[tracing::instrument(skip(self))]
    async fn run(mut self) {
        tracing::info!(
            max_records_per_search = self.inner.config.max_records_per_search,
            "Merchant daemon starting"
        );
        let semaphore = Arc::new(Semaphore::new(self.inner.config.concurrency.max(1)));
        let mut join_set: JoinSet<()> = JoinSet::new();

        loop {
            while let Some(result) = join_set.try_join_next() {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Merchant group task panicked");
                }
            }

            let first = tokio::select! {
                _ = self.cancel.cancelled() => break,
                job = self.queue.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            // Let the orchestrator's fan-out land more jobs before
            // grouping.
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.inner.config.linger) => {}
            }

            let mut jobs = vec![first];
            while let Ok(job) = self.queue.try_recv() {
                jobs.push(job);
            }

            let mut by_batch: HashMap<BatchId, Vec<StageJob>> = HashMap::new();
            for job in jobs {
                by_batch.entry(job.batch_id).or_default().push(job);
            }

            for (batch_id, group) in by_batch {
                let permit = tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };
                let inner = self.inner.clone();
                join_set.spawn(async move {
                    let _permit = permit;
                    if let Err(e) = inner.submit_group(batch_id, group).await {
                        tracing::error!(batch_id = %batch_id, error = %e, "Merchant group submission failed");
                    }
                });
            }
        }

        while join_set.join_next().await.is_some() {}
        tracing::info!("Merchant daemon stopped");
    }
}

impl MerchantInner {
    /// Build one search row per eligible record.
    fn search_row(record: &Record) -> MerchantSearchRow {
        // Prefer the validated address when the address stage already
        // finished; fall back to the raw upload fields.
        let (address, city, state, postal_code) = match &record.validated_address {
            Some(validated) => (Some(validated.formatted_address.clone()), None, None, None),
            None => (
                record.address.clone(),
                record.city.clone(),
                record.state.clone(),
                record.postal_code.clone(),
            ),
        };
        MerchantSearchRow {
            search_request_id: record.id.as_uuid().to_string(),
            business_name: record.cleaned_name.clone(),
            address,
            city,
            state,
            postal_code,
        }
    }

    async fn submit_group(&self, batch_id: BatchId, jobs: Vec<StageJob>) -> Result<()> {
        let batch = self.ctx.store.get_batch(batch_id).await?;
        if batch.status == BatchStatus::Cancelled {
            tracing::debug!(batch_id = %batch_id, "Dropping merchant group for cancelled batch");
            return Ok(());
        }

        let mut rows: Vec<MerchantSearchRow> = Vec::new();
        let mut mapping: SearchIdMapping = HashMap::new();

        for job in &jobs {
            let record = self.ctx.store.get_record(job.record_id).await?;
            if self
                .ctx
                .skip_if_excluded(job, Stage::Merchant, &record)
                .await?
            {
                continue;
            }
            if !self
                .ctx
                .store
                .mark_stage_in_progress(job.record_id, Stage::Merchant)
                .await?
            {
                continue;
            }
            let row = Self::search_row(&record);
            mapping.insert(row.search_request_id.clone(), record.id);
            rows.push(row);
        }

        if rows.is_empty() {
            return Ok(());
        }

        // Split at the collaborator ceiling; each chunk is its own
        // submission with its own persisted mapping.
        for chunk in rows.chunks(self.config.max_records_per_search) {
            let chunk_mapping: SearchIdMapping = chunk
                .iter()
                .filter_map(|row| {
                    mapping
                        .get(&row.search_request_id)
                        .map(|id| (row.search_request_id.clone(), *id))
                })
                .collect();
            self.tracker
                .submit(batch_id, chunk.to_vec(), chunk_mapping)
                .await?;
        }
        Ok(())
    }
}

/// Submission count for a group of rows under the per-search ceiling;
/// exposed for boundary tests.
pub fn chunk_count(rows: usize, max_per_search: usize) -> usize {
    if rows == 0 {
        0
    } else {
        rows.div_ceil(max_per_search.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunking_boundary() {
        assert_eq!(chunk_count(0, 3000), 0);
        assert_eq!(chunk_count(2999, 3000), 1);
        assert_eq!(chunk_count(3000, 3000), 1);
        // One past the ceiling splits.
        assert_eq!(chunk_count(3001, 3000), 2);
    }
}
