//! Search tracker: submission, webhook ingest and result application.
//!
//! The tracker owns every interaction with the card network after the
//! merchant worker has grouped records: it submits bulk searches,
//! registers them, resolves collaborator notifications, and applies
//! results onto records. Application is idempotent: each record's
//! merchant stage is written through the store's compare-and-set, so a
//! webhook arriving after a poll (or the reverse) is a no-op.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;

use crate::clients::{BulkSearchResults, BulkSearchStatus, CardNetwork, ClientError, MerchantHit, MerchantSearchRow};
use crate::error::Result;
use crate::policy::{RateLimiter, RetryPolicy};
use crate::store::RecordStore;
use crate::types::{
    BatchId, MerchantEnrichment, MerchantMatchStatus, SearchId, SearchIdMapping, Stage,
    StageEvent, StageFields, StageOutcome, StageStatus, WebhookEvent,
};

use super::{AnySearch, Polling, SearchData, SearchRequest, WebhookReceived};

/// Webhook event type announcing available results.
pub const EVENT_RESULTS_READY: &str = "BULK_SEARCH_RESULTS_READY";
/// Webhook event type announcing a collaborator-side cancellation.
pub const EVENT_SEARCH_CANCELLED: &str = "BULK_SEARCH_CANCELLED";

pub struct SearchTracker {
    store: Arc<dyn RecordStore>,
    network: Arc<dyn CardNetwork>,
    events: mpsc::UnboundedSender<StageEvent>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    lookup_type: String,
}

impl SearchTracker {
    pub fn new(
        store: Arc<dyn RecordStore>,
        network: Arc<dyn CardNetwork>,
        events: mpsc::UnboundedSender<StageEvent>,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
        lookup_type: String,
    ) -> Self {
        Self {
            store,
            network,
            events,
            limiter,
            retry,
            lookup_type,
        }
    }

    /// Submit one grouped bulk search and register it.
    ///
    /// On submission failure every mapped record's merchant stage is
    /// terminally failed; the rest of the batch is unaffected.
    #[tracing::instrument(skip(self, rows, mapping), fields(batch_id = %batch_id, rows = rows.len()))]
    pub async fn submit(
        &self,
        batch_id: BatchId,
        rows: Vec<MerchantSearchRow>,
        mapping: SearchIdMapping,
    ) -> Result<Option<SearchId>> {
        self.limiter.acquire().await;
        let submitted = self
            .retry
            .run("merchant-submit", || {
                self.network.submit_bulk(&self.lookup_type, &rows)
            })
            .await;

        match submitted {
            Ok(search_id) => {
                let record_id = if mapping.len() == 1 {
                    mapping.values().next().copied()
                } else {
                    None
                };
                let data = SearchData {
                    search_id: search_id.clone(),
                    batch_id,
                    record_id,
                    request_payload: serde_json::to_value(&rows)?,
                    mapping,
                    submitted_at: Utc::now(),
                };
                self.store
                    .insert_search(&SearchRequest::new(data).into())
                    .await?;
                tracing::info!(search_id = %search_id, "Bulk search submitted");
                Ok(Some(search_id))
            }
            Err(err) => {
                tracing::error!(error = %err, "Bulk search submission failed");
                self.fail_mapped_records(batch_id, &mapping, &format!("submission failed: {err}"))
                    .await?;
                Ok(None)
            }
        }
    }

    /// Terminally fail the merchant stage of every mapped record.
    async fn fail_mapped_records(
        &self,
        batch_id: BatchId,
        mapping: &SearchIdMapping,
        reason: &str,
    ) -> Result<()> {
        for record_id in mapping.values() {
            let applied = self
                .store
                .complete_stage(*record_id, Stage::Merchant, StageOutcome::failed(reason))
                .await?;
            if applied {
                let _ = self.events.send(StageEvent {
                    batch_id,
                    record_id: *record_id,
                    stage: Stage::Merchant,
                    status: StageStatus::Failed,
                });
            }
        }
        Ok(())
    }

    /// Apply a bulk result set onto the mapped records. Idempotent: only
    /// non-terminal merchant stages are written. Records without a hit
    /// are completed with `no_match`.
    pub async fn apply_results(&self, data: &SearchData, items: &[MerchantHit]) -> Result<()> {
        let now = Utc::now();
        for (correlation_id, record_id) in &data.mapping {
            let enrichment = match items.iter().find(|i| &i.search_request_id == correlation_id) {
                Some(hit) => MerchantEnrichment {
                    match_status: MerchantMatchStatus::Matched,
                    confidence: hit.confidence,
                    business_name: hit.business_name.clone(),
                    tax_id: hit.tax_id.clone(),
                    merchant_ids: hit.merchant_ids.clone(),
                    mcc: hit.mcc.clone(),
                    mcc_group: hit.mcc_group.clone(),
                    address: hit.address.clone(),
                    city: hit.city.clone(),
                    state: hit.state.clone(),
                    postal_code: hit.postal_code.clone(),
                    transaction_recency: hit.transaction_recency.clone(),
                    commercial_history: hit.commercial_history.clone(),
                    small_business: hit.small_business,
                    last_transaction_date: hit.last_transaction_date.clone(),
                    data_quality_level: hit.data_quality_level.clone(),
                    enriched_at: now,
                },
                None => MerchantEnrichment::no_match(now),
            };

            let applied = self
                .store
                .complete_stage(
                    *record_id,
                    Stage::Merchant,
                    StageOutcome::completed(StageFields::Merchant(Box::new(enrichment))),
                )
                .await?;
            if applied {
                let _ = self.events.send(StageEvent {
                    batch_id: data.batch_id,
                    record_id: *record_id,
                    stage: Stage::Merchant,
                    status: StageStatus::Completed,
                });
            }
        }
        Ok(())
    }

    /// Process a deduplicated webhook notification and record the outcome
    /// on the event row.
    #[tracing::instrument(skip(self, event), fields(event_id = %event.event_id, event_type = %event.event_type))]
    pub async fn handle_event(&self, event: WebhookEvent) {
        let outcome = self.process_notification(&event).await;
        let error = outcome.as_ref().err().map(|e| e.to_string());
        if let Some(err) = &error {
            tracing::error!(event_id = %event.event_id, error = %err, "Webhook event processing failed");
        }
        if let Err(err) = self.store.mark_webhook_event(&event.event_id, error).await {
            tracing::error!(event_id = %event.event_id, error = %err, "Failed to mark webhook event");
        }
    }

    async fn process_notification(&self, event: &WebhookEvent) -> Result<()> {
        let search = self.store.get_search(&event.bulk_request_id).await?;

        match event.event_type.as_str() {
            EVENT_SEARCH_CANCELLED => self.cancel_search(search, "cancelled by collaborator").await,
            EVENT_RESULTS_READY => {
                let received = match search {
                    AnySearch::Submitted(r) => r.notified(self.store.as_ref()).await?,
                    AnySearch::Polling(r) => r.notified(self.store.as_ref()).await?,
                    AnySearch::WebhookReceived(r) => r,
                    terminal => {
                        tracing::debug!(
                            search_id = %terminal.id(),
                            status = %terminal.status(),
                            "Notification for terminal search ignored"
                        );
                        return Ok(());
                    }
                };
                self.fetch_and_apply(received).await
            }
            other => {
                tracing::warn!(event_type = other, "Unrecognized webhook event type");
                Ok(())
            }
        }
    }

    /// Fetch results for a notified search and drive it to a terminal
    /// state.
    async fn fetch_and_apply(&self, received: SearchRequest<WebhookReceived>) -> Result<()> {
        self.limiter.acquire().await;
        let results = self
            .retry
            .run("merchant-results", || {
                self.network.get_search_results(&received.data.search_id)
            })
            .await;

        match results {
            Ok(results) => {
                self.settle(SettleTarget::Webhook(received), results).await
            }
            Err(err) if err.is_auth() || matches!(err, ClientError::NotFound(_)) => {
                let reason = format!("result fetch failed: {err}");
                self.fail_mapped_records(received.data.batch_id, &received.data.mapping, &reason)
                    .await?;
                received.fail(reason, self.store.as_ref()).await?;
                Ok(())
            }
            Err(err) => {
                // Transient; the sweeper retries from webhook_received.
                tracing::warn!(error = %err, "Result fetch failed, leaving for sweeper");
                Err(crate::error::DossierError::Collaborator(err))
            }
        }
    }

    /// One sweeper pass over a single non-terminal search.
    pub async fn resolve(&self, search: AnySearch) -> Result<()> {
        match search {
            AnySearch::Submitted(r) => {
                let polling = r.begin_polling(self.store.as_ref()).await?;
                self.poll(polling).await
            }
            AnySearch::Polling(r) => self.poll(r).await,
            AnySearch::WebhookReceived(r) => self.fetch_and_apply(r).await,
            terminal => {
                tracing::debug!(search_id = %terminal.id(), "Sweeper observed terminal search");
                Ok(())
            }
        }
    }

    async fn poll(&self, polling: SearchRequest<Polling>) -> Result<()> {
        self.limiter.acquire().await;
        let search_id = polling.data.search_id.clone();
        match self.network.get_search_results(&search_id).await {
            Ok(results) => match results.status {
                BulkSearchStatus::InProgress => {
                    let polling = polling.touch(self.store.as_ref()).await?;
                    tracing::debug!(
                        search_id = %search_id,
                        poll_attempts = polling.state.poll_attempts,
                        "Search still in progress"
                    );
                    Ok(())
                }
                _ => self.settle(SettleTarget::Poll(polling), results).await,
            },
            Err(err) if err.is_auth() || matches!(err, ClientError::NotFound(_)) => {
                let reason = format!("poll failed: {err}");
                self.fail_mapped_records(polling.data.batch_id, &polling.data.mapping, &reason)
                    .await?;
                polling.fail(reason, self.store.as_ref()).await?;
                Ok(())
            }
            Err(err) => {
                // Network blip: count the attempt, touch nothing else.
                tracing::warn!(search_id = %search_id, error = %err, "Poll attempt failed");
                polling.touch(self.store.as_ref()).await?;
                Ok(())
            }
        }
    }

    /// Drive a resolved result set to the appropriate terminal state.
    async fn settle(&self, target: SettleTarget, results: BulkSearchResults) -> Result<()> {
        let data = target.data().clone();
        let payload = serde_json::to_value(&results).ok();
        match results.status {
            BulkSearchStatus::Completed => {
                self.apply_results(&data, &results.items).await?;
                target.complete(payload, self.store.as_ref()).await
            }
            BulkSearchStatus::NoMatch => {
                // Terminal success: every record is written as no-match.
                self.apply_results(&data, &[]).await?;
                target.no_match(self.store.as_ref()).await
            }
            BulkSearchStatus::Cancelled => {
                self.fail_mapped_records(data.batch_id, &data.mapping, "cancelled")
                    .await?;
                target.cancel("cancelled by collaborator", self.store.as_ref())
                    .await
            }
            BulkSearchStatus::InProgress => {
                // Only reachable from the webhook path; wait for the sweeper.
                tracing::debug!(search_id = %data.search_id, "Results not ready yet");
                Ok(())
            }
        }
    }

    /// Cancel every non-terminal search of a batch and fail the mapped
    /// records.
    #[tracing::instrument(skip(self), fields(batch_id = %batch_id))]
    pub async fn cancel_batch(&self, batch_id: BatchId, reason: &str) -> Result<()> {
        for search in self.store.searches_for_batch(batch_id).await? {
            if !search.is_terminal() {
                self.cancel_search(search, reason).await?;
            }
        }
        Ok(())
    }

    async fn cancel_search(&self, search: AnySearch, reason: &str) -> Result<()> {
        let data = search.data().clone();
        match search {
            AnySearch::Submitted(r) => {
                r.cancel(reason, self.store.as_ref()).await?;
            }
            AnySearch::Polling(r) => {
                r.cancel(reason, self.store.as_ref()).await?;
            }
            AnySearch::WebhookReceived(r) => {
                r.cancel(reason, self.store.as_ref()).await?;
            }
            terminal => {
                tracing::debug!(search_id = %terminal.id(), "Cancel on terminal search ignored");
                return Ok(());
            }
        }
        self.fail_mapped_records(data.batch_id, &data.mapping, reason)
            .await
    }
}

/// A search ready to settle, from either resolution path.
enum SettleTarget {
    Poll(SearchRequest<Polling>),
    Webhook(SearchRequest<WebhookReceived>),
}

impl SettleTarget {
    fn data(&self) -> &SearchData {
        match self {
            SettleTarget::Poll(r) => &r.data,
            SettleTarget::Webhook(r) => &r.data,
        }
    }

    async fn complete(
        self,
        payload: Option<serde_json::Value>,
        store: &dyn RecordStore,
    ) -> Result<()> {
        match self {
            SettleTarget::Poll(r) => r.complete(payload, store).await.map(|_| ()),
            SettleTarget::Webhook(r) => r.complete(payload, store).await.map(|_| ()),
        }
    }

    async fn no_match(self, store: &dyn RecordStore) -> Result<()> {
        match self {
            SettleTarget::Poll(r) => r.no_match(store).await.map(|_| ()),
            SettleTarget::Webhook(r) => r.no_match(store).await.map(|_| ()),
        }
    }

    async fn cancel(self, reason: &str, store: &dyn RecordStore) -> Result<()> {
        match self {
            SettleTarget::Poll(r) => r.cancel(reason, store).await.map(|_| ()),
            SettleTarget::Webhook(r) => r.cancel(reason, store).await.map(|_| ()),
        }
    }
}
