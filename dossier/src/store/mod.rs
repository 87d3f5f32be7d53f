//! Persistent keyed storage for batches, records, the supplier read
//! model, exclusion keywords, the async-search registry and webhook
//! events.
//!
//! The store is the only state shared across workers. Terminal stage
//! transitions are compare-and-set: "if the stage is not yet terminal,
//! write the result fields and the terminal status" — implementations
//! return whether the write was applied so callers can drop late results
//! silently.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::search::AnySearch;
use crate::types::{
    Batch, BatchId, BatchStatus, EventId, ExclusionKeyword, KeywordId, KeywordUpdate,
    KnownSupplier, Record, RecordId, SearchId, Stage, StageOutcome, StageStatus, WebhookEvent,
};

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryStore;

#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

/// Storage trait backing the enrichment pipeline.
#[async_trait]
pub trait RecordStore: Send + Sync {
    // ------------------------------------------------------------------
    // Batches
    // ------------------------------------------------------------------

    /// Insert a new batch row.
    async fn create_batch(&self, batch: &Batch) -> Result<()>;

    async fn get_batch(&self, id: BatchId) -> Result<Batch>;

    /// All batches, newest first.
    async fn list_batches(&self) -> Result<Vec<Batch>>;

    /// Set the batch lifecycle status. Terminal batches are left alone
    /// (a cancelled batch never becomes completed).
    async fn update_batch_status(
        &self,
        id: BatchId,
        status: BatchStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Update one stage's aggregate status and/or total on the batch.
    async fn set_stage_progress(
        &self,
        id: BatchId,
        stage: Stage,
        status: Option<StageStatus>,
        total: Option<u32>,
    ) -> Result<()>;

    /// Atomically add `n` to a stage's total on the batch. Enrichment
    /// totals grow as the orchestrator fans records out.
    async fn increment_stage_total(&self, id: BatchId, stage: Stage, n: u32) -> Result<()>;

    /// Atomically count one terminal per-record stage result on the
    /// batch: increments the stage's `processed` (and `succeeded` when
    /// applicable); classification results also bump
    /// `processed_records`. Returns the updated batch.
    async fn record_stage_result(
        &self,
        id: BatchId,
        stage: Stage,
        succeeded: bool,
    ) -> Result<Batch>;

    /// Bump the batch's skipped-record counter by `n`.
    async fn add_skipped_records(&self, id: BatchId, n: u32) -> Result<()>;

    // ------------------------------------------------------------------
    // Records
    // ------------------------------------------------------------------

    async fn insert_records(&self, records: &[Record]) -> Result<()>;

    async fn get_record(&self, id: RecordId) -> Result<Record>;

    async fn records_by_ids(&self, ids: &[RecordId]) -> Result<Vec<Record>>;

    /// Page through a batch's records in creation order.
    async fn list_records(&self, batch_id: BatchId, offset: u32, limit: u32)
        -> Result<Vec<Record>>;

    async fn count_records(&self, batch_id: BatchId) -> Result<u64>;

    /// CAS: transition a record's stage from `pending` to `in_progress`.
    /// Returns false (and writes nothing) if the stage already left
    /// `pending`.
    async fn mark_stage_in_progress(&self, id: RecordId, stage: Stage) -> Result<bool>;

    /// CAS: write a terminal stage outcome. Returns false (and writes
    /// nothing) if the stage is already terminal.
    async fn complete_stage(&self, id: RecordId, stage: Stage, outcome: StageOutcome)
        -> Result<bool>;

    /// Flag a record as excluded by the given keyword.
    async fn mark_excluded(&self, id: RecordId, keyword: &str) -> Result<()>;

    /// Number of (record, stage) pairs in `stages` that are not yet
    /// terminal for the batch. Zero means the batch is done.
    async fn unfinished_stage_count(&self, batch_id: BatchId, stages: &[Stage]) -> Result<u64>;

    /// True when every enabled stage of every record in the batch is
    /// `failed`. Drives the batch-level `failed` status.
    async fn all_stages_failed(&self, batch_id: BatchId, stages: &[Stage]) -> Result<bool>;

    // ------------------------------------------------------------------
    // Known suppliers (read model)
    // ------------------------------------------------------------------

    /// Replace-or-insert catalog entries, keyed by `supplier_id`.
    /// Replication from upstream is an external job; this also seeds
    /// tests.
    async fn upsert_suppliers(&self, suppliers: &[KnownSupplier]) -> Result<()>;

    /// Candidate suppliers for a normalized query name: exact normalized
    /// match, containment either way, prefix, and business-name variant
    /// (query plus a trailing business token). Scoring is the match
    /// worker's job.
    async fn find_supplier_candidates(
        &self,
        normalized: &str,
        limit: u32,
    ) -> Result<Vec<KnownSupplier>>;

    // ------------------------------------------------------------------
    // Exclusion keywords
    // ------------------------------------------------------------------

    /// Insert a keyword. Errors with `Duplicate` if the casefolded
    /// keyword already exists.
    async fn create_keyword(&self, keyword: ExclusionKeyword) -> Result<()>;

    async fn list_keywords(&self) -> Result<Vec<ExclusionKeyword>>;

    async fn update_keyword(&self, id: KeywordId, update: KeywordUpdate)
        -> Result<ExclusionKeyword>;

    async fn delete_keyword(&self, id: KeywordId) -> Result<()>;

    /// Active keywords only, casefolded.
    async fn active_keywords(&self) -> Result<Vec<String>>;

    // ------------------------------------------------------------------
    // Async search registry
    // ------------------------------------------------------------------

    /// Register a new search request. Errors with `Duplicate` on a
    /// reused search id.
    async fn insert_search(&self, search: &AnySearch) -> Result<()>;

    /// Persist a search state transition. Once a request is terminal it
    /// is immutable; attempts to overwrite error with `InvalidState`.
    async fn persist_search(&self, search: &AnySearch) -> Result<()>;

    async fn get_search(&self, id: &SearchId) -> Result<AnySearch>;

    /// Non-terminal requests whose last activity is older than the
    /// given instant, oldest first, bounded. Fed to the polling sweeper.
    async fn stale_searches(
        &self,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<AnySearch>>;

    async fn searches_for_batch(&self, batch_id: BatchId) -> Result<Vec<AnySearch>>;

    /// Drop terminal search rows completed before the cutoff. Returns
    /// how many were deleted.
    async fn delete_terminal_searches_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    // ------------------------------------------------------------------
    // Webhook events
    // ------------------------------------------------------------------

    /// Insert an inbound webhook event. Returns false when the event id
    /// was already seen (replay); the caller acks without reprocessing.
    async fn insert_webhook_event(&self, event: &WebhookEvent) -> Result<bool>;

    /// Record the outcome of background processing for an event.
    async fn mark_webhook_event(&self, id: &EventId, error: Option<String>) -> Result<()>;
}
