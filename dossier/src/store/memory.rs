//! In-memory store implementation.
//!
//! Stores everything in concurrent maps. Suitable for tests and
//! single-process deployments; contents are lost on restart. The CAS
//! semantics match the Postgres backend exactly, so pipeline tests run
//! against this implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::RecordStore;
use crate::error::{DossierError, Result};
use crate::search::AnySearch;
use crate::types::{
    Batch, BatchId, BatchStatus, EventId, ExclusionKeyword, KeywordId, KeywordUpdate,
    KnownSupplier, Record, RecordId, SearchId, Stage, StageFields, StageOutcome, StageStatus,
    WebhookEvent,
};

/// In-memory implementation of [`RecordStore`].
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    batches: RwLock<HashMap<BatchId, Batch>>,
    records: RwLock<HashMap<RecordId, Record>>,
    /// Insertion order per batch, for stable listing.
    record_order: RwLock<HashMap<BatchId, Vec<RecordId>>>,
    suppliers: RwLock<HashMap<String, KnownSupplier>>,
    keywords: RwLock<HashMap<KeywordId, ExclusionKeyword>>,
    searches: RwLock<HashMap<SearchId, AnySearch>>,
    webhook_events: RwLock<HashMap<EventId, WebhookEvent>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn create_batch(&self, batch: &Batch) -> Result<()> {
        let mut batches = self.inner.batches.write();
        if batches.contains_key(&batch.id) {
            return Err(DossierError::Duplicate(format!("batch {}", batch.id)));
        }
        batches.insert(batch.id, batch.clone());
        Ok(())
    }

    async fn get_batch(&self, id: BatchId) -> Result<Batch> {
        self.inner
            .batches
            .read()
            .get(&id)
            .cloned()
            .ok_or(DossierError::BatchNotFound(id))
    }

    async fn list_batches(&self) -> Result<Vec<Batch>> {
        let mut batches: Vec<Batch> = self.inner.batches.read().values().cloned().collect();
        batches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(batches)
    }

    async fn update_batch_status(
        &self,
        id: BatchId,
        status: BatchStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut batches = self.inner.batches.write();
        let batch = batches.get_mut(&id).ok_or(DossierError::BatchNotFound(id))?;
        if batch.status.is_terminal() {
            return Ok(());
        }
        batch.status = status;
        if completed_at.is_some() {
            batch.completed_at = completed_at;
        }
        Ok(())
    }

    async fn set_stage_progress(
        &self,
        id: BatchId,
        stage: Stage,
        status: Option<StageStatus>,
        total: Option<u32>,
    ) -> Result<()> {
        let mut batches = self.inner.batches.write();
        let batch = batches.get_mut(&id).ok_or(DossierError::BatchNotFound(id))?;
        let counters = batch.stages.get_mut(stage);
        if let Some(status) = status {
            counters.status = status;
        }
        if let Some(total) = total {
            counters.total = total;
        }
        Ok(())
    }

    async fn increment_stage_total(&self, id: BatchId, stage: Stage, n: u32) -> Result<()> {
        let mut batches = self.inner.batches.write();
        let batch = batches.get_mut(&id).ok_or(DossierError::BatchNotFound(id))?;
        batch.stages.get_mut(stage).total += n;
        Ok(())
    }

    async fn record_stage_result(
        &self,
        id: BatchId,
        stage: Stage,
        succeeded: bool,
    ) -> Result<Batch> {
        let mut batches = self.inner.batches.write();
        let batch = batches.get_mut(&id).ok_or(DossierError::BatchNotFound(id))?;
        let counters = batch.stages.get_mut(stage);
        counters.processed += 1;
        if succeeded {
            counters.succeeded += 1;
        }
        if stage == Stage::Classification {
            batch.processed_records += 1;
        }
        Ok(batch.clone())
    }

    async fn add_skipped_records(&self, id: BatchId, n: u32) -> Result<()> {
        let mut batches = self.inner.batches.write();
        let batch = batches.get_mut(&id).ok_or(DossierError::BatchNotFound(id))?;
        batch.skipped_records += n;
        Ok(())
    }

    async fn insert_records(&self, records: &[Record]) -> Result<()> {
        let mut map = self.inner.records.write();
        let mut order = self.inner.record_order.write();
        let mut batches = self.inner.batches.write();
        for record in records {
            map.insert(record.id, record.clone());
            order.entry(record.batch_id).or_default().push(record.id);
            if let Some(batch) = batches.get_mut(&record.batch_id) {
                batch.total_records += 1;
            }
        }
        Ok(())
    }

    async fn get_record(&self, id: RecordId) -> Result<Record> {
        self.inner
            .records
            .read()
            .get(&id)
            .cloned()
            .ok_or(DossierError::RecordNotFound(id))
    }

    async fn records_by_ids(&self, ids: &[RecordId]) -> Result<Vec<Record>> {
        let records = self.inner.records.read();
        Ok(ids
            .iter()
            .filter_map(|id| records.get(id).cloned())
            .collect())
    }

    async fn list_records(
        &self,
        batch_id: BatchId,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<Record>> {
        let order = self.inner.record_order.read();
        let records = self.inner.records.read();
        Ok(order
            .get(&batch_id)
            .map(|ids| {
                ids.iter()
                    .skip(offset as usize)
                    .take(limit as usize)
                    .filter_map(|id| records.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn count_records(&self, batch_id: BatchId) -> Result<u64> {
        let order = self.inner.record_order.read();
        Ok(order.get(&batch_id).map(|ids| ids.len() as u64).unwrap_or(0))
    }

    async fn mark_stage_in_progress(&self, id: RecordId, stage: Stage) -> Result<bool> {
        let mut records = self.inner.records.write();
        let record = records.get_mut(&id).ok_or(DossierError::RecordNotFound(id))?;
        let state = record.stages.get_mut(stage);
        if state.status != StageStatus::Pending {
            return Ok(false);
        }
        state.status = StageStatus::InProgress;
        state.updated_at = Utc::now();
        record.updated_at = state.updated_at;
        Ok(true)
    }

    async fn complete_stage(
        &self,
        id: RecordId,
        stage: Stage,
        outcome: StageOutcome,
    ) -> Result<bool> {
        let mut records = self.inner.records.write();
        let record = records.get_mut(&id).ok_or(DossierError::RecordNotFound(id))?;
        if record.stages.get(stage).status.is_terminal() {
            // Late write; first-writer-wins.
            return Ok(false);
        }

        match outcome.fields {
            StageFields::Classification(c) => record.classification = Some(c),
            StageFields::Supplier(m) => record.supplier_match = m,
            StageFields::Address(a) => record.validated_address = Some(a),
            StageFields::Merchant(m) => record.merchant = Some(*m),
            StageFields::Prediction(p) => record.prediction = Some(p),
            StageFields::None => {}
        }

        let now = Utc::now();
        let state = record.stages.get_mut(stage);
        state.status = outcome.status;
        state.error = outcome.error;
        state.updated_at = now;
        record.updated_at = now;
        Ok(true)
    }

    async fn mark_excluded(&self, id: RecordId, keyword: &str) -> Result<()> {
        let mut records = self.inner.records.write();
        let record = records.get_mut(&id).ok_or(DossierError::RecordNotFound(id))?;
        record.is_excluded = true;
        record.exclusion_keyword = Some(keyword.to_string());
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn unfinished_stage_count(&self, batch_id: BatchId, stages: &[Stage]) -> Result<u64> {
        let order = self.inner.record_order.read();
        let records = self.inner.records.read();
        let Some(ids) = order.get(&batch_id) else {
            return Ok(0);
        };
        let mut unfinished = 0u64;
        for id in ids {
            if let Some(record) = records.get(id) {
                for stage in stages {
                    if !record.stages.get(*stage).status.is_terminal() {
                        unfinished += 1;
                    }
                }
            }
        }
        Ok(unfinished)
    }

    async fn all_stages_failed(&self, batch_id: BatchId, stages: &[Stage]) -> Result<bool> {
        let order = self.inner.record_order.read();
        let records = self.inner.records.read();
        let Some(ids) = order.get(&batch_id) else {
            return Ok(false);
        };
        if ids.is_empty() || stages.is_empty() {
            return Ok(false);
        }
        for id in ids {
            if let Some(record) = records.get(id) {
                for stage in stages {
                    if record.stages.get(*stage).status != StageStatus::Failed {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    async fn upsert_suppliers(&self, suppliers: &[KnownSupplier]) -> Result<()> {
        let mut map = self.inner.suppliers.write();
        for supplier in suppliers {
            map.insert(supplier.supplier_id.clone(), supplier.clone());
        }
        Ok(())
    }

    async fn find_supplier_candidates(
        &self,
        normalized: &str,
        limit: u32,
    ) -> Result<Vec<KnownSupplier>> {
        if normalized.is_empty() {
            return Ok(Vec::new());
        }
        let first_token = normalized.split_whitespace().next().unwrap_or(normalized);
        let suppliers = self.inner.suppliers.read();
        let mut candidates: Vec<KnownSupplier> = suppliers
            .values()
            .filter(|s| {
                let name = s.normalized_name.as_str();
                name == normalized
                    || name.contains(normalized)
                    || normalized.contains(name)
                    || name.starts_with(normalized)
                    || (s.has_business_indicator
                        && name.split_whitespace().next() == Some(first_token))
            })
            .cloned()
            .collect();
        // Stable order for the scoring pass.
        candidates.sort_by(|a, b| a.supplier_id.cmp(&b.supplier_id));
        candidates.truncate(limit as usize);
        Ok(candidates)
    }

    async fn create_keyword(&self, keyword: ExclusionKeyword) -> Result<()> {
        let mut keywords = self.inner.keywords.write();
        let folded = keyword.keyword.to_lowercase();
        if keywords.values().any(|k| k.keyword.to_lowercase() == folded) {
            return Err(DossierError::Duplicate(format!("keyword {folded:?}")));
        }
        keywords.insert(keyword.id, keyword);
        Ok(())
    }

    async fn list_keywords(&self) -> Result<Vec<ExclusionKeyword>> {
        let mut keywords: Vec<ExclusionKeyword> =
            self.inner.keywords.read().values().cloned().collect();
        keywords.sort_by(|a, b| a.keyword.cmp(&b.keyword));
        Ok(keywords)
    }

    async fn update_keyword(
        &self,
        id: KeywordId,
        update: KeywordUpdate,
    ) -> Result<ExclusionKeyword> {
        let mut keywords = self.inner.keywords.write();
        if let Some(new_keyword) = update.keyword.as_deref() {
            let folded = new_keyword.trim().to_lowercase();
            if keywords
                .values()
                .any(|k| k.id != id && k.keyword.to_lowercase() == folded)
            {
                return Err(DossierError::Duplicate(format!("keyword {folded:?}")));
            }
        }
        let keyword = keywords
            .get_mut(&id)
            .ok_or(DossierError::KeywordNotFound(id))?;
        if let Some(new_keyword) = update.keyword {
            keyword.keyword = new_keyword.trim().to_lowercase();
        }
        if let Some(notes) = update.notes {
            keyword.notes = Some(notes);
        }
        if let Some(is_active) = update.is_active {
            keyword.is_active = is_active;
        }
        keyword.updated_at = Utc::now();
        Ok(keyword.clone())
    }

    async fn delete_keyword(&self, id: KeywordId) -> Result<()> {
        self.inner
            .keywords
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or(DossierError::KeywordNotFound(id))
    }

    async fn active_keywords(&self) -> Result<Vec<String>> {
        Ok(self
            .inner
            .keywords
            .read()
            .values()
            .filter(|k| k.is_active)
            .map(|k| k.keyword.to_lowercase())
            .collect())
    }

    async fn insert_search(&self, search: &AnySearch) -> Result<()> {
        let mut searches = self.inner.searches.write();
        let id = search.id().clone();
        if searches.contains_key(&id) {
            return Err(DossierError::Duplicate(format!("search {id}")));
        }
        searches.insert(id, search.clone());
        Ok(())
    }

    async fn persist_search(&self, search: &AnySearch) -> Result<()> {
        let mut searches = self.inner.searches.write();
        let id = search.id().clone();
        let existing = searches
            .get(&id)
            .ok_or_else(|| DossierError::SearchNotFound(id.clone()))?;
        if existing.is_terminal() {
            return Err(DossierError::InvalidState {
                entity: format!("search {id}"),
                actual: existing.status().to_string(),
                expected: "non-terminal".to_string(),
            });
        }
        searches.insert(id, search.clone());
        Ok(())
    }

    async fn get_search(&self, id: &SearchId) -> Result<AnySearch> {
        self.inner
            .searches
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| DossierError::SearchNotFound(id.clone()))
    }

    async fn stale_searches(
        &self,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<AnySearch>> {
        let searches = self.inner.searches.read();
        let mut stale: Vec<AnySearch> = searches
            .values()
            .filter(|s| !s.is_terminal() && s.last_activity_at() < older_than)
            .cloned()
            .collect();
        stale.sort_by_key(|s| s.last_activity_at());
        stale.truncate(limit as usize);
        Ok(stale)
    }

    async fn searches_for_batch(&self, batch_id: BatchId) -> Result<Vec<AnySearch>> {
        let searches = self.inner.searches.read();
        Ok(searches
            .values()
            .filter(|s| s.data().batch_id == batch_id)
            .cloned()
            .collect())
    }

    async fn delete_terminal_searches_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut searches = self.inner.searches.write();
        let before = searches.len();
        searches.retain(|_, s| match s.terminal_at() {
            Some(at) => at >= cutoff,
            None => true,
        });
        Ok((before - searches.len()) as u64)
    }

    async fn insert_webhook_event(&self, event: &WebhookEvent) -> Result<bool> {
        let mut events = self.inner.webhook_events.write();
        if events.contains_key(&event.event_id) {
            return Ok(false);
        }
        events.insert(event.event_id.clone(), event.clone());
        Ok(true)
    }

    async fn mark_webhook_event(&self, id: &EventId, error: Option<String>) -> Result<()> {
        let mut events = self.inner.webhook_events.write();
        if let Some(event) = events.get_mut(id) {
            event.processed = true;
            event.processed_at = Some(Utc::now());
            event.error_message = error;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Classification, EnabledStages, PayeeType, ReviewStatus};

    fn sample_record(batch_id: BatchId, name: &str) -> Record {
        Record::new(
            batch_id,
            name.to_string(),
            crate::normalize::normalize_name(name),
            serde_json::Map::new(),
        )
    }

    fn sample_classification() -> Classification {
        Classification {
            payee_type: PayeeType::Business,
            confidence: 0.97,
            sic_code: Some("5045".to_string()),
            sic_description: Some("Computers".to_string()),
            reasoning: Some("business suffix".to_string()),
            review_status: ReviewStatus::AutoApproved,
        }
    }

    #[tokio::test]
    async fn test_complete_stage_cas_drops_late_write() {
        let store = InMemoryStore::new();
        let batch = Batch::new("a.csv".into(), "a-1.csv".into(), EnabledStages::default());
        store.create_batch(&batch).await.unwrap();
        let record = sample_record(batch.id, "Acme Inc");
        store.insert_records(&[record.clone()]).await.unwrap();

        let first = store
            .complete_stage(
                record.id,
                Stage::Classification,
                StageOutcome::completed(StageFields::Classification(sample_classification())),
            )
            .await
            .unwrap();
        assert!(first);

        // Second terminal write must be dropped silently.
        let second = store
            .complete_stage(
                record.id,
                Stage::Classification,
                StageOutcome::failed("late failure"),
            )
            .await
            .unwrap();
        assert!(!second);

        let stored = store.get_record(record.id).await.unwrap();
        assert_eq!(
            stored.stages.classification.status,
            StageStatus::Completed
        );
        assert!(stored.classification.is_some());
        assert!(stored.stages.classification.error.is_none());
    }

    #[tokio::test]
    async fn test_mark_in_progress_cas() {
        let store = InMemoryStore::new();
        let batch = Batch::new("a.csv".into(), "a-1.csv".into(), EnabledStages::default());
        store.create_batch(&batch).await.unwrap();
        let record = sample_record(batch.id, "Acme Inc");
        store.insert_records(&[record.clone()]).await.unwrap();

        assert!(store
            .mark_stage_in_progress(record.id, Stage::Supplier)
            .await
            .unwrap());
        // Already in progress.
        assert!(!store
            .mark_stage_in_progress(record.id, Stage::Supplier)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_insert_records_bumps_total() {
        let store = InMemoryStore::new();
        let batch = Batch::new("a.csv".into(), "a-1.csv".into(), EnabledStages::default());
        store.create_batch(&batch).await.unwrap();
        store
            .insert_records(&[
                sample_record(batch.id, "One"),
                sample_record(batch.id, "Two"),
            ])
            .await
            .unwrap();
        let stored = store.get_batch(batch.id).await.unwrap();
        assert_eq!(stored.total_records, 2);
    }

    #[tokio::test]
    async fn test_keyword_casefold_uniqueness() {
        let store = InMemoryStore::new();
        store
            .create_keyword(ExclusionKeyword::new("Bank", None, None))
            .await
            .unwrap();
        let err = store
            .create_keyword(ExclusionKeyword::new("BANK", None, None))
            .await;
        assert!(matches!(err, Err(DossierError::Duplicate(_))));
    }

    #[tokio::test]
    async fn test_webhook_event_dedup() {
        let store = InMemoryStore::new();
        let event = WebhookEvent::new(
            EventId::from("evt-1"),
            "BULK_SEARCH_RESULTS_READY".to_string(),
            SearchId::from("bulk-1"),
            serde_json::json!({}),
        );
        assert!(store.insert_webhook_event(&event).await.unwrap());
        assert!(!store.insert_webhook_event(&event).await.unwrap());
    }

    #[tokio::test]
    async fn test_terminal_batch_status_is_sticky() {
        let store = InMemoryStore::new();
        let batch = Batch::new("a.csv".into(), "a-1.csv".into(), EnabledStages::default());
        store.create_batch(&batch).await.unwrap();
        store
            .update_batch_status(batch.id, BatchStatus::Cancelled, Some(Utc::now()))
            .await
            .unwrap();
        store
            .update_batch_status(batch.id, BatchStatus::Completed, Some(Utc::now()))
            .await
            .unwrap();
        let stored = store.get_batch(batch.id).await.unwrap();
        assert_eq!(stored.status, BatchStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_supplier_candidates_modes() {
        let store = InMemoryStore::new();
        let make = |id: &str, name: &str, business: bool| KnownSupplier {
            supplier_id: id.to_string(),
            name: name.to_string(),
            normalized_name: crate::normalize::normalize_name(name),
            category: None,
            mcc: None,
            industry: None,
            payment_type: None,
            city: None,
            state: None,
            confidence: 1.0,
            name_length: name.len() as u32,
            has_business_indicator: business,
            common_name_score: 0.0,
        };
        store
            .upsert_suppliers(&[
                make("s1", "Acme Widgets", true),
                make("s2", "Acme Widgets Northwest", true),
                make("s3", "Globex", false),
            ])
            .await
            .unwrap();

        let candidates = store
            .find_supplier_candidates("acme widgets", 10)
            .await
            .unwrap();
        let ids: Vec<&str> = candidates.iter().map(|s| s.supplier_id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2"]);
    }
}
