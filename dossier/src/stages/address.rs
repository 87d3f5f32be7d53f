//! Address-validate worker.
//!
//! Hands the record's raw address fields to the validator capability and
//! persists the canonical output. Records with no address input are
//! marked skipped; validator failures terminate the stage for the record
//! without blocking merchant enrichment.

use std::sync::Arc;

use async_trait::async_trait;

use super::{StageContext, StageJob, StageWorker};
use crate::clients::{AddressInput, AddressValidator};
use crate::error::Result;
use crate::types::{Stage, StageFields, StageOutcome};

pub struct AddressWorker {
    ctx: StageContext,
    validator: Arc<dyn AddressValidator>,
}

impl AddressWorker {
    pub fn new(ctx: StageContext, validator: Arc<dyn AddressValidator>) -> Self {
        Self { ctx, validator }
    }
}

#[async_trait]
impl StageWorker for AddressWorker {
    fn stage(&self) -> Stage {
        Stage::Address
    }

    #[tracing::instrument(skip(self), fields(record_id = %job.record_id))]
    async fn process(&self, job: StageJob) -> Result<()> {
        let Some(record) = self.ctx.begin(&job, Stage::Address).await? else {
            return Ok(());
        };

        if record.has_empty_address() {
            return self
                .ctx
                .finish(
                    &job,
                    Stage::Address,
                    StageOutcome::skipped("no address provided"),
                )
                .await;
        }

        let input = AddressInput {
            address: record.address.clone(),
            city: record.city.clone(),
            state: record.state.clone(),
            postal_code: record.postal_code.clone(),
        };

        self.ctx.limiter.acquire().await;
        let outcome = match self
            .ctx
            .retry
            .run("address-validate", || self.validator.validate(&input))
            .await
        {
            Ok(validated) => StageOutcome::completed(StageFields::Address(validated)),
            Err(err) => {
                tracing::warn!(record_id = %job.record_id, error = %err, "Address validation failed");
                StageOutcome::failed(err.to_string())
            }
        };

        self.ctx.finish(&job, Stage::Address, outcome).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::MockAddressValidator;
    use crate::policy::{RateLimiter, RetryPolicy};
    use crate::store::memory::InMemoryStore;
    use crate::store::RecordStore;
    use crate::types::{Batch, EnabledStages, Record, StageStatus, ValidatedAddress};
    use tokio::sync::mpsc;

    async fn seed(store: &InMemoryStore, with_address: bool) -> StageJob {
        let batch = Batch::new("a.csv".into(), "a-1.csv".into(), EnabledStages::default());
        store.create_batch(&batch).await.unwrap();
        let mut record = Record::new(
            batch.id,
            "Acme".to_string(),
            "acme".to_string(),
            serde_json::Map::new(),
        );
        if with_address {
            record.address = Some("1 Main St".to_string());
            record.city = Some("Springfield".to_string());
            record.state = Some("IL".to_string());
        }
        store.insert_records(&[record.clone()]).await.unwrap();
        StageJob {
            batch_id: batch.id,
            record_id: record.id,
        }
    }

    fn worker(store: Arc<InMemoryStore>, validator: Arc<MockAddressValidator>) -> AddressWorker {
        let (tx, _rx) = mpsc::unbounded_channel();
        AddressWorker::new(
            StageContext {
                store,
                events: tx,
                limiter: Arc::new(RateLimiter::unlimited()),
                retry: RetryPolicy::default(),
            },
            validator,
        )
    }

    #[tokio::test]
    async fn test_validated_address_persisted() {
        let store = Arc::new(InMemoryStore::new());
        let job = seed(&store, true).await;

        let validator = Arc::new(MockAddressValidator::new());
        validator.push_response(Ok(ValidatedAddress {
            formatted_address: "1 Main St, Springfield, IL 62701".to_string(),
            components: serde_json::json!({"locality": "Springfield"}),
            latitude: Some(39.78),
            longitude: Some(-89.65),
            confidence: 0.98,
            place_id: Some("place-1".to_string()),
        }));

        worker(store.clone(), validator.clone())
            .process(job)
            .await
            .unwrap();

        let record = store.get_record(job.record_id).await.unwrap();
        let validated = record.validated_address.expect("address written");
        assert_eq!(validated.place_id.as_deref(), Some("place-1"));
        assert_eq!(record.stages.address.status, StageStatus::Completed);
        assert_eq!(validator.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_address_skipped() {
        let store = Arc::new(InMemoryStore::new());
        let job = seed(&store, false).await;

        let validator = Arc::new(MockAddressValidator::new());
        worker(store.clone(), validator.clone())
            .process(job)
            .await
            .unwrap();

        let record = store.get_record(job.record_id).await.unwrap();
        assert!(record.validated_address.is_none());
        assert_eq!(record.stages.address.status, StageStatus::Skipped);
        assert_eq!(
            record.stages.address.error.as_deref(),
            Some("no address provided")
        );
        // The validator is never called for empty input.
        assert!(validator.calls().is_empty());
    }
}
