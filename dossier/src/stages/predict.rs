//! Predict worker.
//!
//! Calls the predictor capability with a snapshot of the record's
//! classification and enrichment outputs and persists the prediction
//! fields. Skipped when required inputs are missing; whether it waits for
//! merchant enrichment is the orchestrator's dispatch decision, not the
//! worker's.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use super::{StageContext, StageJob, StageWorker};
use crate::clients::Predictor;
use crate::error::Result;
use crate::types::{Prediction, Record, Stage, StageFields, StageOutcome};

pub struct PredictWorker {
    ctx: StageContext,
    predictor: Arc<dyn Predictor>,
    model_id: String,
}

impl PredictWorker {
    pub fn new(ctx: StageContext, predictor: Arc<dyn Predictor>, model_id: String) -> Self {
        Self {
            ctx,
            predictor,
            model_id,
        }
    }

    /// Snapshot of the record the model scores on.
    fn payee_data(record: &Record) -> serde_json::Value {
        let classification = record.classification.as_ref();
        serde_json::json!({
            "name": record.cleaned_name,
            "payeeType": classification.map(|c| c.payee_type.as_str()),
            "classificationConfidence": classification.map(|c| c.confidence),
            "sicCode": classification.and_then(|c| c.sic_code.clone()),
            "supplierId": record.supplier_match.as_ref().map(|m| m.supplier_id.clone()),
            "formattedAddress": record
                .validated_address
                .as_ref()
                .map(|a| a.formatted_address.clone()),
            "merchantMatchStatus": record.merchant.as_ref().map(|m| m.match_status),
            "mcc": record.merchant.as_ref().and_then(|m| m.mcc.clone()),
        })
    }
}

#[async_trait]
impl StageWorker for PredictWorker {
    fn stage(&self) -> Stage {
        Stage::Prediction
    }

    #[tracing::instrument(skip(self), fields(record_id = %job.record_id))]
    async fn process(&self, job: StageJob) -> Result<()> {
        let Some(record) = self.ctx.begin(&job, Stage::Prediction).await? else {
            return Ok(());
        };
        if self
            .ctx
            .skip_if_excluded(&job, Stage::Prediction, &record)
            .await?
        {
            return Ok(());
        }

        if record.classification.is_none() {
            return self
                .ctx
                .finish(
                    &job,
                    Stage::Prediction,
                    StageOutcome::skipped("classification unavailable"),
                )
                .await;
        }

        let payee_data = Self::payee_data(&record);
        self.ctx.limiter.acquire().await;
        let outcome = match self
            .ctx
            .retry
            .run("predict", || self.predictor.predict(&self.model_id, &payee_data))
            .await
        {
            Ok(output) => StageOutcome::completed(StageFields::Prediction(Prediction {
                predicted_payment_success: output.predicted_payment_success.clamp(0.0, 1.0),
                confidence: output.confidence.clamp(0.0, 1.0),
                risk_factors: output.risk_factors,
                recommended_payment_method: output.recommended_payment_method,
                fraud_risk_score: output.fraud_risk_score,
                predicted_at: Utc::now(),
            })),
            Err(err) => {
                tracing::warn!(record_id = %job.record_id, error = %err, "Prediction failed");
                StageOutcome::failed(err.to_string())
            }
        };

        self.ctx.finish(&job, Stage::Prediction, outcome).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{MockPredictor, PredictorOutput};
    use crate::policy::{RateLimiter, RetryPolicy};
    use crate::store::memory::InMemoryStore;
    use crate::store::RecordStore;
    use crate::types::{
        Batch, Classification, EnabledStages, PayeeType, ReviewStatus, StageStatus,
    };
    use tokio::sync::mpsc;

    fn worker(store: Arc<InMemoryStore>, predictor: Arc<MockPredictor>) -> PredictWorker {
        let (tx, _rx) = mpsc::unbounded_channel();
        PredictWorker::new(
            StageContext {
                store,
                events: tx,
                limiter: Arc::new(RateLimiter::unlimited()),
                retry: RetryPolicy::default(),
            },
            predictor,
            "payment-model-1".to_string(),
        )
    }

    #[tokio::test]
    async fn test_prediction_persisted_with_inputs() {
        let store = Arc::new(InMemoryStore::new());
        let batch = Batch::new("a.csv".into(), "a-1.csv".into(), EnabledStages::default());
        store.create_batch(&batch).await.unwrap();
        let mut record = Record::new(
            batch.id,
            "Acme".to_string(),
            "acme".to_string(),
            serde_json::Map::new(),
        );
        record.classification = Some(Classification {
            payee_type: PayeeType::Business,
            confidence: 0.92,
            sic_code: Some("5045".to_string()),
            sic_description: None,
            reasoning: None,
            review_status: ReviewStatus::AutoApproved,
        });
        store.insert_records(&[record.clone()]).await.unwrap();

        let predictor = Arc::new(MockPredictor::new());
        predictor.push_response(Ok(PredictorOutput {
            predicted_payment_success: 0.85,
            confidence: 0.7,
            risk_factors: vec!["new supplier".to_string()],
            recommended_payment_method: Some("ACH".to_string()),
            processing_time_estimate: None,
            fraud_risk_score: Some(0.1),
        }));

        worker(store.clone(), predictor.clone())
            .process(StageJob {
                batch_id: batch.id,
                record_id: record.id,
            })
            .await
            .unwrap();

        let stored = store.get_record(record.id).await.unwrap();
        let prediction = stored.prediction.expect("prediction written");
        assert_eq!(prediction.predicted_payment_success, 0.85);
        assert_eq!(prediction.recommended_payment_method.as_deref(), Some("ACH"));
        assert_eq!(stored.stages.prediction.status, StageStatus::Completed);

        // The model saw the classification snapshot.
        let calls = predictor.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "payment-model-1");
        assert_eq!(calls[0].1["payeeType"], "business");
    }

    #[tokio::test]
    async fn test_missing_classification_skips() {
        let store = Arc::new(InMemoryStore::new());
        let batch = Batch::new("a.csv".into(), "a-1.csv".into(), EnabledStages::default());
        store.create_batch(&batch).await.unwrap();
        let record = Record::new(
            batch.id,
            "Acme".to_string(),
            "acme".to_string(),
            serde_json::Map::new(),
        );
        store.insert_records(&[record.clone()]).await.unwrap();

        let predictor = Arc::new(MockPredictor::new());
        worker(store.clone(), predictor.clone())
            .process(StageJob {
                batch_id: batch.id,
                record_id: record.id,
            })
            .await
            .unwrap();

        let stored = store.get_record(record.id).await.unwrap();
        assert!(stored.prediction.is_none());
        assert_eq!(stored.stages.prediction.status, StageStatus::Skipped);
        assert!(predictor.calls().is_empty());
    }
}
