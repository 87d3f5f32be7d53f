//! Classify worker.
//!
//! Calls the classifier capability with the record's cleaned name,
//! validates the returned payee type against the enum, clamps confidence
//! and persists atomically with the stage transition. Capability failures
//! beyond retry terminate the stage for that record only.

use std::sync::Arc;

use async_trait::async_trait;

use super::{StageContext, StageJob, StageWorker};
use crate::clients::Classifier;
use crate::error::Result;
use crate::types::{Classification, PayeeType, ReviewStatus, Stage, StageFields, StageOutcome, StageStatus};

pub struct ClassifyWorker {
    ctx: StageContext,
    classifier: Arc<dyn Classifier>,
}

impl ClassifyWorker {
    pub fn new(ctx: StageContext, classifier: Arc<dyn Classifier>) -> Self {
        Self { ctx, classifier }
    }
}

#[async_trait]
impl StageWorker for ClassifyWorker {
    fn stage(&self) -> Stage {
        Stage::Classification
    }

    #[tracing::instrument(skip(self), fields(record_id = %job.record_id))]
    async fn process(&self, job: StageJob) -> Result<()> {
        let Some(record) = self.ctx.begin(&job, Stage::Classification).await? else {
            return Ok(());
        };

        self.ctx.limiter.acquire().await;
        let result = self
            .ctx
            .retry
            .run("classify", || self.classifier.classify(&record.cleaned_name))
            .await;

        let outcome = match result {
            Ok(output) => {
                let (payee_type, confidence, error) = match output.payee_type.parse::<PayeeType>() {
                    Ok(payee_type) => (payee_type, output.confidence.clamp(0.0, 1.0), None),
                    Err(_) => (
                        PayeeType::Unknown,
                        0.0,
                        Some(format!(
                            "classifier returned unrecognized payee type {:?}",
                            output.payee_type
                        )),
                    ),
                };
                StageOutcome {
                    status: StageStatus::Completed,
                    error,
                    fields: StageFields::Classification(Classification {
                        payee_type,
                        confidence,
                        sic_code: output.sic_code,
                        sic_description: output.sic_description,
                        reasoning: output.reasoning,
                        review_status: ReviewStatus::from_confidence(confidence),
                    }),
                }
            }
            Err(err) => {
                tracing::warn!(record_id = %job.record_id, error = %err, "Classification failed");
                StageOutcome::failed(err.to_string())
            }
        };

        self.ctx.finish(&job, Stage::Classification, outcome).await
    }
}
