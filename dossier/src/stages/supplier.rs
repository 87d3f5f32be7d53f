//! Supplier-match worker.
//!
//! Looks the record's normalized name up in the known-supplier read model
//! and scores candidates:
//!
//! - exact normalized equality → 1.0
//! - one name a proper substring of the other → 0.9
//! - otherwise word overlap, floored at 0.5
//!
//! Candidates below the confidence threshold are dropped; the best match
//! (ties broken by shorter name, then stable id) is persisted on the
//! record.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use super::{StageContext, StageJob, StageWorker};
use crate::error::Result;
use crate::normalize::normalize_name;
use crate::types::{KnownSupplier, Stage, StageFields, StageOutcome, SupplierMatch};

/// How many raw candidates to pull from the read model before scoring.
const CANDIDATE_FETCH_LIMIT: u32 = 100;

#[derive(Debug, Clone)]
pub struct SupplierMatchConfig {
    /// Matches below this confidence are discarded.
    pub min_confidence: f64,
    /// Bounded list of alternatives considered after sorting.
    pub top_n: usize,
}

impl Default for SupplierMatchConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.7,
            top_n: 10,
        }
    }
}

pub struct SupplierWorker {
    ctx: StageContext,
    config: SupplierMatchConfig,
}

/// A scored candidate, ready for ranking.
#[derive(Debug, Clone)]
pub struct ScoredSupplier {
    pub supplier: KnownSupplier,
    pub confidence: f64,
    pub reasoning: String,
}

impl SupplierWorker {
    pub fn new(ctx: StageContext, config: SupplierMatchConfig) -> Self {
        Self { ctx, config }
    }

    /// Score one candidate against the normalized query name.
    pub fn score(query: &str, supplier: &KnownSupplier) -> ScoredSupplier {
        let candidate = supplier.normalized_name.as_str();

        let (confidence, reasoning) = if candidate == query {
            (1.0, "exact normalized match".to_string())
        } else if (candidate.contains(query) && candidate != query)
            || (query.contains(candidate) && candidate != query)
        {
            (0.9, "substring match".to_string())
        } else {
            let query_words: HashSet<&str> = query.split_whitespace().collect();
            let candidate_words: HashSet<&str> = candidate.split_whitespace().collect();
            let common = query_words.intersection(&candidate_words).count();
            let denominator = query_words.len().max(candidate_words.len()).max(1);
            let overlap = common as f64 / denominator as f64;
            (
                overlap.max(0.5),
                format!("word overlap {common}/{denominator}"),
            )
        };

        ScoredSupplier {
            supplier: supplier.clone(),
            confidence,
            reasoning,
        }
    }

    /// Score, filter and rank candidates; the head of the returned list
    /// is the best match.
    pub fn rank(&self, query: &str, candidates: &[KnownSupplier]) -> Vec<ScoredSupplier> {
        let mut scored: Vec<ScoredSupplier> = candidates
            .iter()
            .map(|candidate| Self::score(query, candidate))
            .filter(|s| s.confidence >= self.config.min_confidence)
            .collect();

        scored.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.supplier.name_length.cmp(&b.supplier.name_length))
                .then(a.supplier.supplier_id.cmp(&b.supplier.supplier_id))
        });
        scored.truncate(self.config.top_n);
        scored
    }
}

#[async_trait]
impl StageWorker for SupplierWorker {
    fn stage(&self) -> Stage {
        Stage::Supplier
    }

    #[tracing::instrument(skip(self), fields(record_id = %job.record_id))]
    async fn process(&self, job: StageJob) -> Result<()> {
        let Some(record) = self.ctx.begin(&job, Stage::Supplier).await? else {
            return Ok(());
        };
        if self
            .ctx
            .skip_if_excluded(&job, Stage::Supplier, &record)
            .await?
        {
            return Ok(());
        }

        let query = normalize_name(&record.cleaned_name);
        if query.is_empty() {
            return self
                .ctx
                .finish(&job, Stage::Supplier, StageOutcome::skipped("empty name"))
                .await;
        }

        self.ctx.limiter.acquire().await;
        let candidates = self
            .ctx
            .store
            .find_supplier_candidates(&query, CANDIDATE_FETCH_LIMIT)
            .await?;
        let ranked = self.rank(&query, &candidates);

        let best = ranked.first().map(|scored| SupplierMatch {
            supplier_id: scored.supplier.supplier_id.clone(),
            supplier_name: scored.supplier.name.clone(),
            confidence: scored.confidence,
            reasoning: scored.reasoning.clone(),
        });

        if let Some(matched) = &best {
            tracing::debug!(
                record_id = %job.record_id,
                supplier_id = %matched.supplier_id,
                confidence = matched.confidence,
                "Supplier matched"
            );
        }

        self.ctx
            .finish(
                &job,
                Stage::Supplier,
                StageOutcome::completed(StageFields::Supplier(best)),
            )
            .await
    }
}
