//! Progress projection.
//!
//! Derives a single overall percentage and current-phase label from a
//! batch's per-stage counters. Classification owns the first 25%; the
//! enabled enrichment stages split the remaining 75% evenly, with an
//! in-progress stage counting half its share.

use serde::Serialize;

use crate::types::{Batch, BatchStatus, Stage, StageStatus};

/// Read-only progress view of one batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressView {
    /// Overall percentage in [0, 100]; `None` while progress is
    /// indeterminate (streaming uploads with unknown totals).
    pub percent: Option<f64>,
    pub phase: String,
}

const CLASSIFICATION_SHARE: f64 = 25.0;
const ENRICHMENT_SHARE: f64 = 75.0;

/// Project a batch's counters into an overall percentage and phase.
pub fn project(batch: &Batch) -> ProgressView {
    match batch.status {
        BatchStatus::Completed => {
            return ProgressView {
                percent: Some(100.0),
                phase: "Completed".to_string(),
            }
        }
        BatchStatus::Failed => {
            return ProgressView {
                percent: Some(100.0),
                phase: "Failed".to_string(),
            }
        }
        BatchStatus::Cancelled => {
            return ProgressView {
                percent: None,
                phase: "Cancelled".to_string(),
            }
        }
        _ => {}
    }

    let classification = batch.stages.classification;

    // Streaming uploads deliver records before the total is known.
    if classification.total == 0 && classification.processed > 0 {
        return ProgressView {
            percent: None,
            phase: Stage::Classification.phase_label().to_string(),
        };
    }

    let classifying = classification.total == 0
        || classification.processed < classification.total;
    if classifying {
        let ratio = if classification.total == 0 {
            0.0
        } else {
            classification.processed as f64 / classification.total as f64
        };
        return ProgressView {
            percent: Some(ratio * CLASSIFICATION_SHARE),
            phase: Stage::Classification.phase_label().to_string(),
        };
    }

    let enrichment = batch.enabled.enrichment_stages();
    if enrichment.is_empty() {
        return ProgressView {
            percent: Some(100.0),
            phase: "Completing enrichment".to_string(),
        };
    }

    let share = ENRICHMENT_SHARE / enrichment.len() as f64;
    let mut percent = CLASSIFICATION_SHARE;
    let mut phase: Option<Stage> = None;

    for stage in &enrichment {
        let counters = batch.stages.get(*stage);
        let in_progress = counters.status == StageStatus::InProgress
            || (counters.total > 0 && counters.processed < counters.total);
        if counters.status.is_terminal() || (counters.total > 0 && counters.processed >= counters.total)
        {
            percent += share;
        } else if in_progress {
            percent += share / 2.0;
            if phase.is_none() {
                phase = Some(*stage);
            }
        }
    }

    ProgressView {
        percent: Some(percent.min(100.0)),
        phase: phase
            .map(|s| s.phase_label().to_string())
            .unwrap_or_else(|| "Completing enrichment".to_string()),
    }
}
