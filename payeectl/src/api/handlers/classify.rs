//! Synchronous single-name classification, bypassing the pipeline.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use dossier::{normalize_name, PayeeType, ReviewStatus};

use crate::api::AppState;
use crate::errors::{Error, Result};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifySingleRequest {
    pub payee_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifySingleResponse {
    pub payee_name: String,
    pub cleaned_name: String,
    pub payee_type: PayeeType,
    pub confidence: f64,
    pub sic_code: Option<String>,
    pub sic_description: Option<String>,
    pub reasoning: Option<String>,
    pub review_status: ReviewStatus,
    pub excluded: bool,
    pub exclusion_keyword: Option<String>,
}

/// `POST /classify-single` - classify one name and return immediately.
#[tracing::instrument(skip_all)]
pub async fn classify_single(
    State(state): State<AppState>,
    Json(request): Json<ClassifySingleRequest>,
) -> Result<Json<ClassifySingleResponse>> {
    let name = request.payee_name.trim();
    if name.is_empty() {
        return Err(Error::bad_request("payeeName must not be empty"));
    }

    let cleaned_name = normalize_name(name);
    let exclusion_keyword = state.filter.match_name(name).await?;

    let output = state
        .classifier
        .classify(&cleaned_name)
        .await
        .map_err(dossier::DossierError::from)?;

    // Same coercion the classify worker applies: unrecognized types
    // become Unknown with zero confidence.
    let (payee_type, confidence) = match output.payee_type.parse::<PayeeType>() {
        Ok(payee_type) => (payee_type, output.confidence.clamp(0.0, 1.0)),
        Err(_) => (PayeeType::Unknown, 0.0),
    };

    Ok(Json(ClassifySingleResponse {
        payee_name: name.to_string(),
        cleaned_name,
        payee_type,
        confidence,
        sic_code: output.sic_code,
        sic_description: output.sic_description,
        reasoning: output.reasoning,
        review_status: ReviewStatus::from_confidence(confidence),
        excluded: exclusion_keyword.is_some(),
        exclusion_keyword,
    }))
}
