//! Paged record listings with all enrichment fields.

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use dossier::{
    BatchId, MerchantEnrichment, PayeeType, Prediction, Record, ReviewStatus, StageStates,
    SupplierMatch, ValidatedAddress,
};

use crate::api::AppState;
use crate::errors::Result;

const DEFAULT_PAGE_SIZE: u32 = 100;
const MAX_PAGE_SIZE: u32 = 500;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordResponse {
    pub id: Uuid,
    pub original_name: String,
    pub cleaned_name: String,
    /// `unknown` with zero confidence until classification completes.
    pub payee_type: PayeeType,
    pub confidence: f64,
    pub sic_code: Option<String>,
    pub sic_description: Option<String>,
    pub reasoning: Option<String>,
    pub review_status: Option<ReviewStatus>,
    pub is_excluded: bool,
    pub exclusion_keyword: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub supplier_match: Option<SupplierMatch>,
    pub validated_address: Option<ValidatedAddress>,
    pub merchant: Option<MerchantEnrichment>,
    pub prediction: Option<Prediction>,
    pub stages: StageStates,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Record> for RecordResponse {
    fn from(record: Record) -> Self {
        let (payee_type, confidence, sic_code, sic_description, reasoning, review_status) =
            match &record.classification {
                Some(c) => (
                    c.payee_type,
                    c.confidence,
                    c.sic_code.clone(),
                    c.sic_description.clone(),
                    c.reasoning.clone(),
                    Some(c.review_status),
                ),
                None => (PayeeType::Unknown, 0.0, None, None, None, None),
            };
        Self {
            id: record.id.as_uuid(),
            original_name: record.original_name,
            cleaned_name: record.cleaned_name,
            payee_type,
            confidence,
            sic_code,
            sic_description,
            reasoning,
            review_status,
            is_excluded: record.is_excluded,
            exclusion_keyword: record.exclusion_keyword,
            address: record.address,
            city: record.city,
            state: record.state,
            postal_code: record.postal_code,
            supplier_match: record.supplier_match,
            validated_address: record.validated_address,
            merchant: record.merchant,
            prediction: record.prediction,
            stages: record.stages,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationsResponse {
    pub batch_id: Uuid,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub records: Vec<RecordResponse>,
}

/// `GET /classifications/{batch_id}` - one page of enriched records.
pub async fn list_classifications(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
    Query(query): Query<PageQuery>,
) -> Result<Json<ClassificationsResponse>> {
    let batch_id = BatchId(batch_id);
    // 404s for unknown batches rather than returning an empty page.
    state.store.get_batch(batch_id).await?;

    let page = query.page.unwrap_or(1).max(1);
    let page_size = query
        .page_size
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let offset = (page - 1).saturating_mul(page_size);

    let total = state.store.count_records(batch_id).await?;
    let records = state.store.list_records(batch_id, offset, page_size).await?;

    Ok(Json(ClassificationsResponse {
        batch_id: batch_id.as_uuid(),
        total,
        page,
        page_size,
        records: records.into_iter().map(RecordResponse::from).collect(),
    }))
}
