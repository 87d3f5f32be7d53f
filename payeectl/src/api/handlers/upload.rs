//! Batch upload, listing, status and cancellation.
//!
//! The upload endpoint accepts a multipart CSV, seeds a batch with one
//! record per row (the raw row is preserved as an opaque payload), and
//! hands the batch to the pipeline. Column selection: an explicit
//! `payeeColumn` field wins, otherwise the first header containing
//! "payee", "vendor", "supplier" or "name" is used.

use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use dossier::{
    normalize_name, AddressColumnMap, Batch, BatchId, EnabledStages, Record, StageCounters,
};

use crate::api::AppState;
use crate::errors::{Error, Result};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub batch_id: Uuid,
    pub status: String,
    pub total_records: u32,
    pub skipped_rows: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub batch_id: Uuid,
    pub original_name: String,
    pub status: String,
    pub total_records: u32,
    pub processed_records: u32,
    pub skipped_records: u32,
    pub percent_complete: Option<f64>,
    pub current_phase: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Batch> for BatchSummary {
    fn from(batch: &Batch) -> Self {
        let progress = dossier::project(batch);
        Self {
            batch_id: batch.id.as_uuid(),
            original_name: batch.original_name.clone(),
            status: batch.status.to_string(),
            total_records: batch.total_records,
            processed_records: batch.processed_records,
            skipped_records: batch.skipped_records,
            percent_complete: progress.percent,
            current_phase: progress.phase,
            created_at: batch.created_at,
            completed_at: batch.completed_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: String,
    pub current_step: String,
    pub progress_message: String,
    pub total_records: u32,
    pub processed_records: u32,
    pub skipped_records: u32,
    pub percent_complete: Option<f64>,
    pub stages: StageBreakdown,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageBreakdown {
    pub classification: StageCounters,
    pub supplier: StageCounters,
    pub address: StageCounters,
    pub merchant: StageCounters,
    pub prediction: StageCounters,
}

/// Collected multipart form.
#[derive(Default)]
struct UploadForm {
    file: Option<(String, Vec<u8>)>,
    payee_column: Option<String>,
    address_column: Option<String>,
    city_column: Option<String>,
    state_column: Option<String>,
    postal_code_column: Option<String>,
    enabled: EnabledStages,
}

async fn read_form(mut multipart: Multipart) -> Result<UploadForm> {
    let mut form = UploadForm::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::bad_request(format!("invalid multipart payload: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let file_name = field.file_name().unwrap_or("upload.csv").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| Error::bad_request(format!("failed to read file: {e}")))?;
                form.file = Some((file_name, bytes.to_vec()));
            }
            other => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| Error::bad_request(format!("invalid field {other}: {e}")))?;
                let enabled = |v: &str| v != "false" && v != "0";
                match other {
                    "payeeColumn" => form.payee_column = Some(value),
                    "addressColumn" => form.address_column = Some(value),
                    "cityColumn" => form.city_column = Some(value),
                    "stateColumn" => form.state_column = Some(value),
                    "postalCodeColumn" => form.postal_code_column = Some(value),
                    "enableSupplierMatch" => form.enabled.supplier = enabled(&value),
                    "enableAddressValidation" => form.enabled.address = enabled(&value),
                    "enableMerchantEnrichment" => form.enabled.merchant = enabled(&value),
                    "enablePrediction" => form.enabled.prediction = enabled(&value),
                    _ => {}
                }
            }
        }
    }
    Ok(form)
}

/// Find a header by exact (case-insensitive) name.
fn find_column(headers: &csv::StringRecord, wanted: &str) -> Option<usize> {
    headers
        .iter()
        .position(|h| h.eq_ignore_ascii_case(wanted))
}

/// Auto-detect the payee column from common header names.
fn detect_payee_column(headers: &csv::StringRecord) -> Option<usize> {
    const HINTS: [&str; 4] = ["payee", "vendor", "supplier", "name"];
    for hint in HINTS {
        if let Some(idx) = headers
            .iter()
            .position(|h| h.to_ascii_lowercase().contains(hint))
        {
            return Some(idx);
        }
    }
    None
}

fn detect_address_columns(headers: &csv::StringRecord, form: &UploadForm) -> AddressColumnMap {
    let named = |explicit: &Option<String>, hint: &str| -> Option<String> {
        if let Some(name) = explicit {
            return headers
                .iter()
                .find(|h| h.eq_ignore_ascii_case(name))
                .map(|h| h.to_string());
        }
        headers
            .iter()
            .find(|h| h.to_ascii_lowercase().contains(hint))
            .map(|h| h.to_string())
    };
    AddressColumnMap {
        address: named(&form.address_column, "address"),
        city: named(&form.city_column, "city"),
        state: named(&form.state_column, "state"),
        postal_code: named(&form.postal_code_column, "zip")
            .or_else(|| named(&form.postal_code_column, "postal")),
    }
}

/// `POST /upload` - create a batch from a CSV file and start enrichment.
#[tracing::instrument(skip_all)]
pub async fn upload_batch(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>)> {
    let form = read_form(multipart).await?;
    let (file_name, bytes) = form
        .file
        .as_ref()
        .ok_or_else(|| Error::bad_request("missing file field"))?;

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes.as_slice());
    let headers = reader
        .headers()
        .map_err(|e| Error::bad_request(format!("invalid CSV: {e}")))?
        .clone();

    let payee_idx = match &form.payee_column {
        Some(column) => find_column(&headers, column)
            .ok_or_else(|| Error::bad_request(format!("payee column {column:?} not found")))?,
        None => detect_payee_column(&headers)
            .ok_or_else(|| Error::bad_request("no payee column found; pass payeeColumn"))?,
    };
    let column_map = detect_address_columns(&headers, &form);
    let column_idx = |name: &Option<String>| name.as_deref().and_then(|n| find_column(&headers, n));
    let address_idx = column_idx(&column_map.address);
    let city_idx = column_idx(&column_map.city);
    let state_idx = column_idx(&column_map.state);
    let postal_idx = column_idx(&column_map.postal_code);

    let mut batch = Batch::new(file_name.clone(), String::new(), form.enabled);
    batch.stored_name = format!("{}-{}", batch.id.to_short_string(), file_name);
    batch.address_column_map = Some(column_map);

    let mut records = Vec::new();
    let mut skipped_rows = 0usize;
    for row in reader.records() {
        let row = row.map_err(|e| Error::bad_request(format!("invalid CSV row: {e}")))?;
        let name = row.get(payee_idx).unwrap_or("").trim();
        if name.is_empty() {
            skipped_rows += 1;
            continue;
        }

        let mut payload = serde_json::Map::new();
        for (header, value) in headers.iter().zip(row.iter()) {
            payload.insert(header.to_string(), serde_json::Value::String(value.to_string()));
        }

        let mut record = Record::new(
            batch.id,
            name.to_string(),
            normalize_name(name),
            payload,
        );
        let cell = |idx: Option<usize>| {
            idx.and_then(|i| row.get(i))
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        record.address = cell(address_idx);
        record.city = cell(city_idx);
        record.state = cell(state_idx);
        record.postal_code = cell(postal_idx);
        records.push(record);
    }

    if records.is_empty() {
        return Err(Error::bad_request("no payee rows found in file"));
    }

    let total = records.len() as u32;
    state.store.create_batch(&batch).await?;
    state.store.insert_records(&records).await?;
    state.pipeline.submit_batch(batch.id).await?;

    tracing::info!(batch_id = %batch.id, records = total, skipped_rows, "Batch uploaded");
    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            batch_id: batch.id.as_uuid(),
            status: "processing".to_string(),
            total_records: total,
            skipped_rows,
        }),
    ))
}

/// `GET /upload/batches` - batch summaries, newest first.
pub async fn list_batches(State(state): State<AppState>) -> Result<Json<Vec<BatchSummary>>> {
    let batches = state.store.list_batches().await?;
    Ok(Json(batches.iter().map(BatchSummary::from).collect()))
}

/// `GET /status/{batch_id}` - batch status with the progress projection.
pub async fn batch_status(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> Result<Json<StatusResponse>> {
    let batch = state.store.get_batch(BatchId(batch_id)).await?;
    let progress = dossier::project(&batch);
    let progress_message = format!(
        "{} ({} of {} records classified)",
        progress.phase, batch.processed_records, batch.total_records
    );
    Ok(Json(StatusResponse {
        status: batch.status.to_string(),
        current_step: progress.phase,
        progress_message,
        total_records: batch.total_records,
        processed_records: batch.processed_records,
        skipped_records: batch.skipped_records,
        percent_complete: progress.percent,
        stages: StageBreakdown {
            classification: batch.stages.classification,
            supplier: batch.stages.supplier,
            address: batch.stages.address,
            merchant: batch.stages.merchant,
            prediction: batch.stages.prediction,
        },
    }))
}

/// `POST /upload/batches/{batch_id}/cancel` - cancel a batch.
pub async fn cancel_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>> {
    // 404 before cancel so unknown ids do not report success.
    state.store.get_batch(BatchId(batch_id)).await?;
    state.pipeline.cancel_batch(BatchId(batch_id)).await?;
    Ok(Json(serde_json::json!({
        "batchId": batch_id,
        "status": "cancelled",
    })))
}
