//! PostgreSQL store implementation.
//!
//! Production backend. All CAS semantics are expressed as conditional
//! UPDATEs (`WHERE status IN (...)`) so concurrent workers and the
//! webhook/poll race settle on first-writer-wins without explicit
//! locking. Stage counters live in per-stage columns on the batch row and
//! are bumped with atomic increments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use uuid::Uuid;

use super::RecordStore;
use crate::error::{DossierError, Result};
use crate::search::{
    AnySearch, Cancelled, Completed, Failed, NoMatch, Polling, SearchData, SearchRequest,
    SearchStatus, Submitted, WebhookReceived,
};
use crate::types::{
    Batch, BatchId, BatchStatus, EventId, ExclusionKeyword, KeywordId, KeywordUpdate,
    KnownSupplier, Record, RecordId, SearchId, Stage, StageCounters, StageFields, StageOutcome,
    StageState, StageStates, StageStatus, WebhookEvent,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

const TERMINAL_STAGE_SQL: &str = "('completed', 'failed', 'skipped')";
const TERMINAL_SEARCH_SQL: &str = "('completed', 'failed', 'cancelled', 'no_match')";

fn stage_prefix(stage: Stage) -> &'static str {
    stage.as_str()
}

/// Column holding the stage's result fields on the record row.
fn stage_field_column(stage: Stage) -> &'static str {
    match stage {
        Stage::Classification => "classification",
        Stage::Supplier => "supplier_match",
        Stage::Address => "validated_address",
        Stage::Merchant => "merchant",
        Stage::Prediction => "prediction",
    }
}

fn parse<T: std::str::FromStr>(value: &str, what: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| DossierError::Internal(format!("corrupt {what} value: {value:?}")))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// PostgreSQL-backed [`RecordStore`].
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and run migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| DossierError::Internal(format!("migration failed: {e}")))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn batch_from_row(row: &sqlx::postgres::PgRow) -> Result<Batch> {
    let mut stages = crate::types::BatchStageProgress::default();
    for stage in Stage::ALL {
        let prefix = stage_prefix(stage);
        let status: String = row.try_get(format!("{prefix}_status").as_str())?;
        *stages.get_mut(stage) = StageCounters {
            status: parse(&status, "stage status")?,
            total: row.try_get::<i32, _>(format!("{prefix}_total").as_str())? as u32,
            processed: row.try_get::<i32, _>(format!("{prefix}_processed").as_str())? as u32,
            succeeded: row.try_get::<i32, _>(format!("{prefix}_succeeded").as_str())? as u32,
        };
    }

    let status: String = row.try_get("status")?;
    let enabled: serde_json::Value = row.try_get("enabled")?;
    let address_column_map: Option<serde_json::Value> = row.try_get("address_column_map")?;

    Ok(Batch {
        id: BatchId(row.try_get::<Uuid, _>("id")?),
        original_name: row.try_get("original_name")?,
        stored_name: row.try_get("stored_name")?,
        status: parse(&status, "batch status")?,
        total_records: row.try_get::<i32, _>("total_records")? as u32,
        processed_records: row.try_get::<i32, _>("processed_records")? as u32,
        skipped_records: row.try_get::<i32, _>("skipped_records")? as u32,
        stages,
        enabled: serde_json::from_value(enabled)?,
        address_column_map: address_column_map.map(serde_json::from_value).transpose()?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<Record> {
    let mut states: Option<StageStates> = None;
    for stage in Stage::ALL {
        let prefix = stage_prefix(stage);
        let status: String = row.try_get(format!("{prefix}_status").as_str())?;
        let state = StageState {
            status: parse(&status, "stage status")?,
            error: row.try_get(format!("{prefix}_error").as_str())?,
            updated_at: row.try_get(format!("{prefix}_updated_at").as_str())?,
        };
        match &mut states {
            None => {
                let mut all = StageStates::pending(state.updated_at);
                *all.get_mut(stage) = state;
                states = Some(all);
            }
            Some(all) => *all.get_mut(stage) = state,
        }
    }
    let stages = states.unwrap_or_else(|| StageStates::pending(Utc::now()));

    let payload: serde_json::Value = row.try_get("original_payload")?;
    let payload = payload.as_object().cloned().unwrap_or_default();

    let json_opt = |name: &str| -> Result<Option<serde_json::Value>> {
        Ok(row.try_get::<Option<serde_json::Value>, _>(name)?)
    };

    Ok(Record {
        id: RecordId(row.try_get::<Uuid, _>("id")?),
        batch_id: BatchId(row.try_get::<Uuid, _>("batch_id")?),
        original_name: row.try_get("original_name")?,
        cleaned_name: row.try_get("cleaned_name")?,
        original_payload: payload,
        address: row.try_get("address")?,
        city: row.try_get("city")?,
        state: row.try_get("state")?,
        postal_code: row.try_get("postal_code")?,
        classification: json_opt("classification")?
            .map(serde_json::from_value)
            .transpose()?,
        is_excluded: row.try_get("is_excluded")?,
        exclusion_keyword: row.try_get("exclusion_keyword")?,
        supplier_match: json_opt("supplier_match")?
            .map(serde_json::from_value)
            .transpose()?,
        validated_address: json_opt("validated_address")?
            .map(serde_json::from_value)
            .transpose()?,
        merchant: json_opt("merchant")?.map(serde_json::from_value).transpose()?,
        prediction: json_opt("prediction")?
            .map(serde_json::from_value)
            .transpose()?,
        stages,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn supplier_from_row(row: &sqlx::postgres::PgRow) -> Result<KnownSupplier> {
    Ok(KnownSupplier {
        supplier_id: row.try_get("supplier_id")?,
        name: row.try_get("name")?,
        normalized_name: row.try_get("normalized_name")?,
        category: row.try_get("category")?,
        mcc: row.try_get("mcc")?,
        industry: row.try_get("industry")?,
        payment_type: row.try_get("payment_type")?,
        city: row.try_get("city")?,
        state: row.try_get("state")?,
        confidence: row.try_get("confidence")?,
        name_length: row.try_get::<i32, _>("name_length")? as u32,
        has_business_indicator: row.try_get("has_business_indicator")?,
        common_name_score: row.try_get("common_name_score")?,
    })
}

fn keyword_from_row(row: &sqlx::postgres::PgRow) -> Result<ExclusionKeyword> {
    Ok(ExclusionKeyword {
        id: KeywordId(row.try_get::<Uuid, _>("id")?),
        keyword: row.try_get("keyword")?,
        added_by: row.try_get("added_by")?,
        notes: row.try_get("notes")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn search_from_row(row: &sqlx::postgres::PgRow) -> Result<AnySearch> {
    let mapping: serde_json::Value = row.try_get("mapping")?;
    let data = SearchData {
        search_id: SearchId(row.try_get("search_id")?),
        batch_id: BatchId(row.try_get::<Uuid, _>("batch_id")?),
        record_id: row.try_get::<Option<Uuid>, _>("record_id")?.map(RecordId),
        request_payload: row.try_get("request_payload")?,
        mapping: serde_json::from_value(mapping)?,
        submitted_at: row.try_get("submitted_at")?,
    };

    let status: String = row.try_get("status")?;
    let status: SearchStatus = parse(&status, "search status")?;
    let poll_attempts = row.try_get::<i32, _>("poll_attempts")? as u32;
    let fallback_ts = data.submitted_at;
    let ts = |name: &str| -> Result<DateTime<Utc>> {
        Ok(row
            .try_get::<Option<DateTime<Utc>>, _>(name)?
            .unwrap_or(fallback_ts))
    };

    Ok(match status {
        SearchStatus::Submitted => SearchRequest {
            state: Submitted {},
            data,
        }
        .into(),
        SearchStatus::Polling => SearchRequest {
            state: Polling {
                poll_attempts,
                last_polled_at: row.try_get("last_polled_at")?,
            },
            data,
        }
        .into(),
        SearchStatus::WebhookReceived => SearchRequest {
            state: WebhookReceived {
                received_at: ts("webhook_received_at")?,
                poll_attempts,
            },
            data,
        }
        .into(),
        SearchStatus::Completed => SearchRequest {
            state: Completed {
                completed_at: ts("completed_at")?,
                poll_attempts,
                response_payload: row.try_get("response_payload")?,
            },
            data,
        }
        .into(),
        SearchStatus::Failed => SearchRequest {
            state: Failed {
                error: row
                    .try_get::<Option<String>, _>("error")?
                    .unwrap_or_default(),
                failed_at: ts("completed_at")?,
                poll_attempts,
            },
            data,
        }
        .into(),
        SearchStatus::Cancelled => SearchRequest {
            state: Cancelled {
                reason: row
                    .try_get::<Option<String>, _>("error")?
                    .unwrap_or_default(),
                cancelled_at: ts("completed_at")?,
            },
            data,
        }
        .into(),
        SearchStatus::NoMatch => SearchRequest {
            state: NoMatch {
                completed_at: ts("completed_at")?,
                poll_attempts,
            },
            data,
        }
        .into(),
    })
}

/// Column values for persisting a search in its current state.
struct SearchColumns {
    status: SearchStatus,
    poll_attempts: i32,
    last_polled_at: Option<DateTime<Utc>>,
    webhook_received_at: Option<DateTime<Utc>>,
    response_payload: Option<serde_json::Value>,
    error: Option<String>,
    completed_at: Option<DateTime<Utc>>,
    last_activity_at: DateTime<Utc>,
}

fn search_columns(search: &AnySearch) -> SearchColumns {
    let mut columns = SearchColumns {
        status: search.status(),
        poll_attempts: search.poll_attempts() as i32,
        last_polled_at: None,
        webhook_received_at: None,
        response_payload: None,
        error: None,
        completed_at: search.terminal_at(),
        last_activity_at: search.last_activity_at(),
    };
    match search {
        AnySearch::Polling(r) => columns.last_polled_at = r.state.last_polled_at,
        AnySearch::WebhookReceived(r) => columns.webhook_received_at = Some(r.state.received_at),
        AnySearch::Completed(r) => columns.response_payload = r.state.response_payload.clone(),
        AnySearch::Failed(r) => columns.error = Some(r.state.error.clone()),
        AnySearch::Cancelled(r) => columns.error = Some(r.state.reason.clone()),
        AnySearch::Submitted(_) | AnySearch::NoMatch(_) => {}
    }
    columns
}

// ============================================================================
// Store implementation
// ============================================================================

#[async_trait]
impl RecordStore for PostgresStore {
    async fn create_batch(&self, batch: &Batch) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO batches (
                id, original_name, stored_name, status,
                total_records, processed_records, skipped_records,
                classification_total, enabled, address_column_map, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(batch.id.as_uuid())
        .bind(&batch.original_name)
        .bind(&batch.stored_name)
        .bind(batch.status.as_str())
        .bind(batch.total_records as i32)
        .bind(batch.processed_records as i32)
        .bind(batch.skipped_records as i32)
        .bind(batch.stages.classification.total as i32)
        .bind(serde_json::to_value(batch.enabled)?)
        .bind(
            batch
                .address_column_map
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
        )
        .bind(batch.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(DossierError::Duplicate(format!("batch {}", batch.id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_batch(&self, id: BatchId) -> Result<Batch> {
        let row = sqlx::query("SELECT * FROM batches WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DossierError::BatchNotFound(id))?;
        batch_from_row(&row)
    }

    async fn list_batches(&self) -> Result<Vec<Batch>> {
        let rows = sqlx::query("SELECT * FROM batches ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(batch_from_row).collect()
    }

    async fn update_batch_status(
        &self,
        id: BatchId,
        status: BatchStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE batches
            SET status = $2, completed_at = COALESCE($3, completed_at)
            WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(id.as_uuid())
        .bind(status.as_str())
        .bind(completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_stage_progress(
        &self,
        id: BatchId,
        stage: Stage,
        status: Option<StageStatus>,
        total: Option<u32>,
    ) -> Result<()> {
        let prefix = stage_prefix(stage);
        let sql = format!(
            "UPDATE batches SET {prefix}_status = COALESCE($2, {prefix}_status), \
             {prefix}_total = COALESCE($3, {prefix}_total) WHERE id = $1"
        );
        sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(status.map(|s| s.as_str()))
            .bind(total.map(|t| t as i32))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn increment_stage_total(&self, id: BatchId, stage: Stage, n: u32) -> Result<()> {
        let prefix = stage_prefix(stage);
        let sql = format!("UPDATE batches SET {prefix}_total = {prefix}_total + $2 WHERE id = $1");
        sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(n as i32)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_stage_result(
        &self,
        id: BatchId,
        stage: Stage,
        succeeded: bool,
    ) -> Result<Batch> {
        let prefix = stage_prefix(stage);
        let processed_records = if stage == Stage::Classification {
            ", processed_records = processed_records + 1"
        } else {
            ""
        };
        let sql = format!(
            "UPDATE batches SET \
             {prefix}_processed = {prefix}_processed + 1, \
             {prefix}_succeeded = {prefix}_succeeded + CASE WHEN $2 THEN 1 ELSE 0 END\
             {processed_records} \
             WHERE id = $1 RETURNING *"
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(succeeded)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DossierError::BatchNotFound(id))?;
        batch_from_row(&row)
    }

    async fn add_skipped_records(&self, id: BatchId, n: u32) -> Result<()> {
        sqlx::query("UPDATE batches SET skipped_records = skipped_records + $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(n as i32)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_records(&self, records: &[Record]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                r#"
                INSERT INTO records (
                    id, batch_id, original_name, cleaned_name, original_payload,
                    address, city, state, postal_code,
                    is_excluded, exclusion_keyword, created_at, updated_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                "#,
            )
            .bind(record.id.as_uuid())
            .bind(record.batch_id.as_uuid())
            .bind(&record.original_name)
            .bind(&record.cleaned_name)
            .bind(serde_json::Value::Object(record.original_payload.clone()))
            .bind(&record.address)
            .bind(&record.city)
            .bind(&record.state)
            .bind(&record.postal_code)
            .bind(record.is_excluded)
            .bind(&record.exclusion_keyword)
            .bind(record.created_at)
            .bind(record.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        if !records.is_empty() {
            let batch_id = records[0].batch_id;
            sqlx::query("UPDATE batches SET total_records = total_records + $2 WHERE id = $1")
                .bind(batch_id.as_uuid())
                .bind(records.len() as i32)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_record(&self, id: RecordId) -> Result<Record> {
        let row = sqlx::query("SELECT * FROM records WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DossierError::RecordNotFound(id))?;
        record_from_row(&row)
    }

    async fn records_by_ids(&self, ids: &[RecordId]) -> Result<Vec<Record>> {
        let uuids: Vec<Uuid> = ids.iter().map(|id| id.as_uuid()).collect();
        let rows = sqlx::query("SELECT * FROM records WHERE id = ANY($1) ORDER BY seq")
            .bind(&uuids)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn list_records(
        &self,
        batch_id: BatchId,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<Record>> {
        let rows = sqlx::query(
            "SELECT * FROM records WHERE batch_id = $1 ORDER BY seq OFFSET $2 LIMIT $3",
        )
        .bind(batch_id.as_uuid())
        .bind(offset as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn count_records(&self, batch_id: BatchId) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM records WHERE batch_id = $1")
            .bind(batch_id.as_uuid())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("cnt")? as u64)
    }

    async fn mark_stage_in_progress(&self, id: RecordId, stage: Stage) -> Result<bool> {
        let prefix = stage_prefix(stage);
        let sql = format!(
            "UPDATE records SET {prefix}_status = 'in_progress', \
             {prefix}_updated_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND {prefix}_status = 'pending'"
        );
        let result = sqlx::query(&sql).bind(id.as_uuid()).execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete_stage(
        &self,
        id: RecordId,
        stage: Stage,
        outcome: StageOutcome,
    ) -> Result<bool> {
        let prefix = stage_prefix(stage);
        let field_column = stage_field_column(stage);

        let fields: Option<Option<serde_json::Value>> = match outcome.fields {
            StageFields::None => None,
            StageFields::Supplier(m) => Some(m.map(serde_json::to_value).transpose()?),
            StageFields::Classification(c) => Some(Some(serde_json::to_value(c)?)),
            StageFields::Address(a) => Some(Some(serde_json::to_value(a)?)),
            StageFields::Merchant(m) => Some(Some(serde_json::to_value(*m)?)),
            StageFields::Prediction(p) => Some(Some(serde_json::to_value(p)?)),
        };

        let result = match fields {
            Some(value) => {
                let sql = format!(
                    "UPDATE records SET {prefix}_status = $2, {prefix}_error = $3, \
                     {prefix}_updated_at = NOW(), updated_at = NOW(), {field_column} = $4 \
                     WHERE id = $1 AND {prefix}_status NOT IN {TERMINAL_STAGE_SQL}"
                );
                sqlx::query(&sql)
                    .bind(id.as_uuid())
                    .bind(outcome.status.as_str())
                    .bind(&outcome.error)
                    .bind(value)
                    .execute(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "UPDATE records SET {prefix}_status = $2, {prefix}_error = $3, \
                     {prefix}_updated_at = NOW(), updated_at = NOW() \
                     WHERE id = $1 AND {prefix}_status NOT IN {TERMINAL_STAGE_SQL}"
                );
                sqlx::query(&sql)
                    .bind(id.as_uuid())
                    .bind(outcome.status.as_str())
                    .bind(&outcome.error)
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(result.rows_affected() == 1)
    }

    async fn mark_excluded(&self, id: RecordId, keyword: &str) -> Result<()> {
        sqlx::query(
            "UPDATE records SET is_excluded = TRUE, exclusion_keyword = $2, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(keyword)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unfinished_stage_count(&self, batch_id: BatchId, stages: &[Stage]) -> Result<u64> {
        if stages.is_empty() {
            return Ok(0);
        }
        let terms: Vec<String> = stages
            .iter()
            .map(|s| {
                format!(
                    "(CASE WHEN {}_status NOT IN {TERMINAL_STAGE_SQL} THEN 1 ELSE 0 END)",
                    stage_prefix(*s)
                )
            })
            .collect();
        let sql = format!(
            "SELECT COALESCE(SUM({}), 0)::BIGINT AS cnt FROM records WHERE batch_id = $1",
            terms.join(" + ")
        );
        let row = sqlx::query(&sql)
            .bind(batch_id.as_uuid())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("cnt")? as u64)
    }

    async fn all_stages_failed(&self, batch_id: BatchId, stages: &[Stage]) -> Result<bool> {
        if stages.is_empty() {
            return Ok(false);
        }
        let conditions: Vec<String> = stages
            .iter()
            .map(|s| format!("{}_status = 'failed'", stage_prefix(*s)))
            .collect();
        let sql = format!(
            "SELECT \
             COUNT(*)::BIGINT AS total, \
             COUNT(*) FILTER (WHERE {})::BIGINT AS failed \
             FROM records WHERE batch_id = $1",
            conditions.join(" AND ")
        );
        let row = sqlx::query(&sql)
            .bind(batch_id.as_uuid())
            .fetch_one(&self.pool)
            .await?;
        let total: i64 = row.try_get("total")?;
        let failed: i64 = row.try_get("failed")?;
        Ok(total > 0 && total == failed)
    }

    async fn upsert_suppliers(&self, suppliers: &[KnownSupplier]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for supplier in suppliers {
            sqlx::query(
                r#"
                INSERT INTO known_suppliers (
                    supplier_id, name, normalized_name, category, mcc, industry,
                    payment_type, city, state, confidence, name_length,
                    has_business_indicator, common_name_score
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ON CONFLICT (supplier_id) DO UPDATE SET
                    name = EXCLUDED.name,
                    normalized_name = EXCLUDED.normalized_name,
                    category = EXCLUDED.category,
                    mcc = EXCLUDED.mcc,
                    industry = EXCLUDED.industry,
                    payment_type = EXCLUDED.payment_type,
                    city = EXCLUDED.city,
                    state = EXCLUDED.state,
                    confidence = EXCLUDED.confidence,
                    name_length = EXCLUDED.name_length,
                    has_business_indicator = EXCLUDED.has_business_indicator,
                    common_name_score = EXCLUDED.common_name_score
                "#,
            )
            .bind(&supplier.supplier_id)
            .bind(&supplier.name)
            .bind(&supplier.normalized_name)
            .bind(&supplier.category)
            .bind(&supplier.mcc)
            .bind(&supplier.industry)
            .bind(&supplier.payment_type)
            .bind(&supplier.city)
            .bind(&supplier.state)
            .bind(supplier.confidence)
            .bind(supplier.name_length as i32)
            .bind(supplier.has_business_indicator)
            .bind(supplier.common_name_score)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
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
        let rows = sqlx::query(
            r#"
            SELECT * FROM known_suppliers
            WHERE normalized_name = $1
               OR normalized_name LIKE '%' || $1 || '%'
               OR $1 LIKE '%' || normalized_name || '%'
               OR (has_business_indicator
                   AND split_part(normalized_name, ' ', 1) = split_part($1, ' ', 1))
            ORDER BY supplier_id
            LIMIT $2
            "#,
        )
        .bind(normalized)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(supplier_from_row).collect()
    }

    async fn create_keyword(&self, keyword: ExclusionKeyword) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO exclusion_keywords (
                id, keyword, added_by, notes, is_active, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(keyword.id.as_uuid())
        .bind(&keyword.keyword)
        .bind(&keyword.added_by)
        .bind(&keyword.notes)
        .bind(keyword.is_active)
        .bind(keyword.created_at)
        .bind(keyword.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(DossierError::Duplicate(format!(
                "keyword {:?}",
                keyword.keyword
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_keywords(&self) -> Result<Vec<ExclusionKeyword>> {
        let rows = sqlx::query("SELECT * FROM exclusion_keywords ORDER BY keyword")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(keyword_from_row).collect()
    }

    async fn update_keyword(
        &self,
        id: KeywordId,
        update: KeywordUpdate,
    ) -> Result<ExclusionKeyword> {
        let result = sqlx::query(
            r#"
            UPDATE exclusion_keywords SET
                keyword = COALESCE(LOWER(TRIM($2)), keyword),
                notes = COALESCE($3, notes),
                is_active = COALESCE($4, is_active),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(&update.keyword)
        .bind(&update.notes)
        .bind(update.is_active)
        .fetch_optional(&self.pool)
        .await;

        match result {
            Ok(Some(row)) => keyword_from_row(&row),
            Ok(None) => Err(DossierError::KeywordNotFound(id)),
            Err(e) if is_unique_violation(&e) => Err(DossierError::Duplicate(format!(
                "keyword {:?}",
                update.keyword.unwrap_or_default()
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_keyword(&self, id: KeywordId) -> Result<()> {
        let result = sqlx::query("DELETE FROM exclusion_keywords WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DossierError::KeywordNotFound(id));
        }
        Ok(())
    }

    async fn active_keywords(&self) -> Result<Vec<String>> {
        let rows =
            sqlx::query("SELECT LOWER(keyword) AS keyword FROM exclusion_keywords WHERE is_active")
                .fetch_all(&self.pool)
                .await?;
        rows.iter()
            .map(|row| Ok(row.try_get("keyword")?))
            .collect()
    }

    async fn insert_search(&self, search: &AnySearch) -> Result<()> {
        let data = search.data();
        let columns = search_columns(search);
        let result = sqlx::query(
            r#"
            INSERT INTO search_requests (
                search_id, batch_id, record_id, status, request_payload,
                mapping, poll_attempts, submitted_at, last_activity_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&data.search_id.0)
        .bind(data.batch_id.as_uuid())
        .bind(data.record_id.map(|id| id.as_uuid()))
        .bind(columns.status.as_str())
        .bind(&data.request_payload)
        .bind(serde_json::to_value(&data.mapping)?)
        .bind(columns.poll_attempts)
        .bind(data.submitted_at)
        .bind(columns.last_activity_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(DossierError::Duplicate(format!(
                "search {}",
                data.search_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn persist_search(&self, search: &AnySearch) -> Result<()> {
        let data = search.data();
        let columns = search_columns(search);
        let sql = format!(
            "UPDATE search_requests SET \
             status = $2, poll_attempts = $3, last_polled_at = $4, \
             webhook_received_at = COALESCE($5, webhook_received_at), \
             response_payload = $6, error = $7, completed_at = $8, last_activity_at = $9 \
             WHERE search_id = $1 AND status NOT IN {TERMINAL_SEARCH_SQL}"
        );
        let result = sqlx::query(&sql)
            .bind(&data.search_id.0)
            .bind(columns.status.as_str())
            .bind(columns.poll_attempts)
            .bind(columns.last_polled_at)
            .bind(columns.webhook_received_at)
            .bind(columns.response_payload)
            .bind(columns.error)
            .bind(columns.completed_at)
            .bind(columns.last_activity_at)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            let existing = self.get_search(&data.search_id).await?;
            return Err(DossierError::InvalidState {
                entity: format!("search {}", data.search_id),
                actual: existing.status().to_string(),
                expected: "non-terminal".to_string(),
            });
        }
        Ok(())
    }

    async fn get_search(&self, id: &SearchId) -> Result<AnySearch> {
        let row = sqlx::query("SELECT * FROM search_requests WHERE search_id = $1")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DossierError::SearchNotFound(id.clone()))?;
        search_from_row(&row)
    }

    async fn stale_searches(
        &self,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<AnySearch>> {
        let sql = format!(
            "SELECT * FROM search_requests \
             WHERE status NOT IN {TERMINAL_SEARCH_SQL} AND last_activity_at < $1 \
             ORDER BY last_activity_at ASC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(older_than)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(search_from_row).collect()
    }

    async fn searches_for_batch(&self, batch_id: BatchId) -> Result<Vec<AnySearch>> {
        let rows = sqlx::query("SELECT * FROM search_requests WHERE batch_id = $1")
            .bind(batch_id.as_uuid())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(search_from_row).collect()
    }

    async fn delete_terminal_searches_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let sql = format!(
            "DELETE FROM search_requests \
             WHERE status IN {TERMINAL_SEARCH_SQL} AND completed_at < $1"
        );
        let result = sqlx::query(&sql).bind(cutoff).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn insert_webhook_event(&self, event: &WebhookEvent) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO webhook_events (
                event_id, event_type, bulk_request_id, payload, received_at
            ) VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(&event.event_id.0)
        .bind(&event.event_type)
        .bind(&event.bulk_request_id.0)
        .bind(&event.payload)
        .bind(event.received_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_webhook_event(&self, id: &EventId, error: Option<String>) -> Result<()> {
        sqlx::query(
            "UPDATE webhook_events SET processed = TRUE, processed_at = NOW(), \
             error_message = $2 WHERE event_id = $1",
        )
        .bind(&id.0)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
