//! Exclusion keyword administration.
//!
//! Every mutation invalidates the filter's cached active set so changes
//! take effect for the next dispatched batch.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use dossier::{ExclusionKeyword, KeywordId, KeywordTestResult, KeywordUpdate};

use crate::api::AppState;
use crate::errors::{Error, Result};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateKeywordRequest {
    pub keyword: String,
    pub added_by: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateKeywordRequest {
    pub keyword: Option<String>,
    pub notes: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestKeywordRequest {
    pub keyword: String,
    pub names: Vec<String>,
}

/// `POST /keywords`
pub async fn create_keyword(
    State(state): State<AppState>,
    Json(request): Json<CreateKeywordRequest>,
) -> Result<(StatusCode, Json<ExclusionKeyword>)> {
    if request.keyword.trim().is_empty() {
        return Err(Error::bad_request("keyword must not be empty"));
    }
    if request.keyword.trim().contains(char::is_whitespace) {
        return Err(Error::bad_request("keyword must be a single word"));
    }
    let keyword = ExclusionKeyword::new(&request.keyword, request.added_by, request.notes);
    state.store.create_keyword(keyword.clone()).await?;
    state.filter.invalidate();
    tracing::info!(keyword = %keyword.keyword, "Exclusion keyword created");
    Ok((StatusCode::CREATED, Json(keyword)))
}

/// `GET /keywords`
pub async fn list_keywords(
    State(state): State<AppState>,
) -> Result<Json<Vec<ExclusionKeyword>>> {
    Ok(Json(state.store.list_keywords().await?))
}

/// `PATCH /keywords/{keyword_id}`
pub async fn update_keyword(
    State(state): State<AppState>,
    Path(keyword_id): Path<Uuid>,
    Json(request): Json<UpdateKeywordRequest>,
) -> Result<Json<ExclusionKeyword>> {
    if let Some(keyword) = request.keyword.as_deref() {
        if keyword.trim().is_empty() || keyword.trim().contains(char::is_whitespace) {
            return Err(Error::bad_request("keyword must be a single word"));
        }
    }
    let updated = state
        .store
        .update_keyword(
            KeywordId(keyword_id),
            KeywordUpdate {
                keyword: request.keyword,
                notes: request.notes,
                is_active: request.is_active,
            },
        )
        .await?;
    state.filter.invalidate();
    Ok(Json(updated))
}

/// `DELETE /keywords/{keyword_id}`
pub async fn delete_keyword(
    State(state): State<AppState>,
    Path(keyword_id): Path<Uuid>,
) -> Result<StatusCode> {
    state.store.delete_keyword(KeywordId(keyword_id)).await?;
    state.filter.invalidate();
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /keywords/test` - dry-run a keyword against sample names.
pub async fn test_keyword(
    State(state): State<AppState>,
    Json(request): Json<TestKeywordRequest>,
) -> Result<Json<Vec<KeywordTestResult>>> {
    if request.keyword.trim().is_empty() {
        return Err(Error::bad_request("keyword must not be empty"));
    }
    Ok(Json(state.filter.test_keyword(&request.keyword, &request.names)))
}
