//! Async search request lifecycle.
//!
//! Every bulk merchant submission is tracked as a search request moving
//! through a type-safe state machine, enforced at compile time:
//!
//! ```text
//!             notified()                          apply
//! submitted ─────────────────────▶ webhook_received ──▶ completed
//!     │                                   ▲                ▲
//!     │ begin_polling()                   │                │ poll results
//!     ▼            notified()             │                │
//!  polling ───────────────────────────────┘────────────────┘
//!     │
//!     ├──▶ no_match   (terminal success: collaborator had no hits)
//!     ├──▶ failed     (terminal: max attempts, auth error, unknown id)
//!     └──▶ cancelled  (terminal: batch cancel)
//! ```
//!
//! Once terminal, a request is immutable; the store refuses late writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::RecordStore;
use crate::types::{BatchId, RecordId, SearchId, SearchIdMapping};

pub mod sweeper;
pub mod tracker;

pub use sweeper::{Sweeper, SweeperConfig};
pub use tracker::SearchTracker;

/// Marker trait for valid search request states.
pub trait SearchState: Send + Sync {}

/// A tracked bulk search, parameterized by its current state.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest<T: SearchState> {
    pub state: T,
    pub data: SearchData,
}

/// State-independent submission data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchData {
    /// Collaborator-issued id; unique across the registry.
    pub search_id: SearchId,
    pub batch_id: BatchId,
    /// Set for single-record submissions; bulk submissions leave it
    /// empty and rely on the mapping.
    pub record_id: Option<RecordId>,
    /// The submitted payload, kept for operator debugging.
    pub request_payload: serde_json::Value,
    /// Per-row correlation id → record id. Persisted, never rederived
    /// from payload order.
    pub mapping: SearchIdMapping,
    pub submitted_at: DateTime<Utc>,
}

// ============================================================================
// States
// ============================================================================

/// Submission acked by the collaborator; no poll has run yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Submitted {}

impl SearchState for Submitted {}

/// The sweeper is polling the collaborator for this request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Polling {
    pub poll_attempts: u32,
    pub last_polled_at: Option<DateTime<Utc>>,
}

impl SearchState for Polling {}

/// The collaborator notified us that results are ready; result
/// application is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebhookReceived {
    pub received_at: DateTime<Utc>,
    pub poll_attempts: u32,
}

impl SearchState for WebhookReceived {}

/// Results applied to every mapped record.
#[derive(Debug, Clone, PartialEq)]
pub struct Completed {
    pub completed_at: DateTime<Utc>,
    pub poll_attempts: u32,
    /// Raw collaborator response, kept for operator debugging.
    pub response_payload: Option<serde_json::Value>,
}

impl SearchState for Completed {}

/// Terminal success variant: the collaborator reported no hits for the
/// whole submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoMatch {
    pub completed_at: DateTime<Utc>,
    pub poll_attempts: u32,
}

impl SearchState for NoMatch {}

/// Terminal failure: auth error, unknown search id, or the collaborator
/// reported an unrecoverable error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failed {
    pub error: String,
    pub failed_at: DateTime<Utc>,
    pub poll_attempts: u32,
}

impl SearchState for Failed {}

/// Terminal: the owning batch was cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cancelled {
    pub reason: String,
    pub cancelled_at: DateTime<Utc>,
}

impl SearchState for Cancelled {}

// ============================================================================
// Status (flat view for queries and persistence)
// ============================================================================

/// Flat status of a search request, for queries and the status column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStatus {
    Submitted,
    Polling,
    WebhookReceived,
    Completed,
    Failed,
    Cancelled,
    NoMatch,
}

impl SearchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SearchStatus::Completed
                | SearchStatus::Failed
                | SearchStatus::Cancelled
                | SearchStatus::NoMatch
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SearchStatus::Submitted => "submitted",
            SearchStatus::Polling => "polling",
            SearchStatus::WebhookReceived => "webhook_received",
            SearchStatus::Completed => "completed",
            SearchStatus::Failed => "failed",
            SearchStatus::Cancelled => "cancelled",
            SearchStatus::NoMatch => "no_match",
        }
    }
}

impl std::fmt::Display for SearchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SearchStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "submitted" => Ok(SearchStatus::Submitted),
            "polling" => Ok(SearchStatus::Polling),
            "webhook_received" => Ok(SearchStatus::WebhookReceived),
            "completed" => Ok(SearchStatus::Completed),
            "failed" => Ok(SearchStatus::Failed),
            "cancelled" => Ok(SearchStatus::Cancelled),
            "no_match" => Ok(SearchStatus::NoMatch),
            other => Err(format!("unrecognized search status: {other}")),
        }
    }
}

// ============================================================================
// Unified representation
// ============================================================================

/// A search request in any state; used for storage and queries.
#[derive(Debug, Clone, PartialEq)]
pub enum AnySearch {
    Submitted(SearchRequest<Submitted>),
    Polling(SearchRequest<Polling>),
    WebhookReceived(SearchRequest<WebhookReceived>),
    Completed(SearchRequest<Completed>),
    Failed(SearchRequest<Failed>),
    Cancelled(SearchRequest<Cancelled>),
    NoMatch(SearchRequest<NoMatch>),
}

impl AnySearch {
    pub fn data(&self) -> &SearchData {
        match self {
            AnySearch::Submitted(r) => &r.data,
            AnySearch::Polling(r) => &r.data,
            AnySearch::WebhookReceived(r) => &r.data,
            AnySearch::Completed(r) => &r.data,
            AnySearch::Failed(r) => &r.data,
            AnySearch::Cancelled(r) => &r.data,
            AnySearch::NoMatch(r) => &r.data,
        }
    }

    pub fn id(&self) -> &SearchId {
        &self.data().search_id
    }

    pub fn status(&self) -> SearchStatus {
        match self {
            AnySearch::Submitted(_) => SearchStatus::Submitted,
            AnySearch::Polling(_) => SearchStatus::Polling,
            AnySearch::WebhookReceived(_) => SearchStatus::WebhookReceived,
            AnySearch::Completed(_) => SearchStatus::Completed,
            AnySearch::Failed(_) => SearchStatus::Failed,
            AnySearch::Cancelled(_) => SearchStatus::Cancelled,
            AnySearch::NoMatch(_) => SearchStatus::NoMatch,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn poll_attempts(&self) -> u32 {
        match self {
            AnySearch::Submitted(_) => 0,
            AnySearch::Polling(r) => r.state.poll_attempts,
            AnySearch::WebhookReceived(r) => r.state.poll_attempts,
            AnySearch::Completed(r) => r.state.poll_attempts,
            AnySearch::Failed(r) => r.state.poll_attempts,
            AnySearch::Cancelled(_) => 0,
            AnySearch::NoMatch(r) => r.state.poll_attempts,
        }
    }

    /// Last forward progress; drives the sweeper's staleness scan.
    pub fn last_activity_at(&self) -> DateTime<Utc> {
        match self {
            AnySearch::Submitted(r) => r.data.submitted_at,
            AnySearch::Polling(r) => r.state.last_polled_at.unwrap_or(r.data.submitted_at),
            AnySearch::WebhookReceived(r) => r.state.received_at,
            AnySearch::Completed(r) => r.state.completed_at,
            AnySearch::Failed(r) => r.state.failed_at,
            AnySearch::Cancelled(r) => r.state.cancelled_at,
            AnySearch::NoMatch(r) => r.state.completed_at,
        }
    }

    /// When the request reached its terminal state, if it has.
    pub fn terminal_at(&self) -> Option<DateTime<Utc>> {
        match self {
            AnySearch::Completed(r) => Some(r.state.completed_at),
            AnySearch::Failed(r) => Some(r.state.failed_at),
            AnySearch::Cancelled(r) => Some(r.state.cancelled_at),
            AnySearch::NoMatch(r) => Some(r.state.completed_at),
            _ => None,
        }
    }
}

macro_rules! any_from {
    ($state:ident) => {
        impl From<SearchRequest<$state>> for AnySearch {
            fn from(r: SearchRequest<$state>) -> Self {
                AnySearch::$state(r)
            }
        }
    };
}

any_from!(Submitted);
any_from!(Polling);
any_from!(WebhookReceived);
any_from!(Completed);
any_from!(Failed);
any_from!(Cancelled);
any_from!(NoMatch);

// ============================================================================
// Transitions
// ============================================================================

impl SearchRequest<Submitted> {
    /// A freshly acked submission.
    pub fn new(data: SearchData) -> Self {
        Self {
            state: Submitted {},
            data,
        }
    }

    pub async fn begin_polling(self, store: &dyn RecordStore) -> Result<SearchRequest<Polling>> {
        let request = SearchRequest {
            data: self.data,
            state: Polling {
                poll_attempts: 0,
                last_polled_at: None,
            },
        };
        store.persist_search(&request.clone().into()).await?;
        Ok(request)
    }

    pub async fn notified(self, store: &dyn RecordStore) -> Result<SearchRequest<WebhookReceived>> {
        let request = SearchRequest {
            data: self.data,
            state: WebhookReceived {
                received_at: Utc::now(),
                poll_attempts: 0,
            },
        };
        store.persist_search(&request.clone().into()).await?;
        Ok(request)
    }

    pub async fn cancel(
        self,
        reason: impl Into<String>,
        store: &dyn RecordStore,
    ) -> Result<SearchRequest<Cancelled>> {
        let request = SearchRequest {
            data: self.data,
            state: Cancelled {
                reason: reason.into(),
                cancelled_at: Utc::now(),
            },
        };
        store.persist_search(&request.clone().into()).await?;
        Ok(request)
    }

    pub async fn fail(
        self,
        error: impl Into<String>,
        store: &dyn RecordStore,
    ) -> Result<SearchRequest<Failed>> {
        let request = SearchRequest {
            data: self.data,
            state: Failed {
                error: error.into(),
                failed_at: Utc::now(),
                poll_attempts: 0,
            },
        };
        store.persist_search(&request.clone().into()).await?;
        Ok(request)
    }
}

impl SearchRequest<Polling> {
    /// Record one poll attempt that did not resolve the request.
    pub async fn touch(mut self, store: &dyn RecordStore) -> Result<SearchRequest<Polling>> {
        self.state.poll_attempts += 1;
        self.state.last_polled_at = Some(Utc::now());
        store.persist_search(&self.clone().into()).await?;
        Ok(self)
    }

    pub async fn notified(self, store: &dyn RecordStore) -> Result<SearchRequest<WebhookReceived>> {
        let request = SearchRequest {
            state: WebhookReceived {
                received_at: Utc::now(),
                poll_attempts: self.state.poll_attempts,
            },
            data: self.data,
        };
        store.persist_search(&request.clone().into()).await?;
        Ok(request)
    }

    pub async fn complete(
        self,
        response_payload: Option<serde_json::Value>,
        store: &dyn RecordStore,
    ) -> Result<SearchRequest<Completed>> {
        let request = SearchRequest {
            state: Completed {
                completed_at: Utc::now(),
                poll_attempts: self.state.poll_attempts,
                response_payload,
            },
            data: self.data,
        };
        store.persist_search(&request.clone().into()).await?;
        Ok(request)
    }

    pub async fn no_match(self, store: &dyn RecordStore) -> Result<SearchRequest<NoMatch>> {
        let request = SearchRequest {
            state: NoMatch {
                completed_at: Utc::now(),
                poll_attempts: self.state.poll_attempts,
            },
            data: self.data,
        };
        store.persist_search(&request.clone().into()).await?;
        Ok(request)
    }

    pub async fn fail(
        self,
        error: impl Into<String>,
        store: &dyn RecordStore,
    ) -> Result<SearchRequest<Failed>> {
        let request = SearchRequest {
            state: Failed {
                error: error.into(),
                failed_at: Utc::now(),
                poll_attempts: self.state.poll_attempts,
            },
            data: self.data,
        };
        store.persist_search(&request.clone().into()).await?;
        Ok(request)
    }

    pub async fn cancel(
        self,
        reason: impl Into<String>,
        store: &dyn RecordStore,
    ) -> Result<SearchRequest<Cancelled>> {
        let request = SearchRequest {
            state: Cancelled {
                reason: reason.into(),
                cancelled_at: Utc::now(),
            },
            data: self.data,
        };
        store.persist_search(&request.clone().into()).await?;
        Ok(request)
    }
}

impl SearchRequest<WebhookReceived> {
    pub async fn complete(
        self,
        response_payload: Option<serde_json::Value>,
        store: &dyn RecordStore,
    ) -> Result<SearchRequest<Completed>> {
        let request = SearchRequest {
            state: Completed {
                completed_at: Utc::now(),
                poll_attempts: self.state.poll_attempts,
                response_payload,
            },
            data: self.data,
        };
        store.persist_search(&request.clone().into()).await?;
        Ok(request)
    }

    pub async fn no_match(self, store: &dyn RecordStore) -> Result<SearchRequest<NoMatch>> {
        let request = SearchRequest {
            state: NoMatch {
                completed_at: Utc::now(),
                poll_attempts: self.state.poll_attempts,
            },
            data: self.data,
        };
        store.persist_search(&request.clone().into()).await?;
        Ok(request)
    }

    pub async fn fail(
        self,
        error: impl Into<String>,
        store: &dyn RecordStore,
    ) -> Result<SearchRequest<Failed>> {
        let request = SearchRequest {
            state: Failed {
                error: error.into(),
                failed_at: Utc::now(),
                poll_attempts: self.state.poll_attempts,
            },
            data: self.data,
        };
        store.persist_search(&request.clone().into()).await?;
        Ok(request)
    }

    pub async fn cancel(
        self,
        reason: impl Into<String>,
        store: &dyn RecordStore,
    ) -> Result<SearchRequest<Cancelled>> {
        let request = SearchRequest {
            state: Cancelled {
                reason: reason.into(),
                cancelled_at: Utc::now(),
            },
            data: self.data,
        };
        store.persist_search(&request.clone().into()).await?;
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn sample_data(search_id: &str) -> SearchData {
        SearchData {
            search_id: SearchId::from(search_id),
            batch_id: BatchId::new(),
            record_id: None,
            request_payload: serde_json::json!({"searches": []}),
            mapping: HashMap::new(),
            submitted_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_happy_path_via_polling() {
        let store = Arc::new(InMemoryStore::new());
        let request = SearchRequest::new(sample_data("bulk-1"));
        store.insert_search(&request.clone().into()).await.unwrap();

        let polling = request.begin_polling(store.as_ref()).await.unwrap();
        let polling = polling.touch(store.as_ref()).await.unwrap();
        assert_eq!(polling.state.poll_attempts, 1);

        let completed = polling.complete(None, store.as_ref()).await.unwrap();
        assert_eq!(completed.state.poll_attempts, 1);

        let stored = store.get_search(&SearchId::from("bulk-1")).await.unwrap();
        assert_eq!(stored.status(), SearchStatus::Completed);
        assert!(stored.is_terminal());
    }

    #[tokio::test]
    async fn test_webhook_path() {
        let store = Arc::new(InMemoryStore::new());
        let request = SearchRequest::new(sample_data("bulk-2"));
        store.insert_search(&request.clone().into()).await.unwrap();

        let received = request.notified(store.as_ref()).await.unwrap();
        let completed = received
            .complete(Some(serde_json::json!({"items": []})), store.as_ref())
            .await
            .unwrap();
        assert_eq!(completed.state.poll_attempts, 0);

        let stored = store.get_search(&SearchId::from("bulk-2")).await.unwrap();
        assert_eq!(stored.status(), SearchStatus::Completed);
    }

    #[tokio::test]
    async fn test_terminal_is_immutable() {
        let store = Arc::new(InMemoryStore::new());
        let request = SearchRequest::new(sample_data("bulk-3"));
        store.insert_search(&request.clone().into()).await.unwrap();

        let polling = request.begin_polling(store.as_ref()).await.unwrap();
        let cancelled = polling.cancel("batch cancelled", store.as_ref()).await.unwrap();

        // A late completion attempt must be rejected by the store.
        let late = SearchRequest {
            state: Completed {
                completed_at: Utc::now(),
                poll_attempts: 5,
                response_payload: None,
            },
            data: cancelled.data.clone(),
        };
        let err = store.persist_search(&late.into()).await;
        assert!(err.is_err());

        let stored = store.get_search(&SearchId::from("bulk-3")).await.unwrap();
        assert_eq!(stored.status(), SearchStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_no_match_is_terminal_success() {
        let store = Arc::new(InMemoryStore::new());
        let request = SearchRequest::new(sample_data("bulk-4"));
        store.insert_search(&request.clone().into()).await.unwrap();

        let polling = request.begin_polling(store.as_ref()).await.unwrap();
        polling.no_match(store.as_ref()).await.unwrap();

        let stored = store.get_search(&SearchId::from("bulk-4")).await.unwrap();
        assert_eq!(stored.status(), SearchStatus::NoMatch);
        assert!(stored.is_terminal());
    }
}
