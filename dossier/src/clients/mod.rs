//! Outbound collaborator capabilities.
//!
//! Each external system the pipeline talks to is abstracted behind a
//! narrow trait so workers stay testable without network access: the
//! classifier, the address validator, the card network (asynchronous bulk
//! merchant search) and the payment predictor. The supplier catalog is a
//! read model served by the record store and has no client here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{SearchId, ValidatedAddress};

pub mod http;
pub mod mock;

pub use http::{HttpAddressValidator, HttpCardNetwork, HttpClassifier, HttpPredictor};
pub use mock::{MockAddressValidator, MockCardNetwork, MockClassifier, MockPredictor};

/// Errors from outbound collaborator calls.
///
/// The retry policy keys off this taxonomy: auth and non-429 4xx are
/// terminal, 429 and 5xx and network failures are retryable.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Credentials rejected by the collaborator. Terminal and alerted.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The collaborator does not know the referenced entity.
    #[error("not found: {0}")]
    NotFound(String),

    /// The collaborator asked us to back off.
    #[error("rate limited by collaborator")]
    RateLimited,

    /// Any other non-success HTTP status.
    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Transport-level failure (DNS, connect, timeout, ...).
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The collaborator answered with a body we could not decode.
    #[error("invalid response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ClientError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::RateLimited | ClientError::Network(_) => true,
            ClientError::Status { status, .. } => *status >= 500,
            ClientError::Auth(_) | ClientError::NotFound(_) | ClientError::Decode(_) => false,
        }
    }

    /// Authentication failures get alerted, not retried.
    pub fn is_auth(&self) -> bool {
        matches!(self, ClientError::Auth(_))
    }

    /// Map an HTTP status + body into the error taxonomy.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => ClientError::Auth(body),
            404 => ClientError::NotFound(body),
            429 => ClientError::RateLimited,
            _ => ClientError::Status { status, body },
        }
    }
}

// ============================================================================
// Classifier
// ============================================================================

/// Raw classifier output.
///
/// `payee_type` stays a string here; the classify worker validates it
/// against the enum and coerces unrecognized values to `Unknown`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierOutput {
    pub payee_type: String,
    pub confidence: f64,
    pub sic_code: Option<String>,
    pub sic_description: Option<String>,
    pub reasoning: Option<String>,
}

/// Payee classification capability.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, cleaned_name: &str) -> Result<ClassifierOutput, ClientError>;
}

// ============================================================================
// Address validator
// ============================================================================

/// Raw address fields handed to the validator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressInput {
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
}

/// Postal address validation capability.
#[async_trait]
pub trait AddressValidator: Send + Sync {
    async fn validate(&self, input: &AddressInput) -> Result<ValidatedAddress, ClientError>;
}

// ============================================================================
// Card network (asynchronous bulk merchant search)
// ============================================================================

/// One row of a bulk merchant search submission.
///
/// `search_request_id` is our correlation id; the collaborator echoes it
/// back on each result item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerchantSearchRow {
    pub search_request_id: String,
    pub business_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
}

/// Collaborator-reported status of a bulk search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BulkSearchStatus {
    InProgress,
    Completed,
    Cancelled,
    NoMatch,
}

/// One merchant hit from a bulk search result.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MerchantHit {
    pub search_request_id: String,
    pub confidence: Option<f64>,
    pub business_name: Option<String>,
    pub tax_id: Option<String>,
    pub merchant_ids: Vec<String>,
    pub mcc: Option<String>,
    pub mcc_group: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub transaction_recency: Option<String>,
    pub commercial_history: Option<String>,
    pub small_business: Option<bool>,
    pub last_transaction_date: Option<String>,
    pub data_quality_level: Option<String>,
}

/// A bulk search's current results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkSearchResults {
    pub status: BulkSearchStatus,
    pub items: Vec<MerchantHit>,
}

/// Card-network merchant enrichment capability.
///
/// Submission is a synchronous ack; results arrive minutes to tens of
/// minutes later via webhook or polling.
#[async_trait]
pub trait CardNetwork: Send + Sync {
    /// Submit a bulk search; returns the collaborator-issued search id.
    async fn submit_bulk(
        &self,
        lookup_type: &str,
        searches: &[MerchantSearchRow],
    ) -> Result<SearchId, ClientError>;

    /// Fetch the current status and any available results.
    async fn get_search_results(
        &self,
        search_id: &SearchId,
    ) -> Result<BulkSearchResults, ClientError>;
}

// ============================================================================
// Predictor
// ============================================================================

/// Raw predictor output.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PredictorOutput {
    pub predicted_payment_success: f64,
    pub confidence: f64,
    pub risk_factors: Vec<String>,
    pub recommended_payment_method: Option<String>,
    pub processing_time_estimate: Option<String>,
    pub fraud_risk_score: Option<f64>,
}

/// Payment-outcome prediction capability.
#[async_trait]
pub trait Predictor: Send + Sync {
    async fn predict(
        &self,
        model_id: &str,
        payee_data: &serde_json::Value,
    ) -> Result<PredictorOutput, ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_taxonomy() {
        assert!(ClientError::from_status(401, String::new()).is_auth());
        assert!(ClientError::from_status(403, String::new()).is_auth());
        assert!(!ClientError::from_status(401, String::new()).is_retryable());
        assert!(ClientError::from_status(429, String::new()).is_retryable());
        assert!(ClientError::from_status(503, String::new()).is_retryable());
        assert!(!ClientError::from_status(400, String::new()).is_retryable());
        assert!(!ClientError::from_status(404, String::new()).is_retryable());
    }
}
