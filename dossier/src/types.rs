//! Core domain types for the enrichment engine.
//!
//! A [`Batch`] groups the [`Record`]s seeded from one upload. Each record
//! moves through up to five enrichment stages; per-stage progress is kept
//! both on the record (status + error) and aggregated on the batch
//! (counters). All terminal stage writes go through the store's
//! compare-and-set so late results never clobber a finished stage.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unique identifier for a batch.
///
/// Uses a short, readable format like "bat_abc123xy" in logs instead of
/// full UUIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId(pub Uuid);

/// A unique identifier for a record within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(pub Uuid);

/// A unique identifier for an exclusion keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeywordId(pub Uuid);

macro_rules! uuid_id {
    ($name:ident, $prefix:literal) => {
        impl $name {
            /// Create a new random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Get the underlying UUID.
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }

            /// Convert to a short, readable string format.
            pub fn to_short_string(&self) -> String {
                let hex = format!("{:032x}", self.0.as_u128());
                format!(concat!($prefix, "_{}"), &hex[..8])
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.to_short_string())
            }
        }
    };
}

uuid_id!(BatchId, "bat");
uuid_id!(RecordId, "rec");
uuid_id!(KeywordId, "kw");

/// Collaborator-issued identifier for a bulk merchant search.
///
/// Opaque: the card network issues these, we only round-trip them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchId(pub String);

impl std::fmt::Display for SearchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SearchId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SearchId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Collaborator-issued identifier for a webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EventId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ============================================================================
// Enums
// ============================================================================

/// Categorical payee classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayeeType {
    Individual,
    Business,
    Government,
    Insurance,
    Banking,
    InternalTransfer,
    Unknown,
}

impl PayeeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayeeType::Individual => "individual",
            PayeeType::Business => "business",
            PayeeType::Government => "government",
            PayeeType::Insurance => "insurance",
            PayeeType::Banking => "banking",
            PayeeType::InternalTransfer => "internal_transfer",
            PayeeType::Unknown => "unknown",
        }
    }
}

impl FromStr for PayeeType {
    type Err = String;

    /// Case-insensitive; tolerates the spacing variants collaborators emit
    /// ("Internal Transfer", "internal-transfer", ...).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let folded: String = s
            .trim()
            .chars()
            .map(|c| match c {
                ' ' | '-' => '_',
                c => c.to_ascii_lowercase(),
            })
            .collect();
        match folded.as_str() {
            "individual" => Ok(PayeeType::Individual),
            "business" => Ok(PayeeType::Business),
            "government" => Ok(PayeeType::Government),
            "insurance" => Ok(PayeeType::Insurance),
            "banking" => Ok(PayeeType::Banking),
            "internal_transfer" => Ok(PayeeType::InternalTransfer),
            "unknown" => Ok(PayeeType::Unknown),
            other => Err(format!("unrecognized payee type: {other}")),
        }
    }
}

impl std::fmt::Display for PayeeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The five enrichment stages a record can pass through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Classification,
    Supplier,
    Address,
    Merchant,
    Prediction,
}

impl Stage {
    /// All stages, in reporting order.
    pub const ALL: [Stage; 5] = [
        Stage::Classification,
        Stage::Supplier,
        Stage::Address,
        Stage::Merchant,
        Stage::Prediction,
    ];

    /// The enrichment stages (everything after classification).
    pub const ENRICHMENT: [Stage; 4] = [
        Stage::Supplier,
        Stage::Address,
        Stage::Merchant,
        Stage::Prediction,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Classification => "classification",
            Stage::Supplier => "supplier",
            Stage::Address => "address",
            Stage::Merchant => "merchant",
            Stage::Prediction => "prediction",
        }
    }

    /// Human-readable phase label used by the progress projection.
    pub fn phase_label(&self) -> &'static str {
        match self {
            Stage::Classification => "Classification",
            Stage::Supplier => "Supplier matching",
            Stage::Address => "Address validation",
            Stage::Merchant => "Merchant enrichment",
            Stage::Prediction => "Payment prediction",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "classification" => Ok(Stage::Classification),
            "supplier" => Ok(Stage::Supplier),
            "address" => Ok(Stage::Address),
            "merchant" => Ok(Stage::Merchant),
            "prediction" => Ok(Stage::Prediction),
            other => Err(format!("unrecognized stage: {other}")),
        }
    }
}

/// Status of one stage for one record (or aggregated on the batch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    /// Terminal statuses admit no further writes for that stage.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Completed | StageStatus::Failed | StageStatus::Skipped
        )
    }
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::InProgress => "in_progress",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StageStatus::Pending),
            "in_progress" => Ok(StageStatus::InProgress),
            "completed" => Ok(StageStatus::Completed),
            "failed" => Ok(StageStatus::Failed),
            "skipped" => Ok(StageStatus::Skipped),
            other => Err(format!("unrecognized stage status: {other}")),
        }
    }
}

/// Lifecycle status of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Enriching,
    Completed,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Processing => "processing",
            BatchStatus::Enriching => "enriching",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BatchStatus::Pending),
            "processing" => Ok(BatchStatus::Processing),
            "enriching" => Ok(BatchStatus::Enriching),
            "completed" => Ok(BatchStatus::Completed),
            "failed" => Ok(BatchStatus::Failed),
            "cancelled" => Ok(BatchStatus::Cancelled),
            other => Err(format!("unrecognized batch status: {other}")),
        }
    }
}

/// Outcome of the merchant lookup for one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MerchantMatchStatus {
    Matched,
    NoMatch,
}

/// Whether a classification needs a human second look.
///
/// Derived from the classifier's confidence at write time; downstream
/// review tooling is external.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    AutoApproved,
    NeedsReview,
}

impl ReviewStatus {
    /// Confidence at or above this threshold skips human review.
    pub const AUTO_APPROVE_THRESHOLD: f64 = 0.9;

    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= Self::AUTO_APPROVE_THRESHOLD {
            ReviewStatus::AutoApproved
        } else {
            ReviewStatus::NeedsReview
        }
    }
}

// ============================================================================
// Stage results
// ============================================================================

/// Result of the classify stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub payee_type: PayeeType,
    /// Clamped to [0, 1].
    pub confidence: f64,
    pub sic_code: Option<String>,
    pub sic_description: Option<String>,
    pub reasoning: Option<String>,
    pub review_status: ReviewStatus,
}

/// Best known-supplier match for a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupplierMatch {
    pub supplier_id: String,
    pub supplier_name: String,
    pub confidence: f64,
    pub reasoning: String,
}

/// Canonicalized postal address from the validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedAddress {
    pub formatted_address: String,
    /// Parsed components as returned by the validator, keyed by component
    /// type. Kept opaque; consumers pick out what they need.
    pub components: serde_json::Value,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub confidence: f64,
    pub place_id: Option<String>,
}

/// Merchant enrichment fields from the card network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MerchantEnrichment {
    pub match_status: MerchantMatchStatus,
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
    pub enriched_at: DateTime<Utc>,
}

impl MerchantEnrichment {
    /// The enrichment written for records the collaborator had no hit for.
    pub fn no_match(now: DateTime<Utc>) -> Self {
        Self {
            match_status: MerchantMatchStatus::NoMatch,
            confidence: None,
            business_name: None,
            tax_id: None,
            merchant_ids: Vec::new(),
            mcc: None,
            mcc_group: None,
            address: None,
            city: None,
            state: None,
            postal_code: None,
            transaction_recency: None,
            commercial_history: None,
            small_business: None,
            last_transaction_date: None,
            data_quality_level: None,
            enriched_at: now,
        }
    }
}

/// Payment-outcome prediction for a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub predicted_payment_success: f64,
    pub confidence: f64,
    pub risk_factors: Vec<String>,
    pub recommended_payment_method: Option<String>,
    pub fraud_risk_score: Option<f64>,
    pub predicted_at: DateTime<Utc>,
}

// ============================================================================
// Records
// ============================================================================

/// Per-record state of a single stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageState {
    pub status: StageStatus,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl StageState {
    pub fn pending(now: DateTime<Utc>) -> Self {
        Self {
            status: StageStatus::Pending,
            error: None,
            updated_at: now,
        }
    }
}

/// Per-record status of all five stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageStates {
    pub classification: StageState,
    pub supplier: StageState,
    pub address: StageState,
    pub merchant: StageState,
    pub prediction: StageState,
}

impl StageStates {
    pub fn pending(now: DateTime<Utc>) -> Self {
        Self {
            classification: StageState::pending(now),
            supplier: StageState::pending(now),
            address: StageState::pending(now),
            merchant: StageState::pending(now),
            prediction: StageState::pending(now),
        }
    }

    pub fn get(&self, stage: Stage) -> &StageState {
        match stage {
            Stage::Classification => &self.classification,
            Stage::Supplier => &self.supplier,
            Stage::Address => &self.address,
            Stage::Merchant => &self.merchant,
            Stage::Prediction => &self.prediction,
        }
    }

    pub fn get_mut(&mut self, stage: Stage) -> &mut StageState {
        match stage {
            Stage::Classification => &mut self.classification,
            Stage::Supplier => &mut self.supplier,
            Stage::Address => &mut self.address,
            Stage::Merchant => &mut self.merchant,
            Stage::Prediction => &mut self.prediction,
        }
    }
}

/// One payee within a batch.
///
/// Created at upload time and mutated only by the worker owning each
/// stage. `original_payload` is the opaque source row, keyed by column
/// name; it is never interpreted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub batch_id: BatchId,
    pub original_name: String,
    pub cleaned_name: String,
    pub original_payload: serde_json::Map<String, serde_json::Value>,

    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,

    pub classification: Option<Classification>,
    pub is_excluded: bool,
    pub exclusion_keyword: Option<String>,
    pub supplier_match: Option<SupplierMatch>,
    pub validated_address: Option<ValidatedAddress>,
    pub merchant: Option<MerchantEnrichment>,
    pub prediction: Option<Prediction>,

    pub stages: StageStates,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record {
    /// A fresh record with all stages pending.
    pub fn new(
        batch_id: BatchId,
        original_name: String,
        cleaned_name: String,
        original_payload: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RecordId::new(),
            batch_id,
            original_name,
            cleaned_name,
            original_payload,
            address: None,
            city: None,
            state: None,
            postal_code: None,
            classification: None,
            is_excluded: false,
            exclusion_keyword: None,
            supplier_match: None,
            validated_address: None,
            merchant: None,
            prediction: None,
            stages: StageStates::pending(now),
            created_at: now,
            updated_at: now,
        }
    }

    /// True when the record has no usable address input at all.
    pub fn has_empty_address(&self) -> bool {
        fn blank(s: &Option<String>) -> bool {
            s.as_deref().map(str::trim).unwrap_or("").is_empty()
        }
        blank(&self.address) && blank(&self.city) && blank(&self.state) && blank(&self.postal_code)
    }
}

// ============================================================================
// Stage write payloads
// ============================================================================

/// Result fields carried by a terminal stage write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageFields {
    Classification(Classification),
    /// `None` when the catalog had no candidate above the threshold.
    Supplier(Option<SupplierMatch>),
    Address(ValidatedAddress),
    Merchant(Box<MerchantEnrichment>),
    Prediction(Prediction),
    /// Failure and skip writes carry no result fields.
    None,
}

/// A terminal stage transition: status, optional error, result fields.
///
/// Applied through the store's compare-and-set; the write is dropped if
/// the stage is already terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub status: StageStatus,
    pub error: Option<String>,
    pub fields: StageFields,
}

impl StageOutcome {
    pub fn completed(fields: StageFields) -> Self {
        Self {
            status: StageStatus::Completed,
            error: None,
            fields,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Failed,
            error: Some(error.into()),
            fields: StageFields::None,
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Skipped,
            error: Some(reason.into()),
            fields: StageFields::None,
        }
    }
}

// ============================================================================
// Batches
// ============================================================================

/// Aggregated progress of one stage across a batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageCounters {
    pub status: StageStatus,
    pub total: u32,
    pub processed: u32,
    pub succeeded: u32,
}

impl StageCounters {
    pub fn pending() -> Self {
        Self {
            status: StageStatus::Pending,
            total: 0,
            processed: 0,
            succeeded: 0,
        }
    }
}

impl Default for StageCounters {
    fn default() -> Self {
        Self::pending()
    }
}

/// Per-stage counters for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BatchStageProgress {
    pub classification: StageCounters,
    pub supplier: StageCounters,
    pub address: StageCounters,
    pub merchant: StageCounters,
    pub prediction: StageCounters,
}

impl BatchStageProgress {
    pub fn get(&self, stage: Stage) -> &StageCounters {
        match stage {
            Stage::Classification => &self.classification,
            Stage::Supplier => &self.supplier,
            Stage::Address => &self.address,
            Stage::Merchant => &self.merchant,
            Stage::Prediction => &self.prediction,
        }
    }

    pub fn get_mut(&mut self, stage: Stage) -> &mut StageCounters {
        match stage {
            Stage::Classification => &mut self.classification,
            Stage::Supplier => &mut self.supplier,
            Stage::Address => &mut self.address,
            Stage::Merchant => &mut self.merchant,
            Stage::Prediction => &mut self.prediction,
        }
    }
}

/// Which enrichment stages were enabled for a batch at upload time.
///
/// Classification always runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnabledStages {
    pub supplier: bool,
    pub address: bool,
    pub merchant: bool,
    pub prediction: bool,
}

impl Default for EnabledStages {
    fn default() -> Self {
        Self {
            supplier: true,
            address: true,
            merchant: true,
            prediction: true,
        }
    }
}

impl EnabledStages {
    pub fn contains(&self, stage: Stage) -> bool {
        match stage {
            Stage::Classification => true,
            Stage::Supplier => self.supplier,
            Stage::Address => self.address,
            Stage::Merchant => self.merchant,
            Stage::Prediction => self.prediction,
        }
    }

    /// Enabled stages in reporting order, classification included.
    pub fn stages(&self) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|s| self.contains(*s))
            .collect()
    }

    /// Enabled enrichment stages only.
    pub fn enrichment_stages(&self) -> Vec<Stage> {
        Stage::ENRICHMENT
            .into_iter()
            .filter(|s| self.contains(*s))
            .collect()
    }
}

/// Which columns of the source file carry each address part.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressColumnMap {
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
}

/// A unit of bulk work tied to a single upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub original_name: String,
    pub stored_name: String,
    pub status: BatchStatus,
    pub total_records: u32,
    pub processed_records: u32,
    pub skipped_records: u32,
    pub stages: BatchStageProgress,
    pub enabled: EnabledStages,
    pub address_column_map: Option<AddressColumnMap>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Batch {
    pub fn new(original_name: String, stored_name: String, enabled: EnabledStages) -> Self {
        Self {
            id: BatchId::new(),
            original_name,
            stored_name,
            status: BatchStatus::Pending,
            total_records: 0,
            processed_records: 0,
            skipped_records: 0,
            stages: BatchStageProgress::default(),
            enabled,
            address_column_map: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

// ============================================================================
// Known suppliers
// ============================================================================

/// An entry in the curated supplier catalog.
///
/// Read-mostly; replication from upstream is an external job. The match
/// worker treats this as a queryable read model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownSupplier {
    pub supplier_id: String,
    pub name: String,
    pub normalized_name: String,
    pub category: Option<String>,
    pub mcc: Option<String>,
    pub industry: Option<String>,
    pub payment_type: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub confidence: f64,
    pub name_length: u32,
    pub has_business_indicator: bool,
    pub common_name_score: f64,
}

// ============================================================================
// Exclusion keywords
// ============================================================================

/// A keyword that short-circuits enrichment for matching payee names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExclusionKeyword {
    pub id: KeywordId,
    /// Stored casefolded; uniqueness is enforced after casefold.
    pub keyword: String,
    pub added_by: Option<String>,
    pub notes: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExclusionKeyword {
    pub fn new(keyword: &str, added_by: Option<String>, notes: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: KeywordId::new(),
            keyword: keyword.trim().to_lowercase(),
            added_by,
            notes,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update for an exclusion keyword.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeywordUpdate {
    pub keyword: Option<String>,
    pub notes: Option<String>,
    pub is_active: Option<bool>,
}

// ============================================================================
// Webhook events
// ============================================================================

/// One inbound notification from the card network.
///
/// `event_id` uniqueness dedupes replays; processing is idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event_id: EventId,
    pub event_type: String,
    pub bulk_request_id: SearchId,
    pub payload: serde_json::Value,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl WebhookEvent {
    pub fn new(
        event_id: EventId,
        event_type: String,
        bulk_request_id: SearchId,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id,
            event_type,
            bulk_request_id,
            payload,
            processed: false,
            processed_at: None,
            error_message: None,
            received_at: Utc::now(),
        }
    }
}

// ============================================================================
// Events emitted back to the orchestrator
// ============================================================================

/// Emitted whenever one record's stage reaches a terminal status.
///
/// The orchestrator is the only consumer; workers never dispatch work to
/// each other directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageEvent {
    pub batch_id: BatchId,
    pub record_id: RecordId,
    pub stage: Stage,
    pub status: StageStatus,
}

/// Correlation mapping persisted with every bulk merchant submission.
pub type SearchIdMapping = HashMap<String, RecordId>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id_format() {
        let id = BatchId::new();
        let s = id.to_short_string();
        assert!(s.starts_with("bat_"));
        assert_eq!(s.len(), 4 + 8);
    }

    #[test]
    fn test_payee_type_parsing() {
        assert_eq!("Business".parse::<PayeeType>().unwrap(), PayeeType::Business);
        assert_eq!(
            "Internal Transfer".parse::<PayeeType>().unwrap(),
            PayeeType::InternalTransfer
        );
        assert_eq!(
            "internal-transfer".parse::<PayeeType>().unwrap(),
            PayeeType::InternalTransfer
        );
        assert!("Partnership".parse::<PayeeType>().is_err());
    }

    #[test]
    fn test_stage_status_terminal() {
        assert!(!StageStatus::Pending.is_terminal());
        assert!(!StageStatus::InProgress.is_terminal());
        assert!(StageStatus::Completed.is_terminal());
        assert!(StageStatus::Failed.is_terminal());
        assert!(StageStatus::Skipped.is_terminal());
    }

    #[test]
    fn test_enabled_stages_subset() {
        let enabled = EnabledStages {
            supplier: false,
            address: true,
            merchant: true,
            prediction: false,
        };
        assert!(enabled.contains(Stage::Classification));
        assert!(!enabled.contains(Stage::Supplier));
        assert_eq!(
            enabled.enrichment_stages(),
            vec![Stage::Address, Stage::Merchant]
        );
    }

    #[test]
    fn test_review_status_threshold() {
        assert_eq!(
            ReviewStatus::from_confidence(0.95),
            ReviewStatus::AutoApproved
        );
        assert_eq!(
            ReviewStatus::from_confidence(0.5),
            ReviewStatus::NeedsReview
        );
    }

    #[test]
    fn test_empty_address_detection() {
        let mut record = Record::new(
            BatchId::new(),
            "Acme".to_string(),
            "acme".to_string(),
            serde_json::Map::new(),
        );
        assert!(record.has_empty_address());
        record.city = Some("  ".to_string());
        assert!(record.has_empty_address());
        record.address = Some("1 Main St".to_string());
        assert!(!record.has_empty_address());
    }
}
