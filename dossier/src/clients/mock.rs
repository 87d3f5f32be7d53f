//! Mock collaborator clients for tests.
//!
//! Responses are queued FIFO per operation; calls are recorded so tests
//! can assert on what was sent. A mock with an empty queue falls back to
//! its configured default, or errors.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    AddressInput, AddressValidator, BulkSearchResults, CardNetwork, Classifier, ClassifierOutput,
    ClientError, MerchantSearchRow, Predictor, PredictorOutput,
};
use crate::types::{SearchId, ValidatedAddress};

fn no_response(what: &str) -> ClientError {
    ClientError::Status {
        status: 0,
        body: format!("no mock response configured for {what}"),
    }
}

// ============================================================================
// Classifier
// ============================================================================

#[derive(Clone, Default)]
pub struct MockClassifier {
    responses: Arc<Mutex<Vec<Result<ClassifierOutput, ClientError>>>>,
    default: Arc<Mutex<Option<ClassifierOutput>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a one-shot response (FIFO).
    pub fn push_response(&self, response: Result<ClassifierOutput, ClientError>) {
        self.responses.lock().push(response);
    }

    /// Response returned whenever the queue is empty.
    pub fn set_default(&self, output: ClassifierOutput) {
        *self.default.lock() = Some(output);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Classifier for MockClassifier {
    async fn classify(&self, cleaned_name: &str) -> Result<ClassifierOutput, ClientError> {
        self.calls.lock().push(cleaned_name.to_string());
        let mut queue = self.responses.lock();
        if !queue.is_empty() {
            return queue.remove(0);
        }
        self.default
            .lock()
            .clone()
            .ok_or_else(|| no_response("classify"))
    }
}

// ============================================================================
// Address validator
// ============================================================================

#[derive(Clone, Default)]
pub struct MockAddressValidator {
    responses: Arc<Mutex<Vec<Result<ValidatedAddress, ClientError>>>>,
    default: Arc<Mutex<Option<ValidatedAddress>>>,
    calls: Arc<Mutex<Vec<AddressInput>>>,
}

impl MockAddressValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, response: Result<ValidatedAddress, ClientError>) {
        self.responses.lock().push(response);
    }

    pub fn set_default(&self, validated: ValidatedAddress) {
        *self.default.lock() = Some(validated);
    }

    pub fn calls(&self) -> Vec<AddressInput> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl AddressValidator for MockAddressValidator {
    async fn validate(&self, input: &AddressInput) -> Result<ValidatedAddress, ClientError> {
        self.calls.lock().push(input.clone());
        let mut queue = self.responses.lock();
        if !queue.is_empty() {
            return queue.remove(0);
        }
        self.default
            .lock()
            .clone()
            .ok_or_else(|| no_response("validate"))
    }
}

// ============================================================================
// Card network
// ============================================================================

/// Record of one bulk submission made against the mock.
#[derive(Debug, Clone)]
pub struct MockSubmission {
    pub lookup_type: String,
    pub searches: Vec<MerchantSearchRow>,
    pub issued_id: Option<SearchId>,
}

#[derive(Clone, Default)]
pub struct MockCardNetwork {
    submit_responses: Arc<Mutex<Vec<Result<SearchId, ClientError>>>>,
    results: Arc<Mutex<HashMap<SearchId, Vec<Result<BulkSearchResults, ClientError>>>>>,
    submissions: Arc<Mutex<Vec<MockSubmission>>>,
    result_calls: Arc<Mutex<Vec<SearchId>>>,
}

impl MockCardNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the id (or error) returned by the next submission.
    pub fn push_submit_response(&self, response: Result<SearchId, ClientError>) {
        self.submit_responses.lock().push(response);
    }

    /// Queue a poll result for a search id (FIFO).
    pub fn push_results(&self, search_id: SearchId, response: Result<BulkSearchResults, ClientError>) {
        self.results.lock().entry(search_id).or_default().push(response);
    }

    pub fn submissions(&self) -> Vec<MockSubmission> {
        self.submissions.lock().clone()
    }

    pub fn result_calls(&self) -> Vec<SearchId> {
        self.result_calls.lock().clone()
    }
}

#[async_trait]
impl CardNetwork for MockCardNetwork {
    async fn submit_bulk(
        &self,
        lookup_type: &str,
        searches: &[MerchantSearchRow],
    ) -> Result<SearchId, ClientError> {
        let mut queue = self.submit_responses.lock();
        let response = if queue.is_empty() {
            Err(no_response("submit_bulk"))
        } else {
            queue.remove(0)
        };
        self.submissions.lock().push(MockSubmission {
            lookup_type: lookup_type.to_string(),
            searches: searches.to_vec(),
            issued_id: response.as_ref().ok().cloned(),
        });
        response
    }

    async fn get_search_results(
        &self,
        search_id: &SearchId,
    ) -> Result<BulkSearchResults, ClientError> {
        self.result_calls.lock().push(search_id.clone());
        let mut results = self.results.lock();
        if let Some(queue) = results.get_mut(search_id) {
            if !queue.is_empty() {
                return queue.remove(0);
            }
        }
        Err(no_response("get_search_results"))
    }
}

// ============================================================================
// Predictor
// ============================================================================

#[derive(Clone, Default)]
pub struct MockPredictor {
    responses: Arc<Mutex<Vec<Result<PredictorOutput, ClientError>>>>,
    default: Arc<Mutex<Option<PredictorOutput>>>,
    calls: Arc<Mutex<Vec<(String, serde_json::Value)>>>,
}

impl MockPredictor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, response: Result<PredictorOutput, ClientError>) {
        self.responses.lock().push(response);
    }

    pub fn set_default(&self, output: PredictorOutput) {
        *self.default.lock() = Some(output);
    }

    pub fn calls(&self) -> Vec<(String, serde_json::Value)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Predictor for MockPredictor {
    async fn predict(
        &self,
        model_id: &str,
        payee_data: &serde_json::Value,
    ) -> Result<PredictorOutput, ClientError> {
        self.calls
            .lock()
            .push((model_id.to_string(), payee_data.clone()));
        let mut queue = self.responses.lock();
        if !queue.is_empty() {
            return queue.remove(0);
        }
        self.default
            .lock()
            .clone()
            .ok_or_else(|| no_response("predict"))
    }
}
