//! Reqwest-backed collaborator clients.
//!
//! Thin wrappers: build the request, map non-success statuses through the
//! shared error taxonomy, decode the body. Retries and rate limiting live
//! in the workers, not here.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{
    AddressInput, AddressValidator, BulkSearchResults, CardNetwork, Classifier, ClassifierOutput,
    ClientError, MerchantSearchRow, Predictor, PredictorOutput,
};
use crate::types::{SearchId, ValidatedAddress};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

fn build_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

async fn read_error(response: reqwest::Response) -> ClientError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    ClientError::from_status(status, body)
}

// ============================================================================
// Classifier
// ============================================================================

/// HTTP classifier client.
pub struct HttpClassifier {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpClassifier {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: build_client(DEFAULT_TIMEOUT),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    #[tracing::instrument(skip(self), fields(model = %self.model))]
    async fn classify(&self, cleaned_name: &str) -> Result<ClassifierOutput, ClientError> {
        let response = self
            .client
            .post(format!("{}/v1/classify", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "name": cleaned_name,
                "model": self.model,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(read_error(response).await);
        }
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}

// ============================================================================
// Address validator
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddressResponse {
    formatted_address: String,
    #[serde(default)]
    components: serde_json::Value,
    lat: Option<f64>,
    lon: Option<f64>,
    confidence: f64,
    place_id: Option<String>,
}

/// HTTP address validation client.
pub struct HttpAddressValidator {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpAddressValidator {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: build_client(DEFAULT_TIMEOUT),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl AddressValidator for HttpAddressValidator {
    #[tracing::instrument(skip_all)]
    async fn validate(&self, input: &AddressInput) -> Result<ValidatedAddress, ClientError> {
        let response = self
            .client
            .post(format!("{}/v1/addresses:validate", self.base_url))
            .query(&[("key", self.api_key.as_str())])
            .json(input)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(read_error(response).await);
        }
        let body = response.text().await?;
        let parsed: AddressResponse = serde_json::from_str(&body)?;
        Ok(ValidatedAddress {
            formatted_address: parsed.formatted_address,
            components: parsed.components,
            latitude: parsed.lat,
            longitude: parsed.lon,
            confidence: parsed.confidence.clamp(0.0, 1.0),
            place_id: parsed.place_id,
        })
    }
}

// ============================================================================
// Card network
// ============================================================================

/// Which card-network environment to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardNetworkEnv {
    Sandbox,
    Production,
}

impl CardNetworkEnv {
    pub fn base_url(&self) -> &'static str {
        match self {
            CardNetworkEnv::Sandbox => "https://sandbox.api.mastercard.com/track/search",
            CardNetworkEnv::Production => "https://api.mastercard.com/track/search",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    bulk_search_id: String,
}

/// HTTP card-network client for asynchronous bulk merchant searches.
pub struct HttpCardNetwork {
    client: reqwest::Client,
    base_url: String,
    consumer_key: String,
}

impl HttpCardNetwork {
    pub fn new(env: CardNetworkEnv, consumer_key: impl Into<String>) -> Self {
        Self::with_base_url(env.base_url(), consumer_key)
    }

    /// Point the client at an arbitrary base URL (tests, proxies).
    pub fn with_base_url(base_url: impl Into<String>, consumer_key: impl Into<String>) -> Self {
        Self {
            // Result latency is webhook/poll driven; the submission and
            // status calls themselves are quick.
            client: build_client(DEFAULT_TIMEOUT),
            base_url: base_url.into(),
            consumer_key: consumer_key.into(),
        }
    }
}

#[async_trait]
impl CardNetwork for HttpCardNetwork {
    #[tracing::instrument(skip(self, searches), fields(count = searches.len()))]
    async fn submit_bulk(
        &self,
        lookup_type: &str,
        searches: &[MerchantSearchRow],
    ) -> Result<SearchId, ClientError> {
        let response = self
            .client
            .post(format!("{}/bulk-searches", self.base_url))
            .bearer_auth(&self.consumer_key)
            .json(&serde_json::json!({
                "lookupType": lookup_type,
                "searches": searches,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(read_error(response).await);
        }
        let body = response.text().await?;
        let parsed: SubmitResponse = serde_json::from_str(&body)?;
        Ok(SearchId(parsed.bulk_search_id))
    }

    #[tracing::instrument(skip(self), fields(search_id = %search_id))]
    async fn get_search_results(
        &self,
        search_id: &SearchId,
    ) -> Result<BulkSearchResults, ClientError> {
        let response = self
            .client
            .get(format!(
                "{}/bulk-searches/{}/results",
                self.base_url, search_id.0
            ))
            .bearer_auth(&self.consumer_key)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(read_error(response).await);
        }
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}

// ============================================================================
// Predictor
// ============================================================================

/// HTTP payment-prediction client.
pub struct HttpPredictor {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpPredictor {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: build_client(DEFAULT_TIMEOUT),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl Predictor for HttpPredictor {
    #[tracing::instrument(skip(self, payee_data))]
    async fn predict(
        &self,
        model_id: &str,
        payee_data: &serde_json::Value,
    ) -> Result<PredictorOutput, ClientError> {
        let response = self
            .client
            .post(format!("{}/v1/models/{}/predict", self.base_url, model_id))
            .bearer_auth(&self.api_key)
            .json(payee_data)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(read_error(response).await);
        }
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_classifier_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/classify"))
            .and(header("Authorization", "Bearer key-123"))
            .and(body_partial_json(serde_json::json!({"name": "acme widgets"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "payee_type": "Business",
                "confidence": 0.92,
                "sic_code": "5045",
                "sic_description": "Computers",
                "reasoning": "corporate name shape"
            })))
            .mount(&server)
            .await;

        let client = HttpClassifier::new(server.uri(), "key-123", "payee-v2");
        let output = client.classify("acme widgets").await.unwrap();
        assert_eq!(output.payee_type, "Business");
        assert!((output.confidence - 0.92).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_classifier_auth_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/classify"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let client = HttpClassifier::new(server.uri(), "wrong", "payee-v2");
        let err = client.classify("acme").await.unwrap_err();
        assert!(err.is_auth());
    }

    #[tokio::test]
    async fn test_card_network_submit_and_results() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bulk-searches"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "bulkSearchId": "bulk-abc"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/bulk-searches/bulk-abc/results"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "COMPLETED",
                "items": [{
                    "searchRequestId": "row-1",
                    "confidence": 0.88,
                    "businessName": "ACME WIDGETS LLC",
                    "merchantIds": ["m-1"]
                }]
            })))
            .mount(&server)
            .await;

        let client = HttpCardNetwork::with_base_url(server.uri(), "consumer-key");
        let rows = vec![MerchantSearchRow {
            search_request_id: "row-1".to_string(),
            business_name: "acme widgets".to_string(),
            address: None,
            city: None,
            state: None,
            postal_code: None,
        }];
        let search_id = client.submit_bulk("SUPPLIERS", &rows).await.unwrap();
        assert_eq!(search_id, SearchId::from("bulk-abc"));

        let results = client.get_search_results(&search_id).await.unwrap();
        assert_eq!(results.status, crate::clients::BulkSearchStatus::Completed);
        assert_eq!(results.items.len(), 1);
        assert_eq!(results.items[0].search_request_id, "row-1");
    }

    #[tokio::test]
    async fn test_card_network_poll_unknown_id_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such search"))
            .mount(&server)
            .await;

        let client = HttpCardNetwork::with_base_url(server.uri(), "consumer-key");
        let err = client
            .get_search_results(&SearchId::from("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_address_validator_maps_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/addresses:validate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "formattedAddress": "1 Main St, Springfield, IL 62701, USA",
                "components": {"locality": "Springfield"},
                "lat": 39.78,
                "lon": -89.65,
                "confidence": 0.99,
                "placeId": "place-1"
            })))
            .mount(&server)
            .await;

        let client = HttpAddressValidator::new(server.uri(), "maps-key");
        let validated = client
            .validate(&AddressInput {
                address: Some("1 Main St".to_string()),
                city: Some("Springfield".to_string()),
                state: Some("IL".to_string()),
                postal_code: None,
            })
            .await
            .unwrap();
        assert_eq!(validated.place_id.as_deref(), Some("place-1"));
        assert_eq!(validated.latitude, Some(39.78));
    }
}
