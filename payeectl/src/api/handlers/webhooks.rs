//! Merchant search webhook receiver.
//!
//! Authenticates each delivery with an HMAC-SHA256 of the raw body,
//! deduplicates by event id, and offloads result processing to a
//! background task so the handler acknowledges well inside the
//! collaborator's 5 second SLA. Duplicate deliveries are acknowledged
//! without reprocessing.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use dossier::{EventId, SearchId, WebhookEvent};

use crate::api::AppState;
use crate::errors::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex HMAC-SHA256 of the raw body.
pub const SIGNATURE_HEADER: &str = "x-mastercard-signature";

/// Verify a hex HMAC-SHA256 signature over the raw body.
///
/// Comparison goes through `Mac::verify_slice`, which is constant-time.
pub fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    match hex::decode(signature_hex.trim()) {
        Ok(signature) => mac.verify_slice(&signature).is_ok(),
        Err(_) => false,
    }
}

/// Sign a body the way the collaborator does; used by tests.
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationBody {
    event_id: String,
    event_type: String,
    #[serde(default)]
    #[allow(dead_code)]
    event_created_date: Option<String>,
    data: NotificationData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationData {
    bulk_request_id: String,
    #[serde(default)]
    #[allow(dead_code)]
    errors: Option<serde_json::Value>,
}

/// `POST /webhooks/merchant/search-notifications`
#[tracing::instrument(skip_all)]
pub async fn receive_notification(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode> {
    let secret = state.webhook_secret.as_deref().ok_or_else(|| Error::Unauthorized {
        message: "webhook secret not configured".to_string(),
    })?;
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::Unauthorized {
            message: "missing signature header".to_string(),
        })?;
    if !verify_signature(secret, &body, signature) {
        return Err(Error::Unauthorized {
            message: "signature mismatch".to_string(),
        });
    }

    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| Error::bad_request(format!("invalid webhook body: {e}")))?;
    let notification: NotificationBody = serde_json::from_value(payload.clone())
        .map_err(|e| Error::bad_request(format!("invalid webhook body: {e}")))?;

    let event = WebhookEvent::new(
        EventId(notification.event_id),
        notification.event_type,
        SearchId(notification.data.bulk_request_id),
        payload,
    );

    let inserted = state.store.insert_webhook_event(&event).await?;
    if !inserted {
        tracing::debug!(event_id = %event.event_id, "Duplicate webhook delivery acknowledged");
        return Ok(StatusCode::NO_CONTENT);
    }

    tracing::info!(
        event_id = %event.event_id,
        event_type = %event.event_type,
        bulk_request_id = %event.bulk_request_id,
        "Webhook event accepted"
    );

    // Result processing happens off the request path; the handler only
    // acks receipt.
    let tracker = state.tracker.clone();
    tokio::spawn(async move {
        tracker.handle_event(event).await;
    });

    Ok(StatusCode::NO_CONTENT)
}

/// `GET /webhooks/merchant/health`
pub async fn webhook_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "webhookEnabled": true,
        "secretConfigured": state.webhook_secret.is_some(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_round_trip() {
        let secret = "whsec-test";
        let body = br#"{"eventId":"evt-1"}"#;
        let signature = sign_body(secret, body);
        assert!(verify_signature(secret, body, &signature));
    }

    #[test]
    fn test_signature_rejects_tampered_body() {
        let secret = "whsec-test";
        let signature = sign_body(secret, br#"{"eventId":"evt-1"}"#);
        assert!(!verify_signature(secret, br#"{"eventId":"evt-2"}"#, &signature));
    }

    #[test]
    fn test_signature_rejects_wrong_secret() {
        let body = br#"{"eventId":"evt-1"}"#;
        let signature = sign_body("secret-a", body);
        assert!(!verify_signature("secret-b", body, &signature));
    }

    #[test]
    fn test_signature_rejects_garbage_hex() {
        assert!(!verify_signature("secret", b"{}", "not-hex!"));
    }

    #[test]
    fn test_signature_deterministic() {
        let body = br#"{"test": 2432232314}"#;
        let sig1 = sign_body("fixed-secret", body);
        let sig2 = sign_body("fixed-secret", body);
        assert_eq!(sig1, sig2);
        assert_eq!(sig1.len(), 64); // hex sha256
    }
}
