//! Webhook endpoint handlers.
//!
//! These handlers are deliberately thin: verify, hand the events to the
//! correlator channel, return immediately. Delivery always gets a prompt
//! 200, since slow processing here would trigger platform redelivery storms.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::correlate::WebhookPayload;
use crate::model::ReplyEvent;
use crate::web::signature::{is_signature_verification_enabled, verify_payload_signature};

/// Shared webhook server state.
#[derive(Clone)]
pub struct AppState {
    pub verify_token: Option<String>,
    pub app_secret: Option<String>,
    pub replies: mpsc::Sender<ReplyEvent>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook", get(verify_webhook).post(receive_webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// Health check
// =============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// =============================================================================
// GET verification handshake
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct VerifyParams {
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub challenge: Option<String>,
    #[serde(default)]
    pub verify_token: Option<String>,
}

/// Subscription verification: echo the challenge as plain text when the
/// pre-shared token matches, reject otherwise.
pub async fn verify_webhook(
    State(state): State<AppState>,
    Query(params): Query<VerifyParams>,
) -> impl IntoResponse {
    let expected = match &state.verify_token {
        Some(token) if !token.is_empty() => token,
        _ => {
            warn!("webhook_verify_token_not_configured");
            return (StatusCode::FORBIDDEN, "verification disabled".to_string());
        }
    };

    let mode_ok = params.mode.as_deref() == Some("subscribe");
    let token_ok = params.verify_token.as_deref() == Some(expected.as_str());

    match (mode_ok, token_ok, params.challenge) {
        (true, true, Some(challenge)) => {
            info!("webhook_verified");
            (StatusCode::OK, challenge)
        }
        _ => {
            warn!(mode_ok = mode_ok, token_ok = token_ok, "webhook_verify_rejected");
            (StatusCode::FORBIDDEN, "verification failed".to_string())
        }
    }
}

// =============================================================================
// POST event delivery
// =============================================================================

#[derive(Serialize)]
pub struct DeliveryResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<usize>,
}

/// Event delivery. Signature-checked when an app secret is configured,
/// then enqueued for the correlator and acknowledged immediately.
pub async fn receive_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if is_signature_verification_enabled(&state.app_secret) {
        let secret = state.app_secret.as_deref().unwrap_or_default();
        let header = headers
            .get("X-Hub-Signature-256")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !verify_payload_signature(secret, header, &body) {
            warn!(body_length = body.len(), "webhook_signature_invalid");
            return (
                StatusCode::UNAUTHORIZED,
                Json(DeliveryResponse {
                    status: "unauthorized",
                    events: None,
                }),
            );
        }
    }

    // Malformed bodies are acknowledged too; erroring would only provoke
    // redelivery of the same junk.
    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            warn!(
                error = %e,
                body_length = body.len(),
                "webhook_payload_unparseable"
            );
            return (
                StatusCode::OK,
                Json(DeliveryResponse {
                    status: "ignored",
                    events: None,
                }),
            );
        }
    };

    let events = payload.into_events();
    let count = events.len();
    for event in events {
        // Never block the handler on the correlator.
        match state.replies.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(ev)) => {
                warn!(sender = %ev.sender, "reply_channel_full_event_dropped");
            }
            Err(mpsc::error::TrySendError::Closed(ev)) => {
                warn!(sender = %ev.sender, "reply_channel_closed_event_dropped");
            }
        }
    }

    info!(events = count, "webhook_delivery_enqueued");
    (
        StatusCode::OK,
        Json(DeliveryResponse {
            status: "received",
            events: Some(count),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::Response;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    fn state(
        verify_token: Option<&str>,
        app_secret: Option<&str>,
    ) -> (AppState, mpsc::Receiver<ReplyEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (
            AppState {
                verify_token: verify_token.map(String::from),
                app_secret: app_secret.map(String::from),
                replies: tx,
            },
            rx,
        )
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn delivery_payload() -> Vec<u8> {
        serde_json::json!({
            "object": "instagram",
            "entry": [{
                "id": "17841400000000001",
                "time": 1700000000,
                "messaging": [{
                    "sender": {"id": "998877"},
                    "recipient": {"id": "17841400000000001"},
                    "timestamp": 1700000001,
                    "message": {"mid": "m1", "text": "hey"}
                }]
            }]
        })
        .to_string()
        .into_bytes()
    }

    #[tokio::test]
    async fn test_verification_echoes_challenge() {
        let (state, _rx) = state(Some("tok-123"), None);
        let response = verify_webhook(
            State(state),
            Query(VerifyParams {
                mode: Some("subscribe".into()),
                challenge: Some("abc123".into()),
                verify_token: Some("tok-123".into()),
            }),
        )
        .await
        .into_response();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "abc123");
    }

    #[tokio::test]
    async fn test_verification_rejects_bad_token() {
        let (state, _rx) = state(Some("tok-123"), None);
        let response = verify_webhook(
            State(state),
            Query(VerifyParams {
                mode: Some("subscribe".into()),
                challenge: Some("abc123".into()),
                verify_token: Some("wrong".into()),
            }),
        )
        .await
        .into_response();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_verification_rejects_when_unconfigured() {
        let (state, _rx) = state(None, None);
        let response = verify_webhook(
            State(state),
            Query(VerifyParams {
                mode: Some("subscribe".into()),
                challenge: Some("abc123".into()),
                verify_token: Some("anything".into()),
            }),
        )
        .await
        .into_response();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_delivery_enqueues_events() {
        let (state, mut rx) = state(None, None);
        let response = receive_webhook(
            State(state),
            HeaderMap::new(),
            Bytes::from(delivery_payload()),
        )
        .await
        .into_response();

        assert_eq!(response.status(), StatusCode::OK);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.sender, "998877");
        assert_eq!(event.text, "hey");
    }

    #[tokio::test]
    async fn test_delivery_verifies_signature_when_configured() {
        let (state, mut rx) = state(None, Some("app-secret"));
        let body = delivery_payload();

        // Missing signature: rejected.
        let response = receive_webhook(
            State(state.clone()),
            HeaderMap::new(),
            Bytes::from(body.clone()),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // Correct signature: accepted.
        let mut mac = Hmac::<Sha256>::new_from_slice(b"app-secret").unwrap();
        mac.update(&body);
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-Hub-Signature-256",
            format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
                .parse()
                .unwrap(),
        );
        let response = receive_webhook(State(state), headers, Bytes::from(body))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_malformed_delivery_still_acknowledged() {
        let (state, mut rx) = state(None, None);
        let response = receive_webhook(
            State(state),
            HeaderMap::new(),
            Bytes::from_static(b"not json at all"),
        )
        .await
        .into_response();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(rx.try_recv().is_err());
    }
}
