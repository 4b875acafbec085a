//! Webhook endpoint for the git hosting service.

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{info, warn};

use crate::AppState;
use crate::admission::WebhookEvent;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/webhook", post(github_webhook))
}

/// Handle GitHub webhook events.
async fn github_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let event_type = headers
        .get("X-GitHub-Event")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("missing X-GitHub-Event header".to_string()))?;

    if let Some(secret) = &state.webhook_secret {
        let signature = headers
            .get("X-Hub-Signature-256")
            .and_then(|v| v.to_str().ok());
        if !verify_github_signature(secret, &body, signature) {
            warn!(event = %event_type, "invalid webhook signature");
            return Err(ApiError::Unauthorized("invalid signature".to_string()));
        }
    }

    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid JSON: {}", e)))?;
    let event = WebhookEvent::parse(event_type, &payload)?;

    info!(
        event = %event_type,
        delivery = ?headers.get("X-GitHub-Delivery").and_then(|v| v.to_str().ok()),
        "received webhook"
    );
    state.admission.handle(event).await?;

    Ok(StatusCode::OK)
}

/// Verify GitHub webhook signature.
fn verify_github_signature(secret: &str, body: &[u8], signature: Option<&str>) -> bool {
    let Some(signature) = signature else {
        return false;
    };

    // Signature format: "sha256=<hex>"
    let Some(sig_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };

    let Ok(sig_bytes) = hex::decode(sig_hex) else {
        return false;
    };

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);

    mac.verify_slice(&sig_bytes).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::router;
    use crate::testing::{harness, seed};
    use axum::body::Body;
    use axum::http::Request;
    use gantry_core::TriggerSource;
    use serde_json::json;
    use tower::ServiceExt;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn push_payload() -> String {
        json!({
            "ref": "refs/heads/master",
            "after": "c0ffee",
            "repository": {
                "name": "ops",
                "full_name": "f110/ops",
                "owner": {"name": "f110"},
                "html_url": "https://github.com/f110/ops",
                "clone_url": "https://github.com/f110/ops.git",
                "master_branch": "master"
            },
            "head_commit": {"message": "Bump"},
            "commits": [{"added": [], "modified": ["BUILD.bazel"], "removed": []}]
        })
        .to_string()
    }

    fn webhook(event: &str, body: &str, signature: Option<&str>) -> Request<Body> {
        let mut request = Request::builder()
            .method("POST")
            .uri("/webhook")
            .header("X-GitHub-Event", event)
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            request = request.header("X-Hub-Signature-256", signature);
        }
        request.body(Body::from(body.to_string())).unwrap()
    }

    #[test]
    fn test_verify_signature() {
        let body = b"{\"zen\":\"Design for failure.\"}";
        let signature = sign("s3cret", body);

        assert!(verify_github_signature("s3cret", body, Some(&signature)));
        assert!(!verify_github_signature("other", body, Some(&signature)));
        assert!(!verify_github_signature("s3cret", body, None));
        assert!(!verify_github_signature("s3cret", body, Some("sha1=abc")));
        assert!(!verify_github_signature("s3cret", body, Some("sha256=zz")));
    }

    #[tokio::test]
    async fn test_push_triggers_discovery_and_builds() {
        let h = harness(true);
        let (repository, _) = seed(&h.db).await;

        let response = router(h.state.clone())
            .oneshot(webhook("push", &push_payload(), None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(h.discoverer.runs(), vec![(repository.id, String::new())]);
        let builds = h.builder.builds();
        assert_eq!(builds.len(), 2);
        assert!(builds.iter().all(|(_, _, via)| *via == TriggerSource::Push));
    }

    #[tokio::test]
    async fn test_signature_is_enforced_when_configured() {
        let h = harness(true);
        seed(&h.db).await;
        let app = router(h.state.clone().with_webhook_secret(Some("s3cret".to_string())));
        let body = push_payload();

        let forged = app
            .clone()
            .oneshot(webhook("push", &body, Some(&sign("guess", body.as_bytes()))))
            .await
            .unwrap();
        assert_eq!(forged.status(), StatusCode::UNAUTHORIZED);
        assert!(h.builder.builds().is_empty());

        let signed = app
            .oneshot(webhook("push", &body, Some(&sign("s3cret", body.as_bytes()))))
            .await
            .unwrap();
        assert_eq!(signed.status(), StatusCode::OK);
        assert_eq!(h.builder.builds().len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_payloads() {
        let h = harness(true);
        let app = router(h.state.clone());

        let not_json = app.clone().oneshot(webhook("push", "{", None)).await.unwrap();
        assert_eq!(not_json.status(), StatusCode::BAD_REQUEST);

        let incomplete = app
            .clone()
            .oneshot(webhook("pull_request", r#"{"action":"opened"}"#, None))
            .await
            .unwrap();
        assert_eq!(incomplete.status(), StatusCode::BAD_REQUEST);

        let unknown = app.oneshot(webhook("release", "{}", None)).await.unwrap();
        assert_eq!(unknown.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_untrusted_pull_request_is_commented() {
        let h = harness(true);
        seed(&h.db).await;
        let payload = json!({
            "action": "opened",
            "number": 28,
            "pull_request": {"number": 28, "title": "Fix typo", "head": {"sha": "feed"}},
            "repository": {
                "name": "ops",
                "full_name": "f110/ops",
                "owner": {"login": "f110"},
                "html_url": "https://github.com/f110/ops",
                "default_branch": "master"
            },
            "sender": {"id": 200, "login": "stranger"}
        })
        .to_string();

        let response = router(h.state.clone())
            .oneshot(webhook("pull_request", &payload, None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(h.builder.builds().is_empty());
        assert_eq!(h.github.comments().len(), 1);
    }
}
