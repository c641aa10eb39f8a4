use axum::Json;
use axum::body::Body;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Paths that change assistant state or speak for a user.
const PROTECTED_PREFIXES: &[&str] = &[
    "/api/v1/approvals",
    "/api/v1/agents",
    "/api/v1/message",
    "/api/v1/channels",
    "/ws/voice",
];

/// Whether the caller presented the configured control key. Routes read
/// this to decide if a sender id in the request can be believed.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlAccess {
    pub verified: bool,
}

impl ControlAccess {
    /// Only verified callers may speak for a named sender; everyone else
    /// acts as `fallback`, which never matches an admin id.
    pub fn sender(access: Option<Self>, claimed: Option<String>, fallback: &str) -> String {
        let verified = access.is_some_and(|a| a.verified);
        claimed
            .filter(|id| verified && !id.trim().is_empty())
            .map(|id| id.trim().to_string())
            .unwrap_or_else(|| fallback.to_string())
    }
}

/// Bearer key for the control endpoints. With no key configured the
/// endpoints are open, which is only sensible on a loopback bind.
#[derive(Debug, Clone, Default)]
pub struct ControlAuth {
    key: Option<String>,
}

impl ControlAuth {
    pub fn new(key: Option<String>) -> Self {
        let key = key
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());
        Self { key }
    }

    pub fn is_configured(&self) -> bool {
        self.key.is_some()
    }
}

fn parse_bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let mut parts = raw.trim().splitn(2, char::is_whitespace);
    let scheme = parts.next()?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = parts.next()?.trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

fn path_matches_prefix(path: &str, prefix: &str) -> bool {
    if path == prefix {
        return true;
    }
    let Some(suffix) = path.strip_prefix(prefix) else {
        return false;
    };
    suffix.starts_with('/')
}

fn is_protected(path: &str) -> bool {
    PROTECTED_PREFIXES
        .iter()
        .any(|prefix| path_matches_prefix(path, prefix))
}

/// Compares without short-circuiting on the first differing byte.
fn keys_match(provided: &str, expected: &str) -> bool {
    let (a, b) = (provided.as_bytes(), expected.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn unauthorized(code: &str, message: &str) -> Response {
    tracing::warn!(error_code = code, error = %message, "control auth rejected");
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "status": "error",
            "error": message,
            "error_code": code,
        })),
    )
        .into_response()
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn require_control_auth(mut req: Request<Body>, next: Next) -> Response {
    let auth = req
        .extensions()
        .get::<ControlAuth>()
        .cloned()
        .unwrap_or_default();
    let provided = parse_bearer_token(req.headers());
    let verified = match (auth.key.as_deref(), provided.as_deref()) {
        (Some(expected), Some(provided)) => keys_match(provided, expected),
        _ => false,
    };
    if auth.is_configured() && !verified && is_protected(req.uri().path()) {
        return match provided {
            None => unauthorized("missing_bearer_token", "missing bearer token"),
            Some(_) => unauthorized("invalid_bearer_token", "invalid bearer token"),
        };
    }
    req.extensions_mut().insert(ControlAccess { verified });
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::body::to_bytes;
    use axum::middleware;
    use axum::routing::{get, post};
    use axum::{Extension, Json};
    use tower::util::ServiceExt;

    fn build_auth_test_router(auth: ControlAuth) -> Router {
        Router::new()
            .route(
                "/api/v1/approvals/{id}/approve",
                post(|| async { Json(json!({ "status": "ok" })) }),
            )
            .route("/health", get(|| async { Json(json!({ "status": "ok" })) }))
            .layer(middleware::from_fn(require_control_auth))
            .layer(Extension(auth))
    }

    fn approve_request(authorization: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/v1/approvals/abcd1234/approve");
        if let Some(value) = authorization {
            builder = builder.header(AUTHORIZATION, value);
        }
        builder.body(Body::empty()).expect("request")
    }

    async fn response_body_json(response: Response) -> serde_json::Value {
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body");
        serde_json::from_slice(&body).expect("response json")
    }

    #[test]
    fn parse_bearer_token_accepts_case_insensitive_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            "bearer   token-value ".parse().expect("header value"),
        );
        assert_eq!(parse_bearer_token(&headers).as_deref(), Some("token-value"));

        headers.insert(AUTHORIZATION, "Basic abc".parse().expect("header value"));
        assert_eq!(parse_bearer_token(&headers), None);
    }

    #[test]
    fn protected_prefix_requires_segment_boundary() {
        assert!(is_protected("/api/v1/approvals"));
        assert!(is_protected("/api/v1/approvals/x/reject"));
        assert!(is_protected("/api/v1/agents/reload"));
        assert!(is_protected("/api/v1/message"));
        assert!(is_protected("/ws/voice"));
        assert!(is_protected("/api/v1/channels/whatsapp/inbound"));
        assert!(!is_protected("/api/v1/approvalsx"));
        assert!(!is_protected("/api/v1/skills"));
    }

    #[test]
    fn blank_key_means_unconfigured() {
        assert!(!ControlAuth::new(Some("   ".to_string())).is_configured());
        assert!(ControlAuth::new(Some("k".to_string())).is_configured());
        assert!(keys_match("secret", "secret"));
        assert!(!keys_match("secret", "secreT"));
        assert!(!keys_match("secret", "secret-longer"));
    }

    #[tokio::test]
    async fn open_when_no_key_is_configured() {
        let router = build_auth_test_router(ControlAuth::new(None));
        let response = router
            .oneshot(approve_request(None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn rejects_missing_and_wrong_tokens() {
        let auth = ControlAuth::new(Some("token-alpha".to_string()));

        let response = build_auth_test_router(auth.clone())
            .oneshot(approve_request(None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = response_body_json(response).await;
        assert_eq!(body["error_code"], "missing_bearer_token");

        let response = build_auth_test_router(auth.clone())
            .oneshot(approve_request(Some("Bearer token-beta")))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = response_body_json(response).await;
        assert_eq!(body["error_code"], "invalid_bearer_token");

        let response = build_auth_test_router(auth)
            .oneshot(approve_request(Some("Bearer token-alpha")))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn only_verified_callers_choose_their_sender() {
        let verified = Some(ControlAccess { verified: true });
        let anonymous = Some(ControlAccess { verified: false });
        assert_eq!(ControlAccess::sender(verified, Some(" 42 ".into()), "anon"), "42");
        assert_eq!(ControlAccess::sender(verified, Some("  ".into()), "anon"), "anon");
        assert_eq!(ControlAccess::sender(anonymous, Some("42".into()), "anon"), "anon");
        assert_eq!(ControlAccess::sender(None, Some("42".into()), "anon"), "anon");
    }

    #[tokio::test]
    async fn unprotected_paths_skip_auth() {
        let router = build_auth_test_router(ControlAuth::new(Some("token-alpha".to_string())));
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }
}
