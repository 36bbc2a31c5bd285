// ABOUTME: Bearer-token authentication middleware for the /v1 surface
// ABOUTME: Constant-time digest comparison; /v1/health stays open for probes

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

/// Paths that don't require authentication.
const WHITELISTED_PATHS: &[&str] = &["/v1/health"];

#[derive(Clone)]
pub struct AuthState {
    require_auth: bool,
    token_digest: [u8; 32],
}

impl AuthState {
    pub fn new(require_auth: bool, token: &str) -> Self {
        Self {
            require_auth,
            token_digest: digest(token),
        }
    }
}

fn digest(token: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().into()
}

fn requires_authentication(path: &str) -> bool {
    !WHITELISTED_PATHS.iter().any(|&open| path == open)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "unauthorized" })),
    )
        .into_response()
}

/// Bearer-token validation middleware.
pub async fn bearer_auth_middleware(
    State(auth): State<AuthState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path();
    if !auth.require_auth || !requires_authentication(path) {
        return next.run(request).await;
    }

    let token = request
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    let Some(token) = token else {
        warn!(path = %path, "missing bearer token");
        return unauthorized();
    };

    let presented = digest(token);
    if presented.ct_eq(&auth.token_digest).into() {
        debug!(path = %path, "bearer token accepted");
        next.run(request).await
    } else {
        warn!(path = %path, "invalid bearer token");
        unauthorized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, middleware, routing::get, Router};
    use tower::ServiceExt;

    async fn test_handler() -> &'static str {
        "ok"
    }

    fn test_app(auth: AuthState) -> Router {
        Router::new()
            .route("/v1/health", get(test_handler))
            .route("/v1/runs", get(test_handler))
            .layer(middleware::from_fn_with_state(auth, bearer_auth_middleware))
    }

    fn request(uri: &str, token: Option<&str>) -> axum::http::Request<Body> {
        let mut builder = axum::http::Request::builder().uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_bypasses_auth() {
        let app = test_app(AuthState::new(true, "secret"));
        let response = app.oneshot(request("/v1/health", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_token_is_rejected() {
        let app = test_app(AuthState::new(true, "secret"));
        let response = app.oneshot(request("/v1/runs", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_token_is_rejected() {
        let app = test_app(AuthState::new(true, "secret"));
        let response = app
            .oneshot(request("/v1/runs", Some("not-the-secret")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn valid_token_is_accepted() {
        let app = test_app(AuthState::new(true, "secret"));
        let response = app
            .oneshot(request("/v1/runs", Some("secret")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn disabled_auth_lets_everything_through() {
        let app = test_app(AuthState::new(false, "secret"));
        let response = app.oneshot(request("/v1/runs", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
