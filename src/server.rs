//! Admin HTTP surface.
//!
//! A thin adaptor over the dedup engine: batch dedup for external callers
//! plus a health probe. Everything else in the process runs on timers.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::dedup::RollingDedup;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub dedup: Arc<RollingDedup>,
}

/// Create the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/dedup", post(dedup_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Start the admin server. A bind failure is the one error that takes the
/// process down.
pub async fn run_server(state: AppState, port: u16) -> anyhow::Result<()> {
    let app = create_router(state);
    let addr = format!("0.0.0.0:{port}");
    tracing::info!("admin surface listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Batch dedup: returns the subset of the posted keys not seen in the
/// rolling window, in input order.
async fn dedup_handler(
    State(state): State<AppState>,
    body: Result<Json<Vec<String>>, JsonRejection>,
) -> impl IntoResponse {
    let Ok(Json(keys)) = body else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid json"})),
        )
            .into_response();
    };

    if keys.is_empty() {
        return Json(Vec::<String>::new()).into_response();
    }
    Json(state.dedup.dedup(&keys)).into_response()
}

/// Health check endpoint.
async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_router() -> (Router, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let dedup = Arc::new(RollingDedup::new(
            10_000,
            0.001,
            dir.path().join("state.bin"),
        ));
        (create_router(AppState { dedup }), dir)
    }

    async fn post_dedup(router: &Router, body: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method("POST")
            .uri("/dedup")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_dedup_basic_batch() {
        let (router, _dir) = test_router();

        let (status, body) = post_dedup(&router, r#"["a","b","a","c","b"]"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!(["a", "b", "c"]));

        // Everything is now seen; an identical call returns nothing.
        let (status, body) = post_dedup(&router, r#"["a","b","a","c","b"]"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn test_dedup_mixed_new_and_seen() {
        let (router, _dir) = test_router();

        post_dedup(&router, r#"["str_a","str_b"]"#).await;
        let (_, body) = post_dedup(&router, r#"["str_a","str_c"]"#).await;
        assert_eq!(body, json!(["str_c"]));
    }

    #[tokio::test]
    async fn test_dedup_empty_input() {
        let (router, _dir) = test_router();
        let (status, body) = post_dedup(&router, "[]").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn test_dedup_malformed_json() {
        let (router, _dir) = test_router();
        let (status, body) = post_dedup(&router, "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"error": "invalid json"}));
    }

    #[tokio::test]
    async fn test_health() {
        let (router, _dir) = test_router();
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body, json!({"status": "ok"}));
    }
}
