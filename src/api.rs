//! Health endpoint.
//!
//! `GET /` and `GET /health` answer 200 with status JSON; everything else is
//! a 404. Runs from startup so orchestrators see the process come up before
//! the trading loop does.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde_json::{json, Value};
use tracing::info;

use crate::store::Store;

#[derive(Clone)]
pub struct HealthState {
    store: Store,
    started_at: Instant,
}

pub fn router(store: Store) -> Router {
    let state = Arc::new(HealthState {
        store,
        started_at: Instant::now(),
    });
    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .fallback(not_found)
        .with_state(state)
}

async fn health(State(state): State<Arc<HealthState>>) -> Json<Value> {
    let database = match state.store.probe().await {
        Ok(()) => "accessible".to_string(),
        Err(e) => format!("error: {e}"),
    };

    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "database": database,
        "uptime": format!("{:.1}s", state.started_at.elapsed().as_secs_f64()),
    }))
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "Not Found")
}

/// Bind and serve until the process exits.
pub async fn serve(store: Store, port: u16) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind health server on port {port}"))?;
    info!(port, "health server listening");
    axum::serve(listener, router(store))
        .await
        .context("health server exited")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 16)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_paths_answer_200_with_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("health.db")).unwrap();
        let app = router(store);

        for path in ["/", "/health"] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let json = body_json(response).await;
            assert_eq!(json["status"], "healthy");
            assert_eq!(json["database"], "accessible");
            assert!(json["timestamp"].is_string());
            assert!(json["uptime"].is_string());
        }
    }

    #[tokio::test]
    async fn unknown_paths_are_404() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("health.db")).unwrap();
        let app = router(store);

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
