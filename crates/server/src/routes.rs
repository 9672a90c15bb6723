//! Health and readiness endpoints.

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use proofbot_core::AppContext;
use proofbot_queue::QueueStatsSnapshot;
use serde::Serialize;
use tower_http::trace::TraceLayer;

#[derive(Debug, Serialize)]
struct Readiness {
    ready: bool,
    queues: Vec<QueueStatsSnapshot>,
}

/// Build the HTTP router.
pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(ctx): State<AppContext>) -> impl IntoResponse {
    let ready = ctx.is_ready();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(Readiness {
            ready,
            queues: ctx.stats(),
        }),
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use proofbot_common::Config;
    use proofbot_core::testing::{FlakyBlobStore, MemoryStore, StaticSource};
    use std::io::Write;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn context(dir: &std::path::Path) -> AppContext {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            "[database]\nurl = \"postgres://localhost/proofbot\"\n\n[cache]\ndir = {:?}\n",
            dir.display().to_string()
        )
        .unwrap();
        let config = Config::from_file(file.path()).unwrap();
        AppContext::build_with_source(
            config,
            Arc::new(MemoryStore::new()),
            FlakyBlobStore::in_memory(),
            Arc::new(StaticSource::new(b"")),
        )
        .await
        .unwrap()
    }

    async fn status(app: Router, uri: &str) -> StatusCode {
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_healthz_always_ok() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path()).await;
        assert_eq!(status(router(ctx.clone()), "/healthz").await, StatusCode::OK);
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_readyz_follows_readiness() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path()).await;

        assert_eq!(
            status(router(ctx.clone()), "/readyz").await,
            StatusCode::SERVICE_UNAVAILABLE
        );
        ctx.mark_ready();
        assert_eq!(status(router(ctx.clone()), "/readyz").await, StatusCode::OK);

        ctx.shutdown().await;
    }
}
