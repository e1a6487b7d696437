//! HTTP scoring server
//!
//! Routes:
//! - `GET /ping`, `GET /health`: liveness
//! - `GET /version`: modelpack version
//! - `POST /invocations`: JSON in, `{"predictions": ...}` out

pub mod handlers;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use handlers::ServeState;

use crate::config::ServeConfig;

/// Build the router over shared state
pub fn router(state: Arc<ServeState>) -> Router {
    Router::new()
        .route("/ping", get(handlers::ping))
        .route("/health", get(handlers::health_check))
        .route("/version", get(handlers::version))
        .route("/invocations", post(handlers::invocations))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub struct ScoringServer {
    config: ServeConfig,
    state: Arc<ServeState>,
}

impl ScoringServer {
    pub fn new(config: ServeConfig, state: ServeState) -> Self {
        Self {
            config,
            state: Arc::new(state),
        }
    }

    /// Serve until the process is interrupted
    pub async fn start(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| {
                anyhow::anyhow!(
                    "Invalid listen address {}:{}: {}",
                    self.config.host,
                    self.config.port,
                    e
                )
            })?;

        let app = router(self.state.clone());
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(
            "Scoring server for {} listening on {}",
            self.state.scorer.model_dir().display(),
            addr
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| anyhow::anyhow!("Scoring server failed: {}", e))?;

        info!("Scoring server stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconstruction::CommandRunner;
    use crate::scoring::Scorer;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use modelpack_core::{ProcessArgs, ProcessResult};
    use serde_json::{json, Value};
    use std::path::Path;
    use tower::ServiceExt;

    struct EchoRunner {
        exit_code: i32,
        stderr: &'static str,
    }

    impl CommandRunner for EchoRunner {
        fn run(&self, _command: &ProcessArgs, stdin: Option<&[u8]>) -> anyhow::Result<ProcessResult> {
            let input: Value = serde_json::from_slice(stdin.unwrap_or(b"null".as_slice()))?;
            Ok(ProcessResult {
                exit_code: self.exit_code,
                stdout: json!({ "echo": input }).to_string(),
                stderr: self.stderr.to_string(),
                timed_out: false,
                duration_ms: 1,
            })
        }
    }

    fn app(exit_code: i32, stderr: &'static str) -> Router {
        let scorer = Scorer::new(
            Arc::new(EchoRunner { exit_code, stderr }),
            "python",
            Path::new("/models/m"),
        );
        router(Arc::new(ServeState::new(scorer, Some("abc".to_string()), 2)))
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_ping_and_health() {
        let response = app(0, "")
            .oneshot(Request::get("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app(0, "")
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["model_uuid"], "abc");
    }

    #[tokio::test]
    async fn test_version() {
        let response = app(0, "")
            .oneshot(Request::get("/version").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(
            body_json(response).await["version"],
            env!("CARGO_PKG_VERSION")
        );
    }

    #[tokio::test]
    async fn test_invocations_scores_json() {
        let request = Request::post("/invocations")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"inputs": [[1, 2]]}"#))
            .unwrap();
        let response = app(0, "").oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({ "predictions": { "echo": { "inputs": [[1, 2]] } } })
        );
    }

    #[tokio::test]
    async fn test_invalid_json_is_bad_request() {
        let request = Request::post("/invocations")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app(0, "").oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error_code"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn test_unsupported_content_type() {
        let request = Request::post("/invocations")
            .header("content-type", "text/csv")
            .body(Body::from("a,b\n1,2\n"))
            .unwrap();
        let response = app(0, "").oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn test_scoring_failure_is_server_error() {
        let request = Request::post("/invocations")
            .body(Body::from("[1, 2, 3]"))
            .unwrap();
        let response = app(1, "ModuleNotFoundError: No module named 'lightgbm'")
            .oneshot(request)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert!(body["message"].as_str().unwrap().contains("lightgbm"));
    }
}
