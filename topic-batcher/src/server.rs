use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::kafka::controller::{ConsumerGroupController, ControllerStatus};
use crate::kafka::session::ControllerState;

pub async fn index() -> &'static str {
    "topic batcher service"
}

async fn liveness(State(controller): State<Arc<ConsumerGroupController>>) -> impl IntoResponse {
    match controller.state() {
        ControllerState::Closed => (StatusCode::SERVICE_UNAVAILABLE, "closed"),
        _ => (StatusCode::OK, "ok"),
    }
}

async fn status(State(controller): State<Arc<ConsumerGroupController>>) -> Json<ControllerStatus> {
    Json(controller.status())
}

/// Operational routes. `/metrics` is only mounted when a recorder handle is given,
/// the recorder can be installed once per process.
pub fn router(
    controller: Arc<ConsumerGroupController>,
    recorder: Option<PrometheusHandle>,
) -> Router {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(liveness))
        .route("/_status", get(status))
        .with_state(controller);

    let router = match recorder {
        Some(handle) => router.route(
            "/metrics",
            get(move || std::future::ready(handle.render())),
        ),
        None => router,
    };

    router.layer(axum::middleware::from_fn(track_metrics))
}

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle> {
    const BUCKETS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 50.0, 100.0, 250.0, 1000.0,
        5000.0, 30000.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(BUCKETS)
        .context("invalid histogram buckets")?
        .install_recorder()
        .context("failed to install prometheus recorder")
}

/// Middleware to record some common HTTP metrics
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}
