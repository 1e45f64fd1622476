//! HTTP endpoint of the `split-consumer` binary.
//!
//! Serves the liveness and readiness checks next to a Prometheus `/metrics` page
//! that exposes the consumer's counters and the drain and batch histograms.

use std::time::Instant;

use anyhow::{Context, Result};
use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram buckets in milliseconds, from a single record up to a slow partition drain
const DURATION_BUCKETS_MS: &[f64] = &[
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0,
];

pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, router).await
}

/// Install the global recorder and mount `/metrics` on the health-check router.
///
/// Every route added before this call is counted by [`track_metrics`].
pub fn setup_metrics_routes(router: Router) -> Result<Router> {
    let handle = setup_metrics_recorder()?;
    let render = move || std::future::ready(handle.render());

    Ok(router
        .route("/metrics", get(render))
        .layer(axum::middleware::from_fn(track_metrics)))
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .set_buckets(DURATION_BUCKETS_MS)
        .context("invalid histogram buckets")?
        .install_recorder()
        .context("failed to install prometheus recorder")
}

/// Count health-check and scrape requests by route and status
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let started = Instant::now();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_owned())
        .unwrap_or_else(|| req.uri().path().to_owned());
    let method = req.method().to_string();

    let response = next.run(req).await;

    let labels = [
        ("method", method),
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels)
        .record(started.elapsed().as_secs_f64());

    response
}
