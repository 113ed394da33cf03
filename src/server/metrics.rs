//! Prometheus request metrics for the HTTP surface.

use std::sync::OnceLock;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::{HeaderValue, Request, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts as PromOpts, Registry,
    TextEncoder,
};

struct Metrics {
    registry: Registry,
    requests: IntCounterVec,
    latency: HistogramVec,
    in_flight: IntGauge,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn build() -> Result<Metrics> {
    let registry = Registry::new();

    let requests = IntCounterVec::new(
        PromOpts::new("murmur_http_requests_total", "Total HTTP requests served."),
        &["status"],
    )
    .context("invalid counter definition")?;
    registry
        .register(Box::new(requests.clone()))
        .context("failed to register murmur_http_requests_total")?;

    let latency = HistogramVec::new(
        HistogramOpts::new(
            "murmur_http_request_duration_seconds",
            "HTTP request latency in seconds.",
        ),
        &["status"],
    )
    .context("invalid histogram definition")?;
    registry
        .register(Box::new(latency.clone()))
        .context("failed to register murmur_http_request_duration_seconds")?;

    let in_flight = IntGauge::new(
        "murmur_http_in_flight_requests",
        "Current number of in-flight HTTP requests.",
    )
    .context("invalid gauge definition")?;
    registry
        .register(Box::new(in_flight.clone()))
        .context("failed to register murmur_http_in_flight_requests")?;

    Ok(Metrics {
        registry,
        requests,
        latency,
        in_flight,
    })
}

pub fn init() -> Result<()> {
    if METRICS.get().is_none() {
        let _ = METRICS.set(build()?);
    }
    Ok(())
}

/// `GET /metrics` in the Prometheus text exposition format.
pub async fn prometheus_metrics() -> Response {
    let Some(metrics) = METRICS.get() else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "metrics not initialized").into_response();
    };

    let mut buf = Vec::new();
    if TextEncoder::new()
        .encode(&metrics.registry.gather(), &mut buf)
        .is_err()
    {
        return (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics").into_response();
    }

    (
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
        )],
        buf,
    )
        .into_response()
}

/// Middleware counting requests and latency by response status. The metrics
/// and health routes themselves stay out of the numbers.
pub async fn track_http_metrics(req: Request<Body>, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str())
        .unwrap_or_else(|| req.uri().path())
        .to_owned();

    let Some(metrics) = METRICS.get() else {
        return next.run(req).await;
    };
    if route == "/metrics" || route.ends_with("/health") {
        return next.run(req).await;
    }

    let start = Instant::now();
    metrics.in_flight.inc();
    let response = next.run(req).await;
    metrics.in_flight.dec();

    let status = response.status().as_u16().to_string();
    metrics.requests.with_label_values(&[&status]).inc();
    metrics
        .latency
        .with_label_values(&[&status])
        .observe(start.elapsed().as_secs_f64());

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_is_idempotent_and_exposition_includes_families() -> anyhow::Result<()> {
        init()?;
        init()?;

        METRICS
            .get()
            .expect("initialized")
            .requests
            .with_label_values(&["200"])
            .inc();

        let resp = prometheus_metrics().await;
        assert_eq!(resp.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await?;
        let text = std::str::from_utf8(&bytes)?;
        assert!(text.contains("murmur_http_requests_total"));
        assert!(text.contains("murmur_http_in_flight_requests"));
        Ok(())
    }
}
