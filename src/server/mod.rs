//! The HTTP surface: an OpenAI-compatible API over the service façade.
//!
//! Routing and body handling live here; every operation with real work in it
//! runs on the blocking pool and reports back through the error kinds the
//! core already speaks. Streamed responses use line-delimited
//! `event:`/`data:` frames (see [`events`]).

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::middleware::from_fn;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Serialize;
use tower_http::trace::{DefaultMakeSpan, DefaultOnFailure, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::cancel::CancelToken;
use crate::error::Error;
use crate::service::Service;

mod events;
mod models;
mod transcribe;

pub mod metrics;

/// Server wiring knobs. The defaults match the documented surface: the API
/// under `/v1`, request bodies up to 100 MiB.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub base_path: String,
    pub max_body_bytes: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            base_path: "/v1".to_owned(),
            max_body_bytes: 100 * 1024 * 1024,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<Service>,

    /// Process-wide shutdown token; every request derives its own child.
    pub shutdown: CancelToken,
}

/// Build the application router.
pub fn router(service: Arc<Service>, shutdown: CancelToken, options: &ServerOptions) -> Router {
    if let Err(err) = metrics::init() {
        tracing::warn!(error = ?err, "metrics disabled (init failed)");
    }

    let api = Router::new()
        .route("/health", get(health))
        .route("/models", get(models::list).post(models::download))
        .route("/models/{id}", get(models::get).delete(models::delete))
        .route("/audio/transcriptions", post(transcribe::transcriptions))
        .route("/audio/translations", post(transcribe::translations));

    Router::new()
        .route("/metrics", get(metrics::prometheus_metrics))
        .nest(&options.base_path, api)
        .route_layer(from_fn(metrics::track_http_metrics))
        .with_state(AppState { service, shutdown })
        .layer(DefaultBodyLimit::max(options.max_body_bytes))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(
                    DefaultMakeSpan::new()
                        .level(Level::INFO)
                        .include_headers(false),
                )
                .on_response(DefaultOnResponse::new().level(Level::INFO))
                .on_failure(DefaultOnFailure::new().level(Level::ERROR)),
        )
}

async fn health() -> StatusCode {
    StatusCode::OK
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// A handler failure: a status plus a message served as JSON.
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn bad_request(message: String) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message,
        }
    }

    fn not_found(message: String) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message,
        }
    }

    fn internal(err: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        }
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        Self {
            status: status_for(&err),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

/// Map an error kind to its response status.
pub fn status_for(err: &Error) -> StatusCode {
    match err.primary() {
        Error::BadParameter(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
        Error::Upstream(_) => StatusCode::BAD_GATEWAY,
        Error::ModelLoad(_)
        | Error::RunAborted
        | Error::RunFailed(_)
        | Error::Io(_)
        | Error::Aggregate(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Trips a cancellation token when dropped. Held across awaits in
/// non-streaming handlers so a dropped handler future (client disconnect)
/// reaches the blocking worker.
struct CancelOnDrop(CancelToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}
