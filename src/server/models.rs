//! Model CRUD and download endpoints.

use std::time::{Duration, Instant};

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::schema::Model;

use super::events::{self, EVENT_CONTENT_TYPE, Event};
use super::{AppError, AppState, ErrorBody};

/// Downloads report progress about once a second, plus a final report at
/// completion so short transfers still show one.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize)]
pub(super) struct ModelList {
    object: &'static str,
    models: Vec<Model>,
}

#[derive(Debug, Deserialize)]
pub(super) struct DownloadRequest {
    #[serde(default)]
    path: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct StreamQuery {
    #[serde(default)]
    pub(super) stream: bool,
}

#[derive(Debug, Serialize)]
struct DownloadProgress {
    status: String,
    #[serde(skip_serializing_if = "u64_is_zero")]
    total: u64,
    completed: u64,
}

fn u64_is_zero(v: &u64) -> bool {
    *v == 0
}

pub(super) async fn list(State(state): State<AppState>) -> Json<ModelList> {
    Json(ModelList {
        object: "list",
        models: state.service.models(),
    })
}

pub(super) async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Model>, AppError> {
    state
        .service
        .model_by_id(&id)
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("model not found: {id:?}")))
}

pub(super) async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let service = state.service.clone();
    tokio::task::spawn_blocking(move || service.delete_model(&id))
        .await
        .map_err(AppError::internal)??;
    Ok(StatusCode::OK.into_response())
}

pub(super) async fn download(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
    Json(req): Json<DownloadRequest>,
) -> Result<Response, AppError> {
    if req.path.is_empty() {
        return Err(AppError::bad_request("missing path".to_owned()));
    }

    if query.stream {
        return Ok(download_stream(state, req.path));
    }

    let cancel = state.shutdown.child();
    let service = state.service.clone();
    let path = req.path;
    let worker_cancel = cancel.clone();
    let _guard = super::CancelOnDrop(cancel);

    let model = tokio::task::spawn_blocking(move || {
        service.download_model(&worker_cancel, &path, |_, _| {})
    })
    .await
    .map_err(AppError::internal)?
    .map_err(download_error)?;

    Ok((StatusCode::CREATED, Json(model)).into_response())
}

/// Streamed variant: `progress` events while bytes move, then a terminal
/// `ok` carrying the indexed model, or `error` with a message.
fn download_stream(state: AppState, path: String) -> Response {
    let (tx, body) = events::channel();
    let cancel = state.shutdown.child();
    let service = state.service.clone();

    tokio::task::spawn_blocking(move || {
        let progress_tx = tx.clone();
        let progress_cancel = cancel.clone();
        let status = format!("downloading {path}");
        let mut last = Instant::now();

        let result = service.download_model(&cancel, &path, |completed, total| {
            let done = total > 0 && completed == total;
            if last.elapsed() < PROGRESS_INTERVAL && !done {
                return;
            }
            last = Instant::now();
            let event = Event::new(
                "progress",
                &DownloadProgress {
                    status: status.clone(),
                    total,
                    completed,
                },
            );
            if !progress_tx.send(event) {
                // Client went away; abandon the transfer.
                progress_cancel.cancel();
            }
        });

        match result {
            Ok(model) => {
                tx.send(Event::new("ok", &model));
            }
            Err(err) => {
                tracing::warn!(%err, "model download failed");
                tx.send(Event::new(
                    "error",
                    &ErrorBody {
                        error: err.to_string(),
                    },
                ));
            }
        }
    });

    (
        [(header::CONTENT_TYPE, EVENT_CONTENT_TYPE)],
        body,
    )
        .into_response()
}

/// The download endpoint reports any failure other than a bad request as a
/// bad gateway; the remote is the usual culprit.
fn download_error(err: Error) -> AppError {
    match err.primary() {
        Error::BadParameter(_) => err.into(),
        _ => AppError {
            status: StatusCode::BAD_GATEWAY,
            message: err.to_string(),
        },
    }
}
