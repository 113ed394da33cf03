//! Transcription and translation endpoints: multipart upload in, JSON /
//! subtitle body or streamed segment events out.

use std::io::Cursor;
use std::time::Duration;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Multipart, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::render;
use crate::schema::{ResponseFormat, TaskKind};
use crate::service::{Task, TranscribeOptions};
use crate::task::SegmentSink;

use super::events::{self, EVENT_CONTENT_TYPE, Event};
use super::models::StreamQuery;
use super::{AppError, AppState};

pub(super) async fn transcriptions(
    state: State<AppState>,
    query: Query<StreamQuery>,
    multipart: Multipart,
) -> Result<Response, AppError> {
    handle(state, query, multipart, Task::Transcribe).await
}

pub(super) async fn translations(
    state: State<AppState>,
    query: Query<StreamQuery>,
    multipart: Multipart,
) -> Result<Response, AppError> {
    handle(state, query, multipart, Task::Translate).await
}

#[derive(Debug, Serialize)]
struct TaskEvent {
    task: TaskKind,
    model: String,
}

async fn handle(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
    mut multipart: Multipart,
    task: Task,
) -> Result<Response, AppError> {
    let form = read_form(&mut multipart).await?;

    let model = form
        .model
        .ok_or_else(|| AppError::bad_request("model is required".to_owned()))?;
    let file = form
        .file
        .filter(|bytes| !bytes.is_empty())
        .ok_or_else(|| AppError::bad_request("file is required".to_owned()))?;

    let format = form.response_format.unwrap_or_default();
    let options = TranscribeOptions {
        task,
        language: form.language,
        temperature: form.temperature,
        initial_prompt: form.prompt,
        segment_duration: form.segment_size.map(Duration::from_secs_f64),
        emit_segments: format.wants_segments(),
    };
    let reader = Cursor::new(file.to_vec());

    if query.stream {
        return Ok(stream_response(state, model, reader, options, format));
    }

    let cancel = state.shutdown.child();
    let service = state.service.clone();
    let worker_cancel = cancel.clone();
    // Dropping the handler future (client disconnect) trips the request
    // token, which the abort callback inside the run observes.
    let _guard = super::CancelOnDrop(cancel);

    let result = tokio::task::spawn_blocking(move || {
        service.transcribe(&model, reader, &options, &worker_cancel, None)
    })
    .await
    .map_err(AppError::internal)??;

    Ok(match format {
        ResponseFormat::Json | ResponseFormat::VerboseJson => Json(result).into_response(),
        ResponseFormat::Text => (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            render::render_document(format, &result),
        )
            .into_response(),
        ResponseFormat::Srt => (
            [(header::CONTENT_TYPE, "application/x-subrip")],
            render::render_document(format, &result),
        )
            .into_response(),
        ResponseFormat::Vtt => (
            [(header::CONTENT_TYPE, "text/vtt; charset=utf-8")],
            render::render_document(format, &result),
        )
            .into_response(),
    })
}

/// Streamed variant: a `task` event up front, one `segment` event per
/// finalised segment (JSON, or a pre-rendered block for the subtitle
/// formats), then a terminal `ok` or `error`.
fn stream_response(
    state: AppState,
    model: String,
    reader: Cursor<Vec<u8>>,
    options: TranscribeOptions,
    format: ResponseFormat,
) -> Response {
    let (tx, body) = events::channel();
    let cancel = state.shutdown.child();
    let service = state.service.clone();

    tokio::task::spawn_blocking(move || {
        let meta = TaskEvent {
            task: options.task.into(),
            model: model.clone(),
        };
        if !tx.send(Event::new("task", &meta)) {
            return;
        }

        let segment_tx = tx.clone();
        let segment_cancel = cancel.clone();
        let mut srt_index = 0u64;
        let sink: SegmentSink = Box::new(move |segment| {
            let event = match format {
                ResponseFormat::Srt => {
                    srt_index += 1;
                    Event::new("segment", &render::srt_block(srt_index, &segment))
                }
                ResponseFormat::Vtt => Event::new("segment", &render::vtt_block(&segment)),
                ResponseFormat::Text => Event::new("segment", &render::text_block(&segment)),
                ResponseFormat::Json | ResponseFormat::VerboseJson => {
                    Event::new("segment", &segment)
                }
            };
            if !segment_tx.send(event) {
                segment_cancel.cancel();
            }
        });

        match service.transcribe(&model, reader, &options, &cancel, Some(sink)) {
            Ok(result) => {
                tx.send(Event::new("ok", &result));
            }
            Err(err) => {
                tracing::error!(%err, "transcription failed");
                tx.send(Event::new("error", &err.to_string()));
            }
        }
    });

    (
        [(header::CONTENT_TYPE, EVENT_CONTENT_TYPE)],
        body,
    )
        .into_response()
}

#[derive(Debug, Default)]
struct TranscribeForm {
    file: Option<Bytes>,
    model: Option<String>,
    language: Option<String>,
    prompt: Option<String>,
    temperature: Option<f32>,
    segment_size: Option<f64>,
    response_format: Option<ResponseFormat>,
}

async fn read_form(multipart: &mut Multipart) -> Result<TranscribeForm, AppError> {
    let mut form = TranscribeForm::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(err.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_owned();
        match name.as_str() {
            "file" => {
                form.file = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|err| AppError::bad_request(err.to_string()))?,
                );
            }
            "model" => form.model = Some(read_text(field).await?),
            "language" => form.language = Some(read_text(field).await?),
            "prompt" => form.prompt = Some(read_text(field).await?),
            "temperature" => {
                let text = read_text(field).await?;
                form.temperature = Some(text.trim().parse().map_err(|_| {
                    AppError::bad_request(format!("invalid temperature: {text:?}"))
                })?);
            }
            "segment_size" => {
                let text = read_text(field).await?;
                let seconds: f64 = text.trim().parse().map_err(|_| {
                    AppError::bad_request(format!("invalid segment_size: {text:?}"))
                })?;
                if !seconds.is_finite() || seconds < 0.0 {
                    return Err(AppError::bad_request(format!(
                        "invalid segment_size: {text:?}"
                    )));
                }
                form.segment_size = Some(seconds);
            }
            "response_format" => {
                let text = read_text(field).await?;
                form.response_format = Some(text.parse().map_err(AppError::from)?);
            }
            _ => {}
        }
    }

    Ok(form)
}

async fn read_text(field: axum::extract::multipart::Field<'_>) -> Result<String, AppError> {
    field
        .text()
        .await
        .map_err(|err| AppError::bad_request(err.to_string()))
}
