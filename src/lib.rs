//! `murmur` — a long-running speech transcription and translation service
//! built on whisper.cpp.
//!
//! This crate provides:
//! - A file-system model store with downloads, progress and deletion
//! - A bounded pool of reusable loaded-model contexts
//! - An audio segmenter decoding arbitrary containers to 16 kHz mono
//! - Transcription, translation and diarisation tasks with streaming
//!   segment callbacks
//! - An OpenAI-compatible HTTP surface (behind the `server` feature)
//!
//! The library is designed to serve both the bundled CLI and long-running
//! deployments, with an emphasis on streaming output, bounded resource use
//! and minimal surprises.

// Cross-cutting primitives.
pub mod cancel;
pub mod config;
pub mod error;
pub mod schema;

// The inference binding: trait seam plus the whisper.cpp implementation.
pub mod engine;

// Model artifacts on disk.
pub mod store;

// Context cache and the per-request transcription task.
pub mod pool;
pub mod task;

// Audio decode path: container demux, codec decode, PCM normalisation,
// fixed-duration segmenting and the optional voice-activity gate.
mod audio_pipeline;
mod decode;
mod demux;
pub mod segmenter;
pub mod vad;

// The service façade tying store, pool and segmenter together.
pub mod service;

// Subtitle and text rendering of results.
pub mod render;

// Logging configuration and control.
pub mod logging;

// HTTP surface.
#[cfg(feature = "server")]
pub mod server;

#[cfg(test)]
pub(crate) mod testutil;

pub use cancel::CancelToken;
pub use config::Config;
pub use engine::WhisperEngine;
pub use error::{Error, Result};
pub use logging::init as init_logging;
pub use schema::{Model, ResponseFormat, Segment, TaskKind, Transcription};
pub use service::{Service, Task, TranscribeOptions};
