//! Wire types shared by the service core, the HTTP surface and the CLI.
//!
//! These are serde-first: the JSON shapes here are the OpenAI-compatible
//! bodies the HTTP layer serves, and the CLI prints them directly.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// One installed model artifact, as indexed by the store.
///
/// `path` is always relative to the store root with `/` separators; `id` is
/// derived from the filename and is stable across rescans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    /// Stable identifier derived from the filename: lowercased, extension
    /// dropped, anything outside `[a-z0-9.-]` mapped to `_`.
    pub id: String,

    /// Constant `"model"`, for OpenAI-style clients.
    #[serde(default = "model_object")]
    pub object: String,

    /// Path relative to the store root.
    pub path: String,

    /// File mtime, seconds since the Unix epoch.
    pub created: i64,

    /// File size in bytes.
    pub size: u64,

    /// Reserved; currently always empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub owned_by: String,
}

fn model_object() -> String {
    "model".to_owned()
}

/// A contiguous run of transcribed audio.
///
/// Timestamps are absolute within the source stream (the segmenter offset is
/// already applied) and serialise as floating-point seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: i32,
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub speaker_turn: bool,
}

/// The kind of task a transcription request ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Transcribe,
    Translate,
    Diarize,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Transcribe => f.write_str("transcribe"),
            TaskKind::Translate => f.write_str("translate"),
            TaskKind::Diarize => f.write_str("diarize"),
        }
    }
}

/// The cumulative result of one transcription request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcription {
    pub task: TaskKind,

    /// ISO-639-1 short code, requested or auto-detected.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub language: String,

    /// Source duration in seconds.
    pub duration: f64,

    /// Concatenation, in order, of every segment's text.
    pub text: String,

    /// Per-segment detail; present only when the response format needs it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segments: Option<Vec<Segment>>,
}

impl Transcription {
    pub fn new(task: TaskKind) -> Self {
        Self {
            task,
            language: String::new(),
            duration: 0.0,
            text: String::new(),
            segments: None,
        }
    }
}

/// Response rendering requested by the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum ResponseFormat {
    #[default]
    Json,
    #[cfg_attr(feature = "cli", value(name = "verbose_json"))]
    VerboseJson,
    Text,
    Srt,
    Vtt,
}

impl ResponseFormat {
    /// Whether rendering this format requires per-segment detail in the
    /// cumulative result.
    pub fn wants_segments(self) -> bool {
        matches!(
            self,
            ResponseFormat::VerboseJson | ResponseFormat::Srt | ResponseFormat::Vtt
        )
    }
}

impl FromStr for ResponseFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ResponseFormat::Json),
            "verbose_json" => Ok(ResponseFormat::VerboseJson),
            "text" => Ok(ResponseFormat::Text),
            "srt" => Ok(ResponseFormat::Srt),
            "vtt" => Ok(ResponseFormat::Vtt),
            other => Err(Error::bad_parameter(format!(
                "response_format must be one of: json, verbose_json, text, srt, vtt (got {other:?})"
            ))),
        }
    }
}

impl fmt::Display for ResponseFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseFormat::Json => f.write_str("json"),
            ResponseFormat::VerboseJson => f.write_str("verbose_json"),
            ResponseFormat::Text => f.write_str("text"),
            ResponseFormat::Srt => f.write_str("srt"),
            ResponseFormat::Vtt => f.write_str("vtt"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_omits_false_speaker_turn() -> anyhow::Result<()> {
        let seg = Segment {
            id: 0,
            start: 0.0,
            end: 1.5,
            text: " hello".to_owned(),
            speaker_turn: false,
        };
        let json = serde_json::to_string(&seg)?;
        assert!(!json.contains("speaker_turn"));

        let seg = Segment {
            speaker_turn: true,
            ..seg
        };
        let json = serde_json::to_string(&seg)?;
        assert!(json.contains("\"speaker_turn\":true"));
        Ok(())
    }

    #[test]
    fn transcription_serialises_task_lowercase() -> anyhow::Result<()> {
        let t = Transcription::new(TaskKind::Translate);
        let json = serde_json::to_string(&t)?;
        assert!(json.contains("\"task\":\"translate\""));
        assert!(!json.contains("segments"));
        Ok(())
    }

    #[test]
    fn response_format_parses_known_values_case_insensitively() -> anyhow::Result<()> {
        assert_eq!(" JSON ".parse::<ResponseFormat>()?, ResponseFormat::Json);
        assert_eq!(
            "verbose_json".parse::<ResponseFormat>()?,
            ResponseFormat::VerboseJson
        );
        assert_eq!("srt".parse::<ResponseFormat>()?, ResponseFormat::Srt);
        assert!("nope".parse::<ResponseFormat>().is_err());
        Ok(())
    }

    #[test]
    fn wants_segments_matches_formats_that_render_them() {
        assert!(!ResponseFormat::Json.wants_segments());
        assert!(!ResponseFormat::Text.wants_segments());
        assert!(ResponseFormat::VerboseJson.wants_segments());
        assert!(ResponseFormat::Srt.wants_segments());
        assert!(ResponseFormat::Vtt.wants_segments());
    }
}
