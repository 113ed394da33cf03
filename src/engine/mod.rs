//! The inference binding: a capability-typed view over the model runtime.
//!
//! The rest of the crate only ever sees the [`Engine`] / [`EngineContext`]
//! trait pair. There is one production implementation (whisper.cpp via
//! `whisper-rs`) and a scripted double used by the pool, task and service
//! tests, which keeps everything above this seam testable without loading a
//! real model.

use std::path::Path;

use crate::error::Result;

mod whisper;

#[cfg(test)]
pub(crate) mod mock;

pub use whisper::WhisperEngine;

/// Expected input sample rate, samples per second.
pub const SAMPLE_RATE: u32 = 16_000;

/// Options applied when loading a model into a context.
#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub use_gpu: bool,
    pub gpu_device: i32,
    pub flash_attn: bool,
    pub token_timestamps: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            use_gpu: true,
            gpu_device: 0,
            flash_attn: false,
            token_timestamps: false,
        }
    }
}

impl ContextOptions {
    /// Map the service GPU policy (`-1` disabled, `0` default device,
    /// `>0` device index) onto load options.
    pub fn for_gpu_policy(gpu: i32) -> Self {
        Self {
            use_gpu: gpu >= 0,
            gpu_device: gpu.max(0),
            ..Self::default()
        }
    }
}

/// Decoding strategy for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingStrategy {
    Greedy,
    BeamSearch,
}

/// Parameters for one inference run.
///
/// A context resets these to defaults every time it is borrowed; requests
/// then adjust only what they need.
#[derive(Debug, Clone)]
pub struct InferenceParams {
    pub strategy: SamplingStrategy,

    /// ISO-639-1 short code, or `"auto"` to detect.
    pub language: String,

    pub translate: bool,
    pub diarize: bool,
    pub single_segment: bool,
    pub token_timestamps: bool,

    /// Maximum segment length in characters; `0` means no limit.
    pub max_len: i32,

    /// Maximum tokens per segment; `0` means no limit.
    pub max_tokens: i32,

    pub temperature: f32,
    pub suppress_blank: bool,
    pub initial_prompt: Option<String>,
    pub n_threads: i32,
}

impl InferenceParams {
    /// Library defaults for the given strategy, with language detection on.
    pub fn default_params(strategy: SamplingStrategy) -> Self {
        Self {
            strategy,
            language: "auto".to_owned(),
            translate: false,
            diarize: false,
            single_segment: false,
            token_timestamps: false,
            max_len: 0,
            max_tokens: 0,
            temperature: 0.0,
            suppress_blank: true,
            initial_prompt: None,
            n_threads: num_cpus::get() as i32,
        }
    }
}

/// A segment as reported by the engine, timestamps in seconds relative to
/// the start of the sample buffer the run was given.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSegment {
    pub id: i32,
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub speaker_turn: bool,
}

/// Marker classification for a decoded token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Text,
    EndOfTranscript,
    StartOfTranscript,
    StartOfLm,
    Previous,
    NoSpeech,
    NoTimestamps,
    Timestamp,
    Language,
}

impl TokenKind {
    /// Classify a token by its vocabulary text. Covers both the ggml-style
    /// (`[_BEG_]`) and HF-style (`<|notimestamps|>`) marker spellings.
    pub fn classify(text: &str) -> TokenKind {
        match text {
            "[_EOT_]" | "<|endoftext|>" => TokenKind::EndOfTranscript,
            "[_SOT_]" | "<|startoftranscript|>" => TokenKind::StartOfTranscript,
            "[_SOLM_]" | "<|startoflm|>" => TokenKind::StartOfLm,
            "[_PREV_]" | "<|startofprev|>" => TokenKind::Previous,
            "[_NOSP_]" | "<|nospeech|>" => TokenKind::NoSpeech,
            "[_NOT_]" | "<|notimestamps|>" => TokenKind::NoTimestamps,
            _ if text.starts_with("[_BEG_") || text.starts_with("[_TT_") => TokenKind::Timestamp,
            _ if text.starts_with("[_LANG_") => TokenKind::Language,
            _ if is_hf_language_marker(text) => TokenKind::Language,
            _ if is_hf_timestamp_marker(text) => TokenKind::Timestamp,
            _ => TokenKind::Text,
        }
    }
}

fn is_hf_language_marker(text: &str) -> bool {
    let Some(inner) = text.strip_prefix("<|").and_then(|t| t.strip_suffix("|>")) else {
        return false;
    };
    inner.len() == 2 && inner.bytes().all(|b| b.is_ascii_lowercase())
}

fn is_hf_timestamp_marker(text: &str) -> bool {
    let Some(inner) = text.strip_prefix("<|").and_then(|t| t.strip_suffix("|>")) else {
        return false;
    };
    inner.bytes().all(|b| b.is_ascii_digit() || b == b'.') && inner.contains('.')
}

/// One decoded token with its probability and timestamp range (seconds).
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub id: i32,
    pub text: String,
    pub probability: f32,
    pub start: f64,
    pub end: f64,
    pub kind: TokenKind,
}

/// Callbacks installed for the duration of a single run.
///
/// All three are invoked from inside the run, on the calling thread. They
/// must not re-enter the engine and should stay cheap; registration is
/// per-run and dropped when the run returns.
#[derive(Default)]
pub struct RunHooks {
    /// Invoked once per newly finalised segment.
    pub on_new_segment: Option<Box<dyn FnMut(EngineSegment) + Send>>,

    /// Invoked with a 0–100 progress figure.
    pub on_progress: Option<Box<dyn FnMut(i32) + Send>>,

    /// Polled cooperatively; returning `true` aborts the run.
    pub on_abort: Option<Box<dyn FnMut() -> bool + Send>>,
}

impl RunHooks {
    pub fn none() -> Self {
        Self::default()
    }
}

/// Loads model artifacts into runnable contexts.
pub trait Engine: Send + Sync {
    /// Load the artifact at `path`. Fails with the model-load kind when the
    /// artifact is unreadable or malformed.
    fn load(&self, path: &Path, options: &ContextOptions) -> Result<Box<dyn EngineContext>>;

    /// Resolve a short language code to its id, `-1` when unknown.
    fn language_id(&self, name: &str) -> i32;

    /// Resolve a language id back to its short code.
    fn language_name(&self, id: i32) -> Option<String>;

    /// Number of languages the vocabulary distinguishes.
    fn num_languages(&self) -> i32;
}

/// A loaded model plus the state of its most recent run.
pub trait EngineContext: Send {
    fn is_multilingual(&self) -> bool;

    /// Run one inference pass over `samples` (mono, [`SAMPLE_RATE`] Hz).
    ///
    /// Returns the cancellation kind when the abort hook tripped the run,
    /// and the run-failed kind for any other non-zero native status.
    fn run(&mut self, params: &InferenceParams, samples: &[f32], hooks: RunHooks) -> Result<()>;

    /// Segments produced by the most recent successful run.
    fn segments(&mut self) -> Result<Vec<EngineSegment>>;

    /// Tokens of one segment from the most recent successful run.
    fn tokens(&mut self, segment: usize) -> Result<Vec<Token>>;

    /// Language detected by the most recent run, when available.
    fn detected_language(&mut self) -> Option<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_policy_maps_onto_context_options() {
        let off = ContextOptions::for_gpu_policy(-1);
        assert!(!off.use_gpu);

        let default = ContextOptions::for_gpu_policy(0);
        assert!(default.use_gpu);
        assert_eq!(default.gpu_device, 0);

        let second = ContextOptions::for_gpu_policy(2);
        assert!(second.use_gpu);
        assert_eq!(second.gpu_device, 2);
    }

    #[test]
    fn default_params_detect_language() {
        let params = InferenceParams::default_params(SamplingStrategy::Greedy);
        assert_eq!(params.language, "auto");
        assert!(!params.translate);
        assert!(!params.diarize);
        assert!(params.suppress_blank);
        assert!(params.n_threads > 0);
    }

    #[test]
    fn token_kind_classifies_marker_spellings() {
        assert_eq!(TokenKind::classify(" hello"), TokenKind::Text);
        assert_eq!(TokenKind::classify("[_EOT_]"), TokenKind::EndOfTranscript);
        assert_eq!(
            TokenKind::classify("<|endoftext|>"),
            TokenKind::EndOfTranscript
        );
        assert_eq!(TokenKind::classify("[_BEG_]"), TokenKind::Timestamp);
        assert_eq!(TokenKind::classify("[_TT_150]"), TokenKind::Timestamp);
        assert_eq!(TokenKind::classify("<|0.00|>"), TokenKind::Timestamp);
        assert_eq!(TokenKind::classify("<|en|>"), TokenKind::Language);
        assert_eq!(TokenKind::classify("[_LANG_de_]"), TokenKind::Language);
        assert_eq!(TokenKind::classify("<|nospeech|>"), TokenKind::NoSpeech);
    }
}
