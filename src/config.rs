use std::path::PathBuf;
use std::time::Duration;

/// Default remote the store resolves relative model paths against.
///
/// The query string is preserved when a path is appended, which is what
/// Hugging Face expects for direct downloads.
pub const DEFAULT_MODEL_URL: &str =
    "https://huggingface.co/ggerganov/whisper.cpp/resolve/main?download=true";

/// Extension the store admits during a scan and enforces on downloads.
pub const DEFAULT_MODEL_EXT: &str = ".bin";

/// Service configuration.
///
/// This is *library-level configuration*, not CLI flags directly. The CLI and
/// server map user input onto this type so the library stays reusable from
/// tests and other frontends.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory of the model store.
    pub store_dir: PathBuf,

    /// File extension for model artifacts (with the leading dot).
    pub model_ext: String,

    /// Base URL model downloads resolve against.
    pub model_url: String,

    /// Maximum number of concurrently loaded inference contexts. Requests
    /// beyond this fail fast rather than queue.
    pub max_concurrent: usize,

    /// GPU policy: `-1` disables the GPU, `0` uses the default device,
    /// anything greater selects that device index.
    pub gpu: i32,

    /// Emit native debug-level log lines.
    pub debug: bool,

    /// Optional Silero VAD model; when set, segments whose speech
    /// probability falls below [`Config::vad_threshold`] skip inference.
    pub vad_model: Option<PathBuf>,

    /// Minimum speech probability for a segment to reach inference.
    pub vad_threshold: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("models"),
            model_ext: DEFAULT_MODEL_EXT.to_owned(),
            model_url: DEFAULT_MODEL_URL.to_owned(),
            max_concurrent: 2,
            gpu: 0,
            debug: false,
            vad_model: None,
            vad_threshold: 0.1,
        }
    }
}

/// Bounds applied to a requested segment duration.
///
/// Smaller segments stream sooner but reset model context more often; larger
/// ones keep context at the cost of first-segment latency.
pub const MIN_SEGMENT_DURATION: Duration = Duration::from_secs(5);
pub const MAX_SEGMENT_DURATION: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_SEGMENT_DURATION: Duration = Duration::from_secs(5 * 60);

/// Clamp a requested segment duration into the supported window.
pub fn clamp_segment_duration(requested: Option<Duration>) -> Duration {
    requested
        .unwrap_or(DEFAULT_SEGMENT_DURATION)
        .clamp(MIN_SEGMENT_DURATION, MAX_SEGMENT_DURATION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_segment_duration_enforces_bounds() {
        assert_eq!(clamp_segment_duration(None), DEFAULT_SEGMENT_DURATION);
        assert_eq!(
            clamp_segment_duration(Some(Duration::from_secs(1))),
            MIN_SEGMENT_DURATION
        );
        assert_eq!(
            clamp_segment_duration(Some(Duration::from_secs(3600))),
            MAX_SEGMENT_DURATION
        );
        assert_eq!(
            clamp_segment_duration(Some(Duration::from_secs(30))),
            Duration::from_secs(30)
        );
    }
}
