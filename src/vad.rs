//! Optional voice-activity gate in front of inference.
//!
//! Backed by the Silero VAD that whisper.cpp ships: a window of samples goes
//! in, speech time ranges come out, and the gate reduces them to a single
//! speech probability. A higher layer uses the probability to skip inference
//! on silent segments.

use std::path::Path;

use whisper_rs::{WhisperVadContext, WhisperVadContextParams, WhisperVadParams};

use crate::error::{Error, Result};

pub struct SpeechFilter {
    ctx: WhisperVadContext,
}

impl SpeechFilter {
    /// Load a Silero VAD model (e.g. `ggml-silero-v5.1.2.bin`).
    pub fn new(model_path: &Path) -> Result<Self> {
        let path = model_path.to_str().ok_or_else(|| {
            Error::bad_parameter(format!("VAD model path is not valid UTF-8: {model_path:?}"))
        })?;
        let ctx = WhisperVadContext::new(path, WhisperVadContextParams::default())
            .map_err(|err| Error::ModelLoad(format!("{}: {err}", model_path.display())))?;
        Ok(Self { ctx })
    }

    /// Probability `p ∈ [0, 1]` that the window contains speech, computed as
    /// the fraction of it covered by detected speech ranges.
    pub fn probability(&mut self, sample_rate: u32, samples: &[f32]) -> Result<f32> {
        if samples.is_empty() || sample_rate == 0 {
            return Ok(0.0);
        }

        let segments = self
            .ctx
            .segments_from_samples(WhisperVadParams::default(), samples)
            .map_err(|err| Error::RunFailed(format!("voice-activity detection failed: {err}")))?;

        let mut ranges = Vec::new();
        for i in 0..segments.num_segments() {
            let (Some(start_cs), Some(end_cs)) = (
                segments.get_segment_start_timestamp(i),
                segments.get_segment_end_timestamp(i),
            ) else {
                continue;
            };
            ranges.push((start_cs / 100.0, end_cs / 100.0));
        }

        let window_secs = samples.len() as f64 / f64::from(sample_rate);
        Ok(coverage_probability(&ranges, window_secs))
    }
}

/// Reduce speech time ranges (seconds) to the covered fraction of a window.
fn coverage_probability(ranges: &[(f32, f32)], window_secs: f64) -> f32 {
    if window_secs <= 0.0 {
        return 0.0;
    }
    let covered: f64 = ranges
        .iter()
        .map(|(start, end)| f64::from((end - start).max(0.0)))
        .sum();
    (covered / window_secs).clamp(0.0, 1.0) as f32
}
