//! Subtitle and plain-text rendering of transcription segments.
//!
//! Timestamp grammar: SRT wants `HH:MM:SS,mmm`, WebVTT wants `HH:MM:SS.mmm`.
//! Speaker turns render as a `<v Speaker>` cue prefix in VTT and a
//! `[SPEAKER]` text prefix everywhere else.

use crate::schema::{ResponseFormat, Segment, Transcription};

/// Mandatory WebVTT file header.
pub const VTT_HEADER: &str = "WEBVTT\n\n";

/// One SRT cue. `index` is the 1-based sequence number.
pub fn srt_block(index: u64, segment: &Segment) -> String {
    format!(
        "{index}\n{} --> {}\n{}{}\n\n",
        format_timestamp(segment.start, ','),
        format_timestamp(segment.end, ','),
        speaker_prefix(segment),
        segment.text.trim()
    )
}

/// One WebVTT cue (header not included).
pub fn vtt_block(segment: &Segment) -> String {
    let voice = if segment.speaker_turn {
        "<v Speaker>"
    } else {
        ""
    };
    format!(
        "{} --> {}\n{voice}{}\n\n",
        format_timestamp(segment.start, '.'),
        format_timestamp(segment.end, '.'),
        segment.text.trim()
    )
}

/// One plain-text line.
pub fn text_block(segment: &Segment) -> String {
    format!("{}{}\n", speaker_prefix(segment), segment.text.trim())
}

fn speaker_prefix(segment: &Segment) -> &'static str {
    if segment.speaker_turn { "[SPEAKER] " } else { "" }
}

/// Render a whole result in a non-JSON format. JSON shapes are serialised
/// directly from [`Transcription`]; this covers the text-like formats.
pub fn render_document(format: ResponseFormat, result: &Transcription) -> String {
    let segments = result.segments.as_deref().unwrap_or(&[]);
    match format {
        ResponseFormat::Srt => {
            let mut out = String::new();
            for (i, segment) in segments.iter().enumerate() {
                out.push_str(&srt_block(i as u64 + 1, segment));
            }
            out
        }
        ResponseFormat::Vtt => {
            let mut out = String::from(VTT_HEADER);
            for segment in segments {
                out.push_str(&vtt_block(segment));
            }
            out
        }
        _ => {
            let mut out = result.text.trim().to_owned();
            out.push('\n');
            out
        }
    }
}

/// Format seconds as `HH:MM:SS` plus a millisecond field behind `ms_sep`,
/// rounded to the nearest millisecond.
fn format_timestamp(seconds: f64, ms_sep: char) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;

    let ms = total_ms % 1000;
    let total_s = total_ms / 1000;
    let s = total_s % 60;
    let total_m = total_s / 60;
    let m = total_m % 60;
    let h = total_m / 60;

    format!("{h:02}:{m:02}:{s:02}{ms_sep}{ms:03}")
}

pub fn srt_timestamp(seconds: f64) -> String {
    format_timestamp(seconds, ',')
}

pub fn vtt_timestamp(seconds: f64) -> String {
    format_timestamp(seconds, '.')
}
