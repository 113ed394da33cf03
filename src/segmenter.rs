//! The audio segmenter: decodes an arbitrary container-wrapped byte stream
//! into fixed-duration mono segments with running timestamps.
//!
//! Segment `k` is delivered with timestamp `k × segment_duration`, always
//! exactly `segment_duration × sample_rate` samples long except for the
//! final tail, which is zero-padded up to size. A zero segment duration
//! disables segmenting: the whole stream is buffered and delivered in one
//! callback.

use std::io::Read;
use std::time::Duration;

use crate::audio_pipeline::AudioPipeline;
use crate::cancel::CancelToken;
use crate::decode::{decode_packet, decoder_for_track};
use crate::demux::{next_packet, open_stream, track_duration};
use crate::error::{Error, Result};

pub struct Segmenter<R> {
    reader: Option<R>,
    segment_duration: Duration,
    segment_samples: usize,
    sample_rate: u32,

    emitted_segments: u32,
    decoded_samples: u64,
    reported_duration: Option<f64>,
}

impl<R> Segmenter<R>
where
    R: Read + Send + Sync + 'static,
{
    /// Wrap `reader` for decoding into `segment_duration` chunks at
    /// `sample_rate`. `Duration::ZERO` disables segmenting.
    pub fn new(reader: R, segment_duration: Duration, sample_rate: u32) -> Result<Self> {
        if sample_rate == 0 {
            return Err(Error::bad_parameter("sample rate must be positive".to_owned()));
        }
        let segment_samples =
            (segment_duration.as_secs_f64() * f64::from(sample_rate)).round() as usize;
        Ok(Self {
            reader: Some(reader),
            segment_duration,
            segment_samples,
            sample_rate,
            emitted_segments: 0,
            decoded_samples: 0,
            reported_duration: None,
        })
    }

    /// Decode the stream, invoking `on_segment(timestamp, samples)` for each
    /// segment. Consumes the underlying reader; a segmenter decodes once.
    ///
    /// Cancellation is checked between packets and before each emission; a
    /// tripped token or a callback error aborts the decode.
    pub fn decode(
        &mut self,
        cancel: &CancelToken,
        mut on_segment: impl FnMut(Duration, &[f32]) -> Result<()>,
    ) -> Result<()> {
        let reader = self
            .reader
            .take()
            .ok_or_else(|| Error::bad_parameter("segmenter already consumed".to_owned()))?;

        let (mut format, track) = open_stream(reader).map_err(media_error)?;
        self.reported_duration = track_duration(&track);

        let mut decoder = decoder_for_track(&track).map_err(media_error)?;
        let mut pipeline = AudioPipeline::new(self.sample_rate);
        let mut buf: Vec<f32> = Vec::with_capacity(self.segment_samples.max(1024));

        loop {
            if cancel.is_cancelled() {
                return Err(Error::RunAborted);
            }
            let Some(packet) = next_packet(&mut format).map_err(media_error)? else {
                break;
            };
            if packet.track_id() != track.id {
                continue;
            }

            decode_packet(&mut decoder, &packet, |decoded| {
                pipeline.push(&decoded, |samples| {
                    buf.extend_from_slice(samples);
                    Ok(())
                })
            })
            .map_err(media_error)?;

            self.flush_full(&mut buf, cancel, &mut on_segment)?;
        }

        pipeline
            .finish(|samples| {
                buf.extend_from_slice(samples);
                Ok(())
            })
            .map_err(media_error)?;
        self.flush_full(&mut buf, cancel, &mut on_segment)?;

        if self.segment_samples == 0 {
            // Whole-file mode: one callback carrying everything decoded.
            if !buf.is_empty() {
                self.decoded_samples += buf.len() as u64;
                on_segment(Duration::ZERO, &buf)?;
            }
            return Ok(());
        }

        // Trailing partial segment, padded with silence up to size.
        if !buf.is_empty() {
            if cancel.is_cancelled() {
                return Err(Error::RunAborted);
            }
            self.decoded_samples += buf.len() as u64;
            buf.resize(self.segment_samples, 0.0);
            let ts = self.segment_timestamp();
            on_segment(ts, &buf)?;
            self.emitted_segments += 1;
        }

        Ok(())
    }

    /// Decoder-reported duration when the container knows it, otherwise the
    /// running total of decoded samples.
    pub fn duration(&self) -> Duration {
        match self.reported_duration {
            Some(secs) => Duration::from_secs_f64(secs),
            None => Duration::from_secs_f64(
                self.decoded_samples as f64 / f64::from(self.sample_rate),
            ),
        }
    }

    fn flush_full(
        &mut self,
        buf: &mut Vec<f32>,
        cancel: &CancelToken,
        on_segment: &mut impl FnMut(Duration, &[f32]) -> Result<()>,
    ) -> Result<()> {
        if self.segment_samples == 0 {
            return Ok(());
        }
        while buf.len() >= self.segment_samples {
            if cancel.is_cancelled() {
                return Err(Error::RunAborted);
            }
            let ts = self.segment_timestamp();
            on_segment(ts, &buf[..self.segment_samples])?;
            buf.drain(..self.segment_samples);
            self.emitted_segments += 1;
            self.decoded_samples += self.segment_samples as u64;
        }
        Ok(())
    }

    fn segment_timestamp(&self) -> Duration {
        self.segment_duration * self.emitted_segments
    }
}

fn media_error(err: anyhow::Error) -> Error {
    Error::BadParameter(format!("{err:#}"))
}
