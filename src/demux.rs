//! Container probing and packet iteration over Symphonia.
//!
//! Isolated from the rest of the audio path so the segmenter only deals
//! with frames: this module picks the audio track and hands out packets,
//! treating I/O errors from unseekable sources as end-of-stream.

use std::io::Read;

use anyhow::{Context, Result, anyhow};
use symphonia::core::codecs::CODEC_TYPE_NULL;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, Packet, Track};
use symphonia::core::io::{MediaSourceStream, MediaSourceStreamOptions, ReadOnlySource};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Probe an unseekable byte stream and select the audio track to decode.
///
/// Track policy: the first track with a real codec and a known sample rate.
/// The sample rate requirement matters downstream, where the resampler needs
/// a source rate to work from.
pub(crate) fn open_stream<R>(reader: R) -> Result<(Box<dyn FormatReader>, Track)>
where
    R: Read + Send + Sync + 'static,
{
    let source = ReadOnlySource::new(reader);
    let stream = MediaSourceStream::new(
        Box::new(source),
        MediaSourceStreamOptions {
            // Symphonia probes best with a generous power-of-two buffer.
            buffer_len: 256 * 1024,
        },
    );

    let probed = symphonia::default::get_probe()
        .format(
            &Hint::new(),
            stream,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|err| anyhow!(err))
        .context("failed to probe media stream")?;

    let format = probed.format;
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL && t.codec_params.sample_rate.is_some())
        .cloned()
        .ok_or_else(|| anyhow!("no audio track found"))?;

    Ok((format, track))
}

/// Duration of a track in seconds, when the container reports one.
pub(crate) fn track_duration(track: &Track) -> Option<f64> {
    let frames = track.codec_params.n_frames?;
    let rate = track.codec_params.sample_rate?;
    Some(frames as f64 / f64::from(rate))
}

/// Next packet, with `Ok(None)` for end-of-stream.
///
/// Unseekable sources report EOF as an I/O error; everything else bubbles
/// up.
pub(crate) fn next_packet(format: &mut Box<dyn FormatReader>) -> Result<Option<Packet>> {
    match format.next_packet() {
        Ok(packet) => Ok(Some(packet)),
        Err(SymphoniaError::IoError(_)) => Ok(None),
        Err(err) => Err(anyhow!(err)).context("failed reading packet"),
    }
}
