//! Codec-level decode helpers over Symphonia.

use anyhow::{Context, Result, anyhow};
use symphonia::core::audio::AudioBufferRef;
use symphonia::core::codecs::{Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{Packet, Track};

/// Build a decoder for the selected audio track from the default registry.
pub(crate) fn decoder_for_track(track: &Track) -> Result<Box<dyn Decoder>> {
    symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|err| anyhow!(err))
        .context("failed to create decoder for audio track")
}

/// Decode one packet and hand the PCM buffer to `on_decoded`.
///
/// Error policy, chosen for streaming inputs:
/// - a corrupt frame is skipped (`Ok(false)`), decoding continues
/// - an I/O error mid-decode counts as end-of-stream (`Ok(false)`)
/// - anything else is fatal
pub(crate) fn decode_packet(
    decoder: &mut Box<dyn Decoder>,
    packet: &Packet,
    mut on_decoded: impl FnMut(AudioBufferRef<'_>) -> Result<()>,
) -> Result<bool> {
    match decoder.decode(packet) {
        Ok(buffer) => {
            on_decoded(buffer)?;
            Ok(true)
        }
        Err(SymphoniaError::DecodeError(_)) => Ok(false),
        Err(SymphoniaError::IoError(_)) => Ok(false),
        Err(err) => Err(anyhow!(err)).context("decoder failure"),
    }
}
