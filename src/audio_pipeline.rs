//! PCM normalisation: decoded buffers in, mono `f32` at the target sample
//! rate out.
//!
//! Handles the interleave copy, channel downmix and (when the source rate
//! differs from the target) rubato resampling. Emission is un-chunked; the
//! segmenter downstream owns buffering policy.

use anyhow::{Context, Result, anyhow, bail};
use rubato::{Resampler, SincFixedIn, WindowFunction};
use symphonia::core::audio::{AudioBufferRef, SampleBuffer};

/// Source frames fed to rubato per `process()` call.
const RESAMPLE_BLOCK: usize = 2048;

pub(crate) struct AudioPipeline {
    target_rate: u32,

    // Scratch buffer for the interleaved copy out of Symphonia.
    interleaved: Option<SampleBuffer<f32>>,

    // Lazily built; only needed when the source rate differs from target.
    resampler: Option<SincFixedIn<f32>>,

    // Mono source samples waiting for a full rubato input block.
    pending: Vec<f32>,

    // Reusable channel buffers for rubato input/output.
    resample_in: Vec<f32>,
    resample_out: Vec<f32>,
}

impl AudioPipeline {
    pub(crate) fn new(target_rate: u32) -> Self {
        Self {
            target_rate,
            interleaved: None,
            resampler: None,
            pending: Vec::new(),
            resample_in: Vec::new(),
            resample_out: Vec::new(),
        }
    }

    /// Push one decoded buffer through downmix and resampling, emitting mono
    /// samples at the target rate.
    pub(crate) fn push(
        &mut self,
        decoded: &AudioBufferRef<'_>,
        mut emit: impl FnMut(&[f32]) -> Result<()>,
    ) -> Result<()> {
        let (mono, source_rate) = self.downmix(decoded)?;

        if source_rate == self.target_rate {
            if !mono.is_empty() {
                return emit(&mono);
            }
            return Ok(());
        }

        self.ensure_resampler(source_rate)?;
        self.pending.extend_from_slice(&mono);

        while self.pending.len() >= RESAMPLE_BLOCK {
            let block: Vec<f32> = self.pending.drain(..RESAMPLE_BLOCK).collect();
            let out = self.resample_block(&block)?;
            if !out.is_empty() {
                emit(out)?;
            }
        }
        Ok(())
    }

    /// Flush whatever the resampler is still holding. A no-op when the
    /// source never needed resampling.
    pub(crate) fn finish(&mut self, mut emit: impl FnMut(&[f32]) -> Result<()>) -> Result<()> {
        if self.resampler.is_none() || self.pending.is_empty() {
            return Ok(());
        }

        // rubato wants exact block sizes; zero-pad the remainder.
        let rem = self.pending.len() % RESAMPLE_BLOCK;
        if rem != 0 {
            self.pending
                .resize(self.pending.len() + (RESAMPLE_BLOCK - rem), 0.0);
        }

        while !self.pending.is_empty() {
            let block: Vec<f32> = self.pending.drain(..RESAMPLE_BLOCK).collect();
            let out = self.resample_block(&block)?;
            if !out.is_empty() {
                emit(out)?;
            }
        }
        Ok(())
    }

    /// Copy a decoded buffer out of Symphonia and average it down to mono.
    fn downmix(&mut self, decoded: &AudioBufferRef<'_>) -> Result<(Vec<f32>, u32)> {
        let spec = *decoded.spec();
        let channels = spec.channels.count();
        if channels == 0 {
            bail!("decoded audio had zero channels");
        }

        if self.interleaved.is_none() {
            let capacity = decoded.capacity() as u64;
            self.interleaved = Some(SampleBuffer::<f32>::new(capacity, spec));
        }
        let buf = self
            .interleaved
            .as_mut()
            .ok_or_else(|| anyhow!("sample buffer not initialised"))?;
        buf.copy_interleaved_ref(decoded.clone());
        let samples = buf.samples();

        if channels == 1 {
            return Ok((samples.to_vec(), spec.rate));
        }

        let frames = samples.len() / channels;
        let mut mono = Vec::with_capacity(frames);
        for frame in 0..frames {
            let base = frame * channels;
            let sum: f32 = samples[base..base + channels].iter().sum();
            mono.push(sum / channels as f32);
        }
        Ok((mono, spec.rate))
    }

    fn ensure_resampler(&mut self, source_rate: u32) -> Result<()> {
        if self.resampler.is_some() {
            return Ok(());
        }

        let resampler = SincFixedIn::<f32>::new(
            f64::from(self.target_rate) / f64::from(source_rate),
            2.0,
            rubato::SincInterpolationParameters {
                sinc_len: 256,
                f_cutoff: 0.95,
                interpolation: rubato::SincInterpolationType::Linear,
                oversampling_factor: 256,
                window: WindowFunction::BlackmanHarris2,
            },
            RESAMPLE_BLOCK,
            1,
        )
        .map_err(|err| anyhow!(err))
        .context("failed to init resampler")?;

        self.resampler = Some(resampler);
        Ok(())
    }

    /// Resample one mono block; the returned slice is valid until the next
    /// call.
    fn resample_block(&mut self, block: &[f32]) -> Result<&[f32]> {
        let resampler = self
            .resampler
            .as_mut()
            .ok_or_else(|| anyhow!("resampler not initialised"))?;

        self.resample_in.clear();
        self.resample_in.extend_from_slice(block);

        let input = vec![self.resample_in.clone()];
        let mut output = resampler
            .process(&input, None)
            .map_err(|err| anyhow!(err))
            .context("resampler process failed")?;

        if output.len() != 1 {
            bail!("expected mono output from resampler");
        }
        self.resample_out = output.remove(0);
        Ok(&self.resample_out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_without_resampler_is_a_noop() -> anyhow::Result<()> {
        let mut pipeline = AudioPipeline::new(16_000);
        pipeline.finish(|_| panic!("nothing to emit"))?;
        Ok(())
    }

    #[test]
    fn resample_path_emits_and_finish_flushes_the_tail() -> anyhow::Result<()> {
        let mut pipeline = AudioPipeline::new(16_000);
        pipeline.ensure_resampler(8_000)?;
        pipeline.ensure_resampler(8_000)?; // idempotent

        // Two full blocks plus a remainder that only `finish` drains.
        pipeline.pending = vec![0.25; RESAMPLE_BLOCK * 2 + 7];

        let mut emitted = 0usize;
        while pipeline.pending.len() >= RESAMPLE_BLOCK {
            let block: Vec<f32> = pipeline.pending.drain(..RESAMPLE_BLOCK).collect();
            emitted += pipeline.resample_block(&block)?.len();
        }
        assert!(pipeline.pending.len() < RESAMPLE_BLOCK);

        pipeline.finish(|chunk| {
            emitted += chunk.len();
            Ok(())
        })?;

        // 8k -> 16k roughly doubles the sample count.
        assert!(emitted > RESAMPLE_BLOCK * 3);
        Ok(())
    }

    #[test]
    fn resample_block_requires_initialisation() {
        let mut pipeline = AudioPipeline::new(16_000);
        let err = pipeline.resample_block(&[0.0; 8]).unwrap_err();
        assert!(err.to_string().contains("not initialised"));
    }
}
