use audioadapter_buffers::direct::SequentialSliceOfVecs;
use rubato::audioadapter::Adapter;
use rubato::{Fft, FixedSync, Resampler as RubatoResampler};

use crate::error::{Result, TokiError};

const CHUNK_SIZE: usize = 1024;

/// Converts interleaved multi-channel audio to mono at a target rate.
///
/// Used on the capture side (device rate → 16kHz) and on the render side
/// (clip rate → device rate).
pub struct Resampler {
    inner: Option<Fft<f32>>,
    channels: u16,
    ratio: f64,
    input_buf: Vec<f32>,
    /// Mono frames accepted and resampled frames produced since the last flush.
    consumed: usize,
    emitted: usize,
}

impl Resampler {
    pub fn new(source_rate: u32, target_rate: u32, channels: u16) -> Result<Self> {
        if source_rate == 0 || target_rate == 0 || channels == 0 {
            return Err(TokiError::Resample(format!(
                "invalid resampler shape: {source_rate} Hz -> {target_rate} Hz, {channels} channels"
            )));
        }

        let inner = if source_rate == target_rate {
            None
        } else {
            Some(
                Fft::new(
                    source_rate as usize,
                    target_rate as usize,
                    CHUNK_SIZE,
                    2, // sub_chunks
                    1, // output is always mono
                    FixedSync::Input,
                )
                .map_err(|e| TokiError::Resample(format!("failed to create resampler: {e}")))?,
            )
        };

        Ok(Self {
            inner,
            channels,
            ratio: f64::from(target_rate) / f64::from(source_rate),
            input_buf: Vec::new(),
            consumed: 0,
            emitted: 0,
        })
    }

    /// Process interleaved samples. Input that does not fill a whole
    /// resampler chunk is held until the next call or [`Self::flush`].
    pub fn process(&mut self, interleaved: &[f32]) -> Result<Vec<f32>> {
        let mono = self.downmix(interleaved);

        let Some(resampler) = self.inner.as_mut() else {
            return Ok(mono);
        };

        self.consumed += mono.len();
        self.input_buf.extend_from_slice(&mono);
        let mut output = Vec::new();
        Self::drain_chunks(resampler, &mut self.input_buf, &mut output)?;
        self.emitted += output.len();
        Ok(output)
    }

    /// Push out everything still inside the resampler, including the filter
    /// delay, and start over. The stream's total output is then exactly
    /// `round(consumed * ratio) + output_delay` frames.
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        let Some(resampler) = self.inner.as_mut() else {
            return Ok(Vec::new());
        };

        if self.consumed == 0 {
            return Ok(Vec::new());
        }

        let target =
            (self.consumed as f64 * self.ratio).round() as usize + resampler.output_delay();
        let mut output = Vec::new();
        while self.emitted + output.len() < target {
            let frames_needed = resampler.input_frames_next();
            if self.input_buf.len() < frames_needed {
                self.input_buf.resize(frames_needed, 0.0);
            }
            Self::drain_chunks(resampler, &mut self.input_buf, &mut output)?;
        }
        output.truncate(target.saturating_sub(self.emitted));

        self.input_buf.clear();
        self.consumed = 0;
        self.emitted = 0;
        resampler.reset();
        Ok(output)
    }

    /// Resample a complete clip in one go. The output is aligned with the
    /// input: no leading filter delay, no lost tail.
    pub fn process_all(&mut self, interleaved: &[f32]) -> Result<Vec<f32>> {
        let delay = self.inner.as_ref().map_or(0, |r| r.output_delay());
        let mut output = self.process(interleaved)?;
        output.extend(self.flush()?);
        output.drain(..delay.min(output.len()));
        Ok(output)
    }

    fn downmix(&self, interleaved: &[f32]) -> Vec<f32> {
        if self.channels == 1 {
            return interleaved.to_vec();
        }

        let ch = self.channels as usize;
        interleaved
            .chunks_exact(ch)
            .map(|frame| frame.iter().sum::<f32>() / ch as f32)
            .collect()
    }

    fn drain_chunks(
        resampler: &mut Fft<f32>,
        input_buf: &mut Vec<f32>,
        output: &mut Vec<f32>,
    ) -> Result<()> {
        let mut frames_needed = resampler.input_frames_next();

        while input_buf.len() >= frames_needed {
            let chunk: Vec<f32> = input_buf.drain(..frames_needed).collect();
            // Wrap as 1-channel sequential buffer for rubato 1.0
            let input_data = vec![chunk];
            let adapter = SequentialSliceOfVecs::new(&input_data, 1, frames_needed)
                .map_err(|e| TokiError::Resample(format!("buffer error: {e}")))?;
            let result = resampler
                .process(&adapter, 0, None)
                .map_err(|e| TokiError::Resample(format!("resample error: {e}")))?;
            for frame in 0..result.frames() {
                output.push(result.read_sample(0, frame).unwrap_or(0.0));
            }
            frames_needed = resampler.input_frames_next();
        }

        Ok(())
    }
}
