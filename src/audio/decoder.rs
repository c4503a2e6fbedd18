use std::io::Cursor;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hound::{SampleFormat, WavReader};

use crate::audio::PLAYBACK_SAMPLE_RATE;
use crate::error::{Result, TokiError};

/// Size of the canonical RIFF/WAVE header written by [`wrap_pcm`].
pub const WAV_HEADER_LEN: usize = 44;

/// Decoded mono audio ready for the render device.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioClip {
    #[must_use]
    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

/// Decode the base64 `data` field of an inbound `audio` message.
pub fn decode_payload(data: &str) -> Result<Vec<u8>> {
    let bytes = STANDARD
        .decode(data.trim())
        .map_err(|e| TokiError::Decode(format!("invalid base64 audio payload: {e}")))?;

    if bytes.is_empty() {
        return Err(TokiError::Decode("empty audio payload".to_string()));
    }

    Ok(bytes)
}

/// Wrap an inbound payload in a self-describing container.
///
/// Raw chunks are 24kHz mono 16-bit PCM and get a synthesized header. A
/// payload that already is a WAV file is passed through untouched.
#[must_use]
pub fn into_container(payload: Vec<u8>) -> Vec<u8> {
    if payload.starts_with(b"RIFF") {
        return payload;
    }
    wrap_pcm(&payload, PLAYBACK_SAMPLE_RATE)
}

/// Prefix raw mono 16-bit little-endian PCM with a minimal WAV header.
///
/// ```text
/// "RIFF" <36 + data_len: u32> "WAVE"
/// "fmt " <16: u32> <1: u16 PCM> <1: u16 channels> <rate: u32>
///        <byte_rate: u32> <block_align: u16> <16: u16 bits>
/// "data" <data_len: u32> <payload>
/// ```
///
/// A trailing odd byte is not a whole sample and is left out.
#[must_use]
pub fn wrap_pcm(pcm: &[u8], sample_rate: u32) -> Vec<u8> {
    const CHANNELS: u16 = 1;
    const BITS_PER_SAMPLE: u16 = 16;

    let pcm = &pcm[..pcm.len() & !1];
    let data_len = pcm.len() as u32;
    let block_align = CHANNELS * BITS_PER_SAMPLE / 8;
    let byte_rate = sample_rate * u32::from(block_align);

    let mut wav = Vec::with_capacity(WAV_HEADER_LEN + pcm.len());
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes());
    wav.extend_from_slice(&CHANNELS.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&BITS_PER_SAMPLE.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(pcm);
    wav
}

/// Decode a WAV container into mono f32 samples, down-mixing if needed.
pub fn decode_clip(container: &[u8]) -> Result<AudioClip> {
    let mut reader = WavReader::new(Cursor::new(container))
        .map_err(|e| TokiError::Decode(format!("unreadable WAV container: {e}")))?;

    let spec = reader.spec();
    if spec.channels == 0 || spec.sample_rate == 0 {
        return Err(TokiError::Decode(format!(
            "degenerate WAV format: {} channels at {} Hz",
            spec.channels, spec.sample_rate
        )));
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map_err(|e| TokiError::Decode(format!("WAV read error: {e}"))))
            .collect::<Result<Vec<f32>>>()?,
        SampleFormat::Int => {
            let scale = (1u64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| {
                    s.map(|v| v as f32 / scale)
                        .map_err(|e| TokiError::Decode(format!("WAV read error: {e}")))
                })
                .collect::<Result<Vec<f32>>>()?
        }
    };

    let channels = usize::from(spec.channels);
    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };

    Ok(AudioClip {
        samples,
        sample_rate: spec.sample_rate,
    })
}
