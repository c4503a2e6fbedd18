use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Linearly quantize float samples to signed 16-bit PCM.
///
/// Negative samples scale by 32768 and positive by 32767 so that both ends of
/// [-1, 1] map onto the full i16 range. Out-of-range input is clamped.
#[must_use]
pub fn quantize(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| {
            let clamped = if s.is_nan() { 0.0 } else { s.clamp(-1.0, 1.0) };
            if clamped < 0.0 {
                (clamped * 32768.0) as i16
            } else {
                (clamped * 32767.0) as i16
            }
        })
        .collect()
}

/// Reinterpret PCM samples as little-endian bytes.
#[must_use]
pub fn pcm_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Encode one capture frame for the text-framed transport.
#[must_use]
pub fn encode_frame(frame: &[f32]) -> String {
    STANDARD.encode(pcm_bytes(&quantize(frame)))
}
