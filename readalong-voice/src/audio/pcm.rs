//! PCM16 sample conversions shared by capture, playback and the relay

use base64::{Engine, engine::general_purpose::STANDARD};

use crate::audio::error::{AudioError, AudioResult};

/// Bytes per PCM16 mono sample
pub const BYTES_PER_SAMPLE: usize = 2;

/// Level reported for silence or an empty frame
pub const SILENCE_DBFS: f32 = -100.0;

/// Convert f32 samples (-1.0..=1.0) to i16, clamping out-of-range values
pub fn f32_to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&sample| (sample.clamp(-1.0, 1.0) * 32767.0) as i16)
        .collect()
}

/// Convert i16 samples back to f32
pub fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Little-endian byte encoding of PCM16 samples
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for &sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Decode little-endian PCM16 bytes; a trailing odd byte is ignored
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_base64(payload: &str) -> AudioResult<Vec<u8>> {
    STANDARD
        .decode(payload)
        .map_err(|e| AudioError::InvalidPayload(e.to_string()))
}

/// Base64 of the little-endian bytes of `samples`
pub fn encode_samples(samples: &[i16]) -> String {
    encode_base64(&samples_to_bytes(samples))
}

/// RMS level of `samples` in dBFS, floored at [`SILENCE_DBFS`]
pub fn level_dbfs(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return SILENCE_DBFS;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&s| {
            let normalized = s as f64 / 32768.0;
            normalized * normalized
        })
        .sum();
    let rms = (sum_squares / samples.len() as f64).sqrt();

    if rms <= 0.0 {
        return SILENCE_DBFS;
    }
    ((20.0 * rms.log10()) as f32).max(SILENCE_DBFS)
}

/// Playback duration of `byte_len` bytes of PCM16 mono at `sample_rate`
pub fn duration_ms(byte_len: usize, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    let samples = (byte_len / BYTES_PER_SAMPLE) as u64;
    samples * 1000 / sample_rate as u64
}

/// Samples in a frame of `frame_ms` at `sample_rate`
pub fn samples_per_frame(sample_rate: u32, frame_ms: u32) -> usize {
    (sample_rate as u64 * frame_ms as u64 / 1000) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f32_to_i16_clamps() {
        let samples = f32_to_i16(&[-2.0, -1.0, 0.0, 0.5, 1.0, 1.5]);
        assert_eq!(samples, vec![-32767, -32767, 0, 16383, 32767, 32767]);
    }

    #[test]
    fn test_samples_to_bytes_little_endian() {
        let bytes = samples_to_bytes(&[0x1234, -1]);
        assert_eq!(bytes, vec![0x34, 0x12, 0xFF, 0xFF]);
        assert_eq!(bytes_to_samples(&bytes), vec![0x1234, -1]);
    }

    #[test]
    fn test_bytes_to_samples_ignores_trailing_byte() {
        assert_eq!(bytes_to_samples(&[0x01, 0x00, 0x7F]), vec![1]);
    }

    #[test]
    fn test_decode_base64_rejects_garbage() {
        assert!(matches!(
            decode_base64("not base64!"),
            Err(AudioError::InvalidPayload(_))
        ));
        assert_eq!(decode_base64(&encode_base64(&[1, 2, 3])).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_level_dbfs() {
        assert_eq!(level_dbfs(&[]), SILENCE_DBFS);
        assert_eq!(level_dbfs(&[0; 480]), SILENCE_DBFS);

        let full_scale = vec![i16::MIN; 480];
        assert!(level_dbfs(&full_scale).abs() < 0.01);

        let half = vec![16384; 480];
        assert!((level_dbfs(&half) + 6.02).abs() < 0.05);
    }

    #[test]
    fn test_duration_ms() {
        assert_eq!(duration_ms(48_000, 24_000), 1000);
        assert_eq!(duration_ms(1_920, 24_000), 40);
        assert_eq!(duration_ms(100, 0), 0);
        assert_eq!(samples_per_frame(24_000, 40), 960);
    }
}
