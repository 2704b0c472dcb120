//! G.711 μ-law companding for 8 kHz RTP audio

const BIAS: i32 = 0x84;
const CLIP: i32 = 32_635;

/// Compress one PCM16 sample
pub fn encode_sample(sample: i16) -> u8 {
    let mut magnitude = i32::from(sample);
    let sign = if magnitude < 0 {
        magnitude = -magnitude;
        0x80
    } else {
        0x00
    };
    magnitude = magnitude.min(CLIP) + BIAS;

    let mut exponent = 7u8;
    let mut mask = 0x4000;
    while exponent > 0 && magnitude & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = ((magnitude >> (exponent + 3)) & 0x0F) as u8;
    !(sign | (exponent << 4) | mantissa)
}

/// Expand one μ-law byte
pub fn decode_sample(byte: u8) -> i16 {
    let byte = !byte;
    let exponent = (byte >> 4) & 0x07;
    let mantissa = i32::from(byte & 0x0F);
    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    if byte & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

pub fn encode(samples: &[i16]) -> Vec<u8> {
    samples.iter().copied().map(encode_sample).collect()
}

pub fn decode(payload: &[u8]) -> Vec<i16> {
    payload.iter().copied().map(decode_sample).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_is_ff() {
        assert_eq!(encode_sample(0), 0xFF);
        assert_eq!(decode_sample(0xFF), 0);
    }

    #[test]
    fn test_sign_is_preserved() {
        for sample in [8, 1000, 12_000] {
            assert_eq!(decode_sample(encode_sample(sample)), -decode_sample(encode_sample(-sample)));
            assert!(decode_sample(encode_sample(-sample)) < 0);
        }
    }

    #[test]
    fn test_quantization_error_grows_with_level() {
        for sample in [-5i16, 100, 1000, -20_000, i16::MAX, i16::MIN] {
            let decoded = i32::from(decode_sample(encode_sample(sample)));
            let error = (decoded - i32::from(sample)).abs();
            assert!(error <= (i32::from(sample).abs() >> 4) + 16, "{sample} -> {decoded}");
        }
    }
}
