use base64::Engine;

use crate::error::{RealtimeError, RealtimeResult};

/// The one sample rate used at the session boundary, for both transports.
pub const PCM16_SAMPLE_RATE: u32 = 24000;

/// Number of samples in `duration` of mono audio at [`PCM16_SAMPLE_RATE`].
pub fn samples_in(duration: std::time::Duration) -> usize {
    (PCM16_SAMPLE_RATE as u128 * duration.as_millis() / 1000) as usize
}

/// Serializes samples as PCM16 little-endian bytes.
pub fn to_le_bytes(pcm16: &[i16]) -> Vec<u8> {
    pcm16
        .iter()
        .flat_map(|&sample| sample.to_le_bytes())
        .collect()
}

/// Reads PCM16 little-endian bytes. A trailing odd byte is ignored.
pub fn from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

/// Converts a slice of f32 samples to a vector of i16 samples.
pub fn convert_f32_to_i16(pcm32: &[f32]) -> Vec<i16> {
    pcm32
        .iter()
        .map(|&sample| (sample * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

/// Converts a slice of i16 samples to normalized f32 samples in [-1.0, 1.0].
pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16
        .iter()
        .map(|&sample| (sample as f32 / 32768.0).clamp(-1.0, 1.0))
        .collect()
}

/// PCM16 little-endian bytes straight to normalized f32 samples.
pub fn bytes_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|chunk| {
            let v = i16::from_le_bytes([chunk[0], chunk[1]]);
            (v as f32 / 32768.0).clamp(-1.0, 1.0)
        })
        .collect()
}

pub fn encode_bytes(pcm16: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(pcm16)
}

/// Decodes a base64 audio payload received inside a JSON message.
pub fn decode_bytes(base64_fragment: &str) -> RealtimeResult<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(base64_fragment)
        .map_err(|e| RealtimeError::Protocol(format!("invalid base64 audio payload: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::time::Duration;

    #[test]
    fn test_samples_in_window() {
        assert_eq!(samples_in(Duration::from_millis(100)), 2400);
        assert_eq!(samples_in(Duration::from_millis(20)), 480);
        assert_eq!(samples_in(Duration::ZERO), 0);
    }

    #[test]
    fn test_le_byte_layout() {
        // 16384 = 0x4000, -2 = 0xFFFE
        let bytes = to_le_bytes(&[16384, -2]);
        assert_eq!(bytes, vec![0x00, 0x40, 0xFE, 0xFF]);
        assert_eq!(from_le_bytes(&bytes), vec![16384, -2]);

        // Odd trailing byte is dropped.
        assert_eq!(from_le_bytes(&[0x01, 0x00, 0x07]), vec![1]);
    }

    #[test]
    fn test_bytes_to_f32() {
        let result = bytes_to_f32(&[0x00, 0x40, 0x00, 0x80]); // [16384, -32768]
        assert_eq!(result.len(), 2);
        assert_abs_diff_eq!(result[0], 0.5, epsilon = 0.0001);
        assert_abs_diff_eq!(result[1], -1.0, epsilon = 0.0001);

        assert!(bytes_to_f32(&[]).is_empty());
        assert!(bytes_to_f32(&[0x00]).is_empty());
    }

    #[test]
    fn test_convert_f32_to_i16() {
        let input = vec![1.0f32, -1.0f32, 0.0f32, 0.5f32];
        let result = convert_f32_to_i16(&input);

        assert_eq!(result[0], i16::MAX);
        // -1.0 * 32767 = -32767, not i16::MIN (-32768)
        assert_eq!(result[1], -32767);
        assert_eq!(result[2], 0);
        assert_eq!(result[3], (0.5 * i16::MAX as f32) as i16);

        let clamped = convert_f32_to_i16(&[2.0, -2.0]);
        assert_eq!(clamped, vec![i16::MAX, i16::MIN]);
    }

    #[test]
    fn test_convert_i16_to_f32_stays_normalized() {
        let result = convert_i16_to_f32(&[i16::MAX, i16::MIN, 0, 16384]);
        assert_abs_diff_eq!(result[0], i16::MAX as f32 / 32768.0, epsilon = 0.0001);
        assert_abs_diff_eq!(result[1], -1.0, epsilon = 0.0001);
        assert_abs_diff_eq!(result[2], 0.0, epsilon = 0.0001);
        assert_abs_diff_eq!(result[3], 0.5, epsilon = 0.0001);
        assert!(result.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn test_base64_payloads() {
        let encoded = encode_bytes(&to_le_bytes(&[256, -256, 0]));
        let decoded = decode_bytes(&encoded).unwrap();
        assert_eq!(from_le_bytes(&decoded), vec![256, -256, 0]);

        assert!(matches!(
            decode_bytes("invalid_base64!"),
            Err(RealtimeError::Protocol(_))
        ));
        assert!(decode_bytes("").unwrap().is_empty());
    }
}
