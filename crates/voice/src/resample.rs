//! Linear-interpolation resampling of raw 16-bit little-endian PCM.

use crate::error::VoiceError;

/// Capture-side rate expected by speech-to-text input.
pub const STT_SAMPLE_RATE: u32 = 16_000;

/// Playback-side rate produced by text-to-speech output.
pub const TTS_SAMPLE_RATE: u32 = 24_000;

/// Resample a PCM buffer from `from_hz` to `to_hz`.
///
/// Equal rates return a bytewise copy. The output holds
/// `⌊samples · to_hz / from_hz⌋` samples. Odd-length input and
/// non-positive rates are rejected.
pub fn resample(input: &[u8], from_hz: u32, to_hz: u32) -> Result<Vec<u8>, VoiceError> {
    if from_hz == 0 {
        return Err(VoiceError::Validation {
            field: "from_hz",
            message: "must be positive".to_string(),
        });
    }
    if to_hz == 0 {
        return Err(VoiceError::Validation {
            field: "to_hz",
            message: "must be positive".to_string(),
        });
    }
    if input.len() % 2 != 0 {
        return Err(VoiceError::Validation {
            field: "input",
            message: format!("expected 16-bit samples, got {} bytes", input.len()),
        });
    }

    if from_hz == to_hz {
        return Ok(input.to_vec());
    }

    let samples: Vec<i16> = input
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    if samples.is_empty() {
        return Ok(Vec::new());
    }

    let out_len = (samples.len() as u64 * u64::from(to_hz) / u64::from(from_hz)) as usize;
    let ratio = f64::from(from_hz) / f64::from(to_hz);

    let mut out = Vec::with_capacity(out_len * 2);
    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let base = pos.floor() as usize;
        let frac = pos - base as f64;
        let s0 = f64::from(samples[base.min(samples.len() - 1)]);
        let s1 = f64::from(samples[(base + 1).min(samples.len() - 1)]);
        let value = (s0 + (s1 - s0) * frac).round() as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn equal_rates_return_a_bytewise_copy() {
        let input = pcm(&[1, -2, 3, -4]);
        assert_eq!(resample(&input, 16_000, 16_000).unwrap(), input);
    }

    #[test]
    fn output_length_follows_the_rate_ratio() {
        let input = pcm(&[0; 160]); // 10 ms at 16 kHz
        let out = resample(&input, 16_000, 24_000).unwrap();
        assert_eq!(out.len(), 160 * 24_000 / 16_000 * 2);

        let down = resample(&input, 16_000, 8_000).unwrap();
        assert_eq!(down.len(), 160 * 8_000 / 16_000 * 2);
    }

    #[test]
    fn upsampling_interpolates_between_neighbours() {
        let input = pcm(&[0, 1000]);
        let out = resample(&input, 8_000, 16_000).unwrap();
        let samples: Vec<i16> = out
            .chunks_exact(2)
            .map(|p| i16::from_le_bytes([p[0], p[1]]))
            .collect();
        assert_eq!(samples, vec![0, 500, 1000, 1000]);
    }

    #[test]
    fn rejects_odd_length_and_zero_rates() {
        assert!(matches!(
            resample(&[0], 16_000, 8_000),
            Err(VoiceError::Validation { field: "input", .. })
        ));
        assert!(matches!(
            resample(&[], 0, 8_000),
            Err(VoiceError::Validation { field: "from_hz", .. })
        ));
        assert!(matches!(
            resample(&[], 8_000, 0),
            Err(VoiceError::Validation { field: "to_hz", .. })
        ));
    }

    #[test]
    fn empty_input_resamples_to_empty() {
        assert!(resample(&[], 16_000, 24_000).unwrap().is_empty());
    }
}
