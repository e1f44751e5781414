//! Raw audio decoding.
//!
//! The host ships audio in one fixed container: a 44-byte header followed
//! by 16 kHz mono s16le PCM. Decoding skips the header, so a payload that
//! is empty or header-only is an empty waveform — not an error — and the
//! recognize path short-circuits on it without touching any backend.

pub mod segment;

/// Fixed waveform sample rate in Hz.
pub const SAMPLE_RATE: u32 = 16_000;

/// Constant container header size skipped by the decoder.
const HEADER_LEN: usize = 44;

/// Decodes the raw payload into normalized mono f32 samples in [-1, 1].
///
/// An odd trailing byte (truncated final sample) is ignored.
pub fn decode_waveform(bytes: &[u8]) -> Vec<f32> {
    if bytes.len() <= HEADER_LEN {
        return Vec::new();
    }

    bytes[HEADER_LEN..]
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32_768.0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn with_header(pcm: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0u8; HEADER_LEN];
        bytes.extend_from_slice(pcm);
        bytes
    }

    #[test]
    fn empty_and_header_only_payloads_yield_empty_waveforms() {
        assert!(decode_waveform(&[]).is_empty());
        assert!(decode_waveform(&vec![0u8; HEADER_LEN]).is_empty());
        assert!(decode_waveform(&vec![0u8; HEADER_LEN - 3]).is_empty());
    }

    #[test]
    fn samples_are_scaled_to_unit_range() {
        let pcm: Vec<u8> = [0i16, 16_384, -16_384, 32_767, -32_768]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let samples = decode_waveform(&with_header(&pcm));

        assert_eq!(samples.len(), 5);
        assert_relative_eq!(samples[0], 0.0);
        assert_relative_eq!(samples[1], 0.5);
        assert_relative_eq!(samples[2], -0.5);
        assert_relative_eq!(samples[3], 32_767.0 / 32_768.0);
        assert_relative_eq!(samples[4], -1.0);
    }

    #[test]
    fn odd_trailing_byte_is_dropped() {
        let mut payload = with_header(&1000i16.to_le_bytes());
        payload.push(0x7f);
        let samples = decode_waveform(&payload);
        assert_eq!(samples.len(), 1);
    }
}
