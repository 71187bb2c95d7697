//! PCM-Codec für den Wire-Austausch
//!
//! Der Dienst erwartet 16-bit PCM (little-endian) und liefert
//! dasselbe Format zurück. Hier wird zwischen normalisierten
//! f32-Samples und den Wire-Bytes konvertiert.

use std::time::Duration;

// ============================================================================
// AUDIO FRAME
// ============================================================================

/// Ein Block normalisierter Mono-Samples mit deklarierter Abtastrate.
/// Einmal erzeugt unveränderlich.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Abspieldauer des Frames
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

// ============================================================================
// PCM16 ENCODE / DECODE
// ============================================================================

/// Kodiert normalisierte f32-Samples zu 16-bit PCM little-endian.
///
/// `i16 = round(clamp(sample, -1, 1) * 32767)`
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Dekodiert 16-bit PCM little-endian zu normalisierten f32-Samples.
///
/// Ein ungerades Rest-Byte wird verworfen.
pub fn decode_pcm16(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| {
            let value = i16::from_le_bytes([pair[0], pair[1]]);
            (value as f32 / 32767.0).clamp(-1.0, 1.0)
        })
        .collect()
}

/// Root-Mean-Square Lautheit über einen Frame
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_roundtrip_quantisierungsfehler() {
        let samples: Vec<f32> = (0..4096)
            .map(|i| (i as f32 * 0.013).sin() * 0.8)
            .collect();

        let encoded = encode_pcm16(&samples);
        assert_eq!(encoded.len(), samples.len() * 2);

        let decoded = decode_pcm16(&encoded);
        assert_eq!(decoded.len(), samples.len());

        // Roundtrip muss innerhalb des 16-bit Quantisierungsfehlers liegen
        for (orig, back) in samples.iter().zip(decoded.iter()) {
            assert!(
                (orig - back).abs() <= 1.0 / 32768.0,
                "Quantisierungsfehler zu groß: {} vs {}",
                orig,
                back
            );
        }
    }

    #[test]
    fn codec_clamp_uebersteuerung() {
        let encoded = encode_pcm16(&[2.0, -2.0]);
        let decoded = decode_pcm16(&encoded);
        assert!((decoded[0] - 1.0).abs() < 1e-4);
        assert!((decoded[1] + 1.0).abs() < 1e-4);
    }

    #[test]
    fn codec_i16_min_wird_geclampt() {
        // -32768 kommt von der Gegenseite vor, darf aber nicht unter -1.0 fallen
        let decoded = decode_pcm16(&i16::MIN.to_le_bytes());
        assert_eq!(decoded.len(), 1);
        assert!(decoded[0] >= -1.0);
    }

    #[test]
    fn codec_ungerades_restbyte_verworfen() {
        let decoded = decode_pcm16(&[0x00, 0x40, 0xff]);
        assert_eq!(decoded.len(), 1);
    }

    #[test]
    fn rms_stille_ist_null() {
        assert_eq!(rms(&[]), 0.0);
        assert_eq!(rms(&[0.0; 128]), 0.0);
    }

    #[test]
    fn rms_konstantes_signal() {
        let value = rms(&[0.5; 256]);
        assert!((value - 0.5).abs() < 1e-6);
    }

    #[test]
    fn frame_duration() {
        let frame = AudioFrame::new(vec![0.0; 4096], 16_000);
        let ms = frame.duration().as_millis();
        assert_eq!(ms, 256);
    }
}
