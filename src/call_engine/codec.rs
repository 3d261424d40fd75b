//! G.711 µ-law und Sample-Hilfsfunktionen
//!
//! PCMU (payload type 0) ist in jedem WebRTC-Stack vorhanden, auch im Browser.

/// Bias aus G.711
const MULAW_BIAS: i32 = 0x84;

/// Größter kodierbarer Betrag (vor dem Bias)
const MULAW_CLIP: i32 = 32635;

/// Kodiert ein 16-Bit PCM Sample nach µ-law
pub fn linear_to_mulaw(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0x00
    };

    pcm = pcm.min(MULAW_CLIP) + MULAW_BIAS;

    // Position des höchsten gesetzten Bits oberhalb von Bit 7
    let exponent = (31 - ((pcm >> 7).max(1) as u32).leading_zeros()).min(7) as i32;
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;

    !(sign | (exponent << 4) as u8 | mantissa as u8)
}

/// Dekodiert ein µ-law Byte zu 16-Bit PCM
pub fn mulaw_to_linear(byte: u8) -> i16 {
    let byte = !byte;
    let sign = byte & 0x80;
    let exponent = ((byte >> 4) & 0x07) as i32;
    let mantissa = (byte & 0x0F) as i32;

    let magnitude = (((mantissa << 3) + MULAW_BIAS) << exponent) - MULAW_BIAS;

    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Kodiert einen Frame (f32, -1.0..=1.0) nach µ-law
pub fn encode_frame(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .map(|s| linear_to_mulaw((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
        .collect()
}

/// Dekodiert einen µ-law Payload zu f32-Samples
pub fn decode_frame(payload: &[u8]) -> Vec<f32> {
    payload
        .iter()
        .map(|b| mulaw_to_linear(*b) as f32 / 32768.0)
        .collect()
}

/// Mittelt interleaved Kanäle zu Mono
pub fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// RMS-Pegel, begrenzt auf 1.0
pub fn rms_level(data: &[f32]) -> f32 {
    if data.is_empty() {
        return 0.0;
    }
    let rms = (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32).sqrt();
    rms.min(1.0)
}

// ============================================================================
// RESAMPLER
// ============================================================================

/// Linearer Resampler mit Zustand über Callback-Grenzen hinweg
///
/// `push` für Quellen, die Blöcke liefern (Mikrofon), `pull` für Senken,
/// die eine feste Anzahl Samples brauchen (Lautsprecher).
#[derive(Debug, Clone)]
pub struct LinearResampler {
    step: f64,
    phase: f64,
    prev: f32,
    next: f32,
}

impl LinearResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            step: from_rate as f64 / to_rate.max(1) as f64,
            phase: 0.0,
            prev: 0.0,
            next: 0.0,
        }
    }

    /// Verarbeitet einen Block Eingabe-Samples
    pub fn push(&mut self, input: &[f32], mut emit: impl FnMut(f32)) {
        for &sample in input {
            self.prev = self.next;
            self.next = sample;
            while self.phase < 1.0 {
                emit(self.prev + (self.next - self.prev) * self.phase as f32);
                self.phase += self.step;
            }
            self.phase -= 1.0;
        }
    }

    /// Liefert ein Ausgabe-Sample und liest bei Bedarf aus `source`
    pub fn pull(&mut self, mut source: impl FnMut() -> f32) -> f32 {
        while self.phase >= 1.0 {
            self.prev = self.next;
            self.next = source();
            self.phase -= 1.0;
        }
        let out = self.prev + (self.next - self.prev) * self.phase as f32;
        self.phase += self.step;
        out
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mulaw_silence() {
        assert_eq!(linear_to_mulaw(0), 0xFF);
        assert_eq!(mulaw_to_linear(0xFF), 0);
    }

    #[test]
    fn test_mulaw_known_values() {
        // Referenzwerte aus G.711
        assert_eq!(linear_to_mulaw(i16::MAX), 0x80);
        assert_eq!(linear_to_mulaw(i16::MIN + 1), 0x00);
        assert_eq!(mulaw_to_linear(0x80), 32124);
        assert_eq!(mulaw_to_linear(0x00), -32124);
    }

    #[test]
    fn test_mulaw_is_symmetric() {
        for sample in [1i16, 100, 1000, 5000, 20000] {
            let pos = mulaw_to_linear(linear_to_mulaw(sample));
            let neg = mulaw_to_linear(linear_to_mulaw(-sample));
            assert_eq!(pos, -neg);
        }
    }

    #[test]
    fn test_mulaw_error_is_bounded() {
        for sample in (-32000i16..32000).step_by(97) {
            let decoded = mulaw_to_linear(linear_to_mulaw(sample)) as i32;
            let error = (decoded - sample as i32).abs();
            // Quantisierungsschritt wächst mit dem Betrag
            assert!(error <= (sample as i32).abs() / 16 + 8, "{} -> {}", sample, decoded);
        }
    }

    #[test]
    fn test_frame_codec_keeps_length() {
        let frame: Vec<f32> = (0..160).map(|i| (i as f32 / 160.0) - 0.5).collect();
        let encoded = encode_frame(&frame);
        assert_eq!(encoded.len(), 160);
        let decoded = decode_frame(&encoded);
        assert_eq!(decoded.len(), 160);
        assert!((decoded[0] - frame[0]).abs() < 0.02);
    }

    #[test]
    fn test_downmix_stereo() {
        let mono = downmix(&[0.2, 0.4, -1.0, 1.0], 2);
        assert_eq!(mono.len(), 2);
        assert!((mono[0] - 0.3).abs() < 1e-6);
        assert!(mono[1].abs() < 1e-6);
    }

    #[test]
    fn test_rms_level() {
        assert_eq!(rms_level(&[]), 0.0);
        assert!((rms_level(&[0.5, -0.5, 0.5, -0.5]) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_resampler_downsample_ratio() {
        let mut resampler = LinearResampler::new(48000, 8000);
        let mut out = Vec::new();
        resampler.push(&vec![0.25; 960], |s| out.push(s));
        assert_eq!(out.len(), 160);
    }

    #[test]
    fn test_resampler_pull_upsample() {
        let mut resampler = LinearResampler::new(8000, 48000);
        let mut reads = 0;
        for _ in 0..480 {
            resampler.pull(|| {
                reads += 1;
                1.0
            });
        }
        // 480 / 6, bis auf Rundung der Phase
        assert!((79..=80).contains(&reads), "reads = {}", reads);
    }

    #[test]
    fn test_resampler_same_rate_passthrough() {
        let mut resampler = LinearResampler::new(8000, 8000);
        let mut out = Vec::new();
        resampler.push(&[0.1, 0.2, 0.3], |s| out.push(s));
        // Ein Sample Verzögerung
        assert_eq!(out, vec![0.0, 0.1, 0.2]);
    }
}
