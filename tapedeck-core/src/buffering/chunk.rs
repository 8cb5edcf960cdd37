//! Sample buffer types shared by both pipelines.
//!
//! Samples exist in two forms: `f32` in `[-1.0, 1.0]` while live (device
//! frames, decoded playback buffers) and `i16` once persisted. A buffer is
//! owned by exactly one pipeline stage at a time — the accumulator while
//! filling, the store after commit, the decode lane while decoding.

/// A contiguous block of mono f32 samples at a known sample rate.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    /// Mono f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz (e.g. 44100, 48000).
    pub sample_rate: u32,
}

impl SampleBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Returns the duration of this buffer in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Convert live f32 samples to 16-bit storage form, clamping to full scale.
pub fn f32_to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16)
        .collect()
}

/// Convert 16-bit storage samples back to live f32 form.
pub fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_from_rate() {
        let buf = SampleBuffer::new(vec![0.0; 44_100], 44_100);
        assert_eq!(buf.duration_secs(), 1.0);
    }

    #[test]
    fn i16_conversion_clamps_out_of_range() {
        let pcm = f32_to_i16(&[2.0, -2.0, 0.0]);
        assert_eq!(pcm, vec![i16::MAX, -i16::MAX, 0]);
    }

    #[test]
    fn i16_round_trip_is_close() {
        let samples = vec![0.5f32, -0.25, 0.0, 0.99];
        let back = i16_to_f32(&f32_to_i16(&samples));
        for (a, b) in samples.iter().zip(back.iter()) {
            assert!((a - b).abs() < 1.0 / 16_384.0, "{a} vs {b}");
        }
    }
}
