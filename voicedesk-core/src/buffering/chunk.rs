//! Normalised f32 audio block shared by capture and playback.

/// A contiguous block of PCM samples in [-1.0, 1.0] at a known sample rate.
///
/// Interleaved when `channels > 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub samples: Vec<f32>,
    /// Sample rate in Hz (e.g. 16000, 24000, 48000).
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioChunk {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self::with_channels(samples, sample_rate, 1)
    }

    pub fn with_channels(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels: channels.max(1),
        }
    }

    /// Number of frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    /// Returns the duration of this chunk in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Returns true if the chunk contains no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Average interleaved channels down to mono.
    pub fn to_mono(&self) -> Vec<f32> {
        let ch = self.channels as usize;
        if ch == 1 {
            return self.samples.clone();
        }
        self.samples
            .chunks_exact(ch)
            .map(|frame| frame.iter().sum::<f32>() / ch as f32)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_counts_frames_not_samples() {
        let stereo = AudioChunk::with_channels(vec![0.0; 48_000], 24_000, 2);
        assert_eq!(stereo.frames(), 24_000);
        assert!((stereo.duration_secs() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn to_mono_averages_channels() {
        let stereo = AudioChunk::with_channels(vec![0.5, -0.5, 1.0, 0.0], 24_000, 2);
        assert_eq!(stereo.to_mono(), vec![0.0, 0.5]);
    }
}
