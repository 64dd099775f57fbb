//! WAV-file stand-in for the microphone.
//!
//! Decodes the whole file up front (mono downmix, normalised f32) and then
//! feeds it into the capture ring in real time from a pacing thread, so the
//! rest of the pipeline cannot tell it apart from a live device.

use std::path::Path;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use hound::{SampleFormat, WavReader};
use tracing::{debug, info, warn};

use crate::buffering::{AudioProducer, Producer};
use crate::error::{Result, VoiceError};

/// Samples are released in 20 ms slices.
const PACE_SLICE_MS: u64 = 20;

pub struct WavCapture {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    pub sample_rate: u32,
}

/// Read a WAV file into mono f32 samples. Returns `(samples, sample_rate)`.
pub fn read_wav_mono(path: &Path) -> Result<(Vec<f32>, u32)> {
    let reader = WavReader::open(path)
        .map_err(|e| VoiceError::AudioDevice(format!("open {}: {e}", path.display())))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| VoiceError::AudioStream(e.to_string()))?,
        SampleFormat::Int => {
            let full_scale = (1i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / full_scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| VoiceError::AudioStream(e.to_string()))?
        }
    };

    let mono = interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect();
    Ok((mono, spec.sample_rate))
}

impl WavCapture {
    /// Start feeding `path` into `producer` at real-time pace.
    ///
    /// The thread exits at end of file or when `running` drops.
    pub fn open(path: &Path, mut producer: AudioProducer, running: Arc<AtomicBool>) -> Result<Self> {
        let (samples, sample_rate) = read_wav_mono(path)?;
        info!(
            path = %path.display(),
            sample_rate,
            samples = samples.len(),
            "opening wav capture source"
        );

        let slice = (sample_rate as u64 * PACE_SLICE_MS / 1000).max(1) as usize;
        let thread_running = Arc::clone(&running);
        let thread = std::thread::Builder::new()
            .name("voicedesk-wav".into())
            .spawn(move || {
                let started = Instant::now();
                let mut offset = 0usize;
                while offset < samples.len() && thread_running.load(Ordering::Relaxed) {
                    let end = (offset + slice).min(samples.len());
                    let written = producer.push_slice(&samples[offset..end]);
                    if written < end - offset {
                        warn!("capture ring full: dropped {} wav frames", end - offset - written);
                    }
                    offset = end;

                    let due = Duration::from_secs_f64(offset as f64 / sample_rate as f64);
                    if let Some(wait) = due.checked_sub(started.elapsed()) {
                        std::thread::sleep(wait);
                    }
                }
                debug!(offset, "wav capture source finished");
            })?;

        Ok(Self {
            running,
            thread: Some(thread),
            sample_rate,
        })
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for WavCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
