//! Host audio devices via the cpal backend.
//!
//! # Design constraints
//!
//! cpal callbacks run on an OS audio thread at elevated priority. They
//! **must not** allocate, block on a mutex, or perform I/O. Capture writes
//! into an SPSC ring producer; playback reads from one (see [`output`]).
//! Stream errors leave the callback thread through a bounded
//! `crossbeam-channel` with `try_send`, so a slow reader never stalls audio.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). Streams are therefore created and dropped on one dedicated thread;
//! only `Send` handles (ring halves, atomics) cross into async code.

pub mod device;
pub mod file;
pub mod output;
pub mod resample;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    SampleRate, SizedSample, Stream, StreamConfig,
};

use crate::{
    buffering::{AudioProducer, Producer},
    error::{Result, VoiceError},
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{info, warn};

/// Capacity of the device-fault channel. Faults beyond this are dropped.
pub const FAULT_CHANNEL_CAP: usize = 16;

/// Which side of the host audio a fault came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    Input,
    Output,
}

/// A stream error reported by a cpal callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFault {
    pub direction: StreamDirection,
    pub message: String,
    /// The device went away; the stream will not recover.
    pub fatal: bool,
}

pub type FaultSender = crossbeam_channel::Sender<DeviceFault>;
pub type FaultReceiver = crossbeam_channel::Receiver<DeviceFault>;

pub fn fault_channel() -> (FaultSender, FaultReceiver) {
    crossbeam_channel::bounded(FAULT_CHANNEL_CAP)
}

#[cfg(feature = "audio-cpal")]
pub(crate) fn report_stream_error(
    faults: &Option<FaultSender>,
    direction: StreamDirection,
    err: cpal::StreamError,
) {
    tracing::error!(?direction, "audio stream error: {err}");
    if let Some(tx) = faults {
        let fatal = matches!(err, cpal::StreamError::DeviceNotAvailable);
        let _ = tx.try_send(DeviceFault {
            direction,
            message: err.to_string(),
            fatal,
        });
    }
}

/// Handle to an active microphone stream.
///
/// **Not `Send`**: `cpal::Stream` is bound to its creation thread on Windows/macOS.
/// Create and drop this type on the same OS thread.
pub struct AudioCapture {
    /// Kept alive so the stream is not dropped prematurely.
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    /// Shared flag; set to `false` to signal the callback to no-op.
    running: Arc<AtomicBool>,
    /// Actual capture sample rate reported by the device (Hz).
    pub sample_rate: u32,
}

impl AudioCapture {
    /// Open an input device by preferred name, otherwise fall back to the
    /// default input device and then the first available one.
    ///
    /// Pushes mono f32 samples at the device rate into `producer`.
    ///
    /// # Errors
    /// `VoiceError::NoDefaultInputDevice` when no microphone is available,
    /// `VoiceError::AudioDevice` / `AudioStream` when cpal refuses the device
    /// (including a denied permission prompt).
    #[cfg(feature = "audio-cpal")]
    pub fn open_with_preference(
        producer: AudioProducer,
        running: Arc<AtomicBool>,
        preferred_device_name: Option<&str>,
        faults: Option<FaultSender>,
    ) -> Result<Self> {
        use cpal::traits::HostTrait;

        let host = cpal::default_host();
        let preferred = match preferred_device_name {
            Some(name) => match host.input_devices() {
                Ok(mut devices) => {
                    let found = devices.find(|d| d.name().map(|n| n == name).unwrap_or(false));
                    if found.is_none() {
                        warn!("preferred input device '{}' not found, falling back", name);
                    }
                    found
                }
                Err(e) => {
                    warn!("failed to list input devices while resolving preference: {e}");
                    None
                }
            },
            None => None,
        };

        let device = match preferred.or_else(|| host.default_input_device()) {
            Some(device) => device,
            None => {
                let mut devices = host
                    .input_devices()
                    .map_err(|e| VoiceError::AudioDevice(e.to_string()))?;
                let fallback = devices.next().ok_or(VoiceError::NoDefaultInputDevice)?;
                warn!("no default input device, falling back to first available input");
                fallback
            }
        };

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = device
            .default_input_config()
            .map_err(|e| VoiceError::AudioDevice(e.to_string()))?;

        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        info!(sample_rate, channels, "capture config selected");

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => build_input::<f32>(
                &device, &config, producer, Arc::clone(&running), faults, |s| s,
            ),
            cpal::SampleFormat::I16 => build_input::<i16>(
                &device,
                &config,
                producer,
                Arc::clone(&running),
                faults,
                |s| s as f32 / 32768.0,
            ),
            cpal::SampleFormat::U8 => build_input::<u8>(
                &device,
                &config,
                producer,
                Arc::clone(&running),
                faults,
                |s| (s as f32 - 128.0) / 128.0,
            ),
            fmt => {
                return Err(VoiceError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }?;

        stream
            .play()
            .map_err(|e| VoiceError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            running,
            sample_rate,
        })
    }

    /// Open the system default microphone.
    ///
    /// Must be called from the thread that will also drop this value.
    #[cfg(feature = "audio-cpal")]
    pub fn open_default(producer: AudioProducer, running: Arc<AtomicBool>) -> Result<Self> {
        Self::open_with_preference(producer, running, None, None)
    }

    /// Stop: signal the callback to no-op on its next invocation.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Build a mono-downmixing input stream for sample type `T`.
#[cfg(feature = "audio-cpal")]
fn build_input<T: SizedSample + Send + 'static>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: AudioProducer,
    running: Arc<AtomicBool>,
    faults: Option<FaultSender>,
    to_f32: fn(T) -> f32,
) -> Result<Stream> {
    let ch = config.channels.max(1) as usize;
    // Sized once for the common callback size; resize only grows it.
    let mut mix_buf: Vec<f32> = Vec::with_capacity(4096);

    device
        .build_input_stream(
            config,
            move |data: &[T], _info| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                let frames = data.len() / ch;
                mix_buf.resize(frames, 0.0);
                for (f, out) in mix_buf.iter_mut().enumerate() {
                    let base = f * ch;
                    let sum: f32 = data[base..base + ch].iter().map(|s| to_f32(*s)).sum();
                    *out = sum / ch as f32;
                }
                let written = producer.push_slice(&mix_buf);
                if written < mix_buf.len() {
                    warn!(
                        "capture ring full: dropped {} frames",
                        mix_buf.len() - written
                    );
                }
            },
            move |err| report_stream_error(&faults, StreamDirection::Input, err),
            None,
        )
        .map_err(|e| VoiceError::AudioStream(e.to_string()))
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl AudioCapture {
    pub fn open_with_preference(
        _producer: AudioProducer,
        _running: Arc<AtomicBool>,
        _preferred_device_name: Option<&str>,
        _faults: Option<FaultSender>,
    ) -> Result<Self> {
        Err(VoiceError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }

    pub fn open_default(producer: AudioProducer, running: Arc<AtomicBool>) -> Result<Self> {
        Self::open_with_preference(producer, running, None, None)
    }
}
