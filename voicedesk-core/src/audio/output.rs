//! Speaker output and the device clock.
//!
//! The output callback pops mono frames from an SPSC ring, duplicates each
//! one across the device channels, and writes silence on underrun. It
//! counts every frame it hands to the device, silent or not; that counter
//! divided by the device rate is the clock the playback scheduler syncs to.
//!
//! ## Flushing
//!
//! The callback owns the consumer half, so the writer cannot clear the ring
//! directly. Instead the writer publishes a watermark equal to the total
//! number of samples it has pushed so far. The callback discards samples
//! until its own consumed count reaches the watermark. Samples pushed after
//! the flush sit above the watermark and survive, even if they land before
//! the callback next runs.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{info, warn};

use super::resample::RateConverter;
use super::FaultSender;
use crate::buffering::{AudioProducer, Producer};
use crate::error::{Result, VoiceError};
use crate::playback::{PlaybackSink, PlaybackUnit};

/// Resampler block size for agent audio (20 ms at 24 kHz).
const OUTPUT_RESAMPLE_CHUNK: usize = 480;

/// How often the device thread checks whether it should release the stream.
const DEVICE_THREAD_POLL_MS: u64 = 20;

/// Counters shared between the output callback and the sink.
#[derive(Debug, Default)]
pub struct OutputClock {
    /// Frames handed to the device since the stream opened.
    pub played_frames: AtomicU64,
    /// Samples the callback must discard before playing anything new.
    pub flush_watermark: AtomicU64,
}

/// `Send` handle to an open output stream.
///
/// The `cpal::Stream` itself lives on a dedicated thread for as long as
/// this handle is alive; dropping or releasing the handle closes it.
pub struct OutputHandle {
    producer: AudioProducer,
    clock: Arc<OutputClock>,
    /// Total samples successfully pushed into the ring.
    pushed: u64,
    device_rate: u32,
    converter: RateConverter,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl OutputHandle {
    /// Open the preferred (or default) output device for agent audio at
    /// `source_rate`.
    ///
    /// Blocks until the device thread reports success or failure.
    #[cfg(feature = "audio-cpal")]
    pub fn open(
        source_rate: u32,
        preferred_device_name: Option<String>,
        faults: Option<FaultSender>,
    ) -> Result<Self> {
        use crate::buffering::{create_audio_ring, PLAYBACK_RING_CAPACITY};

        let (producer, consumer) = create_audio_ring(PLAYBACK_RING_CAPACITY);
        let clock = Arc::new(OutputClock::default());
        let running = Arc::new(AtomicBool::new(true));
        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<u32>>();

        let thread_clock = Arc::clone(&clock);
        let thread_running = Arc::clone(&running);
        let thread = std::thread::Builder::new()
            .name("voicedesk-output".into())
            .spawn(move || {
                // The stream must be dropped on this thread.
                let stream = match device::open_stream(
                    consumer,
                    thread_clock,
                    preferred_device_name.as_deref(),
                    faults,
                ) {
                    Ok((stream, rate)) => {
                        let _ = open_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };
                while thread_running.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_millis(DEVICE_THREAD_POLL_MS));
                }
                drop(stream);
                info!("output device released");
            })?;

        let device_rate = match open_rx.recv() {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                return Err(VoiceError::AudioStream(
                    "output device thread died unexpectedly".into(),
                ))
            }
        };

        Ok(Self {
            producer,
            clock,
            pushed: 0,
            device_rate,
            converter: RateConverter::new(source_rate, device_rate, OUTPUT_RESAMPLE_CHUNK)?,
            running,
            thread: Some(thread),
        })
    }

    #[cfg(not(feature = "audio-cpal"))]
    pub fn open(
        _source_rate: u32,
        _preferred_device_name: Option<String>,
        _faults: Option<FaultSender>,
    ) -> Result<Self> {
        Err(VoiceError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }

    pub fn device_rate(&self) -> u32 {
        self.device_rate
    }
}

impl PlaybackSink for OutputHandle {
    fn current_time(&self) -> f64 {
        self.clock.played_frames.load(Ordering::Relaxed) as f64 / self.device_rate as f64
    }

    /// Append the unit to the device ring.
    ///
    /// `unit.start` is not read. Units arrive in schedule order with
    /// contiguous spans, so ring order is timeline order; after an underrun
    /// the next unit plays as soon as the ring reaches it, which is where
    /// `max(clock, now)` placed it.
    fn play(&mut self, unit: &PlaybackUnit) {
        let mono = unit.audio.to_mono();
        let converted = self.converter.process_all(&mono);
        let written = self.producer.push_slice(&converted);
        self.pushed += written as u64;
        if written < converted.len() {
            warn!(
                unit_id = unit.id,
                dropped = converted.len() - written,
                "playback ring full"
            );
        }
    }

    fn stop_all(&mut self) {
        self.clock
            .flush_watermark
            .store(self.pushed, Ordering::Release);
    }

    fn release(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("output device thread panicked");
            }
        }
    }
}

impl Drop for OutputHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(feature = "audio-cpal")]
mod device {
    use super::*;
    use crate::audio::{report_stream_error, StreamDirection};
    use crate::buffering::{AudioConsumer, Consumer};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{FromSample, Sample, SizedSample, Stream, StreamConfig};

    pub(super) fn open_stream(
        consumer: AudioConsumer,
        clock: Arc<OutputClock>,
        preferred_device_name: Option<&str>,
        faults: Option<FaultSender>,
    ) -> Result<(Stream, u32)> {
        let host = cpal::default_host();
        let preferred = preferred_device_name.and_then(|name| {
            let found = host
                .output_devices()
                .ok()
                .and_then(|mut devices| devices.find(|d| d.name().map(|n| n == name).unwrap_or(false)));
            if found.is_none() {
                warn!("preferred output device '{}' not found, falling back", name);
            }
            found
        });
        let device = preferred
            .or_else(|| host.default_output_device())
            .ok_or(VoiceError::NoDefaultOutputDevice)?;

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening output device"
        );

        let supported = device
            .default_output_config()
            .map_err(|e| VoiceError::AudioDevice(e.to_string()))?;
        let config: StreamConfig = supported.config();
        let rate = config.sample_rate.0;
        info!(rate, channels = config.channels, "playback config selected");

        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => build_output::<f32>(&device, &config, consumer, clock, faults),
            cpal::SampleFormat::I16 => build_output::<i16>(&device, &config, consumer, clock, faults),
            cpal::SampleFormat::U16 => build_output::<u16>(&device, &config, consumer, clock, faults),
            fmt => {
                return Err(VoiceError::AudioStream(format!(
                    "unsupported output sample format: {fmt:?}"
                )))
            }
        }?;

        stream
            .play()
            .map_err(|e| VoiceError::AudioStream(e.to_string()))?;
        Ok((stream, rate))
    }

    fn build_output<T>(
        device: &cpal::Device,
        config: &StreamConfig,
        mut consumer: AudioConsumer,
        clock: Arc<OutputClock>,
        faults: Option<FaultSender>,
    ) -> Result<Stream>
    where
        T: SizedSample + FromSample<f32> + Send + 'static,
    {
        let ch = config.channels.max(1) as usize;
        let mut consumed: u64 = 0;

        device
            .build_output_stream(
                config,
                move |data: &mut [T], _info| {
                    let watermark = clock.flush_watermark.load(Ordering::Acquire);
                    if consumed < watermark {
                        consumed += consumer.skip((watermark - consumed) as usize) as u64;
                    }

                    let mut frames = 0u64;
                    for frame in data.chunks_mut(ch) {
                        let value = match consumer.try_pop() {
                            Some(v) => {
                                consumed += 1;
                                v
                            }
                            None => 0.0,
                        };
                        let out = T::from_sample(value);
                        for sample in frame.iter_mut() {
                            *sample = out;
                        }
                        frames += 1;
                    }
                    // Time advances whether or not there was audio to play.
                    clock.played_frames.fetch_add(frames, Ordering::Relaxed);
                },
                move |err| report_stream_error(&faults, StreamDirection::Output, err),
                None,
            )
            .map_err(|e| VoiceError::AudioStream(e.to_string()))
    }
}
