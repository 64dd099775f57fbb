//! `VoiceAgent`: top-level lifecycle controller for voice sessions.
//!
//! ## Lifecycle
//!
//! ```text
//! VoiceAgent::new()
//!     └─► start()   → status = Connecting, output + microphone opened,
//!         │           transport connecting, event loop spawned
//!         │   └─► Opened        → Listening (capture starts forwarding)
//!         │   └─► Audio         → Speaking  (gapless playback)
//!         │   └─► Interrupted   → Listening (playback flushed)
//!         └─► stop()  → transport closed, mic released, playback flushed,
//!                       status = Idle
//! ```
//!
//! ## Threading
//!
//! `cpal::Stream` is `!Send` on Windows/macOS, so the microphone stream is
//! created *inside* the capture `spawn_blocking` closure and never leaves
//! it. The output stream lives on its own thread behind a `Send`
//! [`OutputHandle`]. Everything else runs on one async task: the session
//! event loop in [`run_session`].

pub mod engine;
pub mod state;

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use self::engine::{Control, SessionChannels, SessionCore};
use self::state::{SessionState, SessionStateMachine, Trigger};
use crate::audio::{
    fault_channel, file::WavCapture, output::OutputHandle, AudioCapture, FaultReceiver,
    FaultSender,
};
use crate::buffering::{create_audio_ring, AudioConsumer, CAPTURE_RING_CAPACITY};
use crate::capture::{CaptureContext, CaptureDiagnostics, CapturePipeline, CaptureSnapshot};
use crate::error::{Result, VoiceError};
use crate::ipc::events::{SessionStatusEvent, TranscriptEvent};
use crate::playback::{PlaybackDiagnostics, PlaybackScheduler, PlaybackSink, PlaybackSnapshot};
use crate::transport::{
    Connector, LiveSetup, OutboundQueue, OverflowPolicy, TransportHandle, TransportSender,
};

/// Configuration for `VoiceAgent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// Rate of outbound PCM (Hz). Default: 16000.
    pub input_sample_rate: u32,
    /// Rate of agent audio (Hz). Default: 24000.
    pub output_sample_rate: u32,
    /// Channels in agent audio. Default: 1.
    pub output_channels: u16,
    /// Samples per outbound frame. Default: 2048.
    pub block_size: usize,
    /// Outbound frames buffered before the overflow policy applies.
    /// Default: 64 (about 8 s of speech).
    pub outbound_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    /// How often finished playback units are retired (ms). Default: 20.
    pub tick_ms: u64,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub live: LiveSetup,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            output_channels: 1,
            block_size: 2048,
            outbound_capacity: 64,
            overflow_policy: OverflowPolicy::DropOldest,
            tick_ms: 20,
            input_device: None,
            output_device: None,
            live: LiveSetup::default(),
        }
    }
}

/// Where outbound audio comes from.
pub enum CaptureSource {
    Microphone { device: Option<String> },
    /// A WAV file paced in real time.
    WavFile(PathBuf),
    /// Samples pushed by the caller into a capture ring.
    Ring {
        consumer: AudioConsumer,
        sample_rate: u32,
    },
}

/// Where agent audio goes.
pub enum OutputTarget {
    Device { device: Option<String> },
    Sink(Box<dyn PlaybackSink>),
}

/// Counters across the capture and playback halves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub capture: CaptureSnapshot,
    pub playback: PlaybackSnapshot,
    pub outbound_dropped: usize,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub trigger: Trigger,
    pub detail: Option<String>,
}

/// Running capture thread and its stop flag.
pub struct CaptureWorker {
    running: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl CaptureWorker {
    /// Signal the capture loop (and the device callback) to stop, then wait.
    pub async fn halt(self) {
        self.running.store(false, Ordering::Release);
        if let Err(e) = self.task.await {
            warn!("capture task ended abnormally: {e}");
        }
    }
}

/// Everything the event loop owns for one session.
pub struct SessionLoop<S: PlaybackSink> {
    pub core: SessionCore<S>,
    pub transport: TransportHandle,
    pub capture: Option<CaptureWorker>,
    pub faults: Option<FaultReceiver>,
    pub stop: oneshot::Receiver<()>,
    pub tick: Duration,
    /// The owning agent's "session active" flag; cleared as `Idle` is published.
    pub running: Arc<AtomicBool>,
}

/// Upper bound on waiting for the connection task during teardown.
const TRANSPORT_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Drive one session until stop, transport close or a fatal fault, then
/// tear it down.
///
/// Teardown order: close the transport, halt the microphone, wait for the
/// connection task, flush playback and release the output, return to idle.
/// Every step runs even when an earlier one had nothing to do.
pub async fn run_session<S: PlaybackSink>(mut session: SessionLoop<S>) -> SessionOutcome {
    let mut ticker = tokio::time::interval(session.tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let (trigger, detail) = loop {
        tokio::select! {
            biased;
            _ = &mut session.stop => break (Trigger::StopRequested, None),
            event = session.transport.next_event() => match event {
                Some(event) => {
                    debug!(kind = event.kind(), "transport event");
                    if let Control::Shutdown { trigger, detail } = session.core.handle_event(event) {
                        break (trigger, detail);
                    }
                }
                None => break (Trigger::TransportClosed, Some("transport ended".into())),
            },
            _ = ticker.tick() => {
                session.core.tick();
                if let Some(fault) = drain_faults(session.faults.as_ref()) {
                    break (Trigger::Failed, Some(fault));
                }
            }
        }
    };

    info!(?trigger, detail = ?detail, "session ending");

    session.transport.close();
    debug!("transport closed");

    if let Some(capture) = session.capture.take() {
        capture.halt().await;
        debug!("microphone released");
    }

    if tokio::time::timeout(TRANSPORT_JOIN_TIMEOUT, session.transport.join())
        .await
        .is_err()
    {
        warn!("transport task still closing, detaching it");
    }

    session
        .core
        .teardown(trigger, detail.clone(), &session.running);

    SessionOutcome { trigger, detail }
}

/// Log every pending device fault; return the first fatal one.
fn drain_faults(faults: Option<&FaultReceiver>) -> Option<String> {
    let faults = faults?;
    let mut fatal = None;
    while let Ok(fault) = faults.try_recv() {
        if fault.fatal {
            error!(direction = ?fault.direction, "audio device lost: {}", fault.message);
            fatal.get_or_insert(fault.message);
        } else {
            warn!(direction = ?fault.direction, "audio stream error: {}", fault.message);
        }
    }
    fatal
}

struct CaptureParts {
    block_size: usize,
    target_rate: u32,
    running: Arc<AtomicBool>,
    forwarding: Arc<AtomicBool>,
    sender: TransportSender,
    diagnostics: Arc<CaptureDiagnostics>,
}

impl CaptureParts {
    fn into_context(self, consumer: AudioConsumer, capture_sample_rate: u32) -> CaptureContext {
        CaptureContext {
            block_size: self.block_size,
            target_rate: self.target_rate,
            consumer,
            running: self.running,
            forwarding: self.forwarding,
            sender: self.sender,
            capture_sample_rate,
            diagnostics: self.diagnostics,
        }
    }
}

/// Build the capture pipeline, report the outcome to `start`, then run it.
fn confirm_and_run(ctx: CaptureContext, open_tx: oneshot::Sender<Result<u32>>) {
    let rate = ctx.capture_sample_rate;
    match CapturePipeline::new(ctx) {
        Ok(pipeline) => {
            let _ = open_tx.send(Ok(rate));
            pipeline.run();
        }
        Err(e) => {
            let _ = open_tx.send(Err(e));
        }
    }
}

/// Open the capture source on a blocking thread and run the capture loop
/// there. Resolves once the source is confirmed open (or failed).
async fn spawn_capture(
    source: CaptureSource,
    parts: CaptureParts,
    faults: FaultSender,
) -> Result<CaptureWorker> {
    let running = Arc::clone(&parts.running);
    let (open_tx, open_rx) = oneshot::channel::<Result<u32>>();

    let task = tokio::task::spawn_blocking(move || match source {
        CaptureSource::Microphone { device } => {
            let (producer, consumer) = create_audio_ring(CAPTURE_RING_CAPACITY);
            // Must be opened on THIS thread: cpal::Stream is !Send.
            let capture = match AudioCapture::open_with_preference(
                producer,
                Arc::clone(&parts.running),
                device.as_deref(),
                Some(faults),
            ) {
                Ok(c) => c,
                Err(e) => {
                    let _ = open_tx.send(Err(e));
                    return;
                }
            };
            let rate = capture.sample_rate;
            confirm_and_run(parts.into_context(consumer, rate), open_tx);
            capture.stop();
            // Stream drops here, releasing the device on this thread.
            drop(capture);
        }
        CaptureSource::WavFile(path) => {
            let (producer, consumer) = create_audio_ring(CAPTURE_RING_CAPACITY);
            let mut wav = match WavCapture::open(&path, producer, Arc::clone(&parts.running)) {
                Ok(w) => w,
                Err(e) => {
                    let _ = open_tx.send(Err(e));
                    return;
                }
            };
            let rate = wav.sample_rate;
            confirm_and_run(parts.into_context(consumer, rate), open_tx);
            wav.stop();
        }
        CaptureSource::Ring {
            consumer,
            sample_rate,
        } => confirm_and_run(parts.into_context(consumer, sample_rate), open_tx),
    });

    match open_rx.await {
        Ok(Ok(rate)) => {
            info!(rate, "capture source open");
            Ok(CaptureWorker { running, task })
        }
        Ok(Err(e)) => {
            running.store(false, Ordering::Release);
            let _ = task.await;
            Err(e)
        }
        Err(_) => {
            running.store(false, Ordering::Release);
            Err(VoiceError::Other(anyhow::anyhow!(
                "capture task died unexpectedly"
            )))
        }
    }
}

async fn open_output(target: OutputTarget, rate: u32, faults: FaultSender) -> Result<Box<dyn PlaybackSink>> {
    match target {
        OutputTarget::Sink(sink) => Ok(sink),
        OutputTarget::Device { device } => {
            let handle =
                tokio::task::spawn_blocking(move || OutputHandle::open(rate, device, Some(faults)))
                    .await
                    .map_err(|e| VoiceError::Other(anyhow::anyhow!("output task failed: {e}")))??;
            info!(device_rate = handle.device_rate(), "output device open");
            Ok(Box::new(handle))
        }
    }
}

struct ActiveSession {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<SessionOutcome>,
}

/// Public controller. One session at a time.
pub struct VoiceAgent {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    channels: SessionChannels,
    running: Arc<AtomicBool>,
    active: Mutex<Option<ActiveSession>>,
    capture_diagnostics: Arc<CaptureDiagnostics>,
    playback_diagnostics: Arc<PlaybackDiagnostics>,
    last_outbound: Mutex<Option<Arc<OutboundQueue>>>,
}

impl VoiceAgent {
    pub fn new(config: SessionConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            channels: SessionChannels::new(),
            running: Arc::new(AtomicBool::new(false)),
            active: Mutex::new(None),
            capture_diagnostics: Arc::new(CaptureDiagnostics::default()),
            playback_diagnostics: Arc::new(PlaybackDiagnostics::default()),
            last_outbound: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Start a session on the configured microphone and speakers.
    pub async fn start(&self) -> Result<()> {
        self.start_with(
            CaptureSource::Microphone {
                device: self.config.input_device.clone(),
            },
            OutputTarget::Device {
                device: self.config.output_device.clone(),
            },
        )
        .await
    }

    /// Start a session on explicit audio endpoints.
    ///
    /// Returns once the devices are open and the transport is connecting;
    /// the transition to listening follows asynchronously.
    ///
    /// # Errors
    /// - `VoiceError::AlreadyRunning` if a session is active.
    /// - Device errors when the microphone or speakers cannot be opened. The
    ///   session returns to idle and nothing is left open.
    pub async fn start_with(&self, capture: CaptureSource, output: OutputTarget) -> Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(VoiceError::AlreadyRunning);
        }

        self.capture_diagnostics.reset();
        self.playback_diagnostics.reset();

        let mut machine = SessionStateMachine::new();
        if let Some(t) = machine.apply(Trigger::StartRequested) {
            self.channels.publish_transition(&t, None);
        }

        let (fault_tx, fault_rx) = fault_channel();

        let mut sink = match open_output(output, self.config.output_sample_rate, fault_tx.clone()).await {
            Ok(sink) => sink,
            Err(e) => return Err(self.fail_start(machine, e)),
        };

        let outbound = Arc::new(OutboundQueue::new(
            self.config.outbound_capacity,
            self.config.overflow_policy,
        ));
        let forwarding = Arc::new(AtomicBool::new(false));
        let parts = CaptureParts {
            block_size: self.config.block_size,
            target_rate: self.config.input_sample_rate,
            running: Arc::new(AtomicBool::new(true)),
            forwarding: Arc::clone(&forwarding),
            sender: TransportSender::new(Arc::clone(&outbound)),
            diagnostics: Arc::clone(&self.capture_diagnostics),
        };
        let capture = match spawn_capture(capture, parts, fault_tx).await {
            Ok(worker) => worker,
            Err(e) => {
                sink.release();
                return Err(self.fail_start(machine, e));
            }
        };

        let mut setup = self.config.live.clone();
        setup.input_sample_rate = self.config.input_sample_rate;
        let transport = self.connector.connect(&setup, Arc::clone(&outbound));
        *self.last_outbound.lock() = Some(outbound);

        let core = SessionCore::new(
            machine,
            PlaybackScheduler::new(self.config.output_sample_rate, self.config.output_channels),
            sink,
            self.channels.clone(),
            forwarding,
            Arc::clone(&self.playback_diagnostics),
        );

        let (stop_tx, stop_rx) = oneshot::channel();
        let session = SessionLoop {
            core,
            transport,
            capture: Some(capture),
            faults: Some(fault_rx),
            stop: stop_rx,
            tick: Duration::from_millis(self.config.tick_ms.max(1)),
            running: Arc::clone(&self.running),
        };

        let task = tokio::spawn(run_session(session));
        *self.active.lock() = Some(ActiveSession { stop_tx, task });

        info!(model = %setup.model, "voice session starting");
        Ok(())
    }

    fn fail_start(&self, mut machine: SessionStateMachine, e: VoiceError) -> VoiceError {
        error!("voice session failed to start: {e}");
        match machine.apply(Trigger::Failed) {
            Some(t) => self
                .channels
                .publish_idle(&t, Some(e.to_string()), &self.running),
            None => self.running.store(false, Ordering::SeqCst),
        }
        e
    }

    /// Stop the active session and wait for teardown to finish.
    ///
    /// # Errors
    /// - `VoiceError::NotRunning` if no session is active.
    pub async fn stop(&self) -> Result<SessionOutcome> {
        let active = self.active.lock().take();
        let Some(active) = active else {
            return Err(VoiceError::NotRunning);
        };
        if !self.running.load(Ordering::SeqCst) {
            // Ended on its own (transport closed); just collect it.
            let _ = active.task.await;
            return Err(VoiceError::NotRunning);
        }

        info!("voice session stop requested");
        let _ = active.stop_tx.send(());
        active
            .task
            .await
            .map_err(|e| VoiceError::Other(anyhow::anyhow!("session task failed: {e}")))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Current session state (snapshot).
    pub fn state(&self) -> SessionState {
        self.channels.state()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.channels.subscribe_status()
    }

    pub fn subscribe_transcripts(&self) -> broadcast::Receiver<TranscriptEvent> {
        self.channels.subscribe_transcripts()
    }

    pub fn diagnostics_snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            capture: self.capture_diagnostics.snapshot(),
            playback: self.playback_diagnostics.snapshot(),
            outbound_dropped: self
                .last_outbound
                .lock()
                .as_ref()
                .map_or(0, |q| q.dropped()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_live_audio_contract() {
        let config = SessionConfig::default();
        assert_eq!(config.input_sample_rate, 16_000);
        assert_eq!(config.output_sample_rate, 24_000);
        assert_eq!(config.output_channels, 1);
        assert_eq!(config.block_size, 2048);
        assert_eq!(config.overflow_policy, OverflowPolicy::DropOldest);
        assert_eq!(config.live.voice_name, "Kore");
    }

    #[test]
    fn config_deserialises_partial_json_with_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"blockSize":1024,"overflowPolicy":"drop-newest"}"#).unwrap();
        assert_eq!(config.block_size, 1024);
        assert_eq!(config.overflow_policy, OverflowPolicy::DropNewest);
        assert_eq!(config.tick_ms, 20);
    }

    #[test]
    fn fatal_fault_wins_over_warnings() {
        use crate::audio::{DeviceFault, StreamDirection};
        let (tx, rx) = fault_channel();
        tx.try_send(DeviceFault {
            direction: StreamDirection::Input,
            message: "glitch".into(),
            fatal: false,
        })
        .unwrap();
        tx.try_send(DeviceFault {
            direction: StreamDirection::Output,
            message: "unplugged".into(),
            fatal: true,
        })
        .unwrap();
        assert_eq!(drain_faults(Some(&rx)).as_deref(), Some("unplugged"));
        assert_eq!(drain_faults(Some(&rx)), None);
        assert_eq!(drain_faults(None), None);
    }
}
