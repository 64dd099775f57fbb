use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};

use voicedesk_core::buffering::{create_audio_ring, Producer, CAPTURE_RING_CAPACITY};
use voicedesk_core::codec::{decode_pcm16, encode_frame, f32_to_i16, AudioFrame, EncodedChunk};
use voicedesk_core::playback::PlaybackUnit;
use voicedesk_core::session::state::Trigger;
use voicedesk_core::transport::{OutboundQueue, TransportHandle};
use voicedesk_core::{
    CaptureSource, Connector, LiveSetup, MemoryConnector, OutputTarget, PlaybackSink, SegmentKind, SessionConfig,
    SessionState, SessionStatusEvent, Speaker, TransportEvent, VoiceAgent, VoiceError,
};

const CAPTURE_RATE: u32 = 16_000;
const FRAME: usize = 160;

#[derive(Default)]
struct SinkState {
    now: f64,
    played: Vec<(f64, f64)>,
    stops: usize,
    released: bool,
}

/// Output sink with a hand-driven clock.
#[derive(Clone, Default)]
struct ManualSink {
    inner: Arc<Mutex<SinkState>>,
}

impl ManualSink {
    fn set_time(&self, t: f64) {
        self.inner.lock().now = t;
    }
}

impl PlaybackSink for ManualSink {
    fn current_time(&self) -> f64 {
        self.inner.lock().now
    }

    fn play(&mut self, unit: &PlaybackUnit) {
        self.inner.lock().played.push((unit.start, unit.duration()));
    }

    fn stop_all(&mut self) {
        self.inner.lock().stops += 1;
    }

    fn release(&mut self) {
        self.inner.lock().released = true;
    }
}

/// Opens immediately, then takes 300 ms to wind down after close.
struct SlowCloseConnector;

impl Connector for SlowCloseConnector {
    fn connect(&self, _setup: &LiveSetup, outbound: Arc<OutboundQueue>) -> TransportHandle {
        let (events_tx, events_rx) = mpsc::channel(16);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let _ = events_tx.send(TransportEvent::Opened).await;
            let _ = shutdown_rx.changed().await;
            tokio::time::sleep(Duration::from_millis(300)).await;
            drop(events_tx);
        });
        TransportHandle::new(outbound, events_rx, shutdown_tx, Some(task))
    }
}

fn ring_source() -> CaptureSource {
    let (_producer, consumer) = create_audio_ring(CAPTURE_RING_CAPACITY);
    CaptureSource::Ring {
        consumer,
        sample_rate: CAPTURE_RATE,
    }
}

fn agent_with(connector: Arc<dyn Connector>) -> VoiceAgent {
    let config = SessionConfig {
        block_size: FRAME,
        tick_ms: 5,
        ..SessionConfig::default()
    };
    VoiceAgent::new(config, connector)
}

fn speech(secs: f64) -> EncodedChunk {
    let samples = vec![0.2f32; (24_000.0 * secs) as usize];
    encode_frame(&AudioFrame::from_f32(&samples, 24_000))
}

async fn next_status(rx: &mut broadcast::Receiver<SessionStatusEvent>) -> SessionStatusEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("status event in time")
        .expect("status channel open")
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn conversation_runs_from_connect_to_stop() {
    let connector = Arc::new(MemoryConnector::new());
    let agent = agent_with(connector.clone());
    let mut status = agent.subscribe_status();
    let mut transcripts = agent.subscribe_transcripts();

    let (mut producer, consumer) = create_audio_ring(CAPTURE_RING_CAPACITY);
    let sink = ManualSink::default();
    agent
        .start_with(
            CaptureSource::Ring {
                consumer,
                sample_rate: CAPTURE_RATE,
            },
            OutputTarget::Sink(Box::new(sink.clone())),
        )
        .await
        .expect("start");
    assert_eq!(next_status(&mut status).await.status, SessionState::Connecting);
    let peer = connector.take_peer().expect("peer for the new session");

    // Nothing leaves before the transport reports open.
    producer.push_slice(&[0.05; FRAME]);
    wait_until("discarded frame", || {
        agent.diagnostics_snapshot().capture.frames_discarded == 1
    })
    .await;
    assert!(peer.drain_outbound().is_empty());

    assert!(peer.send(TransportEvent::Opened).await);
    let opened = next_status(&mut status).await;
    assert_eq!(opened.status, SessionState::Listening);
    assert!(opened.feedback.expect("feedback").visual.animated);

    // Outbound frames keep capture order.
    for level in [0.1f32, 0.2, 0.3] {
        producer.push_slice(&[level; FRAME]);
    }
    wait_until("three sent frames", || {
        agent.diagnostics_snapshot().capture.frames_sent == 3
    })
    .await;
    let firsts: Vec<i16> = peer
        .drain_outbound()
        .iter()
        .map(|c| decode_pcm16(c).expect("valid pcm")[0])
        .collect();
    assert_eq!(
        firsts,
        vec![f32_to_i16(0.1), f32_to_i16(0.2), f32_to_i16(0.3)]
    );

    // Agent reply plays back to back.
    assert!(peer.send(TransportEvent::Audio(speech(0.5))).await);
    assert!(peer.send(TransportEvent::Audio(speech(0.5))).await);
    assert_eq!(next_status(&mut status).await.status, SessionState::Speaking);
    wait_until("two units played", || sink.inner.lock().played.len() == 2).await;
    {
        let played = &sink.inner.lock().played;
        assert!((played[1].0 - (played[0].0 + played[0].1)).abs() < 1e-9);
    }

    // Barge-in cuts playback and returns to listening.
    sink.set_time(0.3);
    assert!(peer.send(TransportEvent::Interrupted).await);
    let interrupted = next_status(&mut status).await;
    assert_eq!(interrupted.status, SessionState::Listening);
    assert_eq!(sink.inner.lock().stops, 1);
    assert_eq!(agent.diagnostics_snapshot().playback.interruptions, 1);

    // Transcripts accumulate and commit on turn end.
    assert!(peer.send(TransportEvent::OutputTranscript("Restart ".into())).await);
    assert!(peer.send(TransportEvent::OutputTranscript("the router.".into())).await);
    assert!(peer.send(TransportEvent::TurnComplete).await);
    let mut last = None;
    for _ in 0..3 {
        let event = tokio::time::timeout(Duration::from_secs(2), transcripts.recv())
            .await
            .expect("transcript in time")
            .expect("transcript channel open");
        last = Some(event);
    }
    let last = last.expect("final transcript");
    assert_eq!(last.kind, SegmentKind::Final);
    assert_eq!(last.speaker, Speaker::Agent);
    assert_eq!(last.text, "Restart the router.");

    let outcome = agent.stop().await.expect("stop");
    assert_eq!(outcome.trigger, Trigger::StopRequested);
    assert_eq!(next_status(&mut status).await.status, SessionState::Idle);
    assert_eq!(agent.state(), SessionState::Idle);
    assert!(!agent.is_running());
    assert!(peer.is_closed());
    assert!(sink.inner.lock().released);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_close_ends_the_session_on_its_own() {
    let connector = Arc::new(MemoryConnector::opening());
    let agent = agent_with(connector.clone());
    let mut status = agent.subscribe_status();

    let (_producer, consumer) = create_audio_ring(CAPTURE_RING_CAPACITY);
    agent
        .start_with(
            CaptureSource::Ring {
                consumer,
                sample_rate: CAPTURE_RATE,
            },
            OutputTarget::Sink(Box::new(ManualSink::default())),
        )
        .await
        .expect("start");
    assert_eq!(next_status(&mut status).await.status, SessionState::Connecting);
    assert_eq!(next_status(&mut status).await.status, SessionState::Listening);

    let peer = connector.take_peer().expect("peer");
    assert!(peer.send(TransportEvent::Closed(Some("server going away".into()))).await);

    let closed = next_status(&mut status).await;
    assert_eq!(closed.status, SessionState::Idle);
    assert_eq!(closed.detail.as_deref(), Some("server going away"));
    wait_until("session task exit", || !agent.is_running()).await;
    assert!(matches!(agent.stop().await, Err(VoiceError::NotRunning)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_start_is_rejected_while_running() {
    let connector = Arc::new(MemoryConnector::new());
    let agent = agent_with(connector.clone());

    let (_p1, c1) = create_audio_ring(CAPTURE_RING_CAPACITY);
    agent
        .start_with(
            CaptureSource::Ring {
                consumer: c1,
                sample_rate: CAPTURE_RATE,
            },
            OutputTarget::Sink(Box::new(ManualSink::default())),
        )
        .await
        .expect("first start");

    let (_p2, c2) = create_audio_ring(CAPTURE_RING_CAPACITY);
    let second = agent
        .start_with(
            CaptureSource::Ring {
                consumer: c2,
                sample_rate: CAPTURE_RATE,
            },
            OutputTarget::Sink(Box::new(ManualSink::default())),
        )
        .await;
    assert!(matches!(second, Err(VoiceError::AlreadyRunning)));
    assert_eq!(connector.pending_peers(), 1);

    agent.stop().await.expect("stop");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_capture_open_returns_to_idle_and_releases_output() {
    let connector = Arc::new(MemoryConnector::new());
    let agent = agent_with(connector.clone());
    let mut status = agent.subscribe_status();
    let sink = ManualSink::default();

    let result = agent
        .start_with(
            CaptureSource::WavFile("/nonexistent/voicedesk-missing.wav".into()),
            OutputTarget::Sink(Box::new(sink.clone())),
        )
        .await;
    assert!(result.is_err());

    assert_eq!(next_status(&mut status).await.status, SessionState::Connecting);
    let failed = next_status(&mut status).await;
    assert_eq!(failed.status, SessionState::Idle);
    assert!(failed.detail.is_some());
    assert!(!agent.is_running());
    assert!(sink.inner.lock().released);
    assert_eq!(connector.pending_peers(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_is_accepted_as_soon_as_idle_is_published() {
    let agent = Arc::new(agent_with(Arc::new(SlowCloseConnector)));
    let mut status = agent.subscribe_status();

    agent
        .start_with(ring_source(), OutputTarget::Sink(Box::new(ManualSink::default())))
        .await
        .expect("first start");
    assert_eq!(next_status(&mut status).await.status, SessionState::Connecting);
    assert_eq!(next_status(&mut status).await.status, SessionState::Listening);

    let stopper = {
        let agent = Arc::clone(&agent);
        tokio::spawn(async move { agent.stop().await })
    };
    assert_eq!(next_status(&mut status).await.status, SessionState::Idle);
    assert!(!agent.is_running());

    agent
        .start_with(ring_source(), OutputTarget::Sink(Box::new(ManualSink::default())))
        .await
        .expect("restart right after idle");
    assert_eq!(next_status(&mut status).await.status, SessionState::Connecting);

    let first = stopper.await.expect("stop task").expect("first stop");
    assert_eq!(first.trigger, Trigger::StopRequested);
    agent.stop().await.expect("second stop");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unusable_capture_rate_fails_start_instead_of_listening_silently() {
    let connector = Arc::new(MemoryConnector::new());
    let agent = agent_with(connector.clone());
    let mut status = agent.subscribe_status();
    let (_producer, consumer) = create_audio_ring(CAPTURE_RING_CAPACITY);

    let result = agent
        .start_with(
            CaptureSource::Ring {
                consumer,
                sample_rate: 0,
            },
            OutputTarget::Sink(Box::new(ManualSink::default())),
        )
        .await;
    assert!(result.is_err());
    assert_eq!(next_status(&mut status).await.status, SessionState::Connecting);
    assert_eq!(next_status(&mut status).await.status, SessionState::Idle);
    assert!(!agent.is_running());
    assert_eq!(connector.pending_peers(), 0);
}
