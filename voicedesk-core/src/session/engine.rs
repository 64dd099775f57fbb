//! Single owner of everything the inbound side mutates.
//!
//! The state machine, the playback scheduler, the sink and the transcript
//! buffers live together in [`SessionCore`] and are only touched from the
//! session event loop. Interruption therefore cannot interleave with
//! scheduling: a chunk handled after `interrupt()` always sees the reset
//! clock.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::state::{SessionState, SessionStateMachine, Transition, Trigger};
use crate::ipc::events::{SegmentKind, SessionStatusEvent, Speaker, TranscriptEvent};
use crate::playback::{PlaybackDiagnostics, PlaybackScheduler, PlaybackSink};
use crate::transport::TransportEvent;

/// Broadcast channel capacity: 256 events buffered for slow consumers.
pub const BROADCAST_CAP: usize = 256;

/// Shared publishing side of a [`crate::VoiceAgent`]. Outlives sessions.
#[derive(Clone)]
pub struct SessionChannels {
    status: Arc<Mutex<SessionState>>,
    status_tx: broadcast::Sender<SessionStatusEvent>,
    transcript_tx: broadcast::Sender<TranscriptEvent>,
    seq: Arc<AtomicU64>,
}

impl Default for SessionChannels {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionChannels {
    pub fn new() -> Self {
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (transcript_tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            status: Arc::new(Mutex::new(SessionState::Idle)),
            status_tx,
            transcript_tx,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.status.lock()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_transcripts(&self) -> broadcast::Receiver<TranscriptEvent> {
        self.transcript_tx.subscribe()
    }

    /// Mirror a transition and broadcast it.
    pub fn publish_transition(&self, transition: &Transition, detail: Option<String>) {
        self.publish(transition, detail, None);
    }

    /// Publish the return to idle and clear `running` under the same lock.
    ///
    /// `VoiceAgent::start_with` publishes `Connecting` through this lock too,
    /// so no observer can see `Idle` while a restart would still be refused,
    /// and a restart's `Connecting` always follows this `Idle`.
    pub fn publish_idle(&self, transition: &Transition, detail: Option<String>, running: &AtomicBool) {
        self.publish(transition, detail, Some(running));
    }

    fn publish(&self, transition: &Transition, detail: Option<String>, release: Option<&AtomicBool>) {
        let mut status = self.status.lock();
        *status = transition.to;
        if let Some(running) = release {
            running.store(false, Ordering::SeqCst);
        }
        info!(
            from = %transition.from,
            to = %transition.to,
            trigger = ?transition.trigger,
            haptic = ?transition.feedback.haptic.pulses(),
            "session transition"
        );
        let _ = self.status_tx.send(SessionStatusEvent {
            seq: self.next_seq(),
            status: transition.to,
            feedback: Some(transition.feedback.clone()),
            detail,
        });
    }

    fn publish_transcript(&self, turn: u64, speaker: Speaker, text: &str, kind: SegmentKind) {
        let _ = self.transcript_tx.send(TranscriptEvent {
            seq: self.next_seq(),
            turn,
            speaker,
            text: text.to_string(),
            kind,
        });
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
}

/// What the event loop should do after handling one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    Continue,
    Shutdown {
        trigger: Trigger,
        detail: Option<String>,
    },
}

/// Per-side transcript text for the current turn.
#[derive(Debug, Default)]
struct Transcripts {
    turn: u64,
    user: String,
    agent: String,
}

impl Transcripts {
    fn buffer(&mut self, speaker: Speaker) -> &mut String {
        match speaker {
            Speaker::User => &mut self.user,
            Speaker::Agent => &mut self.agent,
        }
    }
}

pub struct SessionCore<S: PlaybackSink> {
    machine: SessionStateMachine,
    scheduler: PlaybackScheduler,
    sink: S,
    transcripts: Transcripts,
    channels: SessionChannels,
    /// Lets the capture loop start sending once the transport is open.
    forwarding: Arc<AtomicBool>,
    diagnostics: Arc<PlaybackDiagnostics>,
}

impl<S: PlaybackSink> SessionCore<S> {
    /// Take ownership of a machine that has already left `Idle`.
    pub fn new(
        machine: SessionStateMachine,
        scheduler: PlaybackScheduler,
        sink: S,
        channels: SessionChannels,
        forwarding: Arc<AtomicBool>,
        diagnostics: Arc<PlaybackDiagnostics>,
    ) -> Self {
        Self {
            machine,
            scheduler,
            sink,
            transcripts: Transcripts::default(),
            channels,
            forwarding,
            diagnostics,
        }
    }

    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    pub fn scheduler(&self) -> &PlaybackScheduler {
        &self.scheduler
    }

    /// Handle one inbound transport event.
    ///
    /// Never fails: malformed audio is skipped and logged, and terminal
    /// events are turned into a shutdown request for the loop.
    pub fn handle_event(&mut self, event: TransportEvent) -> Control {
        match event {
            TransportEvent::Opened => {
                if let Some(t) = self.machine.apply(Trigger::TransportOpened) {
                    self.forwarding.store(true, Ordering::Release);
                    self.channels.publish_transition(&t, None);
                } else {
                    debug!(state = %self.state(), "duplicate open ignored");
                }
            }
            TransportEvent::Audio(chunk) => self.schedule_audio(&chunk),
            TransportEvent::Interrupted => self.interrupt(),
            TransportEvent::InputTranscript(delta) => self.append_transcript(Speaker::User, &delta),
            TransportEvent::OutputTranscript(delta) => {
                self.append_transcript(Speaker::Agent, &delta)
            }
            TransportEvent::TurnComplete => self.complete_turn(),
            TransportEvent::Closed(reason) => {
                return Control::Shutdown {
                    trigger: Trigger::TransportClosed,
                    detail: reason,
                }
            }
            TransportEvent::Error(message) => {
                return Control::Shutdown {
                    trigger: Trigger::Failed,
                    detail: Some(message),
                }
            }
        }
        Control::Continue
    }

    fn schedule_audio(&mut self, chunk: &crate::codec::EncodedChunk) {
        if !self.state().is_live() {
            self.diagnostics
                .chunks_ignored
                .fetch_add(1, Ordering::Relaxed);
            warn!(state = %self.state(), "audio chunk outside a live session dropped");
            return;
        }

        let now = self.sink.current_time();
        match self.scheduler.schedule(chunk, now) {
            Ok(unit) => {
                self.sink.play(&unit);
                self.diagnostics
                    .units_scheduled
                    .fetch_add(1, Ordering::Relaxed);
                if let Some(t) = self.machine.apply(Trigger::AudioReceived) {
                    self.channels.publish_transition(&t, None);
                }
            }
            Err(e) => {
                self.diagnostics.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, bytes = chunk.len(), "skipping malformed audio chunk");
            }
        }
    }

    /// Barge-in: silence everything, clear the set, zero the clock, listen.
    pub fn interrupt(&mut self) {
        if !self.state().is_live() {
            debug!(state = %self.state(), "interruption outside a live session ignored");
            return;
        }
        self.sink.stop_all();
        let cut = self.scheduler.flush();
        self.diagnostics
            .units_flushed
            .fetch_add(cut, Ordering::Relaxed);
        self.diagnostics
            .interruptions
            .fetch_add(1, Ordering::Relaxed);
        info!(cut, "playback interrupted");
        if let Some(t) = self.machine.apply(Trigger::Interrupted) {
            self.channels.publish_transition(&t, None);
        }
    }

    /// Retire units that finished playing; drain back to listening when
    /// the last one completes. Returns how many units completed.
    pub fn tick(&mut self) -> usize {
        let completed = self.scheduler.reap(self.sink.current_time());
        if completed == 0 {
            return 0;
        }
        self.diagnostics
            .units_completed
            .fetch_add(completed, Ordering::Relaxed);
        if self.scheduler.is_idle() {
            if let Some(t) = self.machine.apply(Trigger::PlaybackDrained) {
                self.channels.publish_transition(&t, None);
            }
        }
        completed
    }

    fn append_transcript(&mut self, speaker: Speaker, delta: &str) {
        let turn = self.transcripts.turn;
        let buffer = self.transcripts.buffer(speaker);
        buffer.push_str(delta);
        self.channels
            .publish_transcript(turn, speaker, buffer, SegmentKind::Partial);
    }

    fn complete_turn(&mut self) {
        let turn = self.transcripts.turn;
        for speaker in [Speaker::User, Speaker::Agent] {
            let text = std::mem::take(self.transcripts.buffer(speaker));
            if !text.is_empty() {
                self.channels
                    .publish_transcript(turn, speaker, &text, SegmentKind::Final);
            }
        }
        self.transcripts.turn += 1;
        debug!(turn, "turn complete");
    }

    /// Local half of session teardown: stop playback, release the output
    /// device, return to idle, drop transcripts.
    ///
    /// Each step runs regardless of the others. `running` is cleared
    /// together with the idle transition.
    pub fn teardown(&mut self, trigger: Trigger, detail: Option<String>, running: &AtomicBool) {
        self.forwarding.store(false, Ordering::Release);

        self.sink.stop_all();
        let cut = self.scheduler.flush();
        self.diagnostics
            .units_flushed
            .fetch_add(cut, Ordering::Relaxed);
        debug!(cut, "playback flushed for teardown");

        self.sink.release();
        debug!("output released");

        self.transcripts = Transcripts::default();

        match self.machine.apply(trigger) {
            Some(t) => self.channels.publish_idle(&t, detail, running),
            None => {
                debug!(state = %self.state(), ?trigger, "teardown trigger did not apply");
                running.store(false, Ordering::SeqCst);
            }
        }
        info!("session torn down");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codec::{encode_frame, AudioFrame, EncodedChunk};
    use crate::playback::PlaybackUnit;
    use approx::assert_abs_diff_eq;

    const RATE: u32 = 24_000;

    /// Sink with a hand-driven clock that records every call.
    #[derive(Clone, Default)]
    pub(crate) struct FakeSink {
        pub(crate) inner: Arc<Mutex<FakeSinkState>>,
    }

    #[derive(Default)]
    pub(crate) struct FakeSinkState {
        pub(crate) now: f64,
        pub(crate) played: Vec<(u64, f64, f64)>,
        pub(crate) stops: usize,
        pub(crate) released: bool,
    }

    impl FakeSink {
        pub(crate) fn set_time(&self, now: f64) {
            self.inner.lock().now = now;
        }
    }

    impl PlaybackSink for FakeSink {
        fn current_time(&self) -> f64 {
            self.inner.lock().now
        }

        fn play(&mut self, unit: &PlaybackUnit) {
            self.inner
                .lock()
                .played
                .push((unit.id, unit.start, unit.duration()));
        }

        fn stop_all(&mut self) {
            self.inner.lock().stops += 1;
        }

        fn release(&mut self) {
            self.inner.lock().released = true;
        }
    }

    pub(crate) fn chunk_of(secs: f64) -> EncodedChunk {
        let n = (secs * RATE as f64).round() as usize;
        encode_frame(&AudioFrame::new(vec![1200; n], RATE))
    }

    fn live_core() -> (SessionCore<FakeSink>, FakeSink, SessionChannels) {
        let channels = SessionChannels::new();
        let mut machine = SessionStateMachine::new();
        machine.apply(Trigger::StartRequested);
        let sink = FakeSink::default();
        let mut core = SessionCore::new(
            machine,
            PlaybackScheduler::new(RATE, 1),
            sink.clone(),
            channels.clone(),
            Arc::new(AtomicBool::new(false)),
            Arc::new(PlaybackDiagnostics::default()),
        );
        assert_eq!(core.handle_event(TransportEvent::Opened), Control::Continue);
        assert_eq!(core.state(), SessionState::Listening);
        (core, sink, channels)
    }

    #[test]
    fn three_contiguous_chunks_form_one_span() {
        let (mut core, sink, _) = live_core();
        for _ in 0..3 {
            core.handle_event(TransportEvent::Audio(chunk_of(0.5)));
        }
        assert_eq!(core.state(), SessionState::Speaking);

        let played = sink.inner.lock().played.clone();
        let starts: Vec<f64> = played.iter().map(|(_, start, _)| *start).collect();
        assert_abs_diff_eq!(starts[0], 0.0);
        assert_abs_diff_eq!(starts[1], 0.5, epsilon = 1e-9);
        assert_abs_diff_eq!(starts[2], 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(core.scheduler().virtual_clock(), 1.5, epsilon = 1e-9);

        // Still speaking until the last unit ends.
        sink.set_time(1.2);
        assert_eq!(core.tick(), 2);
        assert_eq!(core.state(), SessionState::Speaking);
        sink.set_time(1.5);
        assert_eq!(core.tick(), 1);
        assert_eq!(core.state(), SessionState::Listening);
    }

    #[test]
    fn interruption_mid_playback_flushes_before_next_chunk() {
        let (mut core, sink, _) = live_core();
        core.handle_event(TransportEvent::Audio(chunk_of(0.5)));
        sink.set_time(0.2);

        core.handle_event(TransportEvent::Interrupted);
        assert_eq!(core.scheduler().active_len(), 0);
        assert_eq!(core.scheduler().virtual_clock(), 0.0);
        assert_eq!(core.state(), SessionState::Listening);
        assert_eq!(sink.inner.lock().stops, 1);

        // Next chunk is placed at the device time, not after the stale unit.
        core.handle_event(TransportEvent::Audio(chunk_of(0.5)));
        let (_, start, _) = *sink.inner.lock().played.last().unwrap();
        assert_abs_diff_eq!(start, 0.2);
    }

    #[test]
    fn malformed_chunk_is_skipped_and_session_continues() {
        let (mut core, sink, _) = live_core();
        let control = core.handle_event(TransportEvent::Audio(EncodedChunk::from_wire("!!")));
        assert_eq!(control, Control::Continue);
        assert_eq!(core.state(), SessionState::Listening);
        assert!(sink.inner.lock().played.is_empty());

        core.handle_event(TransportEvent::Audio(chunk_of(0.1)));
        assert_eq!(core.state(), SessionState::Speaking);
    }

    #[test]
    fn audio_before_open_is_dropped() {
        let channels = SessionChannels::new();
        let mut machine = SessionStateMachine::new();
        machine.apply(Trigger::StartRequested);
        let sink = FakeSink::default();
        let mut core = SessionCore::new(
            machine,
            PlaybackScheduler::new(RATE, 1),
            sink.clone(),
            channels,
            Arc::new(AtomicBool::new(false)),
            Arc::new(PlaybackDiagnostics::default()),
        );
        core.handle_event(TransportEvent::Audio(chunk_of(0.1)));
        assert_eq!(core.state(), SessionState::Connecting);
        assert!(sink.inner.lock().played.is_empty());
    }

    #[test]
    fn transcripts_accumulate_and_commit_on_turn_complete() {
        let (mut core, _, channels) = live_core();
        let mut rx = channels.subscribe_transcripts();

        core.handle_event(TransportEvent::InputTranscript("my vpn ".into()));
        core.handle_event(TransportEvent::InputTranscript("is down".into()));
        core.handle_event(TransportEvent::OutputTranscript("Restart it.".into()));
        core.handle_event(TransportEvent::TurnComplete);

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        let texts: Vec<_> = events
            .iter()
            .map(|e| (e.speaker, e.kind, e.text.as_str()))
            .collect();
        assert_eq!(
            texts,
            vec![
                (Speaker::User, SegmentKind::Partial, "my vpn "),
                (Speaker::User, SegmentKind::Partial, "my vpn is down"),
                (Speaker::Agent, SegmentKind::Partial, "Restart it."),
                (Speaker::User, SegmentKind::Final, "my vpn is down"),
                (Speaker::Agent, SegmentKind::Final, "Restart it."),
            ]
        );
        assert!(events.iter().all(|e| e.turn == 0));

        core.handle_event(TransportEvent::OutputTranscript("Next".into()));
        let next = rx.try_recv().expect("next turn delta");
        assert_eq!((next.turn, next.text.as_str()), (1, "Next"));
    }

    #[test]
    fn close_and_error_request_shutdown() {
        let (mut core, _, _) = live_core();
        assert_eq!(
            core.handle_event(TransportEvent::Closed(Some("bye".into()))),
            Control::Shutdown {
                trigger: Trigger::TransportClosed,
                detail: Some("bye".into())
            }
        );
        assert!(matches!(
            core.handle_event(TransportEvent::Error("boom".into())),
            Control::Shutdown {
                trigger: Trigger::Failed,
                ..
            }
        ));
    }

    #[test]
    fn teardown_flushes_releases_and_idles() {
        let (mut core, sink, channels) = live_core();
        let mut status = channels.subscribe_status();
        core.handle_event(TransportEvent::Audio(chunk_of(0.5)));
        core.handle_event(TransportEvent::OutputTranscript("partial".into()));

        let running = AtomicBool::new(true);
        core.teardown(Trigger::StopRequested, None, &running);

        assert!(!running.load(Ordering::SeqCst));
        assert_eq!(core.state(), SessionState::Idle);
        assert_eq!(channels.state(), SessionState::Idle);
        assert!(core.scheduler().is_idle());
        assert_eq!(core.scheduler().virtual_clock(), 0.0);
        let fake = sink.inner.lock();
        assert!(fake.released);
        assert_eq!(fake.stops, 1);
        drop(fake);

        let last = std::iter::from_fn(|| status.try_recv().ok())
            .last()
            .expect("status events");
        assert_eq!(last.status, SessionState::Idle);
    }
}
