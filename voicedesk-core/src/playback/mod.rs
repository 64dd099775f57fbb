//! Gapless playback scheduling on a virtual audio clock.
//!
//! ## Timeline
//!
//! ```text
//!   device clock ─────────●──────────────────────────────►
//!                        now
//!   units          [ u0 ][ u1 ][ u2 ]
//!                                    ▲
//!                              virtual clock
//! ```
//!
//! Each inbound chunk starts at `max(virtual_clock, now)` and the virtual
//! clock advances by the unit's duration as soon as it is scheduled, so
//! bursty arrivals still concatenate back to back. When playback has
//! stalled (`virtual_clock < now`) the next unit starts at `now` instead of
//! in the past.
//!
//! The scheduler never touches audio hardware itself. It hands every unit
//! to a [`PlaybackSink`], which also owns the device clock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use crate::buffering::chunk::AudioChunk;
use crate::codec::{decode_pcm16, i16_to_f32, EncodedChunk};
use crate::error::{Result, VoiceError};

/// A decoded chunk placed on the timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackUnit {
    pub id: u64,
    pub audio: AudioChunk,
    /// Start time on the device clock, in seconds.
    pub start: f64,
}

impl PlaybackUnit {
    pub fn duration(&self) -> f64 {
        self.audio.duration_secs()
    }

    pub fn end(&self) -> f64 {
        self.start + self.duration()
    }
}

/// Output device contract used by the session core.
pub trait PlaybackSink: Send {
    /// Device clock in seconds. Monotonic for the lifetime of the sink.
    fn current_time(&self) -> f64;

    /// Queue a unit for playback at `unit.start`.
    fn play(&mut self, unit: &PlaybackUnit);

    /// Silence everything queued or playing, immediately.
    fn stop_all(&mut self);

    /// Give the device back. Called once at session teardown.
    fn release(&mut self) {}
}

impl<S: PlaybackSink + ?Sized> PlaybackSink for Box<S> {
    fn current_time(&self) -> f64 {
        (**self).current_time()
    }

    fn play(&mut self, unit: &PlaybackUnit) {
        (**self).play(unit)
    }

    fn stop_all(&mut self) {
        (**self).stop_all()
    }

    fn release(&mut self) {
        (**self).release()
    }
}

#[derive(Debug, Default)]
pub struct PlaybackDiagnostics {
    pub units_scheduled: AtomicUsize,
    pub units_completed: AtomicUsize,
    pub units_flushed: AtomicUsize,
    /// Malformed inbound chunks that were skipped.
    pub decode_errors: AtomicUsize,
    /// Audio that arrived while the session was not live.
    pub chunks_ignored: AtomicUsize,
    pub interruptions: AtomicUsize,
}

impl PlaybackDiagnostics {
    pub fn reset(&self) {
        self.units_scheduled.store(0, Ordering::Relaxed);
        self.units_completed.store(0, Ordering::Relaxed);
        self.units_flushed.store(0, Ordering::Relaxed);
        self.decode_errors.store(0, Ordering::Relaxed);
        self.chunks_ignored.store(0, Ordering::Relaxed);
        self.interruptions.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        PlaybackSnapshot {
            units_scheduled: self.units_scheduled.load(Ordering::Relaxed),
            units_completed: self.units_completed.load(Ordering::Relaxed),
            units_flushed: self.units_flushed.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            chunks_ignored: self.chunks_ignored.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackSnapshot {
    pub units_scheduled: usize,
    pub units_completed: usize,
    pub units_flushed: usize,
    pub decode_errors: usize,
    pub chunks_ignored: usize,
    pub interruptions: usize,
}

/// Registration of one unit in the active playback set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSpan {
    pub id: u64,
    pub start: f64,
    pub end: f64,
}

/// Owns the virtual clock and the active playback set.
#[derive(Debug)]
pub struct PlaybackScheduler {
    sample_rate: u32,
    channels: u16,
    /// End of the last scheduled unit; 0 at session/turn start.
    next_start: f64,
    /// Ordered by start time; spans never overlap.
    active: VecDeque<ScheduledSpan>,
    next_id: u64,
}

impl PlaybackScheduler {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels: channels.max(1),
            next_start: 0.0,
            active: VecDeque::new(),
            next_id: 0,
        }
    }

    /// Decode a chunk into normalised samples at the output format.
    ///
    /// # Errors
    /// `VoiceError::Decode` for invalid base64, an odd byte count, a sample
    /// count that does not divide into whole frames, or an empty chunk.
    pub fn decode(&self, chunk: &EncodedChunk) -> Result<AudioChunk> {
        let pcm = decode_pcm16(chunk)?;
        if pcm.is_empty() {
            return Err(VoiceError::Decode("empty audio chunk".into()));
        }
        if pcm.len() % self.channels as usize != 0 {
            return Err(VoiceError::Decode(format!(
                "{} samples do not fill {}-channel frames",
                pcm.len(),
                self.channels
            )));
        }
        let samples = pcm.into_iter().map(i16_to_f32).collect();
        Ok(AudioChunk::with_channels(
            samples,
            self.sample_rate,
            self.channels,
        ))
    }

    /// Decode and place one inbound chunk on the timeline.
    ///
    /// On error nothing is registered and the clock does not move.
    pub fn schedule(&mut self, chunk: &EncodedChunk, now: f64) -> Result<PlaybackUnit> {
        let audio = self.decode(chunk)?;
        let start = self.next_start.max(now);
        let unit = PlaybackUnit {
            id: self.next_id,
            audio,
            start,
        };
        self.next_id += 1;
        self.next_start = unit.end();
        self.active.push_back(ScheduledSpan {
            id: unit.id,
            start: unit.start,
            end: unit.end(),
        });
        debug!(
            unit_id = unit.id,
            start = unit.start,
            duration = unit.duration(),
            active = self.active.len(),
            "scheduled playback unit"
        );
        Ok(unit)
    }

    /// Deregister every unit whose audio has fully played by `now`.
    ///
    /// Returns how many units completed.
    pub fn reap(&mut self, now: f64) -> usize {
        let mut completed = 0;
        while let Some(front) = self.active.front() {
            if front.end > now {
                break;
            }
            self.active.pop_front();
            completed += 1;
        }
        completed
    }

    /// Clear the active set and reset the virtual clock to zero.
    ///
    /// Returns how many units were cut off.
    pub fn flush(&mut self) -> usize {
        let cut = self.active.len();
        self.active.clear();
        self.next_start = 0.0;
        cut
    }

    pub fn virtual_clock(&self) -> f64 {
        self.next_start
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }

    /// Audio still to be played after `now`, in seconds.
    pub fn pending_duration(&self, now: f64) -> f64 {
        self.active
            .iter()
            .filter(|s| s.end > now)
            .map(|s| s.end - s.start.max(now))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_frame, AudioFrame};
    use approx::assert_abs_diff_eq;

    const RATE: u32 = 24_000;

    fn chunk_of(secs: f64) -> EncodedChunk {
        let n = (secs * RATE as f64).round() as usize;
        encode_frame(&AudioFrame::new(vec![1000; n], RATE))
    }

    #[test]
    fn first_unit_starts_now_and_successors_are_contiguous() {
        let mut sched = PlaybackScheduler::new(RATE, 1);
        let a = sched.schedule(&chunk_of(0.5), 3.0).unwrap();
        let b = sched.schedule(&chunk_of(0.25), 3.1).unwrap();
        let c = sched.schedule(&chunk_of(0.5), 3.2).unwrap();

        assert_abs_diff_eq!(a.start, 3.0);
        assert_eq!(b.start, a.end());
        assert_eq!(c.start, b.end());
        assert_abs_diff_eq!(sched.virtual_clock(), 4.25, epsilon = 1e-9);
    }

    #[test]
    fn stalled_timeline_does_not_schedule_in_the_past() {
        let mut sched = PlaybackScheduler::new(RATE, 1);
        sched.schedule(&chunk_of(0.5), 0.0).unwrap();
        // Next chunk arrives long after the first finished.
        let late = sched.schedule(&chunk_of(0.5), 2.0).unwrap();
        assert_abs_diff_eq!(late.start, 2.0);
        assert_abs_diff_eq!(sched.virtual_clock(), 2.5, epsilon = 1e-9);
    }

    #[test]
    fn pending_duration_matches_clock_minus_now() {
        let mut sched = PlaybackScheduler::new(RATE, 1);
        for _ in 0..4 {
            sched.schedule(&chunk_of(0.3), 1.0).unwrap();
        }
        for now in [1.0, 1.1, 1.45, 2.0, 2.19] {
            let expected = (sched.virtual_clock() - now).max(0.0);
            assert_abs_diff_eq!(sched.pending_duration(now), expected, epsilon = 1e-9);
        }
    }

    #[test]
    fn spans_never_overlap() {
        let mut sched = PlaybackScheduler::new(RATE, 1);
        let arrivals = [0.0, 0.01, 0.02, 1.7, 1.71, 5.0];
        let lengths = [0.2, 0.5, 0.1, 0.3, 0.3, 0.05];
        for (now, len) in arrivals.iter().zip(lengths) {
            sched.schedule(&chunk_of(len), *now).unwrap();
        }
        let spans: Vec<_> = sched.active.iter().copied().collect();
        for pair in spans.windows(2) {
            assert!(pair[0].end <= pair[1].start, "{:?} overlaps {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn reap_deregisters_only_finished_units() {
        let mut sched = PlaybackScheduler::new(RATE, 1);
        sched.schedule(&chunk_of(0.5), 0.0).unwrap();
        sched.schedule(&chunk_of(0.5), 0.0).unwrap();

        assert_eq!(sched.reap(0.49), 0);
        assert_eq!(sched.reap(0.5), 1);
        assert_eq!(sched.active_len(), 1);
        assert_eq!(sched.reap(2.0), 1);
        assert!(sched.is_idle());
        // Reaping does not rewind the clock.
        assert_abs_diff_eq!(sched.virtual_clock(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn flush_empties_set_and_zeroes_clock() {
        let mut sched = PlaybackScheduler::new(RATE, 1);
        sched.schedule(&chunk_of(0.5), 4.0).unwrap();
        sched.schedule(&chunk_of(0.5), 4.0).unwrap();

        assert_eq!(sched.flush(), 2);
        assert!(sched.is_idle());
        assert_eq!(sched.virtual_clock(), 0.0);

        // Next unit is placed relative to zero, i.e. at the device time.
        let next = sched.schedule(&chunk_of(0.5), 4.2).unwrap();
        assert_abs_diff_eq!(next.start, 4.2);
    }

    #[test]
    fn malformed_chunk_leaves_state_untouched() {
        let mut sched = PlaybackScheduler::new(RATE, 1);
        sched.schedule(&chunk_of(0.5), 0.0).unwrap();
        let before = sched.virtual_clock();

        let odd = crate::codec::encode_bytes(&[1, 2, 3]);
        assert!(sched.schedule(&odd, 0.1).is_err());
        assert!(sched.schedule(&EncodedChunk::from_wire("%%%"), 0.1).is_err());
        assert!(sched.schedule(&crate::codec::encode_bytes(&[]), 0.1).is_err());

        assert_eq!(sched.virtual_clock(), before);
        assert_eq!(sched.active_len(), 1);
    }

    #[test]
    fn decode_normalises_by_full_scale() {
        let sched = PlaybackScheduler::new(RATE, 1);
        let chunk = encode_frame(&AudioFrame::new(vec![16384, -32768, 0], RATE));
        let audio = sched.decode(&chunk).unwrap();
        assert_eq!(audio.samples, vec![0.5, -1.0, 0.0]);
        assert_eq!(audio.sample_rate, RATE);
    }

    #[test]
    fn stereo_decode_requires_whole_frames() {
        let sched = PlaybackScheduler::new(RATE, 2);
        let odd_frames = encode_frame(&AudioFrame::new(vec![1, 2, 3], RATE));
        assert!(sched.decode(&odd_frames).is_err());
        let ok = encode_frame(&AudioFrame::new(vec![1, 2, 3, 4], RATE));
        assert_eq!(sched.decode(&ok).unwrap().frames(), 2);
    }
}
