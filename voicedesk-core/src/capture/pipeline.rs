//! Blocking capture loop.
//!
//! ## Stages (per iteration)
//!
//! ```text
//! 1. Drain ring buffer → Vec<f32> (device rate, mono)
//! 2. Resample to the transport input rate
//! 3. Frame into fixed-size blocks
//! 4. PCM16 + base64 encode each block
//! 5. Send through the transport sender (or discard until the session is open)
//! ```
//!
//! Runs in `spawn_blocking` on the same thread that owns the input stream.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, OnceLock,
};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::{CaptureDiagnostics, Framer};
use crate::audio::resample::RateConverter;
use crate::buffering::{AudioConsumer, Consumer};
use crate::codec::encode_frame;
use crate::error::Result;
use crate::transport::{PushOutcome, TransportSender};

/// 20 ms at 48 kHz.
const DRAIN_CHUNK: usize = 960;

const DEFAULT_SLEEP_EMPTY_MS: u64 = 5;

pub struct CaptureContext {
    pub block_size: usize,
    /// Transport input rate (16 kHz).
    pub target_rate: u32,
    pub consumer: AudioConsumer,
    pub running: Arc<AtomicBool>,
    /// Raised once the transport reports it is open.
    pub forwarding: Arc<AtomicBool>,
    pub sender: TransportSender,
    pub capture_sample_rate: u32,
    pub diagnostics: Arc<CaptureDiagnostics>,
}

/// A capture loop whose resampler is already built.
///
/// Construction is the last step that can fail, so callers confirm the
/// capture source as open only after [`CapturePipeline::new`] succeeds.
pub struct CapturePipeline {
    ctx: CaptureContext,
    resampler: RateConverter,
}

impl CapturePipeline {
    pub fn new(ctx: CaptureContext) -> Result<Self> {
        let resampler = RateConverter::new(ctx.capture_sample_rate, ctx.target_rate, DRAIN_CHUNK)
            .inspect_err(|e| error!("failed to create capture resampler: {e}"))?;
        Ok(Self { ctx, resampler })
    }

    /// Run until `running` becomes false.
    pub fn run(self) {
        let Self {
            mut ctx,
            mut resampler,
        } = self;
        info!(
            capture_rate = ctx.capture_sample_rate,
            target_rate = ctx.target_rate,
            block_size = ctx.block_size,
            "capture pipeline started"
        );

        let mut framer = Framer::new(ctx.block_size, ctx.target_rate);
        let mut raw = vec![0f32; DRAIN_CHUNK];
        let mut seq = 0u64;

        loop {
            if !ctx.running.load(Ordering::Relaxed) {
                break;
            }

            let n = ctx.consumer.pop_slice(&mut raw);
            if n == 0 {
                std::thread::sleep(Duration::from_millis(empty_sleep_ms()));
                continue;
            }
            ctx.diagnostics.frames_in.fetch_add(n, Ordering::Relaxed);

            let resampled = resampler.process(&raw[..n]);
            if resampled.is_empty() {
                continue;
            }
            ctx.diagnostics
                .frames_resampled
                .fetch_add(resampled.len(), Ordering::Relaxed);

            for frame in framer.push(&resampled) {
                let chunk = encode_frame(&frame);
                ctx.diagnostics.frames_encoded.fetch_add(1, Ordering::Relaxed);

                if !ctx.forwarding.load(Ordering::Acquire) {
                    ctx.diagnostics
                        .frames_discarded
                        .fetch_add(1, Ordering::Relaxed);
                    continue;
                }

                match ctx.sender.send(chunk) {
                    PushOutcome::Queued => {
                        ctx.diagnostics.frames_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    PushOutcome::Evicted => {
                        ctx.diagnostics.frames_sent.fetch_add(1, Ordering::Relaxed);
                        ctx.diagnostics
                            .frames_dropped
                            .fetch_add(1, Ordering::Relaxed);
                        warn!(seq, "outbound queue full: dropped oldest frame");
                    }
                    PushOutcome::Rejected => {
                        ctx.diagnostics
                            .frames_dropped
                            .fetch_add(1, Ordering::Relaxed);
                        if ctx.sender.is_closed() {
                            debug!(seq, "outbound queue closed, frame not sent");
                        } else {
                            warn!(seq, "outbound queue full: dropped newest frame");
                        }
                    }
                }
                seq += 1;
            }
        }

        info!(
            frames = seq,
            partial = framer.pending_len(),
            "capture pipeline stopped"
        );
    }
}

fn empty_sleep_ms() -> u64 {
    static EMPTY_SLEEP_MS: OnceLock<u64> = OnceLock::new();
    *EMPTY_SLEEP_MS.get_or_init(|| {
        std::env::var("VOICEDESK_CAPTURE_EMPTY_SLEEP_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(|v| v.clamp(1, 20))
            .unwrap_or(DEFAULT_SLEEP_EMPTY_MS)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;
    use std::time::Instant;

    use crate::buffering::{create_audio_ring, Producer};
    use crate::codec::{decode_pcm16, EncodedChunk};
    use crate::transport::{OutboundQueue, OverflowPolicy};

    struct Harness {
        producer: crate::buffering::AudioProducer,
        running: Arc<AtomicBool>,
        forwarding: Arc<AtomicBool>,
        outbound: Arc<OutboundQueue>,
        diagnostics: Arc<CaptureDiagnostics>,
        thread: thread::JoinHandle<()>,
    }

    fn spawn(block_size: usize, queue_cap: usize, forwarding: bool) -> Harness {
        let (producer, consumer) = create_audio_ring(16_384);
        let running = Arc::new(AtomicBool::new(true));
        let forwarding = Arc::new(AtomicBool::new(forwarding));
        let outbound = Arc::new(OutboundQueue::new(queue_cap, OverflowPolicy::DropOldest));
        let diagnostics = Arc::new(CaptureDiagnostics::default());
        let ctx = CaptureContext {
            block_size,
            target_rate: 16_000,
            consumer,
            running: Arc::clone(&running),
            forwarding: Arc::clone(&forwarding),
            sender: TransportSender::new(Arc::clone(&outbound)),
            capture_sample_rate: 16_000,
            diagnostics: Arc::clone(&diagnostics),
        };
        let pipeline = CapturePipeline::new(ctx).expect("pipeline");
        let thread = thread::spawn(move || pipeline.run());
        Harness {
            producer,
            running,
            forwarding,
            outbound,
            diagnostics,
            thread,
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn stop(h: Harness) -> (Arc<OutboundQueue>, Arc<CaptureDiagnostics>) {
        h.running.store(false, Ordering::Relaxed);
        h.thread.join().expect("capture thread");
        (h.outbound, h.diagnostics)
    }

    #[test]
    fn frames_reach_the_queue_in_capture_order() {
        let mut h = spawn(4, 16, true);
        let ramp: Vec<f32> = (0..10).map(|i| i as f32 / 32768.0).collect();
        assert_eq!(h.producer.push_slice(&ramp), 10);

        let diag = Arc::clone(&h.diagnostics);
        wait_until(|| {
            let snap = diag.snapshot();
            snap.frames_in == 10 && snap.frames_sent == 2
        });
        let (outbound, diagnostics) = stop(h);

        let frames: Vec<Vec<i16>> = std::iter::from_fn(|| outbound.try_pop())
            .map(|c: EncodedChunk| decode_pcm16(&c).expect("pcm"))
            .collect();
        assert_eq!(frames, vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7]]);

        let snap = diagnostics.snapshot();
        assert_eq!(snap.frames_in, 10);
        assert_eq!(snap.frames_encoded, 2);
        assert_eq!(snap.frames_discarded, 0);
    }

    #[test]
    fn frames_before_open_are_discarded() {
        let mut h = spawn(4, 16, false);
        h.producer.push_slice(&[0.1; 8]);
        let diag = Arc::clone(&h.diagnostics);
        wait_until(|| diag.snapshot().frames_discarded == 2);

        h.forwarding.store(true, Ordering::Release);
        h.producer.push_slice(&[0.2; 4]);
        let diag = Arc::clone(&h.diagnostics);
        wait_until(|| diag.snapshot().frames_sent == 1);

        let (outbound, _) = stop(h);
        assert_eq!(outbound.len(), 1);
        let pcm = decode_pcm16(&outbound.try_pop().unwrap()).unwrap();
        assert_eq!(pcm, vec![6553; 4]);
    }

    #[test]
    fn unusable_capture_rate_fails_at_construction() {
        let (_producer, consumer) = create_audio_ring(1024);
        let ctx = CaptureContext {
            block_size: 4,
            target_rate: 16_000,
            consumer,
            running: Arc::new(AtomicBool::new(true)),
            forwarding: Arc::new(AtomicBool::new(true)),
            sender: TransportSender::new(Arc::new(OutboundQueue::new(4, OverflowPolicy::DropOldest))),
            capture_sample_rate: 0,
            diagnostics: Arc::new(CaptureDiagnostics::default()),
        };
        assert!(CapturePipeline::new(ctx).is_err());
    }

    #[test]
    fn overflow_is_counted_as_dropped() {
        let mut h = spawn(2, 2, true);
        h.producer.push_slice(&[0.0; 10]);
        let diag = Arc::clone(&h.diagnostics);
        wait_until(|| diag.snapshot().frames_encoded == 5);
        let (outbound, diagnostics) = stop(h);

        assert_eq!(outbound.len(), 2);
        assert_eq!(diagnostics.snapshot().frames_dropped, 3);
        assert_eq!(outbound.dropped(), 3);
    }
}
