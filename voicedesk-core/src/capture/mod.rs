//! Capture pipeline: microphone samples → fixed-size PCM16 frames → base64
//! chunks on the outbound queue.
//!
//! ```text
//!  cpal callback ──ring──► CapturePipeline ──► RateConverter ──► Framer ──► encode ──► OutboundQueue
//!   (device rate)                    (→ 16 kHz)       (2048)     (base64)
//! ```
//!
//! Nothing here buffers more than one partial block; everything beyond that
//! is either on the wire queue or still in the capture ring.

pub mod pipeline;

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::codec::AudioFrame;

pub use pipeline::{CaptureContext, CapturePipeline};

/// Splits a continuous sample stream into equal-length frames.
#[derive(Debug)]
pub struct Framer {
    block_size: usize,
    sample_rate: u32,
    pending: Vec<f32>,
}

impl Framer {
    pub fn new(block_size: usize, sample_rate: u32) -> Self {
        let block_size = block_size.max(1);
        Self {
            block_size,
            sample_rate,
            pending: Vec::with_capacity(block_size),
        }
    }

    /// Append samples and return every block that is now complete.
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        let mut frames = Vec::new();
        let mut rest = samples;
        while !rest.is_empty() {
            let take = (self.block_size - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.pending.len() == self.block_size {
                frames.push(AudioFrame::from_f32(&self.pending, self.sample_rate));
                self.pending.clear();
            }
        }
        frames
    }

    /// Samples waiting for the next block to fill.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Drop the partial block.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[derive(Debug, Default)]
pub struct CaptureDiagnostics {
    pub frames_in: AtomicUsize,
    pub frames_resampled: AtomicUsize,
    pub frames_encoded: AtomicUsize,
    pub frames_sent: AtomicUsize,
    /// Encoded before the transport opened, never queued.
    pub frames_discarded: AtomicUsize,
    /// Shed by the outbound queue's overflow policy.
    pub frames_dropped: AtomicUsize,
}

impl CaptureDiagnostics {
    pub fn reset(&self) {
        self.frames_in.store(0, Ordering::Relaxed);
        self.frames_resampled.store(0, Ordering::Relaxed);
        self.frames_encoded.store(0, Ordering::Relaxed);
        self.frames_sent.store(0, Ordering::Relaxed);
        self.frames_discarded.store(0, Ordering::Relaxed);
        self.frames_dropped.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CaptureSnapshot {
        CaptureSnapshot {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_resampled: self.frames_resampled.load(Ordering::Relaxed),
            frames_encoded: self.frames_encoded.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_discarded: self.frames_discarded.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Counters are in samples, except `frames_encoded`, `frames_sent`,
/// `frames_discarded` and `frames_dropped`, which count whole frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureSnapshot {
    pub frames_in: usize,
    pub frames_resampled: usize,
    pub frames_encoded: usize,
    pub frames_sent: usize,
    pub frames_discarded: usize,
    pub frames_dropped: usize,
}
