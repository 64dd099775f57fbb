//! Bounded outbound frame queue.
//!
//! The capture thread pushes synchronously; the connection task pops
//! asynchronously. When the link cannot keep up the queue sheds frames
//! according to an explicit [`OverflowPolicy`] instead of growing without
//! bound. FIFO order is preserved for everything that is kept.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::codec::EncodedChunk;

/// What to discard when a push finds the queue full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Drop the stalest queued frame; the newest audio always gets through.
    #[default]
    DropOldest,
    /// Refuse the incoming frame and keep the backlog intact.
    DropNewest,
}

/// Outcome of a single push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest frame.
    Evicted,
    /// Not queued (full under `DropNewest`, or the queue is closed).
    Rejected,
}

#[derive(Debug)]
pub struct OutboundQueue {
    frames: Mutex<VecDeque<EncodedChunk>>,
    capacity: usize,
    policy: OverflowPolicy,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicUsize,
}

impl OutboundQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            policy,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicUsize::new(0),
        }
    }

    /// Enqueue one frame without blocking.
    pub fn push(&self, chunk: EncodedChunk) -> PushOutcome {
        if self.closed.load(Ordering::Acquire) {
            return PushOutcome::Rejected;
        }
        let outcome = {
            let mut frames = self.frames.lock();
            if frames.len() < self.capacity {
                frames.push_back(chunk);
                PushOutcome::Queued
            } else {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        frames.pop_front();
                        frames.push_back(chunk);
                        PushOutcome::Evicted
                    }
                    OverflowPolicy::DropNewest => PushOutcome::Rejected,
                }
            }
        };
        match outcome {
            PushOutcome::Queued => self.notify.notify_one(),
            PushOutcome::Evicted => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.notify.notify_one();
            }
            PushOutcome::Rejected => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        outcome
    }

    /// Wait for the next frame. Returns `None` once closed and drained.
    ///
    /// Single consumer only.
    pub async fn pop(&self) -> Option<EncodedChunk> {
        loop {
            if let Some(chunk) = self.frames.lock().pop_front() {
                return Some(chunk);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn try_pop(&self) -> Option<EncodedChunk> {
        self.frames.lock().pop_front()
    }

    /// Refuse further pushes and wake the consumer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// Frames shed by the overflow policy since creation.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}
