//! Lock-free SPSC ring buffers between the realtime audio callbacks and the
//! rest of the engine.
//!
//! Uses `ringbuf::HeapRb<f32>` which provides a wait-free `push_slice`
//! safe to call from a cpal callback.

pub mod chunk;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Producer half: held by the capture callback, or by the playback sink.
pub type AudioProducer = ringbuf::HeapProd<f32>;

/// Consumer half: held by the capture thread, or by the output callback.
pub type AudioConsumer = ringbuf::HeapCons<f32>;

/// Capture ring: 2^20 samples ≈ 21.8 s at 48 kHz.
pub const CAPTURE_RING_CAPACITY: usize = 1 << 20;

/// Playback ring: 2^21 mono frames ≈ 43.7 s at 48 kHz. One agent turn is
/// pushed faster than real time, so this has to hold a long answer.
pub const PLAYBACK_RING_CAPACITY: usize = 1 << 21;

/// Create a matched producer/consumer pair backed by a heap-allocated ring buffer.
pub fn create_audio_ring(capacity: usize) -> (AudioProducer, AudioConsumer) {
    HeapRb::<f32>::new(capacity).split()
}
