//! PCM sample conversion and the base64 transport encoding.
//!
//! Capture produces 16-bit little-endian PCM frames that travel as base64
//! text. Inbound agent audio arrives the same way and is normalised back
//! to f32 for playback.

use base64::{engine::general_purpose::STANDARD, Engine};

use crate::error::{Result, VoiceError};

/// Full-scale divisor shared by both conversion directions.
pub const PCM16_SCALE: f32 = 32768.0;

/// A fixed-length block of signed 16-bit mono samples at a known rate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Convert normalised f32 samples into a frame (see [`f32_to_i16`]).
    pub fn from_f32(samples: &[f32], sample_rate: u32) -> Self {
        Self::new(samples.iter().copied().map(f32_to_i16).collect(), sample_rate)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Raw little-endian byte image of the samples.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.samples.len() * 2);
        for s in &self.samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }
}

/// Scale a normalised sample by 32768 and truncate toward zero.
///
/// Out-of-range input saturates at the i16 bounds instead of wrapping,
/// so `1.0` maps to `32767` rather than overflowing.
pub fn f32_to_i16(sample: f32) -> i16 {
    let scaled = (sample * PCM16_SCALE).trunc();
    if scaled.is_nan() {
        return 0;
    }
    scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / PCM16_SCALE
}

/// Base64 text carrying one audio frame's raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk(String);

impl EncodedChunk {
    /// Wrap text received from the wire without validating it.
    ///
    /// Validation is deferred to [`decode_bytes`] so a corrupt chunk only
    /// fails at the point it is played.
    pub fn from_wire(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub fn encode_bytes(bytes: &[u8]) -> EncodedChunk {
    EncodedChunk(STANDARD.encode(bytes))
}

pub fn decode_bytes(chunk: &EncodedChunk) -> Result<Vec<u8>> {
    STANDARD
        .decode(chunk.as_str())
        .map_err(|e| VoiceError::Decode(format!("invalid base64: {e}")))
}

pub fn encode_frame(frame: &AudioFrame) -> EncodedChunk {
    encode_bytes(&frame.to_bytes())
}

/// Decode a chunk into 16-bit samples. An odd byte count is malformed.
pub fn decode_pcm16(chunk: &EncodedChunk) -> Result<Vec<i16>> {
    let bytes = decode_bytes(chunk)?;
    if bytes.len() % 2 != 0 {
        return Err(VoiceError::Decode(format!(
            "odd PCM16 byte length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// MIME tag the live protocol expects for raw PCM at `rate`.
pub fn pcm_mime_type(rate: u32) -> String {
    format!("audio/pcm;rate={rate}")
}
