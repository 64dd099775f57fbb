//! Audio sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! ## Design
//!
//! `cpal` opens devices at their native rate (commonly 44.1 or 48 kHz). The
//! live agent wants 16 kHz mono in and sends 24 kHz mono out.
//! `RateConverter` bridges both directions on non-RT threads, where
//! allocation is allowed.
//!
//! When source rate == target rate, `RateConverter` is a passthrough and no
//! rubato session is created at all.
//!
//! ## Usage
//!
//! ```ignore
//! // Streaming (capture): remainder is carried to the next call.
//! let mut rc = RateConverter::new(48_000, 16_000, 960)?;
//! let out = rc.process(&raw_samples);
//!
//! // Whole-buffer (playback): one agent chunk in, one device buffer out.
//! let mut rc = RateConverter::new(24_000, 48_000, 480)?;
//! let out = rc.process_all(&unit_samples);
//! ```

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

use crate::error::{Result, VoiceError};

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` when source rate == target rate (passthrough mode).
    resampler: Option<FastFixedIn<f32>>,
    /// Accumulation buffer; holds partial input chunks between calls.
    input_buf: Vec<f32>,
    /// How many input samples rubato expects per process call.
    chunk_size: usize,
    /// Pre-allocated output buffer: `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
    ratio: f64,
}

impl RateConverter {
    /// Create a new converter.
    ///
    /// # Errors
    /// Returns `VoiceError::AudioDevice` if rubato fails to initialise.
    pub fn new(source_rate: u32, target_rate: u32, chunk_size: usize) -> Result<Self> {
        if source_rate == 0 || target_rate == 0 {
            return Err(VoiceError::AudioDevice(format!(
                "invalid resampler rates {source_rate} -> {target_rate}"
            )));
        }
        let ratio = target_rate as f64 / source_rate as f64;

        if source_rate == target_rate {
            return Ok(Self {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
                ratio,
            });
        }

        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio, no dynamic adjustment
            PolynomialDegree::Cubic,
            chunk_size,
            1, // mono
        )
        .map_err(|e| VoiceError::AudioDevice(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        let output_buf = vec![vec![0f32; max_out]; 1];

        tracing::info!(
            source_rate,
            target_rate,
            chunk_size,
            max_out,
            "resampling enabled"
        );

        Ok(Self {
            resampler: Some(resampler),
            input_buf: Vec::new(),
            chunk_size,
            output_buf,
            ratio,
        })
    }

    /// Process incoming samples, returning resampled output (may be empty).
    ///
    /// Samples are accumulated internally until a full `chunk_size` block is
    /// available for rubato. Any remainder is kept for the next call.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        if self.resampler.is_none() {
            return samples.to_vec();
        }

        self.input_buf.extend_from_slice(samples);

        let mut result = Vec::new();
        while self.input_buf.len() >= self.chunk_size {
            self.run_block(&mut result);
            self.input_buf.drain(..self.chunk_size);
        }
        result
    }

    /// Convert a complete buffer, flushing the tail.
    ///
    /// Output length is `round(len * ratio)`. The final partial block is
    /// zero-padded and the resampler state is reset afterwards, so
    /// consecutive calls are independent of each other.
    pub fn process_all(&mut self, samples: &[f32]) -> Vec<f32> {
        if self.resampler.is_none() {
            return samples.to_vec();
        }

        let expected = (samples.len() as f64 * self.ratio).round() as usize;
        let mut result = self.process(samples);

        // Each padded block yields roughly chunk_size * ratio samples; a few
        // extra blocks cover the interpolator delay.
        let mut guard = 0;
        while result.len() < expected && guard < 8 {
            self.input_buf.resize(self.chunk_size, 0.0);
            self.run_block(&mut result);
            self.input_buf.clear();
            guard += 1;
        }

        result.truncate(expected);
        self.input_buf.clear();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
        result
    }

    fn run_block(&mut self, result: &mut Vec<f32>) {
        let Some(ref mut resampler) = self.resampler else {
            return;
        };
        let input_slice = &self.input_buf[..self.chunk_size];
        match resampler.process_into_buffer(&[input_slice], &mut self.output_buf, None) {
            Ok((_consumed, produced)) => {
                result.extend_from_slice(&self.output_buf[0][..produced]);
            }
            Err(e) => {
                error!("resampler process error: {e}");
            }
        }
    }

    /// Returns `true` when source rate == target rate (no resampling occurs).
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}
