//! Compute kernel boundary
//!
//! The pool never does FFT work itself: each execution unit calls into a
//! [`SpectrogramKernel`]. [`StftKernel`] is the stock implementation on top
//! of `realfft`.

use std::f64::consts::PI;
use std::sync::Arc;

use parking_lot::Mutex;
use realfft::{RealFftPlanner, RealToComplex};
use rustfft::num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::task::{Quantize, StftParams};

/// Floor applied before taking the log of a magnitude
const MIN_MAGNITUDE: f32 = 1e-10;

/// Pure STFT function executed on the unit threads.
///
/// Output is column-major: `columns * stft.bins()` values, column `c`
/// computed from `audio[c * hop .. c * hop + fft_size]` (zero-padded past
/// the end of the slice).
pub trait SpectrogramKernel: Send + Sync {
    /// Runs once on each unit thread before the unit reports ready
    fn warm_up(&self) {}

    /// Linear magnitudes
    fn magnitudes(&self, audio: &[f32], columns: usize, stft: &StftParams) -> Vec<f32>;

    /// dB magnitudes quantized into `quantize`'s window
    fn quantized(
        &self,
        audio: &[f32],
        columns: usize,
        stft: &StftParams,
        quantize: Quantize,
    ) -> Vec<u8> {
        self.magnitudes(audio, columns, stft)
            .into_iter()
            .map(|m| quantize_db(m, quantize))
            .collect()
    }
}

/// Map a linear magnitude to 0..=255 through a dB window
pub fn quantize_db(magnitude: f32, quantize: Quantize) -> u8 {
    let db = 20.0 * magnitude.max(MIN_MAGNITUDE).log10();
    let t = ((db - quantize.db_floor) / quantize.db_range).clamp(0.0, 1.0);
    (t * 255.0).round() as u8
}

// ═══════════════════════════════════════════════════════════════════════════
// WINDOWS
// ═══════════════════════════════════════════════════════════════════════════

/// Analysis window shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WindowFunction {
    #[default]
    Hann,
    Hamming,
    Blackman,
    Rectangular,
}

impl WindowFunction {
    /// Symmetric window of `size` coefficients
    pub fn coefficients(&self, size: usize) -> Vec<f32> {
        if size <= 1 {
            return vec![1.0; size];
        }
        let denom = (size - 1) as f64;
        (0..size)
            .map(|i| {
                let x = 2.0 * PI * i as f64 / denom;
                let w = match self {
                    WindowFunction::Hann => 0.5 * (1.0 - x.cos()),
                    WindowFunction::Hamming => 0.54 - 0.46 * x.cos(),
                    WindowFunction::Blackman => 0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos(),
                    WindowFunction::Rectangular => 1.0,
                };
                w as f32
            })
            .collect()
    }
}

/// Hann window of `size` coefficients
pub fn hann_window(size: usize) -> Vec<f32> {
    WindowFunction::Hann.coefficients(size)
}

// ═══════════════════════════════════════════════════════════════════════════
// STFT KERNEL
// ═══════════════════════════════════════════════════════════════════════════

/// `realfft`-backed kernel. Plans are cached per FFT size and shared by all
/// units; scratch buffers are per call.
pub struct StftKernel {
    planner: Mutex<RealFftPlanner<f32>>,
}

impl StftKernel {
    pub fn new() -> Self {
        Self {
            planner: Mutex::new(RealFftPlanner::new()),
        }
    }

    fn plan(&self, fft_size: usize) -> Arc<dyn RealToComplex<f32>> {
        self.planner.lock().plan_fft_forward(fft_size)
    }
}

impl Default for StftKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl SpectrogramKernel for StftKernel {
    fn magnitudes(&self, audio: &[f32], columns: usize, stft: &StftParams) -> Vec<f32> {
        let bins = stft.bins();
        let mut out = vec![0.0f32; columns * bins];
        if columns == 0 || bins == 0 {
            return out;
        }

        let fft = self.plan(stft.fft_size);
        let mut frame = fft.make_input_vec();
        let mut spectrum: Vec<Complex<f32>> = fft.make_output_vec();
        let scale = 2.0 / stft.fft_size as f32;

        for (column, dest) in out.chunks_exact_mut(bins).enumerate() {
            let offset = column * stft.hop_size;
            for (i, (sample, &w)) in frame.iter_mut().zip(stft.window.iter()).enumerate() {
                *sample = audio.get(offset + i).copied().unwrap_or(0.0) * w;
            }

            // Buffer lengths come from the plan itself
            if fft.process(&mut frame, &mut spectrum).is_err() {
                dest.fill(0.0);
                continue;
            }

            for (d, c) in dest.iter_mut().zip(&spectrum) {
                *d = c.norm() * scale;
            }
        }

        out
    }
}
