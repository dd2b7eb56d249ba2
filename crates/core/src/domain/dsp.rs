//! Digital Signal Processing for the auscultation signal path
//!
//! This module provides:
//! - Biquad sections (low-pass, high-pass, notch) from the audio-EQ cookbook
//! - The five-section emphasis cascade and the factory that tunes it
//! - Envelope extraction and the windowed averaging used for publication
//!
//! All processing is per-sample on `f32` values normalized to [-1.0, 1.0].
//! Coefficients and filter state are kept in `f64`: the 20 Hz high-pass and
//! the Q=35 notch sit very close to DC relative to 44.1 kHz, where `f32`
//! state drifts audibly.

use crate::domain::settings::Settings;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Fixed tuning of the emphasis band
pub mod params {
    /// High-pass corner shared by both high-pass sections
    pub const HIGH_PASS_CUTOFF_HZ: f64 = 20.0;

    /// Q pair decomposing a 4-pole Butterworth response into two biquads
    pub const BUTTERWORTH_Q: [f64; 2] = [0.5412, 1.3066];

    /// Notch width for mains rejection
    pub const NOTCH_Q: f64 = 35.0;

    /// Low-pass corner when murmurs are excluded (heart sounds only)
    pub const LOW_PASS_HEART_HZ: f64 = 150.0;

    /// Low-pass corner when murmurs are included
    pub const LOW_PASS_MURMUR_HZ: f64 = 400.0;

    /// Envelope smoothing corner
    pub const ENVELOPE_CUTOFF_HZ: f64 = 8.0;

    /// Q of the envelope smoother (Butterworth)
    pub const ENVELOPE_Q: f64 = std::f64::consts::FRAC_1_SQRT_2;

    /// Envelope publications per second, independent of capture rate
    pub const ENVELOPE_PUBLISH_HZ: u32 = 25;

    /// Highest usable corner as a fraction of the sample rate
    pub const MAX_CUTOFF_RATIO: f64 = 0.45;
}

// ============================================================================
// BIQUAD
// ============================================================================

/// Response type of a biquad section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterKind {
    LowPass,
    HighPass,
    Notch,
}

/// Normalized biquad coefficients (a0 divided out)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BiquadCoeffs {
    /// Numerator coefficients
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    /// Denominator coefficients (a0 is normalized to 1.0)
    pub a1: f64,
    pub a2: f64,
}

impl Default for BiquadCoeffs {
    fn default() -> Self {
        // Unity gain (no filtering)
        Self {
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
        }
    }
}

impl BiquadCoeffs {
    /// Design a section with the cookbook transform.
    ///
    /// # Parameters
    /// - `kind`: response type
    /// - `sample_rate`: sample rate in Hz
    /// - `freq`: corner (or notch centre) frequency in Hz, capped below Nyquist
    /// - `q`: quality factor
    #[must_use]
    pub fn design(kind: FilterKind, sample_rate: f64, freq: f64, q: f64) -> Self {
        let freq = freq.min(sample_rate * params::MAX_CUTOFF_RATIO);
        let omega = 2.0 * std::f64::consts::PI * freq / sample_rate;
        let cos_w0 = omega.cos();
        let alpha = omega.sin() / (2.0 * q);

        let (b0, b1, b2) = match kind {
            FilterKind::LowPass => {
                let b1 = 1.0 - cos_w0;
                (b1 / 2.0, b1, b1 / 2.0)
            }
            FilterKind::HighPass => {
                let b1 = -(1.0 + cos_w0);
                (-b1 / 2.0, b1, -b1 / 2.0)
            }
            FilterKind::Notch => (1.0, -2.0 * cos_w0, 1.0),
        };

        let a0 = 1.0 + alpha;
        let a1 = -2.0 * cos_w0;
        let a2 = 1.0 - alpha;

        // Normalize by a0
        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }

    #[must_use]
    pub fn low_pass(sample_rate: f64, freq: f64, q: f64) -> Self {
        Self::design(FilterKind::LowPass, sample_rate, freq, q)
    }

    #[must_use]
    pub fn high_pass(sample_rate: f64, freq: f64, q: f64) -> Self {
        Self::design(FilterKind::HighPass, sample_rate, freq, q)
    }

    #[must_use]
    pub fn notch(sample_rate: f64, freq: f64, q: f64) -> Self {
        Self::design(FilterKind::Notch, sample_rate, freq, q)
    }
}

/// Stateful biquad section, transposed Direct Form II
///
/// Coefficients are fixed for the life of the value; retuning means building
/// a new section, which also starts from zero state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Biquad {
    coeffs: BiquadCoeffs,
    z1: f64,
    z2: f64,
}

impl Biquad {
    pub fn new(coeffs: BiquadCoeffs) -> Self {
        Self {
            coeffs,
            z1: 0.0,
            z2: 0.0,
        }
    }

    pub fn low_pass(sample_rate: f64, freq: f64, q: f64) -> Self {
        Self::new(BiquadCoeffs::low_pass(sample_rate, freq, q))
    }

    pub fn high_pass(sample_rate: f64, freq: f64, q: f64) -> Self {
        Self::new(BiquadCoeffs::high_pass(sample_rate, freq, q))
    }

    pub fn notch(sample_rate: f64, freq: f64, q: f64) -> Self {
        Self::new(BiquadCoeffs::notch(sample_rate, freq, q))
    }

    /// Process a single sample
    #[inline]
    pub fn process(&mut self, x: f32) -> f32 {
        let x = f64::from(x);
        let c = &self.coeffs;
        let y = c.b0 * x + self.z1;
        self.z1 = c.b1 * x - c.a1 * y + self.z2;
        self.z2 = c.b2 * x - c.a2 * y;
        y as f32
    }

    pub fn coeffs(&self) -> &BiquadCoeffs {
        &self.coeffs
    }

    /// Current state registers `(z1, z2)`
    pub fn state(&self) -> (f64, f64) {
        (self.z1, self.z2)
    }

    pub fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }
}

// ============================================================================
// FILTER CHAIN
// ============================================================================

/// The emphasis cascade: high-pass, high-pass, notch, low-pass, low-pass
#[derive(Debug, Clone, PartialEq)]
pub struct FilterChain {
    sections: [Biquad; 5],
    sample_rate_hz: u32,
    settings: Settings,
}

impl FilterChain {
    /// Run one sample through every section in order
    #[inline]
    pub fn process(&mut self, sample: f32) -> f32 {
        self.sections
            .iter_mut()
            .fold(sample, |acc, section| section.process(acc))
    }

    /// Process a buffer in-place
    pub fn process_buffer(&mut self, buffer: &mut [f32]) {
        for sample in buffer.iter_mut() {
            *sample = self.process(*sample);
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate_hz
    }

    /// The settings snapshot the coefficients were derived from
    pub fn built_for(&self) -> &Settings {
        &self.settings
    }

    /// True when this chain matches `settings` at `sample_rate_hz`
    pub fn is_current(&self, settings: &Settings, sample_rate_hz: u32) -> bool {
        self.sample_rate_hz == sample_rate_hz && self.settings == *settings
    }

    pub fn sections(&self) -> &[Biquad] {
        &self.sections
    }
}

/// Derives a [`FilterChain`] from settings and the negotiated sample rate
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterChainFactory;

impl FilterChainFactory {
    /// Low-pass corner for the given settings
    pub fn low_pass_cutoff(settings: &Settings) -> f64 {
        if settings.include_murmurs {
            params::LOW_PASS_MURMUR_HZ
        } else {
            params::LOW_PASS_HEART_HZ
        }
    }

    /// Build a fresh chain with zeroed state
    pub fn build(settings: &Settings, sample_rate_hz: u32) -> FilterChain {
        let fs = f64::from(sample_rate_hz);
        let [q_low, q_high] = params::BUTTERWORTH_Q;
        let low_cut = Self::low_pass_cutoff(settings);
        let mains = f64::from(settings.mains_frequency_hz);

        trace!(
            "Filter chain: HP {:.0}Hz, notch {:.0}Hz, LP {:.0}Hz @ {}Hz",
            params::HIGH_PASS_CUTOFF_HZ,
            mains,
            low_cut,
            sample_rate_hz
        );

        FilterChain {
            sections: [
                Biquad::high_pass(fs, params::HIGH_PASS_CUTOFF_HZ, q_low),
                Biquad::high_pass(fs, params::HIGH_PASS_CUTOFF_HZ, q_high),
                Biquad::notch(fs, mains, params::NOTCH_Q),
                Biquad::low_pass(fs, low_cut, q_low),
                Biquad::low_pass(fs, low_cut, q_high),
            ],
            sample_rate_hz,
            settings: *settings,
        }
    }
}

// ============================================================================
// ENVELOPE
// ============================================================================

/// Rectify-and-smooth amplitude follower
#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeDetector {
    smoother: Biquad,
}

impl EnvelopeDetector {
    pub fn new(sample_rate_hz: u32) -> Self {
        Self {
            smoother: Biquad::low_pass(
                f64::from(sample_rate_hz),
                params::ENVELOPE_CUTOFF_HZ,
                params::ENVELOPE_Q,
            ),
        }
    }

    #[inline]
    pub fn process(&mut self, sample: f32) -> f32 {
        self.smoother.process(sample.abs())
    }

    pub fn reset(&mut self) {
        self.smoother.reset();
    }
}

/// Averages envelope values over fixed-size windows
///
/// A window of `sample_rate / 25` samples yields roughly 25 averages per
/// second whatever the capture rate.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeWindow {
    size: usize,
    count: usize,
    sum: f64,
}

impl EnvelopeWindow {
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            count: 0,
            sum: 0.0,
        }
    }

    /// Window sized for the publish rate at `sample_rate_hz`
    pub fn for_sample_rate(sample_rate_hz: u32) -> Self {
        Self::new((sample_rate_hz / params::ENVELOPE_PUBLISH_HZ) as usize)
    }

    /// Accumulate one value, returning the mean when the window completes
    #[inline]
    pub fn push(&mut self, value: f32) -> Option<f32> {
        self.sum += f64::from(value);
        self.count += 1;
        if self.count < self.size {
            return None;
        }
        let mean = (self.sum / self.size as f64) as f32;
        self.count = 0;
        self.sum = 0.0;
        Some(mean)
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

// ============================================================================
// TESTS
// ============================================================================
