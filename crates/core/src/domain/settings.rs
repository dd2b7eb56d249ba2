//! Engine settings and the cross-thread cell that publishes them
//!
//! [`Settings`] is a small `Copy` value. It is never mutated in place: an
//! update builds a new value from the current one and swaps it into the
//! [`SettingsCell`], where the processing thread picks it up at the start of
//! its next buffer.

use crossbeam::atomic::AtomicCell;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// Largest gain the UI position maps to
pub const MAX_GAIN: f32 = 50.0;

/// Map a bounded UI position to a gain multiplier.
///
/// `exp(ln(50) * p)` for `p` clamped to `[0, 1]`: 1x at the bottom of the
/// slider, 50x at the top, evenly spaced in decibels in between. A NaN
/// position maps to the bottom of the slider.
pub fn gain_from_position(position: f32) -> f32 {
    let position = if position.is_nan() {
        0.0
    } else {
        position.clamp(0.0, 1.0)
    };
    (MAX_GAIN.ln() * position).exp()
}

/// Inverse of [`gain_from_position`], clamped to `[0, 1]`
pub fn position_from_gain(gain: f32) -> f32 {
    if gain <= 1.0 {
        return 0.0;
    }
    (gain.ln() / MAX_GAIN.ln()).clamp(0.0, 1.0)
}

/// Mains electricity frequency to reject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MainsFrequency {
    Hz50,
    Hz60,
}

impl MainsFrequency {
    pub fn hz(&self) -> u32 {
        match self {
            MainsFrequency::Hz50 => 50,
            MainsFrequency::Hz60 => 60,
        }
    }
}

impl TryFrom<u32> for MainsFrequency {
    type Error = u32;

    fn try_from(hz: u32) -> std::result::Result<Self, Self::Error> {
        match hz {
            50 => Ok(MainsFrequency::Hz50),
            60 => Ok(MainsFrequency::Hz60),
            other => Err(other),
        }
    }
}

/// Immutable settings snapshot
///
/// The gain is only reachable through [`Settings::with_gain_position`], so it
/// always lies in `[1, MAX_GAIN]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Settings {
    /// Widen the low-pass corner to keep murmurs audible
    pub include_murmurs: bool,
    /// Centre of the hum notch
    pub mains_frequency_hz: u32,
    /// Linear output gain, always `gain_from_position` of some position
    gain_multiplier: f32,
    /// First sample rate tried during negotiation
    pub preferred_sample_rate_hz: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            include_murmurs: false,
            mains_frequency_hz: MainsFrequency::Hz50.hz(),
            gain_multiplier: gain_from_position(0.0),
            preferred_sample_rate_hz: 4000,
        }
    }
}

impl Settings {
    #[must_use]
    pub fn with_gain_position(self, position: f32) -> Self {
        Self {
            gain_multiplier: gain_from_position(position),
            ..self
        }
    }

    #[must_use]
    pub fn with_mains(self, mains: MainsFrequency) -> Self {
        Self {
            mains_frequency_hz: mains.hz(),
            ..self
        }
    }

    #[must_use]
    pub fn with_murmurs(self, include_murmurs: bool) -> Self {
        Self {
            include_murmurs,
            ..self
        }
    }

    #[must_use]
    pub fn with_preferred_sample_rate(self, sample_rate_hz: u32) -> Self {
        Self {
            preferred_sample_rate_hz: sample_rate_hz,
            ..self
        }
    }

    pub fn gain_multiplier(&self) -> f32 {
        self.gain_multiplier
    }

    /// Slider position that produces the current gain
    pub fn gain_position(&self) -> f32 {
        position_from_gain(self.gain_multiplier)
    }
}

/// Atomically swappable settings plus a "rebuild filters" flag
///
/// Readers (the processing thread) never block. Writers are serialized so a
/// read-modify-write through [`SettingsCell::update`] never loses a
/// concurrent update.
#[derive(Debug)]
pub struct SettingsCell {
    current: AtomicCell<Settings>,
    dirty: AtomicBool,
    writer: Mutex<()>,
}

impl SettingsCell {
    pub fn new(settings: Settings) -> Self {
        Self {
            current: AtomicCell::new(settings),
            dirty: AtomicBool::new(true),
            writer: Mutex::new(()),
        }
    }

    /// Current snapshot
    pub fn load(&self) -> Settings {
        self.current.load()
    }

    /// Replace the snapshot with `transform(current)` and mark it dirty
    pub fn update<F>(&self, transform: F) -> Settings
    where
        F: FnOnce(Settings) -> Settings,
    {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let next = transform(self.current.load());
        self.current.store(next);
        self.dirty.store(true, Ordering::Release);
        debug!(?next, "Settings updated");
        next
    }

    /// Clear the dirty flag, returning whether it was set
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Force the next reader to rebuild
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }
}

impl Default for SettingsCell {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}
