//! Rolling history of published envelope values for display

use std::collections::VecDeque;

/// Fixed-capacity FIFO of envelope values in `[0, 1]`
#[derive(Debug, Clone)]
pub struct WaveformHistory {
    values: VecDeque<f32>,
    capacity: usize,
}

impl WaveformHistory {
    pub const DEFAULT_SECONDS: usize = 60;
    pub const DEFAULT_SAMPLES_PER_SECOND: usize = 25;

    /// Storage reserved up front; larger histories grow as they fill
    const MAX_PREALLOCATED: usize = 4096;

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: VecDeque::with_capacity(capacity.min(Self::MAX_PREALLOCATED)),
            capacity,
        }
    }

    /// History covering `seconds` at `per_second` publications
    pub fn with_window(seconds: usize, per_second: usize) -> Self {
        Self::with_capacity(seconds.saturating_mul(per_second))
    }

    /// Append a value, clamped to `[0, 1]`, evicting the oldest when full
    pub fn push(&mut self, value: f32) {
        // NaN clamps to NaN; store silence instead
        let value = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
        self.values.push_back(value);
        while self.values.len() > self.capacity {
            self.values.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Values oldest first
    pub fn iter(&self) -> impl Iterator<Item = f32> + '_ {
        self.values.iter().copied()
    }

    pub fn latest(&self) -> Option<f32> {
        self.values.back().copied()
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.values.iter().copied().collect()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

impl Default for WaveformHistory {
    fn default() -> Self {
        Self::with_window(Self::DEFAULT_SECONDS, Self::DEFAULT_SAMPLES_PER_SECOND)
    }
}

impl Extend<f32> for WaveformHistory {
    fn extend<I: IntoIterator<Item = f32>>(&mut self, iter: I) {
        for value in iter {
            self.push(value);
        }
    }
}
