//! Text rendering of the envelope history

use auscult_core::domain::waveform::WaveformHistory;

pub const METER_WIDTH: usize = 30;

/// Loudest envelope value among the newest `window` entries
pub fn recent_peak(history: &WaveformHistory, window: usize) -> f32 {
    let skip = history.len().saturating_sub(window);
    history.iter().skip(skip).fold(0.0, f32::max)
}

/// Horizontal bar for a level in `[0, 1]`
pub fn render_bar(level: f32, width: usize) -> String {
    let level = if level.is_nan() { 0.0 } else { level.clamp(0.0, 1.0) };
    let filled = (level * width as f32).round() as usize;
    format!("[{}{}]", "#".repeat(filled), " ".repeat(width - filled))
}
