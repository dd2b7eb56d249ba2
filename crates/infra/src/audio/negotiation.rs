//! Pipeline negotiation
//!
//! Picks the first (sample rate, buffer size) pair for which both a capture
//! and a playback stream can be opened. Candidates are tried in a fixed order
//! that favors low rates: the auscultation band tops out at 400 Hz, so small
//! rates keep latency and CPU down while 44.1 kHz remains as a last resort
//! for hardware that accepts nothing else.

use auscult_core::domain::audio::{
    AudioBackend, CaptureRequest, CaptureStream, DeviceId, PlaybackRequest, PlaybackStream,
    PreferredDeviceProvider, Result,
};
use auscult_core::domain::settings::Settings;
use std::fmt;
use tracing::{debug, info, warn};

/// Rates tried after the preferred one, in order
pub const FALLBACK_SAMPLE_RATES: [u32; 5] = [2000, 4000, 8000, 16000, 44100];

/// Candidate rates: preferred first, then the fallbacks, without duplicates
pub fn candidate_rates(preferred: u32) -> Vec<u32> {
    let mut rates = Vec::with_capacity(FALLBACK_SAMPLE_RATES.len() + 1);
    for rate in std::iter::once(preferred).chain(FALLBACK_SAMPLE_RATES) {
        if rate > 0 && !rates.contains(&rate) {
            rates.push(rate);
        }
    }
    rates
}

/// Engine buffer for a rate: at least one second of audio
pub fn buffer_frames_for(sample_rate_hz: u32, min_buffer_frames: u32) -> u32 {
    min_buffer_frames.max(sample_rate_hz)
}

/// Paired capture/playback streams at an agreed rate and buffer size
///
/// Owns both streams. They are stopped and released exactly once: by
/// [`NegotiatedPipeline::release`] or, failing that, on drop.
pub struct NegotiatedPipeline {
    sample_rate_hz: u32,
    buffer_frames: u32,
    capture: Box<dyn CaptureStream>,
    playback: Box<dyn PlaybackStream>,
    released: bool,
}

impl NegotiatedPipeline {
    pub fn new(
        sample_rate_hz: u32,
        buffer_frames: u32,
        capture: Box<dyn CaptureStream>,
        playback: Box<dyn PlaybackStream>,
    ) -> Self {
        Self {
            sample_rate_hz,
            buffer_frames,
            capture,
            playback,
            released: false,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate_hz
    }

    pub fn buffer_frames(&self) -> u32 {
        self.buffer_frames
    }

    /// Start playback, then capture
    pub fn start(&mut self) -> Result<()> {
        self.playback.start()?;
        self.capture.start()
    }

    pub fn capture_mut(&mut self) -> &mut dyn CaptureStream {
        self.capture.as_mut()
    }

    pub fn playback_mut(&mut self) -> &mut dyn PlaybackStream {
        self.playback.as_mut()
    }

    /// Stop and release both streams. Later calls do nothing.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        // Stopping an already-stopped stream is expected during fast
        // start/stop sequences.
        if let Err(e) = self.capture.stop() {
            debug!("Ignoring capture stop error: {}", e);
        }
        if let Err(e) = self.playback.stop() {
            debug!("Ignoring playback stop error: {}", e);
        }

        self.capture.release();
        self.playback.release();
        info!(
            "Released pipeline ({} Hz, {} frames)",
            self.sample_rate_hz, self.buffer_frames
        );
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for NegotiatedPipeline {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for NegotiatedPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NegotiatedPipeline")
            .field("sample_rate_hz", &self.sample_rate_hz)
            .field("buffer_frames", &self.buffer_frames)
            .field("released", &self.released)
            .finish()
    }
}

/// Chooses and opens a working pipeline on a backend
pub struct PipelineNegotiator<'a> {
    backend: &'a dyn AudioBackend,
}

impl<'a> PipelineNegotiator<'a> {
    pub fn new(backend: &'a dyn AudioBackend) -> Self {
        Self { backend }
    }

    /// Try every candidate rate in order and return the first that opens.
    ///
    /// Returns `None` when nothing works; no stream is left open in that case.
    pub fn negotiate(
        &self,
        settings: &Settings,
        preferred_device: Option<&PreferredDeviceProvider>,
    ) -> Option<NegotiatedPipeline> {
        let device = preferred_device.and_then(|provider| provider());
        if let Some(device) = &device {
            debug!("Preferred input device: {}", device);
        }

        for rate in candidate_rates(settings.preferred_sample_rate_hz) {
            let Some(min_frames) = self.backend.min_buffer_frames(rate) else {
                debug!("Skipping {} Hz: no valid buffer size", rate);
                continue;
            };

            let frames = buffer_frames_for(rate, min_frames);
            match self.open_pair(rate, frames, device.clone()) {
                Ok(pipeline) => {
                    info!(
                        "Negotiated pipeline: {} Hz, {} frames (min {})",
                        rate, frames, min_frames
                    );
                    return Some(pipeline);
                }
                Err(e) => {
                    warn!("Candidate {} Hz failed: {}", rate, e);
                }
            }
        }

        warn!("No workable capture/playback configuration found");
        None
    }

    fn open_pair(
        &self,
        sample_rate_hz: u32,
        buffer_frames: u32,
        device: Option<DeviceId>,
    ) -> Result<NegotiatedPipeline> {
        let mut capture = self.backend.open_capture(&CaptureRequest {
            sample_rate_hz,
            buffer_frames,
            device,
        })?;

        let playback = match self.backend.open_playback(&PlaybackRequest {
            sample_rate_hz,
            buffer_frames,
        }) {
            Ok(playback) => playback,
            Err(e) => {
                capture.release();
                return Err(e);
            }
        };

        Ok(NegotiatedPipeline::new(
            sample_rate_hz,
            buffer_frames,
            capture,
            playback,
        ))
    }
}
