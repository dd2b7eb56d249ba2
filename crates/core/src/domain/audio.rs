//! Audio device abstractions and domain models
//!
//! This module defines the platform boundary the engine talks to. The engine
//! only ever sees mono signed 16-bit PCM through [`CaptureStream`] and
//! [`PlaybackStream`]; concrete implementations (cpal in the `infra` crate, a
//! scripted backend in the integration tests) live elsewhere.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in the audio subsystem
#[derive(Debug, Error)]
pub enum AudioError {
    /// Requested audio device was not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Error in audio stream creation or processing
    #[error("Stream error: {0}")]
    StreamError(String),

    /// Invalid configuration for audio device
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Input/Output error at the OS level
    #[error("OS error: {0}")]
    OsError(String),

    /// Device does not support the requested configuration
    #[error("Unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// No (sample rate, buffer size, device) candidate could be opened
    #[error("Pipeline negotiation failed: {0}")]
    NegotiationFailed(String),
}

pub type Result<T> = std::result::Result<T, AudioError>;

/// Unique identifier for an audio device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Information about a capture device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
    pub is_default: bool,
    pub min_sample_rate: Option<u32>,
    pub max_sample_rate: Option<u32>,
}

/// Resolves the input device the caller would like the capture stream to use.
///
/// Called at negotiation time and whenever a new provider is installed on a
/// running engine. Returning `None` means "platform default".
pub type PreferredDeviceProvider = Arc<dyn Fn() -> Option<DeviceId> + Send + Sync>;

/// Parameters for opening a capture stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub sample_rate_hz: u32,
    pub buffer_frames: u32,
    pub device: Option<DeviceId>,
}

/// Parameters for opening a playback stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackRequest {
    pub sample_rate_hz: u32,
    pub buffer_frames: u32,
}

/// Mono 16-bit capture stream.
///
/// Streams are created and used on a single thread and never shared, so the
/// trait carries no `Send` bound.
pub trait CaptureStream {
    fn start(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    /// Release the underlying platform resources. Called exactly once.
    fn release(&mut self);

    /// Block for at most `timeout` waiting for samples, then copy as many as
    /// are available (up to `buffer.len()`). Returns 0 on timeout.
    fn read(&mut self, buffer: &mut [i16], timeout: Duration) -> Result<usize>;

    /// Route capture through `device`. Live streams switch immediately.
    fn set_preferred_device(&mut self, device: &DeviceId) -> Result<()>;
}

/// Mono 16-bit playback stream
pub trait PlaybackStream {
    fn start(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    /// Release the underlying platform resources. Called exactly once.
    fn release(&mut self);

    /// Queue samples for playback, returning how many were accepted.
    fn write(&mut self, samples: &[i16]) -> Result<usize>;
}

/// Factory for paired capture/playback streams
pub trait AudioBackend: Send + Sync {
    /// Smallest buffer, in frames, the platform accepts at `sample_rate_hz`.
    ///
    /// `None` means the rate is unusable on this platform.
    fn min_buffer_frames(&self, sample_rate_hz: u32) -> Option<u32>;

    fn open_capture(&self, request: &CaptureRequest) -> Result<Box<dyn CaptureStream>>;

    fn open_playback(&self, request: &PlaybackRequest) -> Result<Box<dyn PlaybackStream>>;

    /// List capture devices
    fn input_devices(&self) -> Result<Vec<DeviceInfo>>;
}

/// Convert a PCM sample to the `[-1.0, 1.0)` range
#[inline]
pub fn pcm_to_unit(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Convert a `[-1.0, 1.0]` sample back to PCM, saturating out-of-range input
#[inline]
pub fn unit_to_pcm(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}
