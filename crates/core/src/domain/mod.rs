//! Domain entities and business rules

pub mod audio;
pub mod config;
pub mod dsp;
pub mod settings;
pub mod waveform;

// Re-export specific items to avoid ambiguous glob imports
pub use audio::{
    AudioBackend, AudioError, CaptureRequest, CaptureStream, DeviceId, DeviceInfo,
    PlaybackRequest, PlaybackStream, PreferredDeviceProvider,
};
pub use config::{AuscultConfig, ConfigError, ConfigManager};
pub use dsp::{
    Biquad, BiquadCoeffs, EnvelopeDetector, EnvelopeWindow, FilterChain, FilterChainFactory,
    FilterKind,
};
pub use settings::{gain_from_position, position_from_gain, MainsFrequency, Settings, SettingsCell};
pub use waveform::WaveformHistory;
