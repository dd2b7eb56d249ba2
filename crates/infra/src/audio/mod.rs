//! Audio backend, pipeline negotiation and the processing engine
//!
//! The cpal backend covers the platform APIs:
//! - Windows: WASAPI
//! - Linux: ALSA/PulseAudio
//! - macOS: CoreAudio

pub mod cpal_backend;
pub mod engine;
pub mod negotiation;

pub use cpal_backend::*;
pub use engine::*;
pub use negotiation::*;
