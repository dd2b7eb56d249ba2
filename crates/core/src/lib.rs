//! Auscult core: platform-agnostic signal path and configuration
//!
//! The `domain` module holds everything the processing engine needs that does
//! not touch an audio API: the filter cascade, envelope extraction, the shared
//! settings cell, the waveform history and the TOML configuration layer.

pub mod domain;
