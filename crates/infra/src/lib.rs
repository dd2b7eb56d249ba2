//! Auscult infrastructure: the cpal backend, pipeline negotiation and the
//! real-time processing engine.

pub mod audio;
