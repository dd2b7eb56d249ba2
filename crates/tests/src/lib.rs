//! Scripted in-memory audio backend for integration tests
//!
//! `ScriptedBackend` implements [`AudioBackend`] without hardware. Tests
//! decide which rates fail, what the microphone "hears", and then inspect
//! what was opened, released and played.

use auscult_core::domain::audio::{
    AudioBackend, AudioError, CaptureRequest, CaptureStream, DeviceId, DeviceInfo,
    PlaybackRequest, PlaybackStream, Result,
};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// Played samples kept for inspection
const PLAYED_CAPACITY: usize = 1 << 18;

/// What the scripted microphone produces
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Signal {
    Silence,
    /// Sine at `frequency_hz` with peak `amplitude` in `[0, 1]`
    Sine { frequency_hz: f32, amplitude: f32 },
}

impl Signal {
    fn sample(&self, index: u64, sample_rate_hz: u32) -> i16 {
        match *self {
            Signal::Silence => 0,
            Signal::Sine {
                frequency_hz,
                amplitude,
            } => {
                let t = index as f64 / f64::from(sample_rate_hz);
                let value = (2.0 * std::f64::consts::PI * f64::from(frequency_hz) * t).sin()
                    * f64::from(amplitude);
                (value * f64::from(i16::MAX)) as i16
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
struct Script {
    min_buffer_frames: u32,
    unsupported_rates: HashSet<u32>,
    failing_capture_rates: HashSet<u32>,
    failing_playback_rates: HashSet<u32>,
    signal: Signal,
    input_limit: Option<u64>,
    chunk_frames: usize,
    devices: Vec<DeviceInfo>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            min_buffer_frames: 256,
            unsupported_rates: HashSet::new(),
            failing_capture_rates: HashSet::new(),
            failing_playback_rates: HashSet::new(),
            signal: Signal::Silence,
            input_limit: None,
            chunk_frames: 400,
            devices: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Record {
    capture_attempts: Vec<u32>,
    playback_attempts: Vec<u32>,
    capture_requests: Vec<CaptureRequest>,
    device_switches: Vec<DeviceId>,
    played: VecDeque<i16>,
}

#[derive(Debug, Default)]
struct Inner {
    script: Mutex<Script>,
    record: Mutex<Record>,
    captures_opened: AtomicUsize,
    captures_released: AtomicUsize,
    playbacks_opened: AtomicUsize,
    playbacks_released: AtomicUsize,
    double_releases: AtomicUsize,
    frames_captured: AtomicUsize,
    frames_played: AtomicUsize,
}

/// Hardware-free [`AudioBackend`]; clones share the same script and record
#[derive(Debug, Clone, Default)]
pub struct ScriptedBackend {
    inner: Arc<Inner>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report no valid buffer size at these rates
    pub fn with_unsupported_rates(self, rates: &[u32]) -> Self {
        lock(&self.inner.script).unsupported_rates.extend(rates);
        self
    }

    /// Fail `open_capture` at these rates
    pub fn with_failing_capture_rates(self, rates: &[u32]) -> Self {
        lock(&self.inner.script).failing_capture_rates.extend(rates);
        self
    }

    /// Fail `open_playback` at these rates
    pub fn with_failing_playback_rates(self, rates: &[u32]) -> Self {
        lock(&self.inner.script).failing_playback_rates.extend(rates);
        self
    }

    pub fn with_min_buffer_frames(self, frames: u32) -> Self {
        lock(&self.inner.script).min_buffer_frames = frames;
        self
    }

    pub fn with_signal(self, signal: Signal) -> Self {
        lock(&self.inner.script).signal = signal;
        self
    }

    /// Stop producing input after `frames` samples in total
    pub fn with_input_limit(self, frames: u64) -> Self {
        lock(&self.inner.script).input_limit = Some(frames);
        self
    }

    /// Largest chunk a single `read` returns
    pub fn with_chunk_frames(self, frames: usize) -> Self {
        lock(&self.inner.script).chunk_frames = frames.max(1);
        self
    }

    pub fn with_devices(self, names: &[&str]) -> Self {
        lock(&self.inner.script).devices = names
            .iter()
            .enumerate()
            .map(|(i, name)| DeviceInfo {
                id: DeviceId::new(*name),
                name: name.to_string(),
                is_default: i == 0,
                min_sample_rate: Some(2000),
                max_sample_rate: Some(48000),
            })
            .collect();
        self
    }

    pub fn set_signal(&self, signal: Signal) {
        lock(&self.inner.script).signal = signal;
    }

    /// Rates at which `open_capture` was called, in order
    pub fn capture_attempts(&self) -> Vec<u32> {
        lock(&self.inner.record).capture_attempts.clone()
    }

    pub fn playback_attempts(&self) -> Vec<u32> {
        lock(&self.inner.record).playback_attempts.clone()
    }

    pub fn capture_requests(&self) -> Vec<CaptureRequest> {
        lock(&self.inner.record).capture_requests.clone()
    }

    /// Devices passed to `set_preferred_device` on live captures
    pub fn device_switches(&self) -> Vec<DeviceId> {
        lock(&self.inner.record).device_switches.clone()
    }

    pub fn captures_opened(&self) -> usize {
        self.inner.captures_opened.load(Ordering::SeqCst)
    }

    pub fn captures_released(&self) -> usize {
        self.inner.captures_released.load(Ordering::SeqCst)
    }

    pub fn playbacks_opened(&self) -> usize {
        self.inner.playbacks_opened.load(Ordering::SeqCst)
    }

    pub fn playbacks_released(&self) -> usize {
        self.inner.playbacks_released.load(Ordering::SeqCst)
    }

    /// Streams opened but not yet released
    pub fn live_streams(&self) -> usize {
        (self.captures_opened() - self.captures_released())
            + (self.playbacks_opened() - self.playbacks_released())
    }

    /// Release calls on streams that were already released
    pub fn double_releases(&self) -> usize {
        self.inner.double_releases.load(Ordering::SeqCst)
    }

    pub fn frames_captured(&self) -> usize {
        self.inner.frames_captured.load(Ordering::SeqCst)
    }

    pub fn frames_played(&self) -> usize {
        self.inner.frames_played.load(Ordering::SeqCst)
    }

    /// Most recent played samples, oldest first
    pub fn played(&self) -> Vec<i16> {
        lock(&self.inner.record).played.iter().copied().collect()
    }

    pub fn clear_played(&self) {
        lock(&self.inner.record).played.clear();
    }

    /// Largest absolute value among the newest `window` played samples
    pub fn recent_played_peak(&self, window: usize) -> i16 {
        let record = lock(&self.inner.record);
        let skip = record.played.len().saturating_sub(window);
        record
            .played
            .iter()
            .skip(skip)
            .map(|s| s.saturating_abs())
            .max()
            .unwrap_or(0)
    }
}

impl AudioBackend for ScriptedBackend {
    fn min_buffer_frames(&self, sample_rate_hz: u32) -> Option<u32> {
        let script = lock(&self.inner.script);
        if script.unsupported_rates.contains(&sample_rate_hz) {
            None
        } else {
            Some(script.min_buffer_frames)
        }
    }

    fn open_capture(&self, request: &CaptureRequest) -> Result<Box<dyn CaptureStream>> {
        {
            let mut record = lock(&self.inner.record);
            record.capture_attempts.push(request.sample_rate_hz);
            record.capture_requests.push(request.clone());
        }

        if lock(&self.inner.script)
            .failing_capture_rates
            .contains(&request.sample_rate_hz)
        {
            return Err(AudioError::UnsupportedConfiguration(format!(
                "scripted capture failure at {} Hz",
                request.sample_rate_hz
            )));
        }

        self.inner.captures_opened.fetch_add(1, Ordering::SeqCst);
        debug!("Scripted capture opened at {} Hz", request.sample_rate_hz);
        Ok(Box::new(ScriptedCapture {
            inner: Arc::clone(&self.inner),
            sample_rate_hz: request.sample_rate_hz,
            position: 0,
            started: false,
            released: false,
        }))
    }

    fn open_playback(&self, request: &PlaybackRequest) -> Result<Box<dyn PlaybackStream>> {
        lock(&self.inner.record)
            .playback_attempts
            .push(request.sample_rate_hz);

        if lock(&self.inner.script)
            .failing_playback_rates
            .contains(&request.sample_rate_hz)
        {
            return Err(AudioError::UnsupportedConfiguration(format!(
                "scripted playback failure at {} Hz",
                request.sample_rate_hz
            )));
        }

        self.inner.playbacks_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedPlayback {
            inner: Arc::clone(&self.inner),
            started: false,
            released: false,
        }))
    }

    fn input_devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(lock(&self.inner.script).devices.clone())
    }
}

struct ScriptedCapture {
    inner: Arc<Inner>,
    sample_rate_hz: u32,
    position: u64,
    started: bool,
    released: bool,
}

impl CaptureStream for ScriptedCapture {
    fn start(&mut self) -> Result<()> {
        if self.released {
            return Err(AudioError::StreamError("capture released".to_string()));
        }
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Err(AudioError::StreamError("capture not started".to_string()));
        }
        self.started = false;
        Ok(())
    }

    fn release(&mut self) {
        if self.released {
            self.inner.double_releases.fetch_add(1, Ordering::SeqCst);
            return;
        }
        self.released = true;
        self.inner.captures_released.fetch_add(1, Ordering::SeqCst);
    }

    fn read(&mut self, buffer: &mut [i16], timeout: Duration) -> Result<usize> {
        if self.released {
            return Err(AudioError::StreamError("capture released".to_string()));
        }

        let (signal, limit, chunk) = {
            let script = lock(&self.inner.script);
            (script.signal, script.input_limit, script.chunk_frames)
        };
        let remaining = limit.map_or(u64::MAX, |limit| limit.saturating_sub(self.position));

        if !self.started || remaining == 0 {
            let deadline = Instant::now() + timeout;
            thread::sleep(deadline.saturating_duration_since(Instant::now()));
            return Ok(0);
        }

        let frames = buffer
            .len()
            .min(chunk)
            .min(usize::try_from(remaining).unwrap_or(usize::MAX));
        for slot in &mut buffer[..frames] {
            *slot = signal.sample(self.position, self.sample_rate_hz);
            self.position += 1;
        }

        self.inner.frames_captured.fetch_add(frames, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(1));
        Ok(frames)
    }

    fn set_preferred_device(&mut self, device: &DeviceId) -> Result<()> {
        lock(&self.inner.record).device_switches.push(device.clone());
        Ok(())
    }
}

struct ScriptedPlayback {
    inner: Arc<Inner>,
    started: bool,
    released: bool,
}

impl PlaybackStream for ScriptedPlayback {
    fn start(&mut self) -> Result<()> {
        if self.released {
            return Err(AudioError::StreamError("playback released".to_string()));
        }
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Err(AudioError::StreamError("playback not started".to_string()));
        }
        self.started = false;
        Ok(())
    }

    fn release(&mut self) {
        if self.released {
            self.inner.double_releases.fetch_add(1, Ordering::SeqCst);
            return;
        }
        self.released = true;
        self.inner.playbacks_released.fetch_add(1, Ordering::SeqCst);
    }

    fn write(&mut self, samples: &[i16]) -> Result<usize> {
        if self.released {
            return Err(AudioError::StreamError("playback released".to_string()));
        }

        let mut record = lock(&self.inner.record);
        record.played.extend(samples.iter().copied());
        let excess = record.played.len().saturating_sub(PLAYED_CAPACITY);
        record.played.drain(..excess);
        drop(record);

        self.inner.frames_played.fetch_add(samples.len(), Ordering::SeqCst);
        Ok(samples.len())
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_rates() {
        let backend = ScriptedBackend::new()
            .with_unsupported_rates(&[2000])
            .with_min_buffer_frames(512);
        assert_eq!(backend.min_buffer_frames(2000), None);
        assert_eq!(backend.min_buffer_frames(8000), Some(512));
    }

    #[test]
    fn test_scripted_capture_limit() {
        let backend = ScriptedBackend::new()
            .with_signal(Signal::Sine {
                frequency_hz: 100.0,
                amplitude: 0.5,
            })
            .with_input_limit(10)
            .with_chunk_frames(4);
        let mut capture = backend
            .open_capture(&CaptureRequest {
                sample_rate_hz: 8000,
                buffer_frames: 8000,
                device: None,
            })
            .unwrap();
        capture.start().unwrap();

        let mut buffer = [0i16; 16];
        let mut total = 0;
        for _ in 0..5 {
            total += capture.read(&mut buffer, Duration::from_millis(1)).unwrap();
        }
        assert_eq!(total, 10);

        capture.release();
        capture.release();
        assert_eq!(backend.captures_released(), 1);
        assert_eq!(backend.double_releases(), 1);
        assert!(capture.read(&mut buffer, Duration::ZERO).is_err());
    }

    #[test]
    fn test_played_is_recorded() {
        let backend = ScriptedBackend::new();
        let mut playback = backend
            .open_playback(&PlaybackRequest {
                sample_rate_hz: 8000,
                buffer_frames: 8000,
            })
            .unwrap();
        playback.start().unwrap();
        assert_eq!(playback.write(&[1, -7, 3]).unwrap(), 3);
        assert_eq!(backend.played(), vec![1, -7, 3]);
        assert_eq!(backend.recent_played_peak(2), 7);
        assert_eq!(backend.live_streams(), 1);
    }
}
