//! Real-time auscultation engine
//!
//! The [`AuscultEngine`] owns one background worker that negotiates a
//! pipeline, then loops: read a buffer from the microphone, run it through
//! the filter cascade, apply gain and mute, write it to the speaker, and
//! publish a ~25 Hz amplitude envelope for display.
//!
//! Every public method can be called from any thread while the worker runs.
//! Settings, mute and the preferred-device provider are the only shared
//! mutable state; the streams themselves never leave the worker thread.

use super::negotiation::{NegotiatedPipeline, PipelineNegotiator};
use auscult_core::domain::audio::{
    pcm_to_unit, unit_to_pcm, AudioBackend, DeviceId, PreferredDeviceProvider,
};
use auscult_core::domain::config::MAX_ENVELOPE_QUEUE_CAPACITY;
use auscult_core::domain::dsp::{EnvelopeDetector, EnvelopeWindow, FilterChain, FilterChainFactory};
use auscult_core::domain::settings::{Settings, SettingsCell};
use crossbeam::atomic::AtomicCell;
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Longest a capture read may block, bounding how long `stop` waits
pub const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Pause after a failed read so a dead device doesn't spin the worker
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Default number of envelope values buffered for the consumer
pub const DEFAULT_ENVELOPE_CAPACITY: usize = 64;

/// Engine lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Negotiating,
    Running,
    Stopping,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Idle => "idle",
            EngineState::Negotiating => "negotiating",
            EngineState::Running => "running",
            EngineState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Parameters of the pipeline the worker is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineInfo {
    pub sample_rate_hz: u32,
    pub buffer_frames: u32,
}

// ============================================================================
// SIGNAL PATH
// ============================================================================

/// Per-sample processing state: filter cascade, envelope and publish window
///
/// Rebuilt filters start from zero state, so a settings change costs a brief
/// settling transient rather than running new coefficients on stale history.
pub struct SignalPath {
    sample_rate_hz: u32,
    chain: Option<FilterChain>,
    envelope: EnvelopeDetector,
    window: EnvelopeWindow,
}

impl SignalPath {
    pub fn new(sample_rate_hz: u32) -> Self {
        Self {
            sample_rate_hz,
            chain: None,
            envelope: EnvelopeDetector::new(sample_rate_hz),
            window: EnvelopeWindow::for_sample_rate(sample_rate_hz),
        }
    }

    /// Rebuild filters if forced, never built, or built for other settings.
    ///
    /// Returns true when a rebuild happened.
    pub fn prepare(&mut self, settings: &Settings, force: bool) -> bool {
        let stale = match &self.chain {
            Some(chain) => !chain.is_current(settings, self.sample_rate_hz),
            None => true,
        };
        if !(force || stale) {
            return false;
        }

        self.chain = Some(FilterChainFactory::build(settings, self.sample_rate_hz));
        self.envelope = EnvelopeDetector::new(self.sample_rate_hz);
        debug!(
            "Rebuilt filters: murmurs={}, mains={} Hz, gain={:.2}x",
            settings.include_murmurs, settings.mains_frequency_hz, settings.gain_multiplier()
        );
        true
    }

    /// Filter `input` into `output` and hand completed envelope windows to
    /// `publish`. `muted` is sampled once per sample.
    ///
    /// Call [`SignalPath::prepare`] first; an unprepared path builds its
    /// chain from `settings` on the spot.
    pub fn process<F>(
        &mut self,
        input: &[i16],
        output: &mut [i16],
        settings: &Settings,
        muted: &AtomicBool,
        mut publish: F,
    ) where
        F: FnMut(f32),
    {
        if self.chain.is_none() {
            self.prepare(settings, true);
        }
        let Some(chain) = self.chain.as_mut() else {
            return;
        };
        let gain = chain.built_for().gain_multiplier();

        for (out, &raw) in output.iter_mut().zip(input) {
            let amplified = chain.process(pcm_to_unit(raw)) * gain;

            *out = if muted.load(Ordering::Relaxed) {
                0
            } else {
                unit_to_pcm(amplified.clamp(-1.0, 1.0))
            };

            // Envelope follows the pre-mute, pre-clamp signal
            if let Some(mean) = self.window.push(self.envelope.process(amplified)) {
                publish(mean);
            }
        }
    }

    pub fn chain(&self) -> Option<&FilterChain> {
        self.chain.as_ref()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate_hz
    }
}

// ============================================================================
// ENGINE
// ============================================================================

/// State shared between the control API and the worker
struct Shared {
    settings: SettingsCell,
    muted: AtomicBool,
    state: AtomicCell<EngineState>,
    cancel: AtomicBool,
    device_provider: Mutex<Option<PreferredDeviceProvider>>,
    device_generation: AtomicU64,
    pipeline: AtomicCell<Option<PipelineInfo>>,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl Shared {
    fn provider(&self) -> Option<PreferredDeviceProvider> {
        lock(&self.device_provider).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Capture → filter → playback engine with a live envelope feed
pub struct AuscultEngine {
    backend: Arc<dyn AudioBackend>,
    shared: Arc<Shared>,
    envelope_tx: Sender<f32>,
    envelope_rx: Receiver<f32>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AuscultEngine {
    pub fn new(backend: Arc<dyn AudioBackend>, settings: Settings) -> Self {
        Self::with_envelope_capacity(backend, settings, DEFAULT_ENVELOPE_CAPACITY)
    }

    pub fn with_envelope_capacity(
        backend: Arc<dyn AudioBackend>,
        settings: Settings,
        envelope_capacity: usize,
    ) -> Self {
        let (envelope_tx, envelope_rx) =
            bounded(envelope_capacity.clamp(1, MAX_ENVELOPE_QUEUE_CAPACITY));
        Self {
            backend,
            shared: Arc::new(Shared {
                settings: SettingsCell::new(settings),
                muted: AtomicBool::new(false),
                state: AtomicCell::new(EngineState::Idle),
                cancel: AtomicBool::new(false),
                device_provider: Mutex::new(None),
                device_generation: AtomicU64::new(0),
                pipeline: AtomicCell::new(None),
                published: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
            envelope_tx,
            envelope_rx,
            worker: Mutex::new(None),
        }
    }

    /// Negotiate a pipeline and launch the worker.
    ///
    /// Returns true when the engine is running afterwards. Does nothing if it
    /// already runs; stays idle if no pipeline could be opened.
    pub fn start(&self) -> bool {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return true;
        }

        self.shared.cancel.store(false, Ordering::Release);
        self.shared.state.store(EngineState::Negotiating);

        let (ready_tx, ready_rx) = bounded(1);
        let backend = Arc::clone(&self.backend);
        let shared = Arc::clone(&self.shared);
        let envelope_tx = self.envelope_tx.clone();

        let spawned = thread::Builder::new()
            .name("auscult-processing".to_string())
            .spawn(move || run_worker(backend.as_ref(), &shared, &envelope_tx, ready_tx));

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                error!("Failed to spawn processing thread: {}", e);
                self.shared.state.store(EngineState::Idle);
                return false;
            }
        };

        match ready_rx.recv() {
            Ok(Some(info)) => {
                info!(
                    "Engine running at {} Hz ({} frame buffer)",
                    info.sample_rate_hz, info.buffer_frames
                );
                *worker = Some(handle);
                true
            }
            _ => {
                if handle.join().is_err() {
                    error!("Processing thread panicked during negotiation");
                }
                self.shared.state.store(EngineState::Idle);
                info!("Engine stays idle: no audio pipeline available");
                false
            }
        }
    }

    /// Cancel the worker, wait for it to release its streams, return to idle.
    ///
    /// Safe to call repeatedly and from several threads at once.
    pub fn stop(&self) {
        let mut worker = lock(&self.worker);
        if let Some(handle) = worker.take() {
            self.shared.state.store(EngineState::Stopping);
            self.shared.cancel.store(true, Ordering::Release);
            if handle.join().is_err() {
                error!("Processing thread panicked");
            }
            info!("Engine stopped");
        }

        self.shared.pipeline.store(None);
        self.shared.settings.mark_dirty();
        self.shared.muted.store(false, Ordering::Release);
        self.shared.state.store(EngineState::Idle);
    }

    pub fn state(&self) -> EngineState {
        self.shared.state.load()
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// Pipeline parameters while running
    pub fn pipeline_info(&self) -> Option<PipelineInfo> {
        self.shared.pipeline.load()
    }

    /// Replace the settings with `transform(current)`.
    ///
    /// The worker applies the result at the start of its next buffer.
    pub fn update_settings<F>(&self, transform: F) -> Settings
    where
        F: FnOnce(Settings) -> Settings,
    {
        self.shared.settings.update(transform)
    }

    pub fn current_settings(&self) -> Settings {
        self.shared.settings.load()
    }

    pub fn set_muted(&self, muted: bool) {
        self.shared.muted.store(muted, Ordering::Release);
        debug!("Muted: {}", muted);
    }

    pub fn is_muted(&self) -> bool {
        self.shared.muted.load(Ordering::Acquire)
    }

    /// Install the input-device resolver.
    ///
    /// A running worker applies it to the live capture stream on its next
    /// iteration; otherwise it is used at the next negotiation.
    pub fn set_preferred_input_device_provider<F>(&self, provider: F)
    where
        F: Fn() -> Option<DeviceId> + Send + Sync + 'static,
    {
        *lock(&self.shared.device_provider) = Some(Arc::new(provider));
        self.shared.device_generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Receiver for published envelope values in `[0, 1]`
    pub fn envelope_receiver(&self) -> Receiver<f32> {
        self.envelope_rx.clone()
    }

    /// Envelope values delivered to the channel since creation
    pub fn published_envelopes(&self) -> u64 {
        self.shared.published.load(Ordering::Relaxed)
    }

    /// Envelope values discarded because the consumer fell behind
    pub fn dropped_envelopes(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for AuscultEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for AuscultEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuscultEngine")
            .field("state", &self.state())
            .field("settings", &self.current_settings())
            .field("muted", &self.is_muted())
            .field("pipeline", &self.pipeline_info())
            .finish()
    }
}

// ============================================================================
// WORKER
// ============================================================================

fn run_worker(
    backend: &dyn AudioBackend,
    shared: &Shared,
    envelope_tx: &Sender<f32>,
    ready_tx: Sender<Option<PipelineInfo>>,
) {
    let device_generation = shared.device_generation.load(Ordering::Acquire);
    let provider = shared.provider();
    let settings = shared.settings.load();

    let Some(mut pipeline) = PipelineNegotiator::new(backend).negotiate(&settings, provider.as_ref())
    else {
        let _ = ready_tx.send(None);
        return;
    };

    if let Err(e) = pipeline.start() {
        warn!("Failed to start negotiated pipeline: {}", e);
        pipeline.release();
        let _ = ready_tx.send(None);
        return;
    }

    let info = PipelineInfo {
        sample_rate_hz: pipeline.sample_rate(),
        buffer_frames: pipeline.buffer_frames(),
    };
    shared.pipeline.store(Some(info));
    shared.state.store(EngineState::Running);
    let _ = ready_tx.send(Some(info));

    ProcessingLoop {
        shared,
        envelope_tx,
        device_generation,
    }
    .run(&mut pipeline);

    pipeline.release();
}

/// Clamp an envelope mean into `[0, 1]`; NaN publishes as silence
fn envelope_value(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// The worker's read → process → write loop
struct ProcessingLoop<'a> {
    shared: &'a Shared,
    envelope_tx: &'a Sender<f32>,
    device_generation: u64,
}

impl ProcessingLoop<'_> {
    fn run(&mut self, pipeline: &mut NegotiatedPipeline) {
        let frames = pipeline.buffer_frames() as usize;
        let mut input = vec![0i16; frames];
        let mut output = vec![0i16; frames];
        let mut path = SignalPath::new(pipeline.sample_rate());

        while !self.shared.cancel.load(Ordering::Acquire) {
            self.apply_device_change(pipeline);

            let read = match pipeline.capture_mut().read(&mut input, READ_TIMEOUT) {
                Ok(0) => continue,
                Ok(n) => n.min(frames),
                Err(e) => {
                    trace!("Capture read failed: {}", e);
                    thread::sleep(READ_ERROR_BACKOFF);
                    continue;
                }
            };

            // Settings are sampled once per buffer, never mid-buffer
            let force = self.shared.settings.take_dirty();
            let settings = self.shared.settings.load();
            path.prepare(&settings, force);

            path.process(
                &input[..read],
                &mut output[..read],
                &settings,
                &self.shared.muted,
                |value| self.publish(value),
            );

            if let Err(e) = pipeline.playback_mut().write(&output[..read]) {
                trace!("Playback write failed: {}", e);
            }
        }

        debug!("Processing loop exiting");
    }

    fn apply_device_change(&mut self, pipeline: &mut NegotiatedPipeline) {
        let generation = self.shared.device_generation.load(Ordering::Acquire);
        if generation == self.device_generation {
            return;
        }
        self.device_generation = generation;

        let Some(device) = self.shared.provider().and_then(|provider| provider()) else {
            return;
        };
        match pipeline.capture_mut().set_preferred_device(&device) {
            Ok(()) => info!("Capture switched to {}", device),
            Err(e) => warn!("Could not switch capture to {}: {}", device, e),
        }
    }

    fn publish(&self, value: f32) {
        match self.envelope_tx.try_send(envelope_value(value)) {
            Ok(()) => {
                self.shared.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}
