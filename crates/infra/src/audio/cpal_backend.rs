//! CPAL-based audio backend
//!
//! cpal delivers audio through callbacks on its own threads. The engine wants
//! blocking mono reads and writes, so each stream is bridged with a bounded
//! crossbeam channel: the input callback downmixes and pushes chunks, `read`
//! pulls them with a timeout; `write` pushes chunks that the output callback
//! spreads across every output channel.

use auscult_core::domain::audio::{
    AudioBackend, AudioError, CaptureRequest, CaptureStream, DeviceId, DeviceInfo,
    PlaybackRequest, PlaybackStream, Result,
};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    BufferSize, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig,
    SupportedBufferSize, SupportedStreamConfigRange,
};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Minimum buffer assumed when the platform does not report one
const DEFAULT_MIN_BUFFER_FRAMES: u32 = 256;

/// Device callback periods per second (20 ms periods)
const CALLBACK_PERIODS_PER_SECOND: u32 = 50;

/// Chunks buffered between the input callback and `read`
const CAPTURE_QUEUE_CHUNKS: usize = 64;

/// Chunks buffered between `write` and the output callback
const PLAYBACK_QUEUE_CHUNKS: usize = 16;

/// Stream layout chosen for a device at one sample rate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DeviceLayout {
    channels: u16,
    format: SampleFormat,
    min_frames: u32,
    max_frames: Option<u32>,
}

impl DeviceLayout {
    fn stream_config(&self, sample_rate_hz: u32) -> StreamConfig {
        let buffer_size = match self.max_frames {
            Some(max) => BufferSize::Fixed(
                (sample_rate_hz / CALLBACK_PERIODS_PER_SECOND)
                    .clamp(self.min_frames, max.max(self.min_frames)),
            ),
            None => BufferSize::Default,
        };

        StreamConfig {
            channels: self.channels,
            sample_rate: sample_rate_hz,
            buffer_size,
        }
    }
}

/// Preference among the formats we can convert
fn format_rank(format: SampleFormat) -> Option<u8> {
    match format {
        SampleFormat::I16 => Some(0),
        SampleFormat::F32 => Some(1),
        SampleFormat::U16 => Some(2),
        _ => None,
    }
}

/// Pick the narrowest supported layout covering `sample_rate_hz`
fn select_layout<I>(ranges: I, sample_rate_hz: u32) -> Option<DeviceLayout>
where
    I: IntoIterator<Item = SupportedStreamConfigRange>,
{
    ranges
        .into_iter()
        .filter(|range| {
            range.min_sample_rate() <= sample_rate_hz && sample_rate_hz <= range.max_sample_rate()
        })
        .filter_map(|range| format_rank(range.sample_format()).map(|rank| (rank, range)))
        .min_by_key(|(rank, range)| (range.channels(), *rank))
        .map(|(_, range)| {
            let (min_frames, max_frames) = match range.buffer_size() {
                SupportedBufferSize::Range { min, max } => (*min, Some(*max)),
                SupportedBufferSize::Unknown => (DEFAULT_MIN_BUFFER_FRAMES, None),
            };
            DeviceLayout {
                channels: range.channels(),
                format: range.sample_format(),
                min_frames,
                max_frames,
            }
        })
}

/// Average one interleaved frame down to a mono PCM sample
fn downmix<T>(frame: &[T]) -> i16
where
    T: Sample,
    i16: FromSample<T>,
{
    if frame.is_empty() {
        return 0;
    }
    let sum: i32 = frame.iter().map(|&s| i32::from(i16::from_sample(s))).sum();
    (sum / frame.len() as i32) as i16
}

#[allow(deprecated)]
fn device_name(device: &cpal::Device) -> String {
    device
        .name()
        .unwrap_or_else(|_| "Unknown Device".to_string())
}

fn find_input_device(host: &cpal::Host, id: &DeviceId) -> Result<cpal::Device> {
    host.input_devices()
        .map_err(|e| AudioError::OsError(e.to_string()))?
        .find(|d| device_name(d) == id.as_str())
        .ok_or_else(|| AudioError::DeviceNotFound(id.as_str().to_string()))
}

fn default_input_device(host: &cpal::Host) -> Result<cpal::Device> {
    host.default_input_device()
        .ok_or_else(|| AudioError::DeviceNotFound("No default input device".to_string()))
}

fn default_output_device(host: &cpal::Host) -> Result<cpal::Device> {
    host.default_output_device()
        .ok_or_else(|| AudioError::DeviceNotFound("No default output device".to_string()))
}

// ============================================================================
// CAPTURE
// ============================================================================

fn build_capture_stream(
    device: &cpal::Device,
    sample_rate_hz: u32,
    sender: Sender<Vec<i16>>,
) -> Result<Stream> {
    let ranges = device
        .supported_input_configs()
        .map_err(|e| AudioError::UnsupportedConfiguration(e.to_string()))?;
    let layout = select_layout(ranges, sample_rate_hz).ok_or_else(|| {
        AudioError::UnsupportedConfiguration(format!("No input layout at {} Hz", sample_rate_hz))
    })?;
    let config = layout.stream_config(sample_rate_hz);
    debug!("Capture layout: {:?}, config: {:?}", layout, config);

    match layout.format {
        SampleFormat::I16 => build_input::<i16>(device, &config, sender),
        SampleFormat::F32 => build_input::<f32>(device, &config, sender),
        SampleFormat::U16 => build_input::<u16>(device, &config, sender),
        other => Err(AudioError::UnsupportedConfiguration(format!(
            "Unsupported input sample format {:?}",
            other
        ))),
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    sender: Sender<Vec<i16>>,
) -> Result<Stream>
where
    T: SizedSample,
    i16: FromSample<T>,
{
    let channels = usize::from(config.channels.max(1));

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mono: Vec<i16> = data.chunks(channels).map(downmix).collect();
                if let Err(TrySendError::Full(chunk)) = sender.try_send(mono) {
                    trace!("Capture queue full, dropping {} frames", chunk.len());
                }
            },
            |err| error!("Input stream error: {}", err),
            None,
        )
        .map_err(|e| AudioError::StreamError(format!("Failed to build input stream: {}", e)))
}

/// Mono capture stream on a cpal input device
pub struct CpalCapture {
    stream: Option<Stream>,
    sample_rate_hz: u32,
    device_name: String,
    sender: Sender<Vec<i16>>,
    receiver: Receiver<Vec<i16>>,
    pending: Vec<i16>,
    pending_pos: usize,
    playing: bool,
}

impl CpalCapture {
    fn open(device: &cpal::Device, sample_rate_hz: u32) -> Result<Self> {
        let (sender, receiver) = bounded(CAPTURE_QUEUE_CHUNKS);
        let stream = build_capture_stream(device, sample_rate_hz, sender.clone())?;
        let device_name = device_name(device);
        info!("Opened capture on {} at {} Hz", device_name, sample_rate_hz);

        Ok(Self {
            stream: Some(stream),
            sample_rate_hz,
            device_name,
            sender,
            receiver,
            pending: Vec::new(),
            pending_pos: 0,
            playing: false,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    fn stream(&self) -> Result<&Stream> {
        self.stream
            .as_ref()
            .ok_or_else(|| AudioError::StreamError("Capture stream released".to_string()))
    }

    fn drain_pending(&mut self, out: &mut [i16]) -> usize {
        let available = &self.pending[self.pending_pos..];
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.pending_pos += n;
        n
    }

    fn refill(&mut self, chunk: Vec<i16>) {
        self.pending = chunk;
        self.pending_pos = 0;
    }
}

impl CaptureStream for CpalCapture {
    fn start(&mut self) -> Result<()> {
        self.stream()?
            .play()
            .map_err(|e| AudioError::StreamError(format!("Failed to start capture: {}", e)))?;
        self.playing = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.stream()?
            .pause()
            .map_err(|e| AudioError::StreamError(format!("Failed to stop capture: {}", e)))?;
        self.playing = false;
        Ok(())
    }

    fn release(&mut self) {
        if self.stream.take().is_some() {
            debug!("Released capture on {}", self.device_name);
        }
        self.playing = false;
        self.pending.clear();
        self.pending_pos = 0;
        while self.receiver.try_recv().is_ok() {}
    }

    fn read(&mut self, buffer: &mut [i16], timeout: Duration) -> Result<usize> {
        if buffer.is_empty() {
            return Ok(0);
        }

        let mut filled = self.drain_pending(buffer);
        if filled == 0 {
            match self.receiver.recv_timeout(timeout) {
                Ok(chunk) => self.refill(chunk),
                Err(RecvTimeoutError::Timeout) => return Ok(0),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(AudioError::StreamError(
                        "Capture queue disconnected".to_string(),
                    ))
                }
            }
            filled = self.drain_pending(buffer);
        }

        // Take whatever else is already queued without blocking again
        while filled < buffer.len() {
            match self.receiver.try_recv() {
                Ok(chunk) => {
                    self.refill(chunk);
                    filled += self.drain_pending(&mut buffer[filled..]);
                }
                Err(_) => break,
            }
        }

        Ok(filled)
    }

    fn set_preferred_device(&mut self, device: &DeviceId) -> Result<()> {
        self.stream()?;
        if device.as_str() == self.device_name {
            return Ok(());
        }

        let host = cpal::default_host();
        let new_device = find_input_device(&host, device)?;
        let stream = build_capture_stream(&new_device, self.sample_rate_hz, self.sender.clone())?;
        if self.playing {
            stream
                .play()
                .map_err(|e| AudioError::StreamError(format!("Failed to start capture: {}", e)))?;
        }

        // Dropping the old stream closes the previous device
        self.stream = Some(stream);
        self.device_name = device.as_str().to_string();
        Ok(())
    }
}

impl fmt::Debug for CpalCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpalCapture")
            .field("device", &self.device_name)
            .field("sample_rate_hz", &self.sample_rate_hz)
            .field("playing", &self.playing)
            .finish()
    }
}

// ============================================================================
// PLAYBACK
// ============================================================================

fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    receiver: Receiver<Vec<i16>>,
) -> Result<Stream>
where
    T: SizedSample + FromSample<i16>,
{
    let channels = usize::from(config.channels.max(1));
    let mut pending: Vec<i16> = Vec::new();
    let mut pos = 0usize;

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    if pos >= pending.len() {
                        pending = receiver.try_recv().unwrap_or_default();
                        pos = 0;
                    }
                    let value = match pending.get(pos) {
                        Some(&sample) => {
                            pos += 1;
                            T::from_sample(sample)
                        }
                        // Underrun: output silence
                        None => T::EQUILIBRIUM,
                    };
                    frame.fill(value);
                }
            },
            |err| error!("Output stream error: {}", err),
            None,
        )
        .map_err(|e| AudioError::StreamError(format!("Failed to build output stream: {}", e)))
}

/// Mono playback stream on the default output device
pub struct CpalPlayback {
    stream: Option<Stream>,
    device_name: String,
    sender: Sender<Vec<i16>>,
}

impl CpalPlayback {
    fn open(device: &cpal::Device, sample_rate_hz: u32) -> Result<Self> {
        let ranges = device
            .supported_output_configs()
            .map_err(|e| AudioError::UnsupportedConfiguration(e.to_string()))?;
        let layout = select_layout(ranges, sample_rate_hz).ok_or_else(|| {
            AudioError::UnsupportedConfiguration(format!(
                "No output layout at {} Hz",
                sample_rate_hz
            ))
        })?;
        let config = layout.stream_config(sample_rate_hz);
        debug!("Playback layout: {:?}, config: {:?}", layout, config);

        let (sender, receiver) = bounded(PLAYBACK_QUEUE_CHUNKS);
        let stream = match layout.format {
            SampleFormat::I16 => build_output::<i16>(device, &config, receiver),
            SampleFormat::F32 => build_output::<f32>(device, &config, receiver),
            SampleFormat::U16 => build_output::<u16>(device, &config, receiver),
            other => Err(AudioError::UnsupportedConfiguration(format!(
                "Unsupported output sample format {:?}",
                other
            ))),
        }?;

        let device_name = device_name(device);
        info!("Opened playback on {} at {} Hz", device_name, sample_rate_hz);

        Ok(Self {
            stream: Some(stream),
            device_name,
            sender,
        })
    }

    fn stream(&self) -> Result<&Stream> {
        self.stream
            .as_ref()
            .ok_or_else(|| AudioError::StreamError("Playback stream released".to_string()))
    }
}

impl PlaybackStream for CpalPlayback {
    fn start(&mut self) -> Result<()> {
        self.stream()?
            .play()
            .map_err(|e| AudioError::StreamError(format!("Failed to start playback: {}", e)))
    }

    fn stop(&mut self) -> Result<()> {
        self.stream()?
            .pause()
            .map_err(|e| AudioError::StreamError(format!("Failed to stop playback: {}", e)))
    }

    fn release(&mut self) {
        if self.stream.take().is_some() {
            debug!("Released playback on {}", self.device_name);
        }
    }

    fn write(&mut self, samples: &[i16]) -> Result<usize> {
        self.stream()?;
        match self.sender.try_send(samples.to_vec()) {
            Ok(()) => Ok(samples.len()),
            Err(TrySendError::Full(_)) => {
                trace!("Playback queue full, dropping {} frames", samples.len());
                Ok(0)
            }
            Err(TrySendError::Disconnected(_)) => Err(AudioError::StreamError(
                "Playback queue disconnected".to_string(),
            )),
        }
    }
}

impl fmt::Debug for CpalPlayback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpalPlayback")
            .field("device", &self.device_name)
            .finish()
    }
}

// ============================================================================
// BACKEND
// ============================================================================

/// [`AudioBackend`] on the platform's default cpal host
///
/// Hosts are looked up per call, so the backend itself holds no platform
/// handle and is freely shared across threads.
#[derive(Debug, Clone, Copy)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        debug!("Using audio host: {:?}", cpal::default_host().id());
        Self
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        info!("Initializing CPAL backend");
        Self::new()
    }
}

impl AudioBackend for CpalBackend {
    fn min_buffer_frames(&self, sample_rate_hz: u32) -> Option<u32> {
        let host = cpal::default_host();
        let input = host.default_input_device()?;
        let output = host.default_output_device()?;

        let input_layout = select_layout(input.supported_input_configs().ok()?, sample_rate_hz)?;
        let output_layout =
            select_layout(output.supported_output_configs().ok()?, sample_rate_hz)?;

        Some(input_layout.min_frames.max(output_layout.min_frames))
    }

    fn open_capture(&self, request: &CaptureRequest) -> Result<Box<dyn CaptureStream>> {
        let host = cpal::default_host();
        let device = match &request.device {
            Some(id) => match find_input_device(&host, id) {
                Ok(device) => device,
                Err(e) => {
                    warn!("Preferred input {} unavailable ({}), using default", id, e);
                    default_input_device(&host)?
                }
            },
            None => default_input_device(&host)?,
        };

        Ok(Box::new(CpalCapture::open(&device, request.sample_rate_hz)?))
    }

    fn open_playback(&self, request: &PlaybackRequest) -> Result<Box<dyn PlaybackStream>> {
        let host = cpal::default_host();
        let device = default_output_device(&host)?;
        Ok(Box::new(CpalPlayback::open(&device, request.sample_rate_hz)?))
    }

    fn input_devices(&self) -> Result<Vec<DeviceInfo>> {
        let host = cpal::default_host();
        let default_name = host.default_input_device().map(|d| device_name(&d));

        let mut devices = Vec::new();
        for device in host
            .input_devices()
            .map_err(|e| AudioError::OsError(e.to_string()))?
        {
            let name = device_name(&device);
            let (min_sample_rate, max_sample_rate) = match device.supported_input_configs() {
                Ok(ranges) => ranges.fold((None, None), |(lo, hi): (Option<u32>, Option<u32>), r| {
                    (
                        Some(lo.map_or(r.min_sample_rate(), |v| v.min(r.min_sample_rate()))),
                        Some(hi.map_or(r.max_sample_rate(), |v| v.max(r.max_sample_rate()))),
                    )
                }),
                Err(e) => {
                    warn!("No input configs for {}: {}", name, e);
                    (None, None)
                }
            };

            devices.push(DeviceInfo {
                id: DeviceId::new(name.clone()),
                is_default: default_name.as_deref() == Some(name.as_str()),
                name,
                min_sample_rate,
                max_sample_rate,
            });
        }

        info!("Found {} input devices", devices.len());
        Ok(devices)
    }
}
