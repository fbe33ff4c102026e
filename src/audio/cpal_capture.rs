//! cpal-backed capture strategies.
//!
//! `LoopbackCapture` records what the default output device is playing
//! (WASAPI loopback: an input stream built on the output device).
//! `DeviceCapture` records a named or default input device on hosts that
//! are not served by ALSA directly.
//!
//! cpal delivers buffers on its own callback thread. Callbacks never block:
//! they hand data to the capture worker through a small sync channel and
//! drop it when the worker falls behind. Stream errors travel on their own
//! one-slot channel so a full data queue cannot swallow them.
//!
//! Loopback always runs at the device mix format; `LoopbackChunker`
//! resamples it to the configured rate.

use std::sync::mpsc::{self as std_mpsc, Receiver, RecvTimeoutError, SyncSender, TrySendError};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
#[cfg(not(target_os = "linux"))]
use cpal::{BufferSize, SampleRate, StreamConfig};
use cpal::SampleFormat;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tokio_util::sync::CancellationToken;

use super::capture::{CaptureHandle, CaptureSource, FrameSink, POLL_INTERVAL};
#[cfg(not(target_os = "linux"))]
use super::pcm::IntoPcm16;
use super::pcm::{self, PcmFormat, PcmFrame};
use crate::error::CaptureError;

/// Frames per loopback chunk, counted at the mix rate.
pub const LOOPBACK_CHUNK_FRAMES: usize = 1024;

// callback -> worker
const CALLBACK_QUEUE: usize = 64;

fn error_channel() -> (SyncSender<String>, StreamErrors) {
    let (tx, rx) = std_mpsc::sync_channel(1);
    (tx, StreamErrors(rx))
}

/// First error reported by a cpal stream, kept apart from the data queue.
struct StreamErrors(Receiver<String>);

impl StreamErrors {
    fn check(&self) -> Result<(), CaptureError> {
        match self.0.try_recv() {
            Ok(msg) => Err(CaptureError::Io(msg)),
            Err(_) => Ok(()),
        }
    }
}

fn error_callback(tx: SyncSender<String>) -> impl FnMut(cpal::StreamError) + Send + 'static {
    move |err| {
        log::error!("Audio stream error: {}", err);
        // Later errors add nothing once one is pending.
        let _ = tx.try_send(err.to_string());
    }
}

fn forward<T: Send>(tx: &SyncSender<T>, item: T) {
    if let Err(TrySendError::Full(_)) = tx.try_send(item) {
        log::debug!("Capture worker behind, dropping one buffer");
    }
}

/// Turns loopback buffers (interleaved float at the mix rate and layout)
/// into frames at the configured rate and channel count.
pub struct LoopbackChunker {
    mix_channels: u16,
    target: PcmFormat,
    resampler: Option<SincFixedIn<f32>>,
    pending: Vec<f32>,
}

impl LoopbackChunker {
    pub fn new(mix_channels: u16, mix_rate: u32, target: PcmFormat) -> Result<Self, CaptureError> {
        pcm::check_channel_layout(mix_channels)?;

        let resampler = if mix_rate == target.sample_rate {
            None
        } else {
            let params = SincInterpolationParameters {
                sinc_len: 128,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 128,
                window: WindowFunction::BlackmanHarris2,
            };
            let resampler = SincFixedIn::<f32>::new(
                target.sample_rate as f64 / mix_rate as f64,
                1.0,
                params,
                LOOPBACK_CHUNK_FRAMES,
                mix_channels as usize,
            )
            .map_err(|e| {
                CaptureError::Open(format!(
                    "cannot resample {} Hz to {} Hz: {}",
                    mix_rate, target.sample_rate, e
                ))
            })?;
            Some(resampler)
        };

        Ok(Self {
            mix_channels,
            target,
            resampler,
            pending: Vec::with_capacity(LOOPBACK_CHUNK_FRAMES * mix_channels as usize * 2),
        })
    }

    /// Buffer `samples` and return every chunk that is now complete.
    pub fn push(&mut self, samples: &[f32]) -> Result<Vec<PcmFrame>, CaptureError> {
        self.pending.extend_from_slice(samples);

        let channels = self.mix_channels as usize;
        let chunk = LOOPBACK_CHUNK_FRAMES * channels;
        let mut frames = Vec::new();
        while self.pending.len() >= chunk {
            let input = &self.pending[..chunk];
            let frame = match self.resampler.as_mut() {
                None => pcm::to_frame(input, self.mix_channels, self.target.channels)?,
                Some(resampler) => {
                    let planar: Vec<Vec<f32>> = (0..channels)
                        .map(|c| input.iter().skip(c).step_by(channels).copied().collect())
                        .collect();
                    let resampled = resampler
                        .process(&planar, None)
                        .map_err(|e| CaptureError::Io(format!("resampling failed: {}", e)))?;

                    let len = resampled.first().map_or(0, Vec::len);
                    let mut interleaved = Vec::with_capacity(len * channels);
                    for i in 0..len {
                        interleaved.extend(resampled.iter().map(|ch| ch[i]));
                    }
                    pcm::to_frame(&interleaved, self.mix_channels, self.target.channels)?
                }
            };
            self.pending.drain(..chunk);
            frames.push(frame);
        }
        Ok(frames)
    }
}

/// System audio via loopback on the default output device.
pub struct LoopbackCapture {
    label: String,
}

impl LoopbackCapture {
    pub fn new(label: String) -> Self {
        Self { label }
    }
}

impl CaptureSource for LoopbackCapture {
    fn label(&self) -> &str {
        &self.label
    }

    fn open(
        &self,
        format: PcmFormat,
        queue_depth: usize,
        cancel: CancellationToken,
    ) -> Result<CaptureHandle, CaptureError> {
        CaptureHandle::spawn("loopback", queue_depth, cancel, move |sink| {
            run_loopback(format, sink)
        })
    }
}

fn run_loopback(format: PcmFormat, sink: &mut FrameSink) -> Result<(), CaptureError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| CaptureError::Open("no default output device for loopback".to_string()))?;
    let mix = device
        .default_output_config()
        .map_err(|e| CaptureError::Open(format!("failed to query mix format: {}", e)))?;

    // Shared-mode loopback only accepts the mix format itself.
    if mix.sample_format() != SampleFormat::F32 {
        return Err(CaptureError::Open(format!(
            "loopback mix format {:?} is not float",
            mix.sample_format()
        )));
    }
    let config = mix.config();
    let mut chunker = LoopbackChunker::new(config.channels, config.sample_rate.0, format)?;

    let (tx, rx) = std_mpsc::sync_channel::<Vec<f32>>(CALLBACK_QUEUE);
    let (err_tx, errors) = error_channel();
    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| forward(&tx, data.to_vec()),
            error_callback(err_tx),
            None,
        )
        .map_err(|e| CaptureError::Open(e.to_string()))?;
    stream
        .play()
        .map_err(|e| CaptureError::Open(e.to_string()))?;

    log::info!(
        "Loopback capture started: {} Hz {} channel mix -> {} Hz",
        config.sample_rate.0,
        config.channels,
        format.sample_rate
    );
    sink.started();

    while !sink.is_stopped() {
        errors.check()?;
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(samples) => {
                for frame in chunker.push(&samples)? {
                    if !sink.push(frame) {
                        return Ok(());
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                return Err(CaptureError::Io("loopback stream closed".to_string()));
            }
        }
    }

    let _ = stream.pause();
    Ok(())
}

/// A named input device, or the host default when `device_name` is `None`.
#[cfg(not(target_os = "linux"))]
pub struct DeviceCapture {
    label: String,
    device_name: Option<String>,
    channels: u16,
}

#[cfg(not(target_os = "linux"))]
impl DeviceCapture {
    pub fn new(label: String, device_name: Option<String>, channels: u16) -> Self {
        Self {
            label,
            device_name,
            channels,
        }
    }
}

#[cfg(not(target_os = "linux"))]
impl CaptureSource for DeviceCapture {
    fn label(&self) -> &str {
        &self.label
    }

    fn open(
        &self,
        format: PcmFormat,
        queue_depth: usize,
        cancel: CancellationToken,
    ) -> Result<CaptureHandle, CaptureError> {
        let device_name = self.device_name.clone();
        let channels = self.channels;
        CaptureHandle::spawn("input", queue_depth, cancel, move |sink| {
            run_device(device_name.as_deref(), channels, format, sink)
        })
    }
}

#[cfg(not(target_os = "linux"))]
fn find_input(host: &cpal::Host, name: Option<&str>) -> Result<cpal::Device, CaptureError> {
    match name {
        None => host
            .default_input_device()
            .ok_or_else(|| CaptureError::Open("no default input device".to_string())),
        Some(name) => host
            .input_devices()
            .map_err(|e| CaptureError::Open(e.to_string()))?
            .find(|d| d.name().is_ok_and(|n| n == name))
            .ok_or_else(|| CaptureError::Open(format!("input device '{}' disappeared", name))),
    }
}

#[cfg(not(target_os = "linux"))]
fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    tx: SyncSender<PcmFrame>,
    err_tx: SyncSender<String>,
    target_channels: u16,
) -> Result<cpal::Stream, CaptureError>
where
    T: cpal::SizedSample + IntoPcm16 + Send + 'static,
{
    let device_channels = config.channels;
    let convert_err = err_tx.clone();
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                match pcm::to_frame(data, device_channels, target_channels) {
                    Ok(frame) => forward(&tx, frame),
                    Err(e) => {
                        let _ = convert_err.try_send(e.to_string());
                    }
                }
            },
            error_callback(err_tx),
            None,
        )
        .map_err(|e| CaptureError::Open(e.to_string()))
}

#[cfg(not(target_os = "linux"))]
fn run_device(
    device_name: Option<&str>,
    channels: u16,
    format: PcmFormat,
    sink: &mut FrameSink,
) -> Result<(), CaptureError> {
    pcm::check_channel_layout(channels)?;

    let host = cpal::default_host();
    let device = find_input(&host, device_name)?;
    let sample_format = device
        .default_input_config()
        .map_err(|e| CaptureError::Open(e.to_string()))?
        .sample_format();

    let config = StreamConfig {
        channels,
        sample_rate: SampleRate(format.sample_rate),
        buffer_size: BufferSize::Default,
    };

    let (tx, rx) = std_mpsc::sync_channel(CALLBACK_QUEUE);
    let (err_tx, errors) = error_channel();
    let target = format.channels;
    let stream = match sample_format {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, tx, err_tx, target)?,
        SampleFormat::I16 => build_stream::<i16>(&device, &config, tx, err_tx, target)?,
        SampleFormat::I32 => build_stream::<i32>(&device, &config, tx, err_tx, target)?,
        SampleFormat::U16 => build_stream::<u16>(&device, &config, tx, err_tx, target)?,
        other => {
            return Err(CaptureError::Open(format!(
                "unsupported sample format {:?}",
                other
            )));
        }
    };
    stream
        .play()
        .map_err(|e| CaptureError::Open(e.to_string()))?;

    log::info!(
        "Input capture started on '{}': {} Hz, {} ch",
        device.name().unwrap_or_default(),
        format.sample_rate,
        channels
    );
    sink.started();

    while !sink.is_stopped() {
        errors.check()?;
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(frame) => {
                if !sink.push(frame) {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                return Err(CaptureError::Io("input stream closed".to_string()));
            }
        }
    }

    let _ = stream.pause();
    Ok(())
}
