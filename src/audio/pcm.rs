//! Raw PCM helpers shared by every capture strategy.
//!
//! All strategies hand the encoder interleaved signed 16-bit little-endian
//! samples at the configured rate and channel count. Device buffers are
//! converted here: float quantization, integer narrowing and mono/stereo
//! adjustment.

use bytes::Bytes;

use crate::error::CaptureError;

/// Bytes per sample (s16le).
pub const BYTES_PER_SAMPLE: usize = 2;

/// Sample rate / channel layout of the PCM handed to the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Size of one interleaved frame (one sample per channel) in bytes.
    pub fn bytes_per_frame(&self) -> usize {
        BYTES_PER_SAMPLE * self.channels as usize
    }
}

/// One buffer of interleaved s16le PCM.
///
/// The byte length is always a multiple of `2 * channels`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmFrame {
    data: Bytes,
    channels: u16,
}

impl PcmFrame {
    /// Build a frame from interleaved samples. Trailing samples that do not
    /// complete a frame are dropped.
    pub fn from_samples(samples: &[i16], channels: u16) -> Self {
        let whole = samples.len() - samples.len() % channels.max(1) as usize;
        let mut data = Vec::with_capacity(whole * BYTES_PER_SAMPLE);
        for sample in &samples[..whole] {
            data.extend_from_slice(&sample.to_le_bytes());
        }
        Self {
            data: Bytes::from(data),
            channels,
        }
    }

    /// Wrap bytes that are already s16le. Returns `None` when the length
    /// breaks the frame alignment.
    pub fn from_le_bytes(data: Bytes, channels: u16) -> Option<Self> {
        if channels == 0 || data.len() % (BYTES_PER_SAMPLE * channels as usize) != 0 {
            return None;
        }
        Some(Self { data, channels })
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of interleaved frames in the buffer.
    pub fn frame_count(&self) -> usize {
        self.data.len() / (BYTES_PER_SAMPLE * self.channels as usize)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}

/// Quantize a normalized float sample to s16: clamp to [-1.0, 1.0] first,
/// then `round(x * 32767)`. NaN maps to silence.
#[inline]
pub fn quantize_f32(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    let clamped = sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32).round() as i16
}

/// Convert a device sample to s16.
pub trait IntoPcm16: Copy {
    fn into_pcm16(self) -> i16;
}

impl IntoPcm16 for i16 {
    #[inline]
    fn into_pcm16(self) -> i16 {
        self
    }
}

impl IntoPcm16 for f32 {
    #[inline]
    fn into_pcm16(self) -> i16 {
        quantize_f32(self)
    }
}

impl IntoPcm16 for i32 {
    #[inline]
    fn into_pcm16(self) -> i16 {
        (self >> 16) as i16
    }
}

impl IntoPcm16 for u16 {
    #[inline]
    fn into_pcm16(self) -> i16 {
        (self as i32 - 32768) as i16
    }
}

/// Reject layouts other than mono and stereo before any stream is built.
pub fn check_channel_layout(channels: u16) -> Result<(), CaptureError> {
    match channels {
        1 | 2 => Ok(()),
        found => Err(CaptureError::UnsupportedChannelLayout { found }),
    }
}

/// Match the encoder's channel count.
///
/// Mono to stereo duplicates every sample; stereo to mono keeps the first
/// channel. Any other layout is rejected.
pub fn adjust_channels<T: Copy>(
    samples: &[T],
    source_channels: u16,
    target_channels: u16,
) -> Result<Vec<T>, CaptureError> {
    check_channel_layout(source_channels)?;
    check_channel_layout(target_channels)?;

    match (source_channels, target_channels) {
        (1, 2) => Ok(samples.iter().flat_map(|&s| [s, s]).collect()),
        (2, 1) => Ok(samples.chunks_exact(2).map(|frame| frame[0]).collect()),
        _ => Ok(samples.to_vec()),
    }
}

/// Convert and channel-adjust one device buffer into a frame for the encoder.
pub fn to_frame<T: IntoPcm16>(
    samples: &[T],
    source_channels: u16,
    target_channels: u16,
) -> Result<PcmFrame, CaptureError> {
    let converted: Vec<i16> = samples.iter().map(|s| s.into_pcm16()).collect();
    let adjusted = adjust_channels(&converted, source_channels, target_channels)?;
    Ok(PcmFrame::from_samples(&adjusted, target_channels))
}
