//! ALSA PCM capture device setup.

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};

use crate::error::CaptureError;

/// Period requested from ALSA. One read blocks for about this many frames,
/// which bounds how quickly the worker notices a stop request.
pub const CAPTURE_PERIOD_FRAMES: usize = 1024;

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    /// Actual sample rate after negotiation
    pub sample_rate: u32,
    /// Actual number of channels
    pub channels: u16,
    /// Period size in frames
    pub period_size: usize,
}

fn open_error<'a>(device: &'a str, what: &'static str) -> impl Fn(alsa::Error) -> CaptureError + 'a {
    move |e| CaptureError::Open(format!("{} on '{}': {}", what, device, e))
}

/// Open a PCM device for capture as interleaved s16le.
///
/// The negotiated rate must match `sample_rate`; the encoder is told the
/// configured rate and would otherwise play back at the wrong speed.
pub fn open_capture(
    device: &str,
    sample_rate: u32,
    channels: u16,
) -> Result<(PCM, AlsaParams), CaptureError> {
    let pcm = PCM::new(device, Direction::Capture, false)
        .map_err(open_error(device, "Failed to open PCM device"))?;

    // 配置硬件参数
    {
        let hwp = HwParams::any(&pcm).map_err(open_error(device, "Failed to initialize HwParams"))?;
        let set = open_error(device, "Unsupported hardware parameters");
        hwp.set_access(Access::RWInterleaved).map_err(&set)?;
        hwp.set_format(Format::S16LE).map_err(&set)?;
        hwp.set_channels(channels as u32).map_err(&set)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest).map_err(&set)?;
        hwp.set_period_size_near(CAPTURE_PERIOD_FRAMES as alsa::pcm::Frames, ValueOr::Nearest)
            .map_err(&set)?;
        pcm.hw_params(&hwp).map_err(&set)?;
    }

    // 读回实际协商的参数
    let params = {
        let read = open_error(device, "Failed to read back hardware parameters");
        let hwp = pcm.hw_params_current().map_err(&read)?;
        AlsaParams {
            sample_rate: hwp.get_rate().map_err(&read)?,
            channels: hwp.get_channels().map_err(&read)? as u16,
            period_size: hwp.get_period_size().map_err(&read)? as usize,
        }
    };

    if params.sample_rate != sample_rate {
        return Err(CaptureError::Open(format!(
            "'{}' does not support {} Hz (nearest is {} Hz)",
            device, sample_rate, params.sample_rate
        )));
    }

    log::info!(
        "ALSA Capture: device={}, rate={}, channels={}, period_size={}",
        device,
        params.sample_rate,
        params.channels,
        params.period_size,
    );

    Ok((pcm, params))
}
