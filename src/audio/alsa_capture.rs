use tokio_util::sync::CancellationToken;

use super::alsa_device;
use super::capture::{CaptureHandle, CaptureSource, FrameSink};
use super::pcm::{self, PcmFormat};
use crate::error::CaptureError;

/// Capture from an ALSA PCM: a cable such as `hw:CARD=Loopback,DEV=1`, or
/// `default` for the default input.
pub struct AlsaCapture {
    label: String,
    pcm_name: String,
    channels: u16,
}

impl AlsaCapture {
    pub fn new(label: String, pcm_name: String, channels: u16) -> Self {
        Self {
            label,
            pcm_name,
            channels,
        }
    }
}

impl CaptureSource for AlsaCapture {
    fn label(&self) -> &str {
        &self.label
    }

    fn open(
        &self,
        format: PcmFormat,
        queue_depth: usize,
        cancel: CancellationToken,
    ) -> Result<CaptureHandle, CaptureError> {
        let pcm_name = self.pcm_name.clone();
        let channels = self.channels;
        CaptureHandle::spawn("alsa", queue_depth, cancel, move |sink| {
            record_thread(&pcm_name, channels, format, sink)
        })
    }
}

fn record_thread(
    pcm_name: &str,
    channels: u16,
    format: PcmFormat,
    sink: &mut FrameSink,
) -> Result<(), CaptureError> {
    // 1. 打开 ALSA 采集设备
    let (pcm, params) = alsa_device::open_capture(pcm_name, format.sample_rate, channels)?;
    pcm::check_channel_layout(params.channels)?;

    let io = pcm
        .io_i16()
        .map_err(|e| CaptureError::Open(format!("Failed to get PCM I/O: {}", e)))?;

    // 一个 period 的交织读缓冲
    let mut read_buf = vec![0i16; params.period_size * params.channels as usize];

    log::info!(
        "Recording started: rate={}, ch={} -> {}, period={}",
        params.sample_rate,
        params.channels,
        format.channels,
        params.period_size,
    );
    sink.started();

    while !sink.is_stopped() {
        match io.readi(&mut read_buf) {
            Ok(frames) => {
                let samples = &read_buf[..frames * params.channels as usize];
                let frame = pcm::to_frame(samples, params.channels, format.channels)?;
                if !sink.push(frame) {
                    break;
                }
            }
            Err(e) => {
                // XRUN 等错误用 prepare 恢复，恢复失败则结束采集
                log::warn!("ALSA capture error: {}, recovering...", e);
                if let Err(e2) = pcm.prepare() {
                    return Err(CaptureError::Io(format!(
                        "failed to recover PCM capture: {}",
                        e2
                    )));
                }
            }
        }
    }

    log::info!("Recording stopped");
    Ok(())
}
