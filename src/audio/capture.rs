//! Per-session capture: the strategy trait, the worker thread and the
//! bounded PCM channel between them.
//!
//! Device I/O runs on a dedicated OS thread (cpal streams are not `Send`,
//! ALSA reads block). The thread pushes converted frames into a bounded
//! tokio channel and polls the session's cancellation token between reads.
//! A failure skips the queue: it is parked in the handle and announced on
//! a separate token, so a consumer stuck behind queued frames still sees it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::device::{CaptureStrategy, ResolvedAudioSource};
use super::pcm::{PcmFormat, PcmFrame};
use crate::error::CaptureError;

/// How often a waiting capture worker re-checks its stop signal.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One item from the capture worker: a frame, or the error that ended it.
/// The error, if any, comes after every frame.
pub type CaptureEvent = Result<PcmFrame, CaptureError>;

/// A capture strategy, selected once at startup and opened per session.
pub trait CaptureSource: Send + Sync {
    fn label(&self) -> &str;

    /// Open the device and start the worker.
    ///
    /// Blocks until the device is running or has failed to open. Frames are
    /// delivered in `format`; the worker stops when `cancel` fires or the
    /// returned handle is dropped.
    fn open(
        &self,
        format: PcmFormat,
        queue_depth: usize,
        cancel: CancellationToken,
    ) -> Result<CaptureHandle, CaptureError>;
}

/// Build the strategy for a resolved source.
pub fn source_for(resolved: &ResolvedAudioSource) -> Arc<dyn CaptureSource> {
    let channels = resolved.effective_channels;
    let device_name = resolved.device.as_ref().map(|d| d.name.clone());

    match resolved.strategy {
        CaptureStrategy::SystemLoopback => Arc::new(super::cpal_capture::LoopbackCapture::new(
            resolved.label.clone(),
        )),
        #[cfg(target_os = "linux")]
        CaptureStrategy::NamedDevice | CaptureStrategy::DefaultInput => {
            Arc::new(super::alsa_capture::AlsaCapture::new(
                resolved.label.clone(),
                device_name.unwrap_or_else(|| "default".to_string()),
                channels,
            ))
        }
        #[cfg(not(target_os = "linux"))]
        CaptureStrategy::NamedDevice | CaptureStrategy::DefaultInput => {
            Arc::new(super::cpal_capture::DeviceCapture::new(
                resolved.label.clone(),
                device_name,
                channels,
            ))
        }
    }
}

/// Consumer side of a running capture.
///
/// Dropping the handle closes it.
pub struct CaptureHandle {
    frames: mpsc::Receiver<PcmFrame>,
    cancel: CancellationToken,
    failed: CancellationToken,
    failure: Arc<Mutex<Option<CaptureError>>>,
    finished: Arc<AtomicBool>,
}

impl CaptureHandle {
    /// Start `run` on a new thread and wait until it reports that the device
    /// is running (`FrameSink::started`) or fails.
    pub fn spawn<F>(
        name: &str,
        queue_depth: usize,
        cancel: CancellationToken,
        run: F,
    ) -> Result<Self, CaptureError>
    where
        F: FnOnce(&mut FrameSink) -> Result<(), CaptureError> + Send + 'static,
    {
        let (tx, frames) = mpsc::channel(queue_depth.max(1));
        let (startup_tx, startup_rx) = std_mpsc::sync_channel(1);
        let finished = Arc::new(AtomicBool::new(false));
        let failed = CancellationToken::new();
        let failure = Arc::new(Mutex::new(None));

        let mut sink = FrameSink {
            tx,
            cancel: cancel.clone(),
            startup: Some(startup_tx),
        };
        let done = finished.clone();
        let failed_signal = failed.clone();
        let failure_slot = failure.clone();
        let label = name.to_string();

        thread::Builder::new()
            .name(format!("capture-{}", name))
            .spawn(move || {
                let result = run(&mut sink);
                match result {
                    Ok(()) => log::debug!("Capture '{}' stopped", label),
                    Err(e) => match sink.startup.take() {
                        Some(startup) => {
                            let _ = startup.send(Err(e));
                        }
                        None => {
                            log::warn!("Capture '{}' failed: {}", label, e);
                            if let Ok(mut slot) = failure_slot.lock() {
                                *slot = Some(e);
                            }
                            failed_signal.cancel();
                        }
                    },
                }
                // Closes the frame queue after the failure is parked.
                drop(sink);
                done.store(true, Ordering::SeqCst);
            })
            .map_err(|e| CaptureError::Open(format!("failed to spawn capture thread: {}", e)))?;

        match startup_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                frames,
                cancel,
                failed,
                failure,
                finished,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CaptureError::Open(
                "capture stopped before the device started".to_string(),
            )),
        }
    }

    /// Next captured frame. After the last frame comes the worker's error,
    /// if it failed, then `None`.
    pub async fn next_frame(&mut self) -> Option<CaptureEvent> {
        match self.frames.recv().await {
            Some(frame) => Some(Ok(frame)),
            None => self.take_failure().map(Err),
        }
    }

    /// Fires as soon as the worker fails, even with frames still queued.
    pub fn failure_signal(&self) -> CancellationToken {
        self.failed.clone()
    }

    /// The error that stopped the worker. Returned once.
    pub fn take_failure(&self) -> Option<CaptureError> {
        self.failure.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Signal the worker to stop. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.cancel.cancel();
        self.frames.close();
    }

    /// Shared flag flipped when the worker thread returns.
    pub fn finished_flag(&self) -> Arc<AtomicBool> {
        self.finished.clone()
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Producer side handed to the worker.
pub struct FrameSink {
    tx: mpsc::Sender<PcmFrame>,
    cancel: CancellationToken,
    startup: Option<std_mpsc::SyncSender<Result<(), CaptureError>>>,
}

impl FrameSink {
    /// Report that the device is open and streaming.
    pub fn started(&mut self) {
        if let Some(startup) = self.startup.take() {
            let _ = startup.send(Ok(()));
        }
    }

    /// True once the session asked to stop or the consumer went away.
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    /// Queue a frame, waiting for room. Returns `false` when the worker
    /// should stop.
    pub fn push(&self, frame: PcmFrame) -> bool {
        if self.is_stopped() {
            return false;
        }
        if frame.is_empty() {
            return true;
        }
        self.tx.blocking_send(frame).is_ok()
    }
}


#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::testing::{ScriptedCapture, Tail};
    use super::*;

    fn format() -> PcmFormat {
        PcmFormat::new(44_100, 2)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_frames_arrive_in_order() {
        let source = ScriptedCapture::new(
            vec![vec![1; 8], vec![2; 8], vec![3; 8]],
            Tail::End,
        );
        let mut handle = source.open(format(), 4, CancellationToken::new()).unwrap();

        let mut seen = Vec::new();
        while let Some(event) = handle.next_frame().await {
            seen.push(event.unwrap().as_bytes()[0]);
        }
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_read_error_is_delivered_after_frames() {
        let source = ScriptedCapture::new(vec![vec![7; 4]], Tail::Fail);
        let mut handle = source.open(format(), 4, CancellationToken::new()).unwrap();

        assert!(handle.next_frame().await.unwrap().is_ok());
        let err = handle.next_frame().await.unwrap().unwrap_err();
        assert!(matches!(err, CaptureError::Io(_)));
        assert!(handle.next_frame().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failure_is_signalled_ahead_of_queued_frames() {
        let source = ScriptedCapture::new(vec![vec![1; 8], vec![2; 8], vec![3; 8]], Tail::Fail);
        let mut handle = source.open(format(), 4, CancellationToken::new()).unwrap();

        // Nothing has been read, yet the failure is already visible.
        let signal = handle.failure_signal();
        tokio::time::timeout(Duration::from_millis(500), signal.cancelled())
            .await
            .unwrap();

        let mut seen = Vec::new();
        let mut error = None;
        while let Some(event) = handle.next_frame().await {
            match event {
                Ok(frame) => seen.push(frame.as_bytes()[0]),
                Err(e) => error = Some(e),
            }
        }
        assert_eq!(seen, vec![1, 2, 3]);
        assert!(matches!(error, Some(CaptureError::Io(_))));
        assert!(handle.take_failure().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_open_failure_is_reported_synchronously() {
        let result = CaptureHandle::spawn("broken", 4, CancellationToken::new(), |_sink| {
            Err(CaptureError::Open("no such device".to_string()))
        });
        assert!(matches!(result, Err(CaptureError::Open(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_worker_exits_promptly_after_stop_signal() {
        let source = ScriptedCapture::marker(0x5a);
        let cancel = CancellationToken::new();
        let mut handle = source.open(format(), 2, cancel.clone()).unwrap();
        assert!(handle.next_frame().await.is_some());

        cancel.cancel();
        let flag = handle.finished_flag();
        // Keep draining so a blocked send can observe the stop.
        let deadline = Instant::now() + Duration::from_millis(500);
        while !flag.load(Ordering::SeqCst) && Instant::now() < deadline {
            let _ = tokio::time::timeout(POLL_INTERVAL, handle.next_frame()).await;
        }
        assert!(flag.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dropping_handle_stops_blocked_worker() {
        let source = ScriptedCapture::marker(0x11);
        let handle = source.open(format(), 1, CancellationToken::new()).unwrap();
        let flag = handle.finished_flag();
        drop(handle);

        let deadline = Instant::now() + Duration::from_millis(500);
        while !flag.load(Ordering::SeqCst) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_close_is_idempotent() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        let source = ScriptedCapture::new(vec![vec![0; 4]], Tail::End);
        let mut handle = source.open(format(), 4, CancellationToken::new()).unwrap();
        handle.close();
        handle.close();
        drop(handle);
    }
}
