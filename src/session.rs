//! One client connection: capture -> encoder -> response body.
//!
//! ```text
//!   capture thread --PcmFrame--> feeder task --stdin--> encoder
//!   encoder --stdout--> drain loop --Bytes--> response body
//! ```
//!
//! Both halves watch the session's cancellation token. Whichever side fails
//! first cancels it; the other side stops within one read or write.
//! `close` always runs: stop signal, feeder joined (stdin closed), encoder
//! killed and reaped.

use std::fmt;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::{CaptureHandle, CaptureSource};
use crate::config::SessionConfig;
use crate::encoder::{EncoderProcess, EncoderSettings};
use crate::error::{CaptureError, EncoderError, SessionError};

/// Encoder output is forwarded in reads of at most this many bytes.
pub const OUTPUT_CHUNK: usize = 4096;

/// Chunks handed to the HTTP response body.
pub type BodyChunk = Result<Bytes, io::Error>;

/// Everything a session needs, built once at startup and shared read-only.
pub struct SessionContext {
    pub capture: Arc<dyn CaptureSource>,
    pub encoder: EncoderSettings,
    pub config: SessionConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opening,
    Streaming,
    Draining,
    Closed,
}

/// Why a streaming session stopped.
#[derive(Debug)]
pub enum SessionEnd {
    /// The encoder closed its output.
    EncoderExited,
    /// The server is shutting down.
    Shutdown,
    /// Includes `SessionError::ClientDisconnect`, the normal way a stream ends.
    Error(SessionError),
}

impl SessionEnd {
    /// Anything but a client hang-up, an encoder EOF or a shutdown.
    pub fn is_failure(&self) -> bool {
        matches!(self, SessionEnd::Error(e) if !e.is_client_disconnect())
    }
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::EncoderExited => f.write_str("encoder exited"),
            SessionEnd::Shutdown => f.write_str("server shutdown"),
            SessionEnd::Error(e) => write!(f, "{}", e),
        }
    }
}

pub struct StreamSession {
    id: Uuid,
    state: SessionState,
    cancel: CancellationToken,
    encoder: EncoderProcess,
    output: Option<ChildStdout>,
    feeder: Option<JoinHandle<Result<(), SessionError>>>,
}

impl StreamSession {
    /// Start the encoder and the capture. Nothing has been sent to the client
    /// yet, so any error here becomes an HTTP error status.
    pub async fn open(
        ctx: &SessionContext,
        shutdown: &CancellationToken,
    ) -> Result<Self, SessionError> {
        let id = Uuid::new_v4();
        let cancel = shutdown.child_token();
        log::debug!("Session {} {:?} ({})", id, SessionState::Opening, ctx.capture.label());

        let mut encoder = EncoderProcess::start(&ctx.encoder)?;

        // Opening a device blocks until it is running.
        let source = ctx.capture.clone();
        let format = ctx.config.format;
        let depth = ctx.config.capture_queue_depth;
        let capture_cancel = cancel.child_token();
        let opened = tokio::task::spawn_blocking(move || source.open(format, depth, capture_cancel))
            .await
            .unwrap_or_else(|e| Err(CaptureError::Open(format!("capture open task failed: {}", e))));

        let capture = match opened {
            Ok(capture) => capture,
            Err(e) => {
                encoder.terminate().await;
                return Err(e.into());
            }
        };

        let (Some(input), Some(output)) = (encoder.take_input(), encoder.take_output()) else {
            encoder.terminate().await;
            return Err(EncoderError::Pipe(io::Error::other("encoder pipes unavailable")).into());
        };

        let feeder = tokio::spawn(feed(id, capture, input, cancel.clone()));

        log::info!("Session {} streaming (encoder pid {:?})", id, encoder.id());
        Ok(Self {
            id,
            state: SessionState::Streaming,
            cancel,
            encoder,
            output: Some(output),
            feeder: Some(feeder),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn encoder_pid(&self) -> Option<u32> {
        self.encoder.id()
    }

    /// Forward encoder output into `body` until something ends the session,
    /// then close it.
    pub async fn run(&mut self, body: mpsc::Sender<BodyChunk>) -> SessionEnd {
        let Some(mut output) = self.output.take() else {
            self.close().await;
            return SessionEnd::Error(
                EncoderError::Pipe(io::Error::other("encoder output already taken")).into(),
            );
        };

        let mut buf = vec![0u8; OUTPUT_CHUNK];
        // None: stopped by the token; the reason is decided below.
        let observed = loop {
            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break None,
                read = output.read(&mut buf) => read,
            };
            match read {
                Ok(0) => break Some(SessionEnd::EncoderExited),
                Ok(n) => {
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    let sent = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break None,
                        sent = body.send(Ok(chunk)) => sent,
                    };
                    if sent.is_err() {
                        break Some(SessionEnd::Error(SessionError::ClientDisconnect));
                    }
                }
                Err(e) => break Some(SessionEnd::Error(EncoderError::Pipe(e).into())),
            }
        };

        self.state = SessionState::Draining;
        self.cancel.cancel();
        let fed = self.join_feeder().await;
        drop(output);

        let end = match (observed, fed) {
            // A feeder failure is the root cause when the drain side merely
            // observed the stop signal or the encoder dying from it.
            (None | Some(SessionEnd::EncoderExited), Err(e)) => SessionEnd::Error(e),
            (Some(end), _) => end,
            (None, Ok(())) => SessionEnd::Shutdown,
        };

        self.close().await;
        if end.is_failure() {
            log::warn!("Session {} ended: {}", self.id, end);
        } else {
            log::info!("Session {} ended: {}", self.id, end);
        }
        end
    }

    async fn join_feeder(&mut self) -> Result<(), SessionError> {
        let Some(feeder) = self.feeder.take() else {
            return Ok(());
        };
        match feeder.await {
            Ok(result) => result,
            Err(e) => {
                log::debug!("Session {} feeder task ended abnormally: {}", self.id, e);
                Ok(())
            }
        }
    }

    /// Stop everything and reap the encoder. Returns `false` if the session
    /// was already closed.
    pub async fn close(&mut self) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }
        self.state = SessionState::Draining;
        self.cancel.cancel();

        // The feeder owns stdin; joining it closes the encoder input.
        if let Err(e) = self.join_feeder().await {
            log::debug!("Session {} feeder: {}", self.id, e);
        }
        drop(self.output.take());
        self.encoder.terminate().await;

        self.state = SessionState::Closed;
        log::debug!("Session {} closed", self.id);
        true
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if self.state != SessionState::Closed {
            self.cancel.cancel();
            if let Some(feeder) = self.feeder.take() {
                feeder.abort();
            }
            self.encoder.kill_now();
            log::debug!("Session {} dropped before close", self.id);
        }
    }
}

/// Move PCM from the capture into the encoder's stdin, in capture order.
///
/// A capture or pipe failure sets the stop signal, without waiting for
/// queued frames. A capture that ends cleanly only closes stdin so the
/// encoder can flush.
async fn feed(
    id: Uuid,
    mut capture: CaptureHandle,
    mut input: ChildStdin,
    cancel: CancellationToken,
) -> Result<(), SessionError> {
    // Fires even while this task is stuck behind a full stdin pipe.
    let failed = capture.failure_signal();
    let result = loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Ok(()),
            _ = failed.cancelled() => break Err(capture_failure(&capture)),
            event = capture.next_frame() => event,
        };
        match event {
            Some(Ok(frame)) => {
                let written = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break Ok(()),
                    _ = failed.cancelled() => break Err(capture_failure(&capture)),
                    written = input.write_all(frame.as_bytes()) => written,
                };
                if let Err(e) = written {
                    break Err(EncoderError::Pipe(e).into());
                }
            }
            Some(Err(e)) => break Err(e.into()),
            None => {
                log::debug!("Session {} capture finished", id);
                break Ok(());
            }
        }
    };

    if result.is_err() {
        cancel.cancel();
    }
    capture.close();
    drop(input);
    result
}

fn capture_failure(capture: &CaptureHandle) -> SessionError {
    capture
        .take_failure()
        .unwrap_or_else(|| CaptureError::Io("capture stopped".to_string()))
        .into()
}
