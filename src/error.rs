//! Error taxonomy for source resolution, capture, encoding and sessions.
//!
//! Everything below `SessionError` is contained inside one session; only a
//! `ResolveError` at startup is allowed to take the whole process down.

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResolveError {
    /// The requested capture mode has no usable backend on this host.
    #[error("Capture mode unavailable: {0}")]
    UnsupportedSource(String),

    /// A named or expected device is not installed / not visible.
    #[error("Audio device not found: {0}")]
    DeviceNotFound(String),
}

#[derive(Error, Debug)]
pub enum CaptureError {
    /// The device could not be opened or configured.
    #[error("Failed to open capture device: {0}")]
    Open(String),

    /// Device read failure after streaming started.
    #[error("Capture device error: {0}")]
    Io(String),

    #[error("Unsupported channel layout: {found} channel(s), only mono and stereo are supported")]
    UnsupportedChannelLayout { found: u16 },
}

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("Failed to start encoder {program}: {source}. Install ffmpeg or set encoder_path")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Broken pipe (or any I/O failure) on the encoder's stdin/stdout.
    #[error("Encoder pipe error: {0}")]
    Pipe(#[source] std::io::Error),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Encoder(#[from] EncoderError),

    /// The client went away. This is the normal way a stream ends.
    #[error("Client disconnected")]
    ClientDisconnect,
}

impl SessionError {
    /// Status used when the session fails before any byte was sent.
    pub fn http_status(&self) -> StatusCode {
        match self {
            SessionError::Resolve(_) | SessionError::Capture(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            SessionError::Encoder(_) => StatusCode::INTERNAL_SERVER_ERROR,
            // Never produced while opening.
            SessionError::ClientDisconnect => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_client_disconnect(&self) -> bool {
        matches!(self, SessionError::ClientDisconnect)
    }
}
