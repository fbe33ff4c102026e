//! audio - Audio source resolution and PCM capture
//!
//! Picks the capture strategy for this host once at startup (native
//! loopback, a virtual cable, or the default input) and opens it per
//! session. Windows loopback and non-Linux inputs go through cpal; Linux
//! inputs are read from ALSA directly.

pub mod capture;
mod cpal_capture;
pub mod device;
pub mod pcm;

#[cfg(target_os = "linux")]
mod alsa_capture;
#[cfg(target_os = "linux")]
mod alsa_device;

pub use capture::{CaptureHandle, CaptureSource, source_for};
pub use device::{AudioMode, CaptureConfig, CpalCatalog, Platform, resolve};
pub use pcm::PcmFormat;
