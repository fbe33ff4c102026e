//! Device enumeration and capture source resolution.
//!
//! Resolution runs once per process: it looks at the host platform, the
//! configured capture mode and the visible input devices, and picks one of
//! three strategies (native loopback, a named/virtual-cable input device, or
//! the default input device).

use std::fmt;
use std::str::FromStr;

use cpal::traits::{DeviceTrait, HostTrait};

use super::pcm::PcmFormat;
use crate::error::ResolveError;

/// Capture mode selected by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioMode {
    /// Read what the default playback device is playing.
    SystemLoopback,
    /// Read from a virtual cable or another named input device.
    NamedInputDevice,
    /// Read from the default input device.
    DefaultInput,
}

impl AudioMode {
    /// Mode used when the settings leave it empty.
    ///
    /// macOS needs a virtual cable for system audio. Elsewhere loopback is
    /// native (Windows) or best effort: a cable if present, else default input.
    pub fn platform_default(platform: Platform) -> Self {
        match platform {
            Platform::MacOs => AudioMode::NamedInputDevice,
            _ => AudioMode::SystemLoopback,
        }
    }
}

impl FromStr for AudioMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "loopback" => Ok(AudioMode::SystemLoopback),
            "vbcable" | "cable" | "blackhole" | "device" => Ok(AudioMode::NamedInputDevice),
            "default" | "input" => Ok(AudioMode::DefaultInput),
            other => Err(format!(
                "unknown audio mode '{}' (expected loopback, vbcable or default)",
                other
            )),
        }
    }
}

impl fmt::Display for AudioMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AudioMode::SystemLoopback => "loopback",
            AudioMode::NamedInputDevice => "vbcable",
            AudioMode::DefaultInput => "default",
        };
        f.write_str(name)
    }
}

/// What the resolver needs from the settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    pub format: PcmFormat,
    pub mode: AudioMode,
    /// Substring of an input device name; replaces the platform cable markers.
    pub device_hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    MacOs,
    Linux,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else if cfg!(target_os = "linux") {
            Platform::Linux
        } else {
            Platform::Other
        }
    }

    /// Only WASAPI lets us open the default speaker as a capture source.
    pub fn has_native_loopback(&self) -> bool {
        matches!(self, Platform::Windows)
    }

    /// Name fragments identifying a virtual audio cable on this platform.
    pub fn cable_markers(&self) -> &'static [&'static str] {
        match self {
            Platform::Windows => &["CABLE Output"],
            Platform::MacOs => &["BlackHole"],
            Platform::Linux => &["Loopback"],
            Platform::Other => &[],
        }
    }

    fn cable_product(&self) -> &'static str {
        match self {
            Platform::Windows => "VB-Audio Cable",
            Platform::MacOs => "BlackHole",
            Platform::Linux => "ALSA loopback (snd-aloop)",
            Platform::Other => "virtual audio cable",
        }
    }

    fn cable_setup_hint(&self) -> &'static str {
        match self {
            Platform::Windows => "Set Windows audio output to 'VB-Audio Cable (CABLE Input)'.",
            Platform::MacOs => "Set macOS system audio output to the BlackHole device.",
            Platform::Linux => "Route playback to the ALSA Loopback playback device.",
            Platform::Other => "Route system playback into the virtual cable device.",
        }
    }
}

/// An input-capable device as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputDeviceInfo {
    /// Position in the host's enumeration order.
    pub index: usize,
    pub name: String,
    pub max_input_channels: u16,
}

/// Read-only view of the host audio subsystem.
pub trait DeviceCatalog {
    fn input_devices(&self) -> Result<Vec<InputDeviceInfo>, ResolveError>;

    fn default_input(&self) -> Result<Option<InputDeviceInfo>, ResolveError>;

    fn has_default_output(&self) -> bool;
}

/// `DeviceCatalog` over the cpal default host.
pub struct CpalCatalog {
    host: cpal::Host,
}

impl CpalCatalog {
    pub fn new() -> Self {
        Self {
            host: cpal::default_host(),
        }
    }

    fn describe(index: usize, device: &cpal::Device) -> Option<InputDeviceInfo> {
        let name = device.name().ok()?;
        let max_input_channels = device
            .supported_input_configs()
            .ok()?
            .map(|c| c.channels())
            .max()
            .unwrap_or(0);
        Some(InputDeviceInfo {
            index,
            name,
            max_input_channels,
        })
    }
}

impl DeviceCatalog for CpalCatalog {
    fn input_devices(&self) -> Result<Vec<InputDeviceInfo>, ResolveError> {
        let devices = self.host.input_devices().map_err(|e| {
            ResolveError::UnsupportedSource(format!("cannot enumerate input devices: {}", e))
        })?;

        Ok(devices
            .enumerate()
            .filter_map(|(index, device)| Self::describe(index, &device))
            .collect())
    }

    fn default_input(&self) -> Result<Option<InputDeviceInfo>, ResolveError> {
        let Some(device) = self.host.default_input_device() else {
            return Ok(None);
        };
        let Ok(name) = device.name() else {
            return Ok(None);
        };
        // Report the enumeration index when the default device is listed.
        let index = self
            .input_devices()?
            .into_iter()
            .find(|d| d.name == name)
            .map(|d| d.index)
            .unwrap_or(0);
        Ok(Self::describe(index, &device))
    }

    fn has_default_output(&self) -> bool {
        self.host.default_output_device().is_some()
    }
}

/// Concrete capture strategy picked by the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStrategy {
    SystemLoopback,
    NamedDevice,
    DefaultInput,
}

/// Opaque handle to the chosen device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceId {
    pub index: usize,
    pub name: String,
}

/// Result of resolution. Immutable for the rest of the process run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAudioSource {
    pub strategy: CaptureStrategy,
    /// `None` means "the platform default" (loopback speaker or default input).
    pub device: Option<DeviceId>,
    /// Channels to open the device with; 1 <= n <= min(requested, device max).
    pub effective_channels: u16,
    pub label: String,
    pub setup_hint: String,
}

/// Pick a capture strategy for `config` on `platform`.
///
/// Order: native loopback (Windows, loopback mode), then a virtual-cable /
/// hinted input device, then the default input device.
pub fn resolve(
    config: &CaptureConfig,
    platform: Platform,
    catalog: &dyn DeviceCatalog,
) -> Result<ResolvedAudioSource, ResolveError> {
    let requested = config.format.channels;

    if config.mode == AudioMode::SystemLoopback && platform.has_native_loopback() {
        if !catalog.has_default_output() {
            return Err(ResolveError::UnsupportedSource(
                "loopback capture needs a default playback device, none is configured. \
                 Pick an output device or switch audio capture to 'vbcable'"
                    .to_string(),
            ));
        }
        return Ok(ResolvedAudioSource {
            strategy: CaptureStrategy::SystemLoopback,
            device: None,
            effective_channels: requested,
            label: "Windows loopback".to_string(),
            setup_hint: "No VB-Audio Cable needed. Leave your normal speakers/headphones as default output."
                .to_string(),
        });
    }

    if config.mode != AudioMode::DefaultInput {
        if let Some(device) = find_cable(config, platform, catalog)? {
            let label = match &config.device_hint {
                Some(_) => device.name.clone(),
                None => platform.cable_product().to_string(),
            };
            return Ok(ResolvedAudioSource {
                strategy: CaptureStrategy::NamedDevice,
                effective_channels: effective_channels(requested, device.max_input_channels),
                device: Some(DeviceId {
                    index: device.index,
                    name: device.name,
                }),
                label,
                setup_hint: platform.cable_setup_hint().to_string(),
            });
        }

        if config.mode == AudioMode::NamedInputDevice || platform == Platform::MacOs {
            return Err(cable_not_found(config, platform));
        }
    }

    let Some(device) = catalog.default_input()? else {
        return Err(ResolveError::DeviceNotFound(
            "no default input device is available".to_string(),
        ));
    };
    if device.max_input_channels == 0 {
        return Err(ResolveError::DeviceNotFound(format!(
            "default input device '{}' reports no input channels",
            device.name
        )));
    }

    Ok(ResolvedAudioSource {
        strategy: CaptureStrategy::DefaultInput,
        effective_channels: effective_channels(requested, device.max_input_channels),
        device: None,
        label: "default input".to_string(),
        setup_hint: "Using default input device.".to_string(),
    })
}

/// min(requested, device max), floored at 1.
pub fn effective_channels(requested: u16, device_max: u16) -> u16 {
    requested.min(device_max).max(1)
}

fn find_cable(
    config: &CaptureConfig,
    platform: Platform,
    catalog: &dyn DeviceCatalog,
) -> Result<Option<InputDeviceInfo>, ResolveError> {
    let hint: Vec<String> = match &config.device_hint {
        Some(hint) => vec![hint.to_lowercase()],
        None => platform
            .cable_markers()
            .iter()
            .map(|m| m.to_lowercase())
            .collect(),
    };
    if hint.is_empty() {
        return Ok(None);
    }

    let devices = catalog.input_devices()?;
    Ok(devices.into_iter().find(|d| {
        let name = d.name.to_lowercase();
        d.max_input_channels >= 1 && hint.iter().any(|m| name.contains(m.as_str()))
    }))
}

fn cable_not_found(config: &CaptureConfig, platform: Platform) -> ResolveError {
    if let Some(hint) = &config.device_hint {
        return ResolveError::DeviceNotFound(format!(
            "no input device matching '{}'. Check the device name or switch audio capture to 'default'",
            hint
        ));
    }

    let alternative = if platform.has_native_loopback() {
        "switch audio capture to 'loopback' (Windows Loopback, no VB-Cable)"
    } else {
        "switch audio capture to 'default' to use the default input device"
    };
    ResolveError::DeviceNotFound(format!(
        "{} not found. Install {} OR {}",
        platform.cable_product(),
        platform.cable_product(),
        alternative
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory catalog for resolver tests.
    struct FakeCatalog {
        pub devices: Vec<InputDeviceInfo>,
        pub default_input: Option<usize>,
        pub default_output: bool,
    }

    impl FakeCatalog {
        pub fn with(names: &[(&str, u16)]) -> Self {
            Self {
                devices: names
                    .iter()
                    .enumerate()
                    .map(|(index, (name, ch))| InputDeviceInfo {
                        index,
                        name: name.to_string(),
                        max_input_channels: *ch,
                    })
                    .collect(),
                default_input: if names.is_empty() { None } else { Some(0) },
                default_output: true,
            }
        }
    }

    impl DeviceCatalog for FakeCatalog {
        fn input_devices(&self) -> Result<Vec<InputDeviceInfo>, ResolveError> {
            Ok(self.devices.clone())
        }

        fn default_input(&self) -> Result<Option<InputDeviceInfo>, ResolveError> {
            Ok(self.default_input.map(|i| self.devices[i].clone()))
        }

        fn has_default_output(&self) -> bool {
            self.default_output
        }
    }

    fn config(mode: AudioMode) -> CaptureConfig {
        CaptureConfig {
            format: PcmFormat::new(44_100, 2),
            mode,
            device_hint: None,
        }
    }

    #[test]
    fn test_windows_loopback_needs_no_device() {
        let catalog = FakeCatalog::with(&[("Microphone (Realtek)", 2)]);
        let source = resolve(&config(AudioMode::SystemLoopback), Platform::Windows, &catalog).unwrap();
        assert_eq!(source.strategy, CaptureStrategy::SystemLoopback);
        assert_eq!(source.device, None);
        assert_eq!(source.effective_channels, 2);
    }

    #[test]
    fn test_windows_loopback_without_output_is_unsupported() {
        let mut catalog = FakeCatalog::with(&[]);
        catalog.default_output = false;
        let err = resolve(&config(AudioMode::SystemLoopback), Platform::Windows, &catalog).unwrap_err();
        assert!(matches!(err, ResolveError::UnsupportedSource(_)));
    }

    #[test]
    fn test_cable_is_found_and_channels_clamped() {
        let catalog = FakeCatalog::with(&[
            ("Microphone (Realtek)", 2),
            ("CABLE Output (VB-Audio Virtual Cable)", 1),
        ]);
        let source = resolve(&config(AudioMode::NamedInputDevice), Platform::Windows, &catalog).unwrap();
        assert_eq!(source.strategy, CaptureStrategy::NamedDevice);
        assert_eq!(source.device.as_ref().map(|d| d.index), Some(1));
        assert_eq!(source.effective_channels, 1);
        assert_eq!(source.label, "VB-Audio Cable");
    }

    #[test]
    fn test_cable_without_input_channels_is_skipped() {
        let catalog = FakeCatalog::with(&[("BlackHole 2ch", 0), ("BlackHole 16ch", 16)]);
        let source = resolve(&config(AudioMode::NamedInputDevice), Platform::MacOs, &catalog).unwrap();
        assert_eq!(source.device.unwrap().name, "BlackHole 16ch");
        assert_eq!(source.effective_channels, 2);
    }

    #[test]
    fn test_vbcable_missing_mentions_alternate_mode() {
        let catalog = FakeCatalog::with(&[("Microphone (Realtek)", 2)]);
        let err = resolve(&config(AudioMode::NamedInputDevice), Platform::Windows, &catalog).unwrap_err();
        match err {
            ResolveError::DeviceNotFound(msg) => {
                assert!(msg.contains("VB-Audio Cable not found"));
                assert!(msg.contains("loopback"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_macos_without_blackhole_fails_even_in_loopback_mode() {
        let catalog = FakeCatalog::with(&[("MacBook Pro Microphone", 1)]);
        let err = resolve(&config(AudioMode::SystemLoopback), Platform::MacOs, &catalog).unwrap_err();
        match err {
            ResolveError::DeviceNotFound(msg) => assert!(msg.contains("'default'")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_linux_loopback_falls_back_to_default_input() {
        let catalog = FakeCatalog::with(&[("default", 2), ("pulse", 32)]);
        let source = resolve(&config(AudioMode::SystemLoopback), Platform::Linux, &catalog).unwrap();
        assert_eq!(source.strategy, CaptureStrategy::DefaultInput);
        assert_eq!(source.effective_channels, 2);
    }

    #[test]
    fn test_default_mode_skips_cable_search() {
        let catalog = FakeCatalog::with(&[("Mic", 1), ("CABLE Output", 2)]);
        let source = resolve(&config(AudioMode::DefaultInput), Platform::Windows, &catalog).unwrap();
        assert_eq!(source.strategy, CaptureStrategy::DefaultInput);
        assert_eq!(source.effective_channels, 1);
    }

    #[test]
    fn test_device_hint_replaces_markers() {
        let catalog = FakeCatalog::with(&[("CABLE Output", 2), ("Focusrite USB", 2)]);
        let mut cfg = config(AudioMode::NamedInputDevice);
        cfg.device_hint = Some("focusrite".to_string());
        let source = resolve(&cfg, Platform::Windows, &catalog).unwrap();
        assert_eq!(source.device.unwrap().name, "Focusrite USB");
        assert_eq!(source.label, "Focusrite USB");

        cfg.device_hint = Some("scarlett".to_string());
        assert!(matches!(
            resolve(&cfg, Platform::Windows, &catalog),
            Err(ResolveError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_no_default_input_is_not_found() {
        let catalog = FakeCatalog::with(&[]);
        let err = resolve(&config(AudioMode::DefaultInput), Platform::Linux, &catalog).unwrap_err();
        assert!(matches!(err, ResolveError::DeviceNotFound(_)));
    }

    #[test]
    fn test_effective_channels_bounds() {
        assert_eq!(effective_channels(2, 1), 1);
        assert_eq!(effective_channels(2, 8), 2);
        assert_eq!(effective_channels(1, 2), 1);
        assert_eq!(effective_channels(2, 0), 1);
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("loopback".parse::<AudioMode>().unwrap(), AudioMode::SystemLoopback);
        assert_eq!(" VBCable ".parse::<AudioMode>().unwrap(), AudioMode::NamedInputDevice);
        assert_eq!("default".parse::<AudioMode>().unwrap(), AudioMode::DefaultInput);
        assert!("wasapi".parse::<AudioMode>().is_err());
        assert_eq!(AudioMode::platform_default(Platform::Windows), AudioMode::SystemLoopback);
        assert_eq!(AudioMode::platform_default(Platform::MacOs), AudioMode::NamedInputDevice);
        assert_eq!(AudioMode::platform_default(Platform::Linux), AudioMode::SystemLoopback);
    }
}
