use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::audio::{AudioMode, CaptureConfig, PcmFormat, Platform};

const APP_QUALIFIER: &str = "com";
const APP_ORGANIZATION: &str = "loopcast";

/// 运行时配置文件路径的环境变量
pub const CONFIG_PATH_ENV: &str = "LOOPCAST_CONFIG";
/// 环境变量覆盖前缀，例如 LOOPCAST_PORT=9100
pub const ENV_PREFIX: &str = "LOOPCAST";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    // HTTP 服务配置
    pub port: u16,
    pub bind_address: String,
    pub stream_path: String,
    pub body_queue_depth: usize,

    // 音频采集配置
    pub sample_rate: u32,
    pub channels: u16,
    pub audio_mode: AudioMode,
    pub device_hint: Option<String>,
    pub capture_queue_depth: usize,

    // 编码器配置
    pub bitrate_kbps: u32,
    pub encoder_path: Option<PathBuf>,
}

/// Per-session parameters, derived once from `Config`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub format: PcmFormat,
    pub bitrate_kbps: u32,
    pub capture_queue_depth: usize,
    pub body_queue_depth: usize,
}

// 配置文件与环境变量的原始形式
#[derive(Debug, Deserialize)]
struct RawConfig {
    port: u16,
    bind_address: String,
    stream_path: String,
    body_queue_depth: usize,
    sample_rate: u32,
    channels: u16,
    #[serde(default)]
    audio_mode: String,
    #[serde(default)]
    device_hint: Option<String>,
    capture_queue_depth: usize,
    bitrate_kbps: u32,
    #[serde(default)]
    encoder_path: Option<PathBuf>,
}

fn parse_mode(mode: &str) -> Result<AudioMode, String> {
    if mode.trim().is_empty() {
        Ok(AudioMode::platform_default(Platform::current()))
    } else {
        mode.parse()
    }
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有默认值都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            port: env!("LOOPCAST_DEFAULT_PORT").parse()
                .map_err(|_| "Failed to parse LOOPCAST_DEFAULT_PORT")?,
            bind_address: env!("LOOPCAST_DEFAULT_BIND_ADDRESS").to_string(),
            stream_path: env!("LOOPCAST_DEFAULT_STREAM_PATH").to_string(),
            body_queue_depth: env!("LOOPCAST_DEFAULT_BODY_QUEUE_DEPTH").parse()
                .map_err(|_| "Failed to parse LOOPCAST_DEFAULT_BODY_QUEUE_DEPTH")?,

            sample_rate: env!("LOOPCAST_DEFAULT_SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse LOOPCAST_DEFAULT_SAMPLE_RATE")?,
            channels: env!("LOOPCAST_DEFAULT_CHANNELS").parse()
                .map_err(|_| "Failed to parse LOOPCAST_DEFAULT_CHANNELS")?,
            audio_mode: parse_mode(env!("LOOPCAST_DEFAULT_AUDIO_MODE"))
                .map_err(|_| "Failed to parse LOOPCAST_DEFAULT_AUDIO_MODE")?,
            device_hint: None,
            capture_queue_depth: env!("LOOPCAST_DEFAULT_CAPTURE_QUEUE_DEPTH").parse()
                .map_err(|_| "Failed to parse LOOPCAST_DEFAULT_CAPTURE_QUEUE_DEPTH")?,

            bitrate_kbps: env!("LOOPCAST_DEFAULT_BITRATE_KBPS").parse()
                .map_err(|_| "Failed to parse LOOPCAST_DEFAULT_BITRATE_KBPS")?,
            encoder_path: None,
        })
    }

    /// Compiled defaults, then the settings file, then `LOOPCAST_*` variables.
    ///
    /// The settings file is `$LOOPCAST_CONFIG` if set, otherwise
    /// `config.toml` / `config.json` in the user config directory. A missing
    /// file is not an error.
    pub fn load() -> Result<Self> {
        let path = match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Some(PathBuf::from(path)),
            None => Self::user_config_file(),
        };
        Self::load_from(path.as_deref(), true)
    }

    /// Layer an optional settings file (and optionally the environment) over
    /// the compiled defaults.
    pub fn load_from(path: Option<&Path>, with_env: bool) -> Result<Self> {
        let defaults = Self::new().map_err(anyhow::Error::msg)?;

        let mut builder = ::config::Config::builder()
            .set_default("port", defaults.port as i64)?
            .set_default("bind_address", defaults.bind_address.clone())?
            .set_default("stream_path", defaults.stream_path.clone())?
            .set_default("body_queue_depth", defaults.body_queue_depth as i64)?
            .set_default("sample_rate", defaults.sample_rate as i64)?
            .set_default("channels", defaults.channels as i64)?
            .set_default("audio_mode", defaults.audio_mode.to_string())?
            .set_default("capture_queue_depth", defaults.capture_queue_depth as i64)?
            .set_default("bitrate_kbps", defaults.bitrate_kbps as i64)?;

        if let Some(path) = path {
            log::debug!("Reading settings from {}", path.display());
            builder = builder.add_source(::config::File::from(path).required(false));
        }
        if with_env {
            builder = builder.add_source(
                ::config::Environment::with_prefix(ENV_PREFIX).try_parsing(true),
            );
        }

        let raw: RawConfig = builder
            .build()
            .context("Failed to read settings")?
            .try_deserialize()
            .context("Invalid settings")?;

        let audio_mode = parse_mode(&raw.audio_mode).map_err(anyhow::Error::msg)?;

        Ok(Self {
            port: raw.port,
            bind_address: raw.bind_address,
            stream_path: raw.stream_path,
            body_queue_depth: raw.body_queue_depth,
            sample_rate: raw.sample_rate,
            channels: raw.channels,
            audio_mode,
            device_hint: raw.device_hint.filter(|hint| !hint.trim().is_empty()),
            capture_queue_depth: raw.capture_queue_depth,
            bitrate_kbps: raw.bitrate_kbps,
            encoder_path: raw.encoder_path,
        })
    }

    /// First existing `config.toml` / `config.json` in the user config dir.
    fn user_config_file() -> Option<PathBuf> {
        let dirs = directories::ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, env!("APP_NAME"))?;
        ["config.toml", "config.json"]
            .iter()
            .map(|name| dirs.config_dir().join(name))
            .find(|path| path.exists())
    }

    pub fn validate(&self) -> Result<()> {
        if !matches!(self.channels, 1 | 2) {
            anyhow::bail!(
                "channels = {} is not supported, use 1 (mono) or 2 (stereo)",
                self.channels
            );
        }
        if self.sample_rate == 0 {
            anyhow::bail!("sample_rate must be greater than 0");
        }
        if self.bitrate_kbps == 0 {
            anyhow::bail!("bitrate_kbps must be greater than 0");
        }
        if !self.stream_path.starts_with('/') {
            anyhow::bail!("stream_path '{}' must start with '/'", self.stream_path);
        }
        if self.capture_queue_depth == 0 || self.body_queue_depth == 0 {
            anyhow::bail!("queue depths must be greater than 0");
        }
        Ok(())
    }

    pub fn pcm_format(&self) -> PcmFormat {
        PcmFormat::new(self.sample_rate, self.channels)
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            format: self.pcm_format(),
            mode: self.audio_mode,
            device_hint: self.device_hint.clone(),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            format: self.pcm_format(),
            bitrate_kbps: self.bitrate_kbps,
            capture_queue_depth: self.capture_queue_depth,
            body_queue_depth: self.body_queue_depth,
        }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address '{}'", self.bind_address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_settings(name: &str, contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("loopcast-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_compiled_defaults() {
        let config = Config::new().unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.stream_path, "/stream");
        assert_eq!(config.sample_rate, 44_100);
        assert_eq!(config.channels, 2);
        assert_eq!(config.bitrate_kbps, 192);
        assert_eq!(config.audio_mode, AudioMode::platform_default(Platform::current()));
        config.validate().unwrap();
    }

    #[test]
    fn test_settings_file_overrides_defaults() {
        let path = temp_settings(
            "config.toml",
            "port = 9100\naudio_mode = \"default\"\nchannels = 1\ndevice_hint = \"USB\"\n",
        );
        let config = Config::load_from(Some(&path), false).unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.audio_mode, AudioMode::DefaultInput);
        assert_eq!(config.channels, 1);
        assert_eq!(config.device_hint.as_deref(), Some("USB"));
        // untouched keys keep their defaults
        assert_eq!(config.bitrate_kbps, 192);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_missing_settings_file_is_not_an_error() {
        let path = std::env::temp_dir().join(format!("loopcast-missing-{}.toml", uuid::Uuid::new_v4()));
        let config = Config::load_from(Some(&path), false).unwrap();
        assert_eq!(config, Config::new().unwrap());
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        let path = temp_settings("config.toml", "audio_mode = \"wasapi\"\n");
        assert!(Config::load_from(Some(&path), false).is_err());
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let good = Config::new().unwrap();

        let mut surround = good.clone();
        surround.channels = 6;
        assert!(surround.validate().is_err());

        let mut no_rate = good.clone();
        no_rate.sample_rate = 0;
        assert!(no_rate.validate().is_err());

        let mut no_bitrate = good.clone();
        no_bitrate.bitrate_kbps = 0;
        assert!(no_bitrate.validate().is_err());

        let mut bad_path = good.clone();
        bad_path.stream_path = "stream".to_string();
        assert!(bad_path.validate().is_err());
    }

    #[test]
    fn test_session_config_is_derived() {
        let config = Config::new().unwrap();
        let session = config.session_config();
        assert_eq!(session.format, PcmFormat::new(44_100, 2));
        assert_eq!(session.bitrate_kbps, 192);
        assert_eq!(config.socket_addr().unwrap().port(), 9000);
    }
}
