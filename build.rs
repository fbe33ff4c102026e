use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    server: Server,
    audio: Audio,
    encoder: Encoder,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Server {
    port: u16,
    bind_address: String,
    stream_path: String,
    body_queue_depth: usize,
}

#[derive(Deserialize)]
struct Audio {
    sample_rate: u32,
    channels: u16,
    mode: String,
    capture_queue_depth: usize,
}

#[derive(Deserialize)]
struct Encoder {
    bitrate_kbps: u32,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // HTTP 服务配置
    println!("cargo:rustc-env=LOOPCAST_DEFAULT_PORT={}", config.server.port);
    println!("cargo:rustc-env=LOOPCAST_DEFAULT_BIND_ADDRESS={}", config.server.bind_address);
    println!("cargo:rustc-env=LOOPCAST_DEFAULT_STREAM_PATH={}", config.server.stream_path);
    println!("cargo:rustc-env=LOOPCAST_DEFAULT_BODY_QUEUE_DEPTH={}", config.server.body_queue_depth);

    // 音频采集配置
    println!("cargo:rustc-env=LOOPCAST_DEFAULT_SAMPLE_RATE={}", config.audio.sample_rate);
    println!("cargo:rustc-env=LOOPCAST_DEFAULT_CHANNELS={}", config.audio.channels);
    println!("cargo:rustc-env=LOOPCAST_DEFAULT_AUDIO_MODE={}", config.audio.mode);
    println!("cargo:rustc-env=LOOPCAST_DEFAULT_CAPTURE_QUEUE_DEPTH={}", config.audio.capture_queue_depth);

    // 编码器配置
    println!("cargo:rustc-env=LOOPCAST_DEFAULT_BITRATE_KBPS={}", config.encoder.bitrate_kbps);
}
