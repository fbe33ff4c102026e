//! External MP3 encoder (ffmpeg) driven over stdin/stdout pipes.
//!
//! One process per session: PCM goes in on stdin, MP3 frames come out on
//! stdout, stderr is discarded.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::audio::PcmFormat;
use crate::error::EncoderError;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Executable name looked up next to the binary and on `PATH`.
pub fn encoder_file_name() -> &'static str {
    if cfg!(windows) { "ffmpeg.exe" } else { "ffmpeg" }
}

/// Find the encoder executable.
///
/// Order: the configured path, the directory of the running executable, its
/// `bin/` subdirectory, then `PATH`. Falls back to the bare name so the spawn
/// error names the program.
pub fn locate_encoder(explicit: Option<&Path>) -> PathBuf {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));
    let path_var = std::env::var_os("PATH");
    locate_in(explicit, exe_dir.as_deref(), path_var.as_deref())
}

fn locate_in(explicit: Option<&Path>, exe_dir: Option<&Path>, path_var: Option<&OsStr>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }

    let name = encoder_file_name();
    let beside = exe_dir
        .into_iter()
        .flat_map(|dir| [dir.join(name), dir.join("bin").join(name)]);
    let on_path = path_var
        .into_iter()
        .flat_map(|paths| std::env::split_paths(paths))
        .map(|dir| dir.join(name));

    beside
        .chain(on_path)
        .find(|candidate| candidate.is_file())
        .unwrap_or_else(|| PathBuf::from(name))
}

/// Everything needed to start one encoder process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderSettings {
    pub program: PathBuf,
    pub format: PcmFormat,
    pub bitrate_kbps: u32,
}

impl EncoderSettings {
    /// Raw s16le in on stdin, constant-bitrate MP3 out on stdout.
    pub fn args(&self) -> Vec<String> {
        vec![
            "-f".into(),
            "s16le".into(),
            "-ar".into(),
            self.format.sample_rate.to_string(),
            "-ac".into(),
            self.format.channels.to_string(),
            "-i".into(),
            "pipe:0".into(),
            "-acodec".into(),
            "libmp3lame".into(),
            "-b:a".into(),
            format!("{}k", self.bitrate_kbps),
            "-f".into(),
            "mp3".into(),
            "pipe:1".into(),
        ]
    }
}

/// A running encoder owned by one session.
pub struct EncoderProcess {
    child: Child,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    terminated: bool,
}

impl EncoderProcess {
    pub fn start(settings: &EncoderSettings) -> Result<Self, EncoderError> {
        let mut command = Command::new(&settings.program);
        command
            .args(settings.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        #[cfg(windows)]
        command.creation_flags(CREATE_NO_WINDOW);

        let mut child = command.spawn().map_err(|source| EncoderError::Spawn {
            program: settings.program.display().to_string(),
            source,
        })?;

        let pid = child.id();
        log::debug!(
            "Encoder started: pid={:?}, {} Hz, {} ch, {} kbps",
            pid,
            settings.format.sample_rate,
            settings.format.channels,
            settings.bitrate_kbps
        );

        Ok(Self {
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            child,
            pid,
            terminated: false,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// PCM input pipe. Can be taken once.
    pub fn take_input(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// Encoded output pipe. Can be taken once.
    pub fn take_output(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Close the input, kill and reap. Kill errors are ignored: the process
    /// may already have exited. Returns `false` if already terminated.
    pub async fn terminate(&mut self) -> bool {
        if self.terminated {
            return false;
        }
        self.terminated = true;

        drop(self.stdin.take());
        if let Err(e) = self.child.start_kill() {
            log::debug!("Encoder kill ignored: {}", e);
        }
        match self.child.wait().await {
            Ok(status) => log::debug!("Encoder {:?} reaped: {}", self.pid, status),
            Err(e) => log::debug!("Encoder {:?} wait failed: {}", self.pid, e),
        }
        true
    }

    /// Synchronous kill for drop paths that cannot await.
    pub fn kill_now(&mut self) {
        if !self.terminated {
            self.terminated = true;
            drop(self.stdin.take());
            let _ = self.child.start_kill();
        }
    }
}

#[cfg(all(test, unix))]
pub(crate) mod testing {
    //! A stand-in encoder: records argv and PID, then copies stdin to stdout.

    use std::os::unix::fs::PermissionsExt;

    use super::*;

    pub struct FakeEncoder {
        dir: PathBuf,
        pub program: PathBuf,
    }

    impl FakeEncoder {
        pub fn new() -> Self {
            Self::with_body("exec cat")
        }

        /// Records argv and PID, then runs `body` as the rest of the script.
        pub fn with_body(body: &str) -> Self {
            let dir = std::env::temp_dir().join(format!("loopcast-enc-{}", uuid::Uuid::new_v4()));
            std::fs::create_dir_all(&dir).unwrap();
            let program = dir.join("fake-ffmpeg");
            let script = format!(
                "#!/bin/sh\necho \"$@\" > '{args}'\necho $$ >> '{pids}'\n{body}\n",
                args = dir.join("args").display(),
                pids = dir.join("pids").display(),
                body = body,
            );
            std::fs::write(&program, script).unwrap();
            std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();
            Self { dir, program }
        }

        pub fn settings(&self, format: PcmFormat, bitrate_kbps: u32) -> EncoderSettings {
            EncoderSettings {
                program: self.program.clone(),
                format,
                bitrate_kbps,
            }
        }

        /// Arguments of the last invocation.
        pub fn recorded_args(&self) -> Option<String> {
            std::fs::read_to_string(self.dir.join("args"))
                .ok()
                .map(|s| s.trim().to_string())
        }

        /// PIDs of every invocation.
        pub fn pids(&self) -> Vec<u32> {
            std::fs::read_to_string(self.dir.join("pids"))
                .unwrap_or_default()
                .lines()
                .filter_map(|line| line.trim().parse().ok())
                .collect()
        }
    }

    impl Drop for FakeEncoder {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    #[cfg(target_os = "linux")]
    pub fn process_alive(pid: u32) -> bool {
        Path::new(&format!("/proc/{}", pid)).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(program: &str) -> EncoderSettings {
        EncoderSettings {
            program: PathBuf::from(program),
            format: PcmFormat::new(44_100, 2),
            bitrate_kbps: 192,
        }
    }

    #[test]
    fn test_args_carry_format_and_bitrate() {
        let args = settings("ffmpeg").args().join(" ");
        assert_eq!(
            args,
            "-f s16le -ar 44100 -ac 2 -i pipe:0 -acodec libmp3lame -b:a 192k -f mp3 pipe:1"
        );

        let mono = EncoderSettings {
            format: PcmFormat::new(48_000, 1),
            bitrate_kbps: 128,
            ..settings("ffmpeg")
        };
        let args = mono.args();
        assert!(args.windows(2).any(|w| w == ["-ar", "48000"]));
        assert!(args.windows(2).any(|w| w == ["-ac", "1"]));
        assert!(args.windows(2).any(|w| w == ["-b:a", "128k"]));
    }

    #[test]
    fn test_explicit_path_wins() {
        let explicit = Path::new("/opt/tools/ffmpeg");
        assert_eq!(locate_in(Some(explicit), None, None), explicit);
    }

    #[test]
    fn test_falls_back_to_bare_name() {
        let empty = std::env::temp_dir().join(format!("loopcast-none-{}", uuid::Uuid::new_v4()));
        let found = locate_in(None, Some(&empty), Some(empty.as_os_str()));
        assert_eq!(found, PathBuf::from(encoder_file_name()));
    }

    #[test]
    fn test_finds_encoder_in_bin_dir() {
        let dir = std::env::temp_dir().join(format!("loopcast-exe-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(dir.join("bin")).unwrap();
        let bundled = dir.join("bin").join(encoder_file_name());
        std::fs::write(&bundled, b"").unwrap();

        assert_eq!(locate_in(None, Some(&dir), None), bundled);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let missing = format!("/nonexistent/{}/ffmpeg", uuid::Uuid::new_v4());
        let err = EncoderProcess::start(&settings(&missing)).err().unwrap();
        assert!(matches!(err, EncoderError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_encoder_echoes_and_records_args() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let fake = testing::FakeEncoder::new();
        let mut encoder = EncoderProcess::start(&fake.settings(PcmFormat::new(44_100, 2), 192)).unwrap();
        let mut input = encoder.take_input().unwrap();
        let mut output = encoder.take_output().unwrap();

        input.write_all(&[1, 2, 3, 4]).await.unwrap();
        drop(input);
        let mut echoed = Vec::new();
        output.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, vec![1, 2, 3, 4]);

        assert!(encoder.terminate().await);
        assert_eq!(
            fake.recorded_args().unwrap(),
            settings("ffmpeg").args().join(" ")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let fake = testing::FakeEncoder::new();
        let mut encoder = EncoderProcess::start(&fake.settings(PcmFormat::new(44_100, 2), 192)).unwrap();
        let pid = encoder.id().unwrap();

        assert!(encoder.terminate().await);
        assert!(!encoder.terminate().await);
        encoder.kill_now();

        #[cfg(target_os = "linux")]
        assert!(!testing::process_alive(pid));
        let _ = pid;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_after_exit_is_quiet() {
        let fake = testing::FakeEncoder::with_body("exit 0");
        let mut encoder = EncoderProcess::start(&fake.settings(PcmFormat::new(44_100, 2), 192)).unwrap();
        let mut output = encoder.take_output().unwrap();
        let mut rest = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut output, &mut rest).await.unwrap();

        assert!(encoder.terminate().await);
    }
}
