use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::command::ConversionCommand;
use crate::config::ConverterConfig;
use crate::engine::{EngineBackend, EventSink, ExitOutcome};
use crate::staging::{StagedRole, StagingStore};

/// Oldest major version with `-progress` `out_time_us` reporting
const MIN_MAJOR_VERSION: u32 = 4;

/// Flags prepended to every invocation so progress can be machine-read
const ENGINE_FLAGS: &[&str] = &["-hide_banner", "-nostdin", "-nostats", "-progress", "pipe:1"];

/// FFmpeg version information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FfmpegVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FfmpegVersion {
    pub fn meets_requirement(&self) -> bool {
        self.major >= MIN_MAJOR_VERSION
    }

    /// Parse version from the first line of `ffmpeg -version`
    ///
    /// Handles distro suffixes ("6.1.1-3ubuntu5") and tag builds ("n7.0").
    pub fn parse(version_str: &str) -> Result<Self> {
        let version_part = version_str
            .split_whitespace()
            .skip_while(|s| *s != "version")
            .nth(1)
            .ok_or_else(|| anyhow!("No version number found in: {}", version_str))?;
        let version_part = version_part.strip_prefix('n').unwrap_or(version_part);

        let mut parts = version_part.split('.').map(leading_number);

        let major = parts
            .next()
            .flatten()
            .ok_or_else(|| anyhow!("Invalid version format: {}", version_str))?;
        let minor = parts.next().flatten().unwrap_or(0);
        let patch = parts.next().flatten().unwrap_or(0);

        Ok(FfmpegVersion { major, minor, patch })
    }
}

fn leading_number(s: &str) -> Option<u32> {
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Engine backend driving a system ffmpeg binary
///
/// Each invocation gets a private temp directory: the staged input is written
/// there, ffmpeg runs with that directory as its working directory, and any
/// output file is moved back into the staging store before the directory is
/// removed.
pub struct FfmpegBackend {
    ffmpeg_bin: PathBuf,
    work_dir: Option<PathBuf>,
    required_encoders: Vec<String>,
}

impl FfmpegBackend {
    pub fn new(config: &ConverterConfig) -> Self {
        Self {
            ffmpeg_bin: config.ffmpeg_bin.clone(),
            work_dir: config.work_dir.clone(),
            required_encoders: vec![
                config.transcode.video_codec.clone(),
                config.transcode.audio_codec.clone(),
            ],
        }
    }

    /// Detect FFmpeg version; `None` when the banner carries no parseable number
    async fn detect_version(ffmpeg_bin: &Path) -> Result<Option<FfmpegVersion>> {
        let output = Command::new(ffmpeg_bin)
            .arg("-version")
            .output()
            .await
            .with_context(|| format!("Failed to execute FFmpeg at: {}", ffmpeg_bin.display()))?;

        if !output.status.success() {
            return Err(anyhow!("FFmpeg version check failed"));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let first_line = stdout
            .lines()
            .next()
            .ok_or_else(|| anyhow!("Empty output from FFmpeg -version"))?;

        match FfmpegVersion::parse(first_line) {
            Ok(version) => Ok(Some(version)),
            Err(e) => {
                // Snapshot builds report a git hash instead of a version
                warn!("Could not determine FFmpeg version, continuing: {}", e);
                Ok(None)
            }
        }
    }

    /// Names from `wanted` that `ffmpeg -encoders` lists
    async fn detect_encoders(ffmpeg_bin: &Path, wanted: &[String]) -> Result<Vec<String>> {
        let output = Command::new(ffmpeg_bin)
            .arg("-hide_banner")
            .arg("-encoders")
            .output()
            .await
            .with_context(|| format!("Failed to query FFmpeg encoders at: {}", ffmpeg_bin.display()))?;

        if !output.status.success() {
            return Err(anyhow!("FFmpeg encoder query failed"));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_encoder_list(&stdout, wanted))
    }

    fn make_work_dir(&self) -> Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("mkv2mp4-");
        match &self.work_dir {
            Some(root) => builder
                .tempdir_in(root)
                .with_context(|| format!("Failed to create work dir in: {}", root.display())),
            None => builder.tempdir().context("Failed to create work dir"),
        }
    }
}

/// Pick the wanted encoder names out of `ffmpeg -encoders` output
///
/// Encoder rows look like ` V....D libx264    libx264 H.264 / AVC ...`.
fn parse_encoder_list(listing: &str, wanted: &[String]) -> Vec<String> {
    let available: Vec<&str> = listing
        .lines()
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let flags = cols.next()?;
            let name = cols.next()?;
            (flags.len() == 6 && flags != "------").then_some(name)
        })
        .collect();

    wanted
        .iter()
        .filter(|w| available.contains(&w.as_str()))
        .cloned()
        .collect()
}

#[async_trait]
impl EngineBackend for FfmpegBackend {
    async fn load(&self) -> Result<()> {
        match Self::detect_version(&self.ffmpeg_bin).await? {
            Some(version) if !version.meets_requirement() => {
                return Err(anyhow!(
                    "FFmpeg version {}.{}.{} does not meet requirement (>= {}.0)",
                    version.major,
                    version.minor,
                    version.patch,
                    MIN_MAJOR_VERSION
                ));
            }
            Some(version) => {
                info!(
                    "FFmpeg {}.{}.{} found at {}",
                    version.major,
                    version.minor,
                    version.patch,
                    self.ffmpeg_bin.display()
                );
            }
            None => {}
        }

        let found = Self::detect_encoders(&self.ffmpeg_bin, &self.required_encoders).await?;
        let missing: Vec<&String> = self
            .required_encoders
            .iter()
            .filter(|e| !found.contains(e))
            .collect();

        if !missing.is_empty() {
            return Err(anyhow!(
                "Required encoders not available in {}: {:?}",
                self.ffmpeg_bin.display(),
                missing
            ));
        }

        info!("Encoders available: {}", found.join(", "));
        Ok(())
    }

    async fn run(
        &self,
        command: &ConversionCommand,
        store: &StagingStore,
        events: &EventSink,
    ) -> Result<ExitOutcome> {
        let dir = self.make_work_dir()?;

        let input = store.get(command.input())?;
        tokio::fs::write(dir.path().join(command.input()), &input)
            .await
            .with_context(|| format!("Failed to materialize staged input: {}", command.input()))?;

        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.current_dir(dir.path())
            .args(ENGINE_FLAGS)
            .args(command.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!("Executing FFmpeg: {} {} {}", self.ffmpeg_bin.display(), ENGINE_FLAGS.join(" "), command);

        let mut child = cmd.spawn().with_context(|| {
            format!(
                "Failed to spawn FFmpeg process at: {}. Ensure FFmpeg is installed and accessible.",
                self.ffmpeg_bin.display()
            )
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Failed to capture FFmpeg stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("Failed to capture FFmpeg stderr"))?;

        let mut progress_reader = BufReader::new(stdout);
        let mut log_reader = BufReader::new(stderr);
        let (mut progress_buf, mut log_buf) = (Vec::new(), Vec::new());
        let mut tracker = ProgressTracker::default();
        let (mut progress_open, mut log_open) = (true, true);

        // Both pipes are drained to EOF; ffmpeg blocks once either one fills up
        while progress_open || log_open {
            tokio::select! {
                line = next_lossy_line(&mut progress_reader, &mut progress_buf), if progress_open => match line {
                    Ok(Some(line)) => {
                        if let Some(ratio) = tracker.observe_progress(&line) {
                            events.progress(ratio);
                        }
                    }
                    Ok(None) => progress_open = false,
                    Err(e) => {
                        warn!("Failed to read FFmpeg progress, stopping process: {}", e);
                        progress_open = false;
                        let _ = child.start_kill();
                    }
                },
                line = next_lossy_line(&mut log_reader, &mut log_buf), if log_open => match line {
                    Ok(Some(line)) => {
                        tracker.observe_log(&line);
                        events.log(line);
                    }
                    Ok(None) => log_open = false,
                    Err(e) => {
                        warn!("Failed to read FFmpeg log, stopping process: {}", e);
                        log_open = false;
                        let _ = child.start_kill();
                    }
                },
            }
        }

        let status = child.wait().await.context("Failed to wait for FFmpeg process")?;

        if let Some(output) = command.output() {
            let path = dir.path().join(output);
            if path.exists() {
                let bytes = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("Failed to read FFmpeg output: {}", output))?;
                store.put(output, bytes, StagedRole::Output);
            }
        }

        Ok(ExitOutcome { code: status.code() })
    }
}

/// Read one line, replacing invalid UTF-8; `None` at EOF.
///
/// Partial reads stay in `buf` when a `select!` drops this future, so the
/// next call picks the line up where it stopped.
async fn next_lossy_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    reader.read_until(b'\n', buf).await?;
    if buf.is_empty() {
        return Ok(None);
    }
    let line = String::from_utf8_lossy(buf)
        .trim_end_matches(|c: char| c == '\n' || c == '\r')
        .to_string();
    buf.clear();
    Ok(Some(line))
}

/// Derives completion ratios from ffmpeg's log and `-progress` output
#[derive(Debug, Default)]
struct ProgressTracker {
    duration_secs: Option<f64>,
}

impl ProgressTracker {
    /// Pick up the input duration from `  Duration: 00:01:02.50, start: ...`
    fn observe_log(&mut self, line: &str) {
        if self.duration_secs.is_some() {
            return;
        }
        let Some(rest) = line.trim_start().strip_prefix("Duration:") else {
            return;
        };
        let stamp = rest.split(',').next().unwrap_or("").trim();
        self.duration_secs = parse_timestamp(stamp).filter(|d| *d > 0.0);
    }

    /// Turn one `key=value` progress line into a ratio, if it carries one
    fn observe_progress(&mut self, line: &str) -> Option<f64> {
        let (key, value) = line.trim().split_once('=')?;
        match key {
            "progress" if value == "end" => Some(1.0),
            // out_time_ms is microseconds too, kept for older builds
            "out_time_us" | "out_time_ms" => {
                let micros: f64 = value.parse().ok()?;
                let duration = self.duration_secs?;
                Some(micros / 1_000_000.0 / duration)
            }
            _ => None,
        }
    }
}

/// Parse `HH:MM:SS.xx` or plain seconds
fn parse_timestamp(s: &str) -> Option<f64> {
    if s.contains(':') {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() == 3 {
            let hours: f64 = parts[0].parse().ok()?;
            let minutes: f64 = parts[1].parse().ok()?;
            let seconds: f64 = parts[2].parse().ok()?;
            return Some(hours * 3600.0 + minutes * 60.0 + seconds);
        }
        return None;
    }

    s.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parsing() {
        let v1 = FfmpegVersion::parse("ffmpeg version 8.0 Copyright (c) 2000-2025").unwrap();
        assert_eq!(v1, FfmpegVersion { major: 8, minor: 0, patch: 0 });

        let v2 = FfmpegVersion::parse("ffmpeg version 6.1.1-3ubuntu5 Copyright (c) 2000-2023").unwrap();
        assert_eq!(v2, FfmpegVersion { major: 6, minor: 1, patch: 1 });

        let v3 = FfmpegVersion::parse("ffmpeg version n7.0.2 Copyright").unwrap();
        assert_eq!(v3.major, 7);
        assert_eq!(v3.patch, 2);

        assert!(FfmpegVersion::parse("ffmpeg version N-112345-gabcdef").is_err());
        assert!(FfmpegVersion::parse("not ffmpeg at all").is_err());
    }

    #[test]
    fn test_version_requirement() {
        assert!(FfmpegVersion { major: 4, minor: 4, patch: 0 }.meets_requirement());
        assert!(FfmpegVersion { major: 7, minor: 1, patch: 0 }.meets_requirement());
        assert!(!FfmpegVersion { major: 3, minor: 4, patch: 8 }.meets_requirement());
    }

    #[test]
    fn test_encoder_listing() {
        let listing = "Encoders:\n \
            V..... = Video\n \
            ------\n \
            V....D libx264              libx264 H.264 / AVC / MPEG-4 AVC (codec h264)\n \
            A....D aac                  AAC (Advanced Audio Coding)\n \
            A....D libopus              libopus Opus (codec opus)\n";
        let wanted = vec!["libx264".to_string(), "aac".to_string(), "libsvtav1".to_string()];
        assert_eq!(parse_encoder_list(listing, &wanted), vec!["libx264".to_string(), "aac".to_string()]);
    }

    #[test]
    fn test_timestamp_parsing() {
        assert_eq!(parse_timestamp("01:30:45.500"), Some(5445.5));
        assert_eq!(parse_timestamp("00:00:10.00"), Some(10.0));
        assert_eq!(parse_timestamp("123.5"), Some(123.5));
        assert_eq!(parse_timestamp("N/A"), None);
        assert_eq!(parse_timestamp("00:10"), None);
    }

    #[test]
    fn test_progress_needs_duration() {
        let mut tracker = ProgressTracker::default();
        assert_eq!(tracker.observe_progress("out_time_us=5000000"), None);

        tracker.observe_log("  Duration: 00:00:10.00, start: 0.000000, bitrate: 5000 kb/s");
        assert_eq!(tracker.observe_progress("out_time_us=5000000"), Some(0.5));
        assert_eq!(tracker.observe_progress("out_time_ms=2500000"), Some(0.25));
        assert_eq!(tracker.observe_progress("out_time_us=N/A"), None);
        assert_eq!(tracker.observe_progress("frame=42"), None);
        assert_eq!(tracker.observe_progress("progress=continue"), None);
        assert_eq!(tracker.observe_progress("progress=end"), Some(1.0));
    }

    #[test]
    fn test_first_duration_wins() {
        let mut tracker = ProgressTracker::default();
        tracker.observe_log("  Duration: N/A, bitrate: N/A");
        tracker.observe_log("  Duration: 00:00:20.00, start: 0.000000");
        tracker.observe_log("  Duration: 00:00:40.00, start: 0.000000");
        assert_eq!(tracker.duration_secs, Some(20.0));
    }

    #[cfg(unix)]
    mod process {
        use super::super::*;
        use crate::command::CommandBuilder;
        use crate::engine::{EngineEvent, EventStream};
        use std::os::unix::fs::PermissionsExt;
        use std::time::Duration;

        /// Install a shell script standing in for the ffmpeg binary
        fn fake_ffmpeg(dir: &Path, body: &str) -> FfmpegBackend {
            let path = dir.join("ffmpeg");
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

            let config = ConverterConfig {
                ffmpeg_bin: path,
                work_dir: Some(dir.to_path_buf()),
                ..Default::default()
            };
            FfmpegBackend::new(&config)
        }

        fn drain(stream: &mut EventStream) -> Vec<EngineEvent> {
            let mut events = Vec::new();
            while let Ok(event) = stream.try_recv() {
                events.push(event);
            }
            events
        }

        const CAPABILITIES: &str = r#"case "$1" in
  -version) echo "ffmpeg version VERSION Copyright (c) 2000-2024 the FFmpeg developers" ;;
  -hide_banner) printf 'Encoders:\n ------\n V....D libx264 libx264 H.264\n ENCODER\n' ;;
esac"#;

        fn capabilities(version: &str, extra_encoder: &str) -> String {
            CAPABILITIES
                .replace("VERSION", version)
                .replace("ENCODER", extra_encoder)
        }

        /// Copies the `-i` input to the last argument, logging and reporting progress
        const TRANSCODER: &str = r#"printf 'title: \377\376 bad\n' >&2
echo "  Duration: 00:00:10.00, start: 0.000000" >&2
i=0
while [ $i -lt 3000 ]; do
  echo "[libx264 @ 0x1] frame $i filler filler filler filler filler filler" >&2
  i=$((i+1))
done
while [ $# -gt 0 ]; do
  case "$1" in -i) shift; input="$1" ;; esac
  last="$1"
  shift
done
echo "out_time_us=10000000"
echo "progress=end"
cat "$input" > "$last" || exit 1
exit 0"#;

        #[tokio::test]
        async fn test_load_accepts_capable_build() {
            let dir = tempfile::tempdir().unwrap();
            let backend = fake_ffmpeg(dir.path(), &capabilities("6.1.1", "A....D aac AAC"));
            backend.load().await.unwrap();
        }

        #[tokio::test]
        async fn test_load_rejects_old_version() {
            let dir = tempfile::tempdir().unwrap();
            let backend = fake_ffmpeg(dir.path(), &capabilities("3.4.8", "A....D aac AAC"));
            let err = backend.load().await.unwrap_err();
            assert!(err.to_string().contains("does not meet requirement"));
        }

        #[tokio::test]
        async fn test_load_rejects_missing_encoder() {
            let dir = tempfile::tempdir().unwrap();
            let backend = fake_ffmpeg(dir.path(), &capabilities("7.0", "A....D libopus Opus"));
            let err = backend.load().await.unwrap_err();
            assert!(err.to_string().contains("aac"));
        }

        #[tokio::test]
        async fn test_load_fails_without_binary() {
            let dir = tempfile::tempdir().unwrap();
            let config = ConverterConfig {
                ffmpeg_bin: dir.path().join("no-such-ffmpeg"),
                ..Default::default()
            };
            assert!(FfmpegBackend::new(&config).load().await.is_err());
        }

        #[tokio::test]
        async fn test_run_relays_events_and_collects_output() {
            let dir = tempfile::tempdir().unwrap();
            let backend = fake_ffmpeg(dir.path(), TRANSCODER);
            let store = StagingStore::new();
            store.put("movie.mkv", b"matroska bytes".to_vec(), StagedRole::Input);
            let sink = EventSink::default();
            let mut events = sink.subscribe();

            let cmd = CommandBuilder::default().build_transcode("movie.mkv", "movie.mp4");
            // Invalid UTF-8 and a stderr volume larger than a pipe buffer must not stall the run
            let outcome = tokio::time::timeout(Duration::from_secs(30), backend.run(&cmd, &store, &sink))
                .await
                .expect("ffmpeg run stalled")
                .unwrap();

            assert!(outcome.success());
            assert_eq!(store.get("movie.mp4").unwrap().as_ref(), b"matroska bytes");

            let events = drain(&mut events);
            let logs: Vec<&String> = events
                .iter()
                .filter_map(|e| match e {
                    EngineEvent::Log(line) => Some(line),
                    EngineEvent::Progress(_) => None,
                })
                .collect();
            assert_eq!(logs.len(), 3002);
            assert!(logs[0].starts_with("title: \u{FFFD}\u{FFFD} bad"));
            assert!(logs.iter().all(|l| !l.ends_with('\n')));
            assert!(events.contains(&EngineEvent::Progress(1.0)));

            // Work dir is removed once the run returns
            let leftovers = std::fs::read_dir(dir.path())
                .unwrap()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().starts_with("mkv2mp4-"))
                .count();
            assert_eq!(leftovers, 0);
        }

        #[tokio::test]
        async fn test_run_reports_failed_exit() {
            let dir = tempfile::tempdir().unwrap();
            let backend = fake_ffmpeg(
                dir.path(),
                "echo 'At least one output file must be specified' >&2\nexit 1",
            );
            let store = StagingStore::new();
            store.put("movie.mkv", b"matroska bytes".to_vec(), StagedRole::Input);
            let sink = EventSink::default();
            let mut events = sink.subscribe();

            let cmd = CommandBuilder::default().build_probe("movie.mkv");
            let outcome = backend.run(&cmd, &store, &sink).await.unwrap();

            assert_eq!(outcome.code, Some(1));
            assert!(!outcome.success());
            assert_eq!(
                drain(&mut events),
                vec![EngineEvent::Log("At least one output file must be specified".to_string())]
            );
            assert_eq!(store.names(), vec!["movie.mkv".to_string()]);
        }

        #[tokio::test]
        async fn test_run_requires_staged_input() {
            let dir = tempfile::tempdir().unwrap();
            let backend = fake_ffmpeg(dir.path(), "exit 0");
            let cmd = CommandBuilder::default().build_probe("ghost.mkv");
            assert!(backend
                .run(&cmd, &StagingStore::new(), &EventSink::default())
                .await
                .is_err());
        }
    }
}
