use std::collections::VecDeque;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::Stream;
use futures::StreamExt;
use serde::Deserialize;
use sysinfo::{Pid, System};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::metrics::FFMPEG_CPU_USAGE;

const STDERR_RING_LINES: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TuningMode {
    LowLatency,
    Smooth,
}

/// How a remux job treats the elementary streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RemuxMode {
    Copy,
    Transcode,
}

impl RemuxMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemuxMode::Copy => "copy",
            RemuxMode::Transcode => "transcode",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "copy" => Some(RemuxMode::Copy),
            "transcode" => Some(RemuxMode::Transcode),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TranscoderConfig {
    /// Program plus leading arguments, e.g. `["ffmpeg"]` or `["nice", "-n", "10", "ffmpeg"]`.
    pub command: Vec<String>,
    pub video_encoder: String,
    pub threads: u8,
    pub audio_bitrate: String,
    pub user_agent: Option<String>,
    /// Segment length in seconds for remux jobs.
    pub hls_time: u32,
    pub hls_list_size: u32,
    /// How long a single-shot process may take to write its first bytes.
    pub first_output_timeout_secs: u64,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            command: vec!["ffmpeg".to_string()],
            video_encoder: "libx264".to_string(),
            threads: 2,
            audio_bitrate: "128k".to_string(),
            user_agent: None,
            hls_time: 4,
            hls_list_size: 6,
            first_output_timeout_secs: 20,
        }
    }
}

impl TranscoderConfig {
    pub fn first_output_timeout(&self) -> Duration {
        Duration::from_secs(self.first_output_timeout_secs)
    }
}

/// A single-shot process that never got as far as writing output.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("ffmpeg produced no output within {0:?}")]
    Timeout(Duration),

    #[error("ffmpeg ended before producing output: {0}")]
    Ended(String),
}

/// The three ways ffmpeg gets invoked.
#[derive(Debug, Clone)]
pub enum Profile<'a> {
    /// Transport stream on stdin, deinterlaced transport stream on stdout.
    DeinterlacePipe,
    /// Reads the URL itself (with reconnects), transport stream on stdout.
    TranscodeUrl(&'a str),
    /// Continuous rolling HLS output into `dir`.
    Remux {
        url: &'a str,
        mode: RemuxMode,
        dir: &'a Path,
    },
}

pub fn playlist_path(dir: &Path) -> std::path::PathBuf {
    dir.join("index.m3u8")
}

#[derive(Debug, Clone)]
pub struct Transcoder {
    config: TranscoderConfig,
    mode: TuningMode,
}

impl Transcoder {
    pub fn new(config: TranscoderConfig, mode: TuningMode) -> Self {
        Self { config, mode }
    }

    pub fn config(&self) -> &TranscoderConfig {
        &self.config
    }

    pub fn build_args(&self, profile: &Profile<'_>) -> Vec<String> {
        let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "warning".into()];

        // Robustness: clean up input timestamps and drop garbage.
        args.extend(["-fflags".into(), "+genpts+discardcorrupt".into()]);

        match self.mode {
            TuningMode::LowLatency => args.extend([
                "-analyzeduration".into(), "2000000".into(),
                "-probesize".into(), "2000000".into(),
            ]),
            TuningMode::Smooth => args.extend([
                "-analyzeduration".into(), "10000000".into(),
                "-probesize".into(), "10000000".into(),
            ]),
        }

        match profile {
            Profile::DeinterlacePipe => {
                args.extend(["-i".into(), "pipe:0".into()]);
            }
            Profile::TranscodeUrl(url) | Profile::Remux { url, .. } => {
                self.push_network_input(&mut args, url);
            }
        }

        // Only audio and video. Provider streams often carry teletext/data
        // tracks that make ffmpeg abort when auto-mapped.
        args.extend([
            "-map".into(), "0:v:0?".into(),
            "-map".into(), "0:a:0?".into(),
            "-sn".into(),
            "-dn".into(),
        ]);

        match profile {
            Profile::DeinterlacePipe | Profile::TranscodeUrl(_) => {
                self.push_encode(&mut args);
                args.extend([
                    "-f".into(), "mpegts".into(),
                    "-mpegts_flags".into(), "+resend_headers".into(),
                    "pipe:1".into(),
                ]);
            }
            Profile::Remux { mode, dir, .. } => {
                match mode {
                    RemuxMode::Copy => args.extend(["-c".into(), "copy".into()]),
                    RemuxMode::Transcode => self.push_encode(&mut args),
                }
                let seg_pat = dir.join("seg_%05d.ts").to_string_lossy().to_string();
                // The playlist path must stay the final argument.
                args.extend([
                    "-f".into(), "hls".into(),
                    "-hls_time".into(), self.config.hls_time.to_string(),
                    "-hls_list_size".into(), self.config.hls_list_size.to_string(),
                    "-hls_flags".into(), "delete_segments+omit_endlist+independent_segments".into(),
                    "-hls_segment_filename".into(), seg_pat,
                    playlist_path(dir).to_string_lossy().to_string(),
                ]);
            }
        }

        args
    }

    fn push_network_input(&self, args: &mut Vec<String>, url: &str) {
        args.extend([
            "-reconnect".into(), "1".into(),
            "-reconnect_streamed".into(), "1".into(),
            "-reconnect_on_network_error".into(), "1".into(),
            "-reconnect_delay_max".into(), "5".into(),
        ]);
        if let Some(ua) = &self.config.user_agent {
            args.extend(["-user_agent".into(), ua.clone()]);
        }
        args.extend(["-i".into(), url.to_string()]);
    }

    fn push_encode(&self, args: &mut Vec<String>) {
        args.extend([
            "-vf".into(), "yadif".into(),
            "-pix_fmt".into(), "yuv420p".into(),
            "-c:v".into(), self.config.video_encoder.clone(),
            "-threads".into(), self.config.threads.to_string(),
            "-g".into(), "50".into(),
            "-sc_threshold".into(), "0".into(),
            "-c:a".into(), "aac".into(),
            "-ac".into(), "2".into(),
            "-b:a".into(), self.config.audio_bitrate.clone(),
        ]);
        match self.mode {
            TuningMode::LowLatency => args.extend([
                "-preset".into(), "veryfast".into(),
                "-tune".into(), "zerolatency".into(),
            ]),
            TuningMode::Smooth => args.extend(["-preset".into(), "medium".into()]),
        }
    }

    pub fn command(&self, args: &[String]) -> std::io::Result<Command> {
        let (program, prefix) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty ffmpeg command"))?;
        let mut cmd = Command::new(program);
        cmd.args(prefix)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }

    /// Spawns the deinterlacing filter and feeds it `upstream`. The returned
    /// stream owns the process; dropping it kills ffmpeg, which in turn ends
    /// the feeding task.
    pub fn spawn_deinterlace<S>(&self, upstream: S, label: &str) -> std::io::Result<ProcessStream>
    where
        S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + Unpin + 'static,
    {
        let args = self.build_args(&Profile::DeinterlacePipe);
        let mut cmd = self.command(&args)?;
        cmd.stdin(Stdio::piped());
        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("ffmpeg stdin unavailable"))?;
        info!("ffmpeg spawned (deinterlace): pid={:?} src={}", child.id(), label);
        tokio::spawn(feed_stdin(stdin, upstream, label.to_string()));
        ProcessStream::new(child, label)
    }

    pub fn spawn_transcode(&self, url: &str) -> std::io::Result<ProcessStream> {
        let args = self.build_args(&Profile::TranscodeUrl(url));
        let mut child = self.command(&args)?.stdin(Stdio::null()).spawn()?;
        info!("ffmpeg spawned (transcode): pid={:?} url={}", child.id(), url);
        // stdin is not used; make sure nothing waits on it.
        drop(child.stdin.take());
        ProcessStream::new(child, url)
    }

    pub fn spawn_remux(&self, url: &str, mode: RemuxMode, dir: &Path) -> std::io::Result<(Child, StderrRing)> {
        let args = self.build_args(&Profile::Remux { url, mode, dir });
        let mut child = self.command(&args)?.stdin(Stdio::null()).spawn()?;
        let ring = match child.stderr.take() {
            Some(stderr) => capture_stderr(stderr, url.to_string()).0,
            None => StderrRing::default(),
        };
        // Remux output goes to disk; discard anything on stdout.
        if let Some(mut stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let _ = tokio::io::copy(&mut stdout, &mut tokio::io::sink()).await;
            });
        }
        Ok((child, ring))
    }
}

async fn feed_stdin<S>(mut stdin: ChildStdin, mut upstream: S, label: String)
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
{
    let mut total: u64 = 0;
    while let Some(chunk) = upstream.next().await {
        match chunk {
            Ok(bytes) => {
                total += bytes.len() as u64;
                if stdin.write_all(&bytes).await.is_err() {
                    debug!("ffmpeg stdin closed: src={} fed_bytes={}", label, total);
                    return;
                }
            }
            Err(e) => {
                warn!("Upstream read failed while feeding ffmpeg: src={} err={}", label, e);
                break;
            }
        }
    }
    let _ = stdin.shutdown().await;
    debug!("Upstream finished: src={} fed_bytes={}", label, total);
}

/// Rolling buffer of the last stderr lines of one ffmpeg process.
#[derive(Clone, Default)]
pub struct StderrRing(Arc<Mutex<VecDeque<String>>>);

impl StderrRing {
    pub async fn dump(&self) -> String {
        self.0.lock().await.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    pub async fn tail(&self, lines: usize) -> String {
        let ring = self.0.lock().await;
        let skip = ring.len().saturating_sub(lines);
        ring.iter().skip(skip).cloned().collect::<Vec<_>>().join("\n")
    }
}

fn capture_stderr(stderr: tokio::process::ChildStderr, label: String) -> (StderrRing, JoinHandle<()>) {
    let ring = StderrRing::default();
    let ring_for_reader = ring.clone();
    let reader = tokio::spawn(async move {
        let mut reader = tokio::io::BufReader::new(stderr);
        let mut buffer = String::new();
        while let Ok(n) = reader.read_line(&mut buffer).await {
            if n == 0 {
                break;
            }
            let line = buffer.trim().to_string();
            {
                let mut ring = ring_for_reader.0.lock().await;
                if ring.len() >= STDERR_RING_LINES {
                    ring.pop_front();
                }
                ring.push_back(line.clone());
            }
            // Run with `RUST_LOG=zaptv::transcoder=debug` to see it.
            debug!("ffmpeg[{}]: {}", label, line);
            buffer.clear();
        }
    });
    (ring, reader)
}

/// Stdout of a single-shot ffmpeg process as a body stream. The child is
/// owned here so the process lives exactly as long as the response body.
pub struct ProcessStream {
    child: Child,
    inner: ReaderStream<ChildStdout>,
    label: String,
    stderr: StderrRing,
    stderr_reader: Option<JoinHandle<()>>,
}

impl ProcessStream {
    fn new(mut child: Child, label: &str) -> std::io::Result<Self> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("ffmpeg stdout unavailable"))?;
        let (stderr, stderr_reader) = match child.stderr.take() {
            Some(stderr) => {
                let (ring, reader) = capture_stderr(stderr, label.to_string());
                (ring, Some(reader))
            }
            None => (StderrRing::default(), None),
        };
        Ok(Self {
            child,
            inner: ReaderStream::with_capacity(stdout, 64 * 1024),
            label: label.to_string(),
            stderr,
            stderr_reader,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Waits for the first chunk on stdout and hands back a stream that
    /// starts with it. A process that exits, fails or stays silent past
    /// `timeout` is reported instead; dropping `self` then kills it.
    pub async fn first_output(
        mut self,
        timeout: Duration,
    ) -> Result<impl Stream<Item = std::io::Result<Bytes>> + Send + Unpin + 'static, StartupError> {
        let first = match tokio::time::timeout(timeout, self.next()).await {
            Ok(Some(Ok(chunk))) => chunk,
            Ok(Some(Err(e))) => return Err(StartupError::Ended(format!("stdout read failed: {e}"))),
            Ok(None) => return Err(StartupError::Ended(self.exit_report().await)),
            Err(_) => return Err(StartupError::Timeout(timeout)),
        };
        debug!("ffmpeg first output: src={} bytes={}", self.label, first.len());
        Ok(futures::stream::iter([Ok(first)]).chain(self))
    }

    async fn exit_report(&mut self) -> String {
        let status = match tokio::time::timeout(Duration::from_secs(2), self.child.wait()).await {
            Ok(Ok(status)) => status.to_string(),
            Ok(Err(e)) => format!("wait failed: {e}"),
            Err(_) => "stdout closed".to_string(),
        };
        // The reader ends at stderr EOF, shortly after exit.
        if let Some(reader) = self.stderr_reader.as_mut() {
            let _ = tokio::time::timeout(Duration::from_millis(500), reader).await;
        }
        let tail = self.stderr.tail(5).await;
        if tail.is_empty() {
            status
        } else {
            format!("{status}\n{tail}")
        }
    }
}

impl Stream for ProcessStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let res = Pin::new(&mut self.inner).poll_next(cx);
        if let Poll::Ready(None) = res {
            let ring = self.stderr.clone();
            let label = self.label.clone();
            tokio::spawn(async move {
                let tail = ring.dump().await;
                if !tail.is_empty() {
                    warn!("ffmpeg output ended: src={} last_stderr_lines=\n{}", label, tail);
                }
            });
        }
        res
    }
}

impl Drop for ProcessStream {
    fn drop(&mut self) {
        // kill_on_drop covers the process; start_kill makes it immediate.
        let _ = self.child.start_kill();
        info!("ffmpeg stopped (response closed): pid={:?} src={}", self.child.id(), self.label);
    }
}

/// Samples the CPU usage of `pid` every 5s until the process disappears.
pub fn spawn_cpu_monitor(pid: u32, job: String) {
    tokio::spawn(async move {
        let mut sys = System::new();
        let pid = Pid::from_u32(pid);
        loop {
            tokio::time::sleep(Duration::from_secs(5)).await;
            sys.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
            match sys.process(pid) {
                Some(process) => {
                    FFMPEG_CPU_USAGE
                        .with_label_values(&[job.as_str()])
                        .set(process.cpu_usage() as f64);
                }
                None => {
                    let _ = FFMPEG_CPU_USAGE.remove_label_values(&[job.as_str()]);
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcoder() -> Transcoder {
        Transcoder::new(TranscoderConfig::default(), TuningMode::LowLatency)
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_deinterlace_pipe_args() {
        let args = transcoder().build_args(&Profile::DeinterlacePipe);
        assert_eq!(value_after(&args, "-i"), Some("pipe:0"));
        assert_eq!(value_after(&args, "-vf"), Some("yadif"));
        assert_eq!(value_after(&args, "-f"), Some("mpegts"));
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
        assert!(!args.iter().any(|a| a == "-reconnect"));
    }

    #[test]
    fn test_transcode_url_args_reconnect() {
        let args = transcoder().build_args(&Profile::TranscodeUrl("http://x/live/u/p/1.m3u8"));
        assert_eq!(value_after(&args, "-reconnect"), Some("1"));
        assert_eq!(value_after(&args, "-i"), Some("http://x/live/u/p/1.m3u8"));
        assert_eq!(value_after(&args, "-c:v"), Some("libx264"));
        assert_eq!(value_after(&args, "-tune"), Some("zerolatency"));
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
    }

    #[test]
    fn test_remux_args() {
        let dir = Path::new("/tmp/zaptv-test/abc");
        let t = transcoder();
        let copy = t.build_args(&Profile::Remux { url: "http://x/1.ts", mode: RemuxMode::Copy, dir });
        assert_eq!(value_after(&copy, "-c"), Some("copy"));
        assert!(!copy.iter().any(|a| a == "yadif"));
        assert_eq!(value_after(&copy, "-hls_list_size"), Some("6"));
        assert!(value_after(&copy, "-hls_flags").unwrap().contains("delete_segments"));
        assert_eq!(copy.last().map(String::as_str), Some("/tmp/zaptv-test/abc/index.m3u8"));

        let enc = t.build_args(&Profile::Remux { url: "http://x/1.ts", mode: RemuxMode::Transcode, dir });
        assert_eq!(value_after(&enc, "-vf"), Some("yadif"));
        assert!(!enc.iter().any(|a| a == "copy"));
    }

    #[test]
    fn test_smooth_mode_preset() {
        let t = Transcoder::new(TranscoderConfig::default(), TuningMode::Smooth);
        let args = t.build_args(&Profile::DeinterlacePipe);
        assert_eq!(value_after(&args, "-preset"), Some("medium"));
        assert_eq!(value_after(&args, "-probesize"), Some("10000000"));
    }

    #[test]
    fn test_remux_mode_parse() {
        assert_eq!(RemuxMode::parse("copy"), Some(RemuxMode::Copy));
        assert_eq!(RemuxMode::parse(""), Some(RemuxMode::Copy));
        assert_eq!(RemuxMode::parse("Transcode"), Some(RemuxMode::Transcode));
        assert_eq!(RemuxMode::parse("bogus"), None);
    }

    #[test]
    fn test_empty_command_is_an_error() {
        let config = TranscoderConfig { command: Vec::new(), ..TranscoderConfig::default() };
        let t = Transcoder::new(config, TuningMode::LowLatency);
        assert!(t.command(&[]).is_err());
    }
}
