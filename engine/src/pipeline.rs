use std::{
    collections::VecDeque,
    net::SocketAddr,
    path::Path,
    sync::{Arc, Mutex},
};

use anyhow::Context;
use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    net::UdpSocket,
    process::{Child, ChildStderr, ChildStdout, Command},
};

use crate::{
    config::StreamOpts,
    platform::Destination,
    process::{ChildProcess, PidLease, PlaybackProcess},
    resolution::StreamParams,
};

/// Everything the encoder needs for one stream.
#[derive(Clone, Debug, PartialEq)]
pub struct EncodeOptions {
    pub params: StreamParams,
    pub bitrate_kbps: u32,
    pub max_bitrate_kbps: u32,
    pub hardware_acceleration: bool,
    pub video_codec: String,
}

impl EncodeOptions {
    pub fn new(params: StreamParams, opts: &StreamOpts) -> Self {
        Self {
            params,
            bitrate_kbps: opts.bitrate_kbps,
            max_bitrate_kbps: opts.max_bitrate_kbps,
            hardware_acceleration: opts.hardware_acceleration,
            video_codec: opts.video_codec.clone(),
        }
    }
}

/// The output side of a prepared stream. Consumed by a single `play`.
#[async_trait]
pub trait StreamOutput: Send {
    async fn deliver(self: Box<Self>, destination: &Destination) -> anyhow::Result<()>;
}

pub struct PreparedStream {
    pub process: Arc<dyn PlaybackProcess>,
    pub output: Box<dyn StreamOutput>,
}

/// Turns a file into a running encoder and pushes its output to a destination.
#[async_trait]
pub trait StreamPipeline: Send + Sync {
    async fn prepare(&self, path: &Path, options: &EncodeOptions) -> anyhow::Result<PreparedStream>;

    /// Resolves once the stream has been fully delivered (or failed).
    async fn play(&self, output: Box<dyn StreamOutput>, destination: &Destination) -> anyhow::Result<()> {
        output.deliver(destination).await
    }
}

// --- ffmpeg -------------------------------------------------------------------

const STDERR_TAIL: usize = 80;
// 7 TS packets per datagram keeps us under a 1500 byte MTU.
const DATAGRAM: usize = 188 * 7;

pub struct FfmpegPipeline {
    binary: String,
    relay: SocketAddr,
}

impl FfmpegPipeline {
    pub fn new(binary: impl Into<String>, relay: SocketAddr) -> Self {
        Self { binary: binary.into(), relay }
    }
}

fn video_encoder(codec: &str) -> anyhow::Result<&'static str> {
    match codec.to_ascii_uppercase().as_str() {
        "H264" => Ok("libx264"),
        "H265" | "HEVC" => Ok("libx265"),
        other => anyhow::bail!("unsupported video codec: {other}"),
    }
}

fn encoder_args(path: &Path, options: &EncodeOptions) -> anyhow::Result<Vec<String>> {
    let encoder = video_encoder(&options.video_codec)?;
    let p = &options.params;

    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into(), "-re".into()];
    if options.hardware_acceleration {
        args.extend(["-hwaccel".into(), "auto".into()]);
    }
    args.extend(["-i".into(), path.to_string_lossy().into_owned()]);
    args.extend([
        "-vf".into(),
        format!("scale={}:{}", p.width, p.height),
        "-r".into(),
        format!("{}", p.fps),
        "-c:v".into(),
        encoder.into(),
        "-b:v".into(),
        format!("{}k", options.bitrate_kbps),
        "-maxrate".into(),
        format!("{}k", options.max_bitrate_kbps),
        "-bufsize".into(),
        format!("{}k", options.max_bitrate_kbps.saturating_mul(2)),
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        "128k".into(),
        "-f".into(),
        "mpegts".into(),
        "pipe:1".into(),
    ]);
    Ok(args)
}

#[async_trait]
impl StreamPipeline for FfmpegPipeline {
    async fn prepare(&self, path: &Path, options: &EncodeOptions) -> anyhow::Result<PreparedStream> {
        let args = encoder_args(path, options)?;

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {}", self.binary))?;

        let pid = child.id().ok_or_else(|| anyhow::anyhow!("ffmpeg exited before it started"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow::anyhow!("ffmpeg stdout unavailable"))?;
        let stderr = child.stderr.take().ok_or_else(|| anyhow::anyhow!("ffmpeg stderr unavailable"))?;

        tracing::info!(pid, "encoder started: {}", path.display());

        let (process, lease) = ChildProcess::new(pid);
        Ok(PreparedStream {
            process: Arc::new(process),
            output: Box::new(FfmpegOutput::new(child, lease, stdout, stderr, self.relay)),
        })
    }
}

struct FfmpegOutput {
    // Declared before `child`: retired before kill_on_drop hands the pid to the reaper.
    lease: PidLease,
    child: Child,
    stdout: ChildStdout,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    stderr_task: tokio::task::JoinHandle<()>,
    relay: SocketAddr,
}

impl FfmpegOutput {
    fn new(child: Child, lease: PidLease, stdout: ChildStdout, stderr: ChildStderr, relay: SocketAddr) -> Self {
        // Keep the stderr tail so a failed run can explain itself.
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL)));
        let tail = stderr_tail.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                if let Ok(mut t) = tail.lock() {
                    push_stderr_tail(&mut t, line);
                }
            }
        });
        Self { lease, child, stdout, stderr_tail, stderr_task, relay }
    }
}

fn push_stderr_tail(tail: &mut VecDeque<String>, line: String) {
    if tail.len() >= STDERR_TAIL {
        tail.pop_front();
    }
    tail.push_back(line);
}

fn last_stderr_summary(tail: &VecDeque<String>) -> Option<String> {
    // Skip the noise ffmpeg prints after the interesting line.
    tail.iter()
        .rev()
        .map(|l| l.trim())
        .find(|l| {
            let lc = l.to_ascii_lowercase();
            !l.is_empty() && !lc.contains("broken pipe") && !lc.contains("conversion failed")
        })
        .or_else(|| tail.back().map(|l| l.trim()))
        .filter(|l| !l.is_empty())
        .map(str::to_string)
}

/// Forward encoder output to the relay until EOF. Returns the bytes sent.
async fn pump(stdout: &mut ChildStdout, relay: SocketAddr) -> anyhow::Result<u64> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await.context("binding relay socket")?;
    let mut buf = vec![0u8; DATAGRAM];
    let mut sent: u64 = 0;
    loop {
        let n = stdout.read(&mut buf).await.context("reading encoder output")?;
        if n == 0 {
            return Ok(sent);
        }
        socket.send_to(&buf[..n], relay).await.context("sending to relay")?;
        sent += n as u64;
    }
}

#[async_trait]
impl StreamOutput for FfmpegOutput {
    async fn deliver(self: Box<Self>, destination: &Destination) -> anyhow::Result<()> {
        let this = *self;
        let mut child = this.child;
        // Bound after `child` so a cancelled delivery drops the lease first.
        let lease = this.lease;
        let FfmpegOutput { mut stdout, stderr_tail, stderr_task, relay, .. } = this;

        tracing::info!(
            "streaming to {}/{} via {relay}",
            destination.guild_id,
            destination.channel_id
        );
        let pumped = pump(&mut stdout, relay).await;

        // Nothing may signal the pid once it can be reaped.
        lease.retire();
        let sent = match pumped {
            Ok(sent) => sent,
            Err(e) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(e);
            }
        };

        let status = child.wait().await.context("waiting for encoder")?;
        // Let the reader drain the last lines before we look at them.
        let _ = stderr_task.await;
        tracing::info!("encoder finished ({status}), {sent} bytes relayed");

        if status.success() {
            return Ok(());
        }
        let summary = stderr_tail.lock().ok().and_then(|t| last_stderr_summary(&t));
        match summary {
            Some(line) => anyhow::bail!("ffmpeg exited with {status}: {line}"),
            None => anyhow::bail!("ffmpeg exited with {status}"),
        }
    }
}
