//! In-process stand-ins for the probe, pipeline and platform collaborators.

use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    counter::StreamCounter,
    pipeline::{EncodeOptions, PreparedStream, StreamOutput, StreamPipeline},
    platform::{Destination, Platform, VoiceLookup},
    probe::MediaProbe,
    process::{ControlSignal, PlaybackProcess},
    resolution::ProbedMedia,
    session::{SessionDescriptor, SessionKind, SessionSlot},
    AppState,
};

pub const GUILD: &str = "guild-1";
pub const VOICE: &str = "voice-1";
pub const IN_VOICE: &str = "user-in";
pub const NOT_IN_VOICE: &str = "user-out";

pub fn destination() -> Destination {
    Destination { guild_id: GUILD.into(), channel_id: VOICE.into(), stage: false }
}

pub fn descriptor(title: &str) -> SessionDescriptor {
    SessionDescriptor {
        kind: SessionKind::Play,
        title: title.into(),
        media_path: PathBuf::from(format!("/media/{title}.mkv")),
        destination: destination(),
        requested_by: IN_VOICE.into(),
    }
}

#[derive(Debug)]
pub struct FakeProcess {
    pid: u32,
    signals: Mutex<Vec<ControlSignal>>,
    exited: AtomicBool,
    terminated: CancellationToken,
}

impl FakeProcess {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            signals: Mutex::new(Vec::new()),
            exited: AtomicBool::new(false),
            terminated: CancellationToken::new(),
        }
    }

    pub fn signals(&self) -> Vec<ControlSignal> {
        self.signals.lock().unwrap().clone()
    }

    pub fn exit(&self) {
        self.exited.store(true, Ordering::SeqCst);
    }
}

impl PlaybackProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn signal(&self, signal: ControlSignal) -> io::Result<()> {
        if self.exited.load(Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(libc::ESRCH));
        }
        self.signals.lock().unwrap().push(signal);
        if signal == ControlSignal::Terminate {
            self.terminated.cancel();
        }
        Ok(())
    }
}

pub struct FakeProbe {
    pub media: Mutex<ProbedMedia>,
    pub fail: AtomicBool,
}

impl Default for FakeProbe {
    fn default() -> Self {
        Self {
            media: Mutex::new(ProbedMedia { fps: 24.0, width: 3840, height: 2160, duration_secs: Some(1500.0) }),
            fail: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl MediaProbe for FakeProbe {
    async fn probe(&self, path: &Path) -> anyhow::Result<ProbedMedia> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("cannot read {}", path.display());
        }
        Ok(*self.media.lock().unwrap())
    }
}

/// Streams "play" for `play_for` (or until terminated when `None`).
#[derive(Default)]
pub struct FakePipeline {
    pub play_for: Mutex<Option<Duration>>,
    pub fail_play: AtomicBool,
    /// Fail every prepare after this many successful ones.
    pub prepare_limit: Mutex<Option<usize>>,
    prepared: Mutex<Vec<(PathBuf, EncodeOptions)>>,
    processes: Mutex<Vec<Arc<FakeProcess>>>,
    next_pid: AtomicU32,
}

impl FakePipeline {
    pub fn prepared(&self) -> Vec<(PathBuf, EncodeOptions)> {
        self.prepared.lock().unwrap().clone()
    }

    pub fn processes(&self) -> Vec<Arc<FakeProcess>> {
        self.processes.lock().unwrap().clone()
    }
}

struct FakeOutput {
    process: Arc<FakeProcess>,
    play_for: Option<Duration>,
    fail: bool,
}

#[async_trait]
impl StreamOutput for FakeOutput {
    async fn deliver(self: Box<Self>, _destination: &Destination) -> anyhow::Result<()> {
        let played = async {
            match self.play_for {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = played => {}
            _ = self.process.terminated.cancelled() => {}
        }
        if self.fail {
            anyhow::bail!("transport dropped");
        }
        Ok(())
    }
}

#[async_trait]
impl StreamPipeline for FakePipeline {
    async fn prepare(&self, path: &Path, options: &EncodeOptions) -> anyhow::Result<PreparedStream> {
        let mut prepared = self.prepared.lock().unwrap();
        if let Some(limit) = *self.prepare_limit.lock().unwrap() {
            if prepared.len() >= limit {
                anyhow::bail!("encoder refused to start");
            }
        }
        prepared.push((path.to_path_buf(), options.clone()));
        drop(prepared);

        let pid = 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
        let process = Arc::new(FakeProcess::new(pid));
        self.processes.lock().unwrap().push(process.clone());
        Ok(PreparedStream {
            process: process.clone(),
            output: Box::new(FakeOutput {
                process,
                play_for: *self.play_for.lock().unwrap(),
                fail: self.fail_play.load(Ordering::SeqCst),
            }),
        })
    }
}

#[derive(Default)]
pub struct FakePlatform {
    pub presence: Mutex<HashMap<(String, String), VoiceLookup>>,
    pub fail_join: AtomicBool,
    pub fail_notify: AtomicBool,
    joins: Mutex<Vec<Destination>>,
    leaves: AtomicUsize,
    notes: Mutex<Vec<(String, String)>>,
}

impl FakePlatform {
    pub fn joins(&self) -> Vec<Destination> {
        self.joins.lock().unwrap().clone()
    }

    pub fn leaves(&self) -> usize {
        self.leaves.load(Ordering::SeqCst)
    }

    pub fn notes(&self) -> Vec<(String, String)> {
        self.notes.lock().unwrap().clone()
    }
}

#[async_trait]
impl Platform for FakePlatform {
    async fn voice_channel_of(&self, guild_id: &str, user_id: &str) -> anyhow::Result<VoiceLookup> {
        let presence = self.presence.lock().unwrap();
        Ok(presence
            .get(&(guild_id.to_string(), user_id.to_string()))
            .cloned()
            .unwrap_or(VoiceLookup::UnknownMember))
    }

    async fn join(&self, destination: &Destination) -> anyhow::Result<()> {
        if self.fail_join.load(Ordering::SeqCst) {
            anyhow::bail!("gateway unavailable");
        }
        self.joins.lock().unwrap().push(destination.clone());
        Ok(())
    }

    async fn leave(&self) -> anyhow::Result<()> {
        self.leaves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn notify(&self, channel_id: &str, text: &str) -> anyhow::Result<()> {
        if self.fail_notify.load(Ordering::SeqCst) {
            anyhow::bail!("channel {channel_id} not found");
        }
        self.notes.lock().unwrap().push((channel_id.to_string(), text.to_string()));
        Ok(())
    }
}

pub struct Harness {
    pub state: AppState,
    pub probe: Arc<FakeProbe>,
    pub pipeline: Arc<FakePipeline>,
    pub platform: Arc<FakePlatform>,
    pub counter_path: PathBuf,
    _dir: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let counter_path = dir.path().join("streamCount.txt");
        let config = Config {
            counter_path: counter_path.clone(),
            rest_interval: Duration::from_secs(15 * 60),
            collaborator_timeout: Duration::from_secs(5),
            log_channel_id: Some("log".into()),
            notify_channel_id: Some("notify".into()),
            ..Config::default()
        };

        let probe = Arc::new(FakeProbe::default());
        let pipeline = Arc::new(FakePipeline::default());
        let platform = Arc::new(FakePlatform::default());
        {
            let mut presence = platform.presence.lock().unwrap();
            presence.insert((GUILD.into(), IN_VOICE.into()), VoiceLookup::InChannel(destination()));
            presence.insert((GUILD.into(), NOT_IN_VOICE.into()), VoiceLookup::NotInVoice);
        }

        let state = AppState {
            version: "test".into(),
            counter: StreamCounter::new(&config.counter_path),
            config: Arc::new(config),
            sessions: Arc::new(SessionSlot::new()),
            platform: platform.clone(),
            pipeline: pipeline.clone(),
            probe: probe.clone(),
        };

        Self { state, probe, pipeline, platform, counter_path, _dir: dir }
    }
}
