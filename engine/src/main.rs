use std::sync::Arc;

// Watch-party engine (v0)
//
// A small control plane in front of a single playback session:
//   - HTTP endpoints a chat bot calls to start, pause, resume and stop media
//   - ffprobe/ffmpeg for probing and encoding
//   - one session at a time, either a single play or a scheduled repeat loop

use tracing::{info, warn};

mod api;
mod config;
mod counter;
mod error;
mod media;
mod pipeline;
mod platform;
mod playback;
mod probe;
mod process;
mod resolution;
mod scheduler;
mod session;
#[cfg(test)]
mod testing;

use crate::{
    config::Config,
    counter::StreamCounter,
    pipeline::{FfmpegPipeline, StreamPipeline},
    platform::{Platform, StaticPlatform},
    probe::{Ffprobe, MediaProbe},
    session::SessionSlot,
};

#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub config: Arc<Config>,

    // The one piece of shared mutable state: at most one session at a time.
    pub sessions: Arc<SessionSlot>,

    // Bumped once per scheduled burst and persisted across restarts.
    pub counter: StreamCounter,

    pub platform: Arc<dyn Platform>,
    pub pipeline: Arc<dyn StreamPipeline>,
    pub probe: Arc<dyn MediaProbe>,
}

impl AppState {
    /// Wire the production collaborators from `config`.
    fn from_config(config: Config) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            counter: StreamCounter::new(&config.counter_path),
            platform: Arc::new(StaticPlatform::new(config.directory.clone())),
            pipeline: Arc::new(FfmpegPipeline::new(config.ffmpeg.clone(), config.relay_addr)),
            probe: Arc::new(Ffprobe::new(config.ffprobe.clone())),
            sessions: Arc::new(SessionSlot::new()),
            config: Arc::new(config),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let config = Config::load()?;
    let addr = config.bind;
    info!(
        "rest interval {}, collaborator timeout {}",
        humantime::format_duration(config.rest_interval),
        humantime::format_duration(config.collaborator_timeout)
    );

    let state = AppState::from_config(config);
    info!("stream count so far: {} ({})", state.counter.current(), state.counter.path().display());
    let app = api::build_router(state.clone());

    // Bind loopback by default; the bot talks to us over localhost.
    info!("watch-party engine {} starting on http://{addr}", state.version);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Leave nothing running behind us.
    match playback::end_session(&state).await {
        Ok(true) => info!("active session stopped on shutdown"),
        Ok(false) => {}
        Err(e) => warn!("failed to stop session on shutdown: {e}"),
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("cannot install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }

    warn!("Shutdown signal received.");
}
