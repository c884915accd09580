use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    error::{bounded, SessionError},
    pipeline::{EncodeOptions, PreparedStream},
    platform::Destination,
    process::{self, PlaybackProcess},
    resolution::{effective_params, ProbedMedia, StreamParams},
    session::{SessionDescriptor, SessionKind, SessionTicket},
    AppState,
};

// --- Session lifecycle ------------------------------------------------------------
//
// Setup (acquire -> join -> probe -> prepare) runs inside the HTTP handler so
// failures can still be reported to the caller. Playback itself runs in a
// detached task that owns the session until it releases it.
//
// Ownership after a /stop: the handler releases the record, cancels the
// session token, terminates the live process and leaves voice. A detached task
// that observes its token cancelled therefore only cleans up its own process;
// it must not leave voice or release, because by then the slot may already
// belong to the next session.

/// A session that made it through setup and holds its first stream.
pub struct OpenedSession {
    pub ticket: SessionTicket,
    pub destination: Destination,
    pub probed: ProbedMedia,
    pub params: StreamParams,
    pub stream: PreparedStream,
}

pub async fn open_session(
    state: &AppState,
    descriptor: SessionDescriptor,
    first: &Path,
) -> Result<OpenedSession, SessionError> {
    let destination = descriptor.destination.clone();
    let ticket = state.sessions.try_acquire(descriptor).await?;

    let joined = bounded(
        "join voice channel",
        state.config.collaborator_timeout,
        state.platform.join(&destination),
    )
    .await;

    let opened = match joined {
        Ok(()) => open_stream(state, &ticket, first).await,
        Err(e) => Err(e),
    };

    match opened {
        Ok((probed, params, stream)) => Ok(OpenedSession {
            ticket,
            destination,
            probed,
            params,
            stream,
        }),
        Err(e) => {
            tracing::warn!(session = %ticket.id, "session setup failed: {e}");
            close_session(state, &ticket).await;
            Err(e)
        }
    }
}

/// Probe `path`, derive encode settings, start the encoder and hand its
/// process to the session record.
pub async fn open_stream(
    state: &AppState,
    ticket: &SessionTicket,
    path: &Path,
) -> Result<(ProbedMedia, StreamParams, PreparedStream), SessionError> {
    let limit = state.config.collaborator_timeout;

    let probed = bounded("probe media", limit, state.probe.probe(path)).await?;
    let params = effective_params(&probed, &state.config.stream);
    let options = EncodeOptions::new(params, &state.config.stream);
    tracing::info!(
        session = %ticket.id,
        "probed {}: {}x{} @ {:.3} fps -> {}x{} @ {:.3} fps",
        path.display(),
        probed.width,
        probed.height,
        probed.fps,
        params.width,
        params.height,
        params.fps
    );
    tracing::debug!(
        session = %ticket.id,
        "encoding with {} at {}k (max {}k), hardware acceleration {}",
        options.video_codec,
        options.bitrate_kbps,
        options.max_bitrate_kbps,
        options.hardware_acceleration
    );

    let stream = bounded("prepare stream", limit, state.pipeline.prepare(path, &options)).await?;
    adopt(state, ticket, stream.process.clone()).await?;
    Ok((probed, params, stream))
}

/// Install a fresh stream's process in the record, or kill it if the session
/// went away while we were starting it.
pub async fn adopt(
    state: &AppState,
    ticket: &SessionTicket,
    handle: Arc<dyn PlaybackProcess>,
) -> Result<(), SessionError> {
    if state.sessions.install_process(ticket.id, handle.clone()).await {
        return Ok(());
    }
    process::terminate(&*handle);
    Err(SessionError::NoActiveSession("Session ended during setup"))
}

/// Cleanup shared by every way a detached task or a failed setup can end.
pub async fn close_session(state: &AppState, ticket: &SessionTicket) {
    if let Some(handle) = state.sessions.take_process(ticket.id).await {
        process::terminate(&*handle);
    }
    if ticket.cancel.is_cancelled() {
        tracing::debug!(session = %ticket.id, "session was stopped externally");
        return;
    }
    if let Err(e) = state.platform.leave().await {
        tracing::warn!(session = %ticket.id, "failed to leave voice channel: {e:#}");
    }
    state.sessions.release_if(ticket.id).await;
}

/// End whatever session is active on behalf of /stop or /disconnect.
///
/// Returns `Ok(false)` when nothing was active. The session is released even
/// if leaving the voice channel fails.
pub async fn end_session(state: &AppState) -> Result<bool, SessionError> {
    let Some(mut record) = state.sessions.release().await else {
        return Ok(false);
    };
    record.cancel_token().cancel();
    if let Some(handle) = record.take_process() {
        process::terminate(&*handle);
    }
    if record.descriptor().kind == SessionKind::Scheduled {
        tracing::info!(session = %record.id(), "scheduled run stopped by operator");
    }
    state
        .platform
        .leave()
        .await
        .map_err(|e| SessionError::collaborator("disconnect from voice channel", e))?;
    Ok(true)
}

/// Detached task behind /play: stream `opened` and then every remaining
/// playlist entry, one after another.
pub async fn run_playlist(state: AppState, opened: OpenedSession, rest: Vec<PathBuf>) {
    let OpenedSession { ticket, destination, stream, .. } = opened;
    let mut next = Some(stream);
    let mut queue = rest.into_iter();

    loop {
        if ticket.cancel.is_cancelled() {
            break;
        }
        let stream = match next.take() {
            Some(s) => s,
            None => {
                let Some(path) = queue.next() else { break };
                match open_stream(&state, &ticket, &path).await {
                    Ok((probed, _, s)) => {
                        let planned = planned_duration(&probed);
                        state.sessions.start_clock(ticket.id, planned).await;
                        s
                    }
                    Err(e) => {
                        tracing::warn!(session = %ticket.id, "stopping playlist at {}: {e}", path.display());
                        break;
                    }
                }
            }
        };

        let handle = stream.process.clone();
        tokio::select! {
            biased;
            _ = ticket.cancel.cancelled() => {
                process::terminate(&*handle);
                break;
            }
            res = state.pipeline.play(stream.output, &destination) => {
                match res {
                    Ok(()) => tracing::info!(session = %ticket.id, "stream finished"),
                    Err(e) => tracing::warn!(session = %ticket.id, "stream failed: {e:#}"),
                }
            }
        }
        state.sessions.take_process(ticket.id).await;
    }

    close_session(&state, &ticket).await;
}

/// Planned duration for a single play: the probed container duration, so
/// `/timeleft` counts down during a single play instead of treating it as
/// unbounded. Zero only when ffprobe reported no duration.
pub fn planned_duration(probed: &ProbedMedia) -> std::time::Duration {
    probed
        .duration_secs
        .and_then(|s| std::time::Duration::try_from_secs_f64(s).ok())
        .unwrap_or_default()
}
