use std::{path::Path, time::Duration};

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::{
    config::duration_serde,
    error::{bounded, Reply, SessionError},
    media::MediaSelection,
    platform::{Destination, VoiceLookup},
    playback::{end_session, open_session, planned_duration, run_playlist},
    process,
    scheduler::{run_schedule, SchedulePlan, ScheduledRun},
    session::{SessionDescriptor, SessionKind},
    AppState,
};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/status", get(status))
        .route("/play", post(play))
        .route("/play-scheduled", post(play_scheduled))
        .route("/timeleft", get(timeleft))
        .route("/pause", get(pause))
        .route("/resume", get(resume))
        .route("/stop", get(stop))
        .route("/disconnect", get(disconnect))
        // Read-only view of the active session.
        .route("/session", get(session))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// --- Request bodies ---------------------------------------------------------------
//
// Bot clients send platform ids either as strings or as bare numbers, and an
// empty string means "not given". Every field is optional at the serde level
// so a missing one becomes a 400 envelope listing it instead of a 422.

#[derive(Deserialize)]
#[serde(untagged)]
enum Snowflake {
    Text(String),
    Number(u64),
}

fn snowflake<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Snowflake>::deserialize(deserializer)?.map(|s| match s {
        Snowflake::Text(t) => t,
        Snowflake::Number(n) => n.to_string(),
    }))
}

#[derive(Debug, Default, Deserialize)]
struct PlayRequest {
    title: Option<String>,
    path: Option<String>,
    #[serde(default, deserialize_with = "snowflake")]
    author: Option<String>,
    #[serde(default, deserialize_with = "snowflake")]
    guild_id: Option<String>,
    #[serde(rename = "type")]
    media_type: Option<String>,
    season: Option<u32>,
    episode: Option<u32>,
    sorted_episodes: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct ScheduledRequest {
    title: Option<String>,
    path: Option<String>,
    #[serde(default, deserialize_with = "snowflake")]
    author: Option<String>,
    #[serde(default, deserialize_with = "snowflake")]
    guild_id: Option<String>,
    #[serde(rename = "type")]
    media_type: Option<String>,
    /// Seconds or humantime ("6h"); echoed back as given.
    duration: Option<Value>,
    #[serde(default, deserialize_with = "duration_serde::option::deserialize")]
    movie_duration: Option<Duration>,
}

/// Collects required-but-absent fields so they are reported together.
#[derive(Default)]
struct Required(Vec<&'static str>);

impl Required {
    fn take(&mut self, name: &'static str, value: Option<String>) -> String {
        match value.filter(|v| !v.trim().is_empty()) {
            Some(v) => v,
            None => {
                self.0.push(name);
                String::new()
            }
        }
    }

    fn check<T>(&mut self, name: &'static str, value: Option<T>) -> Option<T> {
        if value.is_none() {
            self.0.push(name);
        }
        value
    }

    fn finish(self) -> Result<(), SessionError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(SessionError::MissingField(self.0))
        }
    }
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, SessionError> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| SessionError::invalid("request body", e.body_text()))
}

async fn locate_author(state: &AppState, guild_id: &str, author: &str) -> Result<Destination, SessionError> {
    let lookup = bounded(
        "look up author",
        state.config.collaborator_timeout,
        state.platform.voice_channel_of(guild_id, author),
    )
    .await?;
    match lookup {
        VoiceLookup::UnknownMember => Err(SessionError::UnknownMember(author.to_string())),
        VoiceLookup::NotInVoice => Err(SessionError::NotInVoice),
        VoiceLookup::InChannel(dest) => Ok(dest),
    }
}

/// Send `text` to the audit channel, if one is configured.
async fn audit(state: &AppState, text: String) -> Result<(), SessionError> {
    let Some(channel) = state.config.log_channel_id.as_deref() else {
        return Ok(());
    };
    bounded("send audit message", state.config.collaborator_timeout, state.platform.notify(channel, &text)).await
}

fn display_or_undefined<T: std::fmt::Display>(v: &Option<T>) -> String {
    v.as_ref().map_or_else(|| "undefined".to_string(), T::to_string)
}

// --- Handlers ---------------------------------------------------------------------

async fn status(State(state): State<AppState>) -> Result<Json<Reply>, SessionError> {
    let reply = Reply { status: "OK", message: "Server is running".into() };
    let line = serde_json::to_string(&reply).map_err(anyhow::Error::from)?;
    audit(&state, format!("STATUS: {line}"))
        .await
        .map_err(|e| SessionError::Internal(anyhow::Error::new(e)))?;
    Ok(Json(reply))
}

async fn play(
    State(state): State<AppState>,
    payload: Result<Json<PlayRequest>, JsonRejection>,
) -> Result<Json<Reply>, SessionError> {
    if state.sessions.is_active().await {
        return Err(SessionError::AlreadyActive);
    }
    let req = body(payload)?;

    let note = format!(
        "Play: {}\nPath: {}\nSorted Episodes: {}\nAuthor: {}\nGuild ID: {}\nType: {}\nSeason: {}\nEpisode: {}",
        display_or_undefined(&req.title),
        display_or_undefined(&req.path),
        display_or_undefined(&req.sorted_episodes),
        display_or_undefined(&req.author),
        display_or_undefined(&req.guild_id),
        display_or_undefined(&req.media_type),
        display_or_undefined(&req.season),
        display_or_undefined(&req.episode),
    );
    if let Err(e) = audit(&state, note).await {
        tracing::warn!("play audit message not sent: {e}");
    }

    let mut required = Required::default();
    let title = required.take("title", req.title);
    let path = required.take("path", req.path);
    let author = required.take("author", req.author);
    let guild_id = required.take("guild_id", req.guild_id);
    required.finish()?;

    let selection = MediaSelection::from_request(
        &path,
        req.media_type.as_deref(),
        req.sorted_episodes.as_ref(),
        req.season,
        req.episode,
    )?;
    let mut playlist = selection.playlist().into_iter();
    let Some(first) = playlist.next() else {
        return Err(SessionError::invalid("episode", "nothing to play from the requested season/episode"));
    };

    let destination = locate_author(&state, &guild_id, &author).await?;
    let descriptor = SessionDescriptor {
        kind: SessionKind::Play,
        title: title.clone(),
        media_path: first.clone(),
        destination,
        requested_by: author,
    };

    let opened = open_session(&state, descriptor, &first).await?;
    state
        .sessions
        .start_clock(opened.ticket.id, planned_duration(&opened.probed))
        .await;

    let params = opened.params;
    tracing::info!(session = %opened.ticket.id, "playing {title}");
    tokio::spawn(run_playlist(state.clone(), opened, playlist.collect()));

    Ok(Reply::ok(format!(
        "Playing media (FPS: {}, Width: {}, Height: {}, Path: {path})",
        params.fps, params.width, params.height
    )))
}

async fn play_scheduled(
    State(state): State<AppState>,
    payload: Result<Json<ScheduledRequest>, JsonRejection>,
) -> Result<Json<Reply>, SessionError> {
    if state.sessions.is_active().await {
        return Err(SessionError::AlreadyActive);
    }
    let req = body(payload)?;

    let mut required = Required::default();
    let title = required.take("title", req.title);
    let path = required.take("path", req.path);
    let guild_id = required.take("guild_id", req.guild_id);
    required.take("type", req.media_type);
    let author = required.take("author", req.author);
    let raw_duration = required.check("duration", req.duration.filter(|v| !v.is_null()));
    let movie_duration = required.check("movie_duration", req.movie_duration);
    required.finish()?;
    let (Some(raw_duration), Some(movie_duration)) = (raw_duration, movie_duration) else {
        return Err(SessionError::MissingField(vec!["duration", "movie_duration"]));
    };

    let requested = duration_serde::deserialize(raw_duration.clone())
        .map_err(|e| SessionError::invalid("duration", e.to_string()))?;
    let plan = SchedulePlan::new(requested, movie_duration)?;

    let destination = locate_author(&state, &guild_id, &author).await?;
    let descriptor = SessionDescriptor {
        kind: SessionKind::Scheduled,
        title: title.clone(),
        media_path: path.clone().into(),
        destination,
        requested_by: author,
    };

    let opened = open_session(&state, descriptor, Path::new(&path)).await?;
    let Some(started) = state.sessions.start_clock(opened.ticket.id, plan.total).await else {
        process::terminate(&*opened.stream.process);
        return Err(SessionError::NoActiveSession("Session ended during setup"));
    };

    let run = ScheduledRun {
        ticket: opened.ticket,
        destination: opened.destination,
        media_path: path.into(),
        title: title.clone(),
        plan,
        first: Some(opened.stream),
        deadline: started + plan.total,
    };
    tokio::spawn(run_schedule(state.clone(), run));

    let shown = match &raw_duration {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Ok(Reply::ok(format!("Playing scheduled media (Title: {title}, Duration: {shown})")))
}

async fn timeleft(State(state): State<AppState>) -> Result<Json<Reply>, SessionError> {
    let secs = state
        .sessions
        .remaining_seconds()
        .await
        .map_err(|_| SessionError::NoActiveSession("No stream to get time left"))?;
    Ok(Reply::ok(secs.to_string()))
}

async fn pause(State(state): State<AppState>) -> Result<Json<Reply>, SessionError> {
    let handle = state
        .sessions
        .process()
        .await
        .ok_or(SessionError::NoActiveSession("No stream to pause"))?;
    // Between scheduled bursts there is nothing to signal.
    if let Some(h) = handle {
        process::pause(&*h);
    }
    Ok(Reply::ok("Paused movie"))
}

async fn resume(State(state): State<AppState>) -> Result<Json<Reply>, SessionError> {
    let handle = state
        .sessions
        .process()
        .await
        .ok_or(SessionError::NoActiveSession("No stream to resume"))?;
    if let Some(h) = handle {
        process::resume(&*h);
    }
    Ok(Reply::ok("Resumed movie"))
}

async fn stop(State(state): State<AppState>) -> Result<Json<Reply>, Response> {
    match end_session(&state).await {
        Ok(true) => Ok(Reply::ok("Stopped movie")),
        Ok(false) => Err(SessionError::NoActiveSession("No stream to stop").into_response()),
        Err(e) => {
            tracing::error!("stop: {e}");
            Err((StatusCode::INTERNAL_SERVER_ERROR, Reply::error("Error stopping stream")).into_response())
        }
    }
}

async fn disconnect(State(state): State<AppState>) -> Result<Json<Reply>, Response> {
    match end_session(&state).await {
        Ok(true) => Ok(Reply::ok("Disconnected from voice channel")),
        Ok(false) => Err(SessionError::NoActiveSession("Not connected to a voice channel").into_response()),
        Err(e) => {
            tracing::error!("disconnect: {e}");
            Err((StatusCode::INTERNAL_SERVER_ERROR, Reply::error("Error disconnecting")).into_response())
        }
    }
}

async fn session(State(state): State<AppState>) -> Result<Json<Value>, SessionError> {
    let snapshot = state
        .sessions
        .current()
        .await
        .ok_or(SessionError::NoActiveSession("No active session"))?;
    Ok(Json(json!({ "status": "OK", "session": snapshot })))
}
