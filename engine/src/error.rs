use std::{future::Future, time::Duration};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Everything a control-plane request or a detached playback task can fail with.
///
/// Validation variants are recovered locally and answered with a 400 envelope.
/// Collaborator variants come from the probe, the streaming pipeline or the
/// platform client; during synchronous setup they surface as 500. Inside the
/// detached scheduled loop they end the loop and are only logged.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    // The exact text is matched by existing bot clients.
    #[error("Already playing media")]
    AlreadyActive,

    #[error("{0}")]
    NoActiveSession(&'static str),

    #[error("Missing required fields ({})", .0.join(", "))]
    MissingField(Vec<&'static str>),

    #[error("Invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Author not found (author: {0})")]
    UnknownMember(String),

    #[error("User is not in a voice channel")]
    NotInVoice,

    #[error("Failed to {what}: {source:#}")]
    CollaboratorFailure {
        what: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("Timed out after {after:?} waiting to {what}")]
    CollaboratorTimeout { what: &'static str, after: Duration },

    #[error("scheduled loop aborted after {bursts} burst(s): {cause}")]
    AbortedLoop {
        bursts: u64,
        #[source]
        cause: Box<SessionError>,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl SessionError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        SessionError::InvalidField { field, reason: reason.into() }
    }

    pub fn collaborator(what: &'static str, source: anyhow::Error) -> Self {
        SessionError::CollaboratorFailure { what, source }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            SessionError::AlreadyActive
            | SessionError::NoActiveSession(_)
            | SessionError::MissingField(_)
            | SessionError::InvalidField { .. }
            | SessionError::UnknownMember(_)
            | SessionError::NotInVoice => StatusCode::BAD_REQUEST,
            SessionError::CollaboratorFailure { .. }
            | SessionError::CollaboratorTimeout { .. }
            | SessionError::AbortedLoop { .. }
            | SessionError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON envelope shared by every control-plane response.
#[derive(Debug, Serialize)]
pub struct Reply {
    pub status: &'static str,
    pub message: String,
}

impl Reply {
    pub fn ok(message: impl Into<String>) -> Json<Reply> {
        Json(Reply { status: "OK", message: message.into() })
    }

    pub fn error(message: impl Into<String>) -> Json<Reply> {
        Json(Reply { status: "ERROR", message: message.into() })
    }
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match self {
            // Unexpected failures get a bare status, no body.
            SessionError::Internal(e) => {
                tracing::error!("internal error: {e:#}");
                status.into_response()
            }
            other => {
                if status.is_server_error() {
                    tracing::error!("{other}");
                }
                (status, Reply::error(other.to_string())).into_response()
            }
        }
    }
}

/// Run a collaborator call under `limit`, mapping both its failure and a hang
/// onto the session error taxonomy.
pub async fn bounded<T, F>(what: &'static str, limit: Duration, fut: F) -> Result<T, SessionError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(SessionError::collaborator(what, e)),
        Err(_) => Err(SessionError::CollaboratorTimeout { what, after: limit }),
    }
}
