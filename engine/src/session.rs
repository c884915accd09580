use std::{path::PathBuf, sync::Arc, time::Duration};

use serde::Serialize;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::{sync::Mutex, time::Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{error::SessionError, platform::Destination, process::PlaybackProcess};

// --- Session slot -----------------------------------------------------------------
//
// The engine drives exactly one playback session at a time. The slot below is
// the only shared mutable state in the process: `try_acquire` checks for an
// existing record and installs the new one under the same lock guard, so two
// racing /play requests can never both get in.
//
// Detached tasks (single play, scheduled loop) keep the `SessionTicket` they
// were handed and only ever touch the record with their id. After a /stop the
// slot may already hold somebody else's session.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Play,
    Scheduled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulePhase {
    Starting,
    Bursting,
    Resting,
    Draining,
    Idle,
    Aborted,
}

/// Immutable description of a session, fixed at acceptance.
#[derive(Clone, Debug)]
pub struct SessionDescriptor {
    pub kind: SessionKind,
    pub title: String,
    pub media_path: PathBuf,
    pub destination: Destination,
    pub requested_by: String,
}

pub struct SessionRecord {
    id: Uuid,
    descriptor: SessionDescriptor,
    started_at: Instant,
    started_wall: OffsetDateTime,
    planned: Duration,
    process: Option<Arc<dyn PlaybackProcess>>,
    phase: Option<SchedulePhase>,
    bursts_completed: u64,
    cancel: CancellationToken,
}

impl SessionRecord {
    fn new(descriptor: SessionDescriptor) -> Self {
        Self {
            id: Uuid::new_v4(),
            phase: (descriptor.kind == SessionKind::Scheduled).then_some(SchedulePhase::Starting),
            descriptor,
            started_at: Instant::now(),
            started_wall: OffsetDateTime::now_utc(),
            planned: Duration::ZERO,
            process: None,
            bursts_completed: 0,
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn descriptor(&self) -> &SessionDescriptor {
        &self.descriptor
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn take_process(&mut self) -> Option<Arc<dyn PlaybackProcess>> {
        self.process.take()
    }

    /// Planned duration minus elapsed time. Negative once a session overruns;
    /// callers show it unclamped.
    pub fn remaining_seconds(&self) -> f64 {
        self.planned.as_secs_f64() - self.started_at.elapsed().as_secs_f64()
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            kind: self.descriptor.kind,
            title: self.descriptor.title.clone(),
            path: self.descriptor.media_path.to_string_lossy().into_owned(),
            guild_id: self.descriptor.destination.guild_id.clone(),
            channel_id: self.descriptor.destination.channel_id.clone(),
            requested_by: self.descriptor.requested_by.clone(),
            started_at: self.started_wall.format(&Rfc3339).ok(),
            planned_seconds: self.planned.as_secs_f64(),
            remaining_seconds: self.remaining_seconds(),
            phase: self.phase,
            bursts_completed: self.bursts_completed,
            process_id: self.process.as_ref().and_then(|p| p.id()),
        }
    }
}

/// What a detached task needs to find its own record again.
#[derive(Clone, Debug)]
pub struct SessionTicket {
    pub id: Uuid,
    pub cancel: CancellationToken,
}

/// Read-only view served by `/session`.
#[derive(Clone, Debug, Serialize)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub kind: SessionKind,
    pub title: String,
    pub path: String,
    pub guild_id: String,
    pub channel_id: String,
    pub requested_by: String,
    pub started_at: Option<String>,
    pub planned_seconds: f64,
    pub remaining_seconds: f64,
    pub phase: Option<SchedulePhase>,
    pub bursts_completed: u64,
    pub process_id: Option<u32>,
}

#[derive(Default)]
pub struct SessionSlot {
    current: Mutex<Option<SessionRecord>>,
}

impl SessionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn try_acquire(&self, descriptor: SessionDescriptor) -> Result<SessionTicket, SessionError> {
        let mut current = self.current.lock().await;
        if current.is_some() {
            return Err(SessionError::AlreadyActive);
        }
        let record = SessionRecord::new(descriptor);
        let ticket = SessionTicket { id: record.id, cancel: record.cancel.clone() };
        tracing::info!(
            session = %record.id,
            kind = ?record.descriptor.kind,
            "session acquired: {}",
            record.descriptor.title
        );
        *current = Some(record);
        Ok(ticket)
    }

    pub async fn is_active(&self) -> bool {
        self.current.lock().await.is_some()
    }

    /// Clear the slot. Calling it with nothing active is a no-op.
    pub async fn release(&self) -> Option<SessionRecord> {
        let released = self.current.lock().await.take();
        if let Some(rec) = &released {
            tracing::info!(session = %rec.id, "session released");
        }
        released
    }

    /// Clear the slot only if it still holds session `id`.
    pub async fn release_if(&self, id: Uuid) -> Option<SessionRecord> {
        let mut current = self.current.lock().await;
        if current.as_ref().map(|r| r.id) != Some(id) {
            return None;
        }
        tracing::info!(session = %id, "session released");
        current.take()
    }

    pub async fn current(&self) -> Option<SessionSnapshot> {
        self.current.lock().await.as_ref().map(SessionRecord::snapshot)
    }

    pub async fn remaining_seconds(&self) -> Result<f64, SessionError> {
        self.current
            .lock()
            .await
            .as_ref()
            .map(SessionRecord::remaining_seconds)
            .ok_or(SessionError::NoActiveSession("No active session"))
    }

    /// The live process handle, if a session is active. The inner `None`
    /// means the session is between streams.
    pub async fn process(&self) -> Option<Option<Arc<dyn PlaybackProcess>>> {
        self.current.lock().await.as_ref().map(|r| r.process.clone())
    }

    async fn update<R>(&self, id: Uuid, f: impl FnOnce(&mut SessionRecord) -> R) -> Option<R> {
        let mut current = self.current.lock().await;
        current.as_mut().filter(|r| r.id == id).map(f)
    }

    /// Store the handle of a freshly started stream. Returns false when the
    /// session is gone, in which case the caller still owns the process.
    pub async fn install_process(&self, id: Uuid, handle: Arc<dyn PlaybackProcess>) -> bool {
        self.update(id, |r| r.process = Some(handle)).await.is_some()
    }

    pub async fn take_process(&self, id: Uuid) -> Option<Arc<dyn PlaybackProcess>> {
        self.update(id, SessionRecord::take_process).await.flatten()
    }

    /// Restart the session clock with a new planned duration.
    pub async fn start_clock(&self, id: Uuid, planned: Duration) -> Option<Instant> {
        self.update(id, |r| {
            r.started_at = Instant::now();
            r.started_wall = OffsetDateTime::now_utc();
            r.planned = planned;
            r.started_at
        })
        .await
    }

    pub async fn set_phase(&self, id: Uuid, phase: SchedulePhase) {
        self.update(id, |r| r.phase = Some(phase)).await;
    }

    pub async fn record_burst(&self, id: Uuid) -> Option<u64> {
        self.update(id, |r| {
            r.bursts_completed += 1;
            r.bursts_completed
        })
        .await
    }
}
