use std::{path::PathBuf, time::Duration};

use tokio::time::Instant;

use crate::{
    error::{bounded, SessionError},
    pipeline::PreparedStream,
    platform::Destination,
    playback::{close_session, open_stream},
    process,
    session::{SchedulePhase, SessionTicket},
    AppState,
};

/// How a requested duration is split into whole bursts.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SchedulePlan {
    pub bursts: u64,
    pub burst: Duration,
    pub total: Duration,
}

impl SchedulePlan {
    /// `bursts = ceil(requested / burst)`, `total = bursts * burst`.
    pub fn new(requested: Duration, burst: Duration) -> Result<Self, SessionError> {
        if burst.is_zero() {
            return Err(SessionError::invalid("movie_duration", "must be greater than zero"));
        }
        if requested.is_zero() {
            return Err(SessionError::invalid("duration", "must be greater than zero"));
        }
        let bursts = (requested.as_secs_f64() / burst.as_secs_f64()).ceil() as u64;
        let total = u32::try_from(bursts)
            .ok()
            .and_then(|n| burst.checked_mul(n))
            .ok_or_else(|| SessionError::invalid("duration", "too long for the given movie_duration"))?;
        Ok(Self { bursts, burst, total })
    }
}

/// Everything the detached loop needs once setup has succeeded.
pub struct ScheduledRun {
    pub ticket: SessionTicket,
    pub destination: Destination,
    pub media_path: PathBuf,
    pub title: String,
    pub plan: SchedulePlan,
    /// Stream prepared during setup; later bursts prepare their own.
    pub first: Option<PreparedStream>,
    pub deadline: Instant,
}

enum Outcome {
    Finished,
    Cancelled,
}

/// Detached task behind /play-scheduled.
pub async fn run_schedule(state: AppState, mut run: ScheduledRun) {
    let id = run.ticket.id;
    tracing::info!(
        session = %id,
        "scheduled run started: {} burst(s) of {} ({} total)",
        run.plan.bursts,
        humantime::format_duration(run.plan.burst),
        humantime::format_duration(run.plan.total)
    );

    match drive(&state, &mut run).await {
        Ok(Outcome::Finished) => {
            state.sessions.set_phase(id, SchedulePhase::Draining).await;
            tracing::info!(session = %id, "scheduled run reached its deadline");
        }
        Ok(Outcome::Cancelled) => {
            tracing::info!(session = %id, "scheduled run cancelled");
        }
        Err(cause) => {
            let bursts = state.sessions.current().await.filter(|s| s.id == id).map_or(0, |s| s.bursts_completed);
            let err = SessionError::AbortedLoop { bursts, cause: Box::new(cause) };
            tracing::error!(session = %id, "{err}");
            state.sessions.set_phase(id, SchedulePhase::Aborted).await;
        }
    }

    // A stream prepared for a burst that never ran still owns an encoder.
    if let Some(stream) = run.first.take() {
        process::terminate(&*stream.process);
    }
    close_session(&state, &run.ticket).await;
}

async fn drive(state: &AppState, run: &mut ScheduledRun) -> Result<Outcome, SessionError> {
    let id = run.ticket.id;
    let limit = state.config.collaborator_timeout;

    while Instant::now() < run.deadline {
        state.sessions.set_phase(id, SchedulePhase::Bursting).await;
        let stream = match run.first.take() {
            Some(s) => s,
            None => open_stream(state, &run.ticket, &run.media_path).await?.2,
        };

        let handle = stream.process.clone();
        tokio::select! {
            biased;
            _ = run.ticket.cancel.cancelled() => {
                process::terminate(&*handle);
                return Ok(Outcome::Cancelled);
            }
            res = state.pipeline.play(stream.output, &run.destination) => {
                if let Err(e) = res {
                    tracing::warn!(session = %id, "burst failed: {e:#}");
                    process::terminate(&*handle);
                }
            }
        }

        let burst = state.sessions.record_burst(id).await.unwrap_or_default();
        let count = state
            .counter
            .increment_async()
            .await
            .map_err(|e| SessionError::collaborator("update stream counter", e))?;
        tracing::info!(session = %id, burst, count, "burst finished");
        announce(state, &run.title, count).await?;

        // The encoder may still be flushing after a failed delivery.
        process::terminate(&*handle);
        state.sessions.take_process(id).await;

        state.sessions.set_phase(id, SchedulePhase::Resting).await;
        tokio::select! {
            biased;
            _ = run.ticket.cancel.cancelled() => return Ok(Outcome::Cancelled),
            _ = tokio::time::sleep(state.config.rest_interval) => {}
        }

        if Instant::now() >= run.deadline {
            break;
        }
        bounded("rejoin voice channel", limit, state.platform.join(&run.destination)).await?;
    }
    Ok(Outcome::Finished)
}

/// Post the burst notice. A failure here ends the run like any other
/// collaborator failure inside the loop.
async fn announce(state: &AppState, title: &str, count: u64) -> Result<(), SessionError> {
    let Some(channel) = state.config.notify_channel_id.as_deref() else {
        return Ok(());
    };
    let text = format!(
        "Streaming for the {} time. Streaming {} again in {}..",
        ordinal(count),
        title,
        humantime::format_duration(state.config.rest_interval)
    );
    bounded("send notification", state.config.collaborator_timeout, state.platform.notify(channel, &text)).await
}

/// English ordinal: 1st, 2nd, 3rd, 4th, 11th, 12th, 13th, 21st, ...
pub fn ordinal(n: u64) -> String {
    let suffix = match (n % 10, n % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{n}{suffix}")
}

#[cfg(test)]
mod tests {
    use std::{path::Path, sync::atomic::Ordering};

    use super::*;
    use crate::{
        playback::{end_session, open_session},
        session::SessionKind,
        testing::{descriptor, Harness},
    };

    #[test]
    fn plan_rounds_up_to_whole_bursts() {
        let plan = SchedulePlan::new(Duration::from_secs(3600), Duration::from_secs(1500)).unwrap();
        assert_eq!(plan.bursts, 3);
        assert_eq!(plan.total, Duration::from_secs(4500));

        let exact = SchedulePlan::new(Duration::from_secs(3000), Duration::from_secs(1500)).unwrap();
        assert_eq!(exact.bursts, 2);
    }

    #[test]
    fn plan_rejects_zero() {
        assert!(SchedulePlan::new(Duration::from_secs(60), Duration::ZERO).is_err());
        assert!(SchedulePlan::new(Duration::ZERO, Duration::from_secs(60)).is_err());
    }

    #[test]
    fn ordinals() {
        let got: Vec<_> = [1, 2, 3, 4, 11, 12, 13, 21, 22, 101, 111].into_iter().map(ordinal).collect();
        assert_eq!(got, ["1st", "2nd", "3rd", "4th", "11th", "12th", "13th", "21st", "22nd", "101st", "111th"]);
    }

    async fn start(h: &Harness, requested: u64, burst: u64) -> ScheduledRun {
        let mut desc = descriptor("film");
        desc.kind = SessionKind::Scheduled;
        let plan = SchedulePlan::new(Duration::from_secs(requested), Duration::from_secs(burst)).unwrap();
        let opened = open_session(&h.state, desc, Path::new("/media/film.mkv")).await.unwrap();
        let started = h.state.sessions.start_clock(opened.ticket.id, plan.total).await.unwrap();
        ScheduledRun {
            ticket: opened.ticket,
            destination: opened.destination,
            media_path: "/media/film.mkv".into(),
            title: "film".into(),
            plan,
            first: Some(opened.stream),
            deadline: started + plan.total,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bursts_until_the_deadline_then_leaves() {
        let h = Harness::new();
        *h.pipeline.play_for.lock().unwrap() = Some(Duration::from_secs(1500));

        let run = start(&h, 3600, 1500).await;
        run_schedule(h.state.clone(), run).await;

        // 0-1500 play, rest to 2400, 2400-3900 play, rest to 4800 > 4500.
        assert_eq!(h.pipeline.prepared().len(), 2);
        assert_eq!(h.platform.joins().len(), 2);
        assert_eq!(h.platform.leaves(), 1);
        assert_eq!(
            h.platform.notes(),
            vec![
                ("notify".to_string(), "Streaming for the 1st time. Streaming film again in 15m..".to_string()),
                ("notify".to_string(), "Streaming for the 2nd time. Streaming film again in 15m..".to_string()),
            ]
        );
        assert_eq!(std::fs::read_to_string(&h.counter_path).unwrap().trim(), "2");
        assert!(!h.state.sessions.is_active().await);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_burst_is_not_fatal() {
        let h = Harness::new();
        *h.pipeline.play_for.lock().unwrap() = Some(Duration::from_secs(1500));
        h.pipeline.fail_play.store(true, Ordering::SeqCst);

        let run = start(&h, 3600, 1500).await;
        run_schedule(h.state.clone(), run).await;

        assert_eq!(h.platform.notes().len(), 2);
        for p in h.pipeline.processes() {
            assert!(p.signals().contains(&crate::process::ControlSignal::Terminate));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn prepare_failure_aborts_and_releases() {
        let h = Harness::new();
        *h.pipeline.play_for.lock().unwrap() = Some(Duration::from_secs(1500));
        *h.pipeline.prepare_limit.lock().unwrap() = Some(1);

        let run = start(&h, 3600, 1500).await;
        run_schedule(h.state.clone(), run).await;

        assert_eq!(h.platform.notes().len(), 1);
        assert_eq!(h.platform.leaves(), 1);
        assert!(!h.state.sessions.is_active().await);
    }

    #[tokio::test(start_paused = true)]
    async fn notification_failure_ends_the_loop() {
        let h = Harness::new();
        *h.pipeline.play_for.lock().unwrap() = Some(Duration::from_secs(1500));
        h.platform.fail_notify.store(true, Ordering::SeqCst);

        let run = start(&h, 3600, 1500).await;
        let task = run_schedule(h.state.clone(), run);
        assert_send(&task);
        tokio::spawn(task).await.unwrap();

        assert_eq!(h.pipeline.prepared().len(), 1);
        assert_eq!(h.platform.joins().len(), 1);
        assert_eq!(h.platform.leaves(), 1);
        assert_eq!(std::fs::read_to_string(&h.counter_path).unwrap().trim(), "1");
        assert!(h.pipeline.processes()[0].signals().contains(&crate::process::ControlSignal::Terminate));
        assert!(!h.state.sessions.is_active().await);
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_the_rest_window() {
        let h = Harness::new();
        *h.pipeline.play_for.lock().unwrap() = Some(Duration::from_secs(1500));

        let run = start(&h, 3600, 1500).await;
        let task = tokio::spawn(run_schedule(h.state.clone(), run));

        tokio::time::sleep(Duration::from_secs(1600)).await;
        let snap = h.state.sessions.current().await.unwrap();
        assert_eq!(snap.phase, Some(SchedulePhase::Resting));
        assert_eq!(snap.bursts_completed, 1);

        let stopped_at = Instant::now();
        assert!(end_session(&h.state).await.unwrap());
        task.await.unwrap();

        assert!(stopped_at.elapsed() < Duration::from_secs(1));
        assert_eq!(h.platform.leaves(), 1);
        assert_eq!(h.platform.joins().len(), 1);
        assert!(!h.state.sessions.is_active().await);
    }
}
