use std::{
    fmt, io,
    sync::{Arc, Mutex, PoisonError},
};

// --- Process control ------------------------------------------------------------
//
// Pause/resume/stop are plain POSIX signals sent to the encoder process:
//   pause     -> SIGSTOP
//   resume    -> SIGCONT
//   terminate -> SIGTERM
//
// All three are fire-and-forget. We never wait for the process to acknowledge
// the new state, so an HTTP "Paused movie" only means the signal was handed to
// the kernel. A process that already exited is logged and otherwise ignored.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlSignal {
    Stop,
    Continue,
    Terminate,
}

impl fmt::Display for ControlSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ControlSignal::Stop => "SIGSTOP",
            ControlSignal::Continue => "SIGCONT",
            ControlSignal::Terminate => "SIGTERM",
        })
    }
}

/// Opaque handle to a running playback subprocess.
pub trait PlaybackProcess: Send + Sync + fmt::Debug {
    fn id(&self) -> Option<u32>;
    fn signal(&self, signal: ControlSignal) -> io::Result<()>;
}

/// A child process addressed by pid.
///
/// The pid is only signalled while it still belongs to our child. Whoever
/// reaps the child holds the matching [`PidLease`] and retires it first; after
/// that every signal fails with ESRCH instead of reaching a recycled pid.
#[derive(Debug, Clone)]
pub struct ChildProcess {
    pid: u32,
    retired: Arc<Mutex<bool>>,
}

/// Held next to the `Child` that will be waited on. Dropping it retires the pid.
#[derive(Debug)]
pub struct PidLease {
    retired: Arc<Mutex<bool>>,
}

impl PidLease {
    /// Call before reaping the child.
    pub fn retire(&self) {
        *self.retired.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }
}

impl Drop for PidLease {
    fn drop(&mut self) {
        self.retire();
    }
}

impl ChildProcess {
    pub fn new(pid: u32) -> (Self, PidLease) {
        let retired = Arc::new(Mutex::new(false));
        (Self { pid, retired: retired.clone() }, PidLease { retired })
    }
}

impl PlaybackProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    #[cfg(unix)]
    fn signal(&self, signal: ControlSignal) -> io::Result<()> {
        let sig = match signal {
            ControlSignal::Stop => libc::SIGSTOP,
            ControlSignal::Continue => libc::SIGCONT,
            ControlSignal::Terminate => libc::SIGTERM,
        };
        let pid = libc::pid_t::try_from(self.pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        // Held across kill(2) so the lease cannot retire mid-signal.
        let retired = self.retired.lock().unwrap_or_else(PoisonError::into_inner);
        if *retired {
            return Err(io::Error::from_raw_os_error(libc::ESRCH));
        }
        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid, sig) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn signal(&self, signal: ControlSignal) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("{signal} is not available on this platform"),
        ))
    }
}

fn dispatch(handle: &dyn PlaybackProcess, signal: ControlSignal) -> bool {
    match handle.signal(signal) {
        Ok(()) => {
            tracing::debug!(pid = ?handle.id(), "sent {signal}");
            true
        }
        Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {
            tracing::info!(pid = ?handle.id(), "{signal}: process already gone");
            false
        }
        Err(e) => {
            tracing::warn!(pid = ?handle.id(), "failed to send {signal}: {e}");
            false
        }
    }
}

/// Freeze the process in place. Returns whether the signal was delivered.
pub fn pause(handle: &dyn PlaybackProcess) -> bool {
    dispatch(handle, ControlSignal::Stop)
}

pub fn resume(handle: &dyn PlaybackProcess) -> bool {
    dispatch(handle, ControlSignal::Continue)
}

/// Ask the process to exit. Does not wait for it.
pub fn terminate(handle: &dyn PlaybackProcess) -> bool {
    // A stopped process only acts on SIGTERM once it runs again.
    let delivered = dispatch(handle, ControlSignal::Terminate);
    if delivered {
        let _ = handle.signal(ControlSignal::Continue);
    }
    delivered
}
