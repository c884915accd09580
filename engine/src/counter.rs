use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::Context;

/// Durable "how many scheduled streams have we done" counter.
///
/// Stored as a plain decimal integer in a text file so operators can read or
/// reset it by hand. Writes go to a sibling temp file and are renamed over
/// the counter file, so a crash leaves either the old or the new value on disk.
/// Losing a single increment to a crash between read and write is accepted.
#[derive(Debug, Clone)]
pub struct StreamCounter {
    path: PathBuf,
    // Serializes read-modify-write inside this process.
    lock: Arc<Mutex<()>>,
}

impl StreamCounter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), lock: Arc::new(Mutex::new(())) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current stored value; absent or unreadable files count as zero.
    pub fn current(&self) -> u64 {
        read_count(&self.path)
    }

    pub fn increment(&self) -> anyhow::Result<u64> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let next = read_count(&self.path).saturating_add(1);

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, next.to_string())
            .with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(next)
    }

    /// `increment` on the blocking pool, for use from async tasks.
    pub async fn increment_async(&self) -> anyhow::Result<u64> {
        let counter = self.clone();
        tokio::task::spawn_blocking(move || counter.increment())
            .await
            .map_err(|e| anyhow::anyhow!(e))
            .and_then(|x| x)
    }
}

fn read_count(path: &Path) -> u64 {
    match std::fs::read_to_string(path) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("stream counter {} is corrupt ({raw:?}), restarting from 0", path.display());
            0
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
        Err(e) => {
            tracing::warn!("failed to read stream counter {}: {e}", path.display());
            0
        }
    }
}
