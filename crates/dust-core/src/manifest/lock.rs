//! Advisory single-writer lock, enforced by convention through a lock file
//! next to the manifest.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::store;
use crate::error::{DustError, Result};
use crate::platform;

const STALE_LOCK_SECS: i64 = 6 * 60 * 60;

#[derive(Debug, Serialize, Deserialize)]
struct LockEntry {
    hostname: String,
    pid: u32,
    time: String,
}

/// Handle to an acquired lock. Dropping it removes the lock file.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), "failed to release lock: {e}");
        }
    }
}

/// Acquire the advisory lock for a manifest. A lock older than six hours is
/// presumed abandoned by a killed process and reaped once.
pub fn acquire(manifest_path: &Path) -> Result<LockGuard> {
    let path = store::lock_path_for(manifest_path);
    let entry = LockEntry {
        hostname: platform::hostname(),
        pid: std::process::id(),
        time: Utc::now().to_rfc3339(),
    };
    let data = serde_json::to_vec(&entry)?;

    let mut reaped = false;
    loop {
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                file.write_all(&data)?;
                file.sync_all()?;
                return Ok(LockGuard { path });
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if !reaped && reap_if_stale(&path) {
                    reaped = true;
                    continue;
                }
                return Err(DustError::Locked(holder_description(&path)));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn reap_if_stale(path: &Path) -> bool {
    let Ok(raw) = std::fs::read(path) else {
        // Holder vanished between create_new and read; retry the acquire.
        return true;
    };
    let Ok(entry) = serde_json::from_slice::<LockEntry>(&raw) else {
        return false;
    };
    let Ok(acquired) = DateTime::parse_from_rfc3339(&entry.time) else {
        return false;
    };
    let age = Utc::now().signed_duration_since(acquired.with_timezone(&Utc));
    if age > chrono::Duration::seconds(STALE_LOCK_SECS) {
        warn!(
            holder = %entry.hostname,
            pid = entry.pid,
            "reaping stale lock (held {}s)",
            age.num_seconds()
        );
        let _ = std::fs::remove_file(path);
        return true;
    }
    false
}

fn holder_description(path: &Path) -> String {
    match std::fs::read(path)
        .ok()
        .and_then(|raw| serde_json::from_slice::<LockEntry>(&raw).ok())
    {
        Some(entry) => format!("{} pid {} since {}", entry.hostname, entry.pid, entry.time),
        None => path.display().to_string(),
    }
}
