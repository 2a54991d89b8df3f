//! The manifest: filename + global chunk pool + ordered version history.
//!
//! The pool maps plaintext fingerprints to stored envelope descriptors and is
//! append-only for the life of a manifest; versions reference pool entries by
//! fingerprint, which is what makes cross-version deduplication free.

pub mod lock;
pub mod store;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::{CipherHash, PlainHash};
use crate::error::{DustError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    Pending,
    Completed,
}

/// Descriptor of one stored encrypted fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolEntry {
    /// Fingerprint of the on-wire envelope, checked before decryption.
    pub hash: CipherHash,
    /// Opaque immutable locator returned by the remote store.
    pub url: String,
}

/// One complete backup of the tracked file.
///
/// `chunks[i]` is the fingerprint of the i-th chunk. Upload tasks complete in
/// any order, so a pending version may hold `None` gaps; a completed version
/// never does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    /// Hex SHA-256 of the entire source file at sync time.
    pub file_hash: String,
    pub total_size: u64,
    pub status: VersionStatus,
    pub chunks: Vec<Option<PlainHash>>,
}

impl Version {
    pub fn assigned_chunks(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_some()).count()
    }

    /// Record the fingerprint for a chunk position, growing the sequence with
    /// explicit gaps as needed.
    pub fn set_chunk(&mut self, index: usize, ph: PlainHash) {
        if index >= self.chunks.len() {
            self.chunks.resize(index + 1, None);
        }
        self.chunks[index] = Some(ph);
    }

    /// The full ordered fingerprint sequence. Errors if any position is unset,
    /// which can only happen on a manifest violating the completed-version
    /// invariant.
    pub fn chunk_sequence(&self) -> Result<Vec<PlainHash>> {
        self.chunks
            .iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.ok_or_else(|| {
                    DustError::ManifestCorrupt(format!(
                        "version {} has an unset chunk at position {i}",
                        self.version
                    ))
                })
            })
            .collect()
    }
}

/// Whether a manifest came from the versioned layout or the legacy
/// single-version layout. Affects restore mode and output naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ManifestKind {
    #[default]
    Versioned,
    SingleVersion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub filename: String,
    pub pool: BTreeMap<PlainHash, PoolEntry>,
    pub versions: Vec<Version>,
    #[serde(skip)]
    pub kind: ManifestKind,
}

/// Version selector for restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionQuery {
    /// The most recent completed version.
    Latest,
    /// An explicit 1-based version number.
    Number(u32),
}

/// Outcome of the resume decision taken when a sync opens a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPlan {
    /// The last completed version already matches the file.
    UpToDate,
    /// A pending version matches the file; continue filling it.
    Resume,
    /// Open a fresh pending version.
    NewVersion,
}

impl Manifest {
    pub fn new(filename: &str) -> Self {
        Self {
            filename: filename.to_string(),
            pool: BTreeMap::new(),
            versions: Vec::new(),
            kind: ManifestKind::Versioned,
        }
    }

    pub fn pool_lookup(&self, ph: &PlainHash) -> Option<&PoolEntry> {
        self.pool.get(ph)
    }

    /// Insert a pool entry. Re-inserting an identical descriptor is a no-op;
    /// a differing ciphertext hash for the same fingerprint means a key change
    /// or fingerprint collision and must never happen.
    ///
    /// Returns `true` when the entry is new.
    pub fn pool_insert(&mut self, ph: PlainHash, entry: PoolEntry) -> Result<bool> {
        if let Some(existing) = self.pool.get(&ph) {
            if existing.hash == entry.hash {
                return Ok(false);
            }
            return Err(DustError::PoolConflict(ph));
        }
        self.pool.insert(ph, entry);
        Ok(true)
    }

    /// The trailing pending version, if one exists.
    pub fn pending_version(&self) -> Option<&Version> {
        self.versions
            .last()
            .filter(|v| v.status == VersionStatus::Pending)
    }

    pub fn latest_completed(&self) -> Option<&Version> {
        self.versions
            .iter()
            .rev()
            .find(|v| v.status == VersionStatus::Completed)
    }

    pub fn resolve_version(&self, query: VersionQuery) -> Result<&Version> {
        match query {
            VersionQuery::Latest => self
                .latest_completed()
                .ok_or_else(|| DustError::VersionNotFound("no completed versions".into())),
            VersionQuery::Number(n) => {
                let version = self
                    .versions
                    .iter()
                    .find(|v| v.version == n)
                    .ok_or_else(|| DustError::VersionNotFound(format!("version {n}")))?;
                if version.status != VersionStatus::Completed {
                    return Err(DustError::VersionNotFound(format!(
                        "version {n} is still pending"
                    )));
                }
                Ok(version)
            }
        }
    }

    /// Resume decision for a sync against the current file hash.
    pub fn plan_sync(&self, file_hash: &str) -> SyncPlan {
        if let Some(pending) = self.pending_version() {
            if pending.file_hash == file_hash {
                return SyncPlan::Resume;
            }
        }
        if let Some(completed) = self.latest_completed() {
            if completed.file_hash == file_hash {
                return SyncPlan::UpToDate;
            }
        }
        SyncPlan::NewVersion
    }

    /// Apply the resume decision, returning the index of the pending version
    /// to fill. A stale pending version (left by a sync of content that has
    /// since changed) is repurposed in place, keeping its number, so the
    /// at-most-one-pending invariant holds.
    pub fn open_pending(&mut self, file_hash: &str, total_size: u64) -> usize {
        if let Some(last) = self.versions.last_mut() {
            if last.status == VersionStatus::Pending {
                if last.file_hash != file_hash {
                    last.timestamp = Utc::now();
                    last.file_hash = file_hash.to_string();
                    last.total_size = total_size;
                    last.chunks.clear();
                }
                return self.versions.len() - 1;
            }
        }
        self.versions.push(Version {
            version: self.versions.len() as u32 + 1,
            timestamp: Utc::now(),
            file_hash: file_hash.to_string(),
            total_size,
            status: VersionStatus::Pending,
            chunks: Vec::new(),
        });
        self.versions.len() - 1
    }

    /// Structural invariants checked after load.
    pub fn validate(&self) -> Result<()> {
        for (i, version) in self.versions.iter().enumerate() {
            if version.version as usize != i + 1 {
                return Err(DustError::ManifestCorrupt(format!(
                    "version numbering broken at index {i} (found {})",
                    version.version
                )));
            }
            if version.status == VersionStatus::Pending && i + 1 != self.versions.len() {
                return Err(DustError::ManifestCorrupt(format!(
                    "pending version {} is not the last version",
                    version.version
                )));
            }
            for (pos, slot) in version.chunks.iter().enumerate() {
                match slot {
                    Some(ph) if !self.pool.contains_key(ph) => {
                        return Err(DustError::ManifestCorrupt(format!(
                            "version {} chunk {pos} references {ph} which is not in the pool",
                            version.version
                        )));
                    }
                    None if version.status == VersionStatus::Completed => {
                        return Err(DustError::ManifestCorrupt(format!(
                            "completed version {} has an unset chunk at position {pos}",
                            version.version
                        )));
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}
