//! Offline inspection of a manifest: no passphrase, no network.

use std::path::Path;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::manifest::store::ManifestStore;
use crate::manifest::VersionStatus;

#[derive(Debug, Clone)]
pub struct VersionSummary {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub status: VersionStatus,
    pub total_size: u64,
    pub chunks_assigned: usize,
    pub chunks_total: usize,
}

#[derive(Debug, Clone)]
pub struct ManifestSummary {
    pub filename: String,
    pub pool_entries: usize,
    pub versions: Vec<VersionSummary>,
}

pub fn run(manifest_path: &Path) -> Result<ManifestSummary> {
    let manifest = ManifestStore::new(manifest_path).load()?;
    Ok(ManifestSummary {
        filename: manifest.filename.clone(),
        pool_entries: manifest.pool.len(),
        versions: manifest
            .versions
            .iter()
            .map(|v| VersionSummary {
                version: v.version,
                timestamp: v.timestamp,
                status: v.status,
                total_size: v.total_size,
                chunks_assigned: v.assigned_chunks(),
                chunks_total: v.chunks.len(),
            })
            .collect(),
    })
}
