//! Manifest persistence: atomic whole-document saves and layout upgrades.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};

use super::{Manifest, ManifestKind, PoolEntry, Version, VersionStatus};
use crate::digest::{CipherHash, PlainHash};
use crate::error::{DustError, Result};
use crate::platform;

/// Path of the versioned manifest tracked next to a source file:
/// `<file>.sync.dust`.
pub fn manifest_path_for(source: &Path) -> PathBuf {
    platform::path_with_suffix(source, ".sync.dust")
}

/// Path of the salt sidecar stored next to a manifest.
pub fn salt_path_for(manifest: &Path) -> PathBuf {
    platform::path_with_suffix(manifest, ".salt")
}

/// Path of the advisory lock file guarding a manifest.
pub fn lock_path_for(manifest: &Path) -> PathBuf {
    platform::path_with_suffix(manifest, ".lock")
}

/// Loads and saves one manifest document at a fixed path.
pub struct ManifestStore {
    path: PathBuf,
}

/// Older single-version layout: chunk descriptors embedded in the document
/// instead of referenced through the pool.
#[derive(Deserialize)]
struct LegacyManifest {
    #[serde(default)]
    filename: Option<String>,
    file_hash: String,
    total_size: u64,
    chunks: Vec<LegacyChunk>,
}

#[derive(Deserialize)]
struct LegacyChunk {
    part: u32,
    hash: CipherHash,
    plain_hash: PlainHash,
    url: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ManifestDoc {
    Versioned(Manifest),
    Legacy(LegacyManifest),
}

impl ManifestStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load and validate the manifest, upgrading the legacy single-version
    /// layout in memory. The upgrade is idempotent: loading an already
    /// versioned document leaves it untouched.
    pub fn load(&self) -> Result<Manifest> {
        let raw = std::fs::read(&self.path)?;
        let doc: ManifestDoc = serde_json::from_slice(&raw).map_err(|e| {
            DustError::ManifestCorrupt(format!("{}: {e}", self.path.display()))
        })?;
        let manifest = match doc {
            ManifestDoc::Versioned(mut manifest) => {
                manifest.kind = ManifestKind::Versioned;
                manifest
            }
            ManifestDoc::Legacy(legacy) => {
                info!(path = %self.path.display(), "upgrading single-version manifest layout");
                self.lift_legacy(legacy)?
            }
        };
        manifest.validate()?;
        Ok(manifest)
    }

    /// Load for a sync: a missing document yields a fresh manifest, and a
    /// corrupt one is abandoned with a warning rather than blocking backups.
    pub fn load_or_new(&self, filename: &str) -> Result<Manifest> {
        if !self.exists() {
            return Ok(Manifest::new(filename));
        }
        match self.load() {
            Ok(manifest) => Ok(manifest),
            Err(DustError::ManifestCorrupt(msg)) => {
                warn!("manifest unreadable ({msg}); starting a fresh manifest");
                Ok(Manifest::new(filename))
            }
            Err(e) => Err(e),
        }
    }

    /// Persist the whole document atomically (write temp, fsync, rename).
    pub fn save(&self, manifest: &Manifest) -> Result<()> {
        let json = serde_json::to_vec_pretty(manifest)?;
        platform::atomic_write(&self.path, &json)?;
        Ok(())
    }

    fn lift_legacy(&self, legacy: LegacyManifest) -> Result<Manifest> {
        let filename = legacy
            .filename
            .unwrap_or_else(|| self.fallback_filename());

        let mut manifest = Manifest::new(&filename);
        manifest.kind = ManifestKind::SingleVersion;

        let mut parts = legacy.chunks;
        parts.sort_by_key(|c| c.part);

        let mut chunks = Vec::with_capacity(parts.len());
        for chunk in parts {
            manifest
                .pool_insert(
                    chunk.plain_hash,
                    PoolEntry {
                        hash: chunk.hash,
                        url: chunk.url,
                    },
                )
                .map_err(|_| {
                    DustError::ManifestCorrupt(format!(
                        "legacy manifest part {} conflicts with an earlier part",
                        chunk.part
                    ))
                })?;
            chunks.push(Some(chunk.plain_hash));
        }

        manifest.versions.push(Version {
            version: 1,
            timestamp: Utc::now(),
            file_hash: legacy.file_hash,
            total_size: legacy.total_size,
            status: VersionStatus::Completed,
            chunks,
        });
        Ok(manifest)
    }

    /// Tracked filename recovered from the manifest path when the legacy
    /// document does not carry one.
    fn fallback_filename(&self) -> String {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.strip_suffix(".sync.dust")
            .or_else(|| name.strip_suffix(".dust"))
            .unwrap_or(&name)
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::VersionQuery;

    fn legacy_json() -> String {
        let ph_a = PlainHash::compute(b"part zero").to_hex();
        let ph_b = PlainHash::compute(b"part one").to_hex();
        let ch_a = CipherHash::compute(b"envelope zero").to_hex();
        let ch_b = CipherHash::compute(b"envelope one").to_hex();
        format!(
            r#"{{
              "total_size": 2048,
              "file_hash": "aabb",
              "chunks": [
                {{"part": 1, "hash": "{ch_b}", "plain_hash": "{ph_b}", "url": "mem://blob/1"}},
                {{"part": 0, "hash": "{ch_a}", "plain_hash": "{ph_a}", "url": "mem://blob/0"}}
              ]
            }}"#
        )
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path().join("notes.txt.sync.dust"));

        let mut manifest = Manifest::new("notes.txt");
        let ph = PlainHash::compute(b"chunk");
        manifest
            .pool_insert(
                ph,
                PoolEntry {
                    hash: CipherHash::compute(b"envelope"),
                    url: "mem://blob/0".into(),
                },
            )
            .unwrap();
        let idx = manifest.open_pending("facade", 5);
        manifest.versions[idx].set_chunk(0, ph);
        manifest.versions[idx].status = VersionStatus::Completed;

        store.save(&manifest).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.filename, "notes.txt");
        assert_eq!(loaded.pool.len(), 1);
        assert_eq!(loaded.versions.len(), 1);
        assert_eq!(loaded.versions[0].chunks, vec![Some(ph)]);
        assert_eq!(loaded.kind, ManifestKind::Versioned);
    }

    #[test]
    fn save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.sync.dust");
        let store = ManifestStore::new(&path);
        store.save(&Manifest::new("a")).unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn legacy_layout_is_lifted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt.dust");
        std::fs::write(&path, legacy_json()).unwrap();

        let store = ManifestStore::new(&path);
        let manifest = store.load().unwrap();

        assert_eq!(manifest.kind, ManifestKind::SingleVersion);
        assert_eq!(manifest.filename, "notes.txt");
        assert_eq!(manifest.pool.len(), 2);

        let version = manifest.resolve_version(VersionQuery::Latest).unwrap();
        assert_eq!(version.total_size, 2048);
        // Parts reordered by index: part 0 first.
        assert_eq!(
            version.chunks[0],
            Some(PlainHash::compute(b"part zero"))
        );
        assert_eq!(version.chunks[1], Some(PlainHash::compute(b"part one")));

        // Idempotent: loading again yields the same structure.
        let again = store.load().unwrap();
        assert_eq!(again.pool, manifest.pool);
        assert_eq!(again.versions[0].chunks, manifest.versions[0].chunks);
    }

    #[test]
    fn corrupt_manifest_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.sync.dust");
        std::fs::write(&path, b"{not json").unwrap();

        let store = ManifestStore::new(&path);
        assert!(matches!(store.load(), Err(DustError::ManifestCorrupt(_))));

        // A sync falls back to a fresh manifest instead of failing.
        let fresh = store.load_or_new("a").unwrap();
        assert!(fresh.versions.is_empty());
    }

    #[test]
    fn path_helpers_compose() {
        let manifest = manifest_path_for(Path::new("/data/report.pdf"));
        assert_eq!(manifest, PathBuf::from("/data/report.pdf.sync.dust"));
        assert_eq!(
            salt_path_for(&manifest),
            PathBuf::from("/data/report.pdf.sync.dust.salt")
        );
        assert_eq!(
            lock_path_for(&manifest),
            PathBuf::from("/data/report.pdf.sync.dust.lock")
        );
    }
}
