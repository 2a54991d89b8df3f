//! End-to-end scenarios over the in-memory remote: upload, dedup, resume,
//! tamper detection, and multi-version restore.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use dust_core::commands::{restore, sync};
use dust_core::config::ChunkerConfig;
use dust_core::digest::sha256_file;
use dust_core::error::DustError;
use dust_core::manifest::store::{manifest_path_for, salt_path_for, ManifestStore};
use dust_core::manifest::{lock, VersionQuery, VersionStatus};
use dust_core::remote::memory::MemoryRemote;
use dust_core::remote::RemoteStore;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Deterministic pseudo-random bytes (64-bit LCG, little-endian words).
fn lcg_bytes(len: usize, mut state: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(len + 8);
    while out.len() < len {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        out.extend_from_slice(&state.to_le_bytes());
    }
    out.truncate(len);
    out
}

fn small_chunker() -> ChunkerConfig {
    ChunkerConfig::from_max_kb(2).unwrap() // 256 / 1024 / 2048
}

fn upload(file: &Path, passphrase: &str, chunker: ChunkerConfig, remote: &dyn RemoteStore) -> dust_core::error::Result<sync::SyncOutcome> {
    let mut request = sync::SyncRequest::new(file, passphrase);
    request.chunker = chunker;
    sync::run(&request, remote)
}

fn restore_version(
    manifest: &Path,
    passphrase: &str,
    version: VersionQuery,
    remote: &dyn RemoteStore,
) -> dust_core::error::Result<restore::RestoreOutcome> {
    let mut request = restore::RestoreRequest::new(manifest, passphrase);
    request.version = version;
    restore::run(&request, remote)
}

/// Remote wrapper that fails every put after the first `allow` successes.
struct FlakyRemote<'a> {
    inner: &'a MemoryRemote,
    allow: usize,
    puts: AtomicUsize,
}

impl RemoteStore for FlakyRemote<'_> {
    fn put(&self, blob: &[u8], tags: &[(&str, &str)]) -> dust_core::error::Result<String> {
        if self.puts.fetch_add(1, Ordering::SeqCst) >= self.allow {
            return Err(DustError::Remote("injected remote fault".into()));
        }
        self.inner.put(blob, tags)
    }

    fn get(&self, url: &str) -> dust_core::error::Result<Vec<u8>> {
        self.inner.get(url)
    }
}

/// Remote wrapper that flips one byte of a chosen blob on the way back.
struct TamperRemote<'a> {
    inner: &'a MemoryRemote,
    target: Mutex<Option<String>>,
}

impl RemoteStore for TamperRemote<'_> {
    fn put(&self, blob: &[u8], tags: &[(&str, &str)]) -> dust_core::error::Result<String> {
        self.inner.put(blob, tags)
    }

    fn get(&self, url: &str) -> dust_core::error::Result<Vec<u8>> {
        let mut blob = self.inner.get(url)?;
        if self.target.lock().unwrap().as_deref() == Some(url) {
            blob[20] ^= 0x01;
        }
        Ok(blob)
    }
}

// ---------------------------------------------------------------------------
// S1: smallest possible roundtrip
// ---------------------------------------------------------------------------

#[test]
fn s1_small_file_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("hello.txt");
    std::fs::write(&file, b"hello world").unwrap();

    let remote = MemoryRemote::new();
    let chunker = ChunkerConfig {
        min_size: 4,
        avg_size: 8,
        max_size: 16,
    };
    let outcome = upload(&file, "pass", chunker, &remote).unwrap();
    assert_eq!(outcome.chunks_total, 1);
    assert_eq!(outcome.version, 1);

    let manifest_path = manifest_path_for(&file);
    let manifest = ManifestStore::new(&manifest_path).load().unwrap();
    assert_eq!(manifest.versions.len(), 1);
    assert_eq!(manifest.versions[0].chunks.len(), 1);
    assert_eq!(manifest.versions[0].status, VersionStatus::Completed);
    assert!(salt_path_for(&manifest_path).exists());

    let restored = restore_version(&manifest_path, "pass", VersionQuery::Latest, &remote).unwrap();
    assert!(restored.file_hash_verified);
    assert_eq!(
        restored.output,
        dir.path().join("restored_v1_hello.txt")
    );
    assert_eq!(std::fs::read(&restored.output).unwrap(), b"hello world");
}

// ---------------------------------------------------------------------------
// S2 / S3: deduplication across versions
// ---------------------------------------------------------------------------

#[test]
fn s2_append_adds_at_most_one_pool_entry() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("log.bin");
    let base = vec![0x41u8; 10 * 1024];
    std::fs::write(&file, &base).unwrap();

    let remote = MemoryRemote::new();
    let v1 = upload(&file, "pass", small_chunker(), &remote).unwrap();
    assert_eq!(v1.chunks_total, 5);

    let manifest_path = manifest_path_for(&file);
    let pool_after_v1 = ManifestStore::new(&manifest_path).load().unwrap().pool.len();
    // Constant bytes chunk into identical fragments: intra-file dedup.
    assert_eq!(pool_after_v1, 1);

    let mut appended = base.clone();
    appended.extend_from_slice(b"\n[TAIL]\n");
    std::fs::write(&file, &appended).unwrap();

    let v2 = upload(&file, "pass", small_chunker(), &remote).unwrap();
    assert_eq!(v2.version, 2);

    let pool_after_v2 = ManifestStore::new(&manifest_path).load().unwrap().pool.len();
    assert!(
        pool_after_v2 - pool_after_v1 <= 1,
        "append must add at most one pool entry (added {})",
        pool_after_v2 - pool_after_v1
    );
}

#[test]
fn s3_prepend_adds_bounded_pool_entries() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("log.bin");
    let base = vec![0x41u8; 10 * 1024];
    std::fs::write(&file, &base).unwrap();

    let remote = MemoryRemote::new();
    upload(&file, "pass", small_chunker(), &remote).unwrap();

    let manifest_path = manifest_path_for(&file);
    let pool_after_v1 = ManifestStore::new(&manifest_path).load().unwrap().pool.len();

    let mut shifted = vec![0x42u8; 512];
    shifted.extend_from_slice(&base);
    std::fs::write(&file, &shifted).unwrap();

    upload(&file, "pass", small_chunker(), &remote).unwrap();
    let pool_after_v2 = ManifestStore::new(&manifest_path).load().unwrap().pool.len();

    // Every absolute offset shifted, yet boundaries resync: the point of CDC.
    assert!(
        pool_after_v2 - pool_after_v1 <= 2,
        "prepend must add at most two pool entries (added {})",
        pool_after_v2 - pool_after_v1
    );
}

// ---------------------------------------------------------------------------
// S4: crash-safe resume
// ---------------------------------------------------------------------------

#[test]
fn s4_resume_after_remote_fault() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("big.bin");
    std::fs::write(&file, lcg_bytes(1024 * 1024, 41)).unwrap();

    let memory = MemoryRemote::new();
    let flaky = FlakyRemote {
        inner: &memory,
        allow: 3,
        puts: AtomicUsize::new(0),
    };

    let chunker = ChunkerConfig::from_max_kb(8).unwrap();
    let err = upload(&file, "pass", chunker.clone(), &flaky).unwrap_err();
    assert!(matches!(err, DustError::Remote(_)), "got {err:?}");

    // The interrupted version is persisted as pending, with every successful
    // upload recorded.
    let manifest_path = manifest_path_for(&file);
    let interrupted = ManifestStore::new(&manifest_path).load().unwrap();
    let pending = interrupted.versions.last().unwrap();
    assert_eq!(pending.status, VersionStatus::Pending);
    assert_eq!(pending.assigned_chunks(), 3);
    assert_eq!(memory.blob_count(), 3);

    // Second run against the healthy remote completes the version...
    let outcome = upload(&file, "pass", chunker, &memory).unwrap();
    assert!(!outcome.up_to_date);
    assert_eq!(outcome.chunks_resumed, 3);

    let finished = ManifestStore::new(&manifest_path).load().unwrap();
    assert_eq!(finished.versions.len(), 1);
    assert_eq!(finished.versions[0].status, VersionStatus::Completed);

    // ...and the total number of puts across both runs equals the chunk
    // count: nothing was uploaded twice.
    assert_eq!(memory.blob_count(), outcome.chunks_total);
    assert_eq!(finished.pool.len(), outcome.chunks_total);

    let restored =
        restore_version(&manifest_path, "pass", VersionQuery::Latest, &memory).unwrap();
    assert!(restored.file_hash_verified);
    assert_eq!(
        sha256_file(&restored.output).unwrap(),
        sha256_file(&file).unwrap()
    );
}

// ---------------------------------------------------------------------------
// S5: tamper detection
// ---------------------------------------------------------------------------

#[test]
fn s5_envelope_tamper_aborts_restore() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("doc.bin");
    std::fs::write(&file, lcg_bytes(8 * 1024, 9)).unwrap();

    let memory = MemoryRemote::new();
    let tamper = TamperRemote {
        inner: &memory,
        target: Mutex::new(None),
    };

    upload(&file, "pass", small_chunker(), &tamper).unwrap();

    let manifest_path = manifest_path_for(&file);
    let manifest = ManifestStore::new(&manifest_path).load().unwrap();
    let first_ph = manifest.versions[0].chunks[0].unwrap();
    let url = manifest.pool[&first_ph].url.clone();
    *tamper.target.lock().unwrap() = Some(url);

    let err = restore_version(&manifest_path, "pass", VersionQuery::Latest, &tamper).unwrap_err();
    assert!(matches!(err, DustError::AuthFailure), "got {err:?}");

    let final_path = dir.path().join("restored_v1_doc.bin");
    assert!(!final_path.exists(), "no output on failed restore");
    assert!(
        std::fs::read_dir(dir.path())
            .unwrap()
            .all(|e| !e.unwrap().file_name().to_string_lossy().ends_with(".partial")),
        "no partial temp file left behind"
    );
}

#[test]
fn swapped_manifest_chunk_fails_plaintext_check() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("doc.bin");
    std::fs::write(&file, lcg_bytes(16 * 1024, 33)).unwrap();

    let remote = MemoryRemote::new();
    let outcome = upload(&file, "pass", small_chunker(), &remote).unwrap();
    assert!(outcome.chunks_total >= 2);

    // Point position 0 at a different (valid) pool entry.
    let manifest_path = manifest_path_for(&file);
    let store = ManifestStore::new(&manifest_path);
    let mut manifest = store.load().unwrap();
    let last = *manifest.versions[0].chunks.last().unwrap();
    manifest.versions[0].chunks[0] = last;
    store.save(&manifest).unwrap();

    let err = restore_version(&manifest_path, "pass", VersionQuery::Latest, &remote).unwrap_err();
    assert!(matches!(err, DustError::IntegrityFatal(_)), "got {err:?}");
}

// ---------------------------------------------------------------------------
// S6: rollback restore
// ---------------------------------------------------------------------------

#[test]
fn s6_restore_prior_version() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("notes.md");
    let v1_content = lcg_bytes(20 * 1024, 1);
    let v2_content = lcg_bytes(20 * 1024, 2);

    let remote = MemoryRemote::new();
    std::fs::write(&file, &v1_content).unwrap();
    upload(&file, "pass", small_chunker(), &remote).unwrap();

    std::fs::write(&file, &v2_content).unwrap();
    upload(&file, "pass", small_chunker(), &remote).unwrap();

    let manifest_path = manifest_path_for(&file);

    let old = restore_version(&manifest_path, "pass", VersionQuery::Number(1), &remote).unwrap();
    assert_eq!(old.output, dir.path().join("restored_v1_notes.md"));
    assert_eq!(std::fs::read(&old.output).unwrap(), v1_content);

    let new = restore_version(&manifest_path, "pass", VersionQuery::Latest, &remote).unwrap();
    assert_eq!(new.version, 2);
    assert_eq!(std::fs::read(&new.output).unwrap(), v2_content);
}

// ---------------------------------------------------------------------------
// Further end-to-end properties
// ---------------------------------------------------------------------------

#[test]
fn empty_file_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("empty.bin");
    std::fs::write(&file, b"").unwrap();

    let remote = MemoryRemote::new();
    let outcome = upload(&file, "pass", small_chunker(), &remote).unwrap();
    assert_eq!(outcome.chunks_total, 0);
    assert_eq!(remote.blob_count(), 0);

    let manifest_path = manifest_path_for(&file);
    let restored = restore_version(&manifest_path, "pass", VersionQuery::Latest, &remote).unwrap();
    assert!(restored.file_hash_verified);
    assert_eq!(std::fs::read(&restored.output).unwrap(), b"");
}

#[test]
fn unchanged_file_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("same.bin");
    std::fs::write(&file, lcg_bytes(32 * 1024, 5)).unwrap();

    let remote = MemoryRemote::new();
    let first = upload(&file, "pass", small_chunker(), &remote).unwrap();
    assert!(!first.up_to_date);
    let puts_after_first = remote.blob_count();

    let second = upload(&file, "pass", small_chunker(), &remote).unwrap();
    assert!(second.up_to_date);
    assert_eq!(second.version, first.version);
    assert_eq!(remote.blob_count(), puts_after_first, "no-op uploads nothing");

    let manifest = ManifestStore::new(manifest_path_for(&file)).load().unwrap();
    assert_eq!(manifest.versions.len(), 1);
}

#[test]
fn wrong_passphrase_fails_authentication() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("secret.bin");
    std::fs::write(&file, lcg_bytes(4 * 1024, 6)).unwrap();

    let remote = MemoryRemote::new();
    upload(&file, "correct", small_chunker(), &remote).unwrap();

    let err = restore_version(
        &manifest_path_for(&file),
        "incorrect",
        VersionQuery::Latest,
        &remote,
    )
    .unwrap_err();
    assert!(matches!(err, DustError::AuthFailure), "got {err:?}");
}

#[test]
fn restore_replaces_existing_output() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("doc.txt");
    let content = lcg_bytes(6 * 1024, 44);
    std::fs::write(&file, &content).unwrap();

    let remote = MemoryRemote::new();
    upload(&file, "pass", small_chunker(), &remote).unwrap();

    let final_path = dir.path().join("restored_v1_doc.txt");
    std::fs::write(&final_path, b"stale leftovers").unwrap();

    restore_version(&manifest_path_for(&file), "pass", VersionQuery::Latest, &remote).unwrap();
    assert_eq!(std::fs::read(&final_path).unwrap(), content);
}

#[test]
fn abort_flag_stops_restore() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("doc.bin");
    std::fs::write(&file, lcg_bytes(32 * 1024, 21)).unwrap();

    let remote = MemoryRemote::new();
    upload(&file, "pass", small_chunker(), &remote).unwrap();

    let abort = AtomicBool::new(true);
    let manifest_path = manifest_path_for(&file);
    let mut request = restore::RestoreRequest::new(&manifest_path, "pass");
    request.abort = Some(&abort);

    let err = restore::run(&request, &remote).unwrap_err();
    assert!(matches!(err, DustError::Interrupted), "got {err:?}");
    assert!(!dir.path().join("restored_v1_doc.bin").exists());
}

#[test]
fn sync_respects_manifest_lock() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("doc.bin");
    std::fs::write(&file, b"contents").unwrap();

    let _guard = lock::acquire(&manifest_path_for(&file)).unwrap();

    let remote = MemoryRemote::new();
    let err = upload(&file, "pass", small_chunker(), &remote).unwrap_err();
    assert!(matches!(err, DustError::Locked(_)), "got {err:?}");
}

#[test]
fn legacy_single_version_manifest_restores() {
    use dust_core::crypto;
    use dust_core::digest::{sha256_hex, CipherHash, PlainHash};

    let dir = tempfile::tempdir().unwrap();
    let remote = MemoryRemote::new();

    // Build a legacy-layout manifest by hand, the way the old single-version
    // tool wrote them: embedded chunk descriptors, no pool, no versions.
    let manifest_path = dir.path().join("report.pdf.dust");
    let salt = crypto::load_or_create_salt(&salt_path_for(&manifest_path)).unwrap();
    let key = crypto::derive_key("pass", &salt).unwrap();

    let parts: [&[u8]; 2] = [b"first part of the file, ", b"second part of the file"];
    let mut full = Vec::new();
    let mut chunk_docs = Vec::new();
    for (i, part) in parts.iter().enumerate() {
        full.extend_from_slice(part);
        let envelope = crypto::envelope::seal(&key, part).unwrap();
        let url = remote.put(&envelope, &[]).unwrap();
        chunk_docs.push(format!(
            r#"{{"part": {i}, "hash": "{}", "plain_hash": "{}", "url": "{url}"}}"#,
            CipherHash::compute(&envelope).to_hex(),
            PlainHash::compute(part).to_hex(),
        ));
    }
    let doc = format!(
        r#"{{"filename": "report.pdf", "total_size": {}, "file_hash": "{}", "chunks": [{}]}}"#,
        full.len(),
        sha256_hex(&full),
        chunk_docs.join(", "),
    );
    std::fs::write(&manifest_path, doc).unwrap();

    let restored =
        restore_version(&manifest_path, "pass", VersionQuery::Latest, &remote).unwrap();
    assert!(restored.file_hash_verified);
    // Single-version manifests restore without a version tag in the name.
    assert_eq!(restored.output, dir.path().join("restored_report.pdf"));
    assert_eq!(std::fs::read(&restored.output).unwrap(), full);
}

#[test]
fn restore_of_pending_version_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("doc.bin");
    std::fs::write(&file, lcg_bytes(64 * 1024, 77)).unwrap();

    let memory = MemoryRemote::new();
    let flaky = FlakyRemote {
        inner: &memory,
        allow: 1,
        puts: AtomicUsize::new(0),
    };
    upload(&file, "pass", small_chunker(), &flaky).unwrap_err();

    let manifest_path = manifest_path_for(&file);
    let err =
        restore_version(&manifest_path, "pass", VersionQuery::Latest, &memory).unwrap_err();
    assert!(matches!(err, DustError::VersionNotFound(_)), "got {err:?}");
}
