//! The reconstructor: fetch, verify, decrypt, and stream chunks back into a
//! local file.
//!
//! Integrity is checked at three levels, in increasing severity: the
//! ciphertext fingerprint (advisory — the AEAD tag is authoritative), the
//! AEAD tag (fatal), and the plaintext fingerprint against the manifest
//! (fatal — indicates manifest tampering). The finished file's SHA-256 is
//! compared against the version's recorded hash as a final cross-check.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::config::RetryConfig;
use crate::crypto::{self, envelope, SecretKey};
use crate::digest::{CipherHash, PlainHash};
use crate::error::{DustError, Result};
use crate::manifest::store::{self, ManifestStore};
use crate::manifest::{ManifestKind, PoolEntry, VersionQuery};
use crate::platform;
use crate::remote::retry::with_retry;
use crate::remote::RemoteStore;

use super::concurrency::SlotBudget;

pub const DEFAULT_RESTORE_CONCURRENCY: usize = 5;

pub struct RestoreRequest<'a> {
    pub manifest: &'a Path,
    pub version: VersionQuery,
    pub passphrase: &'a str,
    /// Directory for the restored file; defaults to the manifest's directory.
    pub output_dir: Option<&'a Path>,
    pub concurrency: usize,
    pub retry: RetryConfig,
    /// Checked between chunks; set by a driving server on client disconnect.
    pub abort: Option<&'a AtomicBool>,
}

impl<'a> RestoreRequest<'a> {
    pub fn new(manifest: &'a Path, passphrase: &'a str) -> Self {
        Self {
            manifest,
            version: VersionQuery::Latest,
            passphrase,
            output_dir: None,
            concurrency: DEFAULT_RESTORE_CONCURRENCY,
            retry: RetryConfig::default(),
            abort: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    pub output: PathBuf,
    pub version: u32,
    pub chunks: usize,
    pub bytes_written: u64,
    /// False when the reconstructed bytes hash differently from the recorded
    /// file hash. The file is kept either way.
    pub file_hash_verified: bool,
}

pub fn run(req: &RestoreRequest<'_>, remote: &dyn RemoteStore) -> Result<RestoreOutcome> {
    if req.passphrase.is_empty() {
        return Err(DustError::Config("passphrase must not be empty".into()));
    }
    if req.concurrency == 0 {
        return Err(DustError::Config("restore concurrency must be at least 1".into()));
    }

    let manifest_store = ManifestStore::new(req.manifest);
    let manifest = manifest_store.load()?;
    let version = manifest.resolve_version(req.version)?;
    let sequence = version.chunk_sequence()?;

    // Resolve every pool entry up front so a broken reference fails before
    // any network traffic.
    let mut chunk_plan: Vec<(PlainHash, PoolEntry)> = Vec::with_capacity(sequence.len());
    for ph in &sequence {
        let entry = manifest.pool_lookup(ph).ok_or_else(|| {
            DustError::ManifestCorrupt(format!("chunk {ph} is not in the pool"))
        })?;
        chunk_plan.push((*ph, entry.clone()));
    }

    let salt = crypto::load_salt(&store::salt_path_for(req.manifest))?;
    let key = crypto::derive_key(req.passphrase, &salt)?;

    let output_name = match manifest.kind {
        ManifestKind::SingleVersion => format!("restored_{}", manifest.filename),
        ManifestKind::Versioned => {
            format!("restored_v{}_{}", version.version, manifest.filename)
        }
    };
    let output_dir = match req.output_dir {
        Some(dir) => dir,
        None => parent_dir(req.manifest),
    };
    let final_path = output_dir.join(&output_name);
    let temp_path = platform::path_with_suffix(&final_path, ".partial");

    info!(
        version = version.version,
        chunks = chunk_plan.len(),
        output = %final_path.display(),
        "restoring"
    );

    let sequential = matches!(manifest.kind, ManifestKind::SingleVersion) || req.concurrency == 1;
    let result = if sequential {
        restore_sequential(&chunk_plan, &key, remote, req, &temp_path)
    } else {
        restore_parallel(&chunk_plan, &key, remote, req, &temp_path)
    };

    let (bytes_written, actual_hash) = match result {
        Ok(done) => done,
        Err(e) => {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e);
        }
    };

    let file_hash_verified = actual_hash == version.file_hash;
    if !file_hash_verified {
        error!(
            expected = %version.file_hash,
            actual = %actual_hash,
            "restored file hash does not match the recorded hash; keeping the file"
        );
    }
    std::fs::rename(&temp_path, &final_path)?;

    info!(
        bytes = bytes_written,
        verified = file_hash_verified,
        "restore complete"
    );
    Ok(RestoreOutcome {
        output: final_path,
        version: version.version,
        chunks: chunk_plan.len(),
        bytes_written,
        file_hash_verified,
    })
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

fn aborted(req: &RestoreRequest<'_>) -> bool {
    req.abort.is_some_and(|flag| flag.load(Ordering::Relaxed))
}

/// Download, verify, and decrypt one chunk.
fn fetch_chunk(
    ph: &PlainHash,
    entry: &PoolEntry,
    key: &SecretKey,
    remote: &dyn RemoteStore,
    retry: &RetryConfig,
) -> Result<Vec<u8>> {
    let blob = with_retry(retry, "get", || remote.get(&entry.url))?;

    if CipherHash::compute(&blob) != entry.hash {
        warn!(
            chunk = %ph,
            url = %entry.url,
            "ciphertext fingerprint mismatch; proceeding, the AEAD tag is authoritative"
        );
    }

    let plaintext = envelope::open(key, &blob)?;

    if PlainHash::compute(&plaintext) != *ph {
        return Err(DustError::IntegrityFatal(format!(
            "chunk {ph}: decrypted payload does not match its fingerprint"
        )));
    }
    Ok(plaintext)
}

// ---------------------------------------------------------------------------
// Strict-streaming mode: one chunk in memory at a time
// ---------------------------------------------------------------------------

fn restore_sequential(
    chunk_plan: &[(PlainHash, PoolEntry)],
    key: &SecretKey,
    remote: &dyn RemoteStore,
    req: &RestoreRequest<'_>,
    temp_path: &Path,
) -> Result<(u64, String)> {
    let mut out = BufWriter::new(File::create(temp_path)?);
    let mut hasher = Sha256::new();
    let mut written: u64 = 0;

    for (ph, entry) in chunk_plan {
        if aborted(req) {
            return Err(DustError::Interrupted);
        }
        let plaintext = fetch_chunk(ph, entry, key, remote, &req.retry)?;
        hasher.update(&plaintext);
        out.write_all(&plaintext)?;
        written += plaintext.len() as u64;
    }

    out.flush()?;
    out.get_ref().sync_all()?;
    Ok((written, hex::encode(hasher.finalize())))
}

// ---------------------------------------------------------------------------
// Parallel mode: bounded fetch workers feeding an in-order writer
// ---------------------------------------------------------------------------

/// Concurrency buys download throughput; the slot budget plus the reorder
/// buffer keep transient memory at `O(concurrency × max_chunk_size)` instead
/// of `O(file size)`.
fn restore_parallel(
    chunk_plan: &[(PlainHash, PoolEntry)],
    key: &SecretKey,
    remote: &dyn RemoteStore,
    req: &RestoreRequest<'_>,
    temp_path: &Path,
) -> Result<(u64, String)> {
    let budget = SlotBudget::new(req.concurrency);
    let shutdown = AtomicBool::new(false);

    let mut out = BufWriter::new(File::create(temp_path)?);
    let mut hasher = Sha256::new();
    let mut written: u64 = 0;
    let mut next_index = 0usize;
    let mut first_error: Option<DustError> = None;

    std::thread::scope(|s| {
        let (work_tx, work_rx) = crossbeam_channel::bounded::<usize>(req.concurrency);
        let (result_tx, result_rx) =
            crossbeam_channel::bounded::<(usize, Result<Vec<u8>>)>(req.concurrency);

        let budget_ref = &budget;
        let shutdown_ref = &shutdown;
        let retry = &req.retry;

        // Feeder: hands out chunk indexes, gated by the slot budget.
        s.spawn(move || {
            for index in 0..chunk_plan.len() {
                if shutdown_ref.load(Ordering::Relaxed) {
                    return;
                }
                if budget_ref.acquire().is_err() {
                    return;
                }
                if work_tx.send(index).is_err() {
                    budget_ref.release();
                    return;
                }
            }
        });

        // Fetch workers.
        for _ in 0..req.concurrency {
            let rx = work_rx.clone();
            let tx = result_tx.clone();
            s.spawn(move || {
                for index in rx {
                    let (ph, entry) = &chunk_plan[index];
                    let result = fetch_chunk(ph, entry, key, remote, retry);
                    if tx.send((index, result)).is_err() {
                        return;
                    }
                }
            });
        }
        drop(work_rx);
        drop(result_tx);

        // Writer: reorders completions and appends strictly by index.
        let mut pending: BTreeMap<usize, Vec<u8>> = BTreeMap::new();

        'recv: for (index, result) in result_rx {
            if aborted(req) {
                first_error.get_or_insert(DustError::Interrupted);
                shutdown.store(true, Ordering::Relaxed);
                budget.poison();
                break 'recv;
            }
            match result {
                Ok(plaintext) => {
                    pending.insert(index, plaintext);
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                    shutdown.store(true, Ordering::Relaxed);
                    budget.poison();
                    break 'recv;
                }
            }

            while let Some(plaintext) = pending.remove(&next_index) {
                hasher.update(&plaintext);
                if let Err(e) = out.write_all(&plaintext) {
                    first_error.get_or_insert(e.into());
                    shutdown.store(true, Ordering::Relaxed);
                    budget.poison();
                    break 'recv;
                }
                written += plaintext.len() as u64;
                next_index += 1;
                budget.release();
            }
        }
        // The receiver drops with the loop, unblocking any worker still
        // sending; the scope then joins everything.
    });

    if let Some(error) = first_error {
        return Err(error);
    }
    if next_index != chunk_plan.len() {
        return Err(DustError::Other(format!(
            "restore pipeline stopped after {next_index} of {} chunks",
            chunk_plan.len()
        )));
    }

    out.flush()?;
    out.get_ref().sync_all()?;
    Ok((written, hex::encode(hasher.finalize())))
}
