//! The uploader: read → chunk → dedup-check → encrypt → upload, with bounded
//! concurrency, save-after-every-fragment persistence, and crash-safe resume.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use crate::chunker;
use crate::config::{ChunkerConfig, RetryConfig};
use crate::crypto::{self, envelope, SecretKey};
use crate::digest::{self, CipherHash, PlainHash};
use crate::error::{DustError, Result};
use crate::manifest::store::{self, ManifestStore};
use crate::manifest::{lock, Manifest, PoolEntry, SyncPlan, VersionStatus};
use crate::remote::retry::with_retry;
use crate::remote::RemoteStore;

use super::concurrency::SlotBudget;

/// Envelopes above this size may be billed by the remote; uploading them is
/// allowed but logged.
pub const ENVELOPE_ADVISORY_LIMIT: usize = 100 * 1024;

pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 3;

pub struct SyncRequest<'a> {
    pub file: &'a Path,
    pub passphrase: &'a str,
    pub chunker: ChunkerConfig,
    pub concurrency: usize,
    pub retry: RetryConfig,
}

impl<'a> SyncRequest<'a> {
    pub fn new(file: &'a Path, passphrase: &'a str) -> Self {
        Self {
            file,
            passphrase,
            chunker: ChunkerConfig::default(),
            concurrency: DEFAULT_UPLOAD_CONCURRENCY,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    pub version: u32,
    pub chunks_total: usize,
    pub chunks_uploaded: usize,
    pub chunks_deduplicated: usize,
    pub chunks_resumed: usize,
    pub bytes_uploaded: u64,
    /// True when the manifest already covered this exact file content.
    pub up_to_date: bool,
}

// ---------------------------------------------------------------------------
// Pipeline messages
// ---------------------------------------------------------------------------

/// A chunk dispatched to the upload workers. The position is captured at
/// submit time, so completion order never affects the manifest.
struct UploadJob {
    index: usize,
    ph: PlainHash,
    data: Vec<u8>,
}

enum TaskResult {
    /// Resume skip: the slot was already recorded and backed by the pool.
    AlreadyRecorded,
    /// Dedup: the fingerprint is (or is about to be) in the pool.
    Reuse { index: usize, ph: PlainHash },
    Uploaded {
        index: usize,
        ph: PlainHash,
        ch: CipherHash,
        url: String,
        bytes: u64,
    },
    Failed { error: DustError },
    ReadFailed { error: DustError },
    ReaderDone { total_chunks: usize },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(req: &SyncRequest<'_>, remote: &dyn RemoteStore) -> Result<SyncOutcome> {
    if req.passphrase.is_empty() {
        return Err(DustError::Config("passphrase must not be empty".into()));
    }
    if req.concurrency == 0 {
        return Err(DustError::Config("upload concurrency must be at least 1".into()));
    }
    req.chunker.validate()?;

    let filename = req
        .file
        .file_name()
        .ok_or_else(|| DustError::Config(format!("'{}' has no file name", req.file.display())))?
        .to_string_lossy()
        .into_owned();

    let (file_hash, total_size) = digest::sha256_file(req.file)?;
    debug!(file = %req.file.display(), size = total_size, hash = %file_hash, "hashed source file");

    let manifest_path = store::manifest_path_for(req.file);
    let _lock = lock::acquire(&manifest_path)?;
    let manifest_store = ManifestStore::new(&manifest_path);
    let mut manifest = manifest_store.load_or_new(&filename)?;

    let plan = manifest.plan_sync(&file_hash);
    if plan == SyncPlan::UpToDate {
        if let Some(latest) = manifest.latest_completed() {
            info!(version = latest.version, "file unchanged since last completed version");
            return Ok(SyncOutcome {
                version: latest.version,
                chunks_total: latest.chunks.len(),
                up_to_date: true,
                ..Default::default()
            });
        }
    }
    if plan == SyncPlan::Resume {
        info!("resuming interrupted sync into pending version");
    }

    let vidx = manifest.open_pending(&file_hash, total_size);
    manifest_store.save(&manifest)?;

    let salt = crypto::load_or_create_salt(&store::salt_path_for(&manifest_path))?;
    let key = crypto::derive_key(req.passphrase, &salt)?;

    let outcome = run_pipeline(
        req,
        remote,
        &key,
        &filename,
        &manifest_store,
        &mut manifest,
        vidx,
    )?;

    info!(
        version = outcome.version,
        chunks = outcome.chunks_total,
        uploaded = outcome.chunks_uploaded,
        deduplicated = outcome.chunks_deduplicated,
        resumed = outcome.chunks_resumed,
        bytes_uploaded = outcome.bytes_uploaded,
        "sync complete"
    );
    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Pipeline: reader → bounded workers → owning consumer
// ---------------------------------------------------------------------------

fn run_pipeline(
    req: &SyncRequest<'_>,
    remote: &dyn RemoteStore,
    key: &SecretKey,
    filename: &str,
    manifest_store: &ManifestStore,
    manifest: &mut Manifest,
    vidx: usize,
) -> Result<SyncOutcome> {
    // Read-only snapshots for the reader thread; the live manifest stays
    // exclusively with the consumer.
    let recorded: Vec<Option<PlainHash>> = manifest.versions[vidx].chunks.clone();
    let pool_snapshot: HashSet<PlainHash> = manifest.pool.keys().copied().collect();

    let shutdown = AtomicBool::new(false);
    let budget = SlotBudget::new(req.concurrency);

    let mut outcome = SyncOutcome {
        version: manifest.versions[vidx].version,
        ..Default::default()
    };
    let mut first_error: Option<DustError> = None;
    let mut reader_total: Option<usize> = None;
    // Positions waiting on a fingerprint whose upload is still in flight.
    let mut waiting: HashMap<PlainHash, Vec<usize>> = HashMap::new();

    std::thread::scope(|s| {
        let (work_tx, work_rx) = crossbeam_channel::bounded::<UploadJob>(req.concurrency);
        let (result_tx, result_rx) =
            crossbeam_channel::bounded::<TaskResult>(req.concurrency * 2);

        let shutdown_ref = &shutdown;
        let budget_ref = &budget;
        let chunker_config = &req.chunker;
        let retry = &req.retry;
        let file_path = req.file;

        // --- Reader: single sequential pass over the source file ---
        let reader_tx = result_tx.clone();
        s.spawn(move || {
            let file = match File::open(file_path) {
                Ok(f) => f,
                Err(e) => {
                    let _ = reader_tx.send(TaskResult::ReadFailed { error: e.into() });
                    return;
                }
            };
            let mut submitted: HashSet<PlainHash> = HashSet::new();
            let mut index = 0usize;

            for item in chunker::chunk_stream(BufReader::new(file), chunker_config) {
                if shutdown_ref.load(Ordering::Relaxed) {
                    return;
                }
                let chunk = match item {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = reader_tx.send(TaskResult::ReadFailed { error: e.into() });
                        return;
                    }
                };
                let ph = PlainHash::compute(&chunk.data);

                // Resume skip: position already assigned and backed by the pool.
                if let Some(Some(existing)) = recorded.get(index) {
                    if *existing == ph && pool_snapshot.contains(existing) {
                        if reader_tx.send(TaskResult::AlreadyRecorded).is_err() {
                            return;
                        }
                        index += 1;
                        continue;
                    }
                }

                // Dedup skip: known fingerprint, or one submitted earlier in
                // this run whose upload the consumer will wait for.
                if pool_snapshot.contains(&ph) || submitted.contains(&ph) {
                    if reader_tx.send(TaskResult::Reuse { index, ph }).is_err() {
                        return;
                    }
                    index += 1;
                    continue;
                }

                if budget_ref.acquire().is_err() {
                    return;
                }
                submitted.insert(ph);
                if work_tx
                    .send(UploadJob {
                        index,
                        ph,
                        data: chunk.data,
                    })
                    .is_err()
                {
                    budget_ref.release();
                    return;
                }
                index += 1;
            }

            let _ = reader_tx.send(TaskResult::ReaderDone {
                total_chunks: index,
            });
            // work_tx drops here; workers drain the queue and exit.
        });

        // --- Workers: encrypt + upload with retry ---
        for _ in 0..req.concurrency {
            let rx = work_rx.clone();
            let tx = result_tx.clone();
            s.spawn(move || {
                for job in rx {
                    let msg = match upload_chunk(&job, key, remote, retry, filename) {
                        Ok(done) => done,
                        Err(error) => TaskResult::Failed { error },
                    };
                    if tx.send(msg).is_err() {
                        return;
                    }
                }
            });
        }
        drop(work_rx);
        drop(result_tx);

        // --- Consumer: sole manifest mutator, one save per event ---
        //
        // On a hard error the reader is stopped but the channel is drained to
        // the end, so every upload that did succeed is persisted and the next
        // run resumes instead of re-uploading.
        for msg in result_rx {
            match msg {
                TaskResult::AlreadyRecorded => outcome.chunks_resumed += 1,

                TaskResult::Reuse { index, ph } => {
                    outcome.chunks_deduplicated += 1;
                    if manifest.pool.contains_key(&ph) {
                        manifest.versions[vidx].set_chunk(index, ph);
                        if let Err(e) = manifest_store.save(manifest) {
                            record_failure(&mut first_error, &shutdown, &budget, e);
                        }
                    } else {
                        waiting.entry(ph).or_default().push(index);
                    }
                }

                TaskResult::Uploaded {
                    index,
                    ph,
                    ch,
                    url,
                    bytes,
                } => {
                    budget.release();
                    match manifest.pool_insert(ph, PoolEntry { hash: ch, url }) {
                        Ok(_) => {
                            manifest.versions[vidx].set_chunk(index, ph);
                            if let Some(waiters) = waiting.remove(&ph) {
                                for position in waiters {
                                    manifest.versions[vidx].set_chunk(position, ph);
                                }
                            }
                            match manifest_store.save(manifest) {
                                Ok(()) => {
                                    outcome.chunks_uploaded += 1;
                                    outcome.bytes_uploaded += bytes;
                                }
                                Err(e) => {
                                    record_failure(&mut first_error, &shutdown, &budget, e)
                                }
                            }
                        }
                        Err(e) => record_failure(&mut first_error, &shutdown, &budget, e),
                    }
                }

                TaskResult::Failed { error } => {
                    budget.release();
                    record_failure(&mut first_error, &shutdown, &budget, error);
                }

                TaskResult::ReadFailed { error } => {
                    record_failure(&mut first_error, &shutdown, &budget, error);
                }

                TaskResult::ReaderDone { total_chunks } => {
                    reader_total = Some(total_chunks);
                }
            }
        }
    });

    if let Some(error) = first_error {
        warn!(
            version = outcome.version,
            "sync failed; version left pending for resume"
        );
        return Err(error);
    }

    let total = reader_total.ok_or_else(|| {
        DustError::Other("upload pipeline stopped before reading the whole file".into())
    })?;

    let version = &mut manifest.versions[vidx];
    version.chunks.resize(total, None);
    let unassigned = version.chunks.iter().filter(|c| c.is_none()).count();
    if unassigned > 0 {
        return Err(DustError::Other(format!(
            "{unassigned} chunk positions were never assigned"
        )));
    }
    version.status = VersionStatus::Completed;
    manifest_store.save(manifest)?;

    outcome.chunks_total = total;
    Ok(outcome)
}

fn upload_chunk(
    job: &UploadJob,
    key: &SecretKey,
    remote: &dyn RemoteStore,
    retry: &RetryConfig,
    filename: &str,
) -> Result<TaskResult> {
    let envelope = envelope::seal(key, &job.data)?;
    if envelope.len() > ENVELOPE_ADVISORY_LIMIT {
        warn!(
            chunk = %job.ph,
            size = envelope.len(),
            "encrypted chunk exceeds the 100 KiB advisory limit; the remote may charge for it"
        );
    }
    let ch = CipherHash::compute(&envelope);

    let ph_hex = job.ph.to_hex();
    let tags = [("file", filename), ("plain-hash", ph_hex.as_str())];
    let url = with_retry(retry, "put", || remote.put(&envelope, &tags))?;

    Ok(TaskResult::Uploaded {
        index: job.index,
        ph: job.ph,
        ch,
        url,
        bytes: envelope.len() as u64,
    })
}

fn record_failure(
    first_error: &mut Option<DustError>,
    shutdown: &AtomicBool,
    budget: &SlotBudget,
    error: DustError,
) {
    if first_error.is_none() {
        *first_error = Some(error);
    } else {
        warn!("additional pipeline error: {error}");
    }
    shutdown.store(true, Ordering::Relaxed);
    budget.poison();
}
