//! In-memory remote store. Backs the integration tests and offline dry runs
//! with the same append-only, immutable semantics as a real gateway.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::RemoteStore;
use crate::error::{DustError, Result};

#[derive(Default)]
pub struct MemoryRemote {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    next_id: AtomicU64,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs. Every successful `put` stores a new blob, so
    /// this doubles as a successful-put counter.
    pub fn blob_count(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }

    pub fn total_bytes(&self) -> usize {
        self.blobs.lock().unwrap().values().map(Vec::len).sum()
    }
}

impl RemoteStore for MemoryRemote {
    fn put(&self, blob: &[u8], _tags: &[(&str, &str)]) -> Result<String> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let url = format!("mem://blob/{id:016x}");
        self.blobs
            .lock()
            .unwrap()
            .insert(url.clone(), blob.to_vec());
        Ok(url)
    }

    fn get(&self, url: &str) -> Result<Vec<u8>> {
        self.blobs
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| DustError::Remote(format!("object not found: {url}")))
    }
}
