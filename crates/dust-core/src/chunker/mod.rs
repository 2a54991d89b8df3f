//! Content-defined chunking with gear hashing.
//!
//! Boundaries are chosen by a rolling gear hash over a fixed 256-entry table,
//! so that a local edit shifts at most a bounded number of chunk boundaries
//! and everything downstream of the edit re-aligns. Two masks derived from
//! `avg_size` steer cut density: a strict mask below the average target and a
//! loose mask above it, with a hard cut at `max_size`.

use std::io::Read;

use crate::config::ChunkerConfig;

/// Initial LCG state for the gear table (first word of the SHA-512 IV).
/// Fixed so that every build of the engine agrees on chunk boundaries.
const GEAR_SEED: u64 = 0x6A09E667F3BCC908;
const LCG_MUL: u64 = 0x5851F42D4C957F2D;
const LCG_ADD: u64 = 0x14057B7EF767814F;

const GEAR: [u64; 256] = build_gear_table();

const fn build_gear_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut state = GEAR_SEED;
    let mut i = 0;
    while i < 256 {
        state = state.wrapping_mul(LCG_MUL).wrapping_add(LCG_ADD);
        table[i] = state;
        i += 1;
    }
    table
}

/// Length of the next chunk at the start of `data`.
///
/// `data` is a window of at most `max_size` bytes of the remaining input;
/// the returned length is in `[1, data.len()]`. The first `min_size` bytes
/// are skipped without hashing; a hash match on the byte at index `i` cuts
/// after it.
pub fn cut_point(data: &[u8], config: &ChunkerConfig) -> usize {
    if data.len() <= config.min_size {
        return data.len();
    }
    let end = data.len().min(config.max_size);
    let center = config.avg_size.min(end);
    let (mask_s, mask_l) = config.masks();

    let mut hash: u64 = 0;
    let mut i = config.min_size;
    while i < center {
        hash = (hash << 1).wrapping_add(GEAR[data[i] as usize]);
        if hash & mask_s == 0 {
            return i + 1;
        }
        i += 1;
    }
    while i < end {
        hash = (hash << 1).wrapping_add(GEAR[data[i] as usize]);
        if hash & mask_l == 0 {
            return i + 1;
        }
        i += 1;
    }
    end
}

/// Chunk a byte slice. Returns `(offset, length)` pairs whose concatenation
/// covers the whole input.
pub fn chunk_data(data: &[u8], config: &ChunkerConfig) -> Vec<(usize, usize)> {
    let mut chunks = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let length = cut_point(&data[offset..], config);
        chunks.push((offset, length));
        offset += length;
    }
    chunks
}

/// One chunk carved from a stream.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub offset: u64,
    pub data: Vec<u8>,
}

/// Lazily chunk a reader. Holds one `max_size` window of the input; each
/// step refills the window and drains one chunk, so memory stays
/// `O(max_size)` regardless of input length.
pub struct StreamChunker<R: Read> {
    reader: R,
    config: ChunkerConfig,
    window: Vec<u8>,
    offset: u64,
    eof: bool,
    failed: bool,
}

pub fn chunk_stream<R: Read>(reader: R, config: &ChunkerConfig) -> StreamChunker<R> {
    StreamChunker {
        reader,
        config: config.clone(),
        window: Vec::with_capacity(config.max_size),
        offset: 0,
        eof: false,
        failed: false,
    }
}

impl<R: Read> StreamChunker<R> {
    fn fill_window(&mut self) -> std::io::Result<()> {
        while !self.eof && self.window.len() < self.config.max_size {
            let old_len = self.window.len();
            self.window.resize(self.config.max_size, 0);
            match self.reader.read(&mut self.window[old_len..]) {
                Ok(0) => {
                    self.window.truncate(old_len);
                    self.eof = true;
                }
                Ok(n) => self.window.truncate(old_len + n),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    self.window.truncate(old_len);
                }
                Err(e) => {
                    self.window.truncate(old_len);
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

impl<R: Read> Iterator for StreamChunker<R> {
    type Item = std::io::Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Err(e) = self.fill_window() {
            self.failed = true;
            return Some(Err(e));
        }
        if self.window.is_empty() {
            return None;
        }
        let length = cut_point(&self.window, &self.config);
        let data: Vec<u8> = self.window.drain(..length).collect();
        let chunk = Chunk {
            offset: self.offset,
            data,
        };
        self.offset += length as u64;
        Some(Ok(chunk))
    }
}
