use crate::error::{DustError, Result};

/// Default maximum chunk size in KiB. Chosen so that envelopes
/// (plaintext + 28 bytes of nonce/tag) stay under the remote's 100 KiB
/// free-tier threshold.
pub const DEFAULT_MAX_CHUNK_KB: u32 = 90;

/// Content-defined chunking parameters. Lengths of emitted chunks lie in
/// `[min_size, max_size]`, except the final chunk of an input, which may be
/// shorter than `min_size`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkerConfig {
    pub min_size: usize,
    pub avg_size: usize,
    pub max_size: usize,
}

impl ChunkerConfig {
    /// Derive the chunking parameters from a maximum chunk size in KiB:
    /// `max = kb * 1024`, `avg = max / 2`, `min = avg / 4`.
    pub fn from_max_kb(kb: u32) -> Result<Self> {
        if kb == 0 {
            return Err(DustError::Config("chunk size must be at least 1 KiB".into()));
        }
        let max_size = kb as usize * 1024;
        let avg_size = max_size / 2;
        let min_size = avg_size / 4;
        let config = Self {
            min_size,
            avg_size,
            max_size,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_size == 0 {
            return Err(DustError::Config("min_size must be non-zero".into()));
        }
        if self.avg_size < 2 {
            return Err(DustError::Config("avg_size must be at least 2".into()));
        }
        if self.min_size > self.avg_size || self.avg_size > self.max_size {
            return Err(DustError::Config(format!(
                "chunker sizes must satisfy min <= avg <= max (got {}/{}/{})",
                self.min_size, self.avg_size, self.max_size
            )));
        }
        Ok(())
    }

    /// The two boundary masks derived from `avg_size`: the stricter mask used
    /// below the average target and the looser mask used above it.
    pub(crate) fn masks(&self) -> (u64, u64) {
        let bits = self.avg_size.ilog2();
        let mask_s = (1u64 << (bits + 1)) - 1;
        let mask_l = (1u64 << (bits - 1)) - 1;
        (mask_s, mask_l)
    }
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        // Derived from DEFAULT_MAX_CHUNK_KB; kept literal so the defaults are
        // visible at a glance.
        Self {
            min_size: 11_520,
            avg_size: 46_080,
            max_size: 92_160,
        }
    }
}

/// Retry policy for remote put/get operations.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Backoff base; the wait before retry `k` is `base * k` plus jitter.
    pub base_delay_ms: u64,
    /// Upper bound (exclusive) of the uniform jitter added to each wait.
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            jitter_ms: 500,
        }
    }
}
