use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::{DustError, Result};

/// Retry a remote operation on transient errors.
///
/// Only [`DustError::RemoteTransient`] is retried; anything else surfaces
/// immediately. Before retry `k` the caller sleeps `base_delay_ms * k` plus
/// uniform jitter, and an exhausted budget surfaces as a fatal
/// [`DustError::Remote`].
pub fn with_retry<T>(
    config: &RetryConfig,
    op_name: &str,
    f: impl Fn() -> Result<T>,
) -> Result<T> {
    let mut last_msg = String::new();

    for attempt in 0..config.max_attempts.max(1) {
        if attempt > 0 {
            let jitter = rand::random::<u64>() % config.jitter_ms.max(1);
            let delay = config.base_delay_ms * attempt as u64 + jitter;
            std::thread::sleep(Duration::from_millis(delay));
        }
        match f() {
            Ok(value) => return Ok(value),
            Err(DustError::RemoteTransient(msg)) => {
                tracing::warn!(
                    "{op_name}: transient error (attempt {}/{}), retrying: {msg}",
                    attempt + 1,
                    config.max_attempts,
                );
                last_msg = msg;
            }
            Err(e) => return Err(e),
        }
    }

    Err(DustError::Remote(format!(
        "{op_name}: giving up after {} attempts: {last_msg}",
        config.max_attempts
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
            jitter_ms: 1,
        }
    }

    #[test]
    fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_config(), "put", || {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(DustError::RemoteTransient("flaky".into()))
            } else {
                Ok(7u32)
            }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn exhaustion_becomes_fatal() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&fast_config(), "put", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DustError::RemoteTransient("still down".into()))
        });
        assert!(matches!(result, Err(DustError::Remote(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&fast_config(), "put", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DustError::Remote("rejected".into()))
        });
        assert!(matches!(result, Err(DustError::Remote(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1, "no retry on fatal errors");
    }
}
