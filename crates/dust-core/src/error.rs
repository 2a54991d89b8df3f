use thiserror::Error;

use crate::digest::PlainHash;

pub type Result<T> = std::result::Result<T, DustError>;

#[derive(Debug, Error)]
pub enum DustError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("key derivation error: {0}")]
    KeyDerivation(String),

    #[error("malformed envelope: too short to hold nonce and auth tag")]
    BadEnvelope,

    #[error("decryption failed: wrong passphrase or corrupted data")]
    AuthFailure,

    #[error("transient remote error: {0}")]
    RemoteTransient(String),

    #[error("remote store error: {0}")]
    Remote(String),

    #[error("integrity check failed: {0}")]
    IntegrityFatal(String),

    #[error("manifest corrupt: {0}")]
    ManifestCorrupt(String),

    #[error("pool conflict: chunk {0} maps to two different envelopes")]
    PoolConflict(PlainHash),

    #[error("manifest is locked by another process ({0})")]
    Locked(String),

    #[error("version not found: {0}")]
    VersionNotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("operation interrupted")]
    Interrupted,

    #[error("{0}")]
    Other(String),
}
