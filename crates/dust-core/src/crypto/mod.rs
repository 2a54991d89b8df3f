pub mod envelope;

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::info;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{DustError, Result};
use crate::platform;

pub const SALT_LEN: usize = 32;
pub const KEY_LEN: usize = 32;

// scrypt parameters: N = 16384, r = 8, p = 1, 128 bytes of derived material.
// The first 32 bytes become the AEAD key.
const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;
const SCRYPT_DK_LEN: usize = 128;

/// The AEAD key derived from passphrase + salt. Never persisted;
/// re-derived on every run and zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretKey {
    bytes: [u8; KEY_LEN],
}

impl SecretKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

/// Derive the encryption key from a passphrase and the persisted salt.
pub fn derive_key(passphrase: &str, salt: &[u8; SALT_LEN]) -> Result<SecretKey> {
    if passphrase.is_empty() {
        return Err(DustError::Config("passphrase must not be empty".into()));
    }

    let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P)
        .map_err(|e| DustError::KeyDerivation(format!("scrypt params: {e}")))?;
    let mut derived = Zeroizing::new([0u8; SCRYPT_DK_LEN]);
    scrypt::scrypt(passphrase.as_bytes(), salt, &params, derived.as_mut_slice())
        .map_err(|e| DustError::KeyDerivation(format!("scrypt: {e}")))?;

    let mut bytes = [0u8; KEY_LEN];
    bytes.copy_from_slice(&derived[..KEY_LEN]);
    Ok(SecretKey { bytes })
}

pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Sidecar document stored next to the manifest. Losing it is unrecoverable.
#[derive(Serialize, Deserialize)]
struct SaltFile {
    salt: String,
}

pub fn load_salt(path: &Path) -> Result<[u8; SALT_LEN]> {
    let raw = std::fs::read(path).map_err(|e| {
        DustError::Config(format!(
            "cannot read salt sidecar '{}': {e}",
            path.display()
        ))
    })?;
    let doc: SaltFile = serde_json::from_slice(&raw)
        .map_err(|e| DustError::Config(format!("malformed salt sidecar: {e}")))?;
    let bytes = BASE64
        .decode(doc.salt.trim())
        .map_err(|e| DustError::Config(format!("malformed salt sidecar: {e}")))?;
    if bytes.len() != SALT_LEN {
        return Err(DustError::Config(format!(
            "salt must be {SALT_LEN} bytes, sidecar holds {}",
            bytes.len()
        )));
    }
    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&bytes);
    Ok(salt)
}

pub fn save_salt(path: &Path, salt: &[u8; SALT_LEN]) -> Result<()> {
    let doc = SaltFile {
        salt: BASE64.encode(salt),
    };
    let json = serde_json::to_vec_pretty(&doc)?;
    platform::atomic_write(path, &json)?;
    Ok(())
}

/// Load the salt sidecar, generating and persisting a fresh one on first use.
pub fn load_or_create_salt(path: &Path) -> Result<[u8; SALT_LEN]> {
    if path.exists() {
        return load_salt(path);
    }
    let salt = generate_salt();
    save_salt(path, &salt)?;
    info!(path = %path.display(), "generated new salt sidecar; keep it safe, it cannot be regenerated");
    Ok(salt)
}
