//! The on-wire form of one encrypted chunk: `nonce(12) || tag(16) || ciphertext`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;

use super::SecretKey;
use crate::error::{DustError, Result};

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
/// Fixed per-envelope overhead on top of the plaintext length.
pub const OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Encrypt one chunk under a fresh random nonce.
pub fn seal(key: &SecretKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher =
        Aes256Gcm::new_from_slice(key.as_bytes()).expect("valid 32-byte key for AES-256-GCM");

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    // aes-gcm emits ciphertext with the tag appended; the wire format wants
    // the tag up front, right after the nonce.
    let sealed = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| DustError::Other(format!("AES-GCM encrypt: {e}")))?;
    let (body, tag) = sealed.split_at(sealed.len() - TAG_LEN);

    let mut envelope = Vec::with_capacity(OVERHEAD + body.len());
    envelope.extend_from_slice(&nonce_bytes);
    envelope.extend_from_slice(tag);
    envelope.extend_from_slice(body);
    Ok(envelope)
}

/// Decrypt an envelope produced by [`seal`]. Fails with [`DustError::BadEnvelope`]
/// when too short to contain a nonce, tag, and any payload, and with
/// [`DustError::AuthFailure`] when the tag does not verify.
pub fn open(key: &SecretKey, envelope: &[u8]) -> Result<Vec<u8>> {
    if envelope.len() <= OVERHEAD {
        return Err(DustError::BadEnvelope);
    }
    let (nonce_bytes, rest) = envelope.split_at(NONCE_LEN);
    let (tag, body) = rest.split_at(TAG_LEN);

    let mut sealed = Vec::with_capacity(body.len() + TAG_LEN);
    sealed.extend_from_slice(body);
    sealed.extend_from_slice(tag);

    let cipher =
        Aes256Gcm::new_from_slice(key.as_bytes()).expect("valid 32-byte key for AES-256-GCM");
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), sealed.as_ref())
        .map_err(|_| DustError::AuthFailure)
}
