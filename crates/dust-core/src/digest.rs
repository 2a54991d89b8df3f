use std::fmt;
use std::io::Read;
use std::path::Path;

use md5::{Digest, Md5};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;

use crate::error::Result;

/// Content fingerprint of a chunk's plaintext — the dedup key.
///
/// MD5 is deliberate: it is a content fingerprint, not a security boundary.
/// End-to-end integrity is carried by the AEAD tag and the whole-file SHA-256.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlainHash(pub [u8; 16]);

/// Fingerprint of an encrypted on-wire envelope, used to detect in-flight
/// corruption before paying for a decrypt.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CipherHash(pub [u8; 16]);

impl PlainHash {
    pub fn compute(data: &[u8]) -> Self {
        let mut out = [0u8; 16];
        out.copy_from_slice(&Md5::digest(data));
        PlainHash(out)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> std::result::Result<Self, String> {
        decode16(s).map(PlainHash)
    }
}

impl CipherHash {
    pub fn compute(data: &[u8]) -> Self {
        let mut out = [0u8; 16];
        out.copy_from_slice(&Md5::digest(data));
        CipherHash(out)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> std::result::Result<Self, String> {
        decode16(s).map(CipherHash)
    }
}

fn decode16(s: &str) -> std::result::Result<[u8; 16], String> {
    let bytes = hex::decode(s).map_err(|e| format!("invalid digest '{s}': {e}"))?;
    let mut out = [0u8; 16];
    if bytes.len() != 16 {
        return Err(format!("invalid digest '{s}': expected 16 bytes"));
    }
    out.copy_from_slice(&bytes);
    Ok(out)
}

impl fmt::Display for PlainHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

impl fmt::Debug for PlainHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PlainHash({})", self.to_hex())
    }
}

impl fmt::Display for CipherHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

impl fmt::Debug for CipherHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CipherHash({})", self.to_hex())
    }
}

// Serialized as lowercase hex strings so both digests can key JSON objects.

impl Serialize for PlainHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PlainHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PlainHash::from_hex(&s).map_err(D::Error::custom)
    }
}

impl Serialize for CipherHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for CipherHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        CipherHash::from_hex(&s).map_err(D::Error::custom)
    }
}

/// Hex SHA-256 of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hex SHA-256 and size of a file, computed in streaming reads.
pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total: u64 = 0;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), total))
}
