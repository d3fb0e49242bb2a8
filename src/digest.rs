//! Content fingerprints.
//!
//! A [`Digest`] is the SHA-256 of a byte sequence plus its length, following
//! the Bazel / REAPI (Remote Execution API) convention. Digests are the only
//! key used to address blobs, directory listings, commands and actions, so the
//! computation must be identical in every process that talks to the same
//! remote store.

use crate::constants::DEFAULT_IO_BUFFER_SIZE;
use crate::error::{MemoExecError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

/// SHA-256 of the empty byte sequence.
pub const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

const HASH_HEX_LEN: usize = 64;

/// Immutable content fingerprint: lowercase hex SHA-256 plus size in bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "WireDigest")]
pub struct Digest {
    hash: String,
    size_bytes: i64,
}

#[derive(Deserialize)]
struct WireDigest {
    hash: String,
    size_bytes: i64,
}

impl TryFrom<WireDigest> for Digest {
    type Error = MemoExecError;

    fn try_from(raw: WireDigest) -> Result<Self> {
        Digest::new(raw.hash, raw.size_bytes)
    }
}

impl Digest {
    /// Build a digest from an already-known hash and size, validating both.
    pub fn new(hash: impl Into<String>, size_bytes: i64) -> Result<Self> {
        let hash = hash.into();
        if hash.len() != HASH_HEX_LEN
            || !hash
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(MemoExecError::InvalidDigest(format!(
                "hash {:?} is not {} lowercase hex characters",
                hash, HASH_HEX_LEN
            )));
        }
        if size_bytes < 0 {
            return Err(MemoExecError::InvalidDigest(format!(
                "negative size {} for {}",
                size_bytes, hash
            )));
        }
        Ok(Self { hash, size_bytes })
    }

    /// The digest of zero bytes.
    pub fn empty() -> Self {
        Self {
            hash: EMPTY_SHA256.to_string(),
            size_bytes: 0,
        }
    }

    pub fn of_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self {
            hash: hex::encode(hasher.finalize()),
            size_bytes: data.len() as i64,
        }
    }

    /// Digest a stream without materializing it.
    pub fn of_reader<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; DEFAULT_IO_BUFFER_SIZE];
        let mut size: i64 = 0;
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            hasher.update(&buf[..n]);
            size += n as i64;
        }
        Ok(Self {
            hash: hex::encode(hasher.finalize()),
            size_bytes: size,
        })
    }

    pub fn of_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| MemoExecError::filesystem(path, e))?;
        Self::of_reader(file).map_err(|e| MemoExecError::filesystem(path, e))
    }

    /// Serialize a wire message canonically and digest the result.
    ///
    /// Messages are plain structs with fixed field order and sorted
    /// collections, so the serialized form is stable across processes.
    pub fn of_message<T: Serialize>(message: &T) -> Result<(Self, Vec<u8>)> {
        let bytes = serde_json::to_vec(message)?;
        Ok((Self::of_bytes(&bytes), bytes))
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn size_bytes(&self) -> i64 {
        self.size_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.size_bytes == 0 && self.hash == EMPTY_SHA256
    }

    /// First 8 hex characters, for log lines.
    pub fn short(&self) -> &str {
        &self.hash[..8]
    }

    /// Check that `data` is the content this digest names.
    pub fn verify(&self, data: &[u8]) -> Result<()> {
        let actual = Self::of_bytes(data);
        if &actual != self {
            crate::log_cas_verify_fail!(self, actual);
            return Err(MemoExecError::CasIntegrityFailure {
                expected: self.clone(),
                actual,
            });
        }
        Ok(())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hash, self.size_bytes)
    }
}

impl FromStr for Digest {
    type Err = MemoExecError;

    /// Parses the `hash/size` form produced by `Display`.
    fn from_str(s: &str) -> Result<Self> {
        let (hash, size) = s
            .split_once('/')
            .ok_or_else(|| MemoExecError::InvalidDigest(format!("expected hash/size, got {:?}", s)))?;
        let size = size
            .parse::<i64>()
            .map_err(|e| MemoExecError::InvalidDigest(format!("bad size in {:?}: {}", s, e)))?;
        Self::new(hash, size)
    }
}
