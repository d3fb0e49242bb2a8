//! The unit of CAS transfer: a digest plus the content it names.

use crate::digest::Digest;
use crate::error::{MemoExecError, Result};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where a blob's bytes come from. File-backed blobs are read lazily so large
/// inputs never have to sit in memory as a whole.
#[derive(Debug, Clone)]
pub enum BlobSource {
    Bytes(Arc<[u8]>),
    File(PathBuf),
}

/// A digest and its content. Once built, the pair is never mutated.
#[derive(Debug, Clone)]
pub struct Blob {
    digest: Digest,
    source: BlobSource,
}

impl Blob {
    /// In-memory blob; the digest is computed from the content.
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        let data: Vec<u8> = data.into();
        Self {
            digest: Digest::of_bytes(&data),
            source: BlobSource::Bytes(data.into()),
        }
    }

    /// In-memory blob with a claimed digest; rejected if the content disagrees.
    pub fn with_digest(digest: Digest, data: impl Into<Vec<u8>>) -> Result<Self> {
        let data: Vec<u8> = data.into();
        digest.verify(&data)?;
        Ok(Self {
            digest,
            source: BlobSource::Bytes(data.into()),
        })
    }

    /// File-backed blob whose digest was computed while walking the tree.
    /// The content is re-verified whenever it is read in full.
    pub(crate) fn from_file(digest: Digest, path: PathBuf) -> Self {
        Self {
            digest,
            source: BlobSource::File(path),
        }
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn size(&self) -> i64 {
        self.digest.size_bytes()
    }

    pub fn source(&self) -> &BlobSource {
        &self.source
    }

    /// Path of a file-backed blob.
    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            BlobSource::File(path) => Some(path),
            BlobSource::Bytes(_) => None,
        }
    }

    /// Whole content, checked against the digest.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        match &self.source {
            BlobSource::Bytes(data) => Ok(data.to_vec()),
            BlobSource::File(path) => {
                let data = std::fs::read(path).map_err(|e| MemoExecError::filesystem(path, e))?;
                self.digest.verify(&data)?;
                Ok(data)
            }
        }
    }

    /// Re-digest the backing content without loading it into memory.
    pub fn verify_source(&self) -> Result<()> {
        match &self.source {
            BlobSource::Bytes(_) => Ok(()),
            BlobSource::File(path) => {
                let actual = Digest::of_file(path)?;
                if actual != self.digest {
                    crate::log_cas_verify_fail!(self.digest, actual);
                    return Err(MemoExecError::CasIntegrityFailure {
                        expected: self.digest.clone(),
                        actual,
                    });
                }
                Ok(())
            }
        }
    }

    /// Up to `len` bytes starting at `offset`.
    pub fn read_chunk(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        match &self.source {
            BlobSource::Bytes(data) => {
                let start = (offset as usize).min(data.len());
                let end = start.saturating_add(len).min(data.len());
                Ok(data[start..end].to_vec())
            }
            BlobSource::File(path) => {
                let mut file =
                    std::fs::File::open(path).map_err(|e| MemoExecError::filesystem(path, e))?;
                file.seek(SeekFrom::Start(offset))
                    .map_err(|e| MemoExecError::filesystem(path, e))?;
                let mut buf = Vec::with_capacity(len);
                file.take(len as u64)
                    .read_to_end(&mut buf)
                    .map_err(|e| MemoExecError::filesystem(path, e))?;
                Ok(buf)
            }
        }
    }
}
