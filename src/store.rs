//! ALFA Token Seal - Sealed Blob Storage
//!
//! Wire format of a stored wrapper:
//! ```text
//! [MAGIC 8B]["ALFASEAL"]
//! [VERSION 1B][0x01]
//! [BODY variable][bincode { ciphertext: len-prefixed bytes, initialization_vector: len-prefixed bytes }]
//! ```

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{SealError, SealResult};

/// Magic bytes identifying a sealed wrapper
const MAGIC: &[u8; 8] = b"ALFASEAL";

/// Current format version
const VERSION: u8 = 0x01;

/// Header size: MAGIC(8) + VERSION(1)
const HEADER_SIZE: usize = 8 + 1;

/// Persisted result of a successful seal
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedWrapper {
    /// AES-GCM ciphertext with trailing tag
    pub ciphertext: Vec<u8>,
    /// IV the ciphertext was produced with
    pub initialization_vector: Vec<u8>,
}

impl SealedWrapper {
    /// Serialize with header
    pub fn to_bytes(&self) -> SealResult<Vec<u8>> {
        let body = bincode::serialize(self).map_err(|e| SealError::Storage(e.to_string()))?;
        let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Parse bytes written by [`SealedWrapper::to_bytes`]
    pub fn from_bytes(data: &[u8]) -> SealResult<Self> {
        if data.len() < HEADER_SIZE {
            return Err(SealError::DecodeError("Data too short".into()));
        }
        if &data[..8] != MAGIC {
            return Err(SealError::DecodeError("Invalid magic bytes".into()));
        }
        if data[8] != VERSION {
            return Err(SealError::DecodeError(format!("Unsupported version: {}", data[8])));
        }

        Ok(bincode::deserialize(&data[HEADER_SIZE..])?)
    }
}

impl fmt::Debug for SealedWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealedWrapper")
            .field("ciphertext_len", &self.ciphertext.len())
            .field("iv_len", &self.initialization_vector.len())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// BACKENDS
// ═══════════════════════════════════════════════════════════════════════════

/// Namespaced key-value blob storage. Each `put` replaces the value atomically.
pub trait BlobStore: Send + Sync {
    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> SealResult<()>;
    fn get(&self, namespace: &str, key: &str) -> SealResult<Option<Vec<u8>>>;
    fn remove(&self, namespace: &str, key: &str) -> SealResult<()>;
}

/// In-memory backend
#[derive(Default)]
pub struct MemoryBlobStore {
    entries: RwLock<HashMap<(String, String), Vec<u8>>>,
    writes: RwLock<usize>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `put` calls
    pub fn write_count(&self) -> usize {
        *self.writes.read()
    }

    /// Overwrite raw bytes (bypasses wrapper encoding)
    pub fn put_raw(&self, namespace: &str, key: &str, value: Vec<u8>) {
        self.entries.write().insert((namespace.to_string(), key.to_string()), value);
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> SealResult<()> {
        self.entries
            .write()
            .insert((namespace.to_string(), key.to_string()), value.to_vec());
        *self.writes.write() += 1;
        Ok(())
    }

    fn get(&self, namespace: &str, key: &str) -> SealResult<Option<Vec<u8>>> {
        Ok(self
            .entries
            .read()
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    fn remove(&self, namespace: &str, key: &str) -> SealResult<()> {
        self.entries.write().remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }
}

/// Filesystem backend: `<root>/<namespace>/<key>.blob`
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn path_for(&self, namespace: &str, key: &str) -> SealResult<PathBuf> {
        for part in [namespace, key] {
            let valid = !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
                && part != "."
                && part != "..";
            if !valid {
                return Err(SealError::Storage(format!("Invalid blob name: {:?}", part)));
            }
        }
        Ok(self.root.join(namespace).join(format!("{}.blob", key)))
    }
}

impl BlobStore for FileBlobStore {
    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> SealResult<()> {
        let path = self.path_for(namespace, key)?;
        write_atomic(&path, value)
    }

    fn get(&self, namespace: &str, key: &str) -> SealResult<Option<Vec<u8>>> {
        let path = self.path_for(namespace, key)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&self, namespace: &str, key: &str) -> SealResult<()> {
        let path = self.path_for(namespace, key)?;

        if path.exists() {
            // Overwrite with zeros before unlinking
            let size = fs::metadata(&path)?.len() as usize;
            if size > 0 {
                let mut file = OpenOptions::new().write(true).open(&path)?;
                file.write_all(&vec![0u8; size])?;
                file.sync_all()?;
            }
            fs::remove_file(&path)?;
        }

        Ok(())
    }
}

/// Replace `path` with `data`: temp file, fsync, then rename over the old file
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> SealResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let temp_path = path.with_extension("tmp");

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp_path)?;

    file.write_all(data)?;
    file.sync_all()?;

    fs::rename(&temp_path, path)?;

    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// SEALED BLOB STORE
// ═══════════════════════════════════════════════════════════════════════════

/// Stores [`SealedWrapper`]s on top of any [`BlobStore`]
#[derive(Clone)]
pub struct SealedBlobStore {
    backend: Arc<dyn BlobStore>,
}

impl SealedBlobStore {
    pub fn new(backend: Arc<dyn BlobStore>) -> Self {
        Self { backend }
    }

    /// Replace the wrapper stored under `namespace`/`key`
    pub fn save(&self, namespace: &str, key: &str, wrapper: &SealedWrapper) -> SealResult<()> {
        self.backend.put(namespace, key, &wrapper.to_bytes()?)
    }

    /// `None` if nothing was ever saved; `DecodeError` if the bytes are corrupt
    pub fn load(&self, namespace: &str, key: &str) -> SealResult<Option<SealedWrapper>> {
        self.backend
            .get(namespace, key)?
            .map(|bytes| SealedWrapper::from_bytes(&bytes))
            .transpose()
    }

    pub fn clear(&self, namespace: &str, key: &str) -> SealResult<()> {
        self.backend.remove(namespace, key)
    }
}
