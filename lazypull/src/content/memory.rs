//! In-memory content store.
//!
//! Blobs live in a map keyed by digest behind a `RwLock`. Writers stage bytes
//! privately, hash them as they arrive and only insert on a verified commit,
//! so readers never observe a partial blob.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use super::{ContentStore, ContentWriter, Info, Provider, ReaderAt};
use crate::images::Descriptor;
use crate::images::descriptor::{Digester, validate_digest};
use lazypull_shared::{LazypullError, LazypullResult};

#[derive(Debug, Clone)]
struct Blob {
    data: Bytes,
    labels: BTreeMap<String, String>,
}

type Blobs = Arc<RwLock<HashMap<String, Blob>>>;

/// Thread-safe in-memory [`ContentStore`].
///
/// Cloning is cheap and all clones share the same blobs.
#[derive(Clone, Default)]
pub struct MemoryStore {
    blobs: Blobs,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("blobs", &self.blobs.read().len())
            .finish()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, digest: &str) -> bool {
        self.blobs.read().contains_key(digest)
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    /// Digests of every stored blob, sorted.
    pub fn digests(&self) -> Vec<String> {
        let mut digests: Vec<String> = self.blobs.read().keys().cloned().collect();
        digests.sort();
        digests
    }

    /// Raw bytes of a stored blob.
    pub fn get(&self, digest: &str) -> Option<Bytes> {
        self.blobs.read().get(digest).map(|b| b.data.clone())
    }

    /// Insert bytes without a staged writer. Digest is computed here.
    pub fn insert(&self, data: impl Into<Bytes>) -> String {
        let data = data.into();
        let mut digester = Digester::new();
        digester.update(&data);
        let digest = digester.finalize();
        self.blobs.write().entry(digest.clone()).or_insert(Blob {
            data,
            labels: BTreeMap::new(),
        });
        digest
    }
}

#[async_trait]
impl Provider for MemoryStore {
    async fn reader_at(&self, desc: &Descriptor) -> LazypullResult<Box<dyn ReaderAt>> {
        let data = self
            .get(&desc.digest)
            .ok_or_else(|| LazypullError::NotFound(desc.digest.clone()))?;
        Ok(Box::new(BytesReaderAt::new(data)))
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn info(&self, digest: &str) -> LazypullResult<Info> {
        let blobs = self.blobs.read();
        let blob = blobs
            .get(digest)
            .ok_or_else(|| LazypullError::NotFound(digest.to_string()))?;
        Ok(Info {
            digest: digest.to_string(),
            size: blob.data.len() as i64,
            labels: blob.labels.clone(),
        })
    }

    async fn writer(&self, desc: &Descriptor) -> LazypullResult<Box<dyn ContentWriter>> {
        validate_digest(&desc.digest)?;
        Ok(Box::new(MemoryWriter {
            blobs: Arc::clone(&self.blobs),
            expected_digest: desc.digest.clone(),
            expected_size: desc.size,
            buf: Vec::new(),
            digester: Some(Digester::new()),
        }))
    }

    async fn update_labels(
        &self,
        digest: &str,
        labels: BTreeMap<String, String>,
    ) -> LazypullResult<Info> {
        let mut blobs = self.blobs.write();
        let blob = blobs
            .get_mut(digest)
            .ok_or_else(|| LazypullError::NotFound(digest.to_string()))?;
        for (key, value) in labels {
            if value.is_empty() {
                blob.labels.remove(&key);
            } else {
                blob.labels.insert(key, value);
            }
        }
        Ok(Info {
            digest: digest.to_string(),
            size: blob.data.len() as i64,
            labels: blob.labels.clone(),
        })
    }

    async fn delete(&self, digest: &str) -> LazypullResult<()> {
        self.blobs
            .write()
            .remove(digest)
            .map(|_| ())
            .ok_or_else(|| LazypullError::NotFound(digest.to_string()))
    }
}

// ============================================================================
// WRITER
// ============================================================================

struct MemoryWriter {
    blobs: Blobs,
    expected_digest: String,
    expected_size: i64,
    buf: Vec<u8>,
    /// Taken on commit; a committed writer rejects further use.
    digester: Option<Digester>,
}

#[async_trait]
impl ContentWriter for MemoryWriter {
    async fn write(&mut self, chunk: &[u8]) -> LazypullResult<()> {
        let digester = self.digester.as_mut().ok_or_else(|| {
            LazypullError::Storage(format!("writer for {} already committed", self.expected_digest))
        })?;
        digester.update(chunk);
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    async fn commit(&mut self, labels: BTreeMap<String, String>) -> LazypullResult<()> {
        let digester = self.digester.take().ok_or_else(|| {
            LazypullError::Storage(format!("writer for {} already committed", self.expected_digest))
        })?;

        if self.expected_size > 0 && digester.len() != self.expected_size as u64 {
            return Err(LazypullError::Storage(format!(
                "unexpected size for {}: expected {} bytes, got {}",
                self.expected_digest,
                self.expected_size,
                digester.len()
            )));
        }

        let actual = digester.finalize();
        if actual != self.expected_digest {
            tracing::error!(
                expected = %self.expected_digest,
                computed = %actual,
                "Blob integrity check failed"
            );
            return Err(LazypullError::DigestMismatch {
                expected: self.expected_digest.clone(),
                actual,
            });
        }

        let data = Bytes::from(std::mem::take(&mut self.buf));
        let mut blobs = self.blobs.write();
        // Another writer may have won the race; content is identical.
        let blob = blobs
            .entry(self.expected_digest.clone())
            .or_insert_with(|| Blob {
                data,
                labels: BTreeMap::new(),
            });
        blob.labels.extend(labels);
        Ok(())
    }
}

// ============================================================================
// READER
// ============================================================================

/// [`ReaderAt`] over bytes already in memory.
#[derive(Debug, Clone)]
pub struct BytesReaderAt {
    data: Bytes,
}

impl BytesReaderAt {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }
}

#[async_trait]
impl ReaderAt for BytesReaderAt {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> LazypullResult<usize> {
        let len = self.data.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }

    fn size(&self) -> i64 {
        self.data.len() as i64
    }
}
