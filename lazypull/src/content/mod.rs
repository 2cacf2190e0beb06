//! Content store interfaces.
//!
//! The puller never touches disk itself. It talks to a content-addressable
//! store through these traits:
//! - [`Provider`]: random-access reads of a blob by descriptor
//! - [`ContentStore`]: provider plus info, labels and staged writes
//!
//! [`MemoryStore`] is the in-process implementation used by the CLI and tests;
//! [`FetcherReaderAt`] serves reads straight from a remote fetcher.

mod fetcher_reader;
mod memory;

pub use fetcher_reader::FetcherReaderAt;
pub use memory::{BytesReaderAt, MemoryStore};

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::StreamExt;

use crate::images::Descriptor;
use crate::remotes::BlobStream;
use lazypull_shared::LazypullResult;

/// Read chunk used when draining a reader.
const READ_CHUNK: usize = 32 * 1024;

// ============================================================================
// TRAITS
// ============================================================================

/// Random-access reader over a single blob.
#[async_trait]
pub trait ReaderAt: Send + Sync {
    /// Read into `buf` starting at `offset`. Returns 0 at end of blob.
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> LazypullResult<usize>;

    /// Blob size in bytes, negative if unknown.
    fn size(&self) -> i64;
}

/// Anything that can hand out readers for descriptors.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn reader_at(&self, desc: &Descriptor) -> LazypullResult<Box<dyn ReaderAt>>;
}

/// Stored blob metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    pub digest: String,
    pub size: i64,
    pub labels: BTreeMap<String, String>,
}

/// Staged write of one blob. Nothing is visible until `commit` succeeds.
#[async_trait]
pub trait ContentWriter: Send {
    async fn write(&mut self, chunk: &[u8]) -> LazypullResult<()>;

    /// Verify size and digest against the descriptor and publish the blob.
    async fn commit(&mut self, labels: BTreeMap<String, String>) -> LazypullResult<()>;
}

/// Content-addressable blob store.
///
/// Implementations must be safe for concurrent use: graph walks read and
/// write from many tasks at once.
#[async_trait]
pub trait ContentStore: Provider {
    /// Size and labels of a stored blob, `NotFound` if absent.
    async fn info(&self, digest: &str) -> LazypullResult<Info>;

    async fn writer(&self, desc: &Descriptor) -> LazypullResult<Box<dyn ContentWriter>>;

    /// Merge `labels` into the blob's labels. Empty values remove a label.
    async fn update_labels(
        &self,
        digest: &str,
        labels: BTreeMap<String, String>,
    ) -> LazypullResult<Info>;

    async fn delete(&self, digest: &str) -> LazypullResult<()>;
}

// ============================================================================
// HELPERS
// ============================================================================

/// Read a whole blob through a provider.
pub async fn read_blob<P>(provider: &P, desc: &Descriptor) -> LazypullResult<Vec<u8>>
where
    P: Provider + ?Sized,
{
    let reader = provider.reader_at(desc).await?;
    read_all(reader.as_ref()).await
}

/// Drain a reader from offset 0 to end of blob.
pub async fn read_all(reader: &dyn ReaderAt) -> LazypullResult<Vec<u8>> {
    let mut data = Vec::with_capacity(reader.size().max(0) as usize);
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read_at(&mut buf, data.len() as u64).await?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
    }
    Ok(data)
}

/// Write `data` as the blob named by `desc`. No-op if already stored.
pub async fn write_blob<S>(
    store: &S,
    desc: &Descriptor,
    data: &[u8],
    labels: BTreeMap<String, String>,
) -> LazypullResult<()>
where
    S: ContentStore + ?Sized,
{
    if store.info(&desc.digest).await.is_ok() {
        tracing::trace!(digest = %desc.digest, "Blob already in store");
        return Ok(());
    }
    let mut writer = store.writer(desc).await?;
    writer.write(data).await?;
    writer.commit(labels).await
}

/// Copy a fetch stream into a staged writer and commit it.
pub async fn copy_stream(
    writer: &mut dyn ContentWriter,
    mut stream: BlobStream,
) -> LazypullResult<u64> {
    let mut copied = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        copied += chunk.len() as u64;
        writer.write(&chunk).await?;
    }
    writer.commit(BTreeMap::new()).await?;
    Ok(copied)
}
