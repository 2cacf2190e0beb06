//! Remote side of a pull: resolving references and fetching blobs.

mod handlers;
pub mod registry;
pub mod schema1;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;

use crate::images::Descriptor;
use lazypull_shared::LazypullResult;

pub use handlers::{DistributionSourceHandler, FetchHandler, append_distribution_source};
pub use registry::{RegistryFetcher, RegistryResolver};
pub use schema1::Schema1Converter;

/// Blob content as an ordered stream of chunks.
pub type BlobStream = BoxStream<'static, LazypullResult<Bytes>>;

/// Maps an image reference to its root descriptor.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Returns the canonical reference name and the root descriptor.
    async fn resolve(&self, reference: &str) -> LazypullResult<(String, Descriptor)>;

    /// Fetcher for blobs of the repository `reference` points at.
    async fn fetcher(&self, reference: &str) -> LazypullResult<Arc<dyn Fetcher>>;
}

/// Streams blob content by descriptor.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, desc: &Descriptor) -> LazypullResult<BlobStream>;

    /// Stream starting `offset` bytes into the blob.
    ///
    /// The default reads from the start and discards the prefix.
    async fn fetch_at(&self, desc: &Descriptor, offset: u64) -> LazypullResult<BlobStream> {
        let stream = self.fetch(desc).await?;
        if offset == 0 {
            return Ok(stream);
        }
        Ok(skip_bytes(stream, offset))
    }
}

fn skip_bytes(stream: BlobStream, offset: u64) -> BlobStream {
    let mut remaining = offset;
    stream
        .filter_map(move |item| {
            let out = match item {
                Ok(chunk) if remaining >= chunk.len() as u64 => {
                    remaining -= chunk.len() as u64;
                    None
                }
                Ok(mut chunk) => {
                    let tail = chunk.split_off(remaining as usize);
                    remaining = 0;
                    Some(Ok(tail))
                }
                Err(e) => Some(Err(e)),
            };
            futures::future::ready(out)
        })
        .boxed()
}

/// Drain a blob stream into memory.
pub async fn collect_stream(mut stream: BlobStream) -> LazypullResult<Vec<u8>> {
    let mut data = Vec::new();
    while let Some(chunk) = stream.next().await {
        data.extend_from_slice(&chunk?);
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn chunks(parts: &[&'static [u8]]) -> BlobStream {
        stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::from_static(p)))
                .collect::<Vec<_>>(),
        )
        .boxed()
    }

    #[tokio::test]
    async fn test_skip_bytes_across_chunks() {
        let skipped = skip_bytes(chunks(&[b"abc", b"def", b"gh"]), 4);
        assert_eq!(collect_stream(skipped).await.unwrap(), b"efgh");
    }

    #[tokio::test]
    async fn test_skip_bytes_on_boundary_and_past_end() {
        let skipped = skip_bytes(chunks(&[b"abc", b"def"]), 3);
        assert_eq!(collect_stream(skipped).await.unwrap(), b"def");

        let skipped = skip_bytes(chunks(&[b"abc"]), 10);
        assert!(collect_stream(skipped).await.unwrap().is_empty());
    }
}
