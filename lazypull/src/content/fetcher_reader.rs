//! Random-access reads served from a remote fetcher.
//!
//! Layer blobs are never copied into the store by the puller. A consumer that
//! finally needs the bytes gets a [`FetcherReaderAt`]: sequential reads stream
//! straight off the open fetch, a read at any other offset reopens the fetch
//! at that offset.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::Mutex;

use super::ReaderAt;
use crate::images::Descriptor;
use crate::remotes::{BlobStream, Fetcher};
use lazypull_shared::LazypullResult;

struct ReadState {
    /// Offset of the next byte `stream`/`pending` will yield.
    offset: u64,
    stream: Option<BlobStream>,
    pending: Bytes,
}

/// [`ReaderAt`] backed by a [`Fetcher`].
pub struct FetcherReaderAt {
    fetcher: Arc<dyn Fetcher>,
    desc: Descriptor,
    state: Mutex<ReadState>,
}

impl FetcherReaderAt {
    pub fn new(fetcher: Arc<dyn Fetcher>, desc: Descriptor) -> Self {
        Self {
            fetcher,
            desc,
            state: Mutex::new(ReadState {
                offset: 0,
                stream: None,
                pending: Bytes::new(),
            }),
        }
    }
}

#[async_trait]
impl ReaderAt for FetcherReaderAt {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> LazypullResult<usize> {
        if buf.is_empty() || (self.desc.size >= 0 && offset >= self.desc.size as u64) {
            return Ok(0);
        }

        let mut state = self.state.lock().await;
        if state.stream.is_none() || state.offset != offset {
            tracing::debug!(
                digest = %self.desc.digest,
                offset,
                "Opening remote blob for lazy read"
            );
            let stream = self.fetcher.fetch_at(&self.desc, offset).await?;
            state.stream = Some(stream);
            state.pending = Bytes::new();
            state.offset = offset;
        }

        let ReadState {
            offset: cursor,
            stream,
            pending,
        } = &mut *state;

        let mut n = 0;
        while n < buf.len() {
            if pending.is_empty() {
                let next = match stream.as_mut() {
                    Some(s) => s.next().await,
                    None => None,
                };
                match next {
                    Some(Ok(chunk)) => *pending = chunk,
                    Some(Err(e)) => {
                        *stream = None;
                        return Err(e);
                    }
                    None => {
                        *stream = None;
                        break;
                    }
                }
                continue;
            }
            let take = pending.len().min(buf.len() - n);
            let head = pending.split_to(take);
            buf[n..n + take].copy_from_slice(&head);
            n += take;
        }

        *cursor += n as u64;
        Ok(n)
    }

    fn size(&self) -> i64 {
        self.desc.size
    }
}
