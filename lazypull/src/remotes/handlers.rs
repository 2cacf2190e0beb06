//! Handlers that talk to the remote: fetching blobs into the store and
//! recording where they came from.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use oci_client::Reference;

use super::Fetcher;
use crate::content::{ContentStore, copy_stream};
use crate::images::{Descriptor, Handler, Step};
use lazypull_shared::constants::labels::DISTRIBUTION_SOURCE_PREFIX;
use lazypull_shared::{LazypullError, LazypullResult};

/// Attempts per blob before a fetch error fails the walk.
const FETCH_ATTEMPTS: u32 = 3;

/// Copies each visited blob into the store unless it is already there.
/// Content is verified against the descriptor before it becomes visible.
pub struct FetchHandler {
    store: Arc<dyn ContentStore>,
    fetcher: Arc<dyn Fetcher>,
}

impl FetchHandler {
    pub fn new(store: Arc<dyn ContentStore>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self { store, fetcher }
    }

    async fn fetch_once(&self, desc: &Descriptor) -> LazypullResult<u64> {
        let stream = self.fetcher.fetch(desc).await?;
        let mut writer = self.store.writer(desc).await?;
        copy_stream(writer.as_mut(), stream).await
    }
}

#[async_trait]
impl Handler for FetchHandler {
    async fn handle(&self, desc: &Descriptor) -> LazypullResult<Step> {
        if self.store.info(&desc.digest).await.is_ok() {
            tracing::trace!(digest = %desc.digest, "Blob already in store");
            return Ok(Step::done());
        }

        let mut last_error = None;
        for attempt in 1..=FETCH_ATTEMPTS {
            tracing::debug!(
                digest = %desc.digest,
                media_type = %desc.media_type,
                size = desc.size,
                attempt,
                "Fetching blob"
            );
            match self.fetch_once(desc).await {
                Ok(copied) => {
                    tracing::debug!(digest = %desc.digest, bytes = copied, "Fetched blob");
                    return Ok(Step::done());
                }
                Err(e @ LazypullError::Cancelled) => return Err(e),
                Err(e) => {
                    tracing::warn!(digest = %desc.digest, attempt, error = %e, "Blob fetch failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| LazypullError::Fetch {
            digest: desc.digest.clone(),
            reason: "fetch failed after retries".to_string(),
        }))
    }
}

/// Appends the source repository to each stored blob's
/// `containerd.io/distribution.source.<registry>` label.
///
/// Labelling is best effort: failures are logged and the walk continues.
pub struct DistributionSourceHandler {
    store: Arc<dyn ContentStore>,
    key: String,
    repository: String,
}

impl DistributionSourceHandler {
    pub fn new(store: Arc<dyn ContentStore>, reference: &str) -> LazypullResult<Self> {
        let parsed: Reference =
            reference
                .parse()
                .map_err(|e: oci_client::ParseError| LazypullError::InvalidReference {
                    reference: reference.to_string(),
                    reason: e.to_string(),
                })?;
        Ok(Self {
            store,
            key: format!("{DISTRIBUTION_SOURCE_PREFIX}{}", parsed.registry()),
            repository: parsed.repository().to_string(),
        })
    }

    async fn label(&self, desc: &Descriptor) -> LazypullResult<()> {
        let info = self.store.info(&desc.digest).await?;
        let existing = info.labels.get(&self.key).map(String::as_str);
        let value = append_distribution_source(existing, &self.repository);
        if existing == Some(value.as_str()) {
            return Ok(());
        }
        let mut labels = BTreeMap::new();
        labels.insert(self.key.clone(), value);
        self.store.update_labels(&desc.digest, labels).await?;
        Ok(())
    }
}

#[async_trait]
impl Handler for DistributionSourceHandler {
    async fn handle(&self, desc: &Descriptor) -> LazypullResult<Step> {
        if let Err(e) = self.label(desc).await {
            tracing::warn!(
                digest = %desc.digest,
                error = %e,
                "Failed to record distribution source"
            );
        }
        Ok(Step::done())
    }
}

/// Add `repository` to a comma-separated, sorted, duplicate-free list.
pub fn append_distribution_source(existing: Option<&str>, repository: &str) -> String {
    let mut repos: Vec<&str> = existing
        .unwrap_or_default()
        .split(',')
        .filter(|r| !r.is_empty())
        .collect();
    repos.push(repository);
    repos.sort_unstable();
    repos.dedup();
    repos.join(",")
}
