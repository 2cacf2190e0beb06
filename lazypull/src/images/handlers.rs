//! Per-node visitors for the content graph walk.
//!
//! A [`Handler`] looks at one descriptor and either returns the children to
//! visit next or asks the walk to skip the subtree. Handlers compose: a
//! [`Handlers`] chain runs each member in order, and [`FilterPlatforms`] /
//! [`LimitManifests`] wrap another handler to prune what it returns.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::descriptor::Descriptor;
use super::manifest::{children, sort_by_platform};
use super::media_types;
use crate::content::Provider;
use crate::platforms::PlatformMatcher;
use lazypull_shared::{LazypullError, LazypullResult};

/// Outcome of visiting a single node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Continue into these children (possibly none).
    Children(Vec<Descriptor>),
    /// Do not descend, and stop the rest of the chain for this node.
    Skip,
}

impl Step {
    pub fn done() -> Self {
        Step::Children(Vec::new())
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, desc: &Descriptor) -> LazypullResult<Step>;
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn handle(&self, desc: &Descriptor) -> LazypullResult<Step> {
        (**self).handle(desc).await
    }
}

/// Runs handlers in order. Children are concatenated; the first
/// [`Step::Skip`] or error ends the chain.
pub struct Handlers {
    chain: Vec<Arc<dyn Handler>>,
}

impl Handlers {
    pub fn new(chain: Vec<Arc<dyn Handler>>) -> Self {
        Self { chain }
    }
}

#[async_trait]
impl Handler for Handlers {
    async fn handle(&self, desc: &Descriptor) -> LazypullResult<Step> {
        let mut all = Vec::new();
        for handler in &self.chain {
            match handler.handle(desc).await? {
                Step::Skip => return Ok(Step::Skip),
                Step::Children(children) => all.extend(children),
            }
        }
        Ok(Step::Children(all))
    }
}

// ============================================================================
// METADATA COLLECTION
// ============================================================================

/// Non-layer descriptors seen by a walk, keyed by digest.
pub type MetadataMap = Arc<Mutex<HashMap<String, Descriptor>>>;

/// Records every non-layer node in a [`MetadataMap`] and skips layers so
/// that nothing after it in the chain ever fetches layer content.
pub struct FilterLayerBlobs {
    metadata: MetadataMap,
}

impl FilterLayerBlobs {
    pub fn new(metadata: MetadataMap) -> Self {
        Self { metadata }
    }
}

#[async_trait]
impl Handler for FilterLayerBlobs {
    async fn handle(&self, desc: &Descriptor) -> LazypullResult<Step> {
        if media_types::is_layer(&desc.media_type) {
            tracing::trace!(digest = %desc.digest, "Skipping layer blob");
            return Ok(Step::Skip);
        }
        self.metadata
            .lock()
            .insert(desc.digest.clone(), desc.clone());
        Ok(Step::done())
    }
}

// ============================================================================
// CHILDREN
// ============================================================================

/// Reads a node from `provider` and returns its direct children.
pub struct ChildrenHandler<P: ?Sized> {
    provider: Arc<P>,
}

impl<P: ?Sized> ChildrenHandler<P> {
    pub fn new(provider: Arc<P>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl<P: Provider + ?Sized> Handler for ChildrenHandler<P> {
    async fn handle(&self, desc: &Descriptor) -> LazypullResult<Step> {
        Ok(Step::Children(children(self.provider.as_ref(), desc).await?))
    }
}

/// Drops children whose platform does not match. Children without a
/// platform are kept.
pub struct FilterPlatforms<H> {
    inner: H,
    matcher: Arc<dyn PlatformMatcher>,
}

impl<H: Handler> FilterPlatforms<H> {
    pub fn new(inner: H, matcher: Arc<dyn PlatformMatcher>) -> Self {
        Self { inner, matcher }
    }
}

#[async_trait]
impl<H: Handler> Handler for FilterPlatforms<H> {
    async fn handle(&self, desc: &Descriptor) -> LazypullResult<Step> {
        match self.inner.handle(desc).await? {
            Step::Skip => Ok(Step::Skip),
            Step::Children(children) => Ok(Step::Children(
                children
                    .into_iter()
                    .filter(|c| c.platform.as_ref().is_none_or(|p| self.matcher.matches(p)))
                    .collect(),
            )),
        }
    }
}

/// Keeps at most `limit` children of an index, best platform match first.
/// An index left with no children is an error.
pub struct LimitManifests<H> {
    inner: H,
    matcher: Arc<dyn PlatformMatcher>,
    limit: usize,
}

impl<H: Handler> LimitManifests<H> {
    pub fn new(inner: H, matcher: Arc<dyn PlatformMatcher>, limit: usize) -> Self {
        Self {
            inner,
            matcher,
            limit,
        }
    }
}

#[async_trait]
impl<H: Handler> Handler for LimitManifests<H> {
    async fn handle(&self, desc: &Descriptor) -> LazypullResult<Step> {
        let mut children = match self.inner.handle(desc).await? {
            Step::Skip => return Ok(Step::Skip),
            Step::Children(children) => children,
        };

        if media_types::is_index(&desc.media_type) {
            sort_by_platform(&mut children, self.matcher.as_ref());
            if self.limit > 0 {
                if children.is_empty() {
                    return Err(LazypullError::NotFound(format!(
                        "no match for platform in manifest {}",
                        desc.digest
                    )));
                }
                children.truncate(self.limit);
            }
        }
        Ok(Step::Children(children))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::MemoryStore;
    use crate::images::descriptor::sha256_digest;
    use crate::platforms::{Only, Platform};
    use lazypull_shared::constants::media_types::*;
    use serde_json::json;

    struct Fixed(Step);

    #[async_trait]
    impl Handler for Fixed {
        async fn handle(&self, _desc: &Descriptor) -> LazypullResult<Step> {
            Ok(self.0.clone())
        }
    }

    fn desc(media_type: &str, seed: &str) -> Descriptor {
        Descriptor::new(media_type, sha256_digest(seed.as_bytes()), 1)
    }

    #[tokio::test]
    async fn test_chain_concatenates_children() {
        let a = desc(OCI_CONFIG, "a");
        let b = desc(OCI_LAYER, "b");
        let chain = Handlers::new(vec![
            Arc::new(Fixed(Step::Children(vec![a.clone()]))) as Arc<dyn Handler>,
            Arc::new(Fixed(Step::Children(vec![b.clone()]))),
        ]);
        let step = chain.handle(&desc(OCI_MANIFEST, "m")).await.unwrap();
        assert_eq!(step, Step::Children(vec![a, b]));
    }

    #[tokio::test]
    async fn test_chain_stops_on_skip() {
        let metadata = MetadataMap::default();
        let chain = Handlers::new(vec![
            Arc::new(FilterLayerBlobs::new(metadata.clone())) as Arc<dyn Handler>,
            Arc::new(Fixed(Step::Children(vec![desc(OCI_CONFIG, "x")]))),
        ]);

        let step = chain.handle(&desc(OCI_LAYER_GZIP, "layer")).await.unwrap();
        assert_eq!(step, Step::Skip);
        assert!(metadata.lock().is_empty());

        let config = desc(OCI_CONFIG, "config");
        chain.handle(&config).await.unwrap();
        assert!(metadata.lock().contains_key(&config.digest));
    }

    #[tokio::test]
    async fn test_filter_platforms_keeps_unplatformed() {
        let amd = desc(OCI_MANIFEST, "amd").with_platform(Platform::new("linux", "amd64"));
        let arm = desc(OCI_MANIFEST, "arm").with_platform(Platform::new("linux", "arm64"));
        let bare = desc(OCI_CONFIG, "bare");
        let handler = FilterPlatforms::new(
            Fixed(Step::Children(vec![amd.clone(), arm, bare.clone()])),
            Arc::new(Only::new(&Platform::new("linux", "amd64"))),
        );
        let step = handler.handle(&desc(OCI_INDEX, "i")).await.unwrap();
        assert_eq!(step, Step::Children(vec![amd, bare]));
    }

    #[tokio::test]
    async fn test_limit_manifests_prefers_exact_match() {
        let v7 = desc(OCI_MANIFEST, "v7")
            .with_platform(Platform::new("linux", "arm").with_variant("v7"));
        let v8 = desc(OCI_MANIFEST, "v8")
            .with_platform(Platform::new("linux", "arm").with_variant("v8"));
        let matcher: Arc<dyn PlatformMatcher> =
            Arc::new(Only::new(&Platform::new("linux", "arm").with_variant("v8")));
        let handler = LimitManifests::new(
            Fixed(Step::Children(vec![v7, v8.clone()])),
            matcher,
            1,
        );
        let step = handler.handle(&desc(OCI_INDEX, "i")).await.unwrap();
        assert_eq!(step, Step::Children(vec![v8]));
    }

    #[tokio::test]
    async fn test_limit_manifests_empty_index_is_not_found() {
        let matcher: Arc<dyn PlatformMatcher> =
            Arc::new(Only::new(&Platform::new("linux", "amd64")));
        let handler = LimitManifests::new(Fixed(Step::done()), matcher, 1);
        let err = handler.handle(&desc(OCI_INDEX, "i")).await.unwrap_err();
        assert!(err.is_not_found());

        // Non-index nodes pass through untouched.
        let step = handler.handle(&desc(OCI_MANIFEST, "m")).await.unwrap();
        assert_eq!(step, Step::done());
    }

    #[tokio::test]
    async fn test_children_handler_reads_store() {
        let store = Arc::new(MemoryStore::new());
        let config = desc(OCI_CONFIG, "cfg");
        let data = serde_json::to_vec(&json!({"schemaVersion": 2, "config": config, "layers": []}))
            .unwrap();
        store.insert(data.clone());
        let manifest = Descriptor::from_bytes(OCI_MANIFEST, &data);

        let handler = ChildrenHandler::new(store);
        let step = handler.handle(&manifest).await.unwrap();
        assert_eq!(step, Step::Children(vec![config]));
    }
}
