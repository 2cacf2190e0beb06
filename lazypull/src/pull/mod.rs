//! Lazy manifest puller.
//!
//! [`Puller`] resolves an image reference once, walks the metadata graph
//! (indexes, manifests, configs) into the content store, and leaves layer
//! blobs on the remote. Layers come back as descriptors annotated with their
//! uncompressed digests plus a [`Provider`] that streams them on demand.
//!
//! Legacy schema1 images are the exception: they are pulled eagerly and
//! converted, since their diff IDs are only known after decompression.

mod layers;

pub use layers::{annotate_layers, get_layers};

use std::sync::Arc;

use async_trait::async_trait;
use oci_client::Reference;
use tokio::sync::{OnceCell, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::content::{ContentStore, FetcherReaderAt, Provider, ReaderAt, read_blob};
use crate::images::{
    ChildrenHandler, Descriptor, FilterLayerBlobs, FilterPlatforms, Handler, Handlers,
    LimitManifests, MetadataMap, detect_manifest_media_type, dispatch, media_types,
};
use crate::options::PullOptions;
use crate::platforms::{Only, Platform, PlatformMatcher};
use crate::remotes::{DistributionSourceHandler, FetchHandler, Resolver, Schema1Converter};
use lazypull_shared::{LazypullError, LazypullResult};

/// Layer descriptors plus where to read them from.
#[derive(Clone)]
pub struct Remote {
    /// Image layers, bottom first, annotated with `containerd.io/uncompressed`.
    pub descriptors: Vec<Descriptor>,
    /// Streams layer content from the registry on demand.
    pub provider: Arc<dyn Provider>,
}

impl std::fmt::Debug for Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remote")
            .field("descriptors", &self.descriptors)
            .finish_non_exhaustive()
    }
}

/// Result of [`Puller::pull_manifests`].
#[derive(Clone, Debug)]
pub struct PulledManifests {
    /// Canonical reference the image was resolved as.
    pub reference: String,
    /// Root descriptor: an index, a manifest, or the manifest converted from
    /// schema1.
    pub main_manifest: Descriptor,
    pub config: Descriptor,
    /// Every non-layer descriptor the walk visited (root, manifests, config).
    pub nonlayers: Vec<Descriptor>,
    pub remote: Remote,
}

#[derive(Clone, Debug)]
struct Resolved {
    reference: String,
    desc: Descriptor,
}

/// Memoized outcome of a successful walk.
#[derive(Clone, Debug)]
struct PullState {
    reference: String,
    main_manifest: Descriptor,
    config: Descriptor,
    nonlayers: Vec<Descriptor>,
    layers: Vec<Descriptor>,
}

/// Pulls the manifests of one image reference for one platform.
///
/// Resolution happens at most once: concurrent callers share it, and a
/// failed resolution stays failed for the lifetime of the puller.
pub struct Puller {
    store: Arc<dyn ContentStore>,
    resolver: Arc<dyn Resolver>,
    src: Reference,
    platform: Platform,
    options: PullOptions,
    resolved: OnceCell<LazypullResult<Resolved>>,
    pulled: OnceCell<PullState>,
}

impl std::fmt::Debug for Puller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Puller")
            .field("src", &self.src.whole())
            .field("platform", &self.platform)
            .finish_non_exhaustive()
    }
}

impl Puller {
    pub fn new(
        store: Arc<dyn ContentStore>,
        resolver: Arc<dyn Resolver>,
        src: Reference,
        platform: Platform,
    ) -> Self {
        Self {
            store,
            resolver,
            src,
            platform,
            options: PullOptions::default(),
            resolved: OnceCell::new(),
            pulled: OnceCell::new(),
        }
    }

    /// Build a puller whose platform comes from `options` (host if unset).
    pub fn from_options(
        store: Arc<dyn ContentStore>,
        resolver: Arc<dyn Resolver>,
        src: Reference,
        options: PullOptions,
    ) -> LazypullResult<Self> {
        let platform = options.target_platform()?;
        Ok(Self::new(store, resolver, src, platform).with_options(options))
    }

    pub fn with_options(mut self, options: PullOptions) -> Self {
        self.options = options;
        self
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    // ========================================================================
    // RESOLUTION
    // ========================================================================

    async fn resolve(&self) -> LazypullResult<Resolved> {
        self.resolved
            .get_or_init(|| async {
                match self.resolve_local().await {
                    Ok(resolved) => {
                        tracing::debug!(
                            reference = %resolved.reference,
                            digest = %resolved.desc.digest,
                            "Resolved from local store"
                        );
                        Ok(resolved)
                    }
                    Err(e) => {
                        tracing::debug!(
                            reference = %self.src.whole(),
                            error = %e,
                            "Local resolution failed, resolving remotely"
                        );
                        self.resolver
                            .resolve(&self.src.whole())
                            .await
                            .map(|(reference, desc)| Resolved { reference, desc })
                    }
                }
            })
            .await
            .clone()
    }

    /// Digest references whose root is already stored need no registry.
    async fn resolve_local(&self) -> LazypullResult<Resolved> {
        let digest = self.src.digest().ok_or_else(|| {
            LazypullError::NotFound(format!("{} has no digest", self.src.whole()))
        })?;
        let info = self.store.info(digest).await?;
        let mut desc = Descriptor::new("", digest, info.size);
        let data = read_blob(self.store.as_ref(), &desc).await?;
        desc.media_type = detect_manifest_media_type(&data)?;
        Ok(Resolved {
            reference: self.src.whole(),
            desc,
        })
    }

    // ========================================================================
    // PULL
    // ========================================================================

    /// Fetch all metadata into the store and describe the layers.
    ///
    /// The first successful result is kept; later calls return a copy of it
    /// without touching the store or the registry.
    pub async fn pull_manifests(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> LazypullResult<PulledManifests> {
        let state = self
            .pulled
            .get_or_try_init(|| self.pull_with_deadline(cancel))
            .await?
            .clone();

        Ok(PulledManifests {
            reference: state.reference,
            main_manifest: state.main_manifest,
            config: state.config,
            nonlayers: state.nonlayers,
            remote: Remote {
                descriptors: state.layers,
                provider: Arc::clone(self) as Arc<dyn Provider>,
            },
        })
    }

    async fn pull_with_deadline(&self, cancel: &CancellationToken) -> LazypullResult<PullState> {
        match self.options.pull_timeout() {
            Some(limit) => tokio::time::timeout(limit, self.pull(cancel))
                .await
                .map_err(|_| LazypullError::Timeout(limit))?,
            None => self.pull(cancel).await,
        }
    }

    async fn pull(&self, cancel: &CancellationToken) -> LazypullResult<PullState> {
        let resolved = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LazypullError::Cancelled),
            resolved = self.resolve() => resolved?,
        };
        tracing::info!(
            reference = %resolved.reference,
            digest = %resolved.desc.digest,
            media_type = %resolved.desc.media_type,
            platform = %self.platform,
            "Pulling image manifests"
        );

        if !media_types::is_manifest_like(&resolved.desc.media_type) {
            return Err(LazypullError::UnsupportedMediaType(
                resolved.desc.media_type.clone(),
            ));
        }

        let matcher: Arc<dyn PlatformMatcher> = Arc::new(Only::new(&self.platform));
        let metadata = MetadataMap::default();
        let fetcher = self.resolver.fetcher(&resolved.reference).await?;
        let limiter = Semaphore::new(self.options.concurrency());

        let mut root = resolved.desc.clone();
        if media_types::is_schema1(&root.media_type) {
            let converter = Schema1Converter::new(Arc::clone(&self.store), Arc::clone(&fetcher));
            dispatch(&converter, Some(&limiter), cancel, vec![root.clone()]).await?;
            root = converter.convert().await?;

            let handlers = Handlers::new(vec![
                Arc::new(FilterLayerBlobs::new(Arc::clone(&metadata))) as Arc<dyn Handler>,
                Arc::new(FilterPlatforms::new(
                    ChildrenHandler::new(Arc::clone(&self.store)),
                    Arc::clone(&matcher),
                )),
            ]);
            dispatch(&handlers, None, cancel, vec![root.clone()]).await?;
        } else {
            let children = LimitManifests::new(
                FilterPlatforms::new(
                    ChildrenHandler::new(Arc::clone(&self.store)),
                    Arc::clone(&matcher),
                ),
                Arc::clone(&matcher),
                1,
            );
            let handlers = Handlers::new(vec![
                Arc::new(FilterLayerBlobs::new(Arc::clone(&metadata))) as Arc<dyn Handler>,
                Arc::new(FetchHandler::new(Arc::clone(&self.store), Arc::clone(&fetcher))),
                Arc::new(children),
                Arc::new(DistributionSourceHandler::new(
                    Arc::clone(&self.store),
                    &resolved.reference,
                )?),
            ]);
            dispatch(&handlers, Some(&limiter), cancel, vec![root.clone()]).await?;
        }

        let mut nonlayers: Vec<Descriptor> = metadata.lock().values().cloned().collect();
        nonlayers.sort_by(|a, b| a.digest.cmp(&b.digest));

        let layers = get_layers(self.store.as_ref(), &root, matcher.as_ref()).await?;
        let config = crate::images::manifest(self.store.as_ref(), &root, matcher.as_ref())
            .await?
            .config;
        let config = nonlayers
            .iter()
            .find(|d| d.digest == config.digest && media_types::is_config(&d.media_type))
            .cloned()
            .ok_or_else(|| {
                LazypullError::NotFound(format!("config {} was not walked", config.digest))
            })?;

        tracing::info!(
            reference = %resolved.reference,
            config = %config.digest,
            nonlayers = nonlayers.len(),
            layers = layers.len(),
            "Pulled image manifests"
        );
        Ok(PullState {
            reference: resolved.reference,
            main_manifest: root,
            config,
            nonlayers,
            layers,
        })
    }
}

#[async_trait]
impl Provider for Puller {
    /// Stream `desc` from the registry. Nothing is written to the store.
    async fn reader_at(&self, desc: &Descriptor) -> LazypullResult<Box<dyn ReaderAt>> {
        let resolved = self.resolve().await?;
        let fetcher = self.resolver.fetcher(&resolved.reference).await?;
        Ok(Box::new(FetcherReaderAt::new(fetcher, desc.clone())))
    }
}
