//! Fixtures for lazypull tests.
//!
//! - [`ImageBuilder`] / [`index`] / [`Schema1Builder`]: build image blobs and
//!   their descriptors in memory
//! - [`FakeRegistry`]: an in-process [`Resolver`] + [`Fetcher`] that counts
//!   calls and can be told to fail

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde_json::json;

use lazypull::content::MemoryStore;
use lazypull::images::{Descriptor, detect_manifest_media_type, sha256_digest};
use lazypull::platforms::Platform;
use lazypull::remotes::{BlobStream, Fetcher, Resolver};
use lazypull_shared::constants::media_types::{
    DOCKER_LAYER_GZIP, DOCKER_SCHEMA1_MANIFEST, OCI_CONFIG, OCI_INDEX, OCI_LAYER_GZIP,
    OCI_MANIFEST,
};
use lazypull_shared::{LazypullError, LazypullResult};

/// Chunk size the fake registry streams blobs in.
pub const CHUNK_SIZE: usize = 16;

// ============================================================================
// BLOBS
// ============================================================================

/// A blob and the descriptor naming it.
#[derive(Debug, Clone)]
pub struct Blob {
    pub desc: Descriptor,
    pub data: Bytes,
}

impl Blob {
    pub fn new(media_type: &str, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            desc: Descriptor::from_bytes(media_type, &data),
            data,
        }
    }

    pub fn json(media_type: &str, value: serde_json::Value) -> Self {
        Self::new(media_type, serde_json::to_vec(&value).expect("serialize fixture"))
    }
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(data).expect("gzip fixture");
    encoder.finish().expect("gzip fixture")
}

/// Every blob of an image, root last.
#[derive(Debug, Clone)]
pub struct Image {
    pub root: Blob,
    pub config: Option<Blob>,
    pub layers: Vec<Blob>,
    pub diff_ids: Vec<String>,
    /// Other blobs reachable from the root (nested manifests and configs).
    pub others: Vec<Blob>,
}

impl Image {
    pub fn blobs(&self) -> Vec<Blob> {
        let mut blobs = self.others.clone();
        blobs.extend(self.config.iter().cloned());
        blobs.extend(self.layers.iter().cloned());
        blobs.push(self.root.clone());
        blobs
    }

    /// Non-layer blobs only.
    pub fn metadata(&self) -> Vec<Blob> {
        let mut blobs = self.others.clone();
        blobs.extend(self.config.iter().cloned());
        blobs.push(self.root.clone());
        blobs
    }

    pub fn layer_digests(&self) -> Vec<String> {
        self.layers.iter().map(|l| l.desc.digest.clone()).collect()
    }
}

/// Builds a single-platform OCI image.
pub struct ImageBuilder {
    platform: Platform,
    layers: Vec<Vec<u8>>,
    extra_diff_ids: Vec<String>,
}

impl ImageBuilder {
    pub fn new(os: &str, arch: &str) -> Self {
        Self {
            platform: Platform::new(os, arch),
            layers: Vec::new(),
            extra_diff_ids: Vec::new(),
        }
    }

    pub fn variant(mut self, variant: &str) -> Self {
        self.platform = self.platform.with_variant(variant);
        self
    }

    /// Add a layer whose uncompressed content is `content`.
    pub fn layer(mut self, content: &[u8]) -> Self {
        self.layers.push(content.to_vec());
        self
    }

    /// Record a diff ID that has no matching layer.
    pub fn extra_diff_id(mut self, content: &[u8]) -> Self {
        self.extra_diff_ids.push(sha256_digest(content));
        self
    }

    pub fn build(self) -> Image {
        let layers: Vec<Blob> = self
            .layers
            .iter()
            .map(|content| Blob::new(OCI_LAYER_GZIP, gzip(content)))
            .collect();
        let mut diff_ids: Vec<String> = self.layers.iter().map(|c| sha256_digest(c)).collect();
        diff_ids.extend(self.extra_diff_ids);

        let mut config = json!({
            "architecture": self.platform.architecture,
            "os": self.platform.os,
            "config": {"Env": ["PATH=/usr/bin"]},
            "rootfs": {"type": "layers", "diff_ids": diff_ids},
        });
        if let Some(variant) = &self.platform.variant {
            config["variant"] = json!(variant);
        }
        let config = Blob::json(OCI_CONFIG, config);
        let layer_descs: Vec<&Descriptor> = layers.iter().map(|l| &l.desc).collect();
        let root = Blob::json(
            OCI_MANIFEST,
            json!({
                "schemaVersion": 2,
                "mediaType": OCI_MANIFEST,
                "config": config.desc,
                "layers": layer_descs,
            }),
        );

        Image {
            root,
            config: Some(config),
            layers,
            diff_ids,
            others: Vec::new(),
        }
    }
}

/// Wrap single-platform images in an OCI index.
pub fn index(images: &[Image]) -> Image {
    let mut entries = Vec::new();
    let mut others = Vec::new();
    let mut layers = Vec::new();
    for image in images {
        let config = image.config.as_ref().expect("index entries need a config");
        let parsed: serde_json::Value =
            serde_json::from_slice(&config.data).expect("fixture config");
        let mut platform = Platform::new(
            parsed["os"].as_str().unwrap_or_default(),
            parsed["architecture"].as_str().unwrap_or_default(),
        );
        if let Some(variant) = parsed["variant"].as_str() {
            platform = platform.with_variant(variant);
        }
        entries.push(image.root.desc.clone().with_platform(platform));
        others.push(image.root.clone());
        others.push(config.clone());
        layers.extend(image.layers.iter().cloned());
    }

    let root = Blob::json(
        OCI_INDEX,
        json!({"schemaVersion": 2, "mediaType": OCI_INDEX, "manifests": entries}),
    );
    Image {
        root,
        config: None,
        layers,
        diff_ids: Vec::new(),
        others,
    }
}

/// Builds a legacy schema1 image. Entries are given bottom first.
pub struct Schema1Builder {
    entries: Vec<(Option<Vec<u8>>, String)>,
}

impl Default for Schema1Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Schema1Builder {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// A real layer with uncompressed `content`, created by `cmd`.
    pub fn layer(mut self, content: &[u8], cmd: &str) -> Self {
        self.entries.push((Some(content.to_vec()), cmd.to_string()));
        self
    }

    /// A metadata-only history entry.
    pub fn throwaway(mut self, cmd: &str) -> Self {
        self.entries.push((None, cmd.to_string()));
        self
    }

    pub fn build(self) -> Image {
        // Throwaway entries still name a blob; registries use the empty tar.
        let empty = Blob::new(DOCKER_LAYER_GZIP, gzip(b""));

        let mut layers = Vec::new();
        let mut diff_ids = Vec::new();
        let mut fs_layers = Vec::new();
        let mut history = Vec::new();
        let count = self.entries.len();
        for (i, (content, cmd)) in self.entries.iter().enumerate() {
            let blob = match content {
                Some(content) => {
                    let blob = Blob::new(DOCKER_LAYER_GZIP, gzip(content));
                    layers.push(blob.clone());
                    diff_ids.push(sha256_digest(content));
                    blob
                }
                None => empty.clone(),
            };
            let mut v1 = json!({
                "id": format!("layer{i}"),
                "created": format!("2020-01-0{}T00:00:00Z", (i % 9) + 1),
                "container_config": {"Cmd": ["/bin/sh", "-c", cmd]},
            });
            if i > 0 {
                v1["parent"] = json!(format!("layer{}", i - 1));
            }
            if content.is_none() {
                v1["throwaway"] = json!(true);
            }
            if i + 1 == count {
                v1["architecture"] = json!("amd64");
                v1["os"] = json!("linux");
                v1["config"] = json!({"Cmd": ["sh"]});
            }
            fs_layers.push(json!({"blobSum": blob.desc.digest}));
            history.push(json!({"v1Compatibility": v1.to_string()}));
        }
        fs_layers.reverse();
        history.reverse();

        let root = Blob::json(
            DOCKER_SCHEMA1_MANIFEST,
            json!({
                "schemaVersion": 1,
                "name": "library/legacy",
                "tag": "latest",
                "architecture": "amd64",
                "fsLayers": fs_layers,
                "history": history,
            }),
        );
        Image {
            root,
            config: None,
            layers,
            diff_ids,
            others: vec![empty],
        }
    }
}

/// Copy blobs straight into a store, bypassing any pull.
pub fn seed_store(store: &MemoryStore, blobs: &[Blob]) {
    for blob in blobs {
        store.insert(blob.data.clone());
    }
}

// ============================================================================
// FAKE REGISTRY
// ============================================================================

#[derive(Default)]
struct RegistryState {
    blobs: RwLock<HashMap<String, Bytes>>,
    tags: RwLock<HashMap<String, Descriptor>>,
    resolve_calls: AtomicUsize,
    fetched: Mutex<Vec<String>>,
    fail_resolve: AtomicBool,
    fail_fetch: Mutex<HashSet<String>>,
    resolve_delay: Mutex<Duration>,
}

/// In-memory registry implementing [`Resolver`] and [`Fetcher`].
#[derive(Clone, Default)]
pub struct FakeRegistry {
    state: Arc<RegistryState>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_blob(&self, blob: &Blob) {
        self.state
            .blobs
            .write()
            .insert(blob.desc.digest.clone(), blob.data.clone());
    }

    /// Upload every blob of `image` and tag its root as `reference`.
    pub fn push(&self, reference: &str, image: &Image) {
        for blob in image.blobs() {
            self.push_blob(&blob);
        }
        self.tag(reference, image.root.desc.clone());
    }

    pub fn tag(&self, reference: &str, desc: Descriptor) {
        self.state.tags.write().insert(reference.to_string(), desc);
    }

    pub fn resolve_calls(&self) -> usize {
        self.state.resolve_calls.load(Ordering::SeqCst)
    }

    /// Digests fetched so far, in request order.
    pub fn fetched(&self) -> Vec<String> {
        self.state.fetched.lock().clone()
    }

    pub fn set_fail_resolve(&self, fail: bool) {
        self.state.fail_resolve.store(fail, Ordering::SeqCst);
    }

    pub fn fail_fetch(&self, digest: &str) {
        self.state.fail_fetch.lock().insert(digest.to_string());
    }

    pub fn set_resolve_delay(&self, delay: Duration) {
        *self.state.resolve_delay.lock() = delay;
    }
}

#[async_trait]
impl Resolver for FakeRegistry {
    async fn resolve(&self, reference: &str) -> LazypullResult<(String, Descriptor)> {
        self.state.resolve_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.state.resolve_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.state.fail_resolve.load(Ordering::SeqCst) {
            return Err(LazypullError::Resolve {
                reference: reference.to_string(),
                reason: "registry unavailable".into(),
            });
        }

        if let Some(desc) = self.state.tags.read().get(reference) {
            return Ok((reference.to_string(), desc.clone()));
        }

        // Digest references resolve to the manifest stored under that digest.
        let digest = reference
            .rsplit_once('@')
            .map(|(_, d)| d)
            .ok_or_else(|| LazypullError::NotFound(reference.to_string()))?;
        let data = self
            .state
            .blobs
            .read()
            .get(digest)
            .cloned()
            .ok_or_else(|| LazypullError::NotFound(reference.to_string()))?;
        let media_type = detect_manifest_media_type(&data)?;
        Ok((
            reference.to_string(),
            Descriptor::new(media_type, digest, data.len() as i64),
        ))
    }

    async fn fetcher(&self, _reference: &str) -> LazypullResult<Arc<dyn Fetcher>> {
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl Fetcher for FakeRegistry {
    async fn fetch(&self, desc: &Descriptor) -> LazypullResult<BlobStream> {
        self.state.fetched.lock().push(desc.digest.clone());
        if self.state.fail_fetch.lock().contains(&desc.digest) {
            return Err(LazypullError::Fetch {
                digest: desc.digest.clone(),
                reason: "injected failure".into(),
            });
        }
        let data = self
            .state
            .blobs
            .read()
            .get(&desc.digest)
            .cloned()
            .ok_or_else(|| LazypullError::NotFound(desc.digest.clone()))?;

        let chunks: Vec<LazypullResult<Bytes>> = data
            .chunks(CHUNK_SIZE)
            .map(|c| Ok(data.slice_ref(c)))
            .collect();
        Ok(futures::stream::iter(chunks).boxed())
    }
}
