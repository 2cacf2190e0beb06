//! Legacy Docker schema1 manifests.
//!
//! Schema1 manifests carry no config blob and no diff IDs, so they cannot be
//! pulled lazily. The converter downloads every real layer, hashes its
//! uncompressed content, and synthesizes an equivalent schema2 manifest and
//! config in the store.
//!
//! Usage: walk the schema1 root with the converter as handler, then call
//! [`Schema1Converter::convert`] for the descriptor of the new manifest.

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::Arc;

use async_trait::async_trait;
use flate2::read::MultiGzDecoder;
use oci_spec::image::{History, HistoryBuilder, RootFsBuilder};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Fetcher, collect_stream};
use crate::content::{ContentStore, read_blob, write_blob};
use crate::images::{Descriptor, Digester, Handler, Manifest, Step, media_types};
use lazypull_shared::constants::annotations::UNCOMPRESSED;
use lazypull_shared::constants::labels::GC_REF_CONTENT_PREFIX;
use lazypull_shared::constants::media_types::{
    DOCKER_CONFIG, DOCKER_LAYER_GZIP, DOCKER_MANIFEST,
};
use lazypull_shared::{LazypullError, LazypullResult};

/// Keys of a v1Compatibility entry that have no place in an image config.
const V1_ONLY_KEYS: &[&str] = &["id", "parent", "Size", "parent_id", "layer_id", "throwaway"];

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Schema1Manifest {
    #[serde(default)]
    fs_layers: Vec<FsLayer>,
    #[serde(default)]
    history: Vec<V1Entry>,
}

#[derive(Debug, Clone, Deserialize)]
struct FsLayer {
    #[serde(rename = "blobSum")]
    blob_sum: String,
}

#[derive(Debug, Clone, Deserialize)]
struct V1Entry {
    #[serde(rename = "v1Compatibility")]
    v1_compatibility: String,
}

#[derive(Debug, Default, Deserialize)]
struct V1History {
    #[serde(default)]
    author: String,
    #[serde(default)]
    created: String,
    #[serde(default)]
    comment: String,
    #[serde(default)]
    throwaway: bool,
    #[serde(default)]
    container_config: Option<V1ContainerConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct V1ContainerConfig {
    #[serde(rename = "Cmd", default)]
    cmd: Option<Vec<String>>,
}

impl V1History {
    fn parse(raw: &str) -> LazypullResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| LazypullError::LegacyConversion(format!("bad v1Compatibility: {e}")))
    }

    fn created_by(&self) -> String {
        self.container_config
            .as_ref()
            .and_then(|c| c.cmd.as_ref())
            .map(|cmd| cmd.join(" "))
            .unwrap_or_default()
    }
}

/// Uncompressed digest and stored size of a downloaded layer.
#[derive(Debug, Clone)]
struct BlobState {
    diff_id: String,
    size: i64,
}

#[derive(Default)]
struct ConverterState {
    manifest: Option<Schema1Manifest>,
    /// Layers the walk must download, keyed by blob sum.
    pending: HashMap<String, Option<BlobState>>,
}

/// Handler that eagerly pulls a schema1 image and converts it.
pub struct Schema1Converter {
    store: Arc<dyn ContentStore>,
    fetcher: Arc<dyn Fetcher>,
    state: Mutex<ConverterState>,
}

impl Schema1Converter {
    pub fn new(store: Arc<dyn ContentStore>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            store,
            fetcher,
            state: Mutex::new(ConverterState::default()),
        }
    }

    async fn handle_manifest(&self, desc: &Descriptor) -> LazypullResult<Step> {
        let data = match self.store.info(&desc.digest).await {
            Ok(_) => read_blob(self.store.as_ref(), desc).await?,
            Err(_) => collect_stream(self.fetcher.fetch(desc).await?).await?,
        };
        let manifest: Schema1Manifest =
            serde_json::from_slice(&data).map_err(|e| LazypullError::InvalidManifest {
                digest: desc.digest.clone(),
                reason: e.to_string(),
            })?;
        if manifest.fs_layers.len() != manifest.history.len() {
            return Err(LazypullError::InvalidManifest {
                digest: desc.digest.clone(),
                reason: format!(
                    "{} fsLayers but {} history entries",
                    manifest.fs_layers.len(),
                    manifest.history.len()
                ),
            });
        }

        // fsLayers run top to bottom; collect real layers bottom first.
        let mut layers = Vec::new();
        {
            let mut state = self.state.lock();
            for (layer, entry) in manifest.fs_layers.iter().zip(&manifest.history).rev() {
                if V1History::parse(&entry.v1_compatibility)?.throwaway {
                    continue;
                }
                if state.pending.contains_key(&layer.blob_sum) {
                    continue;
                }
                state.pending.insert(layer.blob_sum.clone(), None);
                layers.push(Descriptor::new(DOCKER_LAYER_GZIP, layer.blob_sum.clone(), -1));
            }
            state.manifest = Some(manifest);
        }

        tracing::info!(
            digest = %desc.digest,
            layers = layers.len(),
            "Converting schema1 manifest, downloading layers"
        );
        Ok(Step::Children(layers))
    }

    async fn handle_layer(&self, desc: &Descriptor) -> LazypullResult<Step> {
        if !self.state.lock().pending.contains_key(&desc.digest) {
            return Ok(Step::done());
        }

        let data = match self.store.info(&desc.digest).await {
            Ok(_) => read_blob(self.store.as_ref(), desc).await?,
            Err(_) => {
                let data = collect_stream(self.fetcher.fetch(desc).await?).await?;
                let mut digester = Digester::new();
                digester.update(&data);
                let actual = digester.finalize();
                if actual != desc.digest {
                    tracing::error!(
                        expected = %desc.digest,
                        actual = %actual,
                        "Layer integrity check failed"
                    );
                    return Err(LazypullError::DigestMismatch {
                        expected: desc.digest.clone(),
                        actual,
                    });
                }
                data
            }
        };

        let size = data.len() as i64;
        let (diff_id, data) = tokio::task::spawn_blocking(move || {
            uncompressed_digest(&data).map(|diff_id| (diff_id, data))
        })
        .await
        .map_err(|e| LazypullError::Internal(format!("diff id task failed: {e}")))??;

        let mut labels = BTreeMap::new();
        labels.insert(UNCOMPRESSED.to_string(), diff_id.clone());
        let stored = Descriptor::new(DOCKER_LAYER_GZIP, desc.digest.clone(), size);
        write_blob(self.store.as_ref(), &stored, &data, labels).await?;

        tracing::debug!(digest = %desc.digest, diff_id = %diff_id, "Computed layer diff id");
        self.state
            .lock()
            .pending
            .insert(desc.digest.clone(), Some(BlobState { diff_id, size }));
        Ok(Step::done())
    }

    /// Write the synthesized config and schema2 manifest to the store and
    /// return the manifest's descriptor. Call after the walk completes.
    pub async fn convert(&self) -> LazypullResult<Descriptor> {
        let (config, layers) = {
            let state = self.state.lock();
            let schema1 = state.manifest.as_ref().ok_or_else(|| {
                LazypullError::LegacyConversion("no schema1 manifest was walked".into())
            })?;
            build_image(schema1, &state.pending)?
        };

        let config_bytes = serde_json::to_vec(&config)?;
        let config_desc = Descriptor::from_bytes(DOCKER_CONFIG, &config_bytes);

        let manifest = Manifest {
            schema_version: 2,
            media_type: Some(DOCKER_MANIFEST.to_string()),
            config: config_desc.clone(),
            layers,
            annotations: None,
        };
        let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;
        let manifest_desc = Descriptor::from_bytes(DOCKER_MANIFEST, &manifest_bytes);

        let mut gc_refs = BTreeMap::new();
        gc_refs.insert(format!("{GC_REF_CONTENT_PREFIX}0"), config_desc.digest.clone());
        for (i, layer) in manifest.layers.iter().enumerate() {
            gc_refs.insert(format!("{GC_REF_CONTENT_PREFIX}{}", i + 1), layer.digest.clone());
        }

        write_blob(self.store.as_ref(), &config_desc, &config_bytes, BTreeMap::new()).await?;
        write_blob(self.store.as_ref(), &manifest_desc, &manifest_bytes, gc_refs).await?;

        tracing::info!(
            manifest = %manifest_desc.digest,
            config = %config_desc.digest,
            "Converted schema1 image"
        );
        Ok(manifest_desc)
    }
}

#[async_trait]
impl Handler for Schema1Converter {
    async fn handle(&self, desc: &Descriptor) -> LazypullResult<Step> {
        if media_types::is_schema1(&desc.media_type) {
            self.handle_manifest(desc).await
        } else if media_types::is_layer(&desc.media_type) {
            self.handle_layer(desc).await
        } else {
            Ok(Step::done())
        }
    }
}

#[derive(Serialize)]
struct ConfigTail {
    rootfs: oci_spec::image::RootFs,
    history: Vec<History>,
}

/// Build the image config and the layer list (bottom first).
fn build_image(
    schema1: &Schema1Manifest,
    blobs: &HashMap<String, Option<BlobState>>,
) -> LazypullResult<(Value, Vec<Descriptor>)> {
    let top = schema1
        .history
        .first()
        .ok_or_else(|| LazypullError::LegacyConversion("manifest has no history".into()))?;

    let mut history = Vec::with_capacity(schema1.history.len());
    let mut diff_ids = Vec::new();
    let mut layers = Vec::new();
    for (layer, entry) in schema1.fs_layers.iter().zip(&schema1.history).rev() {
        let v1 = V1History::parse(&entry.v1_compatibility)?;
        history.push(
            HistoryBuilder::default()
                .created(v1.created.clone())
                .created_by(v1.created_by())
                .author(v1.author.clone())
                .comment(v1.comment.clone())
                .empty_layer(v1.throwaway)
                .build()
                .map_err(|e| LazypullError::LegacyConversion(e.to_string()))?,
        );
        if v1.throwaway {
            continue;
        }
        let state = blobs
            .get(&layer.blob_sum)
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                LazypullError::LegacyConversion(format!("layer {} was not downloaded", layer.blob_sum))
            })?;
        diff_ids.push(state.diff_id.clone());
        layers.push(Descriptor::new(DOCKER_LAYER_GZIP, layer.blob_sum.clone(), state.size));
    }

    let mut config: Map<String, Value> = serde_json::from_str(&top.v1_compatibility)
        .map_err(|e| LazypullError::LegacyConversion(format!("bad v1Compatibility: {e}")))?;
    for key in V1_ONLY_KEYS {
        config.remove(*key);
    }

    let rootfs = RootFsBuilder::default()
        .typ("layers")
        .diff_ids(diff_ids)
        .build()
        .map_err(|e| LazypullError::LegacyConversion(e.to_string()))?;
    let mut tail = serde_json::to_value(ConfigTail { rootfs, history })?;
    if let Some(entries) = tail.get_mut("history").and_then(Value::as_array_mut) {
        for entry in entries.iter_mut().filter_map(Value::as_object_mut) {
            entry.retain(|_, v| v.as_str() != Some(""));
        }
    }
    if let Value::Object(tail) = tail {
        config.extend(tail);
    }

    Ok((Value::Object(config), layers))
}

/// sha256 of the layer's uncompressed content. Non-gzip data is hashed as is.
fn uncompressed_digest(data: &[u8]) -> LazypullResult<String> {
    let mut digester = Digester::new();
    if data.starts_with(&[0x1f, 0x8b]) {
        let mut decoder = MultiGzDecoder::new(data);
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = decoder.read(&mut buf)?;
            if n == 0 {
                break;
            }
            digester.update(&buf[..n]);
        }
    } else {
        digester.update(data);
    }
    Ok(digester.finalize())
}
