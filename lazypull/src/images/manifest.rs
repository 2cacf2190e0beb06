//! Manifest and index model, plus the readers that walk them.
//!
//! - `detect_manifest_media_type`: sniff a manifest blob whose media type is
//!   unknown (local resolution only knows the digest)
//! - `children`: direct children of a node in the content graph
//! - `manifest`: pick the platform manifest reachable from a root
//! - `rootfs`: diff IDs recorded in the selected image config

use std::collections::BTreeMap;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::descriptor::{Descriptor, sha256_digest, validate_digest};
use super::media_types;
use crate::content::{Provider, read_blob};
use crate::platforms::{Platform, PlatformMatcher};
use lazypull_shared::constants::media_types::{
    DOCKER_MANIFEST, DOCKER_MANIFEST_LIST, DOCKER_SCHEMA1_MANIFEST,
};
use lazypull_shared::{LazypullError, LazypullResult};

// ============================================================================
// MODEL
// ============================================================================

/// Image manifest: one config and ordered layers (bottom first).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// Image index (manifest list): one manifest per platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize)]
struct RootFs {
    #[serde(default)]
    diff_ids: Vec<String>,
}

#[derive(Deserialize)]
struct ConfigRootFs {
    rootfs: RootFs,
}

// ============================================================================
// MEDIA TYPE DETECTION
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestShape {
    schema_version: Option<u32>,
    media_type: Option<String>,
    config: Option<serde_json::Value>,
    layers: Option<serde_json::Value>,
    manifests: Option<serde_json::Value>,
    fs_layers: Option<serde_json::Value>,
}

/// Work out the media type of a manifest blob from its contents.
///
/// An explicit `mediaType` wins when it agrees with the document's shape.
/// Without one, `config`/`layers` mean an image manifest and anything else is
/// treated as a manifest list. `schemaVersion: 1` with `fsLayers` is the
/// legacy schema1 format.
pub fn detect_manifest_media_type(data: &[u8]) -> LazypullResult<String> {
    let invalid = |reason: String| LazypullError::InvalidManifest {
        digest: sha256_digest(data),
        reason,
    };

    let shape: ManifestShape =
        serde_json::from_slice(data).map_err(|e| invalid(e.to_string()))?;

    if shape.schema_version == Some(1) && shape.fs_layers.is_some() {
        return Ok(match shape.media_type {
            Some(mt) if media_types::is_schema1(&mt) => mt,
            _ => DOCKER_SCHEMA1_MANIFEST.to_string(),
        });
    }

    let mut detected = DOCKER_MANIFEST_LIST;
    if shape.config.is_some() || shape.layers.is_some() {
        detected = DOCKER_MANIFEST;
        if shape.manifests.is_some() {
            return Err(invalid("ambiguous manifest and manifest list".into()));
        }
    }

    match shape.media_type {
        Some(mt) if media_types::is_index(&mt) => {
            if detected != DOCKER_MANIFEST_LIST {
                return Err(invalid(format!(
                    "mediaType {mt} does not match manifest contents"
                )));
            }
            Ok(mt)
        }
        Some(mt) if media_types::is_manifest(&mt) => {
            if detected != DOCKER_MANIFEST {
                return Err(invalid(format!(
                    "mediaType {mt} does not match manifest contents"
                )));
            }
            Ok(mt)
        }
        _ => Ok(detected.to_string()),
    }
}

// ============================================================================
// READERS
// ============================================================================

async fn read_json<P, T>(provider: &P, desc: &Descriptor) -> LazypullResult<T>
where
    P: Provider + ?Sized,
    T: DeserializeOwned,
{
    let data = read_blob(provider, desc).await?;
    serde_json::from_slice(&data).map_err(|e| LazypullError::InvalidManifest {
        digest: desc.digest.clone(),
        reason: e.to_string(),
    })
}

/// Direct children of `desc`: config and layers of a manifest, manifests of
/// an index. Leaf blobs and unknown types have none.
pub async fn children<P>(provider: &P, desc: &Descriptor) -> LazypullResult<Vec<Descriptor>>
where
    P: Provider + ?Sized,
{
    let media_type = desc.media_type.as_str();
    if media_types::is_manifest(media_type) {
        let manifest: Manifest = read_json(provider, desc).await?;
        let mut children = Vec::with_capacity(manifest.layers.len() + 1);
        children.push(manifest.config);
        children.extend(manifest.layers);
        Ok(children)
    } else if media_types::is_index(media_type) {
        let index: Index = read_json(provider, desc).await?;
        Ok(index.manifests)
    } else {
        if !media_types::is_layer(media_type) && !media_types::is_config(media_type) {
            tracing::debug!(
                digest = %desc.digest,
                media_type = %media_type,
                "Encountered unknown type; children may not be fetched"
            );
        }
        Ok(Vec::new())
    }
}

/// Sort descriptors by platform preference. Entries without a platform go last.
pub(crate) fn sort_by_platform(descs: &mut [Descriptor], matcher: &dyn PlatformMatcher) {
    descs.sort_by(|a, b| compare_platforms(a.platform.as_ref(), b.platform.as_ref(), matcher));
}

fn compare_platforms(
    a: Option<&Platform>,
    b: Option<&Platform>,
    matcher: &dyn PlatformMatcher,
) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => {
            if matcher.less(a, b) {
                Ordering::Less
            } else if matcher.less(b, a) {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        }
    }
}

type FoundManifests = Vec<(Option<Platform>, Manifest)>;

fn collect_manifests<'a, P>(
    provider: &'a P,
    root_digest: &'a str,
    desc: Descriptor,
    matcher: &'a dyn PlatformMatcher,
) -> BoxFuture<'a, LazypullResult<FoundManifests>>
where
    P: Provider + ?Sized,
{
    Box::pin(async move {
        let media_type = desc.media_type.as_str();

        if media_types::is_manifest(media_type) {
            let manifest: Manifest = read_json(provider, &desc).await?;

            // The root is taken as given; nested manifests must match.
            if desc.digest != root_digest {
                let platform = match &desc.platform {
                    Some(p) => p.clone(),
                    None => read_json::<P, Platform>(provider, &manifest.config).await?,
                };
                if !matcher.matches(&platform) {
                    return Ok(Vec::new());
                }
            }
            return Ok(vec![(desc.platform.clone(), manifest)]);
        }

        if media_types::is_index(media_type) {
            let index: Index = read_json(provider, &desc).await?;
            let mut candidates: Vec<Descriptor> = index
                .manifests
                .into_iter()
                .filter(|d| d.platform.as_ref().is_none_or(|p| matcher.matches(p)))
                .collect();
            sort_by_platform(&mut candidates, matcher);
            // Only the best entry is descended, the same one the walk fetched.
            candidates.truncate(1);

            let mut found = Vec::new();
            for child in candidates {
                found.extend(collect_manifests(provider, root_digest, child, matcher).await?);
            }
            return Ok(found);
        }

        Ok(Vec::new())
    })
}

/// Resolve `root` to the single image manifest that best matches `matcher`.
pub async fn manifest<P>(
    provider: &P,
    root: &Descriptor,
    matcher: &dyn PlatformMatcher,
) -> LazypullResult<Manifest>
where
    P: Provider + ?Sized,
{
    let mut found = collect_manifests(provider, &root.digest, root.clone(), matcher).await?;
    if found.is_empty() {
        return Err(LazypullError::NotFound(format!(
            "manifest {} has no match for the target platform",
            root.digest
        )));
    }
    found.sort_by(|a, b| compare_platforms(a.0.as_ref(), b.0.as_ref(), matcher));
    Ok(found.swap_remove(0).1)
}

/// Diff IDs of the image config selected from `root`, bottom layer first.
pub async fn rootfs<P>(
    provider: &P,
    root: &Descriptor,
    matcher: &dyn PlatformMatcher,
) -> LazypullResult<Vec<String>>
where
    P: Provider + ?Sized,
{
    let manifest = manifest(provider, root, matcher).await?;
    config_diff_ids(provider, &manifest.config).await
}

/// Diff IDs recorded in the config blob `config`.
pub async fn config_diff_ids<P>(provider: &P, config: &Descriptor) -> LazypullResult<Vec<String>>
where
    P: Provider + ?Sized,
{
    let parsed: ConfigRootFs = read_json(provider, config).await?;
    for diff_id in &parsed.rootfs.diff_ids {
        validate_digest(diff_id).map_err(|e| LazypullError::InvalidManifest {
            digest: config.digest.clone(),
            reason: format!("bad diff id: {e}"),
        })?;
    }
    Ok(parsed.rootfs.diff_ids)
}
