//! Blob classification by media type.
//!
//! Layers are the only blobs the puller leaves behind; everything else is
//! metadata and gets fetched into the store.

use lazypull_shared::constants::media_types::*;

/// Whether `media_type` names a layer blob (fetched lazily, never walked).
pub fn is_layer(media_type: &str) -> bool {
    matches!(
        media_type,
        OCI_LAYER
            | OCI_LAYER_GZIP
            | OCI_LAYER_ZSTD
            | OCI_LAYER_NONDISTRIBUTABLE
            | OCI_LAYER_NONDISTRIBUTABLE_GZIP
            | DOCKER_LAYER
            | DOCKER_LAYER_GZIP
            | DOCKER_LAYER_FOREIGN
            | DOCKER_LAYER_FOREIGN_GZIP
    )
}

pub fn is_config(media_type: &str) -> bool {
    matches!(media_type, DOCKER_CONFIG | OCI_CONFIG)
}

pub fn is_manifest(media_type: &str) -> bool {
    matches!(media_type, DOCKER_MANIFEST | OCI_MANIFEST)
}

pub fn is_index(media_type: &str) -> bool {
    matches!(media_type, DOCKER_MANIFEST_LIST | OCI_INDEX)
}

/// Legacy single-manifest format, pulled eagerly.
pub fn is_schema1(media_type: &str) -> bool {
    matches!(
        media_type,
        DOCKER_SCHEMA1_MANIFEST | DOCKER_SCHEMA1_MANIFEST_UNSIGNED
    )
}

/// Media types the registry serves from its manifests endpoint.
pub fn is_manifest_like(media_type: &str) -> bool {
    is_manifest(media_type) || is_index(media_type) || is_schema1(media_type)
}
