//! Image content model and graph traversal.

pub mod descriptor;
pub mod dispatch;
pub mod handlers;
pub mod manifest;
pub mod media_types;

pub use descriptor::{Descriptor, Digester, sha256_digest, validate_digest};
pub use dispatch::dispatch;
pub use handlers::{
    ChildrenHandler, FilterLayerBlobs, FilterPlatforms, Handler, Handlers, LimitManifests,
    MetadataMap, Step,
};
pub use manifest::{
    Index, Manifest, children, config_diff_ids, detect_manifest_media_type, manifest, rootfs,
};
