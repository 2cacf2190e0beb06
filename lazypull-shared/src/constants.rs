//! Well-known media types, annotation keys and label keys.
//!
//! Values follow the OCI image spec and the Docker distribution formats so
//! content pulled here interoperates with other containerd-style stores.

/// OCI and Docker media types.
pub mod media_types {
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
    pub const OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
    pub const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
    pub const OCI_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
    pub const OCI_LAYER_NONDISTRIBUTABLE: &str =
        "application/vnd.oci.image.layer.nondistributable.v1.tar";
    pub const OCI_LAYER_NONDISTRIBUTABLE_GZIP: &str =
        "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip";

    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
    pub const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar";
    pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
    pub const DOCKER_LAYER_FOREIGN: &str =
        "application/vnd.docker.image.rootfs.foreign.diff.tar";
    pub const DOCKER_LAYER_FOREIGN_GZIP: &str =
        "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";

    /// Legacy single-manifest (schema1) formats.
    pub const DOCKER_SCHEMA1_MANIFEST: &str =
        "application/vnd.docker.distribution.manifest.v1+prettyjws";
    pub const DOCKER_SCHEMA1_MANIFEST_UNSIGNED: &str =
        "application/vnd.docker.distribution.manifest.v1+json";
}

/// Descriptor annotation keys.
pub mod annotations {
    /// Diff ID of the uncompressed layer content.
    pub const UNCOMPRESSED: &str = "containerd.io/uncompressed";
}

/// Content store label keys.
pub mod labels {
    /// Prefix of the per-registry distribution source label.
    pub const DISTRIBUTION_SOURCE_PREFIX: &str = "containerd.io/distribution.source.";

    /// Prefix of garbage-collection content references.
    pub const GC_REF_CONTENT_PREFIX: &str = "containerd.io/gc.ref.content.";
}

/// Environment variables read by `PullOptions::from_env`.
pub mod envs {
    pub const PLATFORM: &str = "LAZYPULL_PLATFORM";
    pub const MAX_CONCURRENT_DOWNLOADS: &str = "LAZYPULL_MAX_CONCURRENT_DOWNLOADS";
    pub const PULL_TIMEOUT: &str = "LAZYPULL_PULL_TIMEOUT";
}

/// Pull defaults.
pub mod defaults {
    /// Concurrent blob fetches during a graph walk.
    pub const MAX_CONCURRENT_DOWNLOADS: usize = 3;
}
