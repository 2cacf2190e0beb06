//! Error types for lazypull.
//!
//! Every variant carries owned strings so the error is `Clone`: a failed
//! resolution is memoized on the puller and handed to every later caller.

use std::time::Duration;

/// Result type alias for lazypull operations.
pub type LazypullResult<T> = Result<T, LazypullError>;

/// Errors raised while resolving, walking or reconciling an image.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LazypullError {
    // =========================================================================
    // Resolution
    // =========================================================================
    /// Reference string could not be parsed.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    /// Reference could not be turned into a root descriptor.
    #[error("failed to resolve '{reference}': {reason}")]
    Resolve { reference: String, reason: String },

    // =========================================================================
    // Content
    // =========================================================================
    /// Blob or manifest not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Remote fetch of a blob failed.
    #[error("failed to fetch {digest}: {reason}")]
    Fetch { digest: String, reason: String },

    /// Content store failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Committed bytes do not hash to the expected digest.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Manifest, index or config could not be interpreted.
    #[error("invalid manifest {digest}: {reason}")]
    InvalidManifest { digest: String, reason: String },

    /// Media type not handled by the operation.
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    // =========================================================================
    // Integrity
    // =========================================================================
    /// Config rootfs history and manifest layers disagree.
    #[error(
        "mismatched image rootfs and manifest layers: {diff_id_count} diff ids {diff_ids:?}, {layer_count} layers {layers:?}"
    )]
    LayerCountMismatch {
        diff_id_count: usize,
        layer_count: usize,
        diff_ids: Vec<String>,
        layers: Vec<String>,
    },

    /// Eager schema1 pull/convert failed.
    #[error("schema1 conversion failed: {0}")]
    LegacyConversion(String),

    // =========================================================================
    // Control
    // =========================================================================
    /// Operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// Operation exceeded its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    // =========================================================================
    // Misc
    // =========================================================================
    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON encode/decode failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for LazypullError {
    fn from(err: std::io::Error) -> Self {
        LazypullError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for LazypullError {
    fn from(err: serde_json::Error) -> Self {
        LazypullError::Serialization(err.to_string())
    }
}

impl LazypullError {
    /// True for errors that mean "content is absent" rather than broken.
    pub fn is_not_found(&self) -> bool {
        matches!(self, LazypullError::NotFound(_))
    }
}
