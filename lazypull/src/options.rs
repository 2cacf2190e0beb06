//! Configuration for pulls.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::platforms::Platform;
use lazypull_shared::constants::{defaults, envs};
use lazypull_shared::{LazypullError, LazypullResult};

/// Options shared by every pull made with one configuration.
///
/// All fields have defaults, so a JSON file only needs the keys it changes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PullOptions {
    /// Target platform as `os/arch[/variant]`.
    ///
    /// Default: the host platform
    pub platform: Option<String>,

    /// Upper bound on concurrently running handlers during a walk.
    ///
    /// Default: 3
    pub max_concurrent_downloads: usize,

    /// Deadline for a whole `pull_manifests` call, in seconds.
    ///
    /// Default: none
    pub pull_timeout_secs: Option<u64>,

    /// Registries contacted over plain HTTP.
    pub insecure_registries: Vec<String>,

    /// Basic auth credentials. Anonymous unless both are set.
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self {
            platform: None,
            max_concurrent_downloads: defaults::MAX_CONCURRENT_DOWNLOADS,
            pull_timeout_secs: None,
            insecure_registries: Vec::new(),
            username: None,
            password: None,
        }
    }
}

impl PullOptions {
    /// Read options from a JSON file.
    pub fn load(path: &Path) -> LazypullResult<Self> {
        let data = std::fs::read(path).map_err(|e| {
            LazypullError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        serde_json::from_slice(&data).map_err(|e| {
            LazypullError::Config(format!("invalid options in {}: {e}", path.display()))
        })
    }

    /// Defaults overlaid with `LAZYPULL_*` environment variables.
    pub fn from_env() -> LazypullResult<Self> {
        Self::default().with_env(|key| std::env::var(key).ok())
    }

    /// Overlay values returned by `lookup` for the `LAZYPULL_*` keys.
    pub fn with_env<F>(mut self, lookup: F) -> LazypullResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(platform) = lookup(envs::PLATFORM) {
            self.platform = Some(platform);
        }
        if let Some(value) = lookup(envs::MAX_CONCURRENT_DOWNLOADS) {
            self.max_concurrent_downloads = parse_env(envs::MAX_CONCURRENT_DOWNLOADS, &value)?;
        }
        if let Some(value) = lookup(envs::PULL_TIMEOUT) {
            self.pull_timeout_secs = Some(parse_env(envs::PULL_TIMEOUT, &value)?);
        }
        Ok(self)
    }

    /// The configured platform, or the host's.
    pub fn target_platform(&self) -> LazypullResult<Platform> {
        match &self.platform {
            Some(platform) => platform.parse(),
            None => Ok(Platform::host()),
        }
    }

    pub fn pull_timeout(&self) -> Option<Duration> {
        self.pull_timeout_secs.map(Duration::from_secs)
    }

    /// Walk concurrency, never below one.
    pub fn concurrency(&self) -> usize {
        self.max_concurrent_downloads.max(1)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> LazypullResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| LazypullError::Config(format!("invalid {key}={value:?}: {e}")))
}
