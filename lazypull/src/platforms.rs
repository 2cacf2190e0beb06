//! Platform descriptions and matching.
//!
//! An image index lists one manifest per platform. The puller narrows an
//! index down to the manifest that best suits its target platform using a
//! [`PlatformMatcher`]. [`Only`] mirrors the usual containerd policy: exact
//! os/architecture, with older ARM variants accepted as fallbacks.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use lazypull_shared::{LazypullError, LazypullResult};

// ============================================================================
// PLATFORM
// ============================================================================

/// Target platform of an image manifest (`os/architecture[/variant]`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(rename = "os.version", default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            architecture: architecture.into(),
            os: os.into(),
            os_version: None,
            variant: None,
        }
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    /// Platform of the running host, in OCI naming.
    pub fn host() -> Self {
        let arch = match std::env::consts::ARCH {
            "aarch64" => "arm64",
            "x86_64" => "amd64",
            "x86" => "386",
            "arm" => "arm",
            other => other,
        };
        Platform::new("linux", arch).normalize()
    }

    /// Canonicalize architecture aliases and default variants.
    pub fn normalize(&self) -> Self {
        let os = self.os.to_lowercase();
        let variant = self.variant.clone().unwrap_or_default();
        let (architecture, variant) = match self.architecture.to_lowercase().as_str() {
            "i386" | "386" => ("386".to_string(), String::new()),
            "x86_64" | "x86-64" | "amd64" => {
                let v = if variant == "v1" { String::new() } else { variant };
                ("amd64".to_string(), v)
            }
            "aarch64" | "arm64" => {
                let v = match variant.as_str() {
                    "8" | "v8" | "v8.0" => String::new(),
                    _ => variant,
                };
                ("arm64".to_string(), v)
            }
            "armhf" => ("arm".to_string(), "v7".to_string()),
            "armel" => ("arm".to_string(), "v6".to_string()),
            "arm" => {
                let v = match variant.as_str() {
                    "" | "7" => "v7".to_string(),
                    "5" | "6" | "8" => format!("v{variant}"),
                    _ => variant,
                };
                ("arm".to_string(), v)
            }
            other => (other.to_string(), variant),
        };

        Platform {
            architecture,
            os,
            os_version: self.os_version.clone(),
            variant: if variant.is_empty() { None } else { Some(variant) },
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{variant}")?;
        }
        Ok(())
    }
}

impl FromStr for Platform {
    type Err = LazypullError;

    /// Parse `os/arch[/variant]`. A bare architecture assumes linux.
    fn from_str(s: &str) -> LazypullResult<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        let platform = match parts.as_slice() {
            [arch] if !arch.is_empty() => Platform::new("linux", *arch),
            [os, arch] if !os.is_empty() && !arch.is_empty() => Platform::new(*os, *arch),
            [os, arch, variant] if !os.is_empty() && !arch.is_empty() => {
                Platform::new(*os, *arch).with_variant(*variant)
            }
            _ => {
                return Err(LazypullError::Config(format!(
                    "invalid platform '{s}', expected os/arch[/variant]"
                )));
            }
        };
        Ok(platform.normalize())
    }
}

// ============================================================================
// MATCHING
// ============================================================================

/// Decides which platforms are acceptable and which one is preferred.
pub trait PlatformMatcher: Send + Sync {
    /// Whether `platform` can run on the target.
    fn matches(&self, platform: &Platform) -> bool;

    /// Whether `a` should be preferred over `b`.
    fn less(&self, a: &Platform, b: &Platform) -> bool;
}

/// Matches a single target platform plus the variants it can run.
#[derive(Debug, Clone)]
pub struct Only {
    /// Acceptable platforms, most preferred first.
    ordered: Vec<Platform>,
}

impl Only {
    pub fn new(platform: &Platform) -> Self {
        let target = platform.normalize();
        let mut ordered = vec![target.clone()];

        // armv7 hosts can run v6 and v5 binaries, armv6 can run v5.
        if target.architecture == "arm" {
            let fallbacks: &[&str] = match target.variant.as_deref() {
                Some("v8") => &["v7", "v6", "v5"],
                Some("v7") => &["v6", "v5"],
                Some("v6") => &["v5"],
                _ => &[],
            };
            for variant in fallbacks {
                ordered.push(Platform::new(&target.os, "arm").with_variant(*variant));
            }
        }

        Self { ordered }
    }

    fn rank(&self, platform: &Platform) -> Option<usize> {
        let normalized = platform.normalize();
        self.ordered.iter().position(|p| {
            p.os == normalized.os
                && p.architecture == normalized.architecture
                && p.variant == normalized.variant
        })
    }
}

impl PlatformMatcher for Only {
    fn matches(&self, platform: &Platform) -> bool {
        self.rank(platform).is_some()
    }

    fn less(&self, a: &Platform, b: &Platform) -> bool {
        match (self.rank(a), self.rank(b)) {
            (Some(ra), Some(rb)) => ra < rb,
            (Some(_), None) => true,
            _ => false,
        }
    }
}
