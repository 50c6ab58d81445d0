pub mod assemble;
pub mod chain;
pub mod ident;
pub mod locate;
pub mod metadata;
pub mod pack;

use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

/// Root of the overlay2 storage driver tree inside a mounted forensic copy
/// (the directory Docker would call `/var/lib/docker`).
#[derive(Debug, Clone)]
pub struct DockerRoot {
    path: PathBuf,
}

impl DockerRoot {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `overlay2/` — cache-id keyed layer payload directories.
    pub fn overlay2(&self) -> PathBuf {
        self.path.join("overlay2")
    }

    /// `overlay2/l/` — 12-character short-id symlink table.
    pub fn short_links(&self) -> PathBuf {
        self.path.join("overlay2").join("l")
    }

    /// `image/overlay2/layerdb/sha256/` — one directory per layer, mapping
    /// diff/chain/cache/mount identifiers to each other.
    pub fn layerdb(&self) -> PathBuf {
        self.path
            .join("image")
            .join("overlay2")
            .join("layerdb")
            .join("sha256")
    }

    /// `image/overlay2/imagedb/content/sha256/` — JSON image configurations.
    pub fn imagedb(&self) -> PathBuf {
        self.path
            .join("image")
            .join("overlay2")
            .join("imagedb")
            .join("content")
            .join("sha256")
    }
}

/// Which identifier namespace a layer was resolved through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Namespace {
    DiffId,
    CacheId,
    ShortLink,
    MountId,
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Namespace::DiffId => write!(f, "diff-id"),
            Namespace::CacheId => write!(f, "cache-id"),
            Namespace::ShortLink => write!(f, "short-link"),
            Namespace::MountId => write!(f, "mount-id"),
        }
    }
}

/// One resolved layer: the identifier we looked up, the directory holding its
/// file payload, and the namespace that produced the hit.
#[derive(Debug, Clone, Serialize)]
pub struct LayerRecord {
    pub id: String,
    pub content_dir: PathBuf,
    pub namespace: Namespace,
}

/// Conditions that make the whole run meaningless. Per-layer and per-entry
/// failures are accumulated in reports instead (see `pack::PackReport` and
/// `assemble::ExtractionReport`).
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("no Docker storage root found under {0}")]
    RootNotFound(PathBuf),

    #[error("no image found with ID or prefix {0}")]
    ImageNotFound(String),

    #[error("image ID prefix {prefix} is ambiguous: matches [{}]", candidates.join(", "))]
    AmbiguousImageId {
        prefix: String,
        candidates: Vec<String>,
    },

    #[error("invalid image configuration: {0}")]
    InvalidConfig(String),

    #[error("no layers were successfully extracted")]
    NoLayersExtracted,
}

#[cfg(test)]
mod tests {
    use super::RecoveryError;

    #[test]
    fn ambiguous_id_display_holds_for_any_candidate_count() {
        let err = RecoveryError::AmbiguousImageId {
            prefix: "ab".to_string(),
            candidates: Vec::new(),
        };
        assert!(err.to_string().contains("ambiguous"));

        let err = RecoveryError::AmbiguousImageId {
            prefix: "ab".to_string(),
            candidates: vec!["abc1".to_string(), "abc2".to_string()],
        };
        assert!(err.to_string().contains("abc1, abc2"));
    }
}
