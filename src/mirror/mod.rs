// src/mirror/mod.rs

//! Selective archive mirroring
//!
//! The engine works bottom-up:
//!
//! - [`CacheEntry`] pairs one remote object with its canonical local path and
//!   owns the verify/fetch/replace lifecycle
//! - [`ReleaseDescriptor`] parses a distribution's release manifest
//! - [`PackageIndexGroup`] picks which encoding of a package index to trust
//! - [`IndexDecoder`] turns an index into artifact records
//! - [`MirrorCoordinator`] drives all of the above for every distribution
//!
//! [`MirrorLayout`] maps archive-relative names to locators and mirror paths.

mod cache;
mod coordinator;
mod index;
mod locator;
mod packages;
mod release;
mod transport;

pub use cache::{CacheEntry, files_match, reconcile_content_type, verify_file};
pub use coordinator::{
    DistributionReport, DistributionState, FetchSummary, MirrorCoordinator, PassResult,
};
pub use index::{
    ArtifactEntry, AuxiliaryFile, PackageIndexGroup, PackageIndexVariant, ResolveContext,
};
pub use locator::Locator;
pub use packages::{DecodeStats, DecodedIndex, IndexDecoder, PackageRecord};
pub use release::{FileRecord, RecordClass, ReleaseDescriptor, ReleaseDiff, decompose_path};
pub use transport::{Retrieval, Transport};

use crate::config::MirrorConfig;
use crate::error::Result;
use std::path::{Component, Path, PathBuf};

/// Whether an archive-supplied relative path stays below the directory it is
/// joined to
///
/// Leading slashes are ignored, the way [`MirrorLayout::artifact_path`]
/// ignores them. Empty paths and paths with `..` components are rejected.
pub fn is_contained(relative: &str) -> bool {
    let trimmed = relative.trim_start_matches('/');
    let mut normal = 0;
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(_) => normal += 1,
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    normal > 0
}

/// Where things live, remotely and in the mirror tree
///
/// Manifest-listed files of a distribution live under
/// `<root>/dists/<distribution>/`, artifacts directly under `<root>/`.
#[derive(Debug, Clone)]
pub struct MirrorLayout {
    root: PathBuf,
    remote: Locator,
}

impl MirrorLayout {
    pub fn new(root: impl Into<PathBuf>, remote: Locator) -> Self {
        Self {
            root: root.into(),
            remote,
        }
    }

    pub fn from_config(config: &MirrorConfig) -> Result<Self> {
        Ok(Self::new(&config.mirror_root, Locator::parse(&config.repository)?))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn remote(&self) -> &Locator {
        &self.remote
    }

    /// `<root>/dists/<distribution>`
    pub fn dist_dir(&self, dist: &str) -> PathBuf {
        self.root.join("dists").join(dist)
    }

    pub fn dist_path(&self, dist: &str, relative: &str) -> PathBuf {
        self.dist_dir(dist).join(relative)
    }

    pub fn dist_locator(&self, dist: &str, relative: &str) -> Locator {
        self.remote.join(&format!("dists/{dist}/{relative}"))
    }

    pub fn artifact_path(&self, relative: &str) -> PathBuf {
        self.root.join(relative.trim_start_matches('/'))
    }

    pub fn artifact_locator(&self, relative: &str) -> Locator {
        self.remote.join(relative)
    }

    /// Cache entry for a file listed in (or beside) a distribution's manifest
    pub fn dist_entry(&self, dist: &str, relative: &str) -> CacheEntry {
        CacheEntry::new(
            self.dist_locator(dist, relative),
            self.dist_path(dist, relative),
        )
    }

    /// Cache entry for a pool artifact
    pub fn artifact_entry(&self, relative: &str) -> CacheEntry {
        CacheEntry::new(self.artifact_locator(relative), self.artifact_path(relative))
    }
}
