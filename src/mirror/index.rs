// src/mirror/index.rs

//! Package index groups and variant selection
//!
//! An archive publishes each package index under several encodings. The
//! encodings of one index form a [`PackageIndexGroup`]; each encoding is a
//! [`PackageIndexVariant`]. Resolving a group decides which variants are
//! brought up to date and decoded:
//!
//! - first-available uses the first variant already valid locally, and
//!   only when none is tries fetching them in manifest order until one works
//! - mirror-everything checks, refreshes and decodes every variant
//!
//! Resolution happens once per group; resolving again is a no-op.

use crate::compression;
use crate::config::{MirrorConfig, SelectionPolicy};
use crate::hash::Checksum;
use std::collections::HashSet;
use std::io::BufReader;
use tracing::{debug, info, warn};

use super::MirrorLayout;
use super::cache::CacheEntry;
use super::packages::{DecodeStats, IndexDecoder, PackageRecord};
use super::release::FileRecord;
use super::transport::Transport;

/// Everything group resolution needs from the pass
pub struct ResolveContext<'a> {
    pub config: &'a MirrorConfig,
    pub layout: &'a MirrorLayout,
    pub transport: &'a Transport,
    /// Package-name allow-list of the distribution, if any
    pub allow_list: Option<&'a HashSet<String>>,
    /// Fetch stale objects instead of only reporting them
    pub update: bool,
}

impl ResolveContext<'_> {
    fn manifest_checksum<'c>(&self, checksum: &'c Checksum) -> Option<&'c Checksum> {
        self.config.check_hashes.then_some(checksum)
    }

    fn artifact_checksum<'c>(&self, checksum: &'c Checksum) -> Option<&'c Checksum> {
        self.config.check_artifact_hashes.then_some(checksum)
    }
}

/// One artifact named by a decoded index, checked against the mirror
#[derive(Debug)]
pub struct ArtifactEntry {
    record: PackageRecord,
    missing: bool,
    entry: CacheEntry,
}

impl ArtifactEntry {
    /// Build the cache entry for `record` and verify it immediately
    fn check(record: PackageRecord, ctx: &ResolveContext<'_>) -> Self {
        let entry = ctx.layout.artifact_entry(&record.filename);
        let missing = !entry.verify(Some(record.size), ctx.artifact_checksum(&record.checksum));
        if missing {
            debug!("Missing {} size {}, {}", record.filename, record.size, record.checksum);
        }
        Self {
            record,
            missing,
            entry,
        }
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn architecture(&self) -> &str {
        &self.record.architecture
    }

    pub fn filename(&self) -> &str {
        &self.record.filename
    }

    pub fn size(&self) -> u64 {
        self.record.size
    }

    pub fn checksum(&self) -> &Checksum {
        &self.record.checksum
    }

    pub fn is_missing(&self) -> bool {
        self.missing
    }

    pub fn entry(&self) -> &CacheEntry {
        &self.entry
    }

    /// Verify the mirror copy again; clears `missing` once it checks out
    ///
    /// Another index of the same pass may have installed the artifact since
    /// it was first checked (`Architecture: all` packages are listed in
    /// every binary index).
    pub fn recheck(&mut self, check_hash: bool) -> bool {
        if self.missing {
            let checksum = check_hash.then_some(&self.record.checksum);
            self.missing = !self.entry.verify(Some(self.record.size), checksum);
        }
        !self.missing
    }

    /// Fetch, verify and install a missing artifact
    pub fn refresh(&mut self, transport: &Transport, check_hash: bool) -> bool {
        if self.recheck(check_hash) {
            return true;
        }

        let checksum = check_hash.then_some(&self.record.checksum);
        if !self.entry.fetch(transport) {
            return false;
        }
        if !self.entry.verify_scratch(Some(self.record.size), checksum) {
            warn!("Downloaded {} does not match its index entry", self.record.filename);
            return false;
        }
        if !self.entry.replace(transport) {
            return false;
        }

        self.missing = false;
        true
    }
}

/// One encoding of a package index
#[derive(Debug)]
pub struct PackageIndexVariant {
    record: FileRecord,
    entry: CacheEntry,
    artifacts: Option<Vec<ArtifactEntry>>,
    stats: DecodeStats,
}

impl PackageIndexVariant {
    pub fn new(record: FileRecord, layout: &MirrorLayout, dist: &str) -> Self {
        let entry = layout.dist_entry(dist, &record.path);
        Self {
            record,
            entry,
            artifacts: None,
            stats: DecodeStats::default(),
        }
    }

    pub fn record(&self) -> &FileRecord {
        &self.record
    }

    pub fn compression(&self) -> compression::CompressionFormat {
        self.record.compression
    }

    pub fn component(&self) -> &str {
        &self.record.component
    }

    pub fn architecture(&self) -> &str {
        &self.record.architecture
    }

    pub fn entry(&self) -> &CacheEntry {
        &self.entry
    }

    pub fn is_decoded(&self) -> bool {
        self.artifacts.is_some()
    }

    /// Decoded artifacts; empty until a successful decode
    pub fn artifacts(&self) -> &[ArtifactEntry] {
        self.artifacts.as_deref().unwrap_or_default()
    }

    pub fn artifacts_mut(&mut self) -> &mut [ArtifactEntry] {
        self.artifacts.as_deref_mut().unwrap_or_default()
    }

    pub fn stats(&self) -> &DecodeStats {
        &self.stats
    }

    /// Whether the mirror copy matches the manifest
    fn is_current(&self, ctx: &ResolveContext<'_>) -> bool {
        self.entry
            .verify(Some(self.record.size), ctx.manifest_checksum(&self.record.checksum))
    }

    /// Fetch a fresh copy and install it if it matches the manifest
    fn refresh(&mut self, ctx: &ResolveContext<'_>) -> bool {
        if !self.entry.fetch(ctx.transport) {
            return false;
        }
        if !self
            .entry
            .verify_scratch(Some(self.record.size), ctx.manifest_checksum(&self.record.checksum))
        {
            warn!("Downloaded {} does not match the release file", self.record.path);
            return false;
        }
        self.entry.replace(ctx.transport)
    }

    /// Decode the mirror copy and check every artifact it names
    fn decode(&mut self, ctx: &ResolveContext<'_>) -> bool {
        if self.artifacts.is_some() {
            return true;
        }

        let path = self.entry.canonical_path();
        let reader = match compression::open_decoded(path, self.record.compression) {
            Ok(reader) => reader,
            Err(e) => {
                warn!("{}", e);
                return false;
            }
        };

        let decoded = IndexDecoder::new(self.record.checksum.kind, &self.record.architecture)
            .accept_any_architecture(ctx.config.accept_any_architecture)
            .allow_list(ctx.allow_list)
            .decode(BufReader::new(reader));
        let decoded = match decoded {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Failed to decode {}: {}", path.display(), e);
                return false;
            }
        };

        let mut stats = decoded.stats;
        let artifacts: Vec<ArtifactEntry> = decoded
            .records
            .into_iter()
            .map(|record| ArtifactEntry::check(record, ctx))
            .collect();
        for artifact in artifacts.iter().filter(|a| a.is_missing()) {
            stats.missing_count += 1;
            stats.missing_bytes += artifact.size();
        }

        info!(
            "{} - {} examined, {} missing ({} bytes)",
            self.record.path, stats.examined, stats.missing_count, stats.missing_bytes
        );
        self.stats = stats;
        self.artifacts = Some(artifacts);
        true
    }
}

/// All published encodings of one package index
#[derive(Debug)]
pub struct PackageIndexGroup {
    key: String,
    variants: Vec<PackageIndexVariant>,
    selected: Option<usize>,
    resolved: bool,
}

impl PackageIndexGroup {
    pub fn new<'r>(
        key: impl Into<String>,
        records: impl IntoIterator<Item = &'r FileRecord>,
        layout: &MirrorLayout,
        dist: &str,
    ) -> Self {
        Self {
            key: key.into(),
            variants: records
                .into_iter()
                .map(|r| PackageIndexVariant::new(r.clone(), layout, dist))
                .collect(),
            selected: None,
            resolved: false,
        }
    }

    /// Suffix-stripped index path, e.g. `main/binary-amd64/Packages`
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn variants(&self) -> &[PackageIndexVariant] {
        &self.variants
    }

    pub fn selected(&self) -> Option<&PackageIndexVariant> {
        self.selected.map(|i| &self.variants[i])
    }

    pub fn selected_mut(&mut self) -> Option<&mut PackageIndexVariant> {
        self.selected.map(|i| &mut self.variants[i])
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    /// Counters of the selected variant
    pub fn stats(&self) -> DecodeStats {
        self.selected().map(|v| *v.stats()).unwrap_or_default()
    }

    /// Decide which variants to use, refreshing them if `ctx.update`
    ///
    /// Returns whether a variant was selected.
    pub fn resolve(&mut self, ctx: &ResolveContext<'_>) -> bool {
        if !self.resolved {
            self.selected = match ctx.config.policy {
                SelectionPolicy::FirstAvailable => self.resolve_first_available(ctx),
                SelectionPolicy::MirrorEverything => self.resolve_everything(ctx),
            };
            self.resolved = true;
            if self.selected.is_none() {
                warn!("No usable package index for {}", self.key);
            }
        }
        self.selected.is_some()
    }

    fn resolve_first_available(&mut self, ctx: &ResolveContext<'_>) -> Option<usize> {
        let local = self
            .variants
            .iter_mut()
            .position(|v| v.is_current(ctx) && v.decode(ctx));
        if local.is_some() || !ctx.update {
            return local;
        }
        self.variants
            .iter_mut()
            .position(|v| v.refresh(ctx) && v.decode(ctx))
    }

    fn resolve_everything(&mut self, ctx: &ResolveContext<'_>) -> Option<usize> {
        for variant in &mut self.variants {
            let usable = variant.is_current(ctx) || (ctx.update && variant.refresh(ctx));
            if usable {
                variant.decode(ctx);
            }
        }
        self.variants.iter().position(PackageIndexVariant::is_decoded)
    }
}

/// A translation or component-metadata file kept with the indexes
#[derive(Debug)]
pub struct AuxiliaryFile {
    record: FileRecord,
    entry: CacheEntry,
}

impl AuxiliaryFile {
    pub fn new(record: FileRecord, layout: &MirrorLayout, dist: &str) -> Self {
        let entry = layout.dist_entry(dist, &record.path);
        Self { record, entry }
    }

    pub fn record(&self) -> &FileRecord {
        &self.record
    }

    pub fn entry(&self) -> &CacheEntry {
        &self.entry
    }

    pub fn is_current(&self, ctx: &ResolveContext<'_>) -> bool {
        self.entry
            .verify(Some(self.record.size), ctx.manifest_checksum(&self.record.checksum))
    }

    /// Fetch, verify and install a fresh copy
    pub fn refresh(&mut self, ctx: &ResolveContext<'_>) -> bool {
        if !self.entry.fetch(ctx.transport) {
            return false;
        }
        if !self
            .entry
            .verify_scratch(Some(self.record.size), ctx.manifest_checksum(&self.record.checksum))
        {
            warn!("Downloaded {} does not match the release file", self.record.path);
            return false;
        }
        let replaced = self.entry.replace(ctx.transport);
        if replaced {
            info!("Updated {}", self.record.path);
        }
        replaced
    }
}
