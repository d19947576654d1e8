// src/mirror/coordinator.rs

//! Sync pass orchestration
//!
//! For each configured distribution, in order:
//!
//! 1. Look for the detached signature `Release.gpg`. If present the manifest
//!    is `Release`, otherwise the inline-signed `InRelease`.
//! 2. Fetch the manifest (when updating) and compare it with the mirror copy.
//!    A changed manifest is parsed from the fresh copy and diffed against the
//!    old one.
//! 3. Resolve every package-index group, count missing artifacts and, when
//!    updating, fetch them.
//! 4. Check translations and component metadata.
//! 5. Install the new manifest and signature last, so an interrupted pass
//!    sees the change again next time.
//!
//! A soft deadline is checked between distributions, groups and artifact
//! fetches. Nothing is cancelled mid-transfer.

use crate::config::MirrorConfig;
use crate::error::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Instant;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use super::MirrorLayout;
use super::cache::CacheEntry;
use super::index::{ArtifactEntry, AuxiliaryFile, PackageIndexGroup, ResolveContext};
use super::packages::DecodeStats;
use super::release::{ReleaseDescriptor, ReleaseDiff};
use super::transport::Transport;

/// Detached signature beside `Release`
const SIGNATURE_FILE: &str = "Release.gpg";
const RELEASE_FILE: &str = "Release";
const INLINE_RELEASE_FILE: &str = "InRelease";

/// Progress of one distribution through a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistributionState {
    #[default]
    Unchecked,
    /// Manifest located (possibly absent)
    ReleaseResolved,
    /// Manifest identical to the mirror copy
    Unchanged,
    /// Manifest differs from the mirror copy
    Changed,
    /// Every group and auxiliary file processed
    ArtifactsResolved,
}

/// Outcome of one distribution in a pass
#[derive(Debug, Clone, Default)]
pub struct DistributionReport {
    pub name: String,
    pub state: DistributionState,
    pub present: bool,
    pub changed: bool,
    /// Package-index groups in the manifest
    pub groups: usize,
    /// Groups with a usable variant
    pub selected_groups: usize,
    /// Distinct missing artifacts; a filename listed by several indexes
    /// counts once
    pub missing_count: usize,
    pub missing_bytes: u64,
    pub examined: usize,
    pub ignored: usize,
    pub parse_failures: usize,
    pub foreign: usize,
    /// Missing artifacts fetched and installed during the pass
    pub fetched: usize,
    pub fetch_failures: usize,
    /// Translations and component metadata found out of date
    pub stale_auxiliary: usize,
    pub refreshed_auxiliary: usize,
    /// Package-index changes, when the manifest changed
    pub diff: Option<ReleaseDiff>,
    /// The deadline expired while processing this distribution
    pub interrupted: bool,
}

impl DistributionReport {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Decode counters of one group; missing artifacts are counted
    /// separately, once per filename
    fn add_stats(&mut self, stats: &DecodeStats) {
        self.examined += stats.examined;
        self.ignored += stats.ignored;
        self.parse_failures += stats.parse_failures;
        self.foreign += stats.foreign;
    }

    /// Every artifact is present, or was fetched during this pass
    pub fn is_complete(&self) -> bool {
        self.present
            && !self.interrupted
            && self.fetch_failures == 0
            && self.selected_groups == self.groups
            && self.fetched == self.missing_count
    }
}

impl fmt::Display for DistributionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.present {
            return write!(f, "{}: release file missing", self.name);
        }
        write!(
            f,
            "{}: {}{} package files, {} packages examined, {} missing ({} bytes)",
            self.name,
            if self.changed { "changed, " } else { "" },
            self.groups,
            self.examined,
            self.missing_count,
            self.missing_bytes
        )?;
        if self.fetched > 0 || self.fetch_failures > 0 {
            write!(f, ", {} fetched, {} failed", self.fetched, self.fetch_failures)?;
        }
        if self.ignored > 0 {
            write!(f, ", {} not in package list", self.ignored)?;
        }
        if self.parse_failures > 0 {
            write!(f, ", {} unparseable", self.parse_failures)?;
        }
        if self.interrupted {
            write!(f, " (timed out)")?;
        }
        Ok(())
    }
}

/// Outcome of [`MirrorCoordinator::run_pass`]
#[derive(Debug, Clone, Default)]
pub struct PassResult {
    /// One report per processed distribution, in configured order
    pub reports: Vec<DistributionReport>,
    /// The deadline cut the pass short
    pub timed_out: bool,
}

impl PassResult {
    pub fn is_complete(&self) -> bool {
        !self.timed_out && self.reports.iter().all(DistributionReport::is_complete)
    }

    pub fn missing_count(&self) -> usize {
        self.reports.iter().map(|r| r.missing_count).sum()
    }

    pub fn missing_bytes(&self) -> u64 {
        self.reports.iter().map(|r| r.missing_bytes).sum()
    }

    pub fn changed(&self) -> impl Iterator<Item = &DistributionReport> {
        self.reports.iter().filter(|r| r.changed)
    }
}

/// Outcome of [`MirrorCoordinator::fetch_missing`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchSummary {
    pub fetched: usize,
    pub failed: usize,
    pub timed_out: bool,
}

impl FetchSummary {
    pub fn is_complete(&self) -> bool {
        self.failed == 0 && !self.timed_out
    }
}

/// State of one distribution within the current pass
#[derive(Debug)]
struct Distribution {
    release: ReleaseDescriptor,
    groups: Vec<PackageIndexGroup>,
    auxiliary: Vec<AuxiliaryFile>,
    report: DistributionReport,
}

/// Drives sync passes over every configured distribution
pub struct MirrorCoordinator {
    config: MirrorConfig,
    layout: MirrorLayout,
    package_lists: HashMap<String, HashSet<String>>,
    transport: Option<Transport>,
    scratch: Option<TempDir>,
    deadline: Option<Instant>,
    distributions: Vec<Distribution>,
}

impl MirrorCoordinator {
    /// Validate the configuration and read any package allow-lists
    pub fn new(config: MirrorConfig) -> Result<Self> {
        config.validate()?;
        let layout = MirrorLayout::from_config(&config)?;
        let package_lists = config.load_package_lists()?;

        Ok(Self {
            config,
            layout,
            package_lists,
            transport: None,
            scratch: None,
            deadline: None,
            distributions: Vec::new(),
        })
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    pub fn layout(&self) -> &MirrorLayout {
        &self.layout
    }

    /// Scratch directory of this run, once prepared
    pub fn scratch_dir(&self) -> Option<&Path> {
        self.scratch.as_ref().map(TempDir::path)
    }

    /// Check (or create) the mirror skeleton and set up the scratch directory
    ///
    /// The scratch directory lives inside the mirror root so replacements are
    /// plain renames, and is removed when the coordinator is dropped. The
    /// soft deadline starts counting here.
    pub fn prepare(&mut self, create: bool) -> Result<()> {
        let root = self.layout.root().to_path_buf();
        ensure_dir(&root, create)?;
        for dist in &self.config.distributions {
            ensure_dir(&self.layout.dist_dir(dist), create)?;
        }

        let scratch = tempfile::Builder::new()
            .prefix(&self.config.scratch_prefix)
            .tempdir_in(&root)
            .map_err(|e| {
                Error::FatalSetup(format!(
                    "Unable to create scratch directory in {}: {e}",
                    root.display()
                ))
            })?;
        debug!("Scratch directory {}", scratch.path().display());

        self.transport = Some(Transport::new(&self.config, scratch.path())?);
        self.scratch = Some(scratch);
        self.deadline = self.config.timeout.map(|t| Instant::now() + t);
        Ok(())
    }

    /// Check every distribution, fetching stale objects if `update`
    ///
    /// Prepares without creating anything if [`prepare`](Self::prepare) was
    /// not called. A malformed record line in a manifest aborts the pass.
    pub fn run_pass(&mut self, update: bool) -> Result<PassResult> {
        if self.transport.is_none() {
            self.prepare(false)?;
        }
        if !update {
            info!("Not refreshing info from {}", self.layout.remote());
        }

        self.distributions.clear();
        let mut result = PassResult::default();

        for name in &self.config.distributions {
            if deadline_passed(self.deadline) {
                warn!("Time out expired - skipping {}", name);
                result.timed_out = true;
                break;
            }

            let dist = self.resolve_distribution(name, update)?;
            result.timed_out |= dist.report.interrupted;
            result.reports.push(dist.report.clone());
            self.distributions.push(dist);
        }

        Ok(result)
    }

    fn transport(&self) -> Result<&Transport> {
        self.transport
            .as_ref()
            .ok_or_else(|| Error::InitError("mirror not prepared".to_string()))
    }

    fn resolve_distribution(&self, name: &str, update: bool) -> Result<Distribution> {
        let transport = self.transport()?;
        let mut report = DistributionReport::new(name);
        info!("Checking release {}", name);

        let mut signature = self.layout.dist_entry(name, SIGNATURE_FILE);
        let has_signature =
            (update && signature.fetch(transport)) || signature.verify(None, None);

        let (manifest_name, expect_wrapper) = if has_signature {
            debug!("Found detached signature, using {}", RELEASE_FILE);
            (RELEASE_FILE, false)
        } else {
            debug!("No detached signature, using {}", INLINE_RELEASE_FILE);
            (INLINE_RELEASE_FILE, true)
        };

        let mut companion = (update && has_signature).then(|| {
            let mut entry = self.layout.dist_entry(name, INLINE_RELEASE_FILE);
            entry.fetch(transport);
            entry
        });

        let mut manifest = self.layout.dist_entry(name, manifest_name);
        let fetched = update && manifest.fetch(transport);
        if update && !fetched && !transport.dry_run() {
            warn!("Unable to fetch {} for {}", manifest.locator(), name);
        }
        report.state = DistributionState::ReleaseResolved;

        let release = self.read_release(&manifest, fetched, expect_wrapper, &mut report)?;
        report.present = release.is_present();
        report.changed = release.is_changed();

        if !release.is_present() {
            warn!("{} - release file missing", name);
            report.state = DistributionState::ReleaseResolved;
            return Ok(Distribution {
                release,
                groups: Vec::new(),
                auxiliary: Vec::new(),
                report,
            });
        }

        let ctx = ResolveContext {
            config: &self.config,
            layout: &self.layout,
            transport,
            allow_list: self.package_lists.get(name),
            update,
        };

        let mut groups: Vec<PackageIndexGroup> = release
            .grouped_indexes()
            .into_iter()
            .map(|(key, records)| PackageIndexGroup::new(key, records, &self.layout, name))
            .collect();
        report.groups = groups.len();
        let mut counted: HashSet<String> = HashSet::new();
        let mut installed: HashSet<String> = HashSet::new();

        for group in &mut groups {
            if deadline_passed(self.deadline) {
                warn!("Time out expired - skipping package file {}", group.key());
                report.interrupted = true;
                break;
            }
            if group.resolve(&ctx) {
                report.selected_groups += 1;
            }
            let stats = group.stats();
            report.add_stats(&stats);
            for artifact in missing_in(group) {
                if counted.insert(artifact.filename().to_string()) {
                    report.missing_count += 1;
                    report.missing_bytes += artifact.size();
                }
            }
            if stats.missing_count > 0 {
                info!(
                    "{} - {} missing ({} bytes)",
                    group.key(),
                    stats.missing_count,
                    stats.missing_bytes
                );
            }

            if update && self.config.fetch_artifacts {
                let artifacts = group
                    .selected_mut()
                    .map(|v| v.artifacts_mut())
                    .unwrap_or_default();
                if !self.fetch_artifacts(artifacts, transport, &mut installed, &mut report) {
                    report.interrupted = true;
                    break;
                }
            }
        }

        let mut auxiliary: Vec<AuxiliaryFile> = release
            .auxiliary_records()
            .iter()
            .map(|r| AuxiliaryFile::new(r.clone(), &self.layout, name))
            .collect();

        if !report.interrupted {
            for aux in &mut auxiliary {
                if deadline_passed(self.deadline) {
                    report.interrupted = true;
                    break;
                }
                if aux.is_current(&ctx) {
                    continue;
                }
                report.stale_auxiliary += 1;
                if update && aux.refresh(&ctx) {
                    report.refreshed_auxiliary += 1;
                }
            }
        }

        if report.interrupted {
            info!("{} left as is until the next pass", manifest.canonical_path().display());
        } else {
            if fetched && release.is_changed() {
                if manifest.replace(transport) {
                    info!("{} - release updated", name);
                } else {
                    warn!("{} - release update failed", name);
                    report.fetch_failures += 1;
                }
            }
            install_if_changed(&mut signature, transport);
            if let Some(companion) = companion.as_mut() {
                install_if_changed(companion, transport);
            }
            report.state = DistributionState::ArtifactsResolved;
        }

        Ok(Distribution {
            release,
            groups,
            auxiliary,
            report,
        })
    }

    /// Parse the manifest, diffing against the mirror copy when a fresh one
    /// differs from it
    fn read_release(
        &self,
        manifest: &CacheEntry,
        fetched: bool,
        expect_wrapper: bool,
        report: &mut DistributionReport,
    ) -> Result<ReleaseDescriptor> {
        let canonical = manifest.canonical_path();

        let fresh = manifest
            .scratch_path()
            .filter(|_| fetched && !manifest.matches_previous());
        let Some(fresh) = fresh else {
            report.state = DistributionState::Unchanged;
            return ReleaseDescriptor::from_file(canonical, expect_wrapper, &self.config);
        };

        info!("{} has changed", report.name);
        let old = ReleaseDescriptor::from_file(canonical, expect_wrapper, &self.config)
            .unwrap_or_else(|e| {
                warn!("Ignoring previous release file: {}", e);
                ReleaseDescriptor::absent()
            });
        let mut new = ReleaseDescriptor::from_file(fresh, expect_wrapper, &self.config)?;
        new.mark_changed();

        let diff = ReleaseDiff::between(&old, &new);
        debug!(
            "{} new, {} removed, {} common package files",
            diff.added.len(),
            diff.removed.len(),
            diff.common.len()
        );
        report.diff = Some(diff);
        report.state = DistributionState::Changed;
        Ok(new)
    }

    /// Fetch every missing artifact of one index; false if the deadline hit
    ///
    /// `installed` holds the filenames already handled for this
    /// distribution; those are only rechecked.
    fn fetch_artifacts(
        &self,
        artifacts: &mut [ArtifactEntry],
        transport: &Transport,
        installed: &mut HashSet<String>,
        report: &mut DistributionReport,
    ) -> bool {
        for artifact in artifacts.iter_mut().filter(|a| a.is_missing()) {
            if !installed.insert(artifact.filename().to_string()) {
                artifact.recheck(self.config.check_artifact_hashes);
                continue;
            }
            if deadline_passed(self.deadline) {
                warn!("Time out expired - skipping {}", artifact.name());
                return false;
            }
            info!("Fetching {} - size {}", artifact.filename(), artifact.size());
            if artifact.refresh(transport, self.config.check_artifact_hashes) {
                report.fetched += 1;
            } else {
                warn!("Failed to fetch {}", artifact.filename());
                report.fetch_failures += 1;
            }
        }
        true
    }

    /// Missing artifacts of the last pass as `(distribution, group key, artifact)`
    ///
    /// An artifact listed by several indexes of a distribution appears once,
    /// under the first of them.
    pub fn missing_artifacts(&self) -> impl Iterator<Item = (&str, &str, &ArtifactEntry)> {
        self.distributions.iter().flat_map(|dist| {
            let mut seen: HashSet<&str> = HashSet::new();
            dist.groups
                .iter()
                .flat_map(move |group| missing_in(group).map(move |a| (group.key(), a)))
                .filter(move |&(_, a)| seen.insert(a.filename()))
                .map(move |(key, a)| (dist.report.name.as_str(), key, a))
        })
    }

    /// Fetch, verify and install every missing artifact of the last pass
    pub fn fetch_missing(&mut self) -> Result<FetchSummary> {
        let transport = self
            .transport
            .as_ref()
            .ok_or_else(|| Error::InitError("mirror not prepared".to_string()))?;
        let check_hash = self.config.check_artifact_hashes;
        let mut summary = FetchSummary::default();

        'dists: for dist in &mut self.distributions {
            info!("Fetching release {}", dist.report.name);
            let mut installed: HashSet<String> = HashSet::new();
            for group in &mut dist.groups {
                let Some(variant) = group.selected_mut() else {
                    continue;
                };
                for artifact in variant.artifacts_mut().iter_mut().filter(|a| a.is_missing()) {
                    if !installed.insert(artifact.filename().to_string()) {
                        artifact.recheck(check_hash);
                        continue;
                    }
                    if deadline_passed(self.deadline) {
                        warn!("Time out expired - skipping {}", artifact.name());
                        summary.timed_out = true;
                        dist.report.interrupted = true;
                        break 'dists;
                    }
                    info!("Fetching {} - size {}", artifact.filename(), artifact.size());
                    if artifact.refresh(transport, check_hash) {
                        summary.fetched += 1;
                        dist.report.fetched += 1;
                    } else {
                        warn!("Failed to fetch {}", artifact.filename());
                        summary.failed += 1;
                        dist.report.fetch_failures += 1;
                    }
                }
            }
        }

        Ok(summary)
    }

    /// Reports of the last pass, updated by [`fetch_missing`](Self::fetch_missing)
    pub fn reports(&self) -> impl Iterator<Item = &DistributionReport> {
        self.distributions.iter().map(|d| &d.report)
    }

    /// Manifest of `dist` as read in the last pass
    pub fn release(&self, dist: &str) -> Option<&ReleaseDescriptor> {
        self.find(dist).map(|d| &d.release)
    }

    /// Package-index groups of `dist` from the last pass
    pub fn groups(&self, dist: &str) -> &[PackageIndexGroup] {
        self.find(dist).map(|d| d.groups.as_slice()).unwrap_or_default()
    }

    /// Translations and component metadata of `dist` from the last pass
    pub fn auxiliary_files(&self, dist: &str) -> &[AuxiliaryFile] {
        self.find(dist).map(|d| d.auxiliary.as_slice()).unwrap_or_default()
    }

    pub fn state(&self, dist: &str) -> DistributionState {
        self.find(dist).map(|d| d.report.state).unwrap_or_default()
    }

    fn find(&self, dist: &str) -> Option<&Distribution> {
        self.distributions.iter().find(|d| d.report.name == dist)
    }
}

/// Missing artifacts of a group's selected variant
fn missing_in(group: &PackageIndexGroup) -> impl Iterator<Item = &ArtifactEntry> {
    group
        .selected()
        .map(|v| v.artifacts())
        .unwrap_or_default()
        .iter()
        .filter(|a| a.is_missing())
}

fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

fn ensure_dir(path: &Path, create: bool) -> Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    if !create {
        return Err(Error::FatalSetup(format!(
            "{} does not exist (use --create to create it)",
            path.display()
        )));
    }
    info!("Creating {}", path.display());
    fs::create_dir_all(path)
        .map_err(|e| Error::FatalSetup(format!("Unable to create {}: {e}", path.display())))
}

/// Install a freshly fetched file unless the mirror already has it
fn install_if_changed(entry: &mut CacheEntry, transport: &Transport) {
    if entry.fetched() && !entry.matches_previous() && !entry.replace(transport) {
        warn!("Failed to update {}", entry.canonical_path().display());
    }
}
