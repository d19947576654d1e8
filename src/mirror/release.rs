// src/mirror/release.rs

//! Release manifest parsing
//!
//! A distribution's `Release` (or inline-signed `InRelease`) manifest has a
//! header of `Key: value` lines followed by one or more checksum blocks
//! (`MD5Sum:`, `SHA1:`, `SHA256:`) listing `<digest> <size> <path>` records.
//! Only the first block is read; its algorithm becomes the descriptor's
//! checksum kind.
//!
//! Records are classified by path into package indexes, translations and
//! component metadata, and filtered against the configured components and
//! architectures. Everything else is ignored.

use crate::compression::CompressionFormat;
use crate::config::MirrorConfig;
use crate::error::{Error, Result};
use crate::hash::{Checksum, ChecksumKind};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

use super::is_contained;

const SIGNED_MESSAGE_MARKER: &str = "-----BEGIN PGP SIGNED MESSAGE-----";
const SIGNATURE_MARKER: &str = "-----BEGIN PGP SIGNATURE-----";

/// What a manifest record refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordClass {
    /// `Packages` index in some encoding
    PackageIndex,
    /// `i18n/Translation-*` file
    Translation,
    /// AppStream metadata under `dep11/`
    ComponentMetadata,
}

/// One `<digest> <size> <path>` record kept from a manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Path relative to `dists/<distribution>/`
    pub path: String,
    pub size: u64,
    pub checksum: Checksum,
    pub class: RecordClass,
    /// First path segment
    pub component: String,
    /// Architecture derived from the path (`source`, `Translation`, `any`, ...)
    pub architecture: String,
    /// Encoding implied by the path suffix
    pub compression: CompressionFormat,
}

impl FileRecord {
    /// Path with its encoding suffix removed
    pub fn group_key(&self) -> &str {
        self.compression.strip_extension(&self.path)
    }
}

/// Split a manifest path into `(component, architecture)`
///
/// The component is the first segment. A second segment of `binary-<arch>`
/// yields `<arch>`, `source` yields `source`, `i18n` yields `Translation`
/// and anything else yields `other`.
pub fn decompose_path(path: &str) -> (&str, &str) {
    let mut segments = path.split('/');
    let component = segments.next().unwrap_or_default();
    let arch = match segments.next() {
        Some(seg) if seg.starts_with("binary-") => &seg["binary-".len()..],
        Some("source") => "source",
        Some("i18n") => "Translation",
        _ => "other",
    };
    (component, arch)
}

/// Parsed release manifest of one distribution
#[derive(Debug, Clone, Default)]
pub struct ReleaseDescriptor {
    present: bool,
    fields: BTreeMap<String, String>,
    checksum_kind: Option<ChecksumKind>,
    indexes: Vec<FileRecord>,
    auxiliary: Vec<FileRecord>,
    changed: bool,
}

impl ReleaseDescriptor {
    /// Descriptor of a manifest that could not be read
    pub fn absent() -> Self {
        Self::default()
    }

    /// Read and parse a manifest file
    ///
    /// An unreadable file yields an absent descriptor. A malformed record
    /// line is an error.
    pub fn from_file(path: &Path, expect_wrapper: bool, config: &MirrorConfig) -> Result<Self> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("Release file {} unreadable: {}", path.display(), e);
                return Ok(Self::absent());
            }
        };
        let text = String::from_utf8_lossy(&bytes);
        Self::parse(&text, expect_wrapper, config).map_err(|e| match e {
            Error::ParseError(msg) => Error::ParseError(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    /// Parse manifest text
    ///
    /// With `expect_wrapper`, a leading signed-message marker, optional
    /// `Hash:` line and the blank line after it are skipped.
    pub fn parse(text: &str, expect_wrapper: bool, config: &MirrorConfig) -> Result<Self> {
        let mut lines = text.lines().peekable();

        if expect_wrapper {
            if lines.next_if(|l| l.starts_with(SIGNED_MESSAGE_MARKER)).is_none() {
                debug!("Missing signed message header");
            }
            lines.next_if(|l| l.starts_with("Hash:"));
            lines.next_if(|l| l.trim().is_empty());
        }

        let mut descriptor = Self {
            present: true,
            ..Self::default()
        };

        for line in lines.by_ref() {
            if line.starts_with(SIGNATURE_MARKER) {
                return Ok(descriptor);
            }
            let mut words = line.split_whitespace();
            let Some(first) = words.next() else {
                continue;
            };
            if let Some(kind) = ChecksumKind::from_block_header(first) {
                descriptor.checksum_kind = Some(kind);
                break;
            }
            match first.strip_suffix(':') {
                Some(key) => {
                    let value = words.collect::<Vec<_>>().join(" ");
                    descriptor.fields.insert(key.to_string(), value);
                }
                None => info!("Ignoring strange word '{}' in release header", first),
            }
        }

        let Some(kind) = descriptor.checksum_kind else {
            return Ok(descriptor);
        };

        for line in lines {
            if line.starts_with(SIGNATURE_MARKER) {
                break;
            }
            let words: Vec<&str> = line.split_whitespace().collect();
            if words.is_empty() {
                continue;
            }
            if ChecksumKind::from_block_header(words[0]).is_some() {
                break;
            }
            if words.len() < 3 {
                return Err(Error::ParseError(format!("Malformed release record: '{}'", line.trim())));
            }
            let size: u64 = words[1].parse().map_err(|_| {
                Error::ParseError(format!("Invalid size '{}' in release record for {}", words[1], words[2]))
            })?;
            if size == 0 {
                debug!("Skipping empty file {}", words[2]);
                continue;
            }

            if !is_contained(words[2]) {
                warn!("Dropping release record outside the distribution: {}", words[2]);
                continue;
            }

            let checksum = Checksum::new(kind, words[0]);
            match classify(words[2], config) {
                Some((class, component, architecture)) => {
                    let record = FileRecord {
                        path: words[2].to_string(),
                        size,
                        checksum,
                        class,
                        component,
                        architecture,
                        compression: CompressionFormat::from_extension(words[2]),
                    };
                    match class {
                        RecordClass::PackageIndex => descriptor.indexes.push(record),
                        _ => descriptor.auxiliary.push(record),
                    }
                }
                None => debug!("Ignoring release record {}", words[2]),
            }
        }

        debug!(
            "{} package indexes and {} other files in release {}",
            descriptor.indexes.len(),
            descriptor.auxiliary.len(),
            descriptor.suite().unwrap_or("?")
        );
        Ok(descriptor)
    }

    pub fn is_present(&self) -> bool {
        self.present
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    pub fn mark_changed(&mut self) {
        self.changed = true;
    }

    /// Raw header field
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    pub fn suite(&self) -> Option<&str> {
        self.field("Suite")
    }

    pub fn codename(&self) -> Option<&str> {
        self.field("Codename")
    }

    pub fn version(&self) -> Option<&str> {
        self.field("Version")
    }

    pub fn date(&self) -> Option<&str> {
        self.field("Date")
    }

    pub fn description(&self) -> Option<&str> {
        self.field("Description")
    }

    pub fn components(&self) -> Vec<&str> {
        self.field("Components")
            .map(|v| v.split_whitespace().collect())
            .unwrap_or_default()
    }

    pub fn architectures(&self) -> Vec<&str> {
        self.field("Architectures")
            .map(|v| v.split_whitespace().collect())
            .unwrap_or_default()
    }

    /// Algorithm of the first checksum block
    pub fn checksum_kind(&self) -> Option<ChecksumKind> {
        self.checksum_kind
    }

    /// Kept package-index records, in manifest order
    pub fn index_records(&self) -> &[FileRecord] {
        &self.indexes
    }

    /// Kept translation and component-metadata records, in manifest order
    pub fn auxiliary_records(&self) -> &[FileRecord] {
        &self.auxiliary
    }

    /// Package-index records grouped by suffix-stripped name
    ///
    /// Groups appear in order of first appearance; records keep manifest
    /// order within their group.
    pub fn grouped_indexes(&self) -> Vec<(&str, Vec<&FileRecord>)> {
        let mut groups: Vec<(&str, Vec<&FileRecord>)> = Vec::new();
        for record in &self.indexes {
            let key = record.group_key();
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, records)) => records.push(record),
                None => groups.push((key, vec![record])),
            }
        }
        groups
    }

    /// Keys of every package-index group
    pub fn group_keys(&self) -> BTreeSet<String> {
        self.indexes.iter().map(|r| r.group_key().to_string()).collect()
    }
}

impl fmt::Display for ReleaseDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.present {
            return write!(f, "(missing)");
        }
        let show = |v: Option<&str>| v.unwrap_or("-").to_string();
        writeln!(f, "Suite: {}", show(self.suite()))?;
        writeln!(f, "Codename: {}", show(self.codename()))?;
        writeln!(f, "Version: {}", show(self.version()))?;
        writeln!(f, "Date: {}", show(self.date()))?;
        writeln!(f, "Components: {}", self.components().join(" "))?;
        writeln!(f, "Architectures: {}", self.architectures().join(" "))?;
        write!(f, "Description: {}", show(self.description()))
    }
}

/// Decide whether a manifest path is kept, and as what
fn classify(path: &str, config: &MirrorConfig) -> Option<(RecordClass, String, String)> {
    let (component, arch) = decompose_path(path);

    if path.contains("Packages") {
        let format = CompressionFormat::from_extension(path);
        let base = format.strip_extension(path).rsplit('/').next().unwrap_or_default();
        if base != "Packages" {
            return None;
        }
        if !config.wants_component(component) || !config.wants_architecture(arch) {
            return None;
        }
        return Some((RecordClass::PackageIndex, component.to_string(), arch.to_string()));
    }

    if path.contains("Translation") {
        if arch == "Translation" && path.ends_with("-en.bz2") && config.wants_component(component) {
            return Some((RecordClass::Translation, component.to_string(), arch.to_string()));
        }
        return None;
    }

    if path.contains("/dep11/") {
        if !config.wants_component(component) {
            return None;
        }
        let file = path.rsplit('/').next().unwrap_or_default();
        if file.starts_with("icons-") {
            return Some((RecordClass::ComponentMetadata, component.to_string(), "any".to_string()));
        }
        if let Some(rest) = file.strip_prefix("Components-") {
            let arch = rest.split('.').next().unwrap_or_default();
            if config.wants_architecture(arch)
                && CompressionFormat::from_extension(file) == CompressionFormat::Gzip
            {
                return Some((RecordClass::ComponentMetadata, component.to_string(), arch.to_string()));
            }
        }
        return None;
    }

    None
}

/// Package-index groups gained, lost and kept between two manifests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseDiff {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
    pub common: BTreeSet<String>,
}

impl ReleaseDiff {
    pub fn between(old: &ReleaseDescriptor, new: &ReleaseDescriptor) -> Self {
        let old_keys = old.group_keys();
        let new_keys = new.group_keys();
        let diff = Self {
            added: new_keys.difference(&old_keys).cloned().collect(),
            removed: old_keys.difference(&new_keys).cloned().collect(),
            common: new_keys.intersection(&old_keys).cloned().collect(),
        };
        if !diff.added.is_empty() || !diff.removed.is_empty() {
            warn!(
                "{} package indexes added, {} removed",
                diff.added.len(),
                diff.removed.len()
            );
        }
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}
