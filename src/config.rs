// src/config.rs

//! Mirror configuration
//!
//! A single immutable [`MirrorConfig`] value describes one mirror: where the
//! archive lives, which slice of it to keep, and how retrieval behaves. It is
//! built in code with [`MirrorConfig::configure`] or loaded from a TOML file:
//!
//! ```toml
//! repository = "http://deb.debian.org/debian-security"
//! mirror_root = "/srv/mirror/debian-security"
//! distributions = ["bookworm-security", "bullseye-security"]
//! components = ["main", "contrib"]
//! architectures = ["amd64", "all"]
//! policy = "first-available"
//! timeout = "6h"
//!
//! [package_lists]
//! "bookworm-security" = "/etc/debmirror/bookworm.list"
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Default configuration file name, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "debmirror.toml";

/// How the variants of one package index are used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionPolicy {
    /// Use the first variant that is (or can be made) valid locally
    #[default]
    FirstAvailable,
    /// Keep every published variant up to date
    MirrorEverything,
}

impl fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FirstAvailable => write!(f, "first-available"),
            Self::MirrorEverything => write!(f, "mirror-everything"),
        }
    }
}

/// Mirror configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MirrorConfig {
    /// Archive root locator (`http://`, `https://` or `file:`)
    #[serde(default = "default_repository")]
    pub repository: String,

    /// Local mirror root
    #[serde(default = "default_mirror_root")]
    pub mirror_root: PathBuf,

    /// Distributions to mirror, processed in this order
    #[serde(default = "default_distributions")]
    pub distributions: Vec<String>,

    /// Components to keep
    #[serde(default = "default_components")]
    pub components: Vec<String>,

    /// Architectures to keep
    #[serde(default = "default_architectures")]
    pub architectures: Vec<String>,

    /// Variant selection policy
    #[serde(default)]
    pub policy: SelectionPolicy,

    /// Per-distribution package-name allow-list files
    #[serde(default)]
    pub package_lists: BTreeMap<String, PathBuf>,

    /// Hard-link local archive files instead of copying them
    #[serde(default)]
    pub use_links: bool,

    /// Log retrievals and replacements instead of performing them
    #[serde(default)]
    pub dry_run: bool,

    /// Download missing artifacts during an updating pass
    #[serde(default)]
    pub fetch_artifacts: bool,

    /// Verify digests of manifest-listed files (indexes, translations)
    #[serde(default = "default_true")]
    pub check_hashes: bool,

    /// Verify digests of artifacts, not just their sizes
    #[serde(default = "default_true")]
    pub check_artifact_hashes: bool,

    /// Keep index records whose architecture differs from their index
    #[serde(default)]
    pub accept_any_architecture: bool,

    /// Prefix of the scratch directory created inside the mirror root
    #[serde(default = "default_scratch_prefix")]
    pub scratch_prefix: String,

    /// Soft deadline for a pass, e.g. `"90m"` or `"6h"`
    #[serde(default, deserialize_with = "deserialize_timeout")]
    pub timeout: Option<Duration>,

    /// Timeout for individual HTTP requests, in seconds
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            repository: default_repository(),
            mirror_root: default_mirror_root(),
            distributions: default_distributions(),
            components: default_components(),
            architectures: default_architectures(),
            policy: SelectionPolicy::default(),
            package_lists: BTreeMap::new(),
            use_links: false,
            dry_run: false,
            fetch_artifacts: false,
            check_hashes: true,
            check_artifact_hashes: true,
            accept_any_architecture: false,
            scratch_prefix: default_scratch_prefix(),
            timeout: None,
            http_timeout_secs: default_http_timeout(),
        }
    }
}

fn default_repository() -> String {
    "http://security.debian.org/debian-security".to_string()
}

fn default_mirror_root() -> PathBuf {
    PathBuf::from("debian-security")
}

fn default_distributions() -> Vec<String> {
    vec!["bookworm-security".to_string()]
}

fn default_components() -> Vec<String> {
    ["main", "contrib", "non-free"].map(String::from).to_vec()
}

fn default_architectures() -> Vec<String> {
    ["amd64", "all"].map(String::from).to_vec()
}

fn default_true() -> bool {
    true
}

fn default_scratch_prefix() -> String {
    "tmp".to_string()
}

fn default_http_timeout() -> u64 {
    30
}

fn deserialize_timeout<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    value
        .map(|s| parse_timeout(&s).map_err(serde::de::Error::custom))
        .transpose()
}

/// Parse a timeout of the form `N[smhd]`; a bare number means hours
pub fn parse_timeout(value: &str) -> Result<Duration> {
    let value = value.trim();
    let (digits, unit) = match value.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => (&value[..i], Some(c)),
        _ => (value, None),
    };

    let amount: u64 = digits
        .parse()
        .map_err(|_| Error::ConfigError(format!("Invalid timeout: {value}")))?;

    let seconds = match unit {
        Some('s') => 1,
        Some('m') => 60,
        Some('h') | None => 3600,
        Some('d') => 3600 * 24,
        Some(other) => {
            return Err(Error::ConfigError(format!(
                "Invalid timeout unit '{other}' in {value} (expected s, m, h or d)"
            )));
        }
    };

    Ok(Duration::from_secs(amount * seconds))
}

impl MirrorConfig {
    /// Build a configuration for the given slice of an archive
    ///
    /// Unlike [`MirrorConfig::default`], the result fetches missing artifacts
    /// during an updating pass.
    pub fn configure(
        repository: impl Into<String>,
        mirror_root: impl Into<PathBuf>,
        distributions: &[&str],
        components: &[&str],
        architectures: &[&str],
        policy: SelectionPolicy,
    ) -> Self {
        let to_vec = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            repository: repository.into(),
            mirror_root: mirror_root.into(),
            distributions: to_vec(distributions),
            components: to_vec(components),
            architectures: to_vec(architectures),
            policy,
            fetch_artifacts: true,
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
            .map_err(|e| Error::ConfigError(format!("{}: {e}", path.display())))
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: MirrorConfig = toml::from_str(content)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.repository.trim().is_empty() {
            return Err(Error::ConfigError("repository must not be empty".to_string()));
        }
        if self.distributions.is_empty() {
            return Err(Error::ConfigError("at least one distribution is required".to_string()));
        }
        if self.components.is_empty() {
            return Err(Error::ConfigError("at least one component is required".to_string()));
        }
        if self.architectures.is_empty() {
            return Err(Error::ConfigError("at least one architecture is required".to_string()));
        }
        if let Some(dist) = self
            .package_lists
            .keys()
            .find(|d| !self.distributions.contains(d))
        {
            return Err(Error::ConfigError(format!(
                "package list given for unknown distribution '{dist}'"
            )));
        }
        crate::mirror::Locator::parse(&self.repository)?;
        Ok(())
    }

    /// Whether `component` is one of the configured components
    pub fn wants_component(&self, component: &str) -> bool {
        self.components.iter().any(|c| c == component)
    }

    /// Whether `arch` is one of the configured architectures
    pub fn wants_architecture(&self, arch: &str) -> bool {
        self.architectures.iter().any(|a| a == arch)
    }

    /// Read every configured package-name allow-list
    ///
    /// Each file is a whitespace-separated list of package names, e.g. the
    /// output of `awk '/^Package: / { print $2 }' /var/lib/dpkg/status`.
    pub fn load_package_lists(&self) -> Result<HashMap<String, HashSet<String>>> {
        let mut lists = HashMap::new();
        for (dist, path) in &self.package_lists {
            let content = std::fs::read_to_string(path).map_err(|e| {
                Error::ConfigError(format!(
                    "Unable to read package list {} for {dist}: {e}",
                    path.display()
                ))
            })?;
            let names: HashSet<String> = content.split_whitespace().map(String::from).collect();
            debug!("Read {} names from {} package list {}", names.len(), dist, path.display());
            lists.insert(dist.clone(), names);
        }
        Ok(lists)
    }
}

impl fmt::Display for MirrorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Repository: {}", self.repository)?;
        writeln!(f, "Distributions: {}", self.distributions.join(" "))?;
        writeln!(f, "Components: {}", self.components.join(" "))?;
        writeln!(f, "Architectures: {}", self.architectures.join(" "))?;
        writeln!(f, "Selection policy: {}", self.policy)?;
        write!(f, "Local mirror stored in: {}", self.mirror_root.display())?;
        if !self.package_lists.is_empty() {
            write!(f, "\nPackages mirrored are limited by these files:")?;
            for (dist, path) in &self.package_lists {
                write!(f, "\n  {}: {}", dist, path.display())?;
            }
        }
        Ok(())
    }
}
