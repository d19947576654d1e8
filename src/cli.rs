// src/cli.rs
//! CLI definitions for debmirror
//!
//! Flags override the values of the configuration file.

use anyhow::{Context, Result};
use clap::Parser;
use debmirror::MirrorConfig;
use debmirror::config::parse_timeout;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "debmirror")]
#[command(author = "Conary Contributors")]
#[command(version)]
#[command(about = "Selectively mirror a Debian package archive", long_about = None)]
pub struct Cli {
    /// Configuration file (default: ./debmirror.toml if present)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Print the configuration and exit
    #[arg(long)]
    pub info: bool,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Create the mirror root and distribution directories if missing
    #[arg(long)]
    pub create: bool,

    /// Do not refresh release and package files from the archive
    #[arg(long)]
    pub norefresh: bool,

    /// Download missing packages
    #[arg(long)]
    pub fetch: bool,

    /// Hard-link files from a local archive instead of copying them
    #[arg(long)]
    pub uselinks: bool,

    /// Show what would be downloaded without changing the mirror
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Stop starting new downloads after this long, e.g. 30m or 6h
    #[arg(short = 'T', long, value_name = "N[smhd]")]
    pub timeout: Option<String>,

    /// Check package sizes only, not their digests
    #[arg(long)]
    pub no_artifact_hashes: bool,
}

impl Cli {
    /// Fold the command-line flags into a loaded configuration
    pub fn apply(&self, config: &mut MirrorConfig) -> Result<()> {
        config.use_links |= self.uselinks;
        config.dry_run |= self.dry_run;
        config.fetch_artifacts |= self.fetch;
        if self.no_artifact_hashes {
            config.check_artifact_hashes = false;
        }
        if let Some(timeout) = &self.timeout {
            config.timeout = Some(parse_timeout(timeout).context("Invalid --timeout")?);
        }
        Ok(())
    }

    /// Whether the pass refreshes manifests and indexes
    pub fn update(&self) -> bool {
        !self.norefresh
    }
}
