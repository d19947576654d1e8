// src/main.rs

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Cli;
use debmirror::config::DEFAULT_CONFIG_FILE;
use debmirror::{MirrorConfig, MirrorCoordinator};
use std::path::Path;
use std::process::ExitCode;
use tracing::{debug, info};

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing subscriber for logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    match run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> Result<MirrorConfig> {
    let path = match &cli.config {
        Some(path) => path.as_path(),
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => Path::new(DEFAULT_CONFIG_FILE),
        None => {
            debug!("No {} found, using defaults", DEFAULT_CONFIG_FILE);
            return Ok(MirrorConfig::default());
        }
    };
    MirrorConfig::load(path).with_context(|| format!("Failed to load {}", path.display()))
}

/// Run one pass; true when the mirror ends up complete
fn run(cli: &Cli) -> Result<bool> {
    let mut config = load_config(cli)?;
    cli.apply(&mut config)?;
    config.validate().context("Invalid configuration")?;

    if cli.info {
        println!("{config}");
        return Ok(true);
    }

    let repository = config.repository.clone();
    let mirror_root = config.mirror_root.clone();
    let fetch = config.fetch_artifacts;
    let mut coordinator = MirrorCoordinator::new(config)?;
    coordinator
        .prepare(cli.create)
        .context("Unable to set up the local mirror")?;

    let result = coordinator.run_pass(cli.update())?;

    let changed = result.changed().count();
    if changed > 0 {
        println!(
            "{} Repository {} change{}",
            repository,
            changed,
            if changed == 1 { "" } else { "s" }
        );
    } else {
        println!("{repository} Repository unchanged");
    }

    if fetch && !cli.update() {
        let summary = coordinator.fetch_missing()?;
        info!("{} fetched, {} failed", summary.fetched, summary.failed);
    }

    let mut complete = !result.timed_out;
    for report in coordinator.reports() {
        println!("  {report}");
        complete &= report.is_complete();
    }

    if complete {
        println!("{}: Repository Mirror at {} is up to date", repository, mirror_root.display());
    } else if result.timed_out || coordinator.reports().any(|r| r.interrupted) {
        println!("Time out expired - incomplete download");
    } else if !fetch {
        println!(
            "{} packages ({} bytes) missing - use --fetch to download them",
            result.missing_count(),
            result.missing_bytes()
        );
    }

    Ok(complete)
}
