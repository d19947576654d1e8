// src/error.rs

//! Error types for the mirror engine
//!
//! Most of the engine reports trouble as a boolean at the cache-entry
//! boundary; these errors are what remains: setup failures, unparseable
//! manifests and bad configuration.

use thiserror::Error;

/// Mirror errors
#[derive(Error, Debug)]
pub enum Error {
    /// A manifest or index could not be parsed
    #[error("Parse error: {0}")]
    ParseError(String),

    /// A component (HTTP client, decoder) could not be initialized
    #[error("Initialization error: {0}")]
    InitError(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Archive root or object locator that is neither http(s) nor file
    #[error("Invalid locator: {0}")]
    InvalidLocator(String),

    /// Mirror skeleton or scratch directory could not be created
    #[error("Setup failed: {0}")]
    FatalSetup(String),
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;
