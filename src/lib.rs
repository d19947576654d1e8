// src/lib.rs

//! Selective Debian archive mirror
//!
//! Keeps a local copy of a slice of a Debian-style package archive: chosen
//! distributions, components and architectures, optionally restricted to a
//! list of package names.
//!
//! # Architecture
//!
//! - Release manifests drive everything: only files they list are mirrored
//! - Every object is fetched into a scratch file, verified, then renamed
//!   into place, so the mirror never holds a partial download
//! - Each package index is published in several encodings; a selection
//!   policy decides which of them are kept
//! - Passes are sequential and can be bounded by a soft deadline

pub mod compression;
pub mod config;
mod error;
pub mod hash;
pub mod mirror;

pub use compression::CompressionFormat;
pub use config::{MirrorConfig, SelectionPolicy};
pub use error::{Error, Result};
pub use hash::{Checksum, ChecksumKind, HashAlgorithm, Hasher};
pub use mirror::{
    CacheEntry, DistributionReport, FetchSummary, Locator, MirrorCoordinator, MirrorLayout,
    PassResult, ReleaseDescriptor, Transport,
};
