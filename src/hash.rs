// src/hash.rs

//! Digests for mirror integrity checks
//!
//! Archives publish checksums in one of three manifest blocks:
//! - **MD5Sum**: MD5, still the only digest older archives carry
//! - **SHA1**: recognized as a block header but not verifiable here
//! - **SHA256**: SHA-256, used by every current archive
//!
//! [`HashAlgorithm`] is the set of digests this crate can compute,
//! [`ChecksumKind`] the set of digests a manifest can name.

use md5::Md5;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Buffer size for streaming files through a digest
const HASH_BUFFER_SIZE: usize = 8192;

/// Digest algorithms this crate can compute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    /// MD5 (128-bit)
    Md5,
    /// SHA-256 (256-bit)
    Sha256,
}

impl HashAlgorithm {
    /// Get the algorithm name as a string
    #[inline]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha256 => "sha256",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Checksum block kinds a release manifest may carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChecksumKind {
    Md5,
    Sha1,
    Sha256,
}

impl ChecksumKind {
    /// Manifest line that opens a block of this kind
    pub const fn block_header(&self) -> &'static str {
        match self {
            Self::Md5 => "MD5Sum:",
            Self::Sha1 => "SHA1:",
            Self::Sha256 => "SHA256:",
        }
    }

    /// Field carrying this digest in a package-index record
    pub const fn index_field(&self) -> &'static str {
        match self {
            Self::Md5 => "MD5sum",
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
        }
    }

    /// Recognize a block header token such as `SHA256:`
    pub fn from_block_header(token: &str) -> Option<Self> {
        [Self::Md5, Self::Sha1, Self::Sha256]
            .into_iter()
            .find(|k| k.block_header() == token)
    }

    /// The algorithm used to verify this kind, if we can compute it
    pub const fn algorithm(&self) -> Option<HashAlgorithm> {
        match self {
            Self::Md5 => Some(HashAlgorithm::Md5),
            Self::Sha1 => None,
            Self::Sha256 => Some(HashAlgorithm::Sha256),
        }
    }
}

impl fmt::Display for ChecksumKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.index_field())
    }
}

/// A declared digest: what a manifest or index says a file hashes to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Checksum {
    pub kind: ChecksumKind,
    /// Lowercase hex digest
    pub value: String,
}

impl Checksum {
    pub fn new(kind: ChecksumKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into().to_lowercase(),
        }
    }

    pub fn md5(value: impl Into<String>) -> Self {
        Self::new(ChecksumKind::Md5, value)
    }

    pub fn sha256(value: impl Into<String>) -> Self {
        Self::new(ChecksumKind::Sha256, value)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

/// Hasher that can compute digests using any supported algorithm
pub struct Hasher {
    state: HasherState,
}

enum HasherState {
    Md5(Md5),
    Sha256(Sha256),
}

impl Hasher {
    /// Create a new hasher with the specified algorithm
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let state = match algorithm {
            HashAlgorithm::Md5 => HasherState::Md5(Md5::new()),
            HashAlgorithm::Sha256 => HasherState::Sha256(Sha256::new()),
        };
        Self { state }
    }

    /// Update the hasher with more data
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            HasherState::Md5(hasher) => hasher.update(data),
            HasherState::Sha256(hasher) => hasher.update(data),
        }
    }

    /// Finalize and return the lowercase hex digest
    pub fn finalize_hex(self) -> String {
        match self.state {
            HasherState::Md5(hasher) => format!("{:x}", hasher.finalize()),
            HasherState::Sha256(hasher) => format!("{:x}", hasher.finalize()),
        }
    }
}

/// Compute the hex digest of a byte slice
pub fn hash_bytes(algorithm: HashAlgorithm, data: &[u8]) -> String {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finalize_hex()
}

/// Compute the hex digest of data from a reader
pub fn hash_reader<R: Read>(algorithm: HashAlgorithm, reader: &mut R) -> io::Result<String> {
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = [0u8; HASH_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize_hex())
}

/// Compute the hex digest of a file, streaming its content
pub fn hash_file(algorithm: HashAlgorithm, path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    hash_reader(algorithm, &mut file)
}
