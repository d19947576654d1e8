// src/compression/mod.rs
//! Encodings used by archive index files
//!
//! Archives publish the same index under several encodings (`Packages`,
//! `Packages.gz`, `Packages.bz2`, `Packages.xz`). This module is the closed
//! set of those encodings plus the capabilities needed around them: suffix
//! and content-type recognition, and streaming decoders.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use thiserror::Error;

/// Compression-related errors
#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("Failed to decompress {format} data: {source}")]
    Decompression {
        format: &'static str,
        source: io::Error,
    },

    #[error("Failed to open {path}: {source}")]
    Open { path: String, source: io::Error },

    #[error("Failed to rename {path}: {source}")]
    Rename { path: String, source: io::Error },

    #[error("Unsupported content type: {0}")]
    UnsupportedContentType(String),
}

/// Supported encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompressionFormat {
    /// Uncompressed
    #[default]
    Plain,
    /// Gzip compression (.gz)
    Gzip,
    /// Bzip2 compression (.bz2)
    Bzip2,
    /// XZ/LZMA compression (.xz)
    Xz,
}

impl CompressionFormat {
    /// Detect the encoding from a path or URL suffix
    ///
    /// # Examples
    /// ```
    /// use debmirror::compression::CompressionFormat;
    ///
    /// assert_eq!(CompressionFormat::from_extension("main/binary-amd64/Packages.gz"), CompressionFormat::Gzip);
    /// assert_eq!(CompressionFormat::from_extension("main/i18n/Translation-en.bz2"), CompressionFormat::Bzip2);
    /// assert_eq!(CompressionFormat::from_extension("main/binary-amd64/Packages"), CompressionFormat::Plain);
    /// ```
    pub fn from_extension(path: &str) -> Self {
        if path.ends_with(".gz") {
            Self::Gzip
        } else if path.ends_with(".bz2") {
            Self::Bzip2
        } else if path.ends_with(".xz") {
            Self::Xz
        } else {
            Self::Plain
        }
    }

    /// Interpret an HTTP `Content-Type` value
    ///
    /// Package archives and octet streams are plain content, as are `text/*`
    /// bodies and a missing header. Anything else is rejected.
    pub fn from_content_type(content_type: Option<&str>) -> Result<Self, CompressionError> {
        let Some(value) = content_type else {
            return Ok(Self::Plain);
        };
        let mime = value
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        if mime.ends_with("x-gzip") || mime.ends_with("/gzip") {
            Ok(Self::Gzip)
        } else if mime.ends_with("x-bzip2") {
            Ok(Self::Bzip2)
        } else if mime.ends_with("x-xz") {
            Ok(Self::Xz)
        } else if mime.ends_with("x-debian-package")
            || mime.ends_with("vnd.debian.binary-package")
            || mime.ends_with("octet-stream")
            || mime.starts_with("text/")
        {
            Ok(Self::Plain)
        } else {
            Err(CompressionError::UnsupportedContentType(value.to_string()))
        }
    }

    /// Get the file extension for this format
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Plain => "",
            Self::Gzip => ".gz",
            Self::Bzip2 => ".bz2",
            Self::Xz => ".xz",
        }
    }

    /// Remove this format's extension from a name, if present
    pub fn strip_extension<'a>(&self, name: &'a str) -> &'a str {
        name.strip_suffix(self.extension()).unwrap_or(name)
    }

    /// Get a human-readable name for this format
    pub fn name(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Gzip => "gzip",
            Self::Bzip2 => "bzip2",
            Self::Xz => "xz",
        }
    }
}

impl std::fmt::Display for CompressionFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Create a decompressing reader for the given format
///
/// For `CompressionFormat::Plain`, returns the reader unchanged.
pub fn create_decoder<'a, R: Read + 'a>(reader: R, format: CompressionFormat) -> Box<dyn Read + 'a> {
    match format {
        CompressionFormat::Plain => Box::new(reader),
        CompressionFormat::Gzip => Box::new(flate2::read::MultiGzDecoder::new(reader)),
        CompressionFormat::Bzip2 => Box::new(bzip2::read::MultiBzDecoder::new(reader)),
        CompressionFormat::Xz => Box::new(xz2::read::XzDecoder::new_multi_decoder(reader)),
    }
}

/// Open a file and wrap it in the decoder for `format`
pub fn open_decoded(path: &Path, format: CompressionFormat) -> Result<Box<dyn Read>, CompressionError> {
    let file = File::open(path).map_err(|e| CompressionError::Open {
        path: path.display().to_string(),
        source: e,
    })?;
    Ok(create_decoder(BufReader::new(file), format))
}

/// Decompress `src` into a newly created `dest`, returning the bytes written
pub fn decompress_file(src: &Path, dest: &Path, format: CompressionFormat) -> Result<u64, CompressionError> {
    let mut decoder = open_decoded(src, format)?;
    let mut out = File::create(dest).map_err(|e| CompressionError::Open {
        path: dest.display().to_string(),
        source: e,
    })?;
    io::copy(&mut decoder, &mut out).map_err(|e| CompressionError::Decompression {
        format: format.name(),
        source: e,
    })
}
