// src/mirror/locator.rs

//! Remote object locators
//!
//! An archive can be reached over HTTP(S) or read from a local directory.
//! Local locators accept the usual `file:///abs/path` form as well as the
//! short `file:/abs/path` and relative `file:some/dir` forms.

use crate::error::{Error, Result};
use std::fmt;
use std::path::PathBuf;
use url::Url;

/// Where a remote object lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    /// An `http://` or `https://` URL
    Http(String),
    /// A file on a locally mounted archive
    File(PathBuf),
}

impl Locator {
    /// Parse an archive root or object locator
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix("file:") {
            let path = rest.strip_prefix("//").unwrap_or(rest);
            if path.is_empty() {
                return Err(Error::InvalidLocator(s.to_string()));
            }
            return Ok(Self::File(PathBuf::from(path)));
        }

        let url = Url::parse(s).map_err(|e| Error::InvalidLocator(format!("{s}: {e}")))?;
        match url.scheme() {
            "http" | "https" => Ok(Self::Http(s.trim_end_matches('/').to_string())),
            other => Err(Error::InvalidLocator(format!(
                "{s}: unsupported scheme '{other}'"
            ))),
        }
    }

    /// Locator of `relative` underneath this one
    pub fn join(&self, relative: &str) -> Self {
        let relative = relative.trim_start_matches('/');
        match self {
            Self::Http(base) => Self::Http(format!("{}/{}", base.trim_end_matches('/'), relative)),
            Self::File(base) => Self::File(base.join(relative)),
        }
    }

    /// Last path component, used to judge the object's own encoding
    pub fn file_name(&self) -> &str {
        match self {
            Self::Http(url) => url.rsplit('/').next().unwrap_or(url),
            Self::File(path) => path.file_name().and_then(|n| n.to_str()).unwrap_or_default(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::File(_))
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(url) => write!(f, "{url}"),
            Self::File(path) => write!(f, "file:{}", path.display()),
        }
    }
}
