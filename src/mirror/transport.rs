// src/mirror/transport.rs

//! Retrieval of remote objects into scratch files
//!
//! A [`Transport`] is shared by every cache entry of a pass. It owns the HTTP
//! client and knows where scratch files go and whether local archives should
//! be hard-linked rather than copied. It never touches canonical mirror paths.

use crate::config::MirrorConfig;
use crate::error::{Error, Result};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use super::locator::Locator;

/// Buffer size for streaming downloads (8 KB)
const STREAM_BUFFER_SIZE: usize = 8192;

/// Mode of every file the mirror installs: owner rw, group/other r
pub(crate) const MIRROR_FILE_MODE: u32 = 0o644;

/// Outcome of one retrieval attempt
#[derive(Debug)]
pub enum Retrieval {
    /// Object written to the destination; HTTP retrievals carry the
    /// declared content type. `linked` means the destination shares its
    /// inode with a local archive file.
    Retrieved {
        content_type: Option<String>,
        linked: bool,
    },
    /// Object does not exist remotely (HTTP 404, missing local file)
    Absent,
    /// Anything else: network errors, unexpected statuses, local I/O
    Failed(String),
}

/// Retrieval context for one pass
pub struct Transport {
    client: Client,
    scratch_dir: PathBuf,
    use_links: bool,
    dry_run: bool,
}

impl Transport {
    /// Create a transport writing scratch files into `scratch_dir`
    pub fn new(config: &MirrorConfig, scratch_dir: impl Into<PathBuf>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            scratch_dir: scratch_dir.into(),
            use_links: config.use_links,
            dry_run: config.dry_run,
        })
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    /// Allocate a fresh, uniquely named scratch file for `canonical`
    pub fn new_scratch_file(&self, canonical: &Path) -> io::Result<PathBuf> {
        let base = canonical
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("object");
        let (_file, path) = tempfile::Builder::new()
            .prefix(&format!("{base}_"))
            .tempfile_in(&self.scratch_dir)?
            .keep()
            .map_err(|e| e.error)?;
        Ok(path)
    }

    /// Retrieve `locator` into `dest`, replacing whatever is there
    pub fn retrieve(&self, locator: &Locator, dest: &Path) -> Retrieval {
        match locator {
            Locator::Http(url) => self.retrieve_http(url, dest),
            Locator::File(path) => self.retrieve_local(path, dest),
        }
    }

    fn retrieve_http(&self, url: &str, dest: &Path) -> Retrieval {
        debug!("Fetching {} -> {}", url, dest.display());

        let response = match self.client.get(url).send() {
            Ok(response) => response,
            Err(e) => return Retrieval::Failed(format!("Failed to fetch {url}: {e}")),
        };

        if response.status() == StatusCode::NOT_FOUND {
            return Retrieval::Absent;
        }
        if !response.status().is_success() {
            return Retrieval::Failed(format!("HTTP {} from {}", response.status(), url));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        let written = File::create(dest)
            .map_err(|e| format!("Failed to create file {}: {e}", dest.display()))
            .and_then(|mut file| stream_response_to_file(response, &mut file));

        match written {
            Ok(bytes) => {
                debug!("Downloaded {} bytes from {}", bytes, url);
                Retrieval::Retrieved {
                    content_type,
                    linked: false,
                }
            }
            Err(msg) => Retrieval::Failed(msg),
        }
    }

    fn retrieve_local(&self, src: &Path, dest: &Path) -> Retrieval {
        if !src.exists() {
            return Retrieval::Absent;
        }

        if self.use_links {
            debug!("hard_link({}, {})", src.display(), dest.display());
            if dest.exists()
                && let Err(e) = fs::remove_file(dest)
            {
                return Retrieval::Failed(format!("Failed to remove {}: {e}", dest.display()));
            }
            match fs::hard_link(src, dest) {
                Ok(()) => {
                    return Retrieval::Retrieved {
                        content_type: None,
                        linked: true,
                    };
                }
                Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
                    debug!("{} is on another device, copying instead", src.display());
                }
                Err(e) => {
                    return Retrieval::Failed(format!(
                        "Failed to link {} to {}: {e}",
                        src.display(),
                        dest.display()
                    ));
                }
            }
        }

        debug!("copy({}, {})", src.display(), dest.display());
        let copied = fs::copy(src, dest)
            .and_then(|_| fs::set_permissions(dest, fs::Permissions::from_mode(MIRROR_FILE_MODE)));
        match copied {
            Ok(()) => Retrieval::Retrieved {
                content_type: None,
                linked: false,
            },
            Err(e) => Retrieval::Failed(format!(
                "Failed to copy {} to {}: {e}",
                src.display(),
                dest.display()
            )),
        }
    }
}

/// Stream an HTTP response to a file in fixed-size chunks
///
/// Never buffers the entire response in memory.
fn stream_response_to_file(
    mut response: reqwest::blocking::Response,
    file: &mut File,
) -> std::result::Result<u64, String> {
    let mut downloaded: u64 = 0;
    let mut buffer = [0u8; STREAM_BUFFER_SIZE];

    loop {
        let bytes_read = response
            .read(&mut buffer)
            .map_err(|e| format!("Failed to read response: {e}"))?;

        if bytes_read == 0 {
            break;
        }

        file.write_all(&buffer[..bytes_read])
            .map_err(|e| format!("Failed to write data: {e}"))?;

        downloaded += bytes_read as u64;
    }

    Ok(downloaded)
}
