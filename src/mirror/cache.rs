// src/mirror/cache.rs

//! Verify/fetch/replace lifecycle for one mirrored object
//!
//! A [`CacheEntry`] pairs a remote locator with its canonical path in the
//! mirror. Fresh copies are always fetched into a scratch path; the canonical
//! file changes only through [`CacheEntry::replace`], which renames the
//! scratch file into place.
//!
//! Every operation reports its outcome as a boolean. Absent objects are
//! expected and silent, other failures are logged, and nothing propagates.
//! `fetch` and `replace` perform their side effect at most once per entry;
//! later calls return the remembered result.

use crate::compression::{self, CompressionError, CompressionFormat};
use crate::hash::{self, Checksum};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::locator::Locator;
use super::transport::{MIRROR_FILE_MODE, Retrieval, Transport};

/// Chunk size for byte-for-byte comparisons
const COMPARE_CHUNK_SIZE: usize = 8192;

/// One remote object and its place in the mirror
#[derive(Debug)]
pub struct CacheEntry {
    locator: Locator,
    canonical: PathBuf,
    scratch: Option<PathBuf>,
    /// Scratch file is a hard link to a local archive file
    linked: bool,
    fetch_result: Option<bool>,
    replace_result: Option<bool>,
}

impl CacheEntry {
    pub fn new(locator: Locator, canonical: impl Into<PathBuf>) -> Self {
        Self {
            locator,
            canonical: canonical.into(),
            scratch: None,
            linked: false,
            fetch_result: None,
            replace_result: None,
        }
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    pub fn canonical_path(&self) -> &Path {
        &self.canonical
    }

    pub fn scratch_path(&self) -> Option<&Path> {
        self.scratch.as_deref()
    }

    /// Whether a fetch succeeded
    pub fn fetched(&self) -> bool {
        self.fetch_result == Some(true)
    }

    /// Whether a fetch was attempted at all
    pub fn fetch_attempted(&self) -> bool {
        self.fetch_result.is_some()
    }

    /// Whether the scratch copy was installed as canonical
    pub fn replaced(&self) -> bool {
        self.replace_result == Some(true)
    }

    /// Check the canonical file against an expected size and digest
    pub fn verify(&self, size: Option<u64>, checksum: Option<&Checksum>) -> bool {
        verify_file(&self.canonical, size, checksum)
    }

    /// Check the scratch file against an expected size and digest
    pub fn verify_scratch(&self, size: Option<u64>, checksum: Option<&Checksum>) -> bool {
        match &self.scratch {
            Some(scratch) => verify_file(scratch, size, checksum),
            None => false,
        }
    }

    /// Fetch a fresh copy into a newly allocated scratch file
    pub fn fetch(&mut self, transport: &Transport) -> bool {
        if let Some(result) = self.fetch_result {
            return result;
        }
        if transport.dry_run() {
            info!("Would fetch {} -> {}", self.locator, self.canonical.display());
            self.fetch_result = Some(false);
            return false;
        }

        let scratch = match transport.new_scratch_file(&self.canonical) {
            Ok(path) => path,
            Err(e) => {
                warn!("Failed to create scratch file for {}: {}", self.canonical.display(), e);
                self.fetch_result = Some(false);
                return false;
            }
        };
        self.fetch_into(transport, scratch)
    }

    /// Fetch a fresh copy into `dest`, which becomes the scratch path
    pub fn fetch_to(&mut self, transport: &Transport, dest: &Path) -> bool {
        if let Some(result) = self.fetch_result {
            return result;
        }
        if transport.dry_run() {
            info!("Would fetch {} -> {}", self.locator, dest.display());
            self.fetch_result = Some(false);
            return false;
        }
        self.fetch_into(transport, dest.to_path_buf())
    }

    fn fetch_into(&mut self, transport: &Transport, scratch: PathBuf) -> bool {
        let ok = match transport.retrieve(&self.locator, &scratch) {
            Retrieval::Retrieved { content_type, linked } => {
                self.linked = linked;
                if self.locator.is_local() {
                    true
                } else {
                    match reconcile_content_type(&scratch, self.locator.file_name(), content_type.as_deref()) {
                        Ok(()) => true,
                        Err(e) => {
                            warn!("{}: {}", self.locator, e);
                            false
                        }
                    }
                }
            }
            Retrieval::Absent => {
                debug!("Not found: {}", self.locator);
                false
            }
            Retrieval::Failed(msg) => {
                warn!("{}", msg);
                false
            }
        };

        self.scratch = Some(scratch);
        self.fetch_result = Some(ok);
        ok
    }

    /// Byte-for-byte comparison of the canonical file and the scratch copy
    pub fn matches_previous(&self) -> bool {
        match &self.scratch {
            Some(scratch) => files_match(&self.canonical, scratch),
            None => false,
        }
    }

    /// Install the scratch copy as the canonical file
    pub fn replace(&mut self, transport: &Transport) -> bool {
        let scratch = match &self.scratch {
            Some(scratch) if self.fetched() => scratch.clone(),
            _ => {
                debug!("Nothing fetched for {}", self.canonical.display());
                return false;
            }
        };
        let canonical = self.canonical.clone();
        self.replace_at(transport, &canonical, &scratch)
    }

    /// Install `scratch` over `canonical` by rename
    pub fn replace_at(&mut self, transport: &Transport, canonical: &Path, scratch: &Path) -> bool {
        if let Some(result) = self.replace_result {
            return result;
        }
        if transport.dry_run() {
            info!("Would rename {} -> {}", scratch.display(), canonical.display());
            self.replace_result = Some(false);
            return false;
        }

        let ok = install(scratch, canonical, !self.linked);
        self.replace_result = Some(ok);
        ok
    }
}

/// Check a file against an expected size and digest
///
/// Size is checked first and a mismatch skips hashing. Digests we cannot
/// compute pass. Any I/O error means the file does not verify.
pub fn verify_file(path: &Path, size: Option<u64>, checksum: Option<&Checksum>) -> bool {
    let metadata = match fs::metadata(path) {
        Ok(m) if m.is_file() => m,
        _ => {
            debug!("Missing file - {}", path.display());
            return false;
        }
    };

    if let Some(expected) = size
        && metadata.len() != expected
    {
        debug!("{}: size {} != {}", path.display(), metadata.len(), expected);
        return false;
    }

    let Some(checksum) = checksum else {
        return File::open(path).is_ok();
    };

    let Some(algorithm) = checksum.kind.algorithm() else {
        info!("{}: cannot verify {} digests, accepting", path.display(), checksum.kind);
        return true;
    };

    match hash::hash_file(algorithm, path) {
        Ok(actual) if actual == checksum.value => true,
        Ok(actual) => {
            debug!("{}: {} {} != {}", path.display(), algorithm, actual, checksum.value);
            false
        }
        Err(e) => {
            debug!("{}: {}", path.display(), e);
            false
        }
    }
}

/// Byte-for-byte comparison of two files
pub fn files_match(a: &Path, b: &Path) -> bool {
    compare_files(a, b).unwrap_or(false)
}

fn compare_files(a: &Path, b: &Path) -> io::Result<bool> {
    if fs::metadata(a)?.len() != fs::metadata(b)?.len() {
        return Ok(false);
    }

    let mut fa = File::open(a)?;
    let mut fb = File::open(b)?;
    let mut buf_a = vec![0u8; COMPARE_CHUNK_SIZE];
    let mut buf_b = vec![0u8; COMPARE_CHUNK_SIZE];

    loop {
        let na = read_chunk(&mut fa, &mut buf_a)?;
        let nb = read_chunk(&mut fb, &mut buf_b)?;
        if na != nb || buf_a[..na] != buf_b[..nb] {
            return Ok(false);
        }
        if na == 0 {
            return Ok(true);
        }
    }
}

/// Fill `buf` as far as the reader allows; short only at end of file
fn read_chunk<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Rename `scratch` over `canonical`, creating the parent directory once if
/// it is missing, then fix the mode unless the inode belongs to someone else
fn install(scratch: &Path, canonical: &Path, fix_mode: bool) -> bool {
    debug!("rename {} => {}", scratch.display(), canonical.display());

    if let Err(e) = fs::rename(scratch, canonical) {
        let parent = canonical.parent().filter(|p| !p.as_os_str().is_empty());
        match parent {
            Some(dir) if e.kind() == io::ErrorKind::NotFound && !dir.is_dir() => {
                info!("{} missing - creating", dir.display());
                if let Err(e) = fs::create_dir_all(dir) {
                    warn!("Failed - unable to create directory {}: {}", dir.display(), e);
                    return false;
                }
                if let Err(e) = fs::rename(scratch, canonical) {
                    warn!("mv {} {} failed: {}", scratch.display(), canonical.display(), e);
                    return false;
                }
            }
            _ => {
                warn!("mv {} {} failed: {}", scratch.display(), canonical.display(), e);
                return false;
            }
        }
    }

    if !fix_mode {
        return true;
    }
    if let Err(e) = fs::set_permissions(canonical, fs::Permissions::from_mode(MIRROR_FILE_MODE)) {
        warn!("Failed to set mode of {}: {}", canonical.display(), e);
        return false;
    }
    true
}

/// Undo transfer-level compression announced by the server
///
/// When the declared content type names a compression that the object's own
/// name does not carry, the scratch file is renamed with the implied suffix
/// and decompressed back into the scratch path.
pub fn reconcile_content_type(
    scratch: &Path,
    remote_name: &str,
    content_type: Option<&str>,
) -> Result<(), CompressionError> {
    let implied = CompressionFormat::from_content_type(content_type)?;
    let own = CompressionFormat::from_extension(remote_name);
    if implied == CompressionFormat::Plain || implied == own {
        return Ok(());
    }

    let mut compressed: OsString = scratch.as_os_str().to_owned();
    compressed.push(implied.extension());
    let compressed = PathBuf::from(compressed);

    debug!(
        "{} served as {}, decompressing {}",
        remote_name,
        implied,
        compressed.display()
    );
    fs::rename(scratch, &compressed).map_err(|e| CompressionError::Rename {
        path: scratch.display().to_string(),
        source: e,
    })?;
    compression::decompress_file(&compressed, scratch, implied)?;
    if let Err(e) = fs::remove_file(&compressed) {
        debug!("Failed to remove {}: {}", compressed.display(), e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MirrorConfig;
    use crate::hash::HashAlgorithm;
    use std::io::Write;
    use std::os::unix::fs::MetadataExt;

    struct Fixture {
        dir: tempfile::TempDir,
        transport: Transport,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_config(MirrorConfig::default())
        }

        fn with_config(config: MirrorConfig) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let scratch = dir.path().join("scratch");
            fs::create_dir(&scratch).unwrap();
            let transport = Transport::new(&config, &scratch).unwrap();
            Self { dir, transport }
        }

        fn path(&self, rel: &str) -> PathBuf {
            self.dir.path().join(rel)
        }

        fn remote(&self, rel: &str, content: &[u8]) -> Locator {
            let path = self.path(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, content).unwrap();
            Locator::File(path)
        }
    }

    #[test]
    fn test_verify_size_only() {
        let fx = Fixture::new();
        let entry = CacheEntry::new(Locator::File(fx.path("none")), fx.path("mirror/a.deb"));
        assert!(!entry.verify(Some(5), None));

        fs::create_dir_all(fx.path("mirror")).unwrap();
        fs::write(fx.path("mirror/a.deb"), b"hello").unwrap();
        assert!(entry.verify(Some(5), None));
        assert!(!entry.verify(Some(4), None));
        assert!(entry.verify(None, None));
    }

    #[test]
    fn test_verify_size_and_md5() {
        let fx = Fixture::new();
        fs::write(fx.path("a.deb"), b"hello").unwrap();
        let entry = CacheEntry::new(Locator::File(fx.path("none")), fx.path("a.deb"));

        let good = Checksum::md5("5d41402abc4b2a76b9719d911017c592");
        let bad = Checksum::md5("00000000000000000000000000000000");
        assert!(entry.verify(Some(5), Some(&good)));
        assert!(!entry.verify(Some(5), Some(&bad)));
    }

    #[test]
    fn test_verify_sha256_and_unverifiable() {
        let fx = Fixture::new();
        fs::write(fx.path("a"), b"hello").unwrap();
        let entry = CacheEntry::new(Locator::File(fx.path("none")), fx.path("a"));

        let sha = Checksum::sha256(hash::hash_bytes(HashAlgorithm::Sha256, b"hello"));
        assert!(entry.verify(Some(5), Some(&sha)));

        let sha1 = Checksum::new(crate::hash::ChecksumKind::Sha1, "not-checked");
        assert!(entry.verify(Some(5), Some(&sha1)));
        assert!(!entry.verify(Some(6), Some(&sha1)));
    }

    #[test]
    fn test_fetch_is_memoized() {
        let fx = Fixture::new();
        let remote = fx.remote("archive/pool/a.deb", b"first");
        let mut entry = CacheEntry::new(remote, fx.path("mirror/pool/a.deb"));

        assert!(entry.fetch(&fx.transport));
        let scratch = entry.scratch_path().unwrap().to_path_buf();
        assert_eq!(fs::read(&scratch).unwrap(), b"first");

        // A changed remote is not seen again: the second call does no I/O
        fs::write(fx.path("archive/pool/a.deb"), b"second").unwrap();
        assert!(entry.fetch(&fx.transport));
        assert_eq!(entry.scratch_path().unwrap(), scratch);
        assert_eq!(fs::read(&scratch).unwrap(), b"first");
    }

    #[test]
    fn test_failed_fetch_is_memoized() {
        let fx = Fixture::new();
        let mut entry = CacheEntry::new(Locator::File(fx.path("archive/missing")), fx.path("m"));
        assert!(!entry.fetch(&fx.transport));
        assert!(entry.fetch_attempted());
        assert!(!entry.fetched());

        fx.remote("archive/missing", b"late");
        assert!(!entry.fetch(&fx.transport));
    }

    #[test]
    fn test_fetch_never_touches_canonical() {
        let fx = Fixture::new();
        let remote = fx.remote("archive/Release", b"new");
        fs::write(fx.path("Release"), b"old").unwrap();
        let mut entry = CacheEntry::new(remote, fx.path("Release"));

        assert!(entry.fetch(&fx.transport));
        assert_eq!(fs::read(fx.path("Release")).unwrap(), b"old");
        assert!(!entry.matches_previous());
    }

    #[test]
    fn test_fetch_to_explicit_destination() {
        let fx = Fixture::new();
        let remote = fx.remote("archive/Release", b"data");
        let mut entry = CacheEntry::new(remote, fx.path("Release"));

        let dest = fx.path("scratch/Release.new");
        assert!(entry.fetch_to(&fx.transport, &dest));
        assert_eq!(entry.scratch_path(), Some(dest.as_path()));
        assert_eq!(fs::read(&dest).unwrap(), b"data");
    }

    #[test]
    fn test_matches_previous() {
        let fx = Fixture::new();
        let content: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let remote = fx.remote("archive/Release", &content);
        fs::write(fx.path("Release"), &content).unwrap();

        let mut entry = CacheEntry::new(remote, fx.path("Release"));
        assert!(!entry.matches_previous());
        assert!(entry.fetch(&fx.transport));
        assert!(entry.matches_previous());

        // Same size, one byte different in the last chunk
        let mut changed = content.clone();
        changed[19_999] ^= 0xff;
        fs::write(fx.path("Release"), &changed).unwrap();
        assert!(!entry.matches_previous());

        fs::remove_file(fx.path("Release")).unwrap();
        assert!(!entry.matches_previous());
    }

    #[test]
    fn test_replace_installs_and_verifies() {
        let fx = Fixture::new();
        let remote = fx.remote("archive/pool/main/h/hello.deb", b"hello");
        let canonical = fx.path("mirror/pool/main/h/hello.deb");
        let mut entry = CacheEntry::new(remote, &canonical);
        let md5 = Checksum::md5("5d41402abc4b2a76b9719d911017c592");

        assert!(!entry.verify(Some(5), Some(&md5)));
        assert!(entry.fetch(&fx.transport));
        assert!(entry.verify_scratch(Some(5), Some(&md5)));
        assert!(entry.replace(&fx.transport));
        assert!(entry.replaced());
        assert!(entry.verify(Some(5), Some(&md5)));
        assert_eq!(fs::metadata(&canonical).unwrap().mode() & 0o777, 0o644);
        assert!(!entry.scratch_path().unwrap().exists());

        // Memoized: no second rename attempt, same answer
        assert!(entry.replace(&fx.transport));
    }

    #[test]
    fn test_linked_replace_keeps_archive_mode() {
        let fx = Fixture::with_config(MirrorConfig {
            use_links: true,
            ..MirrorConfig::default()
        });
        let remote = fx.remote("archive/pool/a.deb", b"payload");
        let source = fx.path("archive/pool/a.deb");
        fs::set_permissions(&source, fs::Permissions::from_mode(0o600)).unwrap();
        let canonical = fx.path("mirror/pool/a.deb");

        let mut entry = CacheEntry::new(remote, &canonical);
        assert!(entry.fetch(&fx.transport));
        assert!(entry.replace(&fx.transport));

        assert_eq!(fs::read(&canonical).unwrap(), b"payload");
        assert_eq!(fs::metadata(&canonical).unwrap().ino(), fs::metadata(&source).unwrap().ino());
        assert_eq!(fs::metadata(&source).unwrap().mode() & 0o777, 0o600);
    }

    #[test]
    fn test_abort_before_replace_keeps_canonical() {
        let fx = Fixture::new();
        let remote = fx.remote("archive/Release", b"new content");
        fs::write(fx.path("Release"), b"old").unwrap();

        let mut entry = CacheEntry::new(remote, fx.path("Release"));
        assert!(entry.fetch(&fx.transport));
        drop(entry);

        assert_eq!(fs::read(fx.path("Release")).unwrap(), b"old");
    }

    #[test]
    fn test_replace_without_fetch_fails() {
        let fx = Fixture::new();
        let mut entry = CacheEntry::new(Locator::File(fx.path("x")), fx.path("y"));
        assert!(!entry.replace(&fx.transport));
        assert!(!entry.replaced());
    }

    #[test]
    fn test_dry_run_does_nothing() {
        let fx = Fixture::with_config(MirrorConfig {
            dry_run: true,
            ..MirrorConfig::default()
        });
        let remote = fx.remote("archive/a.deb", b"data");
        let mut entry = CacheEntry::new(remote, fx.path("mirror/a.deb"));

        assert!(!entry.fetch(&fx.transport));
        assert!(entry.scratch_path().is_none());
        assert_eq!(fs::read_dir(fx.path("scratch")).unwrap().count(), 0);
    }

    #[test]
    fn test_reconcile_gzip_served_for_deb() {
        let fx = Fixture::new();
        let scratch = fx.path("scratch/hello.deb_x");
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"plain deb bytes").unwrap();
        fs::write(&scratch, encoder.finish().unwrap()).unwrap();

        reconcile_content_type(&scratch, "hello.deb", Some("application/x-gzip")).unwrap();

        assert_eq!(fs::read(&scratch).unwrap(), b"plain deb bytes");
        assert!(!fx.path("scratch/hello.deb_x.gz").exists());
        assert!(verify_file(
            &scratch,
            Some(15),
            Some(&Checksum::md5(hash::hash_bytes(HashAlgorithm::Md5, b"plain deb bytes")))
        ));
    }

    #[test]
    fn test_reconcile_leaves_consistent_content() {
        let fx = Fixture::new();
        let scratch = fx.path("scratch/Packages.gz_x");
        fs::write(&scratch, b"\x1f\x8bnot really").unwrap();

        reconcile_content_type(&scratch, "Packages.gz", Some("application/x-gzip")).unwrap();
        reconcile_content_type(&scratch, "Packages.gz", Some("application/octet-stream")).unwrap();
        assert_eq!(fs::read(&scratch).unwrap(), b"\x1f\x8bnot really");
    }

    #[test]
    fn test_reconcile_failures() {
        let fx = Fixture::new();
        let scratch = fx.path("scratch/hello.deb_x");
        fs::write(&scratch, b"not gzip at all").unwrap();

        assert!(matches!(
            reconcile_content_type(&scratch, "hello.deb", Some("image/png")),
            Err(CompressionError::UnsupportedContentType(_))
        ));
        assert!(matches!(
            reconcile_content_type(&scratch, "hello.deb", Some("application/x-gzip")),
            Err(CompressionError::Decompression { format: "gzip", .. })
        ));

        let missing = fx.path("scratch/gone.deb_x");
        assert!(matches!(
            reconcile_content_type(&missing, "gone.deb", Some("application/x-gzip")),
            Err(CompressionError::Rename { .. })
        ));
    }
}
