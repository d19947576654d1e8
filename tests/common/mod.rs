// tests/common/mod.rs

//! Shared test utilities for integration tests.
//!
//! Builds a small Debian-style archive in a temporary directory, reachable
//! through a `file:` locator, next to an empty mirror root.

#![allow(dead_code)]

use debmirror::hash::{HashAlgorithm, hash_bytes};
use debmirror::{MirrorConfig, SelectionPolicy};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// One package published in the test archive
#[derive(Debug, Clone)]
pub struct TestPackage {
    pub name: String,
    pub architecture: String,
    pub filename: String,
    pub content: Vec<u8>,
}

impl TestPackage {
    pub fn new(name: &str, version: &str) -> Self {
        let first = &name[..1];
        Self {
            name: name.to_string(),
            architecture: "amd64".to_string(),
            filename: format!("pool/main/{first}/{name}/{name}_{version}_amd64.deb"),
            content: format!("!<arch>\n{name} {version} payload\n").into_bytes(),
        }
    }

    pub fn stanza(&self) -> String {
        format!(
            "Package: {}\nVersion: 1.0\nArchitecture: {}\nMaintainer: Test <test@example.org>\nFilename: {}\nSize: {}\nMD5sum: {}\nSHA256: {}\nDescription: test package {}\n multi-line description\n\n",
            self.name,
            self.architecture,
            self.filename,
            self.content.len(),
            md5_hex(&self.content),
            sha256_hex(&self.content),
            self.name,
        )
    }
}

/// Archive plus mirror root in one temporary directory
pub struct TestArchive {
    pub dir: TempDir,
}

impl TestArchive {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("archive")).unwrap();
        Self { dir }
    }

    pub fn archive_root(&self) -> PathBuf {
        self.dir.path().join("archive")
    }

    pub fn mirror_root(&self) -> PathBuf {
        self.dir.path().join("mirror")
    }

    pub fn mirror_path(&self, rel: &str) -> PathBuf {
        self.mirror_root().join(rel)
    }

    /// Mirror configuration for `dists` with component main, arch amd64
    pub fn config(&self, dists: &[&str]) -> MirrorConfig {
        MirrorConfig::configure(
            format!("file:{}", self.archive_root().display()),
            self.mirror_root(),
            dists,
            &["main"],
            &["amd64"],
            SelectionPolicy::FirstAvailable,
        )
    }

    pub fn write(&self, rel: &str, data: &[u8]) {
        write_file(&self.archive_root().join(rel), data);
    }

    pub fn remove(&self, rel: &str) {
        fs::remove_file(self.archive_root().join(rel)).unwrap();
    }

    /// Write every package file into the pool
    pub fn add_packages(&self, packages: &[TestPackage]) {
        for pkg in packages {
            self.write(&pkg.filename, &pkg.content);
        }
    }

    /// Publish a distribution with a detached signature `Release.gpg`
    pub fn publish(&self, dist: &str, files: &[DistFile]) {
        self.write_dist_files(dist, files);
        let manifest = release_text(dist, files);
        self.write(&format!("dists/{dist}/Release"), manifest.as_bytes());
        self.write(&format!("dists/{dist}/Release.gpg"), b"-----BEGIN PGP SIGNATURE-----\nsig\n");
    }

    /// Publish a distribution with only an inline-signed `InRelease`
    pub fn publish_inline(&self, dist: &str, files: &[DistFile]) {
        self.write_dist_files(dist, files);
        let manifest = format!(
            "-----BEGIN PGP SIGNED MESSAGE-----\nHash: SHA512\n\n{}\n-----BEGIN PGP SIGNATURE-----\n\nabcdef\n-----END PGP SIGNATURE-----\n",
            release_text(dist, files)
        );
        self.write(&format!("dists/{dist}/InRelease"), manifest.as_bytes());
    }

    fn write_dist_files(&self, dist: &str, files: &[DistFile]) {
        for file in files.iter().filter(|f| f.published) {
            self.write(&format!("dists/{dist}/{}", file.path), &file.content);
        }
    }
}

/// A file listed in a release manifest
#[derive(Debug, Clone)]
pub struct DistFile {
    /// Path under `dists/<dist>/`
    pub path: String,
    pub content: Vec<u8>,
    /// Whether the archive actually serves it
    pub published: bool,
}

impl DistFile {
    pub fn new(path: &str, content: Vec<u8>) -> Self {
        Self {
            path: path.to_string(),
            content,
            published: true,
        }
    }

    /// Listed in the manifest but missing from the archive
    pub fn unpublished(mut self) -> Self {
        self.published = false;
        self
    }
}

/// Release manifest listing `files` in MD5Sum and SHA256 blocks
pub fn release_text(dist: &str, files: &[DistFile]) -> String {
    let mut text = format!(
        "Origin: Test\nLabel: Test\nSuite: {dist}\nCodename: {dist}\nDate: Sat, 12 Oct 2024 10:00:00 UTC\nArchitectures: amd64 arm64\nComponents: main contrib\nDescription: Test archive\nMD5Sum:\n"
    );
    for file in files {
        text.push_str(&format!(" {} {:>8} {}\n", md5_hex(&file.content), file.content.len(), file.path));
    }
    text.push_str("SHA256:\n");
    for file in files {
        text.push_str(&format!(" {} {:>8} {}\n", sha256_hex(&file.content), file.content.len(), file.path));
    }
    text
}

/// `Packages` index text for `packages`
pub fn packages_index(packages: &[TestPackage]) -> Vec<u8> {
    packages.iter().map(TestPackage::stanza).collect::<String>().into_bytes()
}

pub fn write_file(path: &Path, data: &[u8]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, data).unwrap();
}

pub fn md5_hex(data: &[u8]) -> String {
    hash_bytes(HashAlgorithm::Md5, data)
}

pub fn sha256_hex(data: &[u8]) -> String {
    hash_bytes(HashAlgorithm::Sha256, data)
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub fn bzip2(data: &[u8]) -> Vec<u8> {
    let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub fn xz(data: &[u8]) -> Vec<u8> {
    let mut encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}
