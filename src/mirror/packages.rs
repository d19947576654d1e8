// src/mirror/packages.rs

//! Package index decoding
//!
//! A `Packages` index is a sequence of blank-line separated stanzas of
//! `Field: value` lines, where lines starting with whitespace continue the
//! previous field. Each usable stanza describes one artifact in the pool.
//!
//! Stanzas are split off the stream here so that a large index never has to
//! be held in memory; the fields of each one are parsed by `rfc822_like`.

use crate::error::{Error, Result};
use crate::hash::{Checksum, ChecksumKind};
use std::collections::{HashMap, HashSet};
use std::io::{self, BufRead};
use tracing::{debug, warn};

use super::is_contained;

/// One artifact as described by a package index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRecord {
    pub name: String,
    pub architecture: String,
    /// Path relative to the archive root
    pub filename: String,
    pub size: u64,
    pub checksum: Checksum,
}

/// Counters accumulated while decoding and checking one index
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeStats {
    /// Records retained and checked
    pub examined: usize,
    /// Retained records whose artifact is missing or stale
    pub missing_count: usize,
    /// Declared size of those artifacts
    pub missing_bytes: u64,
    /// Records skipped by the package-name allow-list
    pub ignored: usize,
    /// Records dropped for malformed lines or missing fields
    pub parse_failures: usize,
    /// Records for another architecture than the index's
    pub foreign: usize,
}

/// Retained records of one index plus the decode counters
#[derive(Debug, Default)]
pub struct DecodedIndex {
    pub records: Vec<PackageRecord>,
    pub stats: DecodeStats,
}

/// The raw text of one stanza, possibly spoiled by an unparseable line
#[derive(Debug, Default)]
struct Stanza {
    text: String,
    spoiled: bool,
}

impl Stanza {
    /// Parse the stanza's fields; values are trimmed
    fn fields(&self) -> Result<HashMap<String, String>> {
        let mut fields: HashMap<String, String> =
            rfc822_like::from_str(&self.text).map_err(|e| Error::ParseError(e.to_string()))?;
        for value in fields.values_mut() {
            *value = value.trim().to_string();
        }
        Ok(fields)
    }
}

/// Splits a line-oriented stream into blank-line separated stanzas
struct StanzaReader<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: BufRead> StanzaReader<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
        }
    }

    /// Next non-empty stanza, or `None` at end of stream
    fn next_stanza(&mut self) -> io::Result<Option<Stanza>> {
        let mut stanza = Stanza::default();

        loop {
            self.buf.clear();
            if self.reader.read_until(b'\n', &mut self.buf)? == 0 {
                break;
            }
            let line = String::from_utf8_lossy(&self.buf);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.trim().is_empty() {
                if !stanza.text.is_empty() {
                    break;
                }
                continue;
            }

            let continuation = line.starts_with([' ', '\t']);
            if (continuation && stanza.text.is_empty()) || (!continuation && !line.contains(':')) {
                debug!("Unparseable index line: {}", line);
                stanza.spoiled = true;
            }
            stanza.text.push_str(line);
            stanza.text.push('\n');
        }

        Ok((!stanza.text.is_empty()).then_some(stanza))
    }
}

/// Turns a decoded `Packages` stream into artifact records
#[derive(Debug, Clone)]
pub struct IndexDecoder<'a> {
    kind: ChecksumKind,
    architecture: &'a str,
    accept_any_architecture: bool,
    allow_list: Option<&'a HashSet<String>>,
}

impl<'a> IndexDecoder<'a> {
    /// Decoder for an index of `architecture` whose records carry `kind` digests
    pub fn new(kind: ChecksumKind, architecture: &'a str) -> Self {
        Self {
            kind,
            architecture,
            accept_any_architecture: false,
            allow_list: None,
        }
    }

    /// Keep records whatever their architecture
    pub fn accept_any_architecture(mut self, accept: bool) -> Self {
        self.accept_any_architecture = accept;
        self
    }

    /// Only materialize records whose package name is listed
    pub fn allow_list(mut self, names: Option<&'a HashSet<String>>) -> Self {
        self.allow_list = names;
        self
    }

    /// Decode every stanza of `reader`
    ///
    /// Record-level problems are counted, not returned. An I/O error (such as
    /// a corrupt compressed stream) fails the whole decode.
    pub fn decode<R: BufRead>(&self, reader: R) -> io::Result<DecodedIndex> {
        let mut stanzas = StanzaReader::new(reader);
        let mut decoded = DecodedIndex::default();
        let mut seen_files: HashSet<String> = HashSet::new();

        while let Some(stanza) = stanzas.next_stanza()? {
            let Some(record) = self.accept(&stanza, &mut decoded.stats) else {
                continue;
            };
            if !seen_files.insert(record.filename.clone()) {
                debug!("Duplicate entry for {}", record.filename);
                continue;
            }
            decoded.stats.examined += 1;
            decoded.records.push(record);
        }

        Ok(decoded)
    }

    fn accept(&self, stanza: &Stanza, stats: &mut DecodeStats) -> Option<PackageRecord> {
        if stanza.spoiled {
            stats.parse_failures += 1;
            return None;
        }
        let fields = match stanza.fields() {
            Ok(fields) => fields,
            Err(e) => {
                debug!("Unparseable index record: {}", e);
                stats.parse_failures += 1;
                return None;
            }
        };
        let get = |field: &str| fields.get(field).map(String::as_str);

        let Some(name) = get("Package") else {
            stats.parse_failures += 1;
            return None;
        };

        if let Some(allowed) = self.allow_list
            && !allowed.contains(name)
        {
            stats.ignored += 1;
            return None;
        }

        let required = (
            get("Architecture"),
            get("Filename"),
            get("Size").and_then(|s| s.parse::<u64>().ok()),
            get(self.kind.index_field()),
        );
        let (Some(architecture), Some(filename), Some(size), Some(digest)) = required else {
            debug!("Incomplete index record for {}", name);
            stats.parse_failures += 1;
            return None;
        };

        if !is_contained(filename) {
            warn!("{}: refusing Filename outside the archive root: {}", name, filename);
            stats.parse_failures += 1;
            return None;
        }

        if !self.accept_any_architecture && architecture != self.architecture && architecture != "all" {
            debug!("{} is {}, not {}", name, architecture, self.architecture);
            stats.foreign += 1;
            return None;
        }

        Some(PackageRecord {
            name: name.to_string(),
            architecture: architecture.to_string(),
            filename: filename.to_string(),
            size,
            checksum: Checksum::new(self.kind, digest),
        })
    }
}
