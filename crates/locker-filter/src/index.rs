//! Compiled rule index
//!
//! Holds the raw rules and phrases collected from rule archives (or loaded
//! from a saved index file) and, after [`CompiledIndex::build`], the lookup
//! structures used for matching.
//!
//! Index file layout (`rules.bin`):
//!
//! ```text
//! magic "LOCKRIDX" | version u32 LE | crc32 u32 LE | zstd(JSON payload)
//! ```

use crate::rules::{ParsedLine, Phrase, Rule, RuleAction, RuleKind, parse_phrase_line, parse_rule_line};
use locker_tasks::CancelToken;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};
use zstd::stream::{Decoder, Encoder};

/// Magic bytes identifying index files
const MAGIC_BYTES: &[u8; 8] = b"LOCKRIDX";

/// Version of the index file format
const FORMAT_VERSION: u32 = 1;

const COMPRESSION_LEVEL: i32 = 3;

/// Content of this many bytes or more is not scanned for phrases
pub const MAX_SCAN_BYTES: usize = 100 * 1024;

/// Index errors
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid index file: {0}")]
    InvalidFile(String),

    #[error("Version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u32, got: u32 },

    #[error("Index not built")]
    NotBuilt,

    #[error("No index loaded")]
    NoIndex,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Archive parsing cancelled")]
    Cancelled,
}

/// Raw index contents, the persisted part of the index
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexData {
    pub rules: Vec<Rule>,
    pub phrases: Vec<Phrase>,
    /// HTML served in place of blocked pages
    pub block_page: Option<String>,
}

/// Line counts from parsing one archive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseStats {
    pub rule_entries: usize,
    pub trigger_entries: usize,
    pub skipped_entries: usize,
    pub rules: usize,
    pub phrases: usize,
    pub ignored_lines: usize,
    pub invalid_lines: usize,
}

#[derive(Debug, Default)]
struct Compiled {
    blocked_domains: HashSet<String>,
    allowed_domains: HashSet<String>,
    block_rules: Vec<Rule>,
    allow_rules: Vec<Rule>,
    phrases: Vec<String>,
}

impl Compiled {
    fn from_data(data: &IndexData) -> Self {
        let mut compiled = Compiled::default();
        let mut seen = HashSet::new();

        for rule in &data.rules {
            if !seen.insert((rule.kind, rule.action, rule.pattern.as_str())) {
                continue;
            }
            match (rule.kind, rule.action) {
                (RuleKind::Domain, RuleAction::Block) => {
                    compiled.blocked_domains.insert(rule.pattern.clone());
                }
                (RuleKind::Domain, RuleAction::Allow) => {
                    compiled.allowed_domains.insert(rule.pattern.clone());
                }
                (_, RuleAction::Block) => compiled.block_rules.push(rule.clone()),
                (_, RuleAction::Allow) => compiled.allow_rules.push(rule.clone()),
            }
        }

        let mut seen_phrases = HashSet::new();
        compiled.phrases = data
            .phrases
            .iter()
            .filter(|p| seen_phrases.insert(p.text.as_str()))
            .map(|p| p.text.clone())
            .collect();

        compiled
    }

    fn rules_count(&self) -> usize {
        self.blocked_domains.len() + self.allowed_domains.len() + self.block_rules.len() + self.allow_rules.len()
    }

    fn domain_in(set: &HashSet<String>, host: &str) -> bool {
        let mut candidate = host;
        loop {
            if set.contains(candidate) {
                return true;
            }
            match candidate.split_once('.') {
                Some((_, parent)) if !parent.is_empty() => candidate = parent,
                _ => return false,
            }
        }
    }

    fn is_blocked(&self, url: &str, host: &str) -> bool {
        if Self::domain_in(&self.allowed_domains, host) || self.allow_rules.iter().any(|r| r.matches(url, host)) {
            debug!("URL allowed by exception: {}", url);
            return false;
        }
        if Self::domain_in(&self.blocked_domains, host) {
            return true;
        }
        self.block_rules.iter().any(|r| r.matches(url, host))
    }
}

/// Rule index with a runtime bypass switch.
#[derive(Debug, Default)]
pub struct CompiledIndex {
    data: IndexData,
    compiled: Option<Compiled>,
    bypass: AtomicBool,
}

impl CompiledIndex {
    /// Empty, unbuilt index
    pub fn new() -> Self {
        Self::default()
    }

    /// Unbuilt index over existing data
    pub fn from_data(data: IndexData) -> Self {
        Self {
            data,
            compiled: None,
            bypass: AtomicBool::new(false),
        }
    }

    pub fn data(&self) -> &IndexData {
        &self.data
    }

    pub fn is_built(&self) -> bool {
        self.compiled.is_some()
    }

    /// Accumulate the rules, phrases and block page of a zip archive.
    ///
    /// Invalidates any previous build. On error the index is left unchanged.
    pub fn parse_rules_zip_archive(&mut self, path: &Path, cancel: Option<&CancelToken>) -> Result<ParseStats, IndexError> {
        let file = File::open(path)?;
        info!("Parsing rules archive {}", path.display());
        self.parse_archive(BufReader::new(file), cancel)
    }

    /// [`parse_rules_zip_archive`](Self::parse_rules_zip_archive) over any seekable reader.
    pub fn parse_archive<R: Read + Seek>(&mut self, reader: R, cancel: Option<&CancelToken>) -> Result<ParseStats, IndexError> {
        let start = Instant::now();
        let mut archive = zip::ZipArchive::new(reader)?;
        let mut stats = ParseStats::default();
        let mut staged = IndexData::default();

        for i in 0..archive.len() {
            if cancel.is_some_and(|token| token.is_cancelled()) {
                return Err(IndexError::Cancelled);
            }

            let mut entry = archive.by_index(i)?;
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().to_string();

            if name.ends_with("block.htm") {
                let mut html = String::new();
                entry.read_to_string(&mut html)?;
                staged.block_page = Some(html);
                continue;
            }

            let is_rules = name.contains(".rules");
            let is_triggers = name.contains(".triggers");
            if !is_rules && !is_triggers {
                warn!("Skipping unrecognised archive entry {}", name);
                stats.skipped_entries += 1;
                continue;
            }

            let mut text = String::new();
            entry.read_to_string(&mut text)?;

            if is_rules {
                stats.rule_entries += 1;
                for line in text.lines() {
                    match parse_rule_line(line, &name) {
                        ParsedLine::Rule(rule) => {
                            staged.rules.push(rule);
                            stats.rules += 1;
                        }
                        ParsedLine::Ignored => stats.ignored_lines += 1,
                        ParsedLine::Invalid => stats.invalid_lines += 1,
                    }
                }
            } else {
                stats.trigger_entries += 1;
                for line in text.lines() {
                    match parse_phrase_line(line, &name) {
                        Some(phrase) => {
                            staged.phrases.push(phrase);
                            stats.phrases += 1;
                        }
                        None => stats.ignored_lines += 1,
                    }
                }
            }
            debug!("Parsed archive entry {}", name);
        }

        self.data.rules.append(&mut staged.rules);
        self.data.phrases.append(&mut staged.phrases);
        if staged.block_page.is_some() {
            self.data.block_page = staged.block_page;
        }
        self.compiled = None;

        info!(
            "Parsed archive in {:?}: {} rules, {} phrases ({} invalid lines, {} skipped entries)",
            start.elapsed(),
            stats.rules,
            stats.phrases,
            stats.invalid_lines,
            stats.skipped_entries
        );
        Ok(stats)
    }

    /// Compile the lookup structures. Idempotent.
    pub fn build(&mut self) {
        if self.compiled.is_some() {
            debug!("Index already built");
            return;
        }
        let start = Instant::now();
        let compiled = Compiled::from_data(&self.data);
        info!(
            "Built index in {:?}: {} rules, {} phrases",
            start.elapsed(),
            compiled.rules_count(),
            compiled.phrases.len()
        );
        self.compiled = Some(compiled);
    }

    fn compiled(&self) -> Result<&Compiled, IndexError> {
        self.compiled.as_ref().ok_or(IndexError::NotBuilt)
    }

    /// Distinct compiled rules
    pub fn rules_count(&self) -> Result<usize, IndexError> {
        Ok(self.compiled()?.rules_count())
    }

    /// Distinct compiled phrases
    pub fn phrases_count(&self) -> Result<usize, IndexError> {
        Ok(self.compiled()?.phrases.len())
    }

    pub fn block_page(&self) -> Option<&str> {
        self.data.block_page.as_deref()
    }

    pub fn enable_bypass(&self) {
        self.bypass.store(true, Ordering::SeqCst);
        info!("Filter bypass enabled");
    }

    pub fn disable_bypass(&self) {
        self.bypass.store(false, Ordering::SeqCst);
        info!("Filter bypass disabled");
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypass.load(Ordering::SeqCst)
    }

    /// Whether `url` should be blocked. Always false while bypassed.
    pub fn test_url_blocked(&self, url: &str) -> Result<bool, IndexError> {
        let compiled = self.compiled()?;
        if self.is_bypassed() {
            return Ok(false);
        }

        let parsed = url::Url::parse(url).map_err(|_| IndexError::InvalidUrl(url.to_string()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| IndexError::InvalidUrl(url.to_string()))?
            .trim_end_matches('.')
            .to_lowercase();

        Ok(compiled.is_blocked(&url.to_lowercase(), &host))
    }

    /// First forbidden phrase found in `content`, case-insensitively.
    ///
    /// Content of [`MAX_SCAN_BYTES`] or more is passed through unscanned.
    /// Always `None` while bypassed.
    pub fn find_forbidden_phrase(&self, content: &str) -> Result<Option<String>, IndexError> {
        let compiled = self.compiled()?;
        if self.is_bypassed() || !is_scannable_size(content.len()) {
            return Ok(None);
        }

        let haystack = content.to_lowercase();

        Ok(compiled.phrases.iter().find(|p| haystack.contains(p.as_str())).cloned())
    }

    /// Write the index to `path` atomically. Returns the file size.
    pub fn save_to_file(&self, path: &Path) -> Result<u64, IndexError> {
        self.compiled()?;
        let start = Instant::now();

        let payload = serde_json::to_vec(&self.data)?;
        let checksum = crc32fast::hash(&payload);

        let temp_path = path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&temp_path)?);
            writer.write_all(MAGIC_BYTES)?;
            writer.write_all(&FORMAT_VERSION.to_le_bytes())?;
            writer.write_all(&checksum.to_le_bytes())?;

            let mut encoder = Encoder::new(&mut writer, COMPRESSION_LEVEL)?;
            encoder.write_all(&payload)?;
            encoder.finish()?;
            writer.flush()?;
        }
        fs::rename(&temp_path, path)?;

        let size = fs::metadata(path)?.len();
        info!(
            "Saved index to {} in {:?}: {} -> {} bytes",
            path.display(),
            start.elapsed(),
            payload.len(),
            size
        );
        Ok(size)
    }

    /// Read an index written by [`save_to_file`](Self::save_to_file).
    ///
    /// The result is unbuilt.
    pub fn load_from_file(path: &Path) -> Result<Self, IndexError> {
        let start = Instant::now();
        let mut reader = BufReader::new(File::open(path)?);

        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC_BYTES {
            return Err(IndexError::InvalidFile("Invalid magic bytes".to_string()));
        }

        let mut buf4 = [0u8; 4];
        reader.read_exact(&mut buf4)?;
        let version = u32::from_le_bytes(buf4);
        if version != FORMAT_VERSION {
            return Err(IndexError::VersionMismatch {
                expected: FORMAT_VERSION,
                got: version,
            });
        }

        reader.read_exact(&mut buf4)?;
        let expected_checksum = u32::from_le_bytes(buf4);

        let mut payload = Vec::new();
        Decoder::new(reader)?.read_to_end(&mut payload)?;

        let checksum = crc32fast::hash(&payload);
        if checksum != expected_checksum {
            return Err(IndexError::InvalidFile(format!(
                "Checksum mismatch: expected {}, got {}",
                expected_checksum, checksum
            )));
        }

        let data: IndexData = serde_json::from_slice(&payload)?;
        info!(
            "Loaded index from {} in {:?}: {} rules, {} phrases",
            path.display(),
            start.elapsed(),
            data.rules.len(),
            data.phrases.len()
        );
        Ok(Self::from_data(data))
    }
}

/// Whether a response with this content type is scanned for phrases.
pub fn is_filterable_content_type(content_type: &str) -> bool {
    let lower = content_type.to_ascii_lowercase();
    lower.contains("html") || lower.contains("json")
}

/// Whether a body of `len` bytes is small enough to scan for phrases.
pub fn is_scannable_size(len: usize) -> bool {
    len < MAX_SCAN_BYTES
}
