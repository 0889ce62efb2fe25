//! Blocklist ingestion.
//!
//! Streams a newline-delimited domain list into a [`DomainStore`] inside a
//! single transaction. The import is all-or-nothing: any read error, store
//! error or cancellation rolls the transaction back.

use crate::store::{BLOCKED_FLAG, DomainStore, StoreError, normalize_domain};
use locker_tasks::{CancelToken, Cancelled};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

/// Default minimum time between two progress callbacks
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(1000);

/// Ingestion errors
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("I/O error at line {line}: {source}")]
    Io {
        line: u64,
        #[source]
        source: io::Error,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Import cancelled")]
    Cancelled,
}

impl From<Cancelled> for ImportError {
    fn from(_: Cancelled) -> Self {
        ImportError::Cancelled
    }
}

/// Result of a committed import
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSummary {
    /// Domains written
    pub inserted: u64,
    /// Blank lines skipped
    pub skipped: u64,
    pub elapsed: Duration,
}

/// Streams domain lists into a store.
#[derive(Debug, Clone)]
pub struct BlocklistImporter {
    progress_interval: Duration,
}

impl Default for BlocklistImporter {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRESS_INTERVAL)
    }
}

impl BlocklistImporter {
    pub fn new(progress_interval: Duration) -> Self {
        Self { progress_interval }
    }

    /// Import from a file on disk.
    pub fn import_file<S: DomainStore + ?Sized>(
        &self,
        path: &Path,
        store: &mut S,
        cancel: &CancelToken,
        on_progress: impl FnMut(u64),
    ) -> Result<ImportSummary, ImportError> {
        let file = File::open(path).map_err(|source| ImportError::Io { line: 0, source })?;
        info!("Importing blocklist {}", path.display());
        self.import(BufReader::new(file), store, cancel, on_progress)
    }

    /// Import every non-blank line of `reader` as a blocked domain.
    ///
    /// `on_progress` receives the running insert count at most once per
    /// progress interval, and once more with the total before commit.
    pub fn import<R: BufRead, S: DomainStore + ?Sized>(
        &self,
        reader: R,
        store: &mut S,
        cancel: &CancelToken,
        mut on_progress: impl FnMut(u64),
    ) -> Result<ImportSummary, ImportError> {
        let start = Instant::now();
        store.begin_transaction()?;

        match self.stage_lines(reader, store, cancel, &mut on_progress) {
            Ok((inserted, skipped)) => {
                on_progress(inserted);
                store.commit_transaction()?;

                let summary = ImportSummary {
                    inserted,
                    skipped,
                    elapsed: start.elapsed(),
                };
                info!(
                    "Imported {} domains into {} in {:?} ({} blank lines)",
                    summary.inserted,
                    store.path().display(),
                    summary.elapsed,
                    summary.skipped
                );
                Ok(summary)
            }
            Err(e) => {
                match &e {
                    ImportError::Cancelled => warn!("Blocklist import cancelled, rolling back"),
                    other => error!("Blocklist import failed, rolling back: {}", other),
                }
                if let Err(rollback_err) = store.rollback_transaction() {
                    warn!("Rollback failed: {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    fn stage_lines<R: BufRead, S: DomainStore + ?Sized>(
        &self,
        reader: R,
        store: &mut S,
        cancel: &CancelToken,
        on_progress: &mut impl FnMut(u64),
    ) -> Result<(u64, u64), ImportError> {
        let mut inserted = 0u64;
        let mut skipped = 0u64;
        let mut last_progress = Instant::now();

        for (index, line) in reader.lines().enumerate() {
            cancel.check()?;
            let line = line.map_err(|source| ImportError::Io {
                line: index as u64 + 1,
                source,
            })?;

            let domain = normalize_domain(&line);
            if domain.is_empty() {
                skipped += 1;
                continue;
            }

            store.add_blocked_domain(&domain, BLOCKED_FLAG)?;
            inserted += 1;

            if last_progress.elapsed() >= self.progress_interval {
                on_progress(inserted);
                last_progress = Instant::now();
            }
        }

        Ok((inserted, skipped))
    }
}
