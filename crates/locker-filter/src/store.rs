//! Blocked-domain store.
//!
//! One sled database per store directory. Writes only happen inside an
//! explicit transaction: inserts are staged in a pending batch and applied
//! atomically on commit, so readers never observe a partial import.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Flag stored for a blocked domain
pub const BLOCKED_FLAG: u8 = 1;

const DB_DIR: &str = "filter.db";
const DOMAINS_TREE: &str = "BlockedDomains";

/// Canonical key for `domain`: trimmed, lowercased, no trailing dot.
pub fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("A transaction is already open")]
    TransactionInProgress,

    #[error("No open transaction")]
    NoTransaction,
}

/// Transactional domain store.
pub trait DomainStore: Send {
    /// Directory backing the store
    fn path(&self) -> &Path;

    fn begin_transaction(&mut self) -> Result<(), StoreError>;

    /// Stage `domain` under its [`normalize_domain`] key. Re-adding a domain
    /// overwrites its flag.
    fn add_blocked_domain(&mut self, domain: &str, flag: u8) -> Result<(), StoreError>;

    /// Apply every staged insert atomically. Returns how many were staged.
    fn commit_transaction(&mut self) -> Result<usize, StoreError>;

    /// Discard staged inserts.
    fn rollback_transaction(&mut self) -> Result<(), StoreError>;

    fn in_transaction(&self) -> bool;

    /// Committed flag for exactly `domain`
    fn domain_flag(&self, domain: &str) -> Result<Option<u8>, StoreError>;

    /// Committed entry count
    fn len(&self) -> Result<usize, StoreError>;

    fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// True if `domain` or any parent domain is stored with a non-zero flag.
    fn is_domain_blocked(&self, domain: &str) -> Result<bool, StoreError> {
        let domain = normalize_domain(domain);
        let mut candidate = domain.as_str();
        loop {
            if matches!(self.domain_flag(candidate)?, Some(flag) if flag != 0) {
                return Ok(true);
            }
            match candidate.split_once('.') {
                Some((_, parent)) if !parent.is_empty() => candidate = parent,
                _ => return Ok(false),
            }
        }
    }
}

struct PendingBatch {
    batch: sled::Batch,
    staged: usize,
}

/// [`DomainStore`] backed by a sled tree.
pub struct SledDomainStore {
    path: PathBuf,
    _db: sled::Db,
    domains: sled::Tree,
    pending: Option<PendingBatch>,
}

impl SledDomainStore {
    /// Open (or create) the store under `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = dir.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let db = sled::open(path.join(DB_DIR))?;
        let domains = db.open_tree(DOMAINS_TREE)?;
        info!("Opened domain store at {} ({} entries)", path.display(), domains.len());

        Ok(Self {
            path,
            _db: db,
            domains,
            pending: None,
        })
    }
}

impl DomainStore for SledDomainStore {
    fn path(&self) -> &Path {
        &self.path
    }

    fn begin_transaction(&mut self) -> Result<(), StoreError> {
        if self.pending.is_some() {
            return Err(StoreError::TransactionInProgress);
        }
        self.pending = Some(PendingBatch {
            batch: sled::Batch::default(),
            staged: 0,
        });
        debug!("Domain store transaction started");
        Ok(())
    }

    fn add_blocked_domain(&mut self, domain: &str, flag: u8) -> Result<(), StoreError> {
        let pending = self.pending.as_mut().ok_or(StoreError::NoTransaction)?;
        pending.batch.insert(normalize_domain(domain).as_bytes(), vec![flag]);
        pending.staged += 1;
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<usize, StoreError> {
        let pending = self.pending.take().ok_or(StoreError::NoTransaction)?;
        self.domains.apply_batch(pending.batch)?;
        self.domains.flush()?;
        info!("Domain store committed {} inserts", pending.staged);
        Ok(pending.staged)
    }

    fn rollback_transaction(&mut self) -> Result<(), StoreError> {
        let pending = self.pending.take().ok_or(StoreError::NoTransaction)?;
        debug!("Domain store discarded {} staged inserts", pending.staged);
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.pending.is_some()
    }

    fn domain_flag(&self, domain: &str) -> Result<Option<u8>, StoreError> {
        Ok(self
            .domains
            .get(normalize_domain(domain).as_bytes())?
            .and_then(|value| value.first().copied()))
    }

    fn len(&self) -> Result<usize, StoreError> {
        Ok(self.domains.len())
    }
}
