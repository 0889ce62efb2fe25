//! Filter work submitted to the background task pool.

use crate::import::{BlocklistImporter, ImportError};
use crate::index::{CompiledIndex, IndexError, ParseStats};
use crate::manager::AdBlockIndexManager;
use crate::store::DomainStore;
use locker_tasks::{PoolError, TaskContext, TaskError, TaskId, TaskPool};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Domain store shared between the import job and readers
pub type SharedStore = Arc<Mutex<dyn DomainStore>>;

/// Rules archive copy inside the files directory
pub const RULES_ARCHIVE_FILE: &str = "rules.zip";
/// Saved index inside the files directory
pub const INDEX_FILE: &str = "rules.bin";

/// Submits imports and index maintenance to a [`TaskPool`].
#[derive(Clone)]
pub struct FilterJobs {
    pool: TaskPool,
    store: SharedStore,
    index: AdBlockIndexManager,
    importer: BlocklistImporter,
    files_dir: PathBuf,
}

impl FilterJobs {
    pub fn new(
        pool: TaskPool,
        store: SharedStore,
        index: AdBlockIndexManager,
        importer: BlocklistImporter,
        files_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            pool,
            store,
            index,
            importer,
            files_dir: files_dir.into(),
        }
    }

    pub fn index(&self) -> &AdBlockIndexManager {
        &self.index
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn rules_archive_path(&self) -> PathBuf {
        self.files_dir.join(RULES_ARCHIVE_FILE)
    }

    pub fn index_path(&self) -> PathBuf {
        self.files_dir.join(INDEX_FILE)
    }

    /// Import a domain list into the store.
    pub fn submit_import(&self, source: PathBuf) -> Result<TaskId, PoolError> {
        let store = self.store.clone();
        let importer = self.importer.clone();

        self.pool.submit("blocklist-import", move |ctx| {
            let mut store = store.lock().unwrap_or_else(|e| e.into_inner());
            let summary = importer
                .import_file(&source, &mut *store, ctx.token(), |n| ctx.report_progress(n))
                .map_err(import_failure)?;
            Ok(format!("imported {} domains", summary.inserted))
        })
    }

    /// Parse `archive` into a fresh index, build it and make it active, then
    /// keep a copy in the files directory.
    ///
    /// The active index and the installed archive only change once the new
    /// index is built. A failed or cancelled install leaves both untouched.
    pub fn submit_install_rules(&self, archive: PathBuf) -> Result<TaskId, PoolError> {
        let index = self.index.clone();
        let target = self.rules_archive_path();

        self.pool.submit("install-rules", move |ctx| {
            let staging = target.with_extension(format!("{}.part", ctx.id().0));
            let result = install_rules(ctx, &index, &archive, &staging, &target);
            if result.is_err() && staging.exists() {
                if let Err(e) = fs::remove_file(&staging) {
                    warn!("Failed to remove {}: {}", staging.display(), e);
                }
            }
            let stats = result?;
            Ok(format!("{} rules, {} phrases", stats.rules, stats.phrases))
        })
    }

    /// Save the active index to the files directory.
    pub fn submit_save(&self) -> Result<TaskId, PoolError> {
        let index = self.index.clone();
        let path = self.index_path();

        self.pool.submit("save-index", move |_ctx| {
            let size = index.save_to_file(&path).map_err(index_failure)?;
            Ok(format!("saved {} bytes", size))
        })
    }

    /// Load the saved index and build it.
    pub fn submit_load(&self) -> Result<TaskId, PoolError> {
        let index = self.index.clone();
        let path = self.index_path();

        self.pool.submit("load-index", move |ctx| {
            let mut loaded = CompiledIndex::load_from_file(&path).map_err(index_failure)?;
            ctx.check_cancelled()?;
            loaded.build();
            index.replace(loaded, Some(ctx.token())).map_err(index_failure)?;
            let stats = index.stats().map_err(index_failure)?;
            Ok(format!("{} rules, {} phrases", stats.rules, stats.phrases))
        })
    }
}

fn install_rules(
    ctx: &TaskContext,
    index: &AdBlockIndexManager,
    archive: &Path,
    staging: &Path,
    target: &Path,
) -> Result<ParseStats, TaskError> {
    copy_archive(archive, staging).map_err(|e| TaskError::Failed(e.to_string()))?;
    ctx.check_cancelled()?;

    let mut fresh = CompiledIndex::new();
    let stats = fresh
        .parse_rules_zip_archive(staging, Some(ctx.token()))
        .map_err(index_failure)?;
    ctx.check_cancelled()?;
    fresh.build();

    index.replace(fresh, Some(ctx.token())).map_err(index_failure)?;
    fs::rename(staging, target).map_err(|e| TaskError::Failed(e.to_string()))?;
    info!("Installed rules archive {}", target.display());
    Ok(stats)
}

fn copy_archive(source: &Path, target: &Path) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let bytes = fs::copy(source, target)?;
    debug!("Copied rules archive {} to {} ({} bytes)", source.display(), target.display(), bytes);
    Ok(())
}

fn import_failure(e: ImportError) -> TaskError {
    match e {
        ImportError::Cancelled => TaskError::Cancelled,
        other => TaskError::Failed(other.to_string()),
    }
}

fn index_failure(e: IndexError) -> TaskError {
    match e {
        IndexError::Cancelled => TaskError::Cancelled,
        other => TaskError::Failed(other.to_string()),
    }
}
