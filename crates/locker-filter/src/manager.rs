//! Shared handle to the active rule index.
//!
//! Mutations (create, parse, build, load, replace, clear) take the write
//! lock; counts, matching, save and bypass flips take the read lock.

use crate::index::{CompiledIndex, IndexError, ParseStats};
use locker_tasks::CancelToken;
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::info;

/// Snapshot of the active index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexStats {
    pub rules: usize,
    pub phrases: usize,
    pub bypassed: bool,
}

/// Cloneable handle to the active [`CompiledIndex`].
#[derive(Debug, Clone, Default)]
pub struct AdBlockIndexManager {
    index: Arc<RwLock<Option<CompiledIndex>>>,
}

impl AdBlockIndexManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Option<CompiledIndex>> {
        self.index.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<CompiledIndex>> {
        self.index.write().unwrap_or_else(|e| e.into_inner())
    }

    fn with_index<T>(&self, f: impl FnOnce(&CompiledIndex) -> Result<T, IndexError>) -> Result<T, IndexError> {
        match self.read().as_ref() {
            Some(index) => f(index),
            None => Err(IndexError::NoIndex),
        }
    }

    /// Replace the active index with an empty one.
    pub fn create(&self) {
        *self.write() = Some(CompiledIndex::new());
        info!("Created empty rule index");
    }

    pub fn is_loaded(&self) -> bool {
        self.read().is_some()
    }

    pub fn is_built(&self) -> bool {
        self.read().as_ref().is_some_and(|index| index.is_built())
    }

    /// Parse a rules archive into the active index, creating one if needed.
    ///
    /// A failed or cancelled parse leaves the active index as it was.
    pub fn parse_rules_zip_archive(&self, path: &Path, cancel: Option<&CancelToken>) -> Result<ParseStats, IndexError> {
        let mut guard = self.write();
        match guard.as_mut() {
            Some(index) => index.parse_rules_zip_archive(path, cancel),
            None => {
                let mut index = CompiledIndex::new();
                let stats = index.parse_rules_zip_archive(path, cancel)?;
                *guard = Some(index);
                Ok(stats)
            }
        }
    }

    /// Swap in a prepared index, keeping the current bypass state.
    ///
    /// Fails with [`IndexError::Cancelled`] without touching the active index
    /// if `cancel` fired before the swap.
    pub fn replace(&self, index: CompiledIndex, cancel: Option<&CancelToken>) -> Result<(), IndexError> {
        let mut guard = self.write();
        if cancel.is_some_and(|token| token.is_cancelled()) {
            return Err(IndexError::Cancelled);
        }
        if guard.as_ref().is_some_and(|current| current.is_bypassed()) {
            index.enable_bypass();
        }
        *guard = Some(index);
        info!("Rule index replaced");
        Ok(())
    }

    /// Build the active index. Idempotent.
    pub fn build(&self) -> Result<(), IndexError> {
        match self.write().as_mut() {
            Some(index) => {
                index.build();
                Ok(())
            }
            None => Err(IndexError::NoIndex),
        }
    }

    /// Load a saved index and make it active. It still needs [`build`](Self::build).
    pub fn load_from_file(&self, path: &Path) -> Result<(), IndexError> {
        let loaded = CompiledIndex::load_from_file(path)?;
        *self.write() = Some(loaded);
        Ok(())
    }

    pub fn save_to_file(&self, path: &Path) -> Result<u64, IndexError> {
        self.with_index(|index| index.save_to_file(path))
    }

    /// Drop the active index.
    pub fn clear(&self) {
        if self.write().take().is_some() {
            info!("Rule index cleared");
        }
    }

    pub fn rules_count(&self) -> Result<usize, IndexError> {
        self.with_index(|index| index.rules_count())
    }

    pub fn phrases_count(&self) -> Result<usize, IndexError> {
        self.with_index(|index| index.phrases_count())
    }

    pub fn stats(&self) -> Result<IndexStats, IndexError> {
        self.with_index(|index| {
            Ok(IndexStats {
                rules: index.rules_count()?,
                phrases: index.phrases_count()?,
                bypassed: index.is_bypassed(),
            })
        })
    }

    pub fn test_url_blocked(&self, url: &str) -> Result<bool, IndexError> {
        self.with_index(|index| index.test_url_blocked(url))
    }

    pub fn find_forbidden_phrase(&self, content: &str) -> Result<Option<String>, IndexError> {
        self.with_index(|index| index.find_forbidden_phrase(content))
    }

    pub fn enable_bypass(&self) -> Result<(), IndexError> {
        self.with_index(|index| {
            index.enable_bypass();
            Ok(())
        })
    }

    pub fn disable_bypass(&self) -> Result<(), IndexError> {
        self.with_index(|index| {
            index.disable_bypass();
            Ok(())
        })
    }
}
