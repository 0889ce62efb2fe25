//! Locker content filtering
//!
//! - Blocked-domain store with all-or-nothing imports
//! - Rule archive parsing into a compiled URL/phrase index
//! - Index persistence and a shared, lock-guarded index handle
//! - Background jobs wiring all of the above into the task pool

mod import;
mod index;
mod jobs;
mod manager;
mod rules;
mod store;

pub use import::{BlocklistImporter, DEFAULT_PROGRESS_INTERVAL, ImportError, ImportSummary};
pub use index::{CompiledIndex, IndexData, IndexError, MAX_SCAN_BYTES, ParseStats, is_filterable_content_type, is_scannable_size};
pub use jobs::{FilterJobs, INDEX_FILE, RULES_ARCHIVE_FILE, SharedStore};
pub use manager::{AdBlockIndexManager, IndexStats};
pub use rules::{ParsedLine, Phrase, Rule, RuleAction, RuleKind, parse_phrase_line, parse_rule_line};
pub use store::{BLOCKED_FLAG, DomainStore, SledDomainStore, StoreError, normalize_domain};
