pub mod rebuild;
pub mod report;
pub mod show;

use std::sync::Arc;

use anyhow::Result;
use clap::Args;

use crate::cache::{Freshness, SkeletonCache};
use crate::config::{LineageConfig, RuntimePaths};
use crate::resolve::TieBreak;
use crate::storage::{FileTaskStorage, TaskStorage};
use crate::utils::time::SystemClock;

/// Engine overrides shared by every command that rebuilds.
#[derive(Debug, Clone, Default, Args)]
pub struct EngineArgs {
    /// Fail a task whose skeleton breaks length or duplicate invariants.
    #[arg(long, default_value_t = false)]
    pub strict: bool,

    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,

    #[arg(long, value_name = "POLICY", value_parser = parse_tie_break)]
    pub tie_break: Option<TieBreak>,

    /// Shortest approximate match accepted, in chars.
    #[arg(long, value_name = "CHARS")]
    pub min_approximate_chars: Option<usize>,
}

impl EngineArgs {
    #[must_use]
    pub fn apply(&self, mut config: LineageConfig) -> LineageConfig {
        if self.strict {
            config.strict_validation = true;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(tie_break) = self.tie_break {
            config.tie_break = tie_break;
        }
        if let Some(min_chars) = self.min_approximate_chars {
            config.min_approximate_chars = min_chars;
        }
        config
    }
}

fn parse_tie_break(raw: &str) -> Result<TieBreak, String> {
    TieBreak::parse(raw)
        .ok_or_else(|| format!("unknown tie-break policy `{raw}` (earliest_created, lexicographic)"))
}

/// Cache over the file storage at `runtime_paths.storage_root`, brought
/// up to date before returning.
pub fn fresh_cache(
    runtime_paths: &RuntimePaths,
    config: &LineageConfig,
) -> Result<(SkeletonCache, Freshness)> {
    let storage: Arc<dyn TaskStorage> =
        Arc::new(FileTaskStorage::new(runtime_paths.storage_root.clone()));
    let cache = SkeletonCache::new(storage, Arc::new(SystemClock), config.cache_options());
    let freshness = cache.ensure_fresh()?;
    Ok((cache, freshness))
}
