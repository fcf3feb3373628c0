use anyhow::{Context, Result};
use clap::Args;

use super::{EngineArgs, fresh_cache};
use crate::config::{LineageConfig, RuntimePaths};
use crate::rebuild::artifacts::{build_artifact_layout, read_report_artifact};

#[derive(Debug, Clone, Args)]
pub struct ReportArgs {
    /// Print the report written by the last `lineage rebuild` instead of
    /// rebuilding.
    #[arg(long, default_value_t = false)]
    pub from_artifact: bool,

    #[command(flatten)]
    pub engine: EngineArgs,
}

pub fn run(args: &ReportArgs, runtime_paths: &RuntimePaths) -> Result<()> {
    let report = if args.from_artifact {
        let artifacts = build_artifact_layout(&runtime_paths.out_dir);
        read_report_artifact(&artifacts.report_json)?
    } else {
        let config = args.engine.apply(LineageConfig::from_env());
        let (cache, _) = fresh_cache(runtime_paths, &config)?;
        cache.last_resolution_report().unwrap_or_default()
    };

    let encoded =
        serde_json::to_string_pretty(&report).context("failed to encode resolution report")?;
    println!("{encoded}");
    Ok(())
}
