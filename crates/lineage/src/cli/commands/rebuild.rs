use anyhow::Result;
use clap::Args;

use super::{EngineArgs, fresh_cache};
use crate::config::{LineageConfig, RuntimePaths};
use crate::rebuild::artifacts::{build_artifact_layout, write_generation_artifacts};
use crate::utils::time::format_unix_ms;

#[derive(Debug, Clone, Args)]
pub struct RebuildArgs {
    #[command(flatten)]
    pub engine: EngineArgs,
}

pub fn run(args: &RebuildArgs, runtime_paths: &RuntimePaths) -> Result<()> {
    let config = args.engine.apply(LineageConfig::from_env());
    println!(
        "rebuild: start storage_root={} workers={} strict={} tie_break={} out_dir={}",
        runtime_paths.storage_root.display(),
        config.workers,
        config.strict_validation,
        config.tie_break.as_str(),
        runtime_paths.out_dir.display()
    );

    let (cache, freshness) = fresh_cache(runtime_paths, &config)?;
    let skeletons = cache.list();
    let report = cache.last_resolution_report().unwrap_or_default();
    let artifacts = build_artifact_layout(&runtime_paths.out_dir);
    write_generation_artifacts(&artifacts, &skeletons, &report)?;

    let memory = cache.memory_status();
    let built_at = cache
        .generation()
        .map_or_else(|| "unknown".to_string(), |info| format_unix_ms(info.built_at_unix_ms));
    println!(
        "rebuild: complete generation={} built_at={} processed={} parsed={} errors={} resolved={} unresolved={} rate={:.2} ambiguities={} anomalies={} retained_bytes={}",
        freshness.generation(),
        built_at,
        report.processed_count,
        report.parsed_count,
        report.errors.len(),
        report.resolved_count,
        report.unresolved_count,
        report.reconstruction_rate,
        report.ambiguity_count(),
        report.anomalies.len(),
        memory.retained_bytes
    );
    println!(
        "rebuild: artifacts skeletons={} report={} schema={}",
        artifacts.skeletons_jsonl.display(),
        artifacts.report_json.display(),
        artifacts.schema_json.display()
    );
    println!("rebuild: next `lineage show <task_id>`");

    Ok(())
}
