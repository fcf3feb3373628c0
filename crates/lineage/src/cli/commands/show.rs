use anyhow::{Context, Result, bail};
use clap::Args;
use serde::Serialize;

use super::{EngineArgs, fresh_cache};
use crate::config::{LineageConfig, RuntimePaths};
use crate::models::ConversationSkeleton;

#[derive(Debug, Clone, Args)]
pub struct ShowArgs {
    #[arg(value_name = "TASK_ID")]
    pub task_id: String,

    #[command(flatten)]
    pub engine: EngineArgs,
}

#[derive(Debug, Serialize)]
struct TaskView<'a> {
    skeleton: &'a ConversationSkeleton,
    depth: Option<u32>,
    /// Nearest first.
    ancestors: Vec<String>,
    children: Vec<String>,
}

pub fn run(args: &ShowArgs, runtime_paths: &RuntimePaths) -> Result<()> {
    let config = args.engine.apply(LineageConfig::from_env());
    let (cache, _) = fresh_cache(runtime_paths, &config)?;
    let Some(skeleton) = cache.get(&args.task_id) else {
        bail!(
            "task `{}` is not in the current generation under {}",
            args.task_id,
            runtime_paths.storage_root.display()
        );
    };

    let view = TaskView {
        skeleton: &skeleton,
        depth: cache
            .last_resolution_report()
            .and_then(|report| report.depth_by_task.get(&args.task_id).copied()),
        ancestors: task_ids(cache.ancestors(&args.task_id)),
        children: task_ids(cache.children(&args.task_id)),
    };
    let encoded = serde_json::to_string_pretty(&view).context("failed to encode task view")?;
    println!("{encoded}");
    Ok(())
}

fn task_ids(skeletons: Vec<ConversationSkeleton>) -> Vec<String> {
    skeletons
        .into_iter()
        .map(|skeleton| skeleton.task_id)
        .collect()
}
