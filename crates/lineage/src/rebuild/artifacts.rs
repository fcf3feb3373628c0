use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::models::{ConversationSkeleton, ResolutionReport, skeleton_json_schema};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    pub skeletons_jsonl: PathBuf,
    pub report_json: PathBuf,
    pub schema_json: PathBuf,
}

#[must_use]
pub fn build_artifact_layout(out_dir: &Path) -> ArtifactLayout {
    ArtifactLayout {
        skeletons_jsonl: out_dir.join("skeletons.jsonl"),
        report_json: out_dir.join("resolution_report.json"),
        schema_json: out_dir.join("skeleton.schema.json"),
    }
}

pub fn write_generation_artifacts(
    layout: &ArtifactLayout,
    skeletons: &[ConversationSkeleton],
    report: &ResolutionReport,
) -> Result<()> {
    write_skeletons_artifact(&layout.skeletons_jsonl, skeletons)?;
    write_report_artifact(&layout.report_json, report)?;
    write_schema_artifact(&layout.schema_json)
}

pub fn write_skeletons_artifact(path: &Path, skeletons: &[ConversationSkeleton]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("failed to create skeleton output directory")?;
    }
    let file = std::fs::File::create(path).context("failed to create skeletons artifact")?;
    let mut writer = BufWriter::new(file);
    for skeleton in skeletons {
        serde_json::to_writer(&mut writer, skeleton)
            .with_context(|| format!("failed to encode skeleton `{}`", skeleton.task_id))?;
        writer
            .write_all(b"\n")
            .context("failed to write skeletons newline")?;
    }
    writer
        .flush()
        .context("failed to flush skeletons artifact writer")
}

pub fn write_report_artifact(path: &Path, report: &ResolutionReport) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("failed to create report directory")?;
    }
    let encoded =
        serde_json::to_vec_pretty(report).context("failed to encode resolution report")?;
    std::fs::write(path, encoded).context("failed to write resolution report artifact")
}

pub fn write_schema_artifact(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("failed to create schema directory")?;
    }
    let encoded = serde_json::to_vec_pretty(&skeleton_json_schema())
        .context("failed to encode skeleton schema")?;
    std::fs::write(path, encoded).context("failed to write skeleton schema artifact")
}

pub fn read_report_artifact(path: &Path) -> Result<ResolutionReport> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read resolution report {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to decode resolution report {}", path.display()))
}
