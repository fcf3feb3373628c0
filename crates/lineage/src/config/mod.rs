use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail};
use tracing::warn;

use crate::cache::{CacheOptions, DEFAULT_MEMORY_CEILING_BYTES, DEFAULT_MEMORY_WARN_RATIO};
use crate::rebuild::{MAX_WORKERS, RebuildPlan, default_workers};
use crate::resolve::{EngineOptions, TieBreak};
use crate::skeleton::TransformOptions;
use crate::utils::text::DEFAULT_MAX_CHARS;

pub const ENV_MAX_PREFIX_CHARS: &str = "LINEAGE_MAX_PREFIX_CHARS";
pub const ENV_WORKERS: &str = "LINEAGE_WORKERS";
pub const ENV_READ_TIMEOUT_MS: &str = "LINEAGE_READ_TIMEOUT_MS";
pub const ENV_STRICT: &str = "LINEAGE_STRICT";
pub const ENV_MIN_APPROXIMATE_CHARS: &str = "LINEAGE_MIN_APPROXIMATE_CHARS";
pub const ENV_MEMORY_CEILING_BYTES: &str = "LINEAGE_MEMORY_CEILING_BYTES";
pub const ENV_TIE_BREAK: &str = "LINEAGE_TIE_BREAK";

pub const DEFAULT_READ_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    pub home_dir: PathBuf,
    pub cwd: PathBuf,
    pub storage_root: PathBuf,
    pub out_dir: PathBuf,
}

pub fn resolve_runtime_paths(
    home_dir: &Path,
    cwd: &Path,
    storage_root_override: Option<&Path>,
    out_dir_override: Option<&Path>,
) -> Result<RuntimePaths> {
    if !home_dir.is_absolute() {
        bail!("home_dir must be absolute: {}", home_dir.display());
    }
    if !cwd.is_absolute() {
        bail!("cwd must be absolute: {}", cwd.display());
    }

    let home_dir = normalize_lexical(home_dir);
    let cwd = normalize_lexical(cwd);
    let storage_root = match storage_root_override {
        Some(path) => resolve_user_path(path, &home_dir, &cwd)?,
        None => home_dir.join(".lineage").join("tasks"),
    };
    let out_dir = match out_dir_override {
        Some(path) => resolve_user_path(path, &home_dir, &cwd)?,
        None => home_dir.join(".lineage").join("output"),
    };

    Ok(RuntimePaths {
        home_dir,
        cwd,
        storage_root: normalize_lexical(&storage_root),
        out_dir: normalize_lexical(&out_dir),
    })
}

/// Tunables for one cache instance.
#[derive(Debug, Clone, PartialEq)]
pub struct LineageConfig {
    pub max_prefix_chars: usize,
    pub workers: usize,
    /// Zero disables the per-task read deadline.
    pub read_timeout_ms: u64,
    pub strict_validation: bool,
    pub min_approximate_chars: usize,
    pub memory_ceiling_bytes: usize,
    pub memory_warn_ratio: f64,
    pub tie_break: TieBreak,
}

impl Default for LineageConfig {
    fn default() -> Self {
        Self {
            max_prefix_chars: DEFAULT_MAX_CHARS,
            workers: default_workers(),
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            strict_validation: false,
            min_approximate_chars: 0,
            memory_ceiling_bytes: DEFAULT_MEMORY_CEILING_BYTES,
            memory_warn_ratio: DEFAULT_MEMORY_WARN_RATIO,
            tie_break: TieBreak::default(),
        }
    }
}

impl LineageConfig {
    /// Defaults overlaid with `LINEAGE_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::from_env`] over an arbitrary variable source.
    /// Unparsable values keep the default and log a warning.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(value) = parsed(&lookup, ENV_MAX_PREFIX_CHARS, |raw| {
            raw.parse::<usize>().ok().filter(|value| *value > 0)
        }) {
            config.max_prefix_chars = value;
        }
        if let Some(value) = parsed(&lookup, ENV_WORKERS, |raw| raw.parse::<usize>().ok()) {
            config.workers = value.clamp(1, MAX_WORKERS);
        }
        if let Some(value) = parsed(&lookup, ENV_READ_TIMEOUT_MS, |raw| raw.parse::<u64>().ok()) {
            config.read_timeout_ms = value;
        }
        if let Some(value) = parsed(&lookup, ENV_STRICT, parse_flag) {
            config.strict_validation = value;
        }
        if let Some(value) = parsed(&lookup, ENV_MIN_APPROXIMATE_CHARS, |raw| {
            raw.parse::<usize>().ok()
        }) {
            config.min_approximate_chars = value;
        }
        if let Some(value) = parsed(&lookup, ENV_MEMORY_CEILING_BYTES, |raw| {
            raw.parse::<usize>().ok().filter(|value| *value > 0)
        }) {
            config.memory_ceiling_bytes = value;
        }
        if let Some(value) = parsed(&lookup, ENV_TIE_BREAK, TieBreak::parse) {
            config.tie_break = value;
        }
        config
    }

    #[must_use]
    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(self.read_timeout_ms))
    }

    #[must_use]
    pub fn rebuild_plan(&self) -> RebuildPlan {
        RebuildPlan {
            workers: self.workers.clamp(1, MAX_WORKERS),
            read_timeout: self.read_timeout(),
            transform: TransformOptions {
                max_len: self.max_prefix_chars,
                strict: self.strict_validation,
            },
            engine: EngineOptions {
                min_approximate_chars: self.min_approximate_chars,
                workers: self.workers.clamp(1, MAX_WORKERS),
            },
            tie_break: self.tie_break,
        }
    }

    #[must_use]
    pub fn cache_options(&self) -> CacheOptions {
        CacheOptions {
            plan: self.rebuild_plan(),
            memory_ceiling_bytes: self.memory_ceiling_bytes,
            memory_warn_ratio: self.memory_warn_ratio,
        }
    }
}

fn parsed<T, L, P>(lookup: &L, key: &str, parse: P) -> Option<T>
where
    L: Fn(&str) -> Option<String>,
    P: Fn(&str) -> Option<T>,
{
    let raw = lookup(key)?;
    let value = parse(raw.trim());
    if value.is_none() {
        warn!(key, value = %raw, "ignoring unparsable configuration value");
    }
    value
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn resolve_user_path(path: &Path, home_dir: &Path, cwd: &Path) -> Result<PathBuf> {
    let expanded = expand_tilde(path, home_dir)?;
    let resolved = if expanded.is_absolute() {
        expanded
    } else {
        cwd.join(expanded)
    };

    Ok(normalize_lexical(&resolved))
}

fn expand_tilde(path: &Path, home_dir: &Path) -> Result<PathBuf> {
    let mut components = path.components();
    match components.next() {
        Some(Component::Normal(first)) if first == "~" => {
            let mut expanded = home_dir.to_path_buf();
            for component in components {
                expanded.push(component.as_os_str());
            }
            Ok(expanded)
        }
        Some(Component::Normal(first))
            if first
                .to_str()
                .is_some_and(|segment| segment.starts_with('~')) =>
        {
            bail!(
                "unsupported home expansion syntax (only `~` and `~/...` are supported): {}",
                path.display()
            )
        }
        _ => Ok(path.to_path_buf()),
    }
}

fn normalize_lexical(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push(component.as_os_str());
                }
            }
            _ => normalized.push(component.as_os_str()),
        }
    }

    normalized
}

#[cfg(test)]
mod tests {
    use super::{LineageConfig, resolve_runtime_paths};
    use crate::resolve::TieBreak;
    use std::collections::HashMap;
    use std::path::Path;
    use std::time::Duration;

    #[test]
    fn defaults_paths_under_lineage_dir() {
        let paths = resolve_runtime_paths(
            Path::new("/home/tester"),
            Path::new("/work/repo"),
            None,
            None,
        )
        .expect("paths should resolve");

        assert_eq!(paths.home_dir, Path::new("/home/tester"));
        assert_eq!(paths.cwd, Path::new("/work/repo"));
        assert_eq!(paths.storage_root, Path::new("/home/tester/.lineage/tasks"));
        assert_eq!(paths.out_dir, Path::new("/home/tester/.lineage/output"));
    }

    #[test]
    fn expands_tilde_override_against_home_dir() {
        let paths = resolve_runtime_paths(
            Path::new("/home/tester"),
            Path::new("/work/repo"),
            None,
            Some(Path::new("~/custom/output")),
        )
        .expect("tilde override should resolve");

        assert_eq!(paths.out_dir, Path::new("/home/tester/custom/output"));
    }

    #[test]
    fn resolves_relative_override_against_cwd() {
        let paths = resolve_runtime_paths(
            Path::new("/home/tester"),
            Path::new("/work/repo"),
            Some(Path::new("./logs/../logs/tasks")),
            Some(Path::new("./artifacts/../artifacts/runs")),
        )
        .expect("relative override should resolve");

        assert_eq!(paths.storage_root, Path::new("/work/repo/logs/tasks"));
        assert_eq!(paths.out_dir, Path::new("/work/repo/artifacts/runs"));
    }

    #[test]
    fn rejects_non_absolute_home_dir() {
        let err = resolve_runtime_paths(Path::new("home/tester"), Path::new("/work/repo"), None, None)
            .expect_err("relative home dir must fail");

        assert!(
            err.to_string().contains("home_dir must be absolute"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn rejects_tilde_username_syntax() {
        let err = resolve_runtime_paths(
            Path::new("/home/tester"),
            Path::new("/work/repo"),
            Some(Path::new("~someone/tasks")),
            None,
        )
        .expect_err("~username syntax must fail");

        assert!(
            err.to_string()
                .contains("unsupported home expansion syntax"),
            "unexpected error: {err}"
        );
    }

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let values: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        move |key| values.get(key).cloned()
    }

    #[test]
    fn config_defaults_without_environment() {
        let config = LineageConfig::from_lookup(|_| None);

        assert_eq!(config.max_prefix_chars, 192);
        assert_eq!(config.read_timeout(), Some(Duration::from_millis(10_000)));
        assert!(!config.strict_validation);
        assert_eq!(config.min_approximate_chars, 0);
        assert_eq!(config.memory_ceiling_bytes, 256 * 1024 * 1024);
        assert_eq!(config.tie_break, TieBreak::EarliestCreated);
        assert!((1..=16).contains(&config.workers));
    }

    #[test]
    fn config_overlays_environment_values() {
        let config = LineageConfig::from_lookup(lookup_from(&[
            ("LINEAGE_MAX_PREFIX_CHARS", "64"),
            ("LINEAGE_WORKERS", "99"),
            ("LINEAGE_READ_TIMEOUT_MS", "0"),
            ("LINEAGE_STRICT", "yes"),
            ("LINEAGE_MIN_APPROXIMATE_CHARS", "8"),
            ("LINEAGE_MEMORY_CEILING_BYTES", "4096"),
            ("LINEAGE_TIE_BREAK", "lexicographic"),
        ]));

        assert_eq!(config.max_prefix_chars, 64);
        assert_eq!(config.workers, 16);
        assert_eq!(config.read_timeout(), None);
        assert!(config.strict_validation);
        assert_eq!(config.min_approximate_chars, 8);
        assert_eq!(config.memory_ceiling_bytes, 4096);
        assert_eq!(config.tie_break, TieBreak::Lexicographic);

        let plan = config.rebuild_plan();
        assert_eq!(plan.transform.max_len, 64);
        assert!(plan.transform.strict);
        assert_eq!(plan.engine.min_approximate_chars, 8);
    }

    #[test]
    fn config_ignores_unparsable_values() {
        let config = LineageConfig::from_lookup(lookup_from(&[
            ("LINEAGE_MAX_PREFIX_CHARS", "0"),
            ("LINEAGE_STRICT", "maybe"),
            ("LINEAGE_TIE_BREAK", "newest"),
        ]));

        assert_eq!(config.max_prefix_chars, 192);
        assert!(!config.strict_validation);
        assert_eq!(config.tie_break, TieBreak::EarliestCreated);
    }
}
