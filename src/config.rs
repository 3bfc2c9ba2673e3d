//! Configuration for deployment runs.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (LAKEHOUSE_HOME, LAKEHOUSE_PROJECT,
//!    LAKEHOUSE_REGION, LAKEHOUSE_ZONE)
//! 2. Config file (.lakehouse/config.yaml)
//! 3. Defaults (~/.lakehouse)
//!
//! Config file discovery:
//! - Searches the start directory and its parents for .lakehouse/config.yaml
//! - Paths in the config file are relative to the .lakehouse/ directory
//!
//! The resolved configuration is an ordinary value handed to whatever needs
//! it; nothing here is cached process-wide.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapters::ApiEndpoints;
use crate::core::{
    DeploymentPlan, DrainSettings, PatternTable, PollSettings, ReadinessSettings, RetryClassifier,
    RetryPolicy, RetrySettings, TransientPattern,
};
use crate::domain::RunContext;

pub const CONFIG_DIR: &str = ".lakehouse";
pub const CONFIG_FILE: &str = "config.yaml";

/// Directory searched for plans by name
pub const DEPLOYMENTS_DIR: &str = "deployments";

const DEFAULT_REGION: &str = "us-central1";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub polling: PollSettings,
    /// Polling of control plane create operations
    #[serde(default = "PollSettings::operations")]
    pub operations: PollSettings,
    #[serde(default)]
    pub readiness: ReadinessSettings,
    #[serde(default)]
    pub drain: DrainSettings,
    #[serde(default)]
    pub api: ApiEndpoints,
    /// Appended after the built-in transient-error table
    #[serde(default)]
    pub transient_patterns: Vec<TransientPattern>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .lakehouse/)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectConfig {
    pub id: Option<String>,
    pub region: Option<String>,
    pub zone: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to engine state (run logs)
    pub home: PathBuf,
    /// Directory plans are looked up from
    pub base_dir: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub project_id: Option<String>,
    pub region: String,
    pub zone: Option<String>,
    pub retry: RetrySettings,
    pub polling: PollSettings,
    pub operations: PollSettings,
    pub readiness: ReadinessSettings,
    pub drain: DrainSettings,
    pub api: ApiEndpoints,
    pub transient_patterns: Vec<TransientPattern>,
}

impl ResolvedConfig {
    /// Defaults rooted at `home`, with no config file
    pub fn with_home(home: PathBuf, base_dir: PathBuf) -> Self {
        Self {
            home,
            base_dir,
            config_file: None,
            project_id: None,
            region: DEFAULT_REGION.to_string(),
            zone: None,
            retry: RetrySettings::default(),
            polling: PollSettings::default(),
            operations: PollSettings::operations(),
            readiness: ReadinessSettings::default(),
            drain: DrainSettings::default(),
            api: ApiEndpoints::default(),
            transient_patterns: Vec::new(),
        }
    }

    /// Get the runs directory ($LAKEHOUSE_HOME/runs)
    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }

    /// Build the context of a new run; `None` arguments fall back to
    /// configuration. The zone defaults to `<region>-a`.
    pub fn run_context(
        &self,
        project: Option<&str>,
        region: Option<&str>,
        zone: Option<&str>,
    ) -> Result<RunContext> {
        let project_id = project
            .map(str::to_string)
            .or_else(|| self.project_id.clone())
            .context("No project configured (use --project, LAKEHOUSE_PROJECT or project.id)")?;
        let region = region.unwrap_or(&self.region).to_string();
        let zone = zone
            .map(str::to_string)
            .or_else(|| self.zone.clone())
            .unwrap_or_else(|| format!("{}-a", region));

        Ok(RunContext::new(project_id, region, zone))
    }

    /// Built-in transient-error table plus configured patterns
    pub fn classifier(&self) -> Result<RetryClassifier> {
        let mut table = PatternTable::builtin().context("Built-in transient error table")?;
        table.extend(self.transient_patterns.iter().cloned());
        RetryClassifier::compile(&table).context("Invalid transient_patterns in configuration")
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        Ok(RetryPolicy::from_settings(&self.retry, Arc::new(self.classifier()?)))
    }

    /// Locate a plan by name: `deployments/<name>.yaml`, then `<name>.yaml`,
    /// under the base directory. A path to an existing file is used as is.
    pub fn plan_path(&self, name: &str) -> Result<PathBuf> {
        let direct = PathBuf::from(name);
        if direct.is_file() {
            return Ok(direct);
        }

        let file_name = format!("{}.yaml", name);
        let candidates = [
            self.base_dir.join(DEPLOYMENTS_DIR).join(&file_name),
            self.base_dir.join(&file_name),
        ];

        candidates
            .iter()
            .find(|p| p.is_file())
            .cloned()
            .with_context(|| {
                format!(
                    "Deployment plan '{}' not found (looked in {} and {})",
                    name,
                    candidates[0].display(),
                    candidates[1].display()
                )
            })
    }

    /// Locate and load a plan by name. Relative `source` paths in the plan
    /// are resolved against the base directory.
    pub fn load_plan(&self, name: &str) -> Result<DeploymentPlan> {
        let path = self.plan_path(name)?;
        let plan = DeploymentPlan::from_file(&path)?;
        Ok(plan.with_sources_under(&self.base_dir))
    }
}

/// Find config file by searching `start` and its parents
pub fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join(CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Load configuration from the current directory and the process
/// environment
pub fn load_config() -> Result<ResolvedConfig> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    load_config_from(&cwd, |key| std::env::var(key).ok())
}

/// Load configuration starting the file search at `start`, reading
/// environment overrides through `env`
pub fn load_config_from<F>(start: &Path, env: F) -> Result<ResolvedConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let default_home = || -> Result<PathBuf> {
        Ok(dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(CONFIG_DIR))
    };

    let config_file = find_config_file(start);

    let mut resolved = if let Some(ref config_path) = config_file {
        let config = load_config_file(config_path)?;

        // .lakehouse/ and the project root that contains it
        let config_dir = config_path.parent().unwrap_or(Path::new("."));
        let base_dir = config_dir.parent().unwrap_or(Path::new(".")).to_path_buf();

        let home = match config.paths.home {
            Some(ref home_path) => resolve_path(config_dir, home_path),
            None => default_home()?,
        };

        ResolvedConfig {
            home,
            base_dir,
            config_file: config_file.clone(),
            project_id: config.project.id,
            region: config
                .project
                .region
                .unwrap_or_else(|| DEFAULT_REGION.to_string()),
            zone: config.project.zone,
            retry: config.retry,
            polling: config.polling,
            operations: config.operations,
            readiness: config.readiness,
            drain: config.drain,
            api: config.api,
            transient_patterns: config.transient_patterns,
        }
    } else {
        ResolvedConfig::with_home(default_home()?, start.to_path_buf())
    };

    if let Some(home) = env("LAKEHOUSE_HOME") {
        resolved.home = PathBuf::from(home);
    }
    if let Some(project) = env("LAKEHOUSE_PROJECT") {
        resolved.project_id = Some(project);
    }
    if let Some(region) = env("LAKEHOUSE_REGION") {
        resolved.region = region;
    }
    if let Some(zone) = env("LAKEHOUSE_ZONE") {
        resolved.zone = Some(zone);
    }

    Ok(resolved)
}
