use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

use crate::error::ConfigError;
use crate::params::PARAMS_KEY;
use crate::schema::{schema_violations, GRID_CONFIG_SCHEMA};

pub const DEFAULT_CONFIG_PATH: &str = "sweep.yml";
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// The `experiments` section: where runs live and how they are launched and
/// reported.
#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentSettings {
    pub run_dir: PathBuf,
    pub sources_dir: PathBuf,
    #[serde(default)]
    pub venv_dir: Option<PathBuf>,
    #[serde(default = "default_measures")]
    pub measures: Vec<String>,
    #[serde(default = "default_aggregations")]
    pub aggregations: Vec<String>,
    /// Measures reported without an aggregation level, e.g. `ap.run.mean`.
    #[serde(default = "default_aggregation_free_measures")]
    pub aggregation_free_measures: Vec<String>,
    #[serde(default = "default_stats")]
    pub stats: Vec<String>,
    #[serde(default = "default_run_types")]
    pub run_types: Vec<String>,
    #[serde(default = "default_results_file")]
    pub results_file: PathBuf,
    #[serde(default)]
    pub send_mail: bool,
    #[serde(default)]
    pub notify_command: Option<String>,
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    #[serde(default = "default_entry_point")]
    pub entry_point: String,
    #[serde(default = "default_config_flag")]
    pub config_flag: String,
    #[serde(default = "default_precision")]
    pub precision: u32,
}

fn default_measures() -> Vec<String> {
    vec!["f1-score".to_string()]
}

fn default_aggregations() -> Vec<String> {
    vec!["macro".to_string()]
}

fn default_aggregation_free_measures() -> Vec<String> {
    vec!["ap".to_string(), "auc".to_string()]
}

fn default_stats() -> Vec<String> {
    vec!["mean".to_string()]
}

fn default_run_types() -> Vec<String> {
    vec!["run".to_string()]
}

fn default_results_file() -> PathBuf {
    PathBuf::from("results.csv")
}

fn default_interpreter() -> String {
    "python3".to_string()
}

fn default_entry_point() -> String {
    "main.py".to_string()
}

fn default_config_flag() -> String {
    "--config_file".to_string()
}

const fn default_precision() -> u32 {
    3
}

impl ExperimentSettings {
    /// The virtual environment, if one is configured. An empty path means none.
    pub fn venv(&self) -> Option<&Path> {
        self.venv_dir
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
    }

    pub fn results_path(&self) -> PathBuf {
        if self.results_file.is_absolute() {
            self.results_file.clone()
        } else {
            self.run_dir.join(&self.results_file)
        }
    }
}

/// A validated grid configuration: the raw document plus typed views of the
/// sections the orchestrator itself consumes.
#[derive(Debug, Clone)]
pub struct GridConfig {
    pub document: Value,
    pub experiments: ExperimentSettings,
    pub log_level: String,
}

impl GridConfig {
    pub fn from_document(document: Value) -> Result<Self> {
        validate_required_fields(&document)?;
        if document.get(PARAMS_KEY).is_none() {
            return Err(ConfigError::MissingParams(PARAMS_KEY.to_string()).into());
        }
        let violations = schema_violations(GRID_CONFIG_SCHEMA, &document)?;
        if !violations.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "schema validation failed: {}",
                violations.join("; ")
            ))
            .into());
        }
        let experiments: ExperimentSettings =
            serde_json::from_value(document["experiments"].clone())
                .map_err(|e| ConfigError::Invalid(format!("experiments: {}", e)))?;
        let log_level = document
            .get("log_level")
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_LOG_LEVEL)
            .to_string();
        Ok(Self {
            document,
            experiments,
            log_level,
        })
    }

    /// Rebases relative `run_dir`, `sources_dir` and `venv_dir` onto `base`,
    /// keeping the document in step with the typed view.
    pub fn rebase(mut self, base: &Path) -> Self {
        let rebase_one = |p: &Path| -> PathBuf {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                base.join(p)
            }
        };
        self.experiments.run_dir = rebase_one(&self.experiments.run_dir);
        self.experiments.sources_dir = rebase_one(&self.experiments.sources_dir);
        let venv = self.experiments.venv().map(rebase_one);
        if venv.is_some() {
            self.experiments.venv_dir = venv;
        }
        if let Some(section) = self
            .document
            .get_mut("experiments")
            .and_then(|v| v.as_object_mut())
        {
            section.insert(
                "run_dir".to_string(),
                Value::String(self.experiments.run_dir.to_string_lossy().to_string()),
            );
            section.insert(
                "sources_dir".to_string(),
                Value::String(self.experiments.sources_dir.to_string_lossy().to_string()),
            );
            if let Some(venv) = self.experiments.venv() {
                section.insert(
                    "venv_dir".to_string(),
                    Value::String(venv.to_string_lossy().to_string()),
                );
            }
        }
        self
    }
}

/// Reads a YAML grid configuration. Relative directories are taken relative
/// to the file's own directory.
pub fn load_config(path: &Path) -> Result<GridConfig> {
    let raw_yaml = fs::read_to_string(path)
        .with_context(|| format!("reading grid config {}", path.display()))?;
    let yaml_value: serde_yaml::Value = serde_yaml::from_str(&raw_yaml)
        .with_context(|| format!("parsing grid config {}", path.display()))?;
    let document: Value = serde_json::to_value(yaml_value)?;
    let base = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let base = base.canonicalize().unwrap_or(base);
    Ok(GridConfig::from_document(document)?.rebase(&base))
}

fn validate_required_fields(document: &Value) -> Result<(), ConfigError> {
    let required = ["/experiments/run_dir", "/experiments/sources_dir"];
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|p| document.pointer(p).is_none())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "missing required field(s): {}",
            missing.join(", ")
        )))
    }
}
