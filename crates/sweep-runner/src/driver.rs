use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::ExperimentSettings;
use crate::error::DriverError;
use crate::expand::{resolve_folder, MaterializedRun};
use crate::fsutil::{
    atomic_write_bytes, atomic_write_json_pretty, canonical_json_digest, ensure_dir,
    remove_if_exists, shell_quote, touch,
};

pub const CONFIG_FILE: &str = "config.yml";
pub const CONFIG_DIGEST_FILE: &str = "config.sha256";
pub const SCRIPT_FILE: &str = "run.sh";
pub const STATE_FILE: &str = "run_state.json";
pub const COMPLETED_MARKER: &str = "completed";
pub const ERROR_MARKER: &str = "error";
pub const RUNNING_MARKER: &str = "running";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

/// Well-known files inside one run directory.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub run_dir: PathBuf,
    pub config: PathBuf,
    pub config_digest: PathBuf,
    pub script: PathBuf,
    pub state: PathBuf,
    pub completed: PathBuf,
    pub error: PathBuf,
    pub running: PathBuf,
}

impl RunPaths {
    pub fn new(run_dir: &Path) -> Self {
        Self {
            run_dir: run_dir.to_path_buf(),
            config: run_dir.join(CONFIG_FILE),
            config_digest: run_dir.join(CONFIG_DIGEST_FILE),
            script: run_dir.join(SCRIPT_FILE),
            state: run_dir.join(STATE_FILE),
            completed: run_dir.join(COMPLETED_MARKER),
            error: run_dir.join(ERROR_MARKER),
            running: run_dir.join(RUNNING_MARKER),
        }
    }

    /// State as told by the sentinel files. `completed` wins over everything.
    pub fn status(&self) -> RunStatus {
        if self.completed.exists() {
            RunStatus::Completed
        } else if self.error.exists() {
            RunStatus::Failed
        } else if self.running.exists() {
            RunStatus::Running
        } else {
            RunStatus::Pending
        }
    }
}

/// How the downstream pipeline is invoked.
#[derive(Debug, Clone)]
pub struct LaunchSettings {
    pub sources_dir: PathBuf,
    pub venv_dir: Option<PathBuf>,
    pub interpreter: String,
    pub entry_point: String,
    pub config_flag: String,
}

impl From<&ExperimentSettings> for LaunchSettings {
    fn from(settings: &ExperimentSettings) -> Self {
        Self {
            sources_dir: settings.sources_dir.clone(),
            venv_dir: settings.venv().map(Path::to_path_buf),
            interpreter: settings.interpreter.clone(),
            entry_point: settings.entry_point.clone(),
            config_flag: settings.config_flag.clone(),
        }
    }
}

/// Exit status of a launched run script; `None` means killed by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchStatus {
    pub code: Option<i32>,
}

impl LaunchStatus {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn describe(&self) -> String {
        self.code
            .map(|c| format!("exit code {}", c))
            .unwrap_or_else(|| "terminated by signal".to_string())
    }
}

/// Executes a generated run script and blocks until it finishes.
pub trait Launcher {
    fn launch(&self, script: &Path, run_dir: &Path) -> Result<LaunchStatus>;
}

/// Runs scripts through a shell interpreter, inheriting stdout and stderr.
#[derive(Debug, Clone)]
pub struct ShellLauncher {
    pub shell: String,
}

impl Default for ShellLauncher {
    fn default() -> Self {
        Self {
            shell: "bash".to_string(),
        }
    }
}

impl Launcher for ShellLauncher {
    fn launch(&self, script: &Path, run_dir: &Path) -> Result<LaunchStatus> {
        let status = Command::new(&self.shell)
            .arg(script)
            .current_dir(run_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .with_context(|| format!("spawning {} {}", self.shell, script.display()))?;
        Ok(LaunchStatus {
            code: status.code(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// A completion marker was already present.
    Skipped,
    Completed,
}

/// Fails on a missing virtual environment and creates a missing run root.
pub fn prepare_environment(settings: &ExperimentSettings) -> Result<()> {
    if let Some(venv) = settings.venv() {
        if !venv.exists() {
            return Err(DriverError::EnvironmentMissing {
                path: venv.to_path_buf(),
            }
            .into());
        }
    }
    if !settings.run_dir.exists() {
        info!(run_dir = %settings.run_dir.display(), "run directory not found, creating");
        ensure_dir(&settings.run_dir)?;
    }
    Ok(())
}

pub fn render_run_script(settings: &LaunchSettings, paths: &RunPaths) -> String {
    let error = shell_quote(&paths.error.to_string_lossy());
    let completed = shell_quote(&paths.completed.to_string_lossy());
    let entry = resolve_folder(&settings.entry_point, &settings.sources_dir);

    let mut script = String::from("#!/usr/bin/env bash\n");
    if let Some(venv) = &settings.venv_dir {
        let activate = venv.join("bin").join("activate");
        script.push_str(&format!(
            "source {} || {{ touch {}; exit 1; }}\n",
            shell_quote(&activate.to_string_lossy()),
            error
        ));
    }
    script.push_str(&format!(
        "cd {} || {{ touch {}; exit 1; }}\n",
        shell_quote(&settings.sources_dir.to_string_lossy()),
        error
    ));
    let mut command = vec![
        shell_quote(&settings.interpreter),
        shell_quote(&entry.to_string_lossy()),
    ];
    if !settings.config_flag.is_empty() {
        command.push(shell_quote(&settings.config_flag));
    }
    command.push(shell_quote(&paths.config.to_string_lossy()));
    script.push_str(&format!(
        "if {}; then\n  touch {}\nelse\n  touch {}\n  exit 1\nfi\n",
        command.join(" "),
        completed,
        error
    ));
    script
}

fn write_run_state(
    paths: &RunPaths,
    run_id: &str,
    status: RunStatus,
    exit_reason: Option<&str>,
) -> Result<()> {
    let payload = json!({
        "schema_version": "run_state_v1",
        "run_id": run_id,
        "status": status,
        "exit_reason": exit_reason,
        "updated_at": Utc::now().to_rfc3339(),
    });
    atomic_write_json_pretty(&paths.state, &payload)
}

/// Records `failed` if dropped before [`RunStateGuard::complete`] is called.
struct RunStateGuard<'a> {
    paths: &'a RunPaths,
    run_id: &'a str,
    done: bool,
}

impl<'a> RunStateGuard<'a> {
    fn new(paths: &'a RunPaths, run_id: &'a str) -> Self {
        Self {
            paths,
            run_id,
            done: false,
        }
    }

    fn complete(&mut self, status: RunStatus, exit_reason: Option<&str>) -> Result<()> {
        write_run_state(self.paths, self.run_id, status, exit_reason)?;
        self.done = true;
        Ok(())
    }
}

impl Drop for RunStateGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            let _ = touch(&self.paths.error);
            let _ = remove_if_exists(&self.paths.running);
            let _ = write_run_state(self.paths, self.run_id, RunStatus::Failed, Some("aborted"));
        }
    }
}

/// Drives one materialized run to completion. A completed run is skipped; a
/// failed one is returned as [`DriverError::RunFailed`].
pub fn drive_run(
    run: &MaterializedRun,
    settings: &LaunchSettings,
    launcher: &dyn Launcher,
) -> Result<RunOutcome> {
    let paths = RunPaths::new(&run.run_dir);
    let run_id = run.run_id.as_str();
    let digest = canonical_json_digest(&run.config);

    if paths.completed.exists() {
        if let Ok(stored) = fs::read_to_string(&paths.config_digest) {
            if stored.trim() != digest {
                warn!(
                    run_id,
                    stored = stored.trim(),
                    current = %digest,
                    "completed run was produced with a different configuration"
                );
            }
        }
        info!(run_id, "skipping completed run");
        return Ok(RunOutcome::Skipped);
    }
    if paths.running.exists() {
        warn!(run_id, "found stale running marker, previous attempt was interrupted");
    }
    if remove_if_exists(&paths.error)? {
        info!(run_id, "cleared error marker from a previous attempt");
    }

    ensure_dir(&paths.run_dir)?;
    let config_yaml = serde_yaml::to_string(&run.config)?;
    atomic_write_bytes(&paths.config, config_yaml.as_bytes())?;
    atomic_write_bytes(&paths.config_digest, digest.as_bytes())?;
    let script = render_run_script(settings, &paths);
    atomic_write_bytes(&paths.script, script.as_bytes())?;
    debug!(run_id, script = %paths.script.display(), "wrote run script");

    write_run_state(&paths, run_id, RunStatus::Running, None)?;
    let mut guard = RunStateGuard::new(&paths, run_id);
    touch(&paths.running)?;

    let status = launcher.launch(&paths.script, &paths.run_dir)?;
    remove_if_exists(&paths.running)?;

    if !status.success() || paths.error.exists() {
        touch(&paths.error)?;
        let reason = if status.success() {
            "error marker written by run script".to_string()
        } else {
            status.describe()
        };
        guard.complete(RunStatus::Failed, Some(&reason))?;
        return Err(DriverError::RunFailed {
            run_id: run_id.to_string(),
            reason,
        }
        .into());
    }

    touch(&paths.completed)?;
    guard.complete(RunStatus::Completed, None)?;
    info!(run_id, "run completed");
    Ok(RunOutcome::Completed)
}
