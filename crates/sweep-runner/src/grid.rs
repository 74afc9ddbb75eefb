use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};

use crate::config::GridConfig;
use crate::driver::{drive_run, prepare_environment, LaunchSettings, Launcher, RunOutcome, RunPaths, RunStatus};
use crate::expand::{expand, Expansion};
use crate::fsutil::{atomic_write_json_pretty, canonical_json_digest, ensure_dir};
use crate::notify::Notifier;
use crate::results::{aggregate, ResultQuery, ResultsTable};
use crate::run_id::RunId;

pub const GRID_LOCK_FILE: &str = ".sweep.lock";
pub const GRID_MANIFEST_FILE: &str = "grid_manifest.json";

/// Exclusive hold on a run root. Released on drop.
#[derive(Debug)]
pub struct GridLock {
    path: PathBuf,
}

impl Drop for GridLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

pub fn acquire_grid_lock(run_root: &Path) -> Result<GridLock> {
    ensure_dir(run_root)?;
    let lock_path = run_root.join(GRID_LOCK_FILE);
    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&lock_path)
    {
        Ok(mut file) => {
            let lock = GridLock { path: lock_path };
            let payload = serde_json::to_vec(&json!({
                "pid": std::process::id(),
                "acquired_at": Utc::now().to_rfc3339(),
            }))?;
            file.write_all(&payload)
                .with_context(|| format!("writing {}", lock.path.display()))?;
            file.sync_all()?;
            Ok(lock)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(anyhow!(
            "operation_in_progress: another sweep holds {} (remove it if no sweep is running)",
            lock_path.display()
        )),
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: RunId,
    pub run_dir: PathBuf,
    pub status: RunStatus,
    pub skipped: bool,
}

#[derive(Debug, Clone)]
pub struct GridReport {
    pub runs: Vec<RunReport>,
    pub table: ResultsTable,
    pub results_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct CollectReport {
    pub table: ResultsTable,
    pub results_path: PathBuf,
    pub pending: Vec<RunId>,
}

/// Expands the grid without touching the filesystem.
pub fn plan_grid(config: &GridConfig) -> Result<Expansion> {
    Ok(expand(config)?)
}

/// Current sentinel state of every run in the grid.
pub fn grid_status(config: &GridConfig) -> Result<Vec<RunReport>> {
    let expansion = expand(config)?;
    Ok(expansion
        .runs
        .iter()
        .map(|run| RunReport {
            run_id: run.run_id.clone(),
            run_dir: run.run_dir.clone(),
            status: RunPaths::new(&run.run_dir).status(),
            skipped: false,
        })
        .collect())
}

fn write_grid_manifest(config: &GridConfig, expansion: &Expansion) -> Result<()> {
    let manifest = json!({
        "schema_version": "grid_manifest_v1",
        "config_digest": canonical_json_digest(&config.document),
        "axes": expansion
            .axes
            .iter()
            .map(|a| json!({"path": a.path.to_string(), "candidates": a.candidates}))
            .collect::<Vec<_>>(),
        "run_ids": expansion.run_ids(),
        "created_at": Utc::now().to_rfc3339(),
    });
    atomic_write_json_pretty(&config.experiments.run_dir.join(GRID_MANIFEST_FILE), &manifest)
}

fn send_notice(notifier: &dyn Notifier, subject: &str, body: &str) {
    if let Err(err) = notifier.notify(subject, body) {
        warn!(error = %err, "notification failed");
    }
}

/// Runs every combination in order, stopping at the first failure, then
/// aggregates and persists the results table.
pub fn run_grid(
    config: &GridConfig,
    launcher: &dyn Launcher,
    notifier: &dyn Notifier,
) -> Result<GridReport> {
    let settings = &config.experiments;
    prepare_environment(settings)?;
    let _lock = acquire_grid_lock(&settings.run_dir)?;

    let expansion = expand(config)?;
    info!(
        axes = expansion.axes.len(),
        runs = expansion.runs.len(),
        run_dir = %settings.run_dir.display(),
        "expanded experiment grid"
    );
    write_grid_manifest(config, &expansion)?;

    let launch = LaunchSettings::from(settings);
    let total = expansion.runs.len();
    let mut reports = Vec::with_capacity(total);
    for (idx, run) in expansion.runs.iter().enumerate() {
        info!(run_id = %run.run_id, "[{}/{}] starting run", idx + 1, total);
        match drive_run(run, &launch, launcher) {
            Ok(outcome) => reports.push(RunReport {
                run_id: run.run_id.clone(),
                run_dir: run.run_dir.clone(),
                status: RunStatus::Completed,
                skipped: outcome == RunOutcome::Skipped,
            }),
            Err(err) => {
                error!(run_id = %run.run_id, error = %err, "run failed, aborting grid");
                send_notice(
                    notifier,
                    "sweep failed",
                    &format!(
                        "run {} failed after {} of {} runs: {}",
                        run.run_id, idx, total, err
                    ),
                );
                return Err(err);
            }
        }
    }

    let query = ResultQuery::from(settings);
    let table = aggregate(
        expansion
            .runs
            .iter()
            .map(|r| (&r.run_id, r.run_dir.as_path())),
        &query,
    )?;
    let results_path = settings.results_path();
    table.write_csv(&results_path)?;
    info!(path = %results_path.display(), rows = table.rows.len(), "wrote results table");

    let skipped = reports.iter().filter(|r| r.skipped).count();
    send_notice(
        notifier,
        "sweep completed",
        &format!(
            "{} runs completed ({} reused), results in {}",
            total,
            skipped,
            results_path.display()
        ),
    );
    Ok(GridReport {
        runs: reports,
        table,
        results_path,
    })
}

/// Aggregates whatever runs are already completed, listing the rest.
pub fn collect_results(config: &GridConfig) -> Result<CollectReport> {
    let expansion = expand(config)?;
    let mut pending = Vec::new();
    let mut completed = Vec::new();
    for run in &expansion.runs {
        if RunPaths::new(&run.run_dir).status() == RunStatus::Completed {
            completed.push((&run.run_id, run.run_dir.as_path()));
        } else {
            warn!(run_id = %run.run_id, "run not completed, leaving it out of the table");
            pending.push(run.run_id.clone());
        }
    }
    let table = aggregate(completed, &ResultQuery::from(&config.experiments))?;
    let results_path = config.experiments.results_path();
    table.write_csv(&results_path)?;
    Ok(CollectReport {
        table,
        results_path,
        pending,
    })
}
