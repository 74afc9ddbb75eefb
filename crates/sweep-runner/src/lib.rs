//! Experiment-grid orchestration: expand a swept configuration into concrete
//! runs, drive each run through the downstream pipeline, and fold the per-run
//! result artifacts into one table.

pub mod config;
pub mod driver;
pub mod error;
pub mod expand;
pub mod fsutil;
pub mod grid;
pub mod notify;
pub mod params;
pub mod results;
pub mod run_id;
pub mod schema;

pub use config::{load_config, ExperimentSettings, GridConfig, DEFAULT_CONFIG_PATH};
pub use driver::{
    drive_run, prepare_environment, LaunchSettings, LaunchStatus, Launcher, RunOutcome, RunPaths,
    RunStatus, ShellLauncher,
};
pub use error::{ConfigError, DriverError};
pub use expand::{expand, expand_document, Expansion, MaterializedRun};
pub use grid::{
    acquire_grid_lock, collect_results, grid_status, plan_grid, run_grid, CollectReport,
    GridReport, RunReport,
};
pub use notify::{notifier_for, CommandNotifier, LogNotifier, Notifier};
pub use params::{traverse, KeyPath, ParamValue, SweepAxis};
pub use results::{aggregate, ResultQuery, ResultsTable};
pub use run_id::{build_run_id, RunId};
