use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use sweep_runner::{
    load_config, notifier_for, Expansion, GridConfig, ResultsTable, RunReport, ShellLauncher,
    DEFAULT_CONFIG_PATH,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sweep", version, about = "Experiment grid runner")]
struct Cli {
    /// Overrides RUST_LOG and the config's `log_level`.
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Expand the grid, run every pending combination and aggregate results.
    Run {
        #[arg(default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Show the axes and run ids without executing anything.
    Plan {
        #[arg(default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Report the sentinel state of every run.
    Status {
        #[arg(default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Aggregate the results of completed runs only.
    Collect {
        #[arg(default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command, cli.log_level.as_deref());
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands, log_level: Option<&str>) -> Result<Option<Value>> {
    match command {
        Commands::Run { config, json } => {
            let grid = load_and_init(&config, log_level)?;
            let notifier = notifier_for(&grid.experiments);
            let report =
                sweep_runner::run_grid(&grid, &ShellLauncher::default(), notifier.as_ref())?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "runs": report.runs.iter().map(run_report_to_json).collect::<Vec<_>>(),
                    "results_file": report.results_path.display().to_string(),
                    "table": report.table.to_json()
                })));
            }
            print_table(&report.table);
            println!("results_file: {}", report.results_path.display());
        }
        Commands::Plan { config, json } => {
            let grid = load_and_init(&config, log_level)?;
            let plan = sweep_runner::plan_grid(&grid)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "plan",
                    "plan": plan_to_json(&plan)
                })));
            }
            print_plan(&plan);
        }
        Commands::Status { config, json } => {
            let grid = load_and_init(&config, log_level)?;
            let runs = sweep_runner::grid_status(&grid)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "status",
                    "runs": runs.iter().map(run_report_to_json).collect::<Vec<_>>()
                })));
            }
            for run in &runs {
                println!("{:<10} {}", run.status.as_str(), run.run_id);
            }
        }
        Commands::Collect { config, json } => {
            let grid = load_and_init(&config, log_level)?;
            let report = sweep_runner::collect_results(&grid)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "collect",
                    "pending": report.pending,
                    "results_file": report.results_path.display().to_string(),
                    "table": report.table.to_json()
                })));
            }
            print_table(&report.table);
            if !report.pending.is_empty() {
                let pending: Vec<&str> = report.pending.iter().map(|id| id.as_str()).collect();
                println!("pending: {}", pending.join(", "));
            }
            println!("results_file: {}", report.results_path.display());
        }
    }
    Ok(None)
}

/// Loads the config, then installs the log subscriber so the config's own
/// `log_level` can serve as the last fallback.
fn load_and_init(path: &Path, log_level: Option<&str>) -> Result<GridConfig> {
    match load_config(path) {
        Ok(grid) => {
            init_tracing(log_level, Some(&grid.log_level));
            Ok(grid)
        }
        Err(err) => {
            init_tracing(log_level, None);
            Err(err)
        }
    }
}

fn init_tracing(cli_level: Option<&str>, config_level: Option<&str>) {
    let filter = match cli_level {
        Some(level) => EnvFilter::new(normalize_level(level)),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(normalize_level(config_level.unwrap_or("info")))
        }),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn normalize_level(level: &str) -> String {
    match level.trim().to_ascii_lowercase().as_str() {
        "warning" => "warn".to_string(),
        other => other.to_string(),
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Plan { json, .. }
        | Commands::Status { json, .. }
        | Commands::Collect { json, .. } => *json,
    }
}

fn run_report_to_json(run: &RunReport) -> Value {
    json!({
        "run_id": run.run_id,
        "run_dir": run.run_dir.display().to_string(),
        "status": run.status,
        "skipped": run.skipped
    })
}

fn plan_to_json(plan: &Expansion) -> Value {
    json!({
        "axes": plan
            .axes
            .iter()
            .map(|a| json!({"path": a.path.to_string(), "candidates": a.candidates}))
            .collect::<Vec<_>>(),
        "runs": plan
            .runs
            .iter()
            .map(|r| json!({
                "run_id": r.run_id,
                "run_dir": r.run_dir.display().to_string()
            }))
            .collect::<Vec<_>>()
    })
}

fn print_plan(plan: &Expansion) {
    for axis in &plan.axes {
        let candidates: Vec<String> = axis.candidates.iter().map(Value::to_string).collect();
        println!("axis {}: [{}]", axis.path, candidates.join(", "));
    }
    println!("runs: {}", plan.runs.len());
    for run in &plan.runs {
        println!("  {}", run.run_id);
    }
}

fn print_table(table: &ResultsTable) {
    if table.rows.is_empty() {
        println!("no results");
        return;
    }
    print!("{}", table.render());
}
