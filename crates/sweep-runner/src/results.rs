//! Flattening of per-run result artifacts into one summary table.
//!
//! Each completed run leaves `results/results.json` shaped as
//! `metric -> run_type -> aggregation -> statistic -> number | [number]`.
//! Aggregation-free measures such as `ap` skip the aggregation level:
//! `metric -> run_type -> statistic`.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::config::ExperimentSettings;
use crate::expand::RESULTS_FOLDER;
use crate::fsutil::ensure_dir;
use crate::run_id::RunId;
use crate::schema::{schema_violations, RESULT_ARTIFACT_SCHEMA};

pub const RESULTS_ARTIFACT: &str = "results.json";
const INDEX_HEADER: &str = "run_id";

pub fn results_artifact_path(run_dir: &Path) -> PathBuf {
    run_dir.join(RESULTS_FOLDER).join(RESULTS_ARTIFACT)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnKey {
    pub metric: String,
    pub run_type: String,
    pub aggregation: Option<String>,
    pub statistic: String,
}

impl fmt::Display for ColumnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.aggregation {
            Some(aggregation) => write!(
                f,
                "{}.{}.{}.{}",
                self.metric, self.run_type, aggregation, self.statistic
            ),
            None => write!(f, "{}.{}.{}", self.metric, self.run_type, self.statistic),
        }
    }
}

/// One table cell: a single score or the per-fold scores it was computed from.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Number(f64),
    Series(Vec<f64>),
}

impl Cell {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_f64().map(Cell::Number),
            Value::Array(items) => items
                .iter()
                .map(Value::as_f64)
                .collect::<Option<Vec<f64>>>()
                .map(Cell::Series),
            _ => None,
        }
    }

    pub fn render(&self, precision: u32) -> String {
        let p = precision as usize;
        match self {
            Cell::Number(v) => format!("{:.*}", p, v),
            Cell::Series(values) => values
                .iter()
                .map(|v| format!("{:.*}", p, v))
                .collect::<Vec<_>>()
                .join(";"),
        }
    }

    fn to_json(&self, precision: u32) -> Value {
        match self {
            Cell::Number(v) => json!(round_to(*v, precision)),
            Cell::Series(values) => json!(values
                .iter()
                .map(|v| round_to(*v, precision))
                .collect::<Vec<_>>()),
        }
    }
}

pub fn round_to(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).round() / factor
}

/// Which (metric, run type, aggregation, statistic) tuples become columns.
#[derive(Debug, Clone)]
pub struct ResultQuery {
    pub measures: Vec<String>,
    pub run_types: Vec<String>,
    pub aggregations: Vec<String>,
    pub aggregation_free_measures: Vec<String>,
    pub stats: Vec<String>,
    pub precision: u32,
}

impl From<&ExperimentSettings> for ResultQuery {
    fn from(settings: &ExperimentSettings) -> Self {
        Self {
            measures: settings.measures.clone(),
            run_types: settings.run_types.clone(),
            aggregations: settings.aggregations.clone(),
            aggregation_free_measures: settings.aggregation_free_measures.clone(),
            stats: settings.stats.clone(),
            precision: settings.precision,
        }
    }
}

impl ResultQuery {
    /// Aggregation-free measures get one column per (run type, statistic).
    pub fn columns(&self) -> Vec<ColumnKey> {
        let mut columns = Vec::new();
        for metric in &self.measures {
            let aggregations: Vec<Option<&String>> =
                if self.aggregation_free_measures.contains(metric) {
                    vec![None]
                } else {
                    self.aggregations.iter().map(Some).collect()
                };
            for run_type in &self.run_types {
                for aggregation in &aggregations {
                    for statistic in &self.stats {
                        columns.push(ColumnKey {
                            metric: metric.clone(),
                            run_type: run_type.clone(),
                            aggregation: aggregation.cloned(),
                            statistic: statistic.clone(),
                        });
                    }
                }
            }
        }
        columns
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultsRow {
    pub run_id: RunId,
    pub cells: Vec<Option<Cell>>,
}

#[derive(Debug, Clone)]
pub struct ResultsTable {
    pub columns: Vec<ColumnKey>,
    pub rows: Vec<ResultsRow>,
    pub precision: u32,
}

impl ResultsTable {
    pub fn new(columns: Vec<ColumnKey>, precision: u32) -> Self {
        Self {
            columns,
            rows: Vec::new(),
            precision,
        }
    }

    /// Removes columns that no run could fill.
    pub fn drop_empty_columns(&mut self) {
        let keep: Vec<bool> = (0..self.columns.len())
            .map(|i| self.rows.iter().any(|r| r.cells[i].is_some()))
            .collect();
        let mut idx = 0;
        self.columns.retain(|_| {
            idx += 1;
            keep[idx - 1]
        });
        for row in &mut self.rows {
            let mut idx = 0;
            row.cells.retain(|_| {
                idx += 1;
                keep[idx - 1]
            });
        }
    }

    fn header(&self) -> Vec<String> {
        std::iter::once(INDEX_HEADER.to_string())
            .chain(self.columns.iter().map(ToString::to_string))
            .collect()
    }

    fn record(&self, row: &ResultsRow, empty: &str) -> Vec<String> {
        std::iter::once(row.run_id.to_string())
            .chain(row.cells.iter().map(|c| match c {
                Some(cell) => cell.render(self.precision),
                None => empty.to_string(),
            }))
            .collect()
    }

    /// Console rendering with aligned columns.
    pub fn render(&self) -> String {
        let mut lines = vec![self.header()];
        lines.extend(self.rows.iter().map(|r| self.record(r, "-")));
        let widths: Vec<usize> = (0..lines[0].len())
            .map(|i| lines.iter().map(|l| l[i].chars().count()).max().unwrap_or(0))
            .collect();
        let mut out = String::new();
        for line in &lines {
            let cells: Vec<String> = line
                .iter()
                .zip(&widths)
                .enumerate()
                .map(|(i, (cell, &w))| {
                    if i == 0 {
                        format!("{:<w$}", cell, w = w)
                    } else {
                        format!("{:>w$}", cell, w = w)
                    }
                })
                .collect();
            out.push_str(cells.join("  ").trim_end());
            out.push('\n');
        }
        out
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }
        let mut wtr = csv::Writer::from_path(path)
            .with_context(|| format!("creating results file {}", path.display()))?;
        wtr.write_record(self.header())?;
        for row in &self.rows {
            wtr.write_record(self.record(row, ""))?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn to_json(&self) -> Value {
        let rows: Vec<Value> = self
            .rows
            .iter()
            .map(|row| {
                let mut obj = serde_json::Map::new();
                obj.insert(INDEX_HEADER.to_string(), json!(row.run_id));
                for (column, cell) in self.columns.iter().zip(&row.cells) {
                    obj.insert(
                        column.to_string(),
                        cell.as_ref()
                            .map(|c| c.to_json(self.precision))
                            .unwrap_or(Value::Null),
                    );
                }
                Value::Object(obj)
            })
            .collect();
        json!({
            "columns": self.columns.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "rows": rows,
        })
    }
}

pub fn load_result_artifact(path: &Path) -> Result<Value> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading result artifact {}", path.display()))?;
    let artifact: Value = serde_json::from_str(&raw)
        .with_context(|| format!("parsing result artifact {}", path.display()))?;
    let violations = schema_violations(RESULT_ARTIFACT_SCHEMA, &artifact)?;
    if !violations.is_empty() {
        return Err(anyhow!(
            "result artifact {} is malformed: {}",
            path.display(),
            violations.join("; ")
        ));
    }
    Ok(artifact)
}

/// One row for `run_id`. Cells the artifact cannot provide stay empty and are
/// logged.
pub fn flatten_row(run_id: &RunId, artifact: &Value, columns: &[ColumnKey]) -> ResultsRow {
    let cells = columns
        .iter()
        .map(|column| {
            let Some(by_run_type) = artifact
                .get(&column.metric)
                .and_then(|m| m.get(&column.run_type))
            else {
                warn!(run_id = %run_id, metric = %column.metric, run_type = %column.run_type,
                    "metric/run type not present in results, skipping");
                return None;
            };
            let by_aggregation = match &column.aggregation {
                Some(aggregation) => match by_run_type.get(aggregation) {
                    Some(inner) => inner,
                    None => {
                        warn!(run_id = %run_id, metric = %column.metric, aggregation = %aggregation,
                            "aggregation not available for metric, skipping");
                        return None;
                    }
                },
                None => by_run_type,
            };
            let Some(value) = by_aggregation.get(&column.statistic) else {
                warn!(run_id = %run_id, column = %column, "statistic not present in results, skipping");
                return None;
            };
            let cell = Cell::from_value(value);
            if cell.is_none() {
                warn!(run_id = %run_id, column = %column, "non-numeric result value, skipping");
            }
            cell
        })
        .collect();
    ResultsRow {
        run_id: run_id.clone(),
        cells,
    }
}

/// Reads the artifact of every `(run id, run dir)` and builds the table in the
/// given order.
pub fn aggregate<'a, I>(runs: I, query: &ResultQuery) -> Result<ResultsTable>
where
    I: IntoIterator<Item = (&'a RunId, &'a Path)>,
{
    let mut table = ResultsTable::new(query.columns(), query.precision);
    for (run_id, run_dir) in runs {
        let artifact = load_result_artifact(&results_artifact_path(run_dir))?;
        table.rows.push(flatten_row(run_id, &artifact, &table.columns));
    }
    table.drop_empty_columns();
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsutil::{atomic_write_json_pretty, scratch_dir};
    use crate::run_id::build_run_id;

    fn query() -> ResultQuery {
        ResultQuery {
            measures: vec!["f1-score".to_string(), "ap".to_string()],
            run_types: vec!["run".to_string()],
            aggregations: vec!["macro".to_string(), "micro".to_string()],
            aggregation_free_measures: vec!["ap".to_string(), "auc".to_string()],
            stats: vec!["mean".to_string()],
            precision: 3,
        }
    }

    fn artifact(f1_macro: f64) -> Value {
        json!({
            "f1-score": {
                "run": {
                    "macro": {"mean": f1_macro, "std": 0.01, "folds": [0.5, 0.6]},
                    "micro": {"mean": 0.75}
                },
                "random": {"macro": {"mean": 0.1}}
            },
            "ap": {"run": {"mean": 0.42}}
        })
    }

    #[test]
    fn columns_follow_nesting_order() {
        let names: Vec<String> = query().columns().iter().map(ToString::to_string).collect();
        assert_eq!(
            names,
            vec![
                "f1-score.run.macro.mean",
                "f1-score.run.micro.mean",
                "ap.run.mean"
            ]
        );
    }

    #[test]
    fn missing_aggregation_is_skipped_not_fatal() {
        let q = ResultQuery {
            aggregations: vec!["macro".to_string(), "weighted".to_string()],
            ..query()
        };
        let run_id = build_run_id([&json!(256)]);
        let row = flatten_row(&run_id, &artifact(0.81234), &q.columns());
        assert_eq!(row.cells[0], Some(Cell::Number(0.81234)));
        assert_eq!(row.cells[1], None);
        assert_eq!(row.cells[2], Some(Cell::Number(0.42)));
    }

    #[test]
    fn aggregation_free_measures_read_statistics_directly() {
        let q = ResultQuery {
            measures: vec!["ap".to_string(), "auc".to_string()],
            ..query()
        };
        let columns = q.columns();
        let names: Vec<String> = columns.iter().map(ToString::to_string).collect();
        assert_eq!(names, vec!["ap.run.mean", "auc.run.mean"]);
        let run_id = build_run_id([&json!(1)]);
        let row = flatten_row(&run_id, &artifact(0.5), &columns);
        assert_eq!(row.cells, vec![Some(Cell::Number(0.42)), None]);

        let treated_as_aggregated = ResultQuery {
            measures: vec!["ap".to_string()],
            aggregation_free_measures: Vec::new(),
            ..query()
        };
        let row = flatten_row(&run_id, &artifact(0.5), &treated_as_aggregated.columns());
        assert_eq!(row.cells, vec![None, None]);
    }

    #[test]
    fn series_cells_render_every_fold() {
        let q = ResultQuery {
            stats: vec!["folds".to_string()],
            aggregations: vec!["macro".to_string()],
            measures: vec!["f1-score".to_string()],
            ..query()
        };
        let run_id = build_run_id([&json!("a")]);
        let row = flatten_row(&run_id, &artifact(0.8), &q.columns());
        let cell = row.cells[0].as_ref().expect("cell");
        assert_eq!(cell.render(2), "0.50;0.60");
    }

    #[test]
    fn rounding_uses_fixed_precision() {
        assert_eq!(round_to(0.81236, 3), 0.812);
        assert_eq!(Cell::Number(0.81256).render(3), "0.813");
    }

    #[test]
    fn aggregate_reads_artifacts_and_writes_csv() {
        let root = scratch_dir("aggregate");
        let ids = vec![build_run_id([&json!(1)]), build_run_id([&json!(2)])];
        let dirs: Vec<PathBuf> = ids.iter().map(|id| root.join(id.as_str())).collect();
        atomic_write_json_pretty(&results_artifact_path(&dirs[0]), &artifact(0.5)).expect("write");
        atomic_write_json_pretty(&results_artifact_path(&dirs[1]), &artifact(0.6666)).expect("write");

        let q = ResultQuery {
            measures: vec!["f1-score".to_string(), "ap".to_string(), "auc".to_string()],
            ..query()
        };
        let table = aggregate(ids.iter().zip(dirs.iter().map(PathBuf::as_path)), &q)
            .expect("aggregate");
        assert_eq!(table.columns.len(), 3, "auc is absent everywhere and dropped");
        assert_eq!(table.rows.len(), 2);

        let csv_path = root.join("results.csv");
        table.write_csv(&csv_path).expect("csv");
        let text = fs::read_to_string(&csv_path).expect("read csv");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "run_id,f1-score.run.macro.mean,f1-score.run.micro.mean,ap.run.mean"
        );
        assert_eq!(lines[1], "1,0.500,0.750,0.420");
        assert_eq!(lines[2], "2,0.667,0.750,0.420");

        let rendered = table.render();
        assert!(rendered.lines().next().expect("header").starts_with("run_id"));
        assert_eq!(table.to_json()["rows"][1]["f1-score.run.macro.mean"], json!(0.667));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_artifact_is_an_error() {
        let root = scratch_dir("aggregate_missing");
        let id = build_run_id([&json!(1)]);
        let dir = root.join(id.as_str());
        let err = aggregate([(&id, dir.as_path())], &query()).expect_err("missing file");
        assert!(err.to_string().contains("reading result artifact"), "{}", err);
        let _ = fs::remove_dir_all(root);
    }
}
