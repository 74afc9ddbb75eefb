//! Cross-product expansion of a grid configuration into concrete runs.
//!
//! Axes are ordered by their dotted key path. Combinations are enumerated as
//! an odometer with the rightmost axis varying fastest, so
//! `{hidden_size: [256, 512], num_layers: [1, 2]}` expands to
//! `256_1, 256_2, 512_1, 512_2`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};

use crate::config::GridConfig;
use crate::error::ConfigError;
use crate::params::{traverse, KeyPath, SweepAxis, PARAMS_KEY};
use crate::run_id::{build_run_id, RunId};

pub const FOLDERS_KEY: &str = "folders";
pub const RESULTS_FOLDER: &str = "results";
pub const LOGS_FOLDER: &str = "logs";

/// Folders under `folders` that name source-relative inputs.
const SOURCE_RELATIVE_FOLDERS: &[&str] = &["raw_data", "serialization"];

/// One fully resolved combination, ready to be persisted and launched.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterializedRun {
    pub run_id: RunId,
    pub run_dir: PathBuf,
    pub combination: Vec<(KeyPath, Value)>,
    pub config: Value,
}

#[derive(Debug, Clone)]
pub struct Expansion {
    pub axes: Vec<SweepAxis>,
    pub runs: Vec<MaterializedRun>,
}

impl Expansion {
    pub fn run_ids(&self) -> Vec<&RunId> {
        self.runs.iter().map(|r| &r.run_id).collect()
    }
}

pub fn expand(config: &GridConfig) -> Result<Expansion, ConfigError> {
    expand_document(
        &config.document,
        &config.experiments.run_dir,
        &config.experiments.sources_dir,
    )
}

/// Expands `document` into one [`MaterializedRun`] per combination. Each run
/// directory is `run_root/<run id>`.
pub fn expand_document(
    document: &Value,
    run_root: &Path,
    sources_dir: &Path,
) -> Result<Expansion, ConfigError> {
    let axes = collect_sweep_axes(document)?;
    let mut runs = Vec::new();
    for values in combinations(&axes) {
        let run_id = build_run_id(values.iter());
        let run_dir = run_root.join(run_id.as_str());
        let mut config = document.clone();
        let mut combination = Vec::with_capacity(axes.len());
        for (axis, value) in axes.iter().zip(values) {
            set_value_at_path(&mut config, &axis.path, value.clone())?;
            combination.push((axis.path.clone(), value));
        }
        resolve_folders(&mut config, &run_dir, sources_dir)?;
        runs.push(MaterializedRun {
            run_id,
            run_dir,
            combination,
            config,
        });
    }
    ensure_unique_run_ids(&runs)?;
    Ok(Expansion { axes, runs })
}

/// Two combinations must never share a run directory.
fn ensure_unique_run_ids(runs: &[MaterializedRun]) -> Result<(), ConfigError> {
    let mut seen: HashMap<&RunId, &MaterializedRun> = HashMap::with_capacity(runs.len());
    for run in runs {
        if let Some(first) = seen.insert(&run.run_id, run) {
            return Err(ConfigError::Invalid(format!(
                "run id `{}` is shared by combinations [{}] and [{}]",
                run.run_id,
                describe_combination(first),
                describe_combination(run)
            )));
        }
    }
    Ok(())
}

fn describe_combination(run: &MaterializedRun) -> String {
    run.combination
        .iter()
        .map(|(path, value)| format!("{}={}", path, value))
        .collect::<Vec<_>>()
        .join(", ")
}

/// All axes under `params`, sorted by their dotted key path.
pub fn collect_sweep_axes(document: &Value) -> Result<Vec<SweepAxis>, ConfigError> {
    let mut axes = traverse(document, Some(PARAMS_KEY))?;
    axes.sort_by_cached_key(|axis| axis.path.to_string());
    Ok(axes)
}

/// Odometer enumeration of the cross product; the last axis turns fastest.
/// No axes yields the single empty combination, an empty axis yields none.
pub fn combinations(axes: &[SweepAxis]) -> Vec<Vec<Value>> {
    if axes.iter().any(|a| a.candidates.is_empty()) {
        return Vec::new();
    }
    let total: usize = axes.iter().map(SweepAxis::cardinality).product();
    let mut out = Vec::with_capacity(total);
    let mut indices = vec![0usize; axes.len()];
    loop {
        out.push(
            axes.iter()
                .zip(&indices)
                .map(|(axis, &i)| axis.candidates[i].clone())
                .collect(),
        );
        let mut pos = axes.len();
        loop {
            if pos == 0 {
                return out;
            }
            pos -= 1;
            indices[pos] += 1;
            if indices[pos] < axes[pos].cardinality() {
                break;
            }
            indices[pos] = 0;
        }
    }
}

/// Sets `value` at `path`, creating missing intermediate mappings.
pub fn set_value_at_path(root: &mut Value, path: &KeyPath, value: Value) -> Result<(), ConfigError> {
    let Some((last, parents)) = path.segments().split_last() else {
        *root = value;
        return Ok(());
    };
    let conflict = |segment: &String| ConfigError::PathConflict {
        path: path.to_string(),
        segment: segment.clone(),
    };
    let mut cur = root;
    for segment in parents {
        let Value::Object(map) = cur else {
            return Err(conflict(segment));
        };
        let child = map.entry(segment.clone()).or_insert_with(|| json!({}));
        if !child.is_object() {
            return Err(conflict(segment));
        }
        cur = child;
    }
    match cur {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        _ => Err(conflict(last)),
    }
}

/// Absolute folders are kept, relative ones are joined onto `sources_dir`.
pub fn resolve_folder(folder: &str, sources_dir: &Path) -> PathBuf {
    let path = Path::new(folder);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        sources_dir.join(path)
    }
}

fn resolve_folders(config: &mut Value, run_dir: &Path, sources_dir: &Path) -> Result<(), ConfigError> {
    let root = config
        .as_object_mut()
        .ok_or_else(|| ConfigError::Invalid("expected a mapping at the document root".to_string()))?;
    let folders = root
        .entry(FOLDERS_KEY.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    let folders = folders.as_object_mut().ok_or_else(|| {
        ConfigError::Invalid(format!("`{}` must be a mapping", FOLDERS_KEY))
    })?;

    for key in SOURCE_RELATIVE_FOLDERS {
        if let Some(Value::String(folder)) = folders.get(*key) {
            let resolved = resolve_folder(folder, sources_dir);
            folders.insert(key.to_string(), path_value(&resolved));
        }
    }
    folders.insert("run".to_string(), path_value(run_dir));
    folders.insert(RESULTS_FOLDER.to_string(), path_value(&run_dir.join(RESULTS_FOLDER)));
    folders.insert(LOGS_FOLDER.to_string(), path_value(&run_dir.join(LOGS_FOLDER)));
    Ok(())
}

fn path_value(path: &Path) -> Value {
    Value::String(path.to_string_lossy().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn base_doc(params: Value) -> Value {
        json!({
            "params": params,
            "folders": {"raw_data": "data", "serialization": "/abs/ser"},
            "experiments": {"run_dir": "/runs", "sources_dir": "/root"},
            "log_level": "info"
        })
    }

    fn expand_params(params: Value) -> Expansion {
        expand_document(&base_doc(params), Path::new("/runs"), Path::new("/root"))
            .expect("expansion")
    }

    #[test]
    fn two_by_two_grid_in_odometer_order() {
        let exp = expand_params(json!({"hidden_size": [256, 512], "num_layers": [1, 2]}));
        let ids: Vec<&str> = exp.runs.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, vec!["256_1", "256_2", "512_1", "512_2"]);
        let first = &exp.runs[0].config;
        assert_eq!(first.pointer("/params/hidden_size"), Some(&json!(256)));
        assert_eq!(first.pointer("/params/num_layers"), Some(&json!(1)));
        assert_eq!(exp.runs[3].run_dir, PathBuf::from("/runs/512_2"));
    }

    #[test]
    fn run_count_is_product_and_covers_cross_product() {
        let exp = expand_params(json!({
            "a": [1, 2, 3],
            "b": {"c": ["x", "y"], "d": [true, false]},
            "fixed": "same"
        }));
        assert_eq!(exp.axes.len(), 4);
        assert_eq!(exp.runs.len(), 12);
        let combos: BTreeSet<String> = exp
            .runs
            .iter()
            .map(|r| serde_json::to_string(&r.combination.iter().map(|(_, v)| v).collect::<Vec<_>>()).expect("json"))
            .collect();
        assert_eq!(combos.len(), 12);
        let ids: BTreeSet<&str> = exp.runs.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids.len(), 12);
        assert!(exp.runs.iter().all(|r| r.config.pointer("/params/fixed") == Some(&json!("same"))));
    }

    #[test]
    fn expansion_is_idempotent() {
        let params = json!({"lr": [0.1, 0.01], "model": {"kind": ["mlp", "lstm"]}});
        let a = expand_params(params.clone());
        let b = expand_params(params);
        assert_eq!(a.run_ids(), b.run_ids());
        assert_eq!(a.runs, b.runs);
    }

    #[test]
    fn empty_axis_yields_no_runs() {
        let exp = expand_params(json!({"lr": [], "layers": [1, 2]}));
        assert!(exp.runs.is_empty());
    }

    #[test]
    fn no_axes_yields_single_base_run() {
        let exp = expand_params(json!({}));
        assert_eq!(exp.runs.len(), 1);
        assert_eq!(exp.runs[0].run_id.as_str(), "base");
    }

    #[test]
    fn folders_are_resolved_per_run() {
        let exp = expand_params(json!({"lr": [0.1]}));
        let folders = &exp.runs[0].config["folders"];
        assert_eq!(folders["raw_data"], json!("/root/data"));
        assert_eq!(folders["serialization"], json!("/abs/ser"));
        assert_eq!(folders["run"], json!("/runs/0.1"));
        assert_eq!(folders["results"], json!("/runs/0.1/results"));
        assert_eq!(folders["logs"], json!("/runs/0.1/logs"));
    }

    #[test]
    fn resolve_folder_handles_relative_and_absolute() {
        assert_eq!(resolve_folder("data", Path::new("/root")), PathBuf::from("/root/data"));
        assert_eq!(resolve_folder("/abs/data", Path::new("/root")), PathBuf::from("/abs/data"));
    }

    #[test]
    fn base_document_is_never_mutated() {
        let doc = base_doc(json!({"lr": [0.1, 0.2]}));
        let before = doc.clone();
        let exp = expand_document(&doc, Path::new("/runs"), Path::new("/root")).expect("expand");
        assert_eq!(doc, before);
        assert_ne!(exp.runs[0].config, exp.runs[1].config);
    }

    #[test]
    fn set_value_creates_intermediate_mappings() {
        let mut doc = json!({"params": {}});
        let path = KeyPath::from_segments(["params", "optim", "lr"]);
        set_value_at_path(&mut doc, &path, json!(0.5)).expect("set");
        assert_eq!(doc, json!({"params": {"optim": {"lr": 0.5}}}));

        let mut doc = json!({"params": {"optim": 3}});
        let err = set_value_at_path(&mut doc, &path, json!(0.5)).expect_err("conflict");
        assert!(matches!(err, ConfigError::PathConflict { ref segment, .. } if segment == "optim"));
    }

    fn colliding_id(params: Value) -> String {
        let err = expand_document(&base_doc(params), Path::new("/runs"), Path::new("/root"))
            .expect_err("colliding run ids must be rejected");
        match err {
            ConfigError::Invalid(msg) => msg,
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn colliding_run_ids_are_rejected() {
        let msg = colliding_id(json!({"embedding": ["/a/glove.txt", "/b/glove.txt"]}));
        assert!(msg.contains("`glove`"), "{}", msg);
        assert!(msg.contains("params.embedding=\"/a/glove.txt\""), "{}", msg);
        assert!(msg.contains("params.embedding=\"/b/glove.txt\""), "{}", msg);

        colliding_id(json!({"name": ["glove 50", "glove-50"]}));
        colliding_id(json!({"lr": ["0.1", 0.1]}));
        colliding_id(json!({"a": ["a_b", "a"], "b": ["c", "b_c"]}));
    }

    #[test]
    fn distinct_tokens_expand_without_collision() {
        let exp = expand_params(json!({"embedding": ["/a/glove.txt", "/b/word2vec.txt"], "tag": ["", "base"]}));
        let ids: Vec<&str> = exp.runs.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, vec!["glove_empty", "glove_base", "word2vec_empty", "word2vec_base"]);
    }

    #[test]
    fn set_value_reports_the_scalar_segment() {
        let mut doc = json!({"params": {"model": {"optim": "sgd"}}});
        let path = KeyPath::from_segments(["params", "model", "optim", "lr"]);
        let err = set_value_at_path(&mut doc, &path, json!(0.5)).expect_err("conflict");
        assert!(matches!(err, ConfigError::PathConflict { ref segment, .. } if segment == "optim"));
        assert_eq!(doc, json!({"params": {"model": {"optim": "sgd"}}}));

        let mut doc = json!({"params": {"lr": 1}});
        set_value_at_path(&mut doc, &KeyPath::from_segments(["params", "lr"]), json!(2))
            .expect("leaf overwrite");
        assert_eq!(doc, json!({"params": {"lr": 2}}));
    }

    #[test]
    fn tagged_fixed_list_does_not_branch() {
        let exp = expand_params(json!({"layers": {"$fixed": [64, 64]}, "lr": [0.1, 0.2]}));
        assert_eq!(exp.runs.len(), 2);
        assert_eq!(exp.runs[0].run_id.as_str(), "64-64_0.1");
        assert_eq!(exp.runs[0].config.pointer("/params/layers"), Some(&json!([64, 64])));
    }

    #[test]
    fn materialized_config_survives_yaml_round_trip() {
        let exp = expand_params(json!({"lr": [0.5, 1.0], "name": ["a/b.yml"]}));
        for run in &exp.runs {
            let text = serde_yaml::to_string(&run.config).expect("to yaml");
            let back: serde_yaml::Value = serde_yaml::from_str(&text).expect("from yaml");
            let back: Value = serde_json::to_value(back).expect("to json");
            assert_eq!(back, run.config);
        }
    }
}
