//! Sweep specification parsing and key-path traversal.
//!
//! Every leaf under the `params` subtree becomes one [`SweepAxis`]. A plain
//! sequence is a sweep, a scalar is a fixed setting. Two tagged forms remove
//! the ambiguity for list-valued settings:
//!
//! ```yaml
//! params:
//!   layers: {$fixed: [64, 64]}          # one value, which is a list
//!   window: {$sweep: [[1, 2], [3, 4]]}  # two candidates, each a list
//! ```

use std::fmt;

use serde_json::Value;

use crate::error::ConfigError;

pub const PARAMS_KEY: &str = "params";
pub const FIXED_TAG: &str = "$fixed";
pub const SWEEP_TAG: &str = "$sweep";

/// Ordered keys addressing one location from the document root.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyPath(Vec<String>);

impl KeyPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn child(&self, key: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(key.to_string());
        Self(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// RFC 6901 rendering, usable with [`Value::pointer`].
    pub fn to_pointer(&self) -> String {
        self.0
            .iter()
            .map(|s| format!("/{}", s.replace('~', "~0").replace('/', "~1")))
            .collect()
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

/// A parsed `params` leaf.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Fixed(Value),
    Sweep(Vec<Value>),
}

impl ParamValue {
    /// Parses `value` found at `path`. Returns `None` for interior mappings,
    /// which the traversal recurses into instead.
    pub fn from_leaf(path: &KeyPath, value: &Value) -> Result<Option<Self>, ConfigError> {
        match value {
            Value::Null => Err(ConfigError::MalformedSweep {
                path: path.to_string(),
                reason: "null is neither a scalar nor a sequence".to_string(),
            }),
            Value::Bool(_) | Value::Number(_) | Value::String(_) => {
                Ok(Some(ParamValue::Fixed(value.clone())))
            }
            Value::Array(items) => Ok(Some(ParamValue::Sweep(items.clone()))),
            Value::Object(map) => {
                if map.len() != 1 {
                    return Ok(None);
                }
                if let Some(inner) = map.get(FIXED_TAG) {
                    return Ok(Some(ParamValue::Fixed(inner.clone())));
                }
                match map.get(SWEEP_TAG) {
                    Some(Value::Array(items)) => Ok(Some(ParamValue::Sweep(items.clone()))),
                    Some(other) => Err(ConfigError::MalformedSweep {
                        path: path.to_string(),
                        reason: format!("{} must hold a sequence, found {}", SWEEP_TAG, other),
                    }),
                    None => Ok(None),
                }
            }
        }
    }

    pub fn candidates(self) -> Vec<Value> {
        match self {
            ParamValue::Fixed(v) => vec![v],
            ParamValue::Sweep(items) => items,
        }
    }
}

/// One dimension of the experiment grid.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepAxis {
    pub path: KeyPath,
    pub candidates: Vec<Value>,
}

impl SweepAxis {
    pub fn cardinality(&self) -> usize {
        self.candidates.len()
    }
}

/// Collects one axis per leaf under `start` (or under every top-level key when
/// `start` is `None`). Sibling keys are visited in lexicographic order.
pub fn traverse(tree: &Value, start: Option<&str>) -> Result<Vec<SweepAxis>, ConfigError> {
    let map = tree
        .as_object()
        .ok_or_else(|| ConfigError::Invalid("expected a mapping at the document root".to_string()))?;
    let mut axes = Vec::new();
    match start {
        Some(key) => {
            let value = map
                .get(key)
                .ok_or_else(|| ConfigError::MissingParams(key.to_string()))?;
            visit(key, value, &KeyPath::root(), &mut axes)?;
        }
        None => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                visit(key, &map[key.as_str()], &KeyPath::root(), &mut axes)?;
            }
        }
    }
    Ok(axes)
}

fn visit(
    key: &str,
    value: &Value,
    prefix: &KeyPath,
    axes: &mut Vec<SweepAxis>,
) -> Result<(), ConfigError> {
    let path = prefix.child(key);
    if let Some(param) = ParamValue::from_leaf(&path, value)? {
        axes.push(SweepAxis {
            path,
            candidates: param.candidates(),
        });
        return Ok(());
    }
    if let Value::Object(map) = value {
        let mut keys: Vec<&String> = map.keys().collect();
        keys.sort();
        for child in keys {
            visit(child, &map[child.as_str()], &path, axes)?;
        }
    }
    Ok(())
}
