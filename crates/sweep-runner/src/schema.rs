use anyhow::{anyhow, Result};
use include_dir::{include_dir, Dir};
use jsonschema::JSONSchema;
use serde_json::Value;

static SCHEMA_DIR: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/schemas");

pub const GRID_CONFIG_SCHEMA: &str = "grid_config_v1.jsonschema";
pub const RESULT_ARTIFACT_SCHEMA: &str = "result_artifact_v1.jsonschema";

pub fn compile_schema(name: &str) -> Result<JSONSchema> {
    let file = SCHEMA_DIR
        .get_file(name)
        .ok_or_else(|| anyhow!("unknown schema: {}", name))?;
    let text = file
        .contents_utf8()
        .ok_or_else(|| anyhow!("schema {} is not valid utf-8", name))?;
    let schema: Value = serde_json::from_str(text)?;
    JSONSchema::compile(&schema).map_err(|e| anyhow!("schema {} failed to compile: {}", name, e))
}

/// Validation messages for `instance`; empty when it conforms.
pub fn schema_violations(name: &str, instance: &Value) -> Result<Vec<String>> {
    let schema = compile_schema(name)?;
    let mut msgs = Vec::new();
    if let Err(errors) = schema.validate(instance) {
        for e in errors {
            msgs.push(format!("{} (at '{}')", e, e.instance_path));
        }
    }
    Ok(msgs)
}
