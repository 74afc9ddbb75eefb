use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::Path;

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("creating directory {}", path.display()))
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path).with_context(|| format!("writing {}", path.display()))?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

/// Creates an empty sentinel file, leaving an existing one untouched.
pub fn touch(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("touching {}", path.display()))?;
    Ok(())
}

/// Returns whether a file was actually removed.
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
    }
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

/// Digest over the compact JSON rendering. Object keys are already sorted.
pub fn canonical_json_digest(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    sha256_bytes(&bytes)
}

pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

#[cfg(test)]
pub(crate) fn scratch_dir(label: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "sweep_{}_{}_{}",
        label,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    ensure_dir(&dir).expect("scratch dir");
    dir
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn shell_quote_leaves_plain_tokens_alone() {
        assert_eq!(shell_quote("/opt/src/main.py"), "/opt/src/main.py");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("my dir"), "'my dir'");
        assert_eq!(shell_quote("it's"), "'it'\"'\"'s'");
    }

    #[test]
    fn touch_and_remove_sentinel() {
        let dir = scratch_dir("touch");
        let marker = dir.join("nested").join("completed");
        touch(&marker).expect("touch");
        assert!(marker.exists());
        touch(&marker).expect("touch is idempotent");
        assert!(remove_if_exists(&marker).expect("remove"));
        assert!(!remove_if_exists(&marker).expect("second remove"));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn digest_ignores_key_insertion_order() {
        let a = json!({"b": 1, "a": [1, 2]});
        let mut b = serde_json::Map::new();
        b.insert("a".to_string(), json!([1, 2]));
        b.insert("b".to_string(), json!(1));
        assert_eq!(canonical_json_digest(&a), canonical_json_digest(&Value::Object(b)));
        assert!(canonical_json_digest(&a).starts_with("sha256:"));
    }
}
