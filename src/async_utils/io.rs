//! File I/O helpers for request files and metadata snapshots.
//!
//! Metadata snapshots are written while holding the job-state lock, so the
//! writers here are synchronous. Each snapshot is written to a temporary file
//! in the same directory and then renamed into place, so readers never see a
//! half-written JSON document.

use std::{fs, io::Write as _};

use serde::{Serialize, de::DeserializeOwned};
use tempfile::NamedTempFile;

use crate::prelude::*;

/// A JSON Object value, without the surrounding [`Value::Object`] wrapper.
pub type JsonObject = serde_json::Map<String, Value>;

/// Read TOML or JSON from a file. Files ending in `.json` are parsed as JSON,
/// and everything else as TOML.
pub async fn read_json_or_toml<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read file at path: {:?}", path))?;
    let is_json = path.extension().is_some_and(|ext| ext == "json")
        || data.trim_start().starts_with('{');
    if is_json {
        serde_json::from_str(&data).with_context(|| {
            format!("Failed to parse JSON from file at path: {:?}", path)
        })
    } else {
        toml::from_str(&data).with_context(|| {
            format!("Failed to parse TOML from file at path: {:?}", path)
        })
    }
}

/// Write `value` as pretty-printed JSON, replacing `path` atomically.
pub fn write_json_file<T>(path: &Path, value: &T) -> Result<()>
where
    T: Serialize + ?Sized,
{
    let dir = path
        .parent()
        .ok_or_else(|| anyhow!("No parent directory for {:?}", path))?;
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory {:?}", dir))?;
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temporary file in {:?}", dir))?;
    serde_json::to_writer_pretty(&mut tmp, value)
        .with_context(|| format!("Failed to serialize JSON for {:?}", path))?;
    tmp.write_all(b"\n")
        .with_context(|| format!("Failed to write {:?}", path))?;
    tmp.persist(path)
        .with_context(|| format!("Failed to replace {:?}", path))?;
    Ok(())
}

/// Read a JSON object from `path`, if it exists and parses as an object.
///
/// Snapshots are advisory, so anything unreadable is logged and treated as
/// missing rather than failing the caller.
pub fn read_json_object_if_exists(path: &Path) -> Option<JsonObject> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
        Err(err) => {
            warn!(path = %path.display(), %err, "Could not read metadata file");
            return None;
        }
    };
    match serde_json::from_str::<Value>(&data) {
        Ok(Value::Object(map)) => Some(map),
        Ok(_) => {
            warn!(path = %path.display(), "Metadata file is not a JSON object");
            None
        }
        Err(err) => {
            warn!(path = %path.display(), %err, "Could not parse metadata file");
            None
        }
    }
}

/// Append one JSON record as a line to a JSONL file.
pub fn append_jsonl<T>(path: &Path, record: &T) -> Result<()>
where
    T: Serialize + ?Sized,
{
    let mut line = serde_json::to_string(record)
        .with_context(|| format!("Failed to serialize JSONL record for {:?}", path))?;
    line.push('\n');
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {:?} for appending", path))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("Failed to append to {:?}", path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Sample {
        title: String,
        models: Vec<String>,
    }

    #[tokio::test]
    async fn reads_json_and_toml() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let json_path = dir.path().join("req.json");
        fs::write(&json_path, r#"{"title": "a", "models": ["m"]}"#)?;
        let toml_path = dir.path().join("req.toml");
        fs::write(&toml_path, "title = \"a\"\nmodels = [\"m\"]\n")?;

        let from_json: Sample = read_json_or_toml(&json_path).await?;
        let from_toml: Sample = read_json_or_toml(&toml_path).await?;
        assert_eq!(from_json, from_toml);
        Ok(())
    }

    #[test]
    fn writes_and_reads_back_objects() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("meta.json");
        assert!(read_json_object_if_exists(&path).is_none());

        write_json_file(&path, &json!({"status": "queued"}))?;
        let map = read_json_object_if_exists(&path).expect("should exist");
        assert_eq!(map["status"], "queued");

        fs::write(&path, "not json")?;
        assert!(read_json_object_if_exists(&path).is_none());
        Ok(())
    }

    #[test]
    fn appends_jsonl_lines() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("errors.jsonl");
        append_jsonl(&path, &json!({"page": 1}))?;
        append_jsonl(&path, &json!({"page": 2}))?;
        let text = fs::read_to_string(&path)?;
        assert_eq!(text.lines().count(), 2);
        Ok(())
    }
}
