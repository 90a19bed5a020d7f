//! Write-tmp-then-rename helper shared by every persisted file.

use std::path::Path;

use serde::Serialize;

use crate::error::{Error, Result};

/// Serialize `value` as pretty JSON and write it to `path` atomically: the
/// new content lands in `<path>.tmp` first, then `fs::rename` swaps it into
/// place. A crash between those two steps leaves the previous file (or no
/// file) intact — never a half-written one.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| Error::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
    }

    let content = serde_json::to_string_pretty(value).map_err(|e| Error::Serialize {
        path: path.to_path_buf(),
        source: e,
    })?;

    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, content).map_err(|e| Error::Write {
        path: tmp_path.clone(),
        source: e,
    })?;

    std::fs::rename(&tmp_path, path).map_err(|e| Error::Write {
        path: path.to_path_buf(),
        source: e,
    })?;

    Ok(())
}

/// Parse JSON from `path`, returning `default()` if the file does not exist
/// yet (first run).
pub fn read_json_or_default<T>(path: &Path) -> Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    if !path.exists() {
        return Ok(T::default());
    }

    let content = std::fs::read_to_string(path).map_err(|e| Error::Read {
        path: path.to_path_buf(),
        source: e,
    })?;

    serde_json::from_str(&content).map_err(|e| Error::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn round_trips_through_atomic_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");

        let mut data = HashMap::new();
        data.insert("a".to_string(), 1u32);
        write_json_atomic(&path, &data).unwrap();

        let read_back: HashMap<String, u32> = read_json_or_default(&path).unwrap();
        assert_eq!(read_back, data);

        // No leftover .tmp file.
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn missing_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let read_back: HashMap<String, u32> = read_json_or_default(&path).unwrap();
        assert!(read_back.is_empty());
    }

    #[test]
    fn overwrite_replaces_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");

        let mut first = HashMap::new();
        first.insert("a".to_string(), 1u32);
        write_json_atomic(&path, &first).unwrap();

        let mut second = HashMap::new();
        second.insert("b".to_string(), 2u32);
        write_json_atomic(&path, &second).unwrap();

        let read_back: HashMap<String, u32> = read_json_or_default(&path).unwrap();
        assert_eq!(read_back, second);
    }
}
