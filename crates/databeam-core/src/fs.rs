//! Small filesystem helpers: directory creation and whole-file string I/O.

use crate::error::CoreResult;
use std::fs;
use std::path::Path;

/// Create a directory and all missing parents. Succeeds if it already
/// exists.
pub fn create_directory(path: &Path) -> CoreResult<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Read a file into a string; `None` if the file does not exist.
pub fn read_to_string_opt(path: &Path) -> CoreResult<Option<String>> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write a string, creating parent directories as needed.
pub fn write_string(path: &Path, contents: &str) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_with_missing_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/c.json");
        write_string(&path, "{\"x\":1}").unwrap();
        assert_eq!(read_to_string_opt(&path).unwrap().unwrap(), "{\"x\":1}");
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_to_string_opt(&dir.path().join("nope.json"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn create_directory_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let d = dir.path().join("x/y");
        create_directory(&d).unwrap();
        create_directory(&d).unwrap();
        assert!(d.is_dir());
    }
}
