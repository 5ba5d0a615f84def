//! Utilities for file operations with automatic parent directory creation.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Write a file, creating parent directories as needed.
pub fn write_file_with_dirs<P: AsRef<Path>, C: AsRef<[u8]>>(path: P, content: C) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Write a file with specific Unix permissions, creating parent directories as needed.
///
/// # Arguments
/// * `path` - Path to the file to write
/// * `content` - Content to write
/// * `mode` - Unix permission bits (e.g., 0o644, 0o500)
pub fn write_file_mode<P: AsRef<Path>, C: AsRef<[u8]>>(
    path: P,
    content: C,
    mode: u32,
) -> Result<()> {
    let path = path.as_ref();
    write_file_with_dirs(path, content)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Create (or empty) an output file, creating its parent directories.
///
/// Returns the absolute path of the prepared file.
pub fn prepare_output_file(path: &Path) -> Result<PathBuf> {
    let path = std::path::absolute(path)
        .with_context(|| format!("Failed to resolve {}", path.display()))?;
    write_file_with_dirs(&path, b"")?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_file_mode_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sbin/tool");
        write_file_mode(&path, "#!/bin/sh\n", 0o500).unwrap();

        let meta = fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o500);
        assert_eq!(fs::read_to_string(&path).unwrap(), "#!/bin/sh\n");
    }

    #[test]
    fn test_prepare_output_file_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/disk.img");
        write_file_with_dirs(&path, b"stale").unwrap();

        let prepared = prepare_output_file(&path).unwrap();
        assert!(prepared.is_absolute());
        assert_eq!(fs::metadata(&prepared).unwrap().len(), 0);
    }
}
