//! Clean command - removes the step cache and the image store.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::config::Config;

/// Clean target for the clean command.
pub enum CleanTarget {
    /// Step cache only (default)
    Cache,
    /// Image store only
    Store,
    /// Both
    All,
}

/// Execute the clean command.
pub fn cmd_clean(config: &Config, target: CleanTarget) -> Result<()> {
    match target {
        CleanTarget::Cache => remove_dir(&config.cache_dir, "step cache")?,
        CleanTarget::Store => remove_dir(&config.store_dir, "image store")?,
        CleanTarget::All => {
            remove_dir(&config.cache_dir, "step cache")?;
            remove_dir(&config.store_dir, "image store")?;
        }
    }
    println!("Clean complete.");
    Ok(())
}

fn remove_dir(dir: &Path, what: &str) -> Result<()> {
    if dir.exists() {
        println!("Removing {} ({})...", what, dir.display());
        fs::remove_dir_all(dir).with_context(|| format!("Failed to remove {}", dir.display()))?;
    } else {
        println!("No {} at {}", what, dir.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(root: &Path) -> Config {
        Config {
            store_dir: root.join("images"),
            cache_dir: root.join("steps"),
            no_cache: false,
        }
    }

    #[test]
    fn test_clean_cache_keeps_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        fs::create_dir_all(config.store_dir.join("images")).unwrap();
        fs::create_dir_all(&config.cache_dir).unwrap();

        cmd_clean(&config, CleanTarget::Cache).unwrap();
        assert!(!config.cache_dir.exists());
        assert!(config.store_dir.exists());

        cmd_clean(&config, CleanTarget::All).unwrap();
        assert!(!config.store_dir.exists());
        // Nothing left: still succeeds.
        cmd_clean(&config, CleanTarget::All).unwrap();
    }
}
