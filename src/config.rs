//! Configuration management for abforge.
//!
//! Reads configuration from a .env file and environment variables.
//! Environment variables take precedence over the .env file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// abforge configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Root of the content-addressed image store (ABFORGE_STORE_DIR)
    pub store_dir: PathBuf,
    /// Root of the step cache (ABFORGE_CACHE_DIR)
    pub cache_dir: PathBuf,
    /// Run engines without a step cache (ABFORGE_NO_CACHE)
    pub no_cache: bool,
}

impl Config {
    /// Load configuration from `<base_dir>/.env` and the process environment.
    pub fn load(base_dir: &Path) -> Self {
        let mut vars = HashMap::new();

        let env_path = base_dir.join(".env");
        if let Ok(iter) = dotenvy::from_path_iter(&env_path) {
            for (key, value) in iter.flatten() {
                vars.insert(key, value);
            }
        }

        // Environment variables override .env file
        for (key, value) in std::env::vars() {
            vars.insert(key, value);
        }

        Self::from_vars(base_dir, &vars)
    }

    /// Build a configuration from an explicit variable map.
    pub fn from_vars(base_dir: &Path, vars: &HashMap<String, String>) -> Self {
        let default_root = dirs::cache_dir()
            .unwrap_or_else(|| base_dir.join(".cache"))
            .join("abforge");

        let path_var = |key: &str, default: PathBuf| {
            vars.get(key)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    let path = PathBuf::from(s);
                    if path.is_absolute() {
                        path
                    } else {
                        base_dir.join(path)
                    }
                })
                .unwrap_or(default)
        };

        let store_dir = path_var("ABFORGE_STORE_DIR", default_root.join("images"));
        let cache_dir = path_var("ABFORGE_CACHE_DIR", default_root.join("steps"));
        let no_cache = vars
            .get("ABFORGE_NO_CACHE")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Self {
            store_dir,
            cache_dir,
            no_cache,
        }
    }

    /// Print configuration for debugging.
    pub fn print(&self) {
        println!("Configuration:");
        println!("  ABFORGE_STORE_DIR: {}", self.store_dir.display());
        println!("  ABFORGE_CACHE_DIR: {}", self.cache_dir.display());
        println!("  ABFORGE_NO_CACHE: {}", self.no_cache);
        if self.no_cache {
            println!("  Step cache: DISABLED");
        } else if self.cache_dir.exists() {
            println!("  Step cache: PRESENT");
        } else {
            println!("  Step cache: EMPTY (created on first build)");
        }
    }
}
