//! Grubenv command - creates and edits GRUB environment block files.

use anyhow::{bail, Result};
use std::path::Path;

use crate::grub::GrubEnv;

/// Grubenv action.
pub enum GrubenvAction {
    /// Write a new block holding `assignments`
    Create(Vec<String>),
    /// Set `key=value` assignments in an existing block
    Set(Vec<String>),
    /// Remove variables from an existing block
    Unset(Vec<String>),
    /// Print every variable
    List,
}

/// Execute the grubenv command.
pub fn cmd_grubenv(file: &Path, action: GrubenvAction) -> Result<()> {
    match action {
        GrubenvAction::Create(assignments) => {
            let env = GrubEnv::from_assignments(&assignments)?;
            env.write_file(file)?;
            println!("Created {}", file.display());
        }
        GrubenvAction::Set(assignments) => {
            if assignments.is_empty() {
                bail!("Nothing to set. Pass key=value assignments.");
            }
            let mut env = GrubEnv::read_file(file)?;
            for (key, value) in GrubEnv::from_assignments(&assignments)?.iter() {
                env.set(key, value)?;
            }
            env.write_file(file)?;
        }
        GrubenvAction::Unset(keys) => {
            let mut env = GrubEnv::read_file(file)?;
            for key in &keys {
                if !env.unset(key) {
                    println!("  {} was not set", key);
                }
            }
            env.write_file(file)?;
        }
        GrubenvAction::List => {
            for (key, value) in GrubEnv::read_file(file)?.iter() {
                println!("{}={}", key, value);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_set_unset() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("grubenv");

        let initial = vec!["abforge_stable=a".to_string(), "abforge_new=n".to_string()];
        cmd_grubenv(&file, GrubenvAction::Create(initial)).unwrap();
        cmd_grubenv(&file, GrubenvAction::Set(vec!["abforge_new=b".into()])).unwrap();
        cmd_grubenv(&file, GrubenvAction::Unset(vec!["abforge_stable".into()])).unwrap();

        let env = GrubEnv::read_file(&file).unwrap();
        assert_eq!(env.get("abforge_new"), Some("b"));
        assert_eq!(env.get("abforge_stable"), None);
    }

    #[test]
    fn test_set_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("missing");
        assert!(cmd_grubenv(&file, GrubenvAction::Set(vec!["a=b".into()])).is_err());
        assert!(cmd_grubenv(&file, GrubenvAction::Set(vec![])).is_err());
    }
}
