//! FAT filesystem images built with mtools.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::path::Path;
use tracing::info;

use crate::build::{AtomicStep, Fingerprint, WorkingCopy};
use crate::common::prepare_output_file;
use crate::process::{require_tool, Cmd};

/// Format a `size`-byte FAT image at `output_file` holding the contents of
/// `input_dir` (both paths inside the image).
#[derive(Debug, Clone, Serialize)]
pub struct Vfat {
    pub input_dir: String,
    pub output_file: String,
    pub size: u64,
}

impl Vfat {
    pub fn new(input_dir: impl Into<String>, output_file: impl Into<String>, size: u64) -> Self {
        Self {
            input_dir: input_dir.into(),
            output_file: output_file.into(),
            size,
        }
    }
}

/// Top-level entries of `input`, as `./name` arguments for mcopy.
fn mcopy_sources(input: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(input).with_context(|| format!("Failed to read {}", input.display()))? {
        let entry = entry?;
        names.push(format!("./{}", entry.file_name().to_string_lossy()));
    }
    names.sort();
    Ok(names)
}

/// Create the FAT image on the host.
pub fn create_vfat(input: &Path, output: &Path, size: u64) -> Result<()> {
    if size == 0 {
        bail!("FAT image size must be greater than zero");
    }
    require_tool("mformat", "Install mtools.")?;
    let output = prepare_output_file(output)?;
    OpenOptions::new()
        .write(true)
        .open(&output)?
        .set_len(size)
        .with_context(|| format!("Failed to size {}", output.display()))?;

    Cmd::new("mformat")
        .arg("-i")
        .arg_path(&output)
        .args(["-F", "::"])
        .error_msg("mformat failed")
        .run()?;

    let sources = mcopy_sources(input)?;
    if !sources.is_empty() {
        Cmd::new("mcopy")
            .arg("-i")
            .arg_path(&output)
            .args(["-s", "-b", "-p"])
            .args(&sources)
            .arg("::/")
            .dir(input)
            .error_msg("mcopy failed")
            .run()?;
    }
    info!("FAT image created: {} ({} entries)", output.display(), sources.len());
    Ok(())
}

impl AtomicStep for Vfat {
    fn describe(&self) -> String {
        format!("vfat {} -> {} ({} bytes)", self.input_dir, self.output_file, self.size)
    }

    fn fingerprint(&self) -> Result<Option<Fingerprint>> {
        Fingerprint::of("MKVFATFS", self).map(Some)
    }

    fn run(&self, copy: &WorkingCopy) -> Result<()> {
        let input = copy.resolve(&self.input_dir)?;
        let output = copy.resolve(&self.output_file)?;
        create_vfat(&input, &output, self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mcopy_sources_are_sorted_and_relative() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("EFI")).unwrap();
        fs::write(dir.path().join("grubenv"), "").unwrap();
        assert_eq!(mcopy_sources(dir.path()).unwrap(), ["./EFI", "./grubenv"]);
    }

    #[test]
    fn test_fingerprint_covers_size() {
        let small = Vfat::new("efi", "/abforge.img", 33 << 20);
        let large = Vfat::new("efi", "/abforge.img", 64 << 20);
        assert_ne!(
            small.fingerprint().unwrap(),
            large.fingerprint().unwrap()
        );
    }

    #[test]
    fn test_zero_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(create_vfat(dir.path(), &dir.path().join("out.img"), 0).is_err());
    }
}
