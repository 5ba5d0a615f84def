//! Squashfs packing using mksquashfs.
//!
//! Output is reproducible: fixed timestamps, no xattrs and a fresh archive
//! every time. When the output file lies inside the input tree it is
//! excluded from the archive.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::build::{AtomicStep, Fingerprint, WorkingCopy};
use crate::common::prepare_output_file;
use crate::process::{require_tool, Cmd};

/// Compression used for every image; all kernels support gzip.
pub const SQUASHFS_COMPRESSION: &str = "gzip";

/// Pack `input_dir` (a path inside the image) into `output_file`.
#[derive(Debug, Clone, Serialize)]
pub struct Mksquashfs {
    pub input_dir: String,
    pub output_file: String,
    /// Value for both `-mkfs-time` and `-all-time`.
    pub timestamp: u64,
}

impl Mksquashfs {
    pub fn new(input_dir: impl Into<String>, output_file: impl Into<String>) -> Self {
        Self {
            input_dir: input_dir.into(),
            output_file: output_file.into(),
            timestamp: 0,
        }
    }
}

/// Arguments for mksquashfs, excluding the output if it sits inside the input.
pub fn mksquashfs_args(input: &Path, output: &Path, timestamp: u64) -> Vec<String> {
    let mut args = vec![
        input.to_string_lossy().into_owned(),
        output.to_string_lossy().into_owned(),
        "-noappend".to_string(),
        "-no-xattrs".to_string(),
        "-comp".to_string(),
        SQUASHFS_COMPRESSION.to_string(),
        "-mkfs-time".to_string(),
        timestamp.to_string(),
        "-all-time".to_string(),
        timestamp.to_string(),
    ];
    if let Ok(rel) = output.strip_prefix(input) {
        args.push("-e".to_string());
        args.push(rel.to_string_lossy().into_owned());
    }
    args
}

/// Create a squashfs image of `input` at `output` on the host.
pub fn create_squashfs(input: &Path, output: &Path, timestamp: u64) -> Result<()> {
    require_tool("mksquashfs", "Install squashfs-tools.")?;
    let output = prepare_output_file(output)?;
    fs::remove_file(&output)?;

    Cmd::new("mksquashfs")
        .args(mksquashfs_args(input, &output, timestamp))
        .error_msg("mksquashfs failed. Install squashfs-tools: sudo dnf install squashfs-tools")
        .run()?;

    let size = fs::metadata(&output)
        .with_context(|| format!("mksquashfs produced no {}", output.display()))?
        .len();
    info!("Squashfs created: {} ({} KiB)", output.display(), size / 1024);
    Ok(())
}

impl AtomicStep for Mksquashfs {
    fn describe(&self) -> String {
        format!("mksquashfs {} -> {}", self.input_dir, self.output_file)
    }

    fn fingerprint(&self) -> Result<Option<Fingerprint>> {
        Fingerprint::of("MKSQUASHFS", self).map(Some)
    }

    fn run(&self, copy: &WorkingCopy) -> Result<()> {
        let input = copy.resolve(&self.input_dir)?;
        let output = copy.resolve(&self.output_file)?;
        create_squashfs(&input, &output, self.timestamp)
    }
}
