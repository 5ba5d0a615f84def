//! Parted command - writes a bare GPT to an image file.

use anyhow::{bail, Result};
use std::path::Path;

use crate::disk::{parted, Guid, Partition};

use super::disk::print_table;

/// Execute the parted command.
pub fn cmd_parted(output: &Path, partitions: &[Partition], disk_guid: Option<Guid>) -> Result<()> {
    if partitions.is_empty() {
        bail!("No partitions given. Use --part name:size[:type].");
    }
    println!("=== Partition Table ===\n");
    let table = parted(output, partitions, disk_guid)?;
    print_table(&table, partitions.iter().map(|p| p.name.as_str()));
    println!("\nGPT written to {}", output.display());
    Ok(())
}
