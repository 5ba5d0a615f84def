//! Disk command - assembles an A/B disk from payload files on the host.

use anyhow::Result;
use std::path::Path;

use crate::abpartitions::{assemble_disk, AbDiskConfig, AbDiskLayout, AbDiskPayloads};
use crate::disk::PartitionTable;

/// Execute the disk command.
pub fn cmd_disk(output: &Path, config: &AbDiskConfig, payloads: AbDiskPayloads) -> Result<()> {
    println!("=== Assemble A/B Disk ===\n");
    let layout = AbDiskLayout::plan(config, payloads)?;
    let table = assemble_disk(output, &layout, config.disk_guid)?;

    print_table(&table, layout.partitions.iter().map(|p| p.name.as_str()));
    println!("\nDisk written to {}", output.display());
    Ok(())
}

/// Print one line per partition region.
pub fn print_table<'a>(table: &PartitionTable, names: impl IntoIterator<Item = &'a str>) {
    println!("  Disk GUID: {}", table.disk_guid);
    println!("  Size: {} bytes ({} sectors)", table.disk_size(), table.total_sectors);
    for (index, (name, region)) in names.into_iter().zip(&table.regions).enumerate() {
        println!(
            "  {:>3}  {:<12} offset {:>12}  size {:>12}",
            index + 1,
            name,
            region.offset,
            region.size
        );
    }
}
