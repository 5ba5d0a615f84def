//! Show command - displays information.

use anyhow::Result;
use std::path::PathBuf;

use crate::abpartitions::{render_boot_script, AbDiskConfig};
use crate::config::Config;
use crate::disk::{read_gpt, PartitionType};

/// Show target for the show command.
pub enum ShowTarget {
    /// Verified GPT of an image
    Gpt(PathBuf),
    /// Show configuration
    Config,
    /// Boot selection script for a layout
    BootScript(AbDiskConfig),
}

/// Execute the show command.
pub fn cmd_show(target: ShowTarget, config: &Config) -> Result<()> {
    match target {
        ShowTarget::Gpt(image) => {
            let gpt = read_gpt(&image)?;
            println!("=== GPT: {} ===\n", image.display());
            println!("  Disk GUID: {}", gpt.disk_guid);
            println!("  Usable LBAs: {}..={}", gpt.first_usable_lba, gpt.last_usable_lba);
            println!("  Backup header: LBA {}", gpt.backup_lba);
            println!();
            for entry in &gpt.entries {
                let kind = PartitionType::from_guid(entry.type_guid)
                    .map(|t| t.as_str().to_string())
                    .unwrap_or_else(|| entry.type_guid.to_string());
                println!(
                    "  {:>3}  {:<12} {:<8} LBA {:>10}..={:<10} {}",
                    entry.number, entry.name, kind, entry.first_lba, entry.last_lba, entry.guid
                );
            }
        }
        ShowTarget::Config => {
            config.print();
        }
        ShowTarget::BootScript(layout) => {
            print!("{}", render_boot_script(&layout.script_config()));
        }
    }
    Ok(())
}
