//! BIOS setup command - installs GRUB's boot sector and core image into an
//! existing GPT image.

use anyhow::{bail, Context, Result};
use std::path::Path;

use crate::disk::{bios_setup_files, read_gpt, PartitionType};

/// Execute the bios-setup command.
///
/// Without `partition`, the first BIOS boot partition of the GPT is used.
pub fn cmd_bios_setup(
    image: &Path,
    partition: Option<usize>,
    boot_img: &Path,
    core_img: &Path,
) -> Result<()> {
    println!("=== BIOS Boot Setup ===\n");
    let gpt = read_gpt(image)?;

    let entry = match partition {
        Some(number) => gpt
            .entries
            .iter()
            .find(|e| e.number == number)
            .with_context(|| format!("Partition {} not found in {}", number, image.display()))?,
        None => match gpt
            .entries
            .iter()
            .find(|e| e.type_guid == PartitionType::BiosBoot.guid())
        {
            Some(entry) => entry,
            None => bail!("No BIOS boot partition in {}. Pass --partition.", image.display()),
        },
    };

    let region = entry.region();
    println!(
        "  Partition {} ({}) at offset {}, {} bytes",
        entry.number, entry.name, region.offset, region.size
    );
    bios_setup_files(image, region, boot_img, core_img)?;
    println!("\nBIOS boot code installed in {}", image.display());
    Ok(())
}
