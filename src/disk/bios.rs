//! GRUB BIOS boot installation.
//!
//! Patches GRUB's 512-byte boot sector so it loads the core image from the
//! BIOS boot partition, patches the core image's block list so it loads the
//! rest of itself, and writes both into the disk.

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::info;

use super::layout::{round_up, Field};
use super::writer::{write_partitions, OffsetAndSize, OutputTarget, PartitionConfig};
use super::{SECTOR_BITS, SECTOR_SIZE};
use crate::error::DiskError;

const BOOT_SECTOR: usize = SECTOR_SIZE as usize;

/// DOS BIOS parameter block, preserved from the existing sector.
const BPB: Field = Field::new(0x03, 0x5a - 0x03);
/// Sector where the core image starts.
const KERNEL_SECTOR: Field = Field::new(0x5c, 8);
/// Drive check instruction, replaced by two NOPs for buggy BIOSes.
const DRIVE_CHECK: Field = Field::new(0x66, 2);
/// Disk signature and legacy partition table, preserved.
const PARTITION_TABLE: Field = Field::new(0x1b8, 0x1fe - 0x1b8);

const NOP: u8 = 0x90;

/// Each block list descriptor is 12 bytes: start sector, length, segment.
const BLOCK_SIZE: usize = 12;
const FIRST_BLOCK: usize = BOOT_SECTOR - BLOCK_SIZE;
const SECOND_BLOCK: usize = FIRST_BLOCK - BLOCK_SIZE;
const BLOCK_START: Field = Field::new(0, 8);
const BLOCK_LEN: Field = Field::new(8, 2);
const BLOCK_SEGMENT: Field = Field::new(10, 2);

/// Real-mode segment GRUB loads the core image to.
const KERNEL_SEGMENT: u16 = 0x800;

/// Produce the boot sector to install at LBA 0.
///
/// Starts from `template` (GRUB's boot.img), keeps the BPB and partition
/// table of `existing`, and points the loader at `first_sector`.
pub fn patch_boot_sector(
    existing: &[u8],
    template: &[u8],
    first_sector: u64,
) -> Result<[u8; BOOT_SECTOR], DiskError> {
    if template.len() != BOOT_SECTOR {
        return Err(DiskError::BootSectorSize(template.len()));
    }
    let mut sector = [0u8; BOOT_SECTOR];
    sector.copy_from_slice(template);

    BPB.copy_between(existing, &mut sector);
    PARTITION_TABLE.copy_between(existing, &mut sector);
    KERNEL_SECTOR.put_u64(&mut sector, first_sector);
    DRIVE_CHECK.fill(&mut sector, NOP);
    Ok(sector)
}

/// Pad `core` to whole sectors and fill in its block list.
///
/// The first descriptor loads the remaining sectors that follow the core's
/// first sector on disk; the second is the zero terminator.
pub fn patch_core_image(core: &[u8], first_sector: u64) -> Result<Vec<u8>, DiskError> {
    if core.is_empty() {
        return Err(DiskError::EmptyCoreImage);
    }
    let padded_len = round_up(core.len() as u64, SECTOR_SIZE) as usize;
    let remaining = (padded_len >> SECTOR_BITS) as u64 - 1;
    let remaining = u16::try_from(remaining).map_err(|_| DiskError::CoreImageTooLarge(remaining + 1))?;

    let mut image = core.to_vec();
    image.resize(padded_len, 0);

    let first = &mut image[FIRST_BLOCK..FIRST_BLOCK + BLOCK_SIZE];
    BLOCK_START.put_u64(first, first_sector + 1);
    BLOCK_LEN.put_u16(first, remaining);
    BLOCK_SEGMENT.put_u16(first, KERNEL_SEGMENT + (SECTOR_SIZE >> 4) as u16);

    let terminator = &mut image[SECOND_BLOCK..SECOND_BLOCK + BLOCK_SIZE];
    terminator.fill(0);

    Ok(image)
}

/// Install GRUB for BIOS boot into the disk at `image`.
///
/// `partition` is the BIOS boot partition that receives the core image.
/// The current sector 0 (normally the protective MBR) supplies the BPB and
/// partition table for the new boot sector.
pub fn bios_setup(image: &Path, partition: OffsetAndSize, boot_sector: &[u8], core: &[u8]) -> Result<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(image)
        .with_context(|| format!("Failed to open {}", image.display()))?;

    let mut existing = [0u8; BOOT_SECTOR];
    file.read_exact_at(&mut existing, 0)
        .with_context(|| format!("Failed to read boot sector of {}", image.display()))?;

    let first_sector = partition.offset >> SECTOR_BITS;
    let sector = patch_boot_sector(&existing, boot_sector, first_sector)?;
    let core = patch_core_image(core, first_sector)?;
    info!(
        "Installing GRUB boot sector, core image of {} sectors at LBA {}",
        core.len() >> SECTOR_BITS,
        first_sector
    );

    write_partitions(
        OutputTarget::File(&file),
        &[
            PartitionConfig::from_buffer(sector, OffsetAndSize::new(0, SECTOR_SIZE)),
            PartitionConfig::from_buffer(core, partition),
        ],
    )?;
    file.sync_all()
        .with_context(|| format!("Failed to flush {}", image.display()))?;
    Ok(())
}

/// [`bios_setup`] reading the boot sector and core image from files.
pub fn bios_setup_files(image: &Path, partition: OffsetAndSize, boot_file: &Path, core_file: &Path) -> Result<()> {
    let boot_sector =
        fs::read(boot_file).with_context(|| format!("Failed to read {}", boot_file.display()))?;
    let core = fs::read(core_file).with_context(|| format!("Failed to read {}", core_file.display()))?;
    bios_setup(image, partition, &boot_sector, &core)
}
