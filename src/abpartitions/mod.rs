//! A/B disk layout: which partitions exist, in what order, and how they are
//! filled.
//!
//! Partition order is fixed:
//!
//! ```text
//! [biosboot]  GRUB core image, only when booting through BIOS
//! efi         FAT image holding the environment block and the EFI loader
//!             (named grubenv, without the loader, on BIOS-only disks)
//! grub        squashfs with GRUB modules and the selection script
//! systemA     first root slot
//! systemB     second root slot, empty at build time
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

use crate::disk::{
    bios_setup, write_disk, Guid, OffsetAndSize, Partition, PartitionConfig, PartitionTable,
    PartitionType,
};
use crate::error::DiskError;

pub mod parts;
pub mod root;
pub mod script;

pub use parts::{
    build_ab_disk, bios_partition_step, grub_partition_step, grubenv_partition_step, AbBuildContext,
    AbBuildInputs, AbBuildOutput, AbDiskStep, RootSource,
};
pub use root::{render_root_grub_cfg, render_update_tool, root_partition_step, RootPartitionConfig};
pub use script::{render_boot_script, AbState, BootDecision, BootScriptConfig, Slot};

/// Smallest FAT32 image mtools will format.
pub const MIN_EFI_PARTITION_SIZE: u64 = 33 * 1024 * 1024;

/// File name every partition pipeline produces at the image root.
pub const PAYLOAD_FILE: &str = "/abforge.img";

/// How the firmware reaches GRUB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootType {
    Bios,
    Efi,
    #[default]
    Both,
}

impl BootType {
    pub fn uses_bios(self) -> bool {
        matches!(self, BootType::Bios | BootType::Both)
    }

    pub fn uses_efi(self) -> bool {
        matches!(self, BootType::Efi | BootType::Both)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BootType::Bios => "bios",
            BootType::Efi => "efi",
            BootType::Both => "both",
        }
    }
}

impl fmt::Display for BootType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BootType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bios" => Ok(BootType::Bios),
            "efi" | "uefi" => Ok(BootType::Efi),
            "both" => Ok(BootType::Both),
            other => bail!("Unknown boot type '{}'. Expected bios, efi or both.", other),
        }
    }
}

/// 1-based GPT partition numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionIndexes {
    pub bios: Option<u32>,
    pub grubenv: u32,
    pub grub: u32,
    pub root_a: u32,
    pub root_b: u32,
}

impl PartitionIndexes {
    pub fn for_boot_type(boot_type: BootType) -> Self {
        let shift = u32::from(boot_type.uses_bios());
        Self {
            bios: boot_type.uses_bios().then_some(1),
            grubenv: 1 + shift,
            grub: 2 + shift,
            root_a: 3 + shift,
            root_b: 4 + shift,
        }
    }

    pub fn count(&self) -> usize {
        self.root_b as usize
    }
}

impl Default for PartitionIndexes {
    fn default() -> Self {
        Self::for_boot_type(BootType::default())
    }
}

/// Everything that shapes the disk besides the payloads themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AbDiskConfig {
    pub boot_type: BootType,
    /// Fixed size of the BIOS boot partition; the core image size otherwise.
    pub bios_boot_partition_size: Option<u64>,
    /// Size of the FAT image in the grubenv partition.
    pub efi_partition_size: u64,
    /// Size of each root slot.
    pub root_partition_size: u64,
    pub grub_disk_device: String,
    pub grubenv_path: String,
    pub grub_timeout: u32,
    pub grub_extra_config: String,
    pub linux_disk_device: String,
    pub root_grub_cfg: String,
    /// Host directory with GRUB's platform module directories.
    pub grub_lib_dir: PathBuf,
    /// Random when unset.
    pub disk_guid: Option<Guid>,
}

impl Default for AbDiskConfig {
    fn default() -> Self {
        let script = BootScriptConfig::default();
        Self {
            boot_type: BootType::default(),
            bios_boot_partition_size: None,
            efi_partition_size: MIN_EFI_PARTITION_SIZE,
            root_partition_size: 512 * 1024 * 1024,
            grub_disk_device: script.grub_disk_device,
            grubenv_path: script.grubenv_path,
            grub_timeout: script.grub_timeout,
            grub_extra_config: script.grub_extra_config,
            linux_disk_device: script.linux_disk_device,
            root_grub_cfg: script.root_grub_cfg,
            grub_lib_dir: PathBuf::from(crate::grub::mkimage::DEFAULT_GRUB_LIB_DIR),
            disk_guid: None,
        }
    }
}

impl AbDiskConfig {
    pub fn indexes(&self) -> PartitionIndexes {
        PartitionIndexes::for_boot_type(self.boot_type)
    }

    /// FAT image size, raised to the FAT32 minimum.
    pub fn effective_efi_size(&self) -> u64 {
        self.efi_partition_size.max(MIN_EFI_PARTITION_SIZE)
    }

    /// GRUB prefix pointing at the grub partition.
    pub fn grub_prefix(&self) -> String {
        format!("({},gpt{})/", self.grub_disk_device, self.indexes().grub)
    }

    pub fn script_config(&self) -> BootScriptConfig {
        BootScriptConfig {
            grub_disk_device: self.grub_disk_device.clone(),
            grubenv_path: self.grubenv_path.clone(),
            grub_timeout: self.grub_timeout,
            grub_extra_config: self.grub_extra_config.clone(),
            linux_disk_device: self.linux_disk_device.clone(),
            root_grub_cfg: self.root_grub_cfg.clone(),
            indexes: self.indexes(),
        }
    }
}

/// Host files that fill the partitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AbDiskPayloads {
    /// GRUB `core.img` for the BIOS boot partition.
    pub bios_core: Option<PathBuf>,
    /// GRUB `boot.img` template for the MBR.
    pub bios_boot: Option<PathBuf>,
    pub grubenv: PathBuf,
    pub grub: PathBuf,
    /// Initial contents of slot A.
    pub root: Option<PathBuf>,
}

/// One partition of the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedPartition {
    pub name: String,
    pub kind: PartitionType,
    pub size: Option<u64>,
    pub payload: Option<PathBuf>,
}

/// Ordered partition plan for a boot type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbDiskLayout {
    pub boot_type: BootType,
    pub indexes: PartitionIndexes,
    pub partitions: Vec<PlannedPartition>,
    /// `boot.img` template, when BIOS boot is used.
    pub bios_boot: Option<PathBuf>,
}

impl AbDiskLayout {
    pub fn plan(config: &AbDiskConfig, payloads: AbDiskPayloads) -> Result<Self> {
        let indexes = config.indexes();
        let mut partitions = Vec::with_capacity(indexes.count());

        let bios_boot = if config.boot_type.uses_bios() {
            let (Some(core), Some(boot)) = (payloads.bios_core, payloads.bios_boot) else {
                bail!("BIOS boot needs both a GRUB core image and a boot.img template");
            };
            partitions.push(PlannedPartition {
                name: "biosboot".to_string(),
                kind: PartitionType::BiosBoot,
                size: config.bios_boot_partition_size,
                payload: Some(core),
            });
            Some(boot)
        } else {
            None
        };

        let (grubenv_name, grubenv_kind) = if config.boot_type.uses_efi() {
            ("efi", PartitionType::EfiSystem)
        } else {
            ("grubenv", PartitionType::LinuxData)
        };
        partitions.push(PlannedPartition {
            name: grubenv_name.to_string(),
            kind: grubenv_kind,
            size: None,
            payload: Some(payloads.grubenv),
        });
        partitions.push(PlannedPartition {
            name: "grub".to_string(),
            kind: PartitionType::LinuxData,
            size: None,
            payload: Some(payloads.grub),
        });
        partitions.push(PlannedPartition {
            name: "systemA".to_string(),
            kind: PartitionType::LinuxData,
            size: Some(config.root_partition_size),
            payload: payloads.root,
        });
        partitions.push(PlannedPartition {
            name: "systemB".to_string(),
            kind: PartitionType::LinuxData,
            size: Some(config.root_partition_size),
            payload: None,
        });

        Ok(Self {
            boot_type: config.boot_type,
            indexes,
            partitions,
            bios_boot,
        })
    }

    /// Concrete GPT partitions, sizing payload-backed entries from their files.
    pub fn resolve_partitions(&self) -> Result<Vec<Partition>, DiskError> {
        self.partitions
            .iter()
            .map(|p| {
                let size = match (p.size, &p.payload) {
                    (Some(size), _) => size,
                    (None, Some(path)) => fs::metadata(path)
                        .map_err(|_| DiskError::UnsizedPartition(p.name.clone()))?
                        .len(),
                    (None, None) => return Err(DiskError::UnsizedPartition(p.name.clone())),
                };
                Ok(Partition::new(&p.name, size, p.kind.guid()))
            })
            .collect()
    }
}

/// Write the whole disk: table, payloads, then the BIOS boot code.
///
/// Sizes, payload fits and the boot sector template are all checked before
/// `output` is touched.
pub fn assemble_disk(output: &Path, layout: &AbDiskLayout, disk_guid: Option<Guid>) -> Result<PartitionTable> {
    let partitions = layout.resolve_partitions()?;
    let table = PartitionTable::build(&partitions, disk_guid)?;

    let payloads: Vec<PartitionConfig> = layout
        .partitions
        .iter()
        .zip(&table.regions)
        .filter_map(|(p, region)| p.payload.as_ref().map(|path| PartitionConfig::from_file(path, *region)))
        .collect();

    let bios = match (&layout.bios_boot, layout.indexes.bios) {
        (Some(boot_file), Some(index)) => {
            let boot = fs::read(boot_file)
                .with_context(|| format!("Failed to read {}", boot_file.display()))?;
            if boot.len() != crate::disk::SECTOR_SIZE as usize {
                return Err(DiskError::BootSectorSize(boot.len()).into());
            }
            let slot = (index - 1) as usize;
            let core_file = layout.partitions[slot]
                .payload
                .as_ref()
                .ok_or_else(|| DiskError::UnsizedPartition(layout.partitions[slot].name.clone()))?;
            let core = fs::read(core_file)
                .with_context(|| format!("Failed to read {}", core_file.display()))?;
            Some((boot, core, table.regions[slot]))
        }
        _ => None,
    };

    write_disk(output, &table, &payloads)?;

    if let Some((boot, core, region)) = bios {
        bios_setup(output, region, &boot, &core)?;
    }

    info!(
        "Assembled {} disk {} ({} bytes)",
        layout.boot_type,
        output.display(),
        table.disk_size()
    );
    Ok(table)
}

/// Region of partition `index` (1-based).
pub fn region_of(table: &PartitionTable, index: u32) -> Option<OffsetAndSize> {
    table.regions.get(index.checked_sub(1)? as usize).copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::read_gpt;

    const MIB: u64 = 1024 * 1024;

    fn payloads(dir: &Path, with_bios: bool) -> AbDiskPayloads {
        let write = |name: &str, data: &[u8]| {
            let path = dir.join(name);
            fs::write(&path, data).unwrap();
            path
        };
        AbDiskPayloads {
            bios_core: with_bios.then(|| write("core.img", &vec![0xc0; 3 * 512])),
            bios_boot: with_bios.then(|| {
                let mut boot = [0xb0; 512];
                boot[510..].copy_from_slice(&[0x55, 0xaa]);
                write("boot.img", &boot)
            }),
            grubenv: write("grubenv.img", &vec![0xe0; 2 * MIB as usize]),
            grub: write("grub.img", b"grub squashfs"),
            root: Some(write("root.img", b"root squashfs")),
        }
    }

    #[test]
    fn test_indexes() {
        let both = PartitionIndexes::for_boot_type(BootType::Both);
        assert_eq!((both.bios, both.grubenv, both.grub, both.root_a, both.root_b), (Some(1), 2, 3, 4, 5));
        let efi = PartitionIndexes::for_boot_type(BootType::Efi);
        assert_eq!((efi.bios, efi.grubenv, efi.grub, efi.root_a, efi.root_b), (None, 1, 2, 3, 4));
        assert_eq!(efi.count(), 4);
    }

    #[test]
    fn test_boot_type_parse() {
        assert_eq!("BIOS".parse::<BootType>().unwrap(), BootType::Bios);
        assert_eq!("uefi".parse::<BootType>().unwrap(), BootType::Efi);
        assert!("coreboot".parse::<BootType>().is_err());
    }

    #[test]
    fn test_plan_order_and_types() {
        let dir = tempfile::tempdir().unwrap();
        let layout = AbDiskLayout::plan(&AbDiskConfig::default(), payloads(dir.path(), true)).unwrap();
        let names: Vec<_> = layout.partitions.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["biosboot", "efi", "grub", "systemA", "systemB"]);
        assert_eq!(layout.partitions[0].kind, PartitionType::BiosBoot);
        assert_eq!(layout.partitions[1].kind, PartitionType::EfiSystem);

        let bios_only = AbDiskConfig {
            boot_type: BootType::Bios,
            ..Default::default()
        };
        let layout = AbDiskLayout::plan(&bios_only, payloads(dir.path(), true)).unwrap();
        assert_eq!(layout.partitions[1].name, "grubenv");
        assert_eq!(layout.partitions[1].kind, PartitionType::LinuxData);
    }

    #[test]
    fn test_plan_requires_bios_payloads() {
        let dir = tempfile::tempdir().unwrap();
        assert!(AbDiskLayout::plan(&AbDiskConfig::default(), payloads(dir.path(), false)).is_err());
    }

    #[test]
    fn test_unsized_partition_fails_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = payloads(dir.path(), false);
        p.grub = dir.path().join("missing.img");
        let config = AbDiskConfig {
            boot_type: BootType::Efi,
            ..Default::default()
        };
        let layout = AbDiskLayout::plan(&config, p).unwrap();
        let output = dir.path().join("disk.img");

        let err = assemble_disk(&output, &layout, None).unwrap_err();
        assert_eq!(
            err.downcast_ref::<DiskError>(),
            Some(&DiskError::UnsizedPartition("grub".into()))
        );
        assert!(!output.exists());
    }

    #[test]
    fn test_oversized_root_fails_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = payloads(dir.path(), false);
        let big = dir.path().join("big.img");
        fs::write(&big, vec![1u8; 2 * MIB as usize]).unwrap();
        p.root = Some(big);
        let config = AbDiskConfig {
            boot_type: BootType::Efi,
            root_partition_size: MIB,
            ..Default::default()
        };
        let layout = AbDiskLayout::plan(&config, p).unwrap();
        let output = dir.path().join("disk.img");

        let err = assemble_disk(&output, &layout, None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DiskError>(),
            Some(DiskError::PayloadTooLarge { .. })
        ));
        assert!(!output.exists());
    }

    #[test]
    fn test_assemble_efi_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = AbDiskConfig {
            boot_type: BootType::Efi,
            root_partition_size: 4 * MIB,
            ..Default::default()
        };
        let layout = AbDiskLayout::plan(&config, payloads(dir.path(), false)).unwrap();
        let output = dir.path().join("disk.img");
        let guid = Guid::parse("11111111-2222-3333-4444-555555555555").unwrap();

        let table = assemble_disk(&output, &layout, Some(guid)).unwrap();
        let info = read_gpt(&output).unwrap();
        assert_eq!(info.disk_guid, guid);
        let names: Vec<_> = info.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["efi", "grub", "systemA", "systemB"]);
        assert_eq!(info.entries[0].type_guid, PartitionType::EfiSystem.guid());

        let data = fs::read(&output).unwrap();
        let grub = region_of(&table, layout.indexes.grub).unwrap();
        let start = grub.offset as usize;
        assert_eq!(&data[start..start + 13], b"grub squashfs");
        let root_b = region_of(&table, layout.indexes.root_b).unwrap();
        assert_eq!(root_b.size, 4 * MIB);
        assert!(region_of(&table, 0).is_none());
    }

    #[test]
    fn test_assemble_bios_disk_patches_boot_code() {
        let dir = tempfile::tempdir().unwrap();
        let config = AbDiskConfig {
            root_partition_size: MIB,
            ..Default::default()
        };
        let layout = AbDiskLayout::plan(&config, payloads(dir.path(), true)).unwrap();
        let output = dir.path().join("disk.img");

        let table = assemble_disk(&output, &layout, None).unwrap();
        let data = fs::read(&output).unwrap();
        let core = table.regions[0];
        let first_sector = core.offset / 512;

        // Kernel sector pointer in the MBR.
        assert_eq!(u64::from_le_bytes(data[0x5c..0x64].try_into().unwrap()), first_sector);
        // Protective partition entry survived the patch.
        assert_eq!(data[0x1be + 4], 0xee);
        assert_eq!(&data[0x1fe..0x200], &[0x55, 0xaa]);
        // Block list: remaining core sectors start right after the first.
        let block = core.offset as usize + 500;
        assert_eq!(u64::from_le_bytes(data[block..block + 8].try_into().unwrap()), first_sector + 1);
        assert_eq!(u16::from_le_bytes([data[block + 8], data[block + 9]]), 2);
        read_gpt(&output).unwrap();
    }
}
