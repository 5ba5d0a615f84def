//! Raw disk image construction: GPT, partition payloads and BIOS boot code.

pub mod bios;
pub mod gpt;
pub mod guid;
pub mod layout;
pub mod mbr;
pub mod writer;

pub use bios::{bios_setup, bios_setup_files};
pub use gpt::{parted, read_gpt, write_disk, GptInfo, Partition, PartitionTable};
pub use guid::{Guid, PartitionType};
pub use writer::{check_partitions, write_partitions, OffsetAndSize, OutputTarget, PartitionConfig};

/// Logical sector size.
pub const SECTOR_SIZE: u64 = 512;
/// log2 of [`SECTOR_SIZE`].
pub const SECTOR_BITS: u32 = 9;
/// Partition size granularity in sectors (1 MiB).
pub const ALIGNMENT_SECTORS: u64 = 2048;
