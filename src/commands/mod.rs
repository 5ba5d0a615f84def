//! CLI command handlers.
//!
//! Each submodule handles a specific CLI command:
//! - `build` - Build partitions and the A/B disk with the step engine
//! - `disk` - Assemble an A/B disk from ready-made payloads
//! - `parted` - Write a bare GPT
//! - `bios_setup` - Install GRUB's BIOS boot code into an image
//! - `grubenv` - Edit GRUB environment block files
//! - `show` - Display information
//! - `clean` - Remove the image store and step cache

pub mod bios_setup;
pub mod build;
pub mod clean;
pub mod disk;
pub mod grubenv;
pub mod parted;
pub mod show;

pub use bios_setup::cmd_bios_setup;
pub use build::cmd_build;
pub use clean::cmd_clean;
pub use disk::cmd_disk;
pub use grubenv::cmd_grubenv;
pub use parted::cmd_parted;
pub use show::cmd_show;

use anyhow::{bail, Context, Result};
use std::sync::Arc;

use crate::build::DirImageStore;
use crate::cache::{BuildCache, FsBuildCache};
use crate::config::Config;
use crate::disk::{Partition, PartitionType};

/// Parse a size: plain bytes or a `K`/`M`/`G` suffix (binary units).
pub fn parse_size(text: &str) -> Result<u64> {
    let text = text.trim();
    let (digits, shift) = match text.char_indices().last() {
        Some((i, 'K' | 'k')) => (&text[..i], 10),
        Some((i, 'M' | 'm')) => (&text[..i], 20),
        Some((i, 'G' | 'g')) => (&text[..i], 30),
        _ => (text, 0),
    };
    let value: u64 = digits
        .parse()
        .with_context(|| format!("Invalid size '{}'", text))?;
    value
        .checked_mul(1u64 << shift)
        .with_context(|| format!("Size '{}' is too large", text))
}

/// Parse `name:size[:type]`, the type being a known name or a GUID.
pub fn parse_part_spec(spec: &str) -> Result<Partition> {
    let mut fields = spec.splitn(3, ':');
    let name = fields.next().unwrap_or_default();
    let Some(size) = fields.next() else {
        bail!("Invalid partition '{}'. Expected name:size[:type].", spec);
    };
    let type_guid = match fields.next() {
        None => PartitionType::LinuxData.guid(),
        Some(kind) => match kind.parse::<PartitionType>() {
            Ok(known) => known.guid(),
            Err(_) => kind
                .parse()
                .with_context(|| format!("Unknown partition type '{}'", kind))?,
        },
    };
    Ok(Partition::new(name, parse_size(size)?, type_guid))
}

/// Open the image store and, unless disabled, the step cache.
pub fn open_store(config: &Config) -> Result<(Arc<DirImageStore>, Option<Arc<dyn BuildCache>>)> {
    let store = Arc::new(DirImageStore::open(&config.store_dir)?);
    let cache: Option<Arc<dyn BuildCache>> = if config.no_cache {
        None
    } else {
        Some(Arc::new(FsBuildCache::new(&config.cache_dir)?))
    };
    Ok((store, cache))
}
