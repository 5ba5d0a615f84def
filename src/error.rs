//! Typed errors for invariant violations.
//!
//! Orchestration code works with `anyhow::Result` and wraps these with
//! context. Tests recover the variant with `downcast_ref`.

use std::path::PathBuf;
use thiserror::Error;

/// Format and capacity violations raised while laying out or patching a disk.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DiskError {
    #[error("invalid GUID {0:?}: expected 32 hex digits, optionally separated by dashes")]
    InvalidGuid(String),

    #[error("too many partitions: {count} requested, the table holds at most {max}")]
    TooManyPartitions { count: usize, max: usize },

    #[error("partition name {name:?} is {units} UTF-16 units long, at most {max} fit in an entry")]
    NameTooLong {
        name: String,
        units: usize,
        max: usize,
    },

    #[error(
        "{source_desc} is {size} bytes but its destination slot at offset {offset} holds only {capacity} bytes"
    )]
    PayloadTooLarge {
        source_desc: String,
        size: u64,
        offset: u64,
        capacity: u64,
    },

    #[error("source range {offset}+{size} lies outside {path} ({len} bytes)")]
    SourceRangeOutOfBounds {
        path: PathBuf,
        offset: u64,
        size: u64,
        len: u64,
    },

    #[error("boot sector template is {0} bytes, expected exactly 512")]
    BootSectorSize(usize),

    #[error("core image is empty")]
    EmptyCoreImage,

    #[error("core image spans {0} sectors, the block list can describe at most 65536")]
    CoreImageTooLarge(u64),

    #[error("no size could be determined for partition {0:?}: no explicit size and no payload")]
    UnsizedPartition(String),

    #[error("invalid GPT: {0}")]
    InvalidGpt(String),

    #[error("invalid A/B slot value {value:?} for {key}")]
    InvalidSlot { key: String, value: String },

    #[error("GRUB environment needs {needed} bytes, the block holds {capacity}")]
    GrubEnvOverflow { needed: usize, capacity: usize },

    #[error("invalid GRUB environment block: {0}")]
    InvalidGrubEnv(String),
}

/// Failures specific to the image store and build cache.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("image {0} is not present in the store")]
    UnknownImage(String),

    #[error("invalid image id {0:?}: expected 64 lowercase hex digits")]
    InvalidImageId(String),

    #[error("path {0:?} escapes the image root")]
    PathEscapesImage(String),

    #[error("unsafe cache key component {0:?}")]
    UnsafeCacheKey(String),
}
