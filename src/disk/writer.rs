//! Raw partition writer.
//!
//! Copies file ranges and in-memory buffers into an output image at exact
//! byte offsets using positioned I/O. Every entry is measured and checked
//! against its destination slot before the first byte is written, so an
//! oversized payload never leaves a partial write behind.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::DiskError;

/// Copy buffer size for file-backed sources.
const COPY_CHUNK: usize = 1024 * 1024;

/// A region of a disk or file, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetAndSize {
    pub offset: u64,
    pub size: u64,
}

impl OffsetAndSize {
    pub const fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// First byte past the region.
    pub const fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Where the bytes of one write come from.
#[derive(Debug, Clone)]
pub enum PartitionSource {
    /// A whole file, or `range` of it.
    File {
        path: PathBuf,
        range: Option<OffsetAndSize>,
    },
    Buffer(Vec<u8>),
}

/// One write directive: a source and the slot it must fit in.
#[derive(Debug, Clone)]
pub struct PartitionConfig {
    pub source: PartitionSource,
    pub destination: OffsetAndSize,
}

impl PartitionConfig {
    pub fn from_file(path: impl Into<PathBuf>, destination: OffsetAndSize) -> Self {
        Self {
            source: PartitionSource::File {
                path: path.into(),
                range: None,
            },
            destination,
        }
    }

    pub fn from_file_range(
        path: impl Into<PathBuf>,
        range: OffsetAndSize,
        destination: OffsetAndSize,
    ) -> Self {
        Self {
            source: PartitionSource::File {
                path: path.into(),
                range: Some(range),
            },
            destination,
        }
    }

    pub fn from_buffer(buffer: impl Into<Vec<u8>>, destination: OffsetAndSize) -> Self {
        Self {
            source: PartitionSource::Buffer(buffer.into()),
            destination,
        }
    }

    fn describe(&self) -> String {
        match &self.source {
            PartitionSource::File { path, .. } => path.display().to_string(),
            PartitionSource::Buffer(_) => "in-memory buffer".to_string(),
        }
    }

    /// Number of bytes this directive will write, checked against the slot.
    fn checked_len(&self) -> Result<u64> {
        let len = match &self.source {
            PartitionSource::Buffer(buf) => buf.len() as u64,
            PartitionSource::File { path, range } => {
                let file_len = fs::metadata(path)
                    .with_context(|| format!("Failed to read partition source {}", path.display()))?
                    .len();
                match range {
                    None => file_len,
                    Some(r) => {
                        let in_bounds = r.offset.checked_add(r.size).is_some_and(|end| end <= file_len);
                        if !in_bounds {
                            return Err(DiskError::SourceRangeOutOfBounds {
                                path: path.clone(),
                                offset: r.offset,
                                size: r.size,
                                len: file_len,
                            }
                            .into());
                        }
                        r.size
                    }
                }
            }
        };
        if len > self.destination.size {
            return Err(DiskError::PayloadTooLarge {
                source_desc: self.describe(),
                size: len,
                offset: self.destination.offset,
                capacity: self.destination.size,
            }
            .into());
        }
        Ok(len)
    }
}

/// The image to write into.
///
/// A `Path` is opened (read/write, must exist) and closed here. A borrowed
/// `File` belongs to the caller and stays open.
#[derive(Debug, Clone, Copy)]
pub enum OutputTarget<'a> {
    Path(&'a Path),
    File(&'a File),
}

/// Check every directive against its source and slot without writing.
pub fn check_partitions(partitions: &[PartitionConfig]) -> Result<()> {
    for partition in partitions {
        partition.checked_len()?;
    }
    Ok(())
}

/// Write every directive into `output`, in order.
pub fn write_partitions(output: OutputTarget<'_>, partitions: &[PartitionConfig]) -> Result<()> {
    let lengths = partitions
        .iter()
        .map(PartitionConfig::checked_len)
        .collect::<Result<Vec<_>>>()?;

    match output {
        OutputTarget::File(file) => write_all(file, partitions, &lengths),
        OutputTarget::Path(path) => {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .with_context(|| format!("Failed to open output image {}", path.display()))?;
            write_all(&file, partitions, &lengths)?;
            file.sync_all()
                .with_context(|| format!("Failed to flush {}", path.display()))?;
            Ok(())
        }
    }
}

fn write_all(out: &File, partitions: &[PartitionConfig], lengths: &[u64]) -> Result<()> {
    for (partition, &len) in partitions.iter().zip(lengths) {
        let dest = partition.destination;
        debug!(
            "writing {} bytes from {} at offset {}",
            len,
            partition.describe(),
            dest.offset
        );
        match &partition.source {
            PartitionSource::Buffer(buf) => {
                out.write_all_at(buf, dest.offset)
                    .with_context(|| format!("Failed to write {} bytes at offset {}", len, dest.offset))?;
            }
            PartitionSource::File { path, range } => {
                let start = range.map(|r| r.offset).unwrap_or(0);
                copy_range(path, start, len, out, dest.offset)?;
            }
        }
    }
    Ok(())
}

fn copy_range(src: &Path, start: u64, len: u64, out: &File, out_offset: u64) -> Result<()> {
    let mut input = File::open(src)
        .with_context(|| format!("Failed to open partition source {}", src.display()))?;
    input.seek(SeekFrom::Start(start))?;
    let mut input = input.take(len);

    let mut buf = vec![0u8; COPY_CHUNK];
    let mut written = 0u64;
    loop {
        let n = input
            .read(&mut buf)
            .with_context(|| format!("Failed to read {}", src.display()))?;
        if n == 0 {
            break;
        }
        out.write_all_at(&buf[..n], out_offset + written)
            .with_context(|| format!("Failed to write at offset {}", out_offset + written))?;
        written += n as u64;
    }
    if written != len {
        anyhow::bail!(
            "{} shrank while copying: expected {} bytes, read {}",
            src.display(),
            len,
            written
        );
    }
    Ok(())
}
