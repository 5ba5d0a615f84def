//! Step cache and content hashing.
//!
//! The cache maps `(base image, step fingerprint)` to the image the step
//! produced. Entries are plain files so concurrent builders can share one
//! cache directory: each entry is written to a temporary file and renamed
//! into place, so readers see either nothing or a complete id.

use anyhow::{Context, Result};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::build::{Fingerprint, ImageId};
use crate::error::BuildError;

/// Key/value store of step results.
pub trait BuildCache: Send + Sync {
    /// Recorded result of running `fingerprint` on `image`, if any.
    fn get_entry(&self, image: &ImageId, fingerprint: &Fingerprint) -> Result<Option<ImageId>>;

    fn set_entry(&self, image: &ImageId, fingerprint: &Fingerprint, result: &ImageId) -> Result<()>;
}

/// Characters allowed in either half of a cache key.
const SAFE_COMPONENT: &str = r"^[\w-]+$";

/// Filesystem cache: one file per entry at `<root>/<image>/<fingerprint>`.
#[derive(Debug, Clone)]
pub struct FsBuildCache {
    root: PathBuf,
    safe: Regex,
}

impl FsBuildCache {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            root: root.into(),
            safe: Regex::new(SAFE_COMPONENT)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, image: &str, fingerprint: &str) -> Result<PathBuf, BuildError> {
        for component in [image, fingerprint] {
            if !self.safe.is_match(component) {
                return Err(BuildError::UnsafeCacheKey(component.to_string()));
            }
        }
        Ok(self.root.join(image).join(fingerprint))
    }
}

impl BuildCache for FsBuildCache {
    fn get_entry(&self, image: &ImageId, fingerprint: &Fingerprint) -> Result<Option<ImageId>> {
        let path = self.entry_path(image.as_str(), fingerprint.as_str())?;
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                warn!("Failed to read cache entry {}: {} (treating as miss)", path.display(), e);
                return Ok(None);
            }
        };
        let content = content.trim();
        if content.is_empty() {
            return Ok(None);
        }
        match ImageId::parse(content) {
            Ok(id) => Ok(Some(id)),
            Err(e) => {
                warn!("Ignoring corrupt cache entry {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    fn set_entry(&self, image: &ImageId, fingerprint: &Fingerprint, result: &ImageId) -> Result<()> {
        let path = self.entry_path(image.as_str(), fingerprint.as_str())?;
        let dir = path
            .parent()
            .with_context(|| format!("Cache entry {} has no parent", path.display()))?;
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create cache directory {}", dir.display()))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temporary file in {}", dir.display()))?;
        tmp.write_all(result.as_str().as_bytes())?;
        tmp.persist(&path)
            .with_context(|| format!("Failed to write cache entry {}", path.display()))?;
        debug!("cached {} + {} -> {}", image.short(), fingerprint, result.short());
        Ok(())
    }
}

/// SHA-256 of a file's contents, streamed.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    update_with_file(&mut hasher, path)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Feed a file's contents into `hasher`.
pub fn update_with_file(hasher: &mut Sha256, path: &Path) -> Result<()> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open {} for hashing", path.display()))?;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("Failed to read {} for hashing", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(())
}
