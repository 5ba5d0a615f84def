//! Memoizing step executor.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

use super::file_in_image::FileInImage;
use super::step::{AtomicStep, Step};
use super::store::{ImageId, ImageStore};
use crate::cache::BuildCache;

/// How many atomic steps ran versus were taken from the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub executed: usize,
    pub reused: usize,
}

impl std::ops::Add for BuildStats {
    type Output = BuildStats;

    fn add(self, other: BuildStats) -> BuildStats {
        BuildStats {
            executed: self.executed + other.executed,
            reused: self.reused + other.reused,
        }
    }
}

impl std::ops::AddAssign for BuildStats {
    fn add_assign(&mut self, other: BuildStats) {
        *self = *self + other;
    }
}

/// Owns the current image identity and advances it one step at a time.
///
/// Every atomic step runs against a fresh working copy of the current image
/// and is committed before the next one starts. With a cache, a fingerprinted
/// step whose recorded result still exists in the store is skipped.
pub struct ImageBuilder {
    image: ImageId,
    store: Arc<dyn ImageStore>,
    cache: Option<Arc<dyn BuildCache>>,
    stats: BuildStats,
}

impl ImageBuilder {
    pub fn new(store: Arc<dyn ImageStore>, image: ImageId) -> Self {
        Self {
            image,
            store,
            cache: None,
            stats: BuildStats::default(),
        }
    }

    /// Start from the empty image.
    pub fn from_scratch(store: Arc<dyn ImageStore>) -> Result<Self> {
        let image = store.scratch()?;
        Ok(Self::new(store, image))
    }

    pub fn with_cache(mut self, cache: Option<Arc<dyn BuildCache>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn image_id(&self) -> &ImageId {
        &self.image
    }

    pub fn stats(&self) -> BuildStats {
        self.stats
    }

    pub fn store(&self) -> &Arc<dyn ImageStore> {
        &self.store
    }

    /// Reference a file in the current image.
    pub fn file(&self, path: impl Into<String>) -> FileInImage {
        FileInImage::new(self.image.clone(), path)
    }

    /// Apply `step` (atomic or a sequence) to the current image.
    ///
    /// The current identity only changes once every atomic step succeeded;
    /// on error it still names the image from before the call.
    pub fn execute_step(&mut self, step: &Step) -> Result<()> {
        let mut current = self.image.clone();
        for atom in step.atoms() {
            current = self.execute_atomic(&current, atom.as_ref())?;
        }
        self.image = current;
        Ok(())
    }

    fn execute_atomic(&mut self, base: &ImageId, step: &dyn AtomicStep) -> Result<ImageId> {
        let description = step.describe();
        let fingerprint = step.fingerprint()?;

        if let (Some(cache), Some(fp)) = (&self.cache, &fingerprint) {
            if let Some(recorded) = cache.get_entry(base, fp)? {
                match self.store.resolve(&recorded) {
                    Some(id) => {
                        info!("[cached] {} ({} -> {})", description, base.short(), id.short());
                        self.stats.reused += 1;
                        return Ok(id);
                    }
                    None => warn!(
                        "cached result {} for {} is gone from the store, rebuilding",
                        recorded.short(),
                        description
                    ),
                }
            }
        }

        info!("[run] {} (on {})", description, base.short());
        let copy = self.store.checkout(base)?;
        step.run(&copy)
            .with_context(|| format!("Step failed: {}", description))?;
        let result = self.store.commit(&copy)?;
        drop(copy);

        if let (Some(cache), Some(fp)) = (&self.cache, &fingerprint) {
            cache.set_entry(base, fp, &result)?;
        }
        self.stats.executed += 1;
        Ok(result)
    }
}
