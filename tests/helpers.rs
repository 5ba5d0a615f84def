//! Shared test utilities for abforge tests.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use abforge::build::{DirImageStore, FnStep, Fingerprint, ImageBuilder, ImageId, ImageStore, Step};
use abforge::cache::{BuildCache, FsBuildCache};

/// Test environment with a scratch image store and step cache.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    /// Base directory for inputs and outputs
    pub base_dir: PathBuf,
    pub store: Arc<DirImageStore>,
    pub cache: Arc<FsBuildCache>,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let base_dir = temp_dir.path().to_path_buf();
        let store = Arc::new(DirImageStore::open(base_dir.join("store")).expect("Failed to open store"));
        let cache = Arc::new(FsBuildCache::new(base_dir.join("cache")).expect("Failed to open cache"));
        Self {
            _temp_dir: temp_dir,
            base_dir,
            store,
            cache,
        }
    }

    pub fn store_dyn(&self) -> Arc<dyn ImageStore> {
        self.store.clone()
    }

    pub fn cache_dyn(&self) -> Option<Arc<dyn BuildCache>> {
        Some(self.cache.clone())
    }

    /// Engine starting from scratch with the step cache enabled.
    pub fn builder(&self) -> ImageBuilder {
        ImageBuilder::from_scratch(self.store_dyn())
            .expect("Failed to create scratch image")
            .with_cache(self.cache_dyn())
    }

    /// Publish a directory holding `files` as an image.
    pub fn image_with(&self, name: &str, files: &[(&str, &str)]) -> ImageId {
        let dir = self.base_dir.join("inputs").join(name);
        for (path, content) in files {
            write_file(&dir.join(path), content.as_bytes());
        }
        fs::create_dir_all(&dir).expect("Failed to create input dir");
        self.store.import_dir(&dir).expect("Failed to import dir")
    }

    /// [`TestEnv::image_with`] for binary contents.
    pub fn image_with_bytes(&self, name: &str, files: &[(&str, Vec<u8>)]) -> ImageId {
        let dir = self.base_dir.join("inputs").join(name);
        for (path, content) in files {
            write_file(&dir.join(path), content);
        }
        self.store.import_dir(&dir).expect("Failed to import dir")
    }

    /// Path of an image directory inside the store.
    pub fn image_dir(&self, id: &ImageId) -> PathBuf {
        self.store.root().join("images").join(id.as_str())
    }
}

pub fn write_file(path: &Path, content: &[u8]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Failed to create parent dir");
    }
    fs::write(path, content).expect("Failed to write file");
}

/// Fingerprinted in-process step writing `content` to `path` and counting
/// its executions.
pub fn counting_write(path: &'static str, content: &'static str, runs: &Arc<AtomicUsize>) -> Step {
    let runs = runs.clone();
    Step::atomic(
        FnStep::new(format!("write {}", path), move |copy| {
            runs.fetch_add(1, Ordering::SeqCst);
            fs::write(copy.resolve(path)?, content)?;
            Ok(())
        })
        .with_fingerprint(Fingerprint::of("TEST-WRITE", &(path, content)).expect("fingerprint")),
    )
}

pub fn read_u64(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(data[offset..offset + 8].try_into().expect("8 bytes"))
}
