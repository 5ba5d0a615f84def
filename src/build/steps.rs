//! Built-in steps: adding files and running commands.

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::PathBuf;

use super::step::{AtomicStep, Fingerprint, Step};
use super::store::WorkingCopy;
use crate::cache::hash_file;
use crate::common::write_file_mode;
use crate::process::Cmd;

/// Contents of a file added by [`AddFiles`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSource {
    Bytes(Vec<u8>),
    /// Copied from the host when the step runs.
    Host(PathBuf),
    Symlink(String),
}

/// One file to add, with its permission bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemFile {
    pub source: FileSource,
    pub mode: u32,
}

impl MemFile {
    pub fn new(content: impl Into<Vec<u8>>) -> Self {
        Self {
            source: FileSource::Bytes(content.into()),
            mode: 0o644,
        }
    }

    pub fn host(path: impl Into<PathBuf>) -> Self {
        Self {
            source: FileSource::Host(path.into()),
            mode: 0o644,
        }
    }

    pub fn symlink(target: impl Into<String>) -> Self {
        Self {
            source: FileSource::Symlink(target.into()),
            mode: 0o777,
        }
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }
}

#[derive(Serialize)]
struct FileKey<'a> {
    path: &'a str,
    kind: &'static str,
    mode: u32,
    digest: String,
}

/// Write a set of files into the image, creating parent directories.
#[derive(Debug, Clone, Default)]
pub struct AddFiles {
    files: BTreeMap<String, MemFile>,
}

impl AddFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(mut self, path: impl Into<String>, file: MemFile) -> Self {
        self.files.insert(path.into(), file);
        self
    }

    pub fn into_step(self) -> Step {
        Step::atomic(self)
    }
}

impl AtomicStep for AddFiles {
    fn describe(&self) -> String {
        let names: Vec<&str> = self.files.keys().map(String::as_str).collect();
        format!("add files {}", names.join(", "))
    }

    fn fingerprint(&self) -> Result<Option<Fingerprint>> {
        let mut keys = Vec::with_capacity(self.files.len());
        for (path, file) in &self.files {
            let (kind, digest) = match &file.source {
                FileSource::Bytes(data) => ("bytes", format!("{:x}", Sha256::digest(data))),
                FileSource::Host(host) => ("host", hash_file(host)?),
                FileSource::Symlink(target) => ("symlink", target.clone()),
            };
            keys.push(FileKey {
                path,
                kind,
                mode: file.mode,
                digest,
            });
        }
        Fingerprint::of("ADD-FILES", &keys).map(Some)
    }

    fn run(&self, copy: &WorkingCopy) -> Result<()> {
        for (path, file) in &self.files {
            let target = copy.resolve(path)?;
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            match fs::symlink_metadata(&target) {
                Ok(meta) if meta.is_dir() => fs::remove_dir_all(&target)
                    .with_context(|| format!("Failed to replace directory {}", target.display()))?,
                Ok(_) => fs::remove_file(&target)
                    .with_context(|| format!("Failed to replace {}", target.display()))?,
                Err(_) => {}
            }
            match &file.source {
                FileSource::Bytes(data) => {
                    write_file_mode(&target, data, file.mode)?;
                    continue;
                }
                FileSource::Host(host) => {
                    fs::copy(host, &target).with_context(|| {
                        format!("Failed to copy {} to {}", host.display(), target.display())
                    })?;
                }
                FileSource::Symlink(link) => {
                    symlink(link, &target)
                        .with_context(|| format!("Failed to create symlink {}", target.display()))?;
                    continue;
                }
            }
            fs::set_permissions(&target, fs::Permissions::from_mode(file.mode))
                .with_context(|| format!("Failed to set mode on {}", target.display()))?;
        }
        Ok(())
    }
}

/// Run an external command with the working copy as current directory.
///
/// The image root is also exported as `ABFORGE_ROOT`.
#[derive(Debug, Clone, Serialize)]
pub struct Run {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    #[serde(skip)]
    pub cached: bool,
}

impl Run {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            argv: argv.into_iter().map(|a| a.as_ref().to_string()).collect(),
            env: Vec::new(),
            cached: true,
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Always execute, even with a cache.
    pub fn uncached(mut self) -> Self {
        self.cached = false;
        self
    }
}

impl AtomicStep for Run {
    fn describe(&self) -> String {
        format!("run {}", self.argv.join(" "))
    }

    fn fingerprint(&self) -> Result<Option<Fingerprint>> {
        if !self.cached {
            return Ok(None);
        }
        Fingerprint::of("RUN", self).map(Some)
    }

    fn run(&self, copy: &WorkingCopy) -> Result<()> {
        let (program, args) = self
            .argv
            .split_first()
            .context("Run step has an empty command line")?;
        let mut cmd = Cmd::new(program)
            .args(args)
            .dir(copy.path())
            .env("ABFORGE_ROOT", copy.path().to_string_lossy());
        for (key, value) in &self.env {
            cmd = cmd.env(key, value);
        }
        cmd.run()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{DirImageStore, ImageBuilder, ImageStore};
    use std::sync::Arc;

    fn builder() -> (tempfile::TempDir, ImageBuilder) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ImageStore> = Arc::new(DirImageStore::open(dir.path()).unwrap());
        (dir, ImageBuilder::from_scratch(store).unwrap())
    }

    #[test]
    fn test_add_files_writes_modes_and_links() {
        let (_dir, mut builder) = builder();
        let step = AddFiles::new()
            .file("/boot/grub.cfg", MemFile::new("linux /vmlinuz\n"))
            .file("/sbin/tool", MemFile::new("#!/bin/sh\n").mode(0o500))
            .file("/current", MemFile::symlink("boot"));
        builder.execute_step(&step.into_step()).unwrap();

        let store = builder.store().clone();
        let id = builder.image_id();
        let tool = store.locate(id, "/sbin/tool").unwrap();
        assert_eq!(fs::metadata(&tool).unwrap().permissions().mode() & 0o777, 0o500);
        assert_eq!(
            fs::read_to_string(store.locate(id, "boot/grub.cfg").unwrap()).unwrap(),
            "linux /vmlinuz\n"
        );
        assert_eq!(
            fs::read_link(store.locate(id, "/current").unwrap()).unwrap(),
            PathBuf::from("boot")
        );
    }

    #[test]
    fn test_add_files_replaces_directory() {
        let copy = WorkingCopy::new(tempfile::tempdir().unwrap());
        fs::create_dir_all(copy.path().join("etc/conf/nested")).unwrap();
        fs::write(copy.path().join("etc/conf/nested/old"), "old").unwrap();

        AddFiles::new()
            .file("/etc/conf", MemFile::new("new"))
            .run(&copy)
            .unwrap();

        let target = copy.path().join("etc/conf");
        assert!(fs::symlink_metadata(&target).unwrap().is_file());
        assert_eq!(fs::read_to_string(target).unwrap(), "new");
    }

    #[test]
    fn test_add_files_replaces_symlink_not_its_target() {
        let copy = WorkingCopy::new(tempfile::tempdir().unwrap());
        fs::create_dir(copy.path().join("real")).unwrap();
        fs::write(copy.path().join("real/keep"), "keep").unwrap();
        symlink("real", copy.path().join("link")).unwrap();

        AddFiles::new()
            .file("/link", MemFile::new("file"))
            .run(&copy)
            .unwrap();

        assert_eq!(fs::read_to_string(copy.path().join("link")).unwrap(), "file");
        assert_eq!(fs::read_to_string(copy.path().join("real/keep")).unwrap(), "keep");
    }

    #[test]
    fn test_add_files_fingerprint_tracks_content() {
        let a = AddFiles::new().file("/x", MemFile::new("1"));
        let b = AddFiles::new().file("/x", MemFile::new("2"));
        let c = AddFiles::new().file("/x", MemFile::new("1").mode(0o600));
        let fa = a.fingerprint().unwrap().unwrap();
        assert_eq!(fa, a.clone().fingerprint().unwrap().unwrap());
        assert_ne!(fa, b.fingerprint().unwrap().unwrap());
        assert_ne!(fa, c.fingerprint().unwrap().unwrap());
        assert!(fa.as_str().starts_with("ADD-FILES-"));
    }

    #[test]
    fn test_host_file_fingerprint_follows_content() {
        let dir = tempfile::tempdir().unwrap();
        let host = dir.path().join("kernel");
        fs::write(&host, "v1").unwrap();
        let step = AddFiles::new().file("/boot/vmlinuz", MemFile::host(&host));
        let before = step.fingerprint().unwrap();
        fs::write(&host, "v2").unwrap();
        assert_ne!(before, step.fingerprint().unwrap());
    }

    #[test]
    fn test_run_in_working_copy() {
        let (_dir, mut builder) = builder();
        let step = Run::new(["sh", "-c", "echo $GREETING > hello.txt"]).env("GREETING", "hi");
        builder.execute_step(&Step::atomic(step)).unwrap();

        let out = builder.store().locate(builder.image_id(), "hello.txt").unwrap();
        assert_eq!(fs::read_to_string(out).unwrap(), "hi\n");
    }

    #[test]
    fn test_run_fingerprint() {
        let run = Run::new(["true"]);
        assert!(run.fingerprint().unwrap().unwrap().as_str().starts_with("RUN-"));
        assert_eq!(run.uncached().fingerprint().unwrap(), None);
        assert!(Run::new(Vec::<String>::new())
            .run(&WorkingCopy::new(tempfile::tempdir().unwrap()))
            .is_err());
    }
}
