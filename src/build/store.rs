//! Content-addressed image store.
//!
//! An image is a directory tree named by the SHA-256 of its canonical form:
//! every entry's relative path, kind, permission bits and contents (or
//! symlink target), visited in sorted order. Timestamps and ownership are
//! not part of the identity, so rebuilding the same tree gives the same id.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use tempfile::TempDir;
use tracing::debug;
use walkdir::WalkDir;

use crate::cache::update_with_file;
use crate::error::BuildError;

/// Identity of a committed image: 64 lowercase hex digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageId(String);

impl ImageId {
    pub fn parse(text: &str) -> Result<Self, BuildError> {
        if text.len() == 64 && text.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            Ok(Self(text.to_string()))
        } else {
            Err(BuildError::InvalidImageId(text.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ImageId {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ImageId {
    type Error = BuildError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ImageId> for String {
    fn from(id: ImageId) -> Self {
        id.0
    }
}

/// A private, mutable copy of an image that a step runs against.
///
/// The directory is removed when the working copy is dropped; an abandoned
/// working copy is never linked into the store.
#[derive(Debug)]
pub struct WorkingCopy {
    dir: TempDir,
}

impl WorkingCopy {
    pub fn new(dir: TempDir) -> Self {
        Self { dir }
    }

    /// Host path of the image root.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Map an image path such as `/boot/grub.cfg` to its host path.
    pub fn resolve(&self, image_path: &str) -> Result<PathBuf, BuildError> {
        resolve_in(self.path(), image_path)
    }
}

/// Join `image_path` under `root`, treating it as absolute within the image.
pub fn resolve_in(root: &Path, image_path: &str) -> Result<PathBuf, BuildError> {
    let mut resolved = root.to_path_buf();
    for component in Path::new(image_path).components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(part) => resolved.push(part),
            Component::ParentDir | Component::Prefix(_) => {
                return Err(BuildError::PathEscapesImage(image_path.to_string()))
            }
        }
    }
    Ok(resolved)
}

/// Where images live and how working copies are made from them.
pub trait ImageStore: Send + Sync {
    /// `Some(id)` if the image is present.
    fn resolve(&self, id: &ImageId) -> Option<ImageId>;

    /// A fresh working copy populated from `id`.
    fn checkout(&self, id: &ImageId) -> Result<WorkingCopy>;

    /// Publish the working copy's current contents as an image.
    fn commit(&self, copy: &WorkingCopy) -> Result<ImageId>;

    /// Host path of `path` inside image `id`.
    fn locate(&self, id: &ImageId, path: &str) -> Result<PathBuf>;

    /// Publish an existing host directory as an image.
    fn import_dir(&self, dir: &Path) -> Result<ImageId>;

    /// The empty image.
    fn scratch(&self) -> Result<ImageId>;
}

/// Image store on the local filesystem.
///
/// Layout: `<root>/images/<id>/` for published images and `<root>/tmp/`
/// for working copies and in-flight commits. Publishing is a rename from
/// `tmp/` into `images/`, so an image directory is always complete.
#[derive(Debug, Clone)]
pub struct DirImageStore {
    root: PathBuf,
}

impl DirImageStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for sub in ["images", "tmp"] {
            let dir = root.join(sub);
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create image store directory {}", dir.display()))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn image_dir(&self, id: &ImageId) -> PathBuf {
        self.root.join("images").join(id.as_str())
    }

    fn temp_dir(&self, prefix: &str) -> Result<TempDir> {
        tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(self.root.join("tmp"))
            .with_context(|| format!("Failed to create temporary directory in {}", self.root.display()))
    }

    fn publish(&self, src: &Path) -> Result<ImageId> {
        let id = tree_digest(src)?;
        let target = self.image_dir(&id);
        if target.is_dir() {
            debug!("image {} already present", id.short());
            return Ok(id);
        }

        let staging = self.temp_dir("commit-")?;
        copy_tree(src, staging.path())?;
        let staged = staging.into_path();
        if let Err(e) = fs::rename(&staged, &target) {
            let _ = fs::remove_dir_all(&staged);
            // Another commit of the same tree won the race.
            if !target.is_dir() {
                return Err(e).with_context(|| format!("Failed to publish image {}", id));
            }
        }
        debug!("published image {}", id.short());
        Ok(id)
    }
}

impl ImageStore for DirImageStore {
    fn resolve(&self, id: &ImageId) -> Option<ImageId> {
        self.image_dir(id).is_dir().then(|| id.clone())
    }

    fn checkout(&self, id: &ImageId) -> Result<WorkingCopy> {
        let source = self.image_dir(id);
        if !source.is_dir() {
            return Err(BuildError::UnknownImage(id.to_string()).into());
        }
        let dir = self.temp_dir("work-")?;
        copy_tree(&source, dir.path())?;
        Ok(WorkingCopy::new(dir))
    }

    fn commit(&self, copy: &WorkingCopy) -> Result<ImageId> {
        self.publish(copy.path())
    }

    fn locate(&self, id: &ImageId, path: &str) -> Result<PathBuf> {
        let root = self.image_dir(id);
        if !root.is_dir() {
            return Err(BuildError::UnknownImage(id.to_string()).into());
        }
        let located = resolve_in(&root, path)?;
        if fs::symlink_metadata(&located).is_err() {
            bail!("{} does not exist in image {}", path, id.short());
        }
        Ok(located)
    }

    fn import_dir(&self, dir: &Path) -> Result<ImageId> {
        if !dir.is_dir() {
            bail!("{} is not a directory", dir.display());
        }
        self.publish(dir)
    }

    fn scratch(&self) -> Result<ImageId> {
        let empty = self.temp_dir("scratch-")?;
        self.publish(empty.path())
    }
}

/// Identity of the tree rooted at `root`.
pub fn tree_digest(root: &Path) -> Result<ImageId> {
    let mut hasher = Sha256::new();
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("{} is outside {}", entry.path().display(), root.display()))?;
        let rel = rel.to_string_lossy();
        let file_type = entry.file_type();
        let meta = entry
            .metadata()
            .with_context(|| format!("Failed to stat {}", entry.path().display()))?;

        if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            hasher.update(format!("L {}\0{}\0", rel, target.to_string_lossy()));
        } else if file_type.is_dir() {
            hasher.update(format!("D {:o} {}\0", meta.permissions().mode() & 0o7777, rel));
        } else if file_type.is_file() {
            hasher.update(format!(
                "F {:o} {} {}\0",
                meta.permissions().mode() & 0o7777,
                meta.len(),
                rel
            ));
            update_with_file(&mut hasher, entry.path())?;
        } else {
            bail!("unsupported file type at {}", entry.path().display());
        }
    }
    let id = format!("{:x}", hasher.finalize());
    Ok(ImageId::parse(&id)?)
}

/// Copy a tree, preserving permission bits and symlinks.
///
/// Directory permissions are applied last, deepest first, so read-only
/// directories do not block their own population.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    let mut dirs = Vec::new();
    for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {}", src.display()))?;
        let rel = entry.path().strip_prefix(src)?;
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            symlink(&link, &target)
                .with_context(|| format!("Failed to create symlink {}", target.display()))?;
        } else if file_type.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create {}", target.display()))?;
            dirs.push((target, entry.metadata()?.permissions()));
        } else {
            fs::copy(entry.path(), &target).with_context(|| {
                format!("Failed to copy {} to {}", entry.path().display(), target.display())
            })?;
        }
    }
    for (dir, perms) in dirs.into_iter().rev() {
        fs::set_permissions(&dir, perms)
            .with_context(|| format!("Failed to set permissions on {}", dir.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populate(dir: &Path) {
        fs::create_dir_all(dir.join("boot/grub")).unwrap();
        fs::write(dir.join("boot/grub/grub.cfg"), "set timeout=3\n").unwrap();
        fs::write(dir.join("sbin-tool"), "#!/bin/sh\n").unwrap();
        fs::set_permissions(dir.join("sbin-tool"), fs::Permissions::from_mode(0o500)).unwrap();
        symlink("boot/grub/grub.cfg", dir.join("link")).unwrap();
    }

    #[test]
    fn test_image_id_validation() {
        assert!(ImageId::parse(&"0".repeat(64)).is_ok());
        assert!(ImageId::parse(&"A".repeat(64)).is_err());
        assert!(ImageId::parse("abc").is_err());
        assert_eq!(ImageId::parse(&"f".repeat(64)).unwrap().short(), "ffffffffffff");
    }

    #[test]
    fn test_resolve_rejects_escape() {
        let root = Path::new("/store/work");
        assert_eq!(resolve_in(root, "/boot/grub.cfg").unwrap(), root.join("boot/grub.cfg"));
        assert_eq!(resolve_in(root, "efi/./grubenv").unwrap(), root.join("efi/grubenv"));
        assert_eq!(resolve_in(root, "/").unwrap(), root);
        assert_eq!(
            resolve_in(root, "../etc/passwd"),
            Err(BuildError::PathEscapesImage("../etc/passwd".into()))
        );
    }

    #[test]
    fn test_digest_depends_on_content_and_mode() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        populate(a.path());
        populate(b.path());
        assert_eq!(tree_digest(a.path()).unwrap(), tree_digest(b.path()).unwrap());

        fs::set_permissions(b.path().join("sbin-tool"), fs::Permissions::from_mode(0o755)).unwrap();
        assert_ne!(tree_digest(a.path()).unwrap(), tree_digest(b.path()).unwrap());
    }

    #[test]
    fn test_checkout_commit_roundtrip() {
        let root = tempfile::tempdir().unwrap();
        let store = DirImageStore::open(root.path()).unwrap();
        let src = tempfile::tempdir().unwrap();
        populate(src.path());

        let id = store.import_dir(src.path()).unwrap();
        assert_eq!(store.resolve(&id), Some(id.clone()));

        let copy = store.checkout(&id).unwrap();
        assert_eq!(
            fs::read_link(copy.path().join("link")).unwrap(),
            PathBuf::from("boot/grub/grub.cfg")
        );
        let unchanged = store.commit(&copy).unwrap();
        assert_eq!(unchanged, id);

        fs::create_dir_all(copy.resolve("/etc").unwrap()).unwrap();
        fs::write(copy.resolve("/etc/hostname").unwrap(), "abforge\n").unwrap();
        let changed = store.commit(&copy).unwrap();
        assert_ne!(changed, id);
        assert_eq!(
            fs::read_to_string(store.locate(&changed, "/etc/hostname").unwrap()).unwrap(),
            "abforge\n"
        );
        assert!(store.locate(&id, "/etc/hostname").is_err());
    }

    #[test]
    fn test_working_copy_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let store = DirImageStore::open(root.path()).unwrap();
        let scratch = store.scratch().unwrap();
        let copy = store.checkout(&scratch).unwrap();
        let path = copy.path().to_path_buf();
        assert!(path.is_dir());
        drop(copy);
        assert!(!path.exists());
    }

    #[test]
    fn test_scratch_is_stable_and_unknown_images_fail() {
        let root = tempfile::tempdir().unwrap();
        let store = DirImageStore::open(root.path()).unwrap();
        assert_eq!(store.scratch().unwrap(), store.scratch().unwrap());

        let missing = ImageId::parse(&"1".repeat(64)).unwrap();
        assert_eq!(store.resolve(&missing), None);
        let err = store.checkout(&missing).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::UnknownImage(_))
        ));
    }
}
