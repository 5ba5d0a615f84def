//! References to files inside committed images.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::store::{ImageId, ImageStore};

/// A file at `path` inside image `image`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInImage {
    pub image: ImageId,
    pub path: String,
}

impl FileInImage {
    pub fn new(image: ImageId, path: impl Into<String>) -> Self {
        Self {
            image,
            path: path.into(),
        }
    }

    /// Host path of the file, read-only by convention.
    pub fn locate(&self, store: &dyn ImageStore) -> Result<PathBuf> {
        store.locate(&self.image, &self.path)
    }
}

/// A payload that lives either on the host or inside an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Payload {
    Host(PathBuf),
    Image(FileInImage),
}

impl Payload {
    pub fn locate(&self, store: &dyn ImageStore) -> Result<PathBuf> {
        match self {
            Payload::Host(path) => Ok(path.clone()),
            Payload::Image(file) => file.locate(store),
        }
    }
}

impl From<FileInImage> for Payload {
    fn from(file: FileInImage) -> Self {
        Payload::Image(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::DirImageStore;
    use std::fs;

    #[test]
    fn test_locate_through_store() {
        let root = tempfile::tempdir().unwrap();
        let store = DirImageStore::open(root.path()).unwrap();
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("payload.img"), "data").unwrap();
        let image = store.import_dir(src.path()).unwrap();

        let file = FileInImage::new(image.clone(), "/payload.img");
        let located = file.locate(&store).unwrap();
        assert_eq!(fs::read_to_string(located).unwrap(), "data");

        let missing = Payload::Image(FileInImage::new(image, "missing.img"));
        assert!(missing.locate(&store).is_err());

        let host = Payload::Host(PathBuf::from("/tmp/x"));
        assert_eq!(host.locate(&store).unwrap(), PathBuf::from("/tmp/x"));
    }
}
