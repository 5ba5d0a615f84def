//! Incremental image build engine.
//!
//! Images are content-addressed directory trees in an [`ImageStore`]. An
//! [`ImageBuilder`] applies [`Step`]s to its current image one at a time,
//! consulting a [`BuildCache`](crate::cache::BuildCache) keyed by
//! `(image, step fingerprint)` to skip work it has already done.

mod builder;
mod file_in_image;
mod step;
mod steps;
mod store;

pub use builder::{BuildStats, ImageBuilder};
pub use file_in_image::{FileInImage, Payload};
pub use step::{AtomicStep, FnStep, Fingerprint, Step};
pub use steps::{AddFiles, FileSource, MemFile, Run};
pub use store::{copy_tree, resolve_in, tree_digest, DirImageStore, ImageId, ImageStore, WorkingCopy};
