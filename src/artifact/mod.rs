//! Filesystem image steps backed by external tools.
//!
//! The tools' outputs are opaque blobs to the rest of the crate; only their
//! size and location matter to the disk assembly.

pub mod squashfs;
pub mod vfat;

pub use squashfs::Mksquashfs;
pub use vfat::Vfat;
