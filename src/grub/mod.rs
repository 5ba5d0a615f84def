//! GRUB support: environment blocks and core image generation.

pub mod env;
pub mod mkimage;

pub use env::{GrubEnv, GrubMkenv, GRUBENV_SIZE};
pub use mkimage::GrubMkimage;
