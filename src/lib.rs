//! abforge library exports.
//!
//! The binary in `main.rs` is a thin clap front end over these modules; the
//! integration tests in `tests/` use them directly.

pub mod abpartitions;
pub mod artifact;
pub mod build;
pub mod cache;
pub mod commands;
pub mod common;
pub mod config;
pub mod disk;
pub mod error;
pub mod grub;
pub mod process;
pub mod timing;

pub use error::{BuildError, DiskError};
