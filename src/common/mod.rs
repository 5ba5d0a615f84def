//! Shared file helpers.

pub mod files;

pub use files::{prepare_output_file, write_file_mode, write_file_with_dirs};
