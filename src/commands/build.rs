//! Build command - runs every partition pipeline and assembles the disk.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::PathBuf;

use crate::abpartitions::{
    build_ab_disk, AbBuildContext, AbBuildInputs, AbDiskConfig, RootPartitionConfig, RootSource,
};
use crate::build::{ImageStore, Payload};
use crate::common::prepare_output_file;
use crate::config::Config;
use crate::timing::Timer;

use super::open_store;

/// Inputs of a full build.
pub struct BuildArgs {
    pub output: PathBuf,
    /// Directory with GRUB's platform module directories.
    pub grub_dir: PathBuf,
    /// Root filesystem tree for slot A.
    pub root_dir: Option<PathBuf>,
    /// Ready-made slot A filesystem image.
    pub root_image: Option<PathBuf>,
    pub disk: AbDiskConfig,
    pub root: RootPartitionConfig,
}

/// Execute the build command.
pub async fn cmd_build(config: &Config, args: BuildArgs) -> Result<()> {
    println!("=== A/B Disk Build ===\n");
    let timer = Timer::start("A/B disk build");

    if args.root_dir.is_some() && args.root_image.is_some() {
        bail!("Use either --root-dir or --root-image, not both.");
    }
    if !args.grub_dir.is_dir() {
        bail!(
            "GRUB directory {} not found. Install GRUB or pass --grub-dir.",
            args.grub_dir.display()
        );
    }

    let (store, cache) = open_store(config)?;
    println!("  Image store: {}", config.store_dir.display());
    if cache.is_none() {
        println!("  Step cache: disabled");
    }

    let grub_modules = store.import_dir(&args.grub_dir)?;
    let root = match (args.root_dir, args.root_image) {
        (Some(dir), _) => Some(RootSource::Tree {
            image: store.import_dir(&dir)?,
            config: args.root,
        }),
        (None, Some(image)) => Some(RootSource::Prebuilt(Payload::Host(image))),
        (None, None) => None,
    };

    let mut disk = args.disk;
    disk.grub_lib_dir = args.grub_dir;
    let boot_type = disk.boot_type;

    let ctx = AbBuildContext::new(store.clone(), cache);
    let built = build_ab_disk(
        ctx,
        AbBuildInputs {
            config: disk,
            grub_modules,
            root,
        },
    )
    .await?;

    let source = built.disk.locate(&*store)?;
    let output = prepare_output_file(&args.output)?;
    fs::copy(&source, &output)
        .with_context(|| format!("Failed to copy disk image to {}", output.display()))?;

    timer.finish();
    println!("\n=== Build Complete ===");
    println!("  Boot type: {}", boot_type);
    println!("  Disk image: {}", output.display());
    println!("  Image: {}", built.disk.image);
    println!(
        "  Steps: {} run, {} reused",
        built.stats.executed, built.stats.reused
    );
    Ok(())
}
