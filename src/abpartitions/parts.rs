//! Partition pipelines and the end-to-end A/B disk build.
//!
//! Each partition is its own image built from scratch (or from a source
//! tree) and ends with its payload at [`PAYLOAD_FILE`]. The boot partitions
//! and the root slot do not depend on each other and are built concurrently;
//! the disk step then consumes all of them.

use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use super::root::{root_partition_step, RootPartitionConfig};
use super::script::{render_boot_script, AbState};
use super::{assemble_disk, AbDiskConfig, AbDiskLayout, AbDiskPayloads, PAYLOAD_FILE};
use crate::artifact::{Mksquashfs, Vfat};
use crate::build::{
    AddFiles, AtomicStep, BuildStats, FileInImage, Fingerprint, ImageBuilder, ImageId, ImageStore,
    MemFile, Payload, Step, WorkingCopy,
};
use crate::cache::{hash_file, BuildCache};
use crate::grub::{GrubMkenv, GrubMkimage};

const BIOS_CORE_FILE: &str = "/abforge_grub_core.img";
const BIOS_BOOT_FILE: &str = "/abforge_grub_boot.img";
const EFI_DIR: &str = "/efi";
const EFI_LOADER: &str = "/efi/EFI/boot/bootx64.efi";

/// Store and cache shared by every pipeline of one build.
#[derive(Clone)]
pub struct AbBuildContext {
    pub store: Arc<dyn ImageStore>,
    pub cache: Option<Arc<dyn BuildCache>>,
}

impl AbBuildContext {
    pub fn new(store: Arc<dyn ImageStore>, cache: Option<Arc<dyn BuildCache>>) -> Self {
        Self { store, cache }
    }

    /// Run `step` on `base` (scratch when `None`).
    fn run(&self, base: Option<ImageId>, step: &Step) -> Result<ImageBuilder> {
        let builder = match base {
            Some(image) => ImageBuilder::new(self.store.clone(), image),
            None => ImageBuilder::from_scratch(self.store.clone())?,
        };
        let mut builder = builder.with_cache(self.cache.clone());
        builder.execute_step(step)?;
        Ok(builder)
    }
}

/// GRUB core image and boot sector template for BIOS boot.
pub fn bios_partition_step(config: &AbDiskConfig) -> Step {
    Step::atomic(GrubMkimage {
        target: "i386-pc".to_string(),
        prefix: config.grub_prefix(),
        modules: ["biosdisk", "part_gpt", "squash4"].map(String::from).to_vec(),
        config: None,
        output_core: BIOS_CORE_FILE.to_string(),
        output_boot: Some(BIOS_BOOT_FILE.to_string()),
        grub_lib_dir: config.grub_lib_dir.clone(),
    })
}

/// FAT image with the initial environment block and, for EFI, the loader.
pub fn grubenv_partition_step(config: &AbDiskConfig) -> Result<Step> {
    let grubenv = format!("{}/{}", EFI_DIR, config.grubenv_path.trim_start_matches('/'));
    let mut steps = vec![Step::atomic(GrubMkenv::new(grubenv, &AbState::INITIAL.to_env()?))];
    if config.boot_type.uses_efi() {
        steps.push(Step::atomic(GrubMkimage {
            target: "x86_64-efi".to_string(),
            prefix: config.grub_prefix(),
            modules: ["part_gpt", "squash4"].map(String::from).to_vec(),
            config: None,
            output_core: EFI_LOADER.to_string(),
            output_boot: None,
            grub_lib_dir: config.grub_lib_dir.clone(),
        }));
    }
    steps.push(Step::atomic(Vfat::new(
        EFI_DIR,
        PAYLOAD_FILE,
        config.effective_efi_size(),
    )));
    Ok(Step::sequence(steps))
}

/// Selection script on top of the GRUB module tree, packed as squashfs.
pub fn grub_partition_step(config: &AbDiskConfig) -> Step {
    let script = render_boot_script(&config.script_config());
    Step::sequence([
        AddFiles::new().file("/grub.cfg", MemFile::new(script)).into_step(),
        Step::atomic(Mksquashfs::new(".", PAYLOAD_FILE)),
    ])
}

/// Assembles the disk from the partition payloads.
#[derive(Serialize)]
pub struct AbDiskStep {
    #[serde(skip)]
    store: Arc<dyn ImageStore>,
    pub config: AbDiskConfig,
    /// GRUB core image and boot sector template.
    pub bios: Option<(FileInImage, FileInImage)>,
    pub grubenv: FileInImage,
    pub grub: FileInImage,
    pub root: Option<Payload>,
}

#[derive(Serialize)]
struct DiskKey<'a> {
    step: &'a AbDiskStep,
    /// Image references are content addressed; host payloads are hashed.
    root_digest: Option<String>,
}

impl AbDiskStep {
    pub fn new(
        store: Arc<dyn ImageStore>,
        config: AbDiskConfig,
        bios: Option<(FileInImage, FileInImage)>,
        grubenv: FileInImage,
        grub: FileInImage,
        root: Option<Payload>,
    ) -> Self {
        Self {
            store,
            config,
            bios,
            grubenv,
            grub,
            root,
        }
    }

    fn payloads(&self) -> Result<AbDiskPayloads> {
        let store = &*self.store;
        let (bios_core, bios_boot) = match &self.bios {
            Some((core, boot)) => (Some(core.locate(store)?), Some(boot.locate(store)?)),
            None => (None, None),
        };
        Ok(AbDiskPayloads {
            bios_core,
            bios_boot,
            grubenv: self.grubenv.locate(store)?,
            grub: self.grub.locate(store)?,
            root: self.root.as_ref().map(|p| p.locate(store)).transpose()?,
        })
    }
}

impl AtomicStep for AbDiskStep {
    fn describe(&self) -> String {
        format!("assemble {} A/B disk", self.config.boot_type)
    }

    fn fingerprint(&self) -> Result<Option<Fingerprint>> {
        let root_digest = match &self.root {
            Some(Payload::Host(path)) => Some(hash_file(path)?),
            _ => None,
        };
        Fingerprint::of(
            "ABPARTITIONSDISK",
            &DiskKey {
                step: self,
                root_digest,
            },
        )
        .map(Some)
    }

    fn run(&self, copy: &WorkingCopy) -> Result<()> {
        let layout = AbDiskLayout::plan(&self.config, self.payloads()?)?;
        assemble_disk(&copy.resolve(PAYLOAD_FILE)?, &layout, self.config.disk_guid)?;
        Ok(())
    }
}

/// Where slot A's initial contents come from.
#[derive(Debug, Clone)]
pub enum RootSource {
    /// Root filesystem tree; slot files are added and it is packed as squashfs.
    Tree {
        image: ImageId,
        config: RootPartitionConfig,
    },
    /// Ready-made filesystem image written as is.
    Prebuilt(Payload),
}

#[derive(Debug, Clone)]
pub struct AbBuildInputs {
    pub config: AbDiskConfig,
    /// Image holding GRUB's module directories at its root.
    pub grub_modules: ImageId,
    /// Slot A stays empty when unset.
    pub root: Option<RootSource>,
}

#[derive(Debug, Clone)]
pub struct AbBuildOutput {
    /// The finished disk image.
    pub disk: FileInImage,
    pub stats: BuildStats,
}

async fn blocking<T, F>(task: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .context("Build task panicked")?
}

/// Build every partition, then the disk.
pub async fn build_ab_disk(ctx: AbBuildContext, inputs: AbBuildInputs) -> Result<AbBuildOutput> {
    let config = inputs.config;

    let bios = {
        let (ctx, config) = (ctx.clone(), config.clone());
        blocking(move || {
            if !config.boot_type.uses_bios() {
                return Ok(None);
            }
            let builder = ctx.run(None, &bios_partition_step(&config))?;
            Ok(Some((
                (builder.file(BIOS_CORE_FILE), builder.file(BIOS_BOOT_FILE)),
                builder.stats(),
            )))
        })
    };
    let grubenv = {
        let (ctx, config) = (ctx.clone(), config.clone());
        blocking(move || {
            let builder = ctx.run(None, &grubenv_partition_step(&config)?)?;
            Ok((builder.file(PAYLOAD_FILE), builder.stats()))
        })
    };
    let grub = {
        let (ctx, config, base) = (ctx.clone(), config.clone(), inputs.grub_modules);
        blocking(move || {
            let builder = ctx.run(Some(base), &grub_partition_step(&config))?;
            Ok((builder.file(PAYLOAD_FILE), builder.stats()))
        })
    };
    let root = {
        let (ctx, source) = (ctx.clone(), inputs.root);
        blocking(move || match source {
            None => Ok(None),
            Some(RootSource::Prebuilt(payload)) => Ok(Some((payload, BuildStats::default()))),
            Some(RootSource::Tree { image, config }) => {
                let builder = ctx.run(Some(image), &root_partition_step(&config))?;
                Ok(Some((Payload::from(builder.file(PAYLOAD_FILE)), builder.stats())))
            }
        })
    };

    let (bios, grubenv, grub, root) = tokio::try_join!(bios, grubenv, grub, root)?;

    let mut stats = grubenv.1 + grub.1;
    let bios = bios.map(|(files, s)| {
        stats += s;
        files
    });
    let root = root.map(|(payload, s)| {
        stats += s;
        payload
    });

    let disk_step = Step::atomic(AbDiskStep::new(
        ctx.store.clone(),
        config,
        bios,
        grubenv.0,
        grub.0,
        root,
    ));
    let builder = blocking(move || ctx.run(None, &disk_step)).await?;
    stats += builder.stats();

    let disk = builder.file(PAYLOAD_FILE);
    info!(
        "A/B disk ready in image {} ({} steps run, {} reused)",
        disk.image.short(),
        stats.executed,
        stats.reused
    );
    Ok(AbBuildOutput { disk, stats })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abpartitions::BootType;

    #[test]
    fn test_bios_step_targets_grub_partition() {
        let step = bios_partition_step(&AbDiskConfig::default());
        let atoms = step.atoms();
        assert_eq!(atoms.len(), 1);
        assert_eq!(atoms[0].describe(), "grub-mkimage i386-pc -> /abforge_grub_core.img");
    }

    #[test]
    fn test_grubenv_step_skips_efi_loader_for_bios() {
        let efi = grubenv_partition_step(&AbDiskConfig::default()).unwrap();
        assert_eq!(efi.atoms().len(), 3);

        let bios = AbDiskConfig {
            boot_type: BootType::Bios,
            ..Default::default()
        };
        let atoms = grubenv_partition_step(&bios).unwrap().atoms();
        assert_eq!(atoms.len(), 2);
        assert_eq!(atoms[0].describe(), "grubenv /efi/grubenv (2 variables)");
        assert!(atoms[1].describe().starts_with("vfat /efi -> /abforge.img"));
    }

    #[test]
    fn test_prefix_follows_boot_type() {
        let efi = AbDiskConfig {
            boot_type: BootType::Efi,
            ..Default::default()
        };
        assert_eq!(efi.grub_prefix(), "(hd0,gpt2)/");
        assert_eq!(AbDiskConfig::default().grub_prefix(), "(hd0,gpt3)/");
    }
}
