//! abforge - bootable A/B disk image assembler.
//!
//! Builds GPT disk images with two root slots and a GRUB stage that picks
//! between them at boot:
//! - BIOS boot partition with GRUB's core image (optional)
//! - grubenv/EFI partition holding the persisted selection state
//! - GRUB partition with the selection script
//! - root slots A and B

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;
use tracing_subscriber::EnvFilter;

use abforge::abpartitions::{AbDiskConfig, AbDiskPayloads, BootType, RootPartitionConfig};
use abforge::commands::{self, build::BuildArgs, parse_part_spec, parse_size};
use abforge::config::Config;
use abforge::disk::{Guid, Partition};
use abforge::grub::mkimage::DEFAULT_GRUB_LIB_DIR;

#[derive(Parser)]
#[command(name = "abforge")]
#[command(about = "Bootable A/B disk image assembler")]
#[command(
    after_help = "QUICK START:\n  abforge build -o disk.img --root-dir rootfs/   Build a complete A/B disk\n  abforge show gpt disk.img                       Inspect the partition table\n  abforge clean all                               Remove cache and image store"
)]
struct Cli {
    /// Log debug output (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build every partition and the disk with the step engine
    Build {
        /// Output disk image
        #[arg(short, long)]
        output: PathBuf,
        /// Directory holding GRUB's i386-pc/ and x86_64-efi/ module directories
        #[arg(long, default_value = DEFAULT_GRUB_LIB_DIR)]
        grub_dir: PathBuf,
        /// Root filesystem tree for slot A
        #[arg(long)]
        root_dir: Option<PathBuf>,
        /// Ready-made filesystem image for slot A
        #[arg(long, conflicts_with = "root_dir")]
        root_image: Option<PathBuf>,
        #[command(flatten)]
        layout: LayoutArgs,
        #[command(flatten)]
        root: RootArgs,
    },

    /// Assemble an A/B disk from payload files
    Disk {
        /// Output disk image
        #[arg(short, long)]
        output: PathBuf,
        /// FAT image for the grubenv partition
        #[arg(long)]
        grubenv: PathBuf,
        /// Squashfs image for the GRUB partition
        #[arg(long)]
        grub: PathBuf,
        /// Filesystem image for slot A
        #[arg(long)]
        root: Option<PathBuf>,
        /// GRUB core.img (BIOS boot)
        #[arg(long)]
        bios_core: Option<PathBuf>,
        /// GRUB boot.img (BIOS boot)
        #[arg(long)]
        bios_boot: Option<PathBuf>,
        #[command(flatten)]
        layout: LayoutArgs,
    },

    /// Write a GPT to an image file
    Parted {
        /// Output image
        #[arg(short, long)]
        output: PathBuf,
        /// Partition as name:size[:type] (type: efi, bios, linux or a GUID)
        #[arg(long = "part", value_parser = parse_part_spec, required = true)]
        parts: Vec<Partition>,
        /// Disk GUID (random by default)
        #[arg(long, value_parser = Guid::from_str)]
        disk_guid: Option<Guid>,
    },

    /// Install GRUB's BIOS boot sector and core image into a GPT image
    BiosSetup {
        /// Disk image with a GPT
        #[arg(long)]
        image: PathBuf,
        /// Partition number receiving the core image (default: BIOS boot partition)
        #[arg(long)]
        partition: Option<usize>,
        /// GRUB boot.img
        #[arg(long)]
        boot_img: PathBuf,
        /// GRUB core.img
        #[arg(long)]
        core_img: PathBuf,
    },

    /// Create or edit a GRUB environment block file
    Grubenv {
        /// Environment block file
        file: PathBuf,
        #[command(subcommand)]
        action: GrubenvAction,
    },

    /// Show information
    Show {
        #[command(subcommand)]
        what: ShowTarget,
    },

    /// Remove the step cache and/or the image store
    Clean {
        #[command(subcommand)]
        what: Option<CleanTarget>,
    },
}

/// Partition layout and boot script options.
#[derive(Args)]
struct LayoutArgs {
    /// Boot type: bios, efi or both
    #[arg(long, default_value = "both", value_parser = BootType::from_str)]
    boot_type: BootType,
    /// Size of each root slot
    #[arg(long, default_value = "512M", value_parser = parse_size)]
    root_size: u64,
    /// Size of the grubenv/EFI FAT image (at least 33M)
    #[arg(long, default_value = "33M", value_parser = parse_size)]
    efi_size: u64,
    /// Fixed size of the BIOS boot partition (default: core image size)
    #[arg(long, value_parser = parse_size)]
    bios_size: Option<u64>,
    /// GRUB name of the boot disk
    #[arg(long, default_value = "hd0")]
    grub_device: String,
    /// Linux name of the boot disk
    #[arg(long, default_value = "/dev/sda")]
    linux_device: String,
    /// Path of the environment block in the grubenv partition
    #[arg(long, default_value = "/grubenv")]
    grubenv_path: String,
    /// GRUB menu timeout in seconds
    #[arg(long, default_value_t = 3)]
    timeout: u32,
    /// Extra lines for the boot script
    #[arg(long, default_value = "")]
    grub_extra_config: String,
    /// GRUB config each root slot provides
    #[arg(long, default_value = "/boot/grub.cfg")]
    root_grub_cfg: String,
    /// Disk GUID (random by default)
    #[arg(long, value_parser = Guid::from_str)]
    disk_guid: Option<Guid>,
}

impl LayoutArgs {
    fn into_config(self) -> AbDiskConfig {
        AbDiskConfig {
            boot_type: self.boot_type,
            bios_boot_partition_size: self.bios_size,
            efi_partition_size: self.efi_size,
            root_partition_size: self.root_size,
            grub_disk_device: self.grub_device,
            grubenv_path: self.grubenv_path,
            grub_timeout: self.timeout,
            grub_extra_config: self.grub_extra_config,
            linux_disk_device: self.linux_device,
            root_grub_cfg: self.root_grub_cfg,
            disk_guid: self.disk_guid,
            ..Default::default()
        }
    }
}

/// Root slot options.
#[derive(Args)]
struct RootArgs {
    /// Kernel path inside the root filesystem
    #[arg(long, default_value = "/boot/vmlinuz-lts")]
    kernel: String,
    /// Initrd path inside the root filesystem
    #[arg(long, default_value = "/boot/initramfs-lts")]
    initrd: String,
    /// Boot without an initrd
    #[arg(long)]
    no_initrd: bool,
    /// Extra kernel command line
    #[arg(long)]
    cmdline: Option<String>,
    /// Where the A/B update tool is installed
    #[arg(long, default_value = "/sbin/abforge-ab")]
    update_tool: String,
}

impl RootArgs {
    fn into_config(self, root_grub_cfg: &str) -> RootPartitionConfig {
        RootPartitionConfig {
            kernel_path: self.kernel,
            initrd_path: (!self.no_initrd).then_some(self.initrd),
            kernel_cmdline: self.cmdline,
            root_grub_cfg: root_grub_cfg.to_string(),
            update_tool_path: self.update_tool,
        }
    }
}

#[derive(Subcommand)]
enum GrubenvAction {
    /// Write a new block
    Create { assignments: Vec<String> },
    /// Set key=value assignments
    Set {
        #[arg(required = true)]
        assignments: Vec<String>,
    },
    /// Remove variables
    Unset {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Print every variable
    List,
}

#[derive(Subcommand)]
enum ShowTarget {
    /// Verify and print the GPT of an image
    Gpt { image: PathBuf },
    /// Show current configuration
    Config,
    /// Print the generated boot selection script
    BootScript {
        #[command(flatten)]
        layout: LayoutArgs,
    },
}

#[derive(Subcommand)]
enum CleanTarget {
    /// Remove the step cache (default)
    Cache,
    /// Remove the image store
    Store,
    /// Remove both
    All,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let base_dir = std::env::current_dir()?;
    let config = Config::load(&base_dir);

    match cli.command {
        Commands::Build {
            output,
            grub_dir,
            root_dir,
            root_image,
            layout,
            root,
        } => {
            let disk = layout.into_config();
            let root = root.into_config(&disk.root_grub_cfg);
            let args = BuildArgs {
                output,
                grub_dir,
                root_dir,
                root_image,
                disk,
                root,
            };
            commands::cmd_build(&config, args).await?;
        }

        Commands::Disk {
            output,
            grubenv,
            grub,
            root,
            bios_core,
            bios_boot,
            layout,
        } => {
            let payloads = AbDiskPayloads {
                bios_core,
                bios_boot,
                grubenv,
                grub,
                root,
            };
            commands::cmd_disk(&output, &layout.into_config(), payloads)?;
        }

        Commands::Parted {
            output,
            parts,
            disk_guid,
        } => {
            commands::cmd_parted(&output, &parts, disk_guid)?;
        }

        Commands::BiosSetup {
            image,
            partition,
            boot_img,
            core_img,
        } => {
            commands::cmd_bios_setup(&image, partition, &boot_img, &core_img)?;
        }

        Commands::Grubenv { file, action } => {
            use commands::grubenv::GrubenvAction as Action;
            let action = match action {
                GrubenvAction::Create { assignments } => Action::Create(assignments),
                GrubenvAction::Set { assignments } => Action::Set(assignments),
                GrubenvAction::Unset { keys } => Action::Unset(keys),
                GrubenvAction::List => Action::List,
            };
            commands::cmd_grubenv(&file, action)?;
        }

        Commands::Show { what } => {
            let show_target = match what {
                ShowTarget::Gpt { image } => commands::show::ShowTarget::Gpt(image),
                ShowTarget::Config => commands::show::ShowTarget::Config,
                ShowTarget::BootScript { layout } => {
                    commands::show::ShowTarget::BootScript(layout.into_config())
                }
            };
            commands::cmd_show(show_target, &config)?;
        }

        Commands::Clean { what } => {
            let clean_target = match what {
                None | Some(CleanTarget::Cache) => commands::clean::CleanTarget::Cache,
                Some(CleanTarget::Store) => commands::clean::CleanTarget::Store,
                Some(CleanTarget::All) => commands::clean::CleanTarget::All,
            };
            commands::cmd_clean(&config, clean_target)?;
        }
    }

    Ok(())
}
