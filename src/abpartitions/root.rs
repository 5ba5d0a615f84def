//! Root slot contents: the per-slot GRUB config and the on-device update tool.

use serde::Serialize;

use super::script::PARAMS_VAR;
use super::PAYLOAD_FILE;
use crate::artifact::Mksquashfs;
use crate::build::{AddFiles, MemFile, Step};

/// Mount point the update tool uses for the grubenv partition.
const GRUBENV_MOUNT: &str = "/run/abforge-ab-grubenv";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RootPartitionConfig {
    pub kernel_path: String,
    pub initrd_path: Option<String>,
    /// Extra kernel arguments after the A/B parameters.
    pub kernel_cmdline: Option<String>,
    /// Must match the path the boot script loads with `configfile`.
    pub root_grub_cfg: String,
    pub update_tool_path: String,
}

impl Default for RootPartitionConfig {
    fn default() -> Self {
        Self {
            kernel_path: "/boot/vmlinuz-lts".to_string(),
            initrd_path: Some("/boot/initramfs-lts".to_string()),
            kernel_cmdline: None,
            root_grub_cfg: "/boot/grub.cfg".to_string(),
            update_tool_path: "/sbin/abforge-ab".to_string(),
        }
    }
}

/// GRUB config loaded from the root slot after selection.
pub fn render_root_grub_cfg(cfg: &RootPartitionConfig) -> String {
    let mut out = format!("linux {} ${}", cfg.kernel_path, PARAMS_VAR);
    if let Some(extra) = cfg.kernel_cmdline.as_deref().filter(|s| !s.is_empty()) {
        out.push(' ');
        out.push_str(extra);
    }
    out.push('\n');
    if let Some(initrd) = cfg.initrd_path.as_deref().filter(|s| !s.is_empty()) {
        out.push_str(&format!("initrd {}\n", initrd));
    }
    out
}

/// Shell tool installed in every root slot.
///
/// Commands: `show` (default), `update` (image on stdin, written to the
/// other slot), `cancel-update`, `mark-stable`, `reboot-if-unstable`.
pub fn render_update_tool() -> String {
    UPDATE_TOOL.replace("@MOUNT@", GRUBENV_MOUNT)
}

const UPDATE_TOOL: &str = r#"#!/bin/sh
set -e

read_cmdline() {
  sed -nE 's/^(.*[[:space:]])?'"$1"'=([^[:space:]]*)([[:space:]].*)?$/\2/p' /proc/cmdline
}

AB_CURRENT="$(read_cmdline abforge_current)"
AB_CURRENT_ROOT="$(read_cmdline root)"
AB_OTHER_ROOT="$(read_cmdline abforge_other_root)"
AB_GRUBENV="$(read_cmdline abforge_grubenv)"
AB_GRUBENV_DEVICE="$(read_cmdline abforge_grubenv_device)"

if [ -z "$AB_CURRENT" ] || [ -z "$AB_OTHER_ROOT" ] || [ -z "$AB_GRUBENV" ] || [ -z "$AB_GRUBENV_DEVICE" ] ; then
  echo "Not running on an abforge A/B disk."
  exit 1
fi

case "$AB_CURRENT" in
  a) AB_OTHER=b ;;
  b) AB_OTHER=a ;;
  *)
    echo "Invalid abforge_current value: $AB_CURRENT"
    exit 1
    ;;
esac

mkdir -p @MOUNT@
if ! mountpoint -q @MOUNT@ ; then
  mount -o ro -t vfat "$AB_GRUBENV_DEVICE" @MOUNT@
fi

read_grubenv() {
  grub-editenv "@MOUNT@$AB_GRUBENV" list | sed -n 's/^'"$1"'=//p'
}

update_grubenv() {
  mount -o remount,rw @MOUNT@
  grub-editenv "@MOUNT@$AB_GRUBENV" set "$@"
  mount -o remount,ro @MOUNT@
}

AB_STABLE="$(read_grubenv abforge_stable)"
AB_NEW="$(read_grubenv abforge_new)"

case "$*" in
  show|'')
    echo "Current: $AB_CURRENT"
    echo "Current root: $AB_CURRENT_ROOT"
    echo "Other: $AB_OTHER"
    echo "Other root: $AB_OTHER_ROOT"
    echo "Stable: $AB_STABLE"
    if [ "$AB_STABLE" != "$AB_CURRENT" ] ; then
      echo "Warning: current system is not marked as stable!"
    fi
    if [ "$AB_NEW" != n ] ; then
      echo "Warning: next reboot will be on $AB_NEW"
    fi
    ;;
  update)
    if [ "$AB_STABLE" != "$AB_CURRENT" ] ; then
      echo "Current system is not marked as stable!"
      echo "Use mark-stable or reboot before updating."
      exit 1
    fi
    echo "Writing update to $AB_OTHER_ROOT..."
    dd of="$AB_OTHER_ROOT" bs=1M
    sync
    update_grubenv abforge_new="$AB_OTHER"
    echo "Next reboot will be on $AB_OTHER. Use cancel-update to undo."
    ;;
  cancel-update)
    if [ "$AB_NEW" != n ] ; then
      update_grubenv abforge_new=n
      echo "Update cancelled, next reboot will be on $AB_STABLE"
    else
      echo "There is no update in progress."
    fi
    ;;
  mark-stable)
    if [ "$AB_STABLE" != "$AB_CURRENT" ] ; then
      update_grubenv abforge_stable="$AB_CURRENT"
      echo "Current system marked as stable."
    else
      echo "Current system was already marked as stable."
    fi
    ;;
  reboot-if-unstable)
    if [ "$AB_STABLE" != "$AB_CURRENT" ] ; then
      echo "Current system is not marked as stable, rebooting..."
      reboot
    fi
    ;;
  *)
    echo "Invalid command: $*"
    exit 1
    ;;
esac
"#;

/// Add the slot files to a root image and pack it as squashfs at the image
/// root.
pub fn root_partition_step(cfg: &RootPartitionConfig) -> Step {
    let files = AddFiles::new()
        .file(&cfg.root_grub_cfg, MemFile::new(render_root_grub_cfg(cfg)))
        .file(&cfg.update_tool_path, MemFile::new(render_update_tool()).mode(0o500));
    Step::sequence([
        files.into_step(),
        Step::atomic(Mksquashfs::new(".", PAYLOAD_FILE)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_grub_cfg() {
        let cfg = RootPartitionConfig {
            kernel_cmdline: Some("quiet".into()),
            ..Default::default()
        };
        assert_eq!(
            render_root_grub_cfg(&cfg),
            "linux /boot/vmlinuz-lts $abforge_params quiet\ninitrd /boot/initramfs-lts\n"
        );

        let bare = RootPartitionConfig {
            initrd_path: None,
            ..Default::default()
        };
        assert_eq!(render_root_grub_cfg(&bare), "linux /boot/vmlinuz-lts $abforge_params\n");
    }

    #[test]
    fn test_update_tool() {
        let tool = render_update_tool();
        assert!(tool.starts_with("#!/bin/sh\nset -e\n"));
        assert!(!tool.contains("@MOUNT@"));
        assert!(tool.contains("mount -o ro -t vfat \"$AB_GRUBENV_DEVICE\" /run/abforge-ab-grubenv"));
        for command in ["show|''", "update)", "cancel-update)", "mark-stable)", "reboot-if-unstable)"] {
            assert!(tool.contains(command), "missing {}", command);
        }
        assert!(tool.contains("update_grubenv abforge_new=\"$AB_OTHER\""));
    }

    #[test]
    fn test_step_shape() {
        let step = root_partition_step(&RootPartitionConfig::default());
        let atoms = step.atoms();
        assert_eq!(atoms.len(), 2);
        assert!(atoms[1].describe().contains("/abforge.img"));
    }
}
