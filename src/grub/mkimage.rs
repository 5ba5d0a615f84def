//! GRUB core image generation with `grub-mkimage`.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::build::{tree_digest, AtomicStep, Fingerprint, WorkingCopy};
use crate::common::prepare_output_file;
use crate::process::{require_tool, Cmd};

/// Default location of GRUB's per-platform module directories.
pub const DEFAULT_GRUB_LIB_DIR: &str = "/usr/lib/grub";

/// Build a GRUB core image into the working copy.
///
/// `output_core` and `output_boot` are paths inside the image. When
/// `output_boot` is set, the platform's `boot.img` is copied there too.
#[derive(Debug, Clone, Serialize)]
pub struct GrubMkimage {
    /// GRUB platform, e.g. `i386-pc` or `x86_64-efi`.
    pub target: String,
    pub prefix: String,
    pub modules: Vec<String>,
    /// Embedded early configuration.
    pub config: Option<String>,
    pub output_core: String,
    pub output_boot: Option<String>,
    /// Host directory holding `<target>/` module directories.
    pub grub_lib_dir: PathBuf,
}

impl Default for GrubMkimage {
    fn default() -> Self {
        Self {
            target: "x86_64-efi".to_string(),
            prefix: "/boot/grub".to_string(),
            modules: Vec::new(),
            config: None,
            output_core: "/core.img".to_string(),
            output_boot: None,
            grub_lib_dir: PathBuf::from(DEFAULT_GRUB_LIB_DIR),
        }
    }
}

impl GrubMkimage {
    fn platform_dir(&self) -> PathBuf {
        self.grub_lib_dir.join(&self.target)
    }

    /// Arguments for grub-mkimage writing to `output`.
    pub fn args(&self, output: &Path, config_file: Option<&Path>) -> Vec<String> {
        let mut args = vec![
            "-O".to_string(),
            self.target.clone(),
            "-d".to_string(),
            self.platform_dir().to_string_lossy().into_owned(),
            "-p".to_string(),
            self.prefix.clone(),
            "-o".to_string(),
            output.to_string_lossy().into_owned(),
        ];
        if let Some(config) = config_file {
            args.push("-c".to_string());
            args.push(config.to_string_lossy().into_owned());
        }
        args.push("--".to_string());
        args.extend(self.modules.iter().cloned());
        args
    }
}

#[derive(Serialize)]
struct MkimageKey<'a> {
    step: &'a GrubMkimage,
    /// Contents of the platform module directory, when present.
    modules_digest: Option<String>,
}

impl AtomicStep for GrubMkimage {
    fn describe(&self) -> String {
        format!("grub-mkimage {} -> {}", self.target, self.output_core)
    }

    fn fingerprint(&self) -> Result<Option<Fingerprint>> {
        let platform = self.platform_dir();
        let modules_digest = if platform.is_dir() {
            Some(tree_digest(&platform)?.to_string())
        } else {
            None
        };
        Fingerprint::of(
            "GRUB-MKIMAGE",
            &MkimageKey {
                step: self,
                modules_digest,
            },
        )
        .map(Some)
    }

    fn run(&self, copy: &WorkingCopy) -> Result<()> {
        require_tool("grub-mkimage", "Install GRUB (grub2-tools or grub-common).")?;
        let core = prepare_output_file(&copy.resolve(&self.output_core)?)?;

        let scratch = tempfile::tempdir()?;
        let config_file = match &self.config {
            Some(config) => {
                let path = scratch.path().join("config.cfg");
                fs::write(&path, config)?;
                Some(path)
            }
            None => None,
        };

        Cmd::new("grub-mkimage")
            .args(self.args(&core, config_file.as_deref()))
            .error_msg(format!("grub-mkimage failed for target {}", self.target))
            .run()?;

        if let Some(boot) = &self.output_boot {
            let boot = prepare_output_file(&copy.resolve(boot)?)?;
            let template = self.platform_dir().join("boot.img");
            fs::copy(&template, &boot)
                .with_context(|| format!("Failed to copy {}", template.display()))?;
        }
        info!("GRUB {} core image written to {}", self.target, self.output_core);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args() {
        let step = GrubMkimage {
            target: "i386-pc".into(),
            prefix: "(hd0,gpt3)/".into(),
            modules: vec!["biosdisk".into(), "part_gpt".into(), "squash4".into()],
            ..Default::default()
        };
        let args = step.args(Path::new("/w/core.img"), Some(Path::new("/tmp/config.cfg")));
        assert_eq!(
            args,
            [
                "-O", "i386-pc", "-d", "/usr/lib/grub/i386-pc", "-p", "(hd0,gpt3)/", "-o",
                "/w/core.img", "-c", "/tmp/config.cfg", "--", "biosdisk", "part_gpt", "squash4"
            ]
        );
    }

    #[test]
    fn test_fingerprint_tracks_module_tree() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("x86_64-efi")).unwrap();
        fs::write(dir.path().join("x86_64-efi/part_gpt.mod"), "v1").unwrap();
        let step = GrubMkimage {
            grub_lib_dir: dir.path().to_path_buf(),
            ..Default::default()
        };

        let before = step.fingerprint().unwrap().unwrap();
        assert!(before.as_str().starts_with("GRUB-MKIMAGE-"));
        fs::write(dir.path().join("x86_64-efi/part_gpt.mod"), "v2").unwrap();
        assert_ne!(before, step.fingerprint().unwrap().unwrap());
    }
}
