//! A/B boot selection: the GRUB script and its Rust model.
//!
//! The persisted environment holds `abforge_stable` (slot booted by default)
//! and `abforge_new` (one-shot override, `n` when none). At every boot the
//! script picks a default and fallback slot, then consumes a pending
//! override by resetting it to `n`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::PartitionIndexes;
use crate::error::DiskError;
use crate::grub::GrubEnv;

pub const STABLE_VAR: &str = "abforge_stable";
pub const NEW_VAR: &str = "abforge_new";
pub const PARAMS_VAR: &str = "abforge_params";
/// Value of `abforge_new` when no update is pending.
pub const NO_UPDATE: &str = "n";

/// One of the two root slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub fn as_str(self) -> &'static str {
        match self {
            Slot::A => "a",
            Slot::B => "b",
        }
    }

    pub fn other(self) -> Slot {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    /// Menu entry title.
    fn title(self) -> &'static str {
        match self {
            Slot::A => "A",
            Slot::B => "B",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Slot {
    type Err = DiskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "a" => Ok(Slot::A),
            "b" => Ok(Slot::B),
            _ => Err(DiskError::InvalidSlot {
                key: STABLE_VAR.to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// `(stable, new)` with `new = None` meaning `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbState {
    pub stable: Slot,
    pub new: Option<Slot>,
}

/// Outcome of one boot-time evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootDecision {
    pub default: Slot,
    pub fallback: Slot,
    /// State after the evaluation.
    pub next: AbState,
    /// Whether the environment is written back.
    pub persist: bool,
}

impl AbState {
    /// State written at image build time.
    pub const INITIAL: AbState = AbState {
        stable: Slot::A,
        new: None,
    };

    /// Parse, rejecting anything outside `{a, b}` / `{a, b, n}`.
    pub fn from_env(env: &GrubEnv) -> Result<Self, DiskError> {
        let stable = env.get(STABLE_VAR).unwrap_or_default();
        let stable = stable.parse::<Slot>()?;
        let new = match env.get(NEW_VAR).unwrap_or_default() {
            NO_UPDATE => None,
            other => Some(other.parse::<Slot>().map_err(|_| DiskError::InvalidSlot {
                key: NEW_VAR.to_string(),
                value: other.to_string(),
            })?),
        };
        Ok(Self { stable, new })
    }

    /// Parse the way the boot script reads the environment: an illegal
    /// `stable` counts as `a`, an illegal `new` as no update.
    pub fn from_env_lenient(env: &GrubEnv) -> Self {
        let stable = env
            .get(STABLE_VAR)
            .and_then(|s| s.parse().ok())
            .unwrap_or(Slot::A);
        let new = env.get(NEW_VAR).and_then(|s| s.parse().ok());
        Self { stable, new }
    }

    pub fn to_env(self) -> Result<GrubEnv, DiskError> {
        let mut env = GrubEnv::new();
        env.set(STABLE_VAR, self.stable.as_str())?;
        env.set(NEW_VAR, self.new.map(Slot::as_str).unwrap_or(NO_UPDATE))?;
        Ok(env)
    }

    /// Apply the selection rule once.
    pub fn evaluate(self) -> BootDecision {
        let default = if self.new == Some(Slot::B) || (self.new != Some(Slot::A) && self.stable == Slot::B) {
            Slot::B
        } else {
            Slot::A
        };
        BootDecision {
            default,
            fallback: default.other(),
            next: AbState {
                stable: self.stable,
                new: None,
            },
            persist: self.new.is_some(),
        }
    }
}

/// Run the generated script's logic against a raw environment, updating it
/// the way `save_env` would. Returns the default slot.
pub fn simulate_boot(env: &mut GrubEnv) -> Result<Slot, DiskError> {
    let stable_ok = matches!(env.get(STABLE_VAR), Some("a") | Some("b"));
    if !stable_ok {
        env.set(STABLE_VAR, Slot::A.as_str())?;
    }
    let state = AbState::from_env_lenient(env);
    let decision = state.evaluate();
    if env.get(NEW_VAR) != Some(NO_UPDATE) {
        env.set(NEW_VAR, NO_UPDATE)?;
    }
    Ok(decision.default)
}

/// Settings for the GRUB stage partition's `grub.cfg`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootScriptConfig {
    /// GRUB name of the boot disk.
    pub grub_disk_device: String,
    /// Path of the environment file inside the grubenv partition.
    pub grubenv_path: String,
    pub grub_timeout: u32,
    /// Inserted verbatim before the menu entries.
    pub grub_extra_config: String,
    /// Linux name of the boot disk; partition numbers are appended.
    pub linux_disk_device: String,
    /// Configuration file each root partition provides.
    pub root_grub_cfg: String,
    pub indexes: PartitionIndexes,
}

impl Default for BootScriptConfig {
    fn default() -> Self {
        Self {
            grub_disk_device: "hd0".to_string(),
            grubenv_path: "/grubenv".to_string(),
            grub_timeout: 3,
            grub_extra_config: String::new(),
            linux_disk_device: "/dev/sda".to_string(),
            root_grub_cfg: "/boot/grub.cfg".to_string(),
            indexes: PartitionIndexes::default(),
        }
    }
}

impl BootScriptConfig {
    fn root_index(&self, slot: Slot) -> u32 {
        match slot {
            Slot::A => self.indexes.root_a,
            Slot::B => self.indexes.root_b,
        }
    }

    fn grubenv_path_abs(&self) -> String {
        format!("/{}", self.grubenv_path.trim_start_matches('/'))
    }

    /// Kernel command line handed to the system booted from `slot`.
    pub fn kernel_params(&self, slot: Slot) -> String {
        let dev = &self.linux_disk_device;
        format!(
            "abforge_current={} abforge_grubenv_device={}{} abforge_grubenv={} abforge_other_root={}{} root={}{}",
            slot,
            dev,
            self.indexes.grubenv,
            self.grubenv_path_abs(),
            dev,
            self.root_index(slot.other()),
            dev,
            self.root_index(slot),
        )
    }
}

/// Generate the GRUB stage partition's `grub.cfg`.
pub fn render_boot_script(cfg: &BootScriptConfig) -> String {
    let disk = &cfg.grub_disk_device;
    let mut script = format!(
        r#"insmod all_video
set envfile=({disk},gpt{env_part}){env_path}
load_env --file $envfile {stable} {new}
if [ "${stable}" != a -a "${stable}" != b ] ; then
  set {stable}=a
  save_env --file $envfile {stable} {new}
fi
if [ ( "${new}" == b ) -o ( ( "${new}" != a ) -a ( "${stable}" == b ) ) ] ; then
  set default=b
  set fallback=a
else
  set default=a
  set fallback=b
fi
if [ "${new}" != n ] ; then
  set {new}=n
  save_env --file $envfile {stable} {new}
fi
export {params}
set timeout={timeout}
{extra}
"#,
        disk = disk,
        env_part = cfg.indexes.grubenv,
        env_path = cfg.grubenv_path_abs(),
        stable = STABLE_VAR,
        new = NEW_VAR,
        params = PARAMS_VAR,
        timeout = cfg.grub_timeout,
        extra = cfg.grub_extra_config,
    );
    for slot in [Slot::A, Slot::B] {
        script.push_str(&format!(
            "menuentry {title} --id={id} {{\n  set root=({disk},gpt{root})\n  set {params}=\"{kernel}\"\n  configfile {cfg_file}\n}}\n",
            title = slot.title(),
            id = slot,
            disk = disk,
            root = cfg.root_index(slot),
            params = PARAMS_VAR,
            kernel = cfg.kernel_params(slot),
            cfg_file = cfg.root_grub_cfg,
        ));
    }
    script
}
