//! GUIDs as stored in GPT structures.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::DiskError;

/// A 128-bit GUID.
///
/// On disk GPT uses the mixed-endian layout (first three groups little
/// endian), which is what `to_disk_bytes` produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Guid(Uuid);

impl Guid {
    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    /// Generate a fresh random (v4) GUID.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse hex-with-dashes text such as `C12A7328-F81F-11D2-BA4B-00A0C93EC93B`.
    ///
    /// Dashes may appear anywhere; exactly 16 bytes of hex must remain.
    pub fn parse(text: &str) -> Result<Self, DiskError> {
        let hex: String = text.chars().filter(|c| *c != '-').collect();
        if hex.len() != 32 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DiskError::InvalidGuid(text.to_string()));
        }
        Uuid::try_parse(&hex)
            .map(Self)
            .map_err(|_| DiskError::InvalidGuid(text.to_string()))
    }

    pub fn to_disk_bytes(&self) -> [u8; 16] {
        self.0.to_bytes_le()
    }

    pub fn from_disk_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes_le(bytes))
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}", self.0.hyphenated())
    }
}

impl FromStr for Guid {
    type Err = DiskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Guid {
    type Error = DiskError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Guid> for String {
    fn from(guid: Guid) -> Self {
        guid.to_string()
    }
}

/// Well-known GPT partition type GUIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionType {
    EfiSystem,
    BiosBoot,
    LinuxData,
}

impl PartitionType {
    pub const fn guid(self) -> Guid {
        match self {
            PartitionType::EfiSystem => Guid::from_u128(0xC12A7328_F81F_11D2_BA4B_00A0C93EC93B),
            PartitionType::BiosBoot => Guid::from_u128(0x21686148_6449_6E6F_744E_656564454649),
            PartitionType::LinuxData => Guid::from_u128(0x0FC63DAF_8483_4772_8E79_3D69D8477DE4),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PartitionType::EfiSystem => "efi",
            PartitionType::BiosBoot => "bios",
            PartitionType::LinuxData => "linux",
        }
    }

    /// Name a type GUID if it is one of the well-known ones.
    pub fn from_guid(guid: Guid) -> Option<Self> {
        [
            PartitionType::EfiSystem,
            PartitionType::BiosBoot,
            PartitionType::LinuxData,
        ]
        .into_iter()
        .find(|t| t.guid() == guid)
    }
}

impl FromStr for PartitionType {
    type Err = DiskError;

    /// Accepts the short names `efi`, `bios`, `linux` or a literal GUID.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "efi" | "esp" => Ok(PartitionType::EfiSystem),
            "bios" | "bios-boot" => Ok(PartitionType::BiosBoot),
            "linux" => Ok(PartitionType::LinuxData),
            _ => PartitionType::from_guid(Guid::parse(s)?)
                .ok_or_else(|| DiskError::InvalidGuid(s.to_string())),
        }
    }
}
