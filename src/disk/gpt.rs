//! GUID Partition Table builder and verifier.
//!
//! Layout produced by [`PartitionTable::build`]:
//!
//! ```text
//! LBA 0                  protective MBR
//! LBA 1                  primary GPT header
//! LBA 2..34              primary entry array (128 x 128 bytes)
//! LBA 34..               partitions, each a whole number of MiB, back to back
//! LBA N-34..N-2          backup entry array
//! LBA N-1                backup GPT header
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::{debug, info};

use super::guid::Guid;
use super::layout::{round_up, Field};
use super::mbr;
use super::writer::{check_partitions, write_partitions, OffsetAndSize, OutputTarget, PartitionConfig};
use super::{ALIGNMENT_SECTORS, SECTOR_SIZE};
use crate::common::prepare_output_file;
use crate::error::DiskError;

/// Fixed number of partition entry slots.
pub const MAX_PARTITIONS: usize = 128;
/// Size of one partition entry.
pub const ENTRY_SIZE: usize = 128;
/// Maximum partition name length, in UTF-16 code units.
pub const NAME_UNITS: usize = 36;
/// Bytes covered by the header CRC.
pub const HEADER_SIZE: u32 = 0x5c;
/// GPT revision 1.0.
pub const REVISION: u32 = 0x0001_0000;
pub const SIGNATURE: &[u8; 8] = b"EFI PART";

const ENTRIES_BYTES: usize = MAX_PARTITIONS * ENTRY_SIZE;

/// Sectors reserved at each end of the disk: one boot/header sector, one
/// header sector and the entry array.
pub const TABLE_SECTORS: u64 =
    (2 * SECTOR_SIZE + ENTRIES_BYTES as u64).div_ceil(SECTOR_SIZE);

// Header fields.
const H_SIGNATURE: Field = Field::new(0x00, 8);
const H_REVISION: Field = Field::new(0x08, 4);
const H_SIZE: Field = Field::new(0x0c, 4);
const H_CRC: Field = Field::new(0x10, 4);
const H_CURRENT_LBA: Field = Field::new(0x18, 8);
const H_BACKUP_LBA: Field = Field::new(0x20, 8);
const H_FIRST_USABLE: Field = Field::new(0x28, 8);
const H_LAST_USABLE: Field = Field::new(0x30, 8);
const H_DISK_GUID: Field = Field::new(0x38, 16);
const H_ENTRIES_LBA: Field = Field::new(0x48, 8);
const H_ENTRY_COUNT: Field = Field::new(0x50, 4);
const H_ENTRY_SIZE: Field = Field::new(0x54, 4);
const H_ENTRIES_CRC: Field = Field::new(0x58, 4);

// Entry fields.
const E_TYPE: Field = Field::new(0x00, 16);
const E_GUID: Field = Field::new(0x10, 16);
const E_FIRST_LBA: Field = Field::new(0x20, 8);
const E_LAST_LBA: Field = Field::new(0x28, 8);
const E_ATTRIBUTES: Field = Field::new(0x30, 8);
const E_NAME: Field = Field::new(0x38, 2 * NAME_UNITS);

/// A partition to lay out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// Requested size in bytes; rounded up to whole MiB.
    pub size: u64,
    pub name: String,
    pub type_guid: Guid,
    /// Unique partition GUID; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<Guid>,
}

impl Partition {
    pub fn new(name: impl Into<String>, size: u64, type_guid: Guid) -> Self {
        Self {
            size,
            name: name.into(),
            type_guid,
            guid: None,
        }
    }

    pub fn with_guid(mut self, guid: Guid) -> Self {
        self.guid = Some(guid);
        self
    }
}

/// A fully computed GPT: geometry plus the encoded structures.
#[derive(Debug, Clone)]
pub struct PartitionTable {
    pub disk_guid: Guid,
    pub total_sectors: u64,
    /// One region per input partition, in input order.
    pub regions: Vec<OffsetAndSize>,
    mbr: [u8; SECTOR_SIZE as usize],
    primary_header: [u8; SECTOR_SIZE as usize],
    backup_header: [u8; SECTOR_SIZE as usize],
    entries: Vec<u8>,
}

impl PartitionTable {
    /// Compute geometry and encode every table structure.
    ///
    /// Fails before anything touches a disk if there are too many
    /// partitions or a name does not fit its entry.
    pub fn build(partitions: &[Partition], disk_guid: Option<Guid>) -> Result<Self, DiskError> {
        if partitions.len() > MAX_PARTITIONS {
            return Err(DiskError::TooManyPartitions {
                count: partitions.len(),
                max: MAX_PARTITIONS,
            });
        }

        let mut entries = vec![0u8; ENTRIES_BYTES];
        let mut regions = Vec::with_capacity(partitions.len());
        let mut cursor = TABLE_SECTORS;

        for (index, partition) in partitions.iter().enumerate() {
            let name = encode_name(&partition.name)?;
            let sectors = partition_sectors(partition.size);
            let first = cursor;
            let last = first + sectors - 1;
            cursor += sectors;

            let entry = &mut entries[index * ENTRY_SIZE..(index + 1) * ENTRY_SIZE];
            E_TYPE.put_bytes(entry, &partition.type_guid.to_disk_bytes());
            let guid = partition.guid.unwrap_or_else(Guid::random);
            E_GUID.put_bytes(entry, &guid.to_disk_bytes());
            E_FIRST_LBA.put_u64(entry, first);
            E_LAST_LBA.put_u64(entry, last);
            E_ATTRIBUTES.put_u64(entry, 0);
            E_NAME.put_bytes(entry, &name);

            regions.push(OffsetAndSize::new(first * SECTOR_SIZE, sectors * SECTOR_SIZE));
        }

        let total_sectors = cursor + TABLE_SECTORS;
        let disk_guid = disk_guid.unwrap_or_else(Guid::random);
        let backup_lba = total_sectors - 1;
        let backup_entries_lba = total_sectors - TABLE_SECTORS;
        let entries_crc = crc32fast::hash(&entries);

        let mut primary_header = [0u8; SECTOR_SIZE as usize];
        H_SIGNATURE.put_bytes(&mut primary_header, SIGNATURE);
        H_REVISION.put_u32(&mut primary_header, REVISION);
        H_SIZE.put_u32(&mut primary_header, HEADER_SIZE);
        H_CURRENT_LBA.put_u64(&mut primary_header, 1);
        H_BACKUP_LBA.put_u64(&mut primary_header, backup_lba);
        H_FIRST_USABLE.put_u64(&mut primary_header, TABLE_SECTORS);
        H_LAST_USABLE.put_u64(&mut primary_header, backup_entries_lba - 1);
        H_DISK_GUID.put_bytes(&mut primary_header, &disk_guid.to_disk_bytes());
        H_ENTRIES_LBA.put_u64(&mut primary_header, 2);
        H_ENTRY_COUNT.put_u32(&mut primary_header, MAX_PARTITIONS as u32);
        H_ENTRY_SIZE.put_u32(&mut primary_header, ENTRY_SIZE as u32);
        H_ENTRIES_CRC.put_u32(&mut primary_header, entries_crc);
        seal_header(&mut primary_header);

        let mut backup_header = primary_header;
        H_CURRENT_LBA.put_u64(&mut backup_header, backup_lba);
        H_BACKUP_LBA.put_u64(&mut backup_header, 1);
        H_ENTRIES_LBA.put_u64(&mut backup_header, backup_entries_lba);
        seal_header(&mut backup_header);

        Ok(Self {
            disk_guid,
            total_sectors,
            regions,
            mbr: mbr::protective_mbr(total_sectors),
            primary_header,
            backup_header,
            entries,
        })
    }

    /// Total size of the disk image in bytes.
    pub fn disk_size(&self) -> u64 {
        self.total_sectors * SECTOR_SIZE
    }

    /// The MBR, both headers and both entry arrays as write directives.
    pub fn writes(&self) -> Vec<PartitionConfig> {
        let backup_entries = (self.total_sectors - TABLE_SECTORS) * SECTOR_SIZE;
        let backup_header = (self.total_sectors - 1) * SECTOR_SIZE;
        let entries_len = self.entries.len() as u64;
        vec![
            PartitionConfig::from_buffer(self.mbr, OffsetAndSize::new(0, SECTOR_SIZE)),
            PartitionConfig::from_buffer(
                self.primary_header,
                OffsetAndSize::new(SECTOR_SIZE, SECTOR_SIZE),
            ),
            PartitionConfig::from_buffer(
                self.entries.clone(),
                OffsetAndSize::new(2 * SECTOR_SIZE, entries_len),
            ),
            PartitionConfig::from_buffer(
                self.entries.clone(),
                OffsetAndSize::new(backup_entries, entries_len),
            ),
            PartitionConfig::from_buffer(
                self.backup_header,
                OffsetAndSize::new(backup_header, SECTOR_SIZE),
            ),
        ]
    }
}

/// Lay out `partitions`, size `output` to the full disk and write the table.
///
/// The output file is created (or emptied) first. Partition payloads are
/// written separately into the returned regions.
pub fn parted(
    output: &Path,
    partitions: &[Partition],
    disk_guid: Option<Guid>,
) -> Result<PartitionTable> {
    let table = PartitionTable::build(partitions, disk_guid)?;
    write_disk(output, &table, &[])?;
    Ok(table)
}

/// Create `output` at the table's size, then write the table followed by
/// `payloads`. Every payload is checked against its region first, so a bad
/// payload leaves any existing `output` untouched.
pub fn write_disk(output: &Path, table: &PartitionTable, payloads: &[PartitionConfig]) -> Result<()> {
    check_partitions(payloads)?;
    let output = prepare_output_file(output)?;
    {
        let file = OpenOptions::new()
            .write(true)
            .open(&output)
            .with_context(|| format!("Failed to open {}", output.display()))?;
        file.set_len(table.disk_size())
            .with_context(|| format!("Failed to size {}", output.display()))?;
    }
    info!(
        "Partition table: {} partitions, {} sectors, disk GUID {}",
        table.regions.len(),
        table.total_sectors,
        table.disk_guid
    );
    let mut writes = table.writes();
    writes.extend_from_slice(payloads);
    write_partitions(OutputTarget::Path(&output), &writes)
}

/// Sectors used by a partition of `size` bytes: whole MiB, at least one.
fn partition_sectors(size: u64) -> u64 {
    let unit = ALIGNMENT_SECTORS * SECTOR_SIZE;
    round_up(size.max(1), unit) / SECTOR_SIZE
}

fn encode_name(name: &str) -> Result<Vec<u8>, DiskError> {
    let units: Vec<u16> = name.encode_utf16().collect();
    if units.len() > NAME_UNITS {
        return Err(DiskError::NameTooLong {
            name: name.to_string(),
            units: units.len(),
            max: NAME_UNITS,
        });
    }
    Ok(units.iter().flat_map(|u| u.to_le_bytes()).collect())
}

fn decode_name(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|u| *u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

/// CRC32 of the first `HEADER_SIZE` bytes with the CRC field zeroed.
pub fn header_crc(header: &[u8]) -> u32 {
    let mut copy = header[..HEADER_SIZE as usize].to_vec();
    H_CRC.put_u32(&mut copy, 0);
    crc32fast::hash(&copy)
}

fn seal_header(header: &mut [u8]) {
    H_CRC.put_u32(header, 0);
    let crc = header_crc(header);
    H_CRC.put_u32(header, crc);
}

/// One populated partition entry read back from a disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GptEntry {
    /// 1-based partition number.
    pub number: usize,
    pub type_guid: Guid,
    pub guid: Guid,
    pub first_lba: u64,
    pub last_lba: u64,
    pub name: String,
}

impl GptEntry {
    pub fn region(&self) -> OffsetAndSize {
        OffsetAndSize::new(
            self.first_lba * SECTOR_SIZE,
            (self.last_lba + 1 - self.first_lba) * SECTOR_SIZE,
        )
    }
}

/// A verified GPT read back from an image.
#[derive(Debug, Clone, Serialize)]
pub struct GptInfo {
    pub disk_guid: Guid,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub backup_lba: u64,
    pub entries: Vec<GptEntry>,
}

/// Read and verify both copies of the GPT in `path`.
///
/// Checks the protective MBR, signatures, header CRCs, entry-array CRCs and
/// that the backup header mirrors the primary one.
pub fn read_gpt(path: &Path) -> Result<GptInfo> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;

    let mbr_sector = read_sector(&file, 0)?;
    if !mbr::is_protective(&mbr_sector) {
        return Err(DiskError::InvalidGpt("missing protective MBR".into()).into());
    }

    let primary = read_sector(&file, 1)?;
    let entries = verify_copy(&file, &primary, 1, "primary")?;
    let backup_lba = H_BACKUP_LBA.get_u64(&primary);
    let backup = read_sector(&file, backup_lba)?;
    let backup_entries = verify_copy(&file, &backup, backup_lba, "backup")?;

    if H_BACKUP_LBA.get_u64(&backup) != 1 {
        return Err(DiskError::InvalidGpt("backup header does not point back to LBA 1".into()).into());
    }
    if entries != backup_entries {
        return Err(DiskError::InvalidGpt("primary and backup entry arrays differ".into()).into());
    }
    for field in [H_DISK_GUID, H_FIRST_USABLE, H_LAST_USABLE, H_ENTRIES_CRC] {
        if field.bytes(&primary) != field.bytes(&backup) {
            return Err(DiskError::InvalidGpt(format!(
                "backup header differs at offset {:#x}",
                field.offset
            ))
            .into());
        }
    }

    let mut parsed = Vec::new();
    for (index, entry) in entries.chunks_exact(ENTRY_SIZE).enumerate() {
        let type_guid = Guid::from_disk_bytes(guid_bytes(E_TYPE.bytes(entry)));
        if type_guid.is_nil() {
            continue;
        }
        parsed.push(GptEntry {
            number: index + 1,
            type_guid,
            guid: Guid::from_disk_bytes(guid_bytes(E_GUID.bytes(entry))),
            first_lba: E_FIRST_LBA.get_u64(entry),
            last_lba: E_LAST_LBA.get_u64(entry),
            name: decode_name(E_NAME.bytes(entry)),
        });
    }
    debug!("Verified GPT in {} ({} entries)", path.display(), parsed.len());

    Ok(GptInfo {
        disk_guid: Guid::from_disk_bytes(guid_bytes(H_DISK_GUID.bytes(&primary))),
        first_usable_lba: H_FIRST_USABLE.get_u64(&primary),
        last_usable_lba: H_LAST_USABLE.get_u64(&primary),
        backup_lba,
        entries: parsed,
    })
}

fn verify_copy(file: &File, header: &[u8], lba: u64, which: &str) -> Result<Vec<u8>> {
    if H_SIGNATURE.bytes(header) != SIGNATURE {
        return Err(DiskError::InvalidGpt(format!("{} header has no EFI PART signature", which)).into());
    }
    if H_SIZE.get_u32(header) != HEADER_SIZE {
        return Err(DiskError::InvalidGpt(format!("{} header has unexpected size", which)).into());
    }
    if H_CRC.get_u32(header) != header_crc(header) {
        return Err(DiskError::InvalidGpt(format!("{} header CRC mismatch", which)).into());
    }
    if H_CURRENT_LBA.get_u64(header) != lba {
        return Err(DiskError::InvalidGpt(format!("{} header is not at its own LBA", which)).into());
    }
    let count = H_ENTRY_COUNT.get_u32(header) as usize;
    let size = H_ENTRY_SIZE.get_u32(header) as usize;
    if count != MAX_PARTITIONS || size != ENTRY_SIZE {
        bail!("{} header describes {} entries of {} bytes, expected {}x{}", which, count, size, MAX_PARTITIONS, ENTRY_SIZE);
    }
    let mut entries = vec![0u8; count * size];
    file.read_exact_at(&mut entries, H_ENTRIES_LBA.get_u64(header) * SECTOR_SIZE)
        .with_context(|| format!("Failed to read {} entry array", which))?;
    if crc32fast::hash(&entries) != H_ENTRIES_CRC.get_u32(header) {
        return Err(DiskError::InvalidGpt(format!("{} entry array CRC mismatch", which)).into());
    }
    Ok(entries)
}

fn read_sector(file: &File, lba: u64) -> Result<Vec<u8>> {
    let mut sector = vec![0u8; SECTOR_SIZE as usize];
    file.read_exact_at(&mut sector, lba * SECTOR_SIZE)
        .with_context(|| format!("Failed to read sector {}", lba))?;
    Ok(sector)
}

fn guid_bytes(raw: &[u8]) -> [u8; 16] {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(raw);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::guid::PartitionType;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_table_sectors() {
        assert_eq!(TABLE_SECTORS, 34);
    }

    #[test]
    fn test_regions_follow_leading_table() {
        let table = PartitionTable::build(
            &[
                Partition::new("one", 1, PartitionType::LinuxData.guid()),
                Partition::new("two", 3 * MIB + 1, PartitionType::LinuxData.guid()),
            ],
            None,
        )
        .unwrap();

        assert_eq!(table.regions[0], OffsetAndSize::new(34 * 512, MIB));
        assert_eq!(table.regions[1], OffsetAndSize::new(34 * 512 + MIB, 4 * MIB));
        assert_eq!(table.total_sectors, 34 + 2048 + 4 * 2048 + 34);
    }

    #[test]
    fn test_header_crcs_validate() {
        let table = PartitionTable::build(
            &[Partition::new("root", 10 * MIB, PartitionType::LinuxData.guid())],
            None,
        )
        .unwrap();

        assert_eq!(H_CRC.get_u32(&table.primary_header), header_crc(&table.primary_header));
        assert_eq!(H_CRC.get_u32(&table.backup_header), header_crc(&table.backup_header));
        assert_eq!(
            H_ENTRIES_CRC.get_u32(&table.primary_header),
            crc32fast::hash(&table.entries)
        );
    }

    #[test]
    fn test_backup_header_mirrors_primary() {
        let table = PartitionTable::build(
            &[Partition::new("root", MIB, PartitionType::LinuxData.guid())],
            None,
        )
        .unwrap();
        let p = &table.primary_header;
        let b = &table.backup_header;

        assert_eq!(H_CURRENT_LBA.get_u64(b), H_BACKUP_LBA.get_u64(p));
        assert_eq!(H_BACKUP_LBA.get_u64(b), 1);
        assert_eq!(H_ENTRIES_LBA.get_u64(b), table.total_sectors - TABLE_SECTORS);

        let differing: Vec<usize> = (0..SECTOR_SIZE as usize).filter(|i| p[*i] != b[*i]).collect();
        let allowed = [H_CRC, H_CURRENT_LBA, H_BACKUP_LBA, H_ENTRIES_LBA];
        assert!(differing
            .iter()
            .all(|i| allowed.iter().any(|f| f.range().contains(i))));
    }

    #[test]
    fn test_entry_encoding() {
        let guid = Guid::parse("01234567-89AB-CDEF-0123-456789ABCDEF").unwrap();
        let table = PartitionTable::build(
            &[Partition::new("grub", MIB, PartitionType::BiosBoot.guid()).with_guid(guid)],
            None,
        )
        .unwrap();
        let entry = &table.entries[..ENTRY_SIZE];

        assert_eq!(E_TYPE.bytes(entry), b"Hah!IdontNeedEFI");
        assert_eq!(E_GUID.bytes(entry), guid.to_disk_bytes());
        assert_eq!(E_FIRST_LBA.get_u64(entry), 34);
        assert_eq!(E_LAST_LBA.get_u64(entry), 34 + 2048 - 1);
        assert_eq!(decode_name(E_NAME.bytes(entry)), "grub");
        assert!(table.entries[ENTRY_SIZE..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_too_many_partitions() {
        let parts: Vec<_> = (0..129)
            .map(|i| Partition::new(format!("p{}", i), MIB, PartitionType::LinuxData.guid()))
            .collect();
        assert_eq!(
            PartitionTable::build(&parts, None).unwrap_err(),
            DiskError::TooManyPartitions { count: 129, max: 128 }
        );
        assert!(PartitionTable::build(&parts[..128], None).is_ok());
    }

    #[test]
    fn test_name_limit_counts_utf16_units() {
        let ok = "é".repeat(36);
        assert!(PartitionTable::build(
            &[Partition::new(ok, MIB, PartitionType::LinuxData.guid())],
            None
        )
        .is_ok());

        let too_long = "x".repeat(37);
        assert!(matches!(
            PartitionTable::build(
                &[Partition::new(too_long, MIB, PartitionType::LinuxData.guid())],
                None
            ),
            Err(DiskError::NameTooLong { units: 37, .. })
        ));
    }

    #[test]
    fn test_parted_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("disk.img");
        let disk_guid = Guid::random();
        let table = parted(
            &image,
            &[
                Partition::new("efi", 2 * MIB, PartitionType::EfiSystem.guid()),
                Partition::new("systemA", 5 * MIB, PartitionType::LinuxData.guid()),
            ],
            Some(disk_guid),
        )
        .unwrap();

        assert_eq!(std::fs::metadata(&image).unwrap().len(), table.disk_size());

        let info = read_gpt(&image).unwrap();
        assert_eq!(info.disk_guid, disk_guid);
        assert_eq!(info.entries.len(), 2);
        assert_eq!(info.entries[0].name, "efi");
        assert_eq!(info.entries[0].type_guid, PartitionType::EfiSystem.guid());
        assert_eq!(info.entries[1].region(), table.regions[1]);
        assert_eq!(info.backup_lba, table.total_sectors - 1);
    }

    #[test]
    fn test_read_gpt_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("disk.img");
        parted(
            &image,
            &[Partition::new("root", MIB, PartitionType::LinuxData.guid())],
            None,
        )
        .unwrap();

        let file = OpenOptions::new().write(true).open(&image).unwrap();
        file.write_all_at(&[0xff], 2 * SECTOR_SIZE + 0x38).unwrap();
        drop(file);

        let err = read_gpt(&image).unwrap_err();
        assert!(err.to_string().contains("entry array CRC"));
    }
}
