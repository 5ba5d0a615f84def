//! Protective MBR written in front of the GPT.

use super::layout::Field;
use super::SECTOR_SIZE;

/// First legacy partition record.
const PART0: usize = 0x1be;
const PART0_STATUS: Field = Field::new(PART0, 1);
const PART0_CHS_START: Field = Field::new(PART0 + 0x1, 3);
const PART0_TYPE: Field = Field::new(PART0 + 0x4, 1);
const PART0_CHS_END: Field = Field::new(PART0 + 0x5, 3);
const PART0_LBA_START: Field = Field::new(PART0 + 0x8, 4);
const PART0_SECTORS: Field = Field::new(PART0 + 0xc, 4);
pub const BOOT_SIGNATURE: Field = Field::new(0x1fe, 2);

/// Partition type marking a GPT protective partition.
pub const GPT_PROTECTIVE_TYPE: u8 = 0xee;

/// Build a protective MBR for a disk of `total_sectors` sectors.
///
/// The single legacy partition covers the disk from LBA 1, capped at the
/// 32-bit sector count limit.
pub fn protective_mbr(total_sectors: u64) -> [u8; SECTOR_SIZE as usize] {
    let mut mbr = [0u8; SECTOR_SIZE as usize];
    PART0_STATUS.put_u8(&mut mbr, 0);
    PART0_CHS_START.put_bytes(&mut mbr, &[0x00, 0x02, 0x00]);
    PART0_TYPE.put_u8(&mut mbr, GPT_PROTECTIVE_TYPE);
    PART0_CHS_END.fill(&mut mbr, 0xff);
    PART0_LBA_START.put_u32(&mut mbr, 1);
    let sectors = total_sectors.saturating_sub(1).min(u32::MAX as u64) as u32;
    PART0_SECTORS.put_u32(&mut mbr, sectors);
    BOOT_SIGNATURE.put_bytes(&mut mbr, &[0x55, 0xaa]);
    mbr
}

/// True if `sector` carries a GPT protective partition and boot signature.
pub fn is_protective(sector: &[u8]) -> bool {
    sector.len() >= SECTOR_SIZE as usize
        && PART0_TYPE.get_u8(sector) == GPT_PROTECTIVE_TYPE
        && BOOT_SIGNATURE.bytes(sector) == [0x55, 0xaa]
}
