//! Fixed-offset binary fields.
//!
//! GPT headers, partition entries, the protective MBR and the GRUB boot
//! sector are all flat little-endian records. Each field is declared once
//! as a `Field` constant and every read or write goes through it, so the
//! offset arithmetic lives in one place and can be tested without a disk.

use std::ops::Range;

/// A little-endian field at a fixed byte offset inside a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub offset: usize,
    pub width: usize,
}

impl Field {
    pub const fn new(offset: usize, width: usize) -> Self {
        Self { offset, width }
    }

    /// First byte past the field.
    pub const fn end(&self) -> usize {
        self.offset + self.width
    }

    pub fn range(&self) -> Range<usize> {
        self.offset..self.end()
    }

    pub fn put_u8(&self, buf: &mut [u8], value: u8) {
        debug_assert_eq!(self.width, 1);
        buf[self.offset] = value;
    }

    pub fn put_u16(&self, buf: &mut [u8], value: u16) {
        debug_assert_eq!(self.width, 2);
        buf[self.range()].copy_from_slice(&value.to_le_bytes());
    }

    pub fn put_u32(&self, buf: &mut [u8], value: u32) {
        debug_assert_eq!(self.width, 4);
        buf[self.range()].copy_from_slice(&value.to_le_bytes());
    }

    pub fn put_u64(&self, buf: &mut [u8], value: u64) {
        debug_assert_eq!(self.width, 8);
        buf[self.range()].copy_from_slice(&value.to_le_bytes());
    }

    /// Write `bytes` at the start of the field and zero the remainder.
    ///
    /// Callers validate the length; a longer slice is a programming error.
    pub fn put_bytes(&self, buf: &mut [u8], bytes: &[u8]) {
        debug_assert!(
            bytes.len() <= self.width,
            "{} bytes do not fit a {}-byte field",
            bytes.len(),
            self.width
        );
        let region = &mut buf[self.range()];
        region[..bytes.len()].copy_from_slice(bytes);
        region[bytes.len()..].fill(0);
    }

    /// Fill the whole field with one byte value.
    pub fn fill(&self, buf: &mut [u8], value: u8) {
        buf[self.range()].fill(value);
    }

    /// Copy this field's bytes from `src` into the same position of `dst`.
    pub fn copy_between(&self, src: &[u8], dst: &mut [u8]) {
        dst[self.range()].copy_from_slice(&src[self.range()]);
    }

    pub fn get_u8(&self, buf: &[u8]) -> u8 {
        buf[self.offset]
    }

    pub fn get_u16(&self, buf: &[u8]) -> u16 {
        let mut raw = [0u8; 2];
        raw.copy_from_slice(&buf[self.range()]);
        u16::from_le_bytes(raw)
    }

    pub fn get_u32(&self, buf: &[u8]) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&buf[self.range()]);
        u32::from_le_bytes(raw)
    }

    pub fn get_u64(&self, buf: &[u8]) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[self.range()]);
        u64::from_le_bytes(raw)
    }

    pub fn bytes<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.range()]
    }

    /// A field of the same width shifted by `delta` bytes.
    ///
    /// Used for repeated records such as the 12-byte block descriptors.
    pub const fn shifted(&self, delta: usize) -> Self {
        Self::new(self.offset + delta, self.width)
    }
}

/// Round `value` up to the next multiple of `multiple`.
pub fn round_up(value: u64, multiple: u64) -> u64 {
    value.div_ceil(multiple) * multiple
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_fields_are_little_endian() {
        let mut buf = [0u8; 16];
        Field::new(0, 2).put_u16(&mut buf, 0x1234);
        Field::new(2, 4).put_u32(&mut buf, 0xAABB_CCDD);
        Field::new(8, 8).put_u64(&mut buf, 0x0102_0304_0506_0708);

        assert_eq!(&buf[0..2], &[0x34, 0x12]);
        assert_eq!(&buf[2..6], &[0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(&buf[8..16], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(Field::new(2, 4).get_u32(&buf), 0xAABB_CCDD);
        assert_eq!(Field::new(8, 8).get_u64(&buf), 0x0102_0304_0506_0708);
    }

    #[test]
    fn test_put_bytes_zeroes_tail() {
        let mut buf = [0xFFu8; 8];
        Field::new(2, 4).put_bytes(&mut buf, &[1, 2]);
        assert_eq!(buf, [0xFF, 0xFF, 1, 2, 0, 0, 0xFF, 0xFF]);
    }

    #[test]
    #[should_panic]
    fn test_put_bytes_rejects_oversized_slice() {
        let mut buf = [0u8; 8];
        Field::new(2, 2).put_bytes(&mut buf, &[1, 2, 3]);
    }

    #[test]
    fn test_copy_between_touches_only_field() {
        let src = [1u8; 8];
        let mut dst = [0u8; 8];
        Field::new(3, 2).copy_between(&src, &mut dst);
        assert_eq!(dst, [0, 0, 0, 1, 1, 0, 0, 0]);
    }

    #[test]
    fn test_shifted() {
        assert_eq!(Field::new(488, 8).shifted(12), Field::new(500, 8));
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 512), 0);
        assert_eq!(round_up(1, 512), 512);
        assert_eq!(round_up(512, 512), 512);
        assert_eq!(round_up(513, 512), 1024);
    }
}
