//! Codec for the out-of-band metadata record written with every page.
//!
//! There are two variants of the field layout with several fields common
//! to both. Data-drive pages carry the logical block address and the
//! logical sector index. System and boot pages replace the logical
//! addresses with a four-byte signature, stored in big endian order so it
//! reads as ASCII on the wire.
//!
//! The flags byte is inverted from normal usage: a flag is *set* when its
//! bit is 0, because the erased state of a NAND bit is 1.

use crate::bytes::{r16_le, r32_be, w16_le, w32_be};

/// Size in bytes of the metadata record.
pub const METADATA_SIZE: usize = 16;

const BLOCK_STATUS_OFFSET: usize = 0;
const BLOCK_NUMBER_OFFSET: usize = 1;
const LBA_LOW_OFFSET: usize = 2;
const LSI_OFFSET: usize = 4;
const TAG_OFFSET: usize = 2;
const LBA_HIGH_OFFSET: usize = 6;
const FLAGS_OFFSET: usize = 8;

bitflags::bitflags! {
    /// Page flags, stored inverted on the media.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        /// The block belongs to a hidden drive.
        const HIDDEN_BLOCK = 1;
        /// Set on the last page of a block only when every page of the
        /// block was written in ascending logical order with no
        /// duplicates.
        const IN_LOGICAL_ORDER = 2;
    }
}

/// Tag marking pages that belong to the boot/system area.
pub const STMP_TAG: u32 = u32::from_be_bytes(*b"STMP");

/// Tag marking boot control blocks.
pub const BCB_TAG: u32 = u32::from_be_bytes(*b"BCB ");

/// One metadata record, held in RAM. Reads parse a buffer that came from
/// the redundant area; writes fill a buffer that will be programmed with
/// the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    bytes: [u8; METADATA_SIZE],
}

impl Metadata {
    /// A fully erased record, all bytes 0xff.
    pub fn erased() -> Self {
        Metadata {
            bytes: [0xff; METADATA_SIZE],
        }
    }

    /// Record for a data-drive page.
    pub fn for_lba(lba: u32, lsi: u16) -> Self {
        let mut m = Metadata::erased();
        m.set_lba(lba);
        m.set_lsi(lsi);
        m
    }

    /// Record for a system or map page.
    pub fn for_signature(signature: u32) -> Self {
        let mut m = Metadata::erased();
        m.set_signature(signature);
        m
    }

    /// Parse a record out of a redundant-area buffer. Only the first
    /// `METADATA_SIZE` bytes are looked at.
    pub fn from_bytes(buffer: &[u8]) -> Self {
        let mut bytes = [0xffu8; METADATA_SIZE];
        bytes.copy_from_slice(&buffer[..METADATA_SIZE]);
        Metadata { bytes }
    }

    pub fn bytes(&self) -> &[u8; METADATA_SIZE] {
        &self.bytes
    }

    pub fn lba(&self) -> u32 {
        let low = r16_le(&self.bytes[LBA_LOW_OFFSET..]) as u32;
        let high = r16_le(&self.bytes[LBA_HIGH_OFFSET..]) as u32;
        low | (high << 16)
    }

    pub fn set_lba(&mut self, lba: u32) {
        w16_le(&mut self.bytes[LBA_LOW_OFFSET..], lba as u16);
        w16_le(&mut self.bytes[LBA_HIGH_OFFSET..], (lba >> 16) as u16);
    }

    pub fn lsi(&self) -> u16 {
        r16_le(&self.bytes[LSI_OFFSET..])
    }

    pub fn set_lsi(&mut self, lsi: u16) {
        w16_le(&mut self.bytes[LSI_OFFSET..], lsi);
    }

    /// Erase-block serial number used by system drives.
    pub fn block_number(&self) -> u8 {
        self.bytes[BLOCK_NUMBER_OFFSET]
    }

    pub fn set_block_number(&mut self, n: u8) {
        self.bytes[BLOCK_NUMBER_OFFSET] = n;
    }

    pub fn signature(&self) -> u32 {
        r32_be(&self.bytes[TAG_OFFSET..])
    }

    pub fn set_signature(&mut self, signature: u32) {
        w32_be(&mut self.bytes[TAG_OFFSET..], signature);
    }

    pub fn is_flag_set(&self, flag: PageFlags) -> bool {
        // Flags are inverted: 0 means set.
        (!self.bytes[FLAGS_OFFSET]) & flag.bits() != 0
    }

    pub fn set_flag(&mut self, flag: PageFlags) {
        self.bytes[FLAGS_OFFSET] &= !flag.bits();
    }

    pub fn clear_flag(&mut self, flag: PageFlags) {
        self.bytes[FLAGS_OFFSET] |= flag.bits();
    }

    /// A non-0xff block status byte means the whole block is bad.
    pub fn is_marked_bad(&self) -> bool {
        self.bytes[BLOCK_STATUS_OFFSET] != 0xff
    }

    pub fn mark_bad(&mut self) {
        self.bytes[BLOCK_STATUS_OFFSET] = 0;
    }

    /// An erased page has all-0xff metadata.
    pub fn is_erased(&self) -> bool {
        self.bytes.iter().all(|&b| b == 0xff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erased_record() {
        let m = Metadata::erased();
        assert!(m.is_erased());
        assert!(!m.is_marked_bad());
        assert!(!m.is_flag_set(PageFlags::HIDDEN_BLOCK));
    }

    #[test]
    fn lba_round_trip() {
        let m = Metadata::for_lba(0x00123456, 17);
        assert_eq!(m.lba(), 0x00123456);
        assert_eq!(m.lsi(), 17);
        assert!(!m.is_erased());
    }

    #[test]
    fn lba_halfwords_are_split() {
        // The low halfword sits in front of the LSI, the high halfword
        // behind it.
        let m = Metadata::for_lba(0xABCD1234, 0);
        assert_eq!(r16_le(&m.bytes()[2..]), 0x1234);
        assert_eq!(r16_le(&m.bytes()[6..]), 0xABCD);
    }

    #[test]
    fn signature_is_big_endian() {
        let m = Metadata::for_signature(u32::from_be_bytes(*b"LBAM"));
        assert_eq!(&m.bytes()[2..6], b"LBAM");
        assert_eq!(m.signature(), u32::from_be_bytes(*b"LBAM"));
    }

    #[test]
    fn inverted_flags() {
        let mut m = Metadata::erased();
        m.set_flag(PageFlags::IN_LOGICAL_ORDER);
        assert!(m.is_flag_set(PageFlags::IN_LOGICAL_ORDER));
        assert!(!m.is_flag_set(PageFlags::HIDDEN_BLOCK));
        assert_eq!(m.bytes()[8], 0xff & !2);
        m.clear_flag(PageFlags::IN_LOGICAL_ORDER);
        assert!(!m.is_flag_set(PageFlags::IN_LOGICAL_ORDER));
    }

    #[test]
    fn bad_block_mark() {
        let mut m = Metadata::erased();
        m.mark_bad();
        assert!(m.is_marked_bad());
        assert!(!m.is_erased());
    }
}
