//! ECC configuration descriptors and correction readout.
//!
//! Two ECC engines exist across the chip family: a Reed-Solomon engine
//! (4- and 8-symbol) and a BCH engine with even correction levels from 0
//! to 20. Pages are split into 512-byte payloads; after a read the
//! engine deposits one correction-count status byte per payload in the
//! auxiliary buffer, following the user metadata and aligned up to a
//! word boundary. This module interprets those counts and decides
//! whether a recovered page is hot enough to schedule a rewrite.
//!
//! Dispatch over the engine families is a tagged kind plus a table of
//! function pointers, so no allocation is involved.

use crate::{NandError, Result};

/// Size of one ECC payload in bytes.
pub const ECC_BLOCK_SIZE: u32 = 512;

/// Parity bytes per payload for 4-symbol Reed-Solomon.
pub const RS4_PARITY_BYTES: u32 = 9;
/// Metadata bytes available with 4-symbol Reed-Solomon on a 2KiB page.
pub const RS4_METADATA_SIZE: u32 = 19;
/// Parity bytes per payload for 8-symbol Reed-Solomon.
pub const RS8_PARITY_BYTES: u32 = 18;
/// Metadata bytes available with 8-symbol Reed-Solomon on a 4KiB page.
pub const RS8_METADATA_SIZE: u32 = 65;

/// BCH parity symbol size in bits.
pub const BCH_PARITY_SIZE_BITS: u32 = 13;
/// User metadata bytes with BCH.
pub const BCH_METADATA_SIZE: u32 = 10;
/// Highest BCH level the hardware supports.
pub const MAX_BCH_LEVEL: u32 = 20;

/// Buffer-mask bit selecting the auxiliary buffer.
const AUX_BUFFER_MASK_BIT: u32 = 0x100;

/// Number of bit errors that cause a page rewrite, for each BCH ECC
/// level (indexed by level / 2).
const BCH_THRESHOLDS: [u32; 11] = [0, 1, 3, 5, 6, 8, 9, 10, 12, 13, 15];

/// Sentinel correction count: too many bit errors to fix.
pub const UNCORRECTABLE: u32 = 0xffffffff;
/// Sentinel correction count: the payload was all ones (erased).
pub const ALL_ONES: u32 = 0xfffffffe;

/// Maximum number of payloads any engine produces for one page.
pub const MAX_PAYLOAD_COUNT: usize = 16;

/// The supported ECC configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EccKind {
    /// Reed-Solomon, four symbols.
    Rs4,
    /// Reed-Solomon, eight symbols.
    Rs8,
    /// BCH at an even level 0..=20.
    Bch(u32),
    /// ECC disabled.
    None,
}

impl EccKind {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, EccKind::None)
    }

    pub fn is_reed_solomon(&self) -> bool {
        matches!(self, EccKind::Rs4 | EccKind::Rs8)
    }

    pub fn is_bch(&self) -> bool {
        matches!(self, EccKind::Bch(_))
    }

    /// Parity bytes appended to each payload.
    pub fn parity_bytes(&self) -> u32 {
        match self {
            EccKind::Rs4 => RS4_PARITY_BYTES,
            EccKind::Rs8 => RS8_PARITY_BYTES,
            EccKind::Bch(level) => (level * BCH_PARITY_SIZE_BITS + 7) / 8,
            EccKind::None => 0,
        }
    }
}

/// Full ECC configuration for one NAND type.
///
/// The BCH layout fields are only meaningful for BCH kinds; block 0 may
/// use a stronger level than the remaining blocks because it carries the
/// metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EccDescriptor {
    pub kind: EccKind,
    pub block0_kind: EccKind,
    pub block0_size: u32,
    pub block_n_size: u32,
    pub block_n_count: u32,
    pub metadata_bytes: u32,
    /// Number of corrected bit errors at which a payload is considered
    /// hot and the containing block should be rewritten.
    pub erase_threshold: u32,
}

impl EccDescriptor {
    pub fn rs4() -> Self {
        EccDescriptor {
            kind: EccKind::Rs4,
            block0_kind: EccKind::Rs4,
            block0_size: ECC_BLOCK_SIZE,
            block_n_size: ECC_BLOCK_SIZE,
            block_n_count: 3,
            metadata_bytes: RS4_METADATA_SIZE,
            erase_threshold: 3,
        }
    }

    pub fn rs8() -> Self {
        EccDescriptor {
            kind: EccKind::Rs8,
            block0_kind: EccKind::Rs8,
            block0_size: ECC_BLOCK_SIZE,
            block_n_size: ECC_BLOCK_SIZE,
            block_n_count: 7,
            metadata_bytes: RS8_METADATA_SIZE,
            erase_threshold: 6,
        }
    }

    /// A BCH descriptor for a page with the given data size. Block 0
    /// carries the metadata at the same level as the other blocks.
    pub fn bch(level: u32, page_data_size: u32) -> Self {
        debug_assert!(level <= MAX_BCH_LEVEL && level % 2 == 0);
        let payloads = page_data_size / ECC_BLOCK_SIZE;
        EccDescriptor {
            kind: EccKind::Bch(level),
            block0_kind: EccKind::Bch(level),
            block0_size: ECC_BLOCK_SIZE,
            block_n_size: ECC_BLOCK_SIZE,
            block_n_count: payloads.saturating_sub(1),
            metadata_bytes: BCH_METADATA_SIZE,
            erase_threshold: BCH_THRESHOLDS[(level / 2) as usize],
        }
    }

    pub fn disabled() -> Self {
        EccDescriptor {
            kind: EccKind::None,
            block0_kind: EccKind::None,
            block0_size: 0,
            block_n_size: 0,
            block_n_count: 0,
            metadata_bytes: 0,
            erase_threshold: 0,
        }
    }

    /// Payloads produced for one full-page transfer.
    pub fn payload_count(&self) -> u32 {
        match self.kind {
            EccKind::None => 0,
            EccKind::Rs4 | EccKind::Rs8 => self.block_n_count + 1,
            EccKind::Bch(_) => self.block_n_count + 1,
        }
    }

    /// Offset and length of the metadata region within the raw page.
    /// Reed-Solomon places metadata after all payloads and their parity;
    /// BCH places it at the front of the auxiliary area.
    pub fn metadata_info(&self) -> (u32, u32) {
        match self.kind {
            EccKind::None => (0, 0),
            EccKind::Rs4 | EccKind::Rs8 => {
                let payloads = self.payload_count();
                let parity = self.kind.parity_bytes();
                (
                    payloads * (ECC_BLOCK_SIZE + parity),
                    self.metadata_bytes + parity,
                )
            }
            EccKind::Bch(_) => (0, self.metadata_bytes),
        }
    }

    pub fn ops(&self) -> &'static EccOps {
        ops_for(self.kind)
    }

    /// Shorthand for the mask computation through the dispatch table.
    pub fn compute_mask(
        &self,
        byte_count: u32,
        page_total_size: u32,
        is_write: bool,
        read_only_2k: bool,
    ) -> MaskInfo {
        if !self.kind.is_enabled() {
            return MaskInfo {
                mask: 0,
                data_count: byte_count,
                aux_count: 0,
            };
        }
        (self.ops().compute_mask)(self, byte_count, page_total_size, is_write, read_only_2k)
    }

    /// Read the correction results for the last transfer from the
    /// auxiliary buffer. See the module doc for the status layout.
    pub fn correct_ecc(&self, aux: &[u8], info: Option<&mut CorrectionInfo>) -> Result<()> {
        if !self.kind.is_enabled() {
            return Ok(());
        }
        (self.ops().correct)(self, aux, info)
    }
}

/// Find the strongest BCH level whose parity fits the page's auxiliary
/// area, assuming 512-byte payloads and the standard user metadata.
pub fn highest_bch_level(page_data_size: u32, page_metadata_size: u32) -> Result<EccDescriptor> {
    let payloads = page_data_size / ECC_BLOCK_SIZE;
    let mut level = MAX_BCH_LEVEL;
    loop {
        let parity = EccKind::Bch(level).parity_bytes();
        if BCH_METADATA_SIZE + payloads * parity <= page_metadata_size {
            return Ok(EccDescriptor::bch(level, page_data_size));
        }
        if level == 0 {
            return Err(NandError::GpmiNotPresent);
        }
        level -= 2;
    }
}

/// Result of a mask computation: the buffer-mask for the transfer plus
/// how the byte count splits between data and auxiliary buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskInfo {
    pub mask: u32,
    pub data_count: u32,
    pub aux_count: u32,
}

/// Per-payload correction detail for one page read.
#[derive(Debug, Clone, Copy)]
pub struct CorrectionInfo {
    /// Highest correction count over all payloads and the metadata.
    pub max_corrections: u32,
    pub payload_count: usize,
    pub is_metadata_valid: bool,
    pub metadata_corrections: u32,
    pub payload_corrections: [u32; MAX_PAYLOAD_COUNT],
}

impl CorrectionInfo {
    pub fn new() -> Self {
        CorrectionInfo {
            max_corrections: 0,
            payload_count: 0,
            is_metadata_valid: false,
            metadata_corrections: 0,
            payload_corrections: [0; MAX_PAYLOAD_COUNT],
        }
    }
}

impl Default for CorrectionInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// Operation table for one ECC engine family.
pub struct EccOps {
    pub compute_mask: fn(&EccDescriptor, u32, u32, bool, bool) -> MaskInfo,
    pub pre_transaction: fn(&EccDescriptor, chip: u32, is_write: bool) -> Result<()>,
    pub post_transaction: fn(&EccDescriptor, chip: u32, is_write: bool) -> Result<()>,
    pub correct: fn(&EccDescriptor, &[u8], Option<&mut CorrectionInfo>) -> Result<()>,
}

static RS_OPS: EccOps = EccOps {
    compute_mask: compute_mask_common,
    pre_transaction: transaction_nop,
    post_transaction: transaction_nop,
    correct: correct_from_status_bytes,
};

static BCH_OPS: EccOps = EccOps {
    compute_mask: compute_mask_common,
    pre_transaction: transaction_nop,
    post_transaction: transaction_nop,
    correct: correct_from_status_bytes,
};

static NONE_OPS: EccOps = EccOps {
    compute_mask: |_, byte_count, _, _, _| MaskInfo {
        mask: 0,
        data_count: byte_count,
        aux_count: 0,
    },
    pre_transaction: transaction_nop,
    post_transaction: transaction_nop,
    correct: |_, _, _| Ok(()),
};

pub fn ops_for(kind: EccKind) -> &'static EccOps {
    match kind {
        EccKind::Rs4 | EccKind::Rs8 => &RS_OPS,
        EccKind::Bch(_) => &BCH_OPS,
        EccKind::None => &NONE_OPS,
    }
}

fn transaction_nop(_desc: &EccDescriptor, _chip: u32, _is_write: bool) -> Result<()> {
    // The engines need no per-transfer preparation beyond what the DMA
    // builder does; the hooks exist so a driver can bracket the
    // transfer.
    Ok(())
}

fn compute_mask_common(
    desc: &EccDescriptor,
    byte_count: u32,
    page_total_size: u32,
    _is_write: bool,
    read_only_2k: bool,
) -> MaskInfo {
    // One mask bit per 512-byte payload, plus the auxiliary bit when
    // the transfer spans the whole page.
    let mut payloads = byte_count / ECC_BLOCK_SIZE;
    let limit = if read_only_2k {
        4
    } else {
        desc.payload_count()
    };
    if payloads > limit {
        payloads = limit;
    }

    let data_count = payloads * ECC_BLOCK_SIZE;
    let aux_count = page_total_size.saturating_sub(data_count);
    let mut mask = (1u32 << payloads) - 1;
    if aux_count > 0 {
        mask |= AUX_BUFFER_MASK_BIT;
    }

    MaskInfo {
        mask,
        data_count,
        aux_count,
    }
}

// Offset of the correction status bytes in the auxiliary buffer: they
// follow the user metadata, aligned up to a word boundary.
fn status_offset(desc: &EccDescriptor) -> usize {
    ((desc.metadata_bytes as usize) + 3) & !3
}

fn correct_from_status_bytes(
    desc: &EccDescriptor,
    aux: &[u8],
    info: Option<&mut CorrectionInfo>,
) -> Result<()> {
    let payloads = desc.payload_count() as usize;
    let offset = status_offset(desc);

    let mut max: u32 = 0;
    let mut all_ones = 0usize;
    let mut uncorrectable = false;
    let mut detail = CorrectionInfo::new();
    detail.payload_count = payloads;

    for i in 0..payloads {
        let status = aux[offset + i];
        let corrections = match status {
            0xff => {
                uncorrectable = true;
                UNCORRECTABLE
            }
            0xfe => {
                all_ones += 1;
                ALL_ONES
            }
            n => n as u32,
        };
        detail.payload_corrections[i] = corrections;
        if corrections != UNCORRECTABLE && corrections != ALL_ONES && corrections > max {
            max = corrections;
        }
    }

    // The metadata rides with payload 0.
    detail.is_metadata_valid = payloads > 0;
    detail.metadata_corrections = detail.payload_corrections[0];
    detail.max_corrections = max;

    if let Some(out) = info {
        *out = detail;
    }

    // An erased page decodes as all ones in every payload; that is not
    // an error.
    if all_ones == payloads && payloads > 0 {
        return Ok(());
    }
    if uncorrectable {
        return Err(NandError::EccUncorrectable);
    }
    if max == 0 {
        return Ok(());
    }
    if max >= desc.erase_threshold {
        return Err(NandError::EccFixedShouldRewrite);
    }
    Err(NandError::EccFixed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aux_with_status(desc: &EccDescriptor, status: &[u8]) -> Vec<u8> {
        let mut aux = vec![0u8; 64];
        let offset = super::status_offset(desc);
        aux[offset..offset + status.len()].copy_from_slice(status);
        aux
    }

    #[test]
    fn parity_sizes() {
        assert_eq!(EccKind::Rs4.parity_bytes(), 9);
        assert_eq!(EccKind::Rs8.parity_bytes(), 18);
        assert_eq!(EccKind::Bch(8).parity_bytes(), 13);
        assert_eq!(EccKind::Bch(12).parity_bytes(), 20);
        assert_eq!(EccKind::Bch(16).parity_bytes(), 26);
    }

    #[test]
    fn rs4_metadata_layout() {
        let desc = EccDescriptor::rs4();
        let (offset, length) = desc.metadata_info();
        assert_eq!(offset, 4 * (512 + 9));
        assert_eq!(length, 19 + 9);
    }

    #[test]
    fn bch_metadata_layout() {
        let desc = EccDescriptor::bch(8, 2048);
        let (offset, length) = desc.metadata_info();
        assert_eq!(offset, 0);
        assert_eq!(length, 10);
        assert_eq!(desc.payload_count(), 4);
    }

    #[test]
    fn mask_covers_payloads_and_aux() {
        let desc = EccDescriptor::bch(8, 2048);
        let m = desc.compute_mask(2048, 2112, false, false);
        assert_eq!(m.mask, 0x10f);
        assert_eq!(m.data_count, 2048);
        assert_eq!(m.aux_count, 64);
    }

    #[test]
    fn mask_limits_to_2k_reads() {
        let desc = EccDescriptor::bch(8, 4096);
        let m = desc.compute_mask(4096, 4224, false, true);
        assert_eq!(m.data_count, 2048);
    }

    #[test]
    fn clean_read_is_ok() {
        let desc = EccDescriptor::bch(8, 2048);
        let aux = aux_with_status(&desc, &[0, 0, 0, 0]);
        assert_eq!(desc.correct_ecc(&aux, None), Ok(()));
    }

    #[test]
    fn small_corrections_report_fixed() {
        let desc = EccDescriptor::bch(8, 2048);
        let aux = aux_with_status(&desc, &[0, 2, 0, 1]);
        assert_eq!(desc.correct_ecc(&aux, None), Err(NandError::EccFixed));
    }

    #[test]
    fn rewrite_thresholds_per_level() {
        assert_eq!(EccDescriptor::bch(0, 2048).erase_threshold, 0);
        assert_eq!(EccDescriptor::bch(2, 2048).erase_threshold, 1);
        assert_eq!(EccDescriptor::bch(8, 2048).erase_threshold, 6);
        assert_eq!(EccDescriptor::bch(20, 2048).erase_threshold, 15);
    }

    #[test]
    fn threshold_promotes_to_rewrite() {
        let desc = EccDescriptor::bch(8, 2048);
        // Threshold for level 8 is 6.
        let aux = aux_with_status(&desc, &[0, 6, 0, 0]);
        assert_eq!(
            desc.correct_ecc(&aux, None),
            Err(NandError::EccFixedShouldRewrite)
        );
        // One bit error fewer is only a fix.
        let aux = aux_with_status(&desc, &[0, 5, 0, 0]);
        assert_eq!(desc.correct_ecc(&aux, None), Err(NandError::EccFixed));
    }

    #[test]
    fn uncorrectable_payload_fails() {
        let desc = EccDescriptor::bch(8, 2048);
        let aux = aux_with_status(&desc, &[0, 0xff, 0, 0]);
        assert_eq!(
            desc.correct_ecc(&aux, None),
            Err(NandError::EccUncorrectable)
        );
    }

    #[test]
    fn erased_page_is_ok() {
        let desc = EccDescriptor::bch(8, 2048);
        let aux = aux_with_status(&desc, &[0xfe, 0xfe, 0xfe, 0xfe]);
        assert_eq!(desc.correct_ecc(&aux, None), Ok(()));
    }

    #[test]
    fn correction_detail_is_reported() {
        let desc = EccDescriptor::bch(8, 2048);
        let aux = aux_with_status(&desc, &[1, 3, 0xfe, 0]);
        let mut info = CorrectionInfo::new();
        let _ = desc.correct_ecc(&aux, Some(&mut info));
        assert_eq!(info.payload_count, 4);
        assert_eq!(info.max_corrections, 3);
        assert_eq!(info.payload_corrections[2], ALL_ONES);
        assert!(info.is_metadata_valid);
        assert_eq!(info.metadata_corrections, 1);
    }

    #[test]
    fn highest_level_fits_aux_area() {
        // 2048-byte page with a 64-byte aux area: 10 + 4 * parity <= 64
        // allows parity of 13 (level 8) but not 20 (level 12).
        let desc = highest_bch_level(2048, 64).unwrap();
        assert_eq!(desc.kind, EccKind::Bch(8));
        assert!(highest_bch_level(2048, 8).is_err());
    }
}
