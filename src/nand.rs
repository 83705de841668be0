// NAND driver interface. The media core is written against this trait;
// the real implementation wraps the GPMI/ECC hardware and a simulated
// implementation backs the test suite.

use crate::geometry::{BlockAddr, NandGeometry, PageAddr};
use crate::{NandError, Result};

/// Per-plane parameter block for a multiplane erase.
///
/// The caller fills in the addresses; the driver fills in one status per
/// block. A failed erase reports `Err(HalWriteFailed)` for that block
/// while the call as a whole still returns `Ok`.
#[derive(Debug, Clone, Copy)]
pub struct MultiplaneEraseBlock {
    pub address: BlockAddr,
    pub status: Result<()>,
}

impl MultiplaneEraseBlock {
    pub fn new(address: BlockAddr) -> Self {
        MultiplaneEraseBlock {
            address,
            status: Ok(()),
        }
    }
}

/// Each NAND array must be represented by a structure that implements
/// this trait. Addresses are absolute unless a method says otherwise.
///
/// Error conventions:
///  - A page read that needed ECC correction returns
///    `Err(EccFixed)` or `Err(EccFixedShouldRewrite)` even though the
///    data buffer holds good data. `Err(EccUncorrectable)` means the
///    buffer contents are garbage. Implementations over the real
///    engines derive these from the correction readout in
///    [`crate::ecc`].
///  - A failed program returns `Err(HalWriteFailed)`; a failed erase
///    returns `Err(HalEraseFailed)`. Both mean the block just went bad.
pub trait NandDriver {
    /// Layout of the array. Must not change after init.
    fn geometry(&self) -> NandGeometry;

    /// Read a full page: data area and out-of-band metadata.
    fn read_page(&mut self, page: PageAddr, data: &mut [u8], metadata: &mut [u8]) -> Result<()>;

    /// Read only the out-of-band metadata of a page.
    fn read_metadata(&mut self, page: PageAddr, metadata: &mut [u8]) -> Result<()>;

    /// Program a page. Data and metadata are written atomically; pages
    /// within a block are programmed in ascending order only.
    fn write_page(&mut self, page: PageAddr, data: &[u8], metadata: &[u8]) -> Result<()>;

    /// Program a firmware/boot page. Same contract as `write_page`, but
    /// the transfer runs through the boot ECC layout that the ROM can
    /// read.
    fn write_firmware_page(&mut self, page: PageAddr, data: &[u8], metadata: &[u8]) -> Result<()>;

    /// Erase one block.
    fn erase_block(&mut self, block: BlockAddr) -> Result<()>;

    /// Erase several blocks, one per plane, in a single interleaved
    /// operation. All blocks must reside on the same chip. The default
    /// implementation loops over `erase_block`.
    fn erase_multiple_blocks(&mut self, blocks: &mut [MultiplaneEraseBlock]) -> Result<()> {
        for pb in blocks.iter_mut() {
            pb.status = match self.erase_block(pb.address) {
                Ok(()) => Ok(()),
                Err(NandError::HalEraseFailed) => Err(NandError::HalWriteFailed),
                Err(e) => Err(e),
            };
        }
        Ok(())
    }

    /// Was this block marked bad at the factory?
    fn is_block_factory_bad(&mut self, block: BlockAddr) -> bool;

    /// Whether planes on different dice of one chip can be paired in a
    /// multiplane operation.
    fn supports_die_interleaving(&self) -> bool {
        false
    }

    /// Entropy source for seeding the random allocator. Hardware mixes
    /// the entropy register with a running microsecond counter so that
    /// every call differs.
    fn entropy_seed(&mut self) -> u32;
}

/// Persistent bits that survive reset (held in always-powered RTC
/// registers on hardware). The recovery engine records its progress here
/// so an interrupted rewrite can resume after an unexpected reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistentBit {
    /// Boot ROM should load firmware from the secondary copy.
    NandSecondaryBoot,
    /// A firmware drive rewrite was in flight.
    FirmwareRecoveryInProgress,
    /// Secondary-boot analogue for LBA-NAND devices.
    LbaNandSecondaryBoot,
}

pub trait PersistentBits {
    fn read_bit(&mut self, which: PersistentBit) -> bool;
    fn write_bit(&mut self, which: PersistentBit, value: bool);
}

/// Check whether a block is erased by looking at the metadata of its
/// first page. Pages are programmed in order, so an erased first page
/// means nothing in the block was written.
pub fn block_is_erased<N: NandDriver>(nand: &mut N, block: BlockAddr) -> bool {
    let geometry = nand.geometry();
    let mut meta = [0u8; crate::metadata::METADATA_SIZE];
    match nand.read_metadata(geometry.block_to_page(block), &mut meta) {
        Ok(()) | Err(NandError::EccFixed) | Err(NandError::EccFixedShouldRewrite) => {
            crate::metadata::Metadata::from_bytes(&meta).is_erased()
        }
        // An uncorrectable read of an erased page is reported by some
        // ECC engines; treat any read problem as "not erased" so the
        // caller erases again.
        Err(_) => false,
    }
}

/// Erase a block; if the erase fails, program the bad-block marker into
/// the first page so later scans skip it. The erase error is returned
/// either way so the caller knows not to use the block.
pub fn erase_and_mark_on_failure<N: NandDriver>(nand: &mut N, block: BlockAddr) -> Result<()> {
    match nand.erase_block(block) {
        Ok(()) => Ok(()),
        Err(e) => {
            let geometry = nand.geometry();
            let mut marked = crate::metadata::Metadata::erased();
            marked.mark_bad();
            let data = vec![0u8; geometry.page_data_size];
            // Best effort; the block is unusable regardless.
            let _ = nand.write_page(geometry.block_to_page(block), &data, marked.bytes());
            Err(e)
        }
    }
}
