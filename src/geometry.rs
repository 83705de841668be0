//! Address algebra for the NAND array.
//!
//! Blocks and pages are indexed with plain `u32` addresses. An *absolute*
//! address indexes the union of all blocks (or pages) across every chip
//! select; a *chip-relative* address is the same number minus the base of
//! the chip that contains it. A *virtual* block address is an absolute
//! block address aligned to the number of planes per die, and a virtual
//! page offset within it packs the plane into the low bits and the page
//! within the plane into the high bits.

/// Absolute or chip-relative block number.
pub type BlockAddr = u32;

/// Absolute or chip-relative page number.
pub type PageAddr = u32;

/// Static layout of the NAND array.
///
/// `pages_per_block` and `planes_per_die` must be powers of two; the
/// address packing below depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NandGeometry {
    /// Number of chip selects.
    pub chip_count: u32,
    /// Dice per chip select.
    pub dice_per_chip: u32,
    /// Planes within one die.
    pub planes_per_die: u32,
    /// Erase blocks per chip select.
    pub blocks_per_chip: u32,
    /// Pages per erase block.
    pub pages_per_block: u32,
    /// Bytes in the data area of one page.
    pub page_data_size: usize,
    /// Bytes in the out-of-band (redundant) area of one page.
    pub page_metadata_size: usize,
}

impl NandGeometry {
    pub fn total_blocks(&self) -> u32 {
        self.chip_count * self.blocks_per_chip
    }

    pub fn total_pages(&self) -> u32 {
        self.total_blocks() * self.pages_per_block
    }

    pub fn blocks_per_die(&self) -> u32 {
        self.blocks_per_chip / self.dice_per_chip
    }

    pub fn page_shift(&self) -> u32 {
        self.pages_per_block.trailing_zeros()
    }

    pub fn plane_shift(&self) -> u32 {
        self.planes_per_die.trailing_zeros()
    }

    /// The chip select containing an absolute block: the largest chip
    /// whose base address is at or below the block.
    pub fn chip_for_block(&self, block: BlockAddr) -> u32 {
        debug_assert!(block < self.total_blocks());
        block / self.blocks_per_chip
    }

    /// First absolute block of a chip select.
    pub fn chip_base_block(&self, chip: u32) -> BlockAddr {
        chip * self.blocks_per_chip
    }

    /// Convert an absolute block to its address relative to its chip.
    pub fn relative_block(&self, block: BlockAddr) -> BlockAddr {
        block - self.chip_base_block(self.chip_for_block(block))
    }

    /// Die within the chip for a chip-relative block number.
    pub fn die_for_relative_block(&self, relative: BlockAddr) -> u32 {
        relative / self.blocks_per_die()
    }

    /// First page of an absolute block.
    pub fn block_to_page(&self, block: BlockAddr) -> PageAddr {
        block << self.page_shift()
    }

    /// The block that contains an absolute page.
    pub fn page_to_block(&self, page: PageAddr) -> BlockAddr {
        page >> self.page_shift()
    }

    /// Offset of a page within its block.
    pub fn page_offset(&self, page: PageAddr) -> u32 {
        page & (self.pages_per_block - 1)
    }

    /// Number of virtual pages presented by one virtual (plane-spanning)
    /// block.
    pub fn virtual_pages_per_block(&self) -> u32 {
        self.planes_per_die * self.pages_per_block
    }

    /// Plane selected by a virtual page offset.
    pub fn plane_for_virtual_offset(&self, offset: u32) -> u32 {
        debug_assert!(offset < self.virtual_pages_per_block());
        offset & (self.planes_per_die - 1)
    }

    /// Physical page offset within the plane's block for a virtual page
    /// offset.
    pub fn physical_offset_for_virtual_offset(&self, offset: u32) -> u32 {
        offset >> self.plane_shift()
    }

    /// Align a block address down to its virtual block. Virtual block
    /// addresses are always multiples of the plane count.
    pub fn virtual_block_for_key(&self, mapper_key: u32) -> BlockAddr {
        mapper_key & !(self.planes_per_die - 1)
    }
}
