//! A logical block spanning the planes of one die.
//!
//! To get multiplane program and erase operations, one logical ("virtual")
//! block binds together one physical block per plane, all residing on a
//! single die. The virtual block address space is the absolute block
//! space aligned to the plane count; the mapper key for plane `p` of
//! virtual block `v` is simply `v + p`.
//!
//! A `VirtualBlock` is a short-lived helper for one read or write call.
//! It caches the per-plane physical lookups it makes, but the
//! authoritative mapping always lives in the mapper, so the cache is
//! dropped whenever the instance is re-targeted.

use crate::allocator::AllocationConstraints;
use crate::geometry::{BlockAddr, NandGeometry, PageAddr};
use crate::mapper::{BlockType, Mapper};
use crate::nand::{MultiplaneEraseBlock, NandDriver};
use crate::region::Region;
use crate::{NandError, Result};

/// Upper bound on planes per die across supported NANDs.
pub const MAX_PLANES: usize = 4;

const FIRST_PLANE: usize = 0;

#[derive(Debug, Clone, Copy, Default)]
struct PlaneInfo {
    address: BlockAddr,
    is_cached: bool,
    is_unallocated: bool,
}

pub struct VirtualBlock {
    geometry: NandGeometry,
    address: BlockAddr,
    planes: [PlaneInfo; MAX_PLANES],
}

impl VirtualBlock {
    pub fn new(geometry: NandGeometry) -> Self {
        debug_assert!(geometry.planes_per_die as usize <= MAX_PLANES);
        VirtualBlock {
            geometry,
            address: 0,
            planes: [PlaneInfo::default(); MAX_PLANES],
        }
    }

    pub fn address(&self) -> BlockAddr {
        self.address
    }

    pub fn plane_count(&self) -> usize {
        self.geometry.planes_per_die as usize
    }

    /// Point this instance at a virtual block, invalidating every
    /// cached plane.
    pub fn set(&mut self, address: BlockAddr) {
        debug_assert!(address % self.geometry.planes_per_die == 0);
        self.address = address;
        self.planes = [PlaneInfo::default(); MAX_PLANES];
    }

    /// Target the virtual block containing a logical sector of a data
    /// region. Returns the virtual page offset within the block.
    pub fn set_from_region(&mut self, region: &Region, logical_sector: u32) -> u32 {
        let vpb = self.geometry.virtual_pages_per_block();
        let logical_block = logical_sector / vpb;
        let offset = logical_sector % vpb;
        self.set(region.start_block + logical_block * self.geometry.planes_per_die);
        offset
    }

    /// The zone map key for a virtual page offset within this block.
    pub fn mapper_key_for_virtual_offset(&self, offset: u32) -> u32 {
        self.address + self.geometry.plane_for_virtual_offset(offset)
    }

    pub fn is_fully_allocated<N: NandDriver>(&mut self, nand: &mut N, mapper: &mut Mapper) -> bool {
        (0..self.plane_count()).all(|p| self.is_plane_allocated(nand, mapper, p))
    }

    pub fn is_fully_unallocated<N: NandDriver>(
        &mut self,
        nand: &mut N,
        mapper: &mut Mapper,
    ) -> bool {
        (0..self.plane_count()).all(|p| !self.is_plane_allocated(nand, mapper, p))
    }

    pub fn is_plane_allocated<N: NandDriver>(
        &mut self,
        nand: &mut N,
        mapper: &mut Mapper,
        plane: usize,
    ) -> bool {
        if !self.planes[plane].is_cached {
            let _ = self.physical_block_for_plane(nand, mapper, plane);
        }
        self.planes[plane].is_cached && !self.planes[plane].is_unallocated
    }

    /// Physical block bound to a plane, from the cache or the mapper.
    /// An unallocated plane reports `MapperInvalidPhysicalAddress`.
    pub fn physical_block_for_plane<N: NandDriver>(
        &mut self,
        nand: &mut N,
        mapper: &mut Mapper,
        plane: usize,
    ) -> Result<BlockAddr> {
        debug_assert!(plane < self.plane_count());

        if self.planes[plane].is_cached {
            return if self.planes[plane].is_unallocated {
                Err(NandError::MapperInvalidPhysicalAddress)
            } else {
                Ok(self.planes[plane].address)
            };
        }

        match mapper.block_info(nand, self.address + plane as u32) {
            Ok(Some(block)) => {
                self.planes[plane] = PlaneInfo {
                    address: block,
                    is_cached: true,
                    is_unallocated: false,
                };
                Ok(block)
            }
            Ok(None) => {
                self.planes[plane] = PlaneInfo {
                    address: 0,
                    is_cached: true,
                    is_unallocated: true,
                };
                Err(NandError::MapperInvalidPhysicalAddress)
            }
            Err(e) => {
                self.planes[plane].is_cached = false;
                Err(e)
            }
        }
    }

    /// The physical page backing a virtual page offset. Fails when the
    /// plane has no block yet.
    pub fn physical_page_for_virtual_offset<N: NandDriver>(
        &mut self,
        nand: &mut N,
        mapper: &mut Mapper,
        offset: u32,
    ) -> Result<PageAddr> {
        let plane = self.geometry.plane_for_virtual_offset(offset) as usize;
        let block = self.physical_block_for_plane(nand, mapper, plane)?;
        let physical_offset = self.geometry.physical_offset_for_virtual_offset(offset);
        Ok(self.geometry.block_to_page(block) + physical_offset)
    }

    /// Allocate a physical block for one plane.
    ///
    /// The first plane may land anywhere (on the chip of any already
    /// allocated plane, if there is one). Later planes are pinned to the
    /// plane number, the first plane's chip, and its die too unless the
    /// NAND can interleave across dice. If the constrained allocation
    /// finds nothing, it is retried unconstrained; that costs multiplane
    /// operation on this block but beats failing the write.
    pub fn allocate_block_for_plane<N: NandDriver>(
        &mut self,
        nand: &mut N,
        mapper: &mut Mapper,
        plane: usize,
    ) -> Result<BlockAddr> {
        debug_assert!(plane < self.plane_count());

        let mut constraints = AllocationConstraints::NONE;

        if self.planes[FIRST_PLANE].is_cached && !self.planes[FIRST_PLANE].is_unallocated {
            constraints.chip = Some(
                self.geometry
                    .chip_for_block(self.planes[FIRST_PLANE].address),
            );
        }

        if self.plane_count() > 1 {
            constraints.plane = Some(plane as u32);

            if plane > FIRST_PLANE {
                if !self.is_plane_allocated(nand, mapper, FIRST_PLANE) {
                    self.allocate_block_for_plane(nand, mapper, FIRST_PLANE)?;
                }

                let first_block = self.planes[FIRST_PLANE].address;
                constraints.chip = Some(self.geometry.chip_for_block(first_block));
                if !nand.supports_die_interleaving() {
                    constraints.die = Some(
                        self.geometry
                            .die_for_relative_block(self.geometry.relative_block(first_block)),
                    );
                }
            }
        }

        let key = self.address + plane as u32;
        let block = match mapper.block_and_assign(nand, key, BlockType::Normal, constraints) {
            Ok(block) => block,
            Err(NandError::MapperPhyMapFull) => {
                log::debug!("falling back to unconstrained block alloc for key {}", key);
                mapper.block_and_assign(nand, key, BlockType::Normal, AllocationConstraints::NONE)?
            }
            Err(e) => return Err(e),
        };

        self.planes[plane] = PlaneInfo {
            address: block,
            is_cached: true,
            is_unallocated: false,
        };
        Ok(block)
    }

    pub fn allocate_all_planes<N: NandDriver>(
        &mut self,
        nand: &mut N,
        mapper: &mut Mapper,
    ) -> Result<()> {
        for plane in 0..self.plane_count() {
            self.allocate_block_for_plane(nand, mapper, plane)?;
        }
        Ok(())
    }

    /// Free every allocated plane, erasing the blocks.
    ///
    /// When all planes are bound and sit on one chip, a single
    /// multiplane erase covers them; its per-plane statuses decide
    /// whether each block goes back to the free pool or into the bad
    /// list. Otherwise each plane is erased on its own through the
    /// phymap's auto-erase path. Either way the plane cache ends up
    /// invalidated.
    ///
    /// Newly discovered bad blocks are returned so the caller can
    /// record them in the owning region.
    pub fn free_and_erase_all_planes<N: NandDriver>(
        &mut self,
        nand: &mut N,
        mapper: &mut Mapper,
    ) -> Result<Vec<BlockAddr>> {
        let mut new_bad = Vec::new();
        let mut use_per_plane = true;
        let mut first_error: Result<()> = Ok(());

        // Note which planes actually hold blocks before anything is
        // released, so the mapper entries can be cleared afterward.
        let allocated: Vec<usize> = (0..self.plane_count())
            .filter(|&p| self.is_plane_allocated(nand, mapper, p))
            .collect();

        if self.plane_count() > 1 && self.is_fully_allocated(nand, mapper) {
            let same_chip = {
                let chip0 = self.geometry.chip_for_block(self.planes[0].address);
                (1..self.plane_count())
                    .all(|p| self.geometry.chip_for_block(self.planes[p].address) == chip0)
            };

            if same_chip {
                use_per_plane = false;
                let mut pb: Vec<MultiplaneEraseBlock> = (0..self.plane_count())
                    .map(|p| MultiplaneEraseBlock::new(self.planes[p].address))
                    .collect();

                nand.erase_multiple_blocks(&mut pb)?;

                for entry in &pb {
                    match entry.status {
                        Err(NandError::HalWriteFailed) => {
                            mapper.handle_new_bad_block(nand, entry.address)?;
                            new_bad.push(entry.address);
                        }
                        Err(e) => first_error = Err(e),
                        Ok(()) => {
                            // Freshly erased; no auto-erase needed.
                            mapper.phymap_mut().mark_block_free(entry.address);
                        }
                    }
                }
            }
        }

        if use_per_plane {
            for plane in 0..self.plane_count() {
                if self.is_plane_allocated(nand, mapper, plane) {
                    let address = self.planes[plane].address;
                    if let Some(bad) = mapper
                        .phymap_mut()
                        .mark_block_free_and_erase(nand, address)?
                    {
                        new_bad.push(bad);
                    }
                }
            }
        }

        // The physical blocks are gone; drop the mapping too.
        for plane in allocated {
            mapper.unassign(nand, self.address + plane as u32)?;
        }

        self.planes = [PlaneInfo::default(); MAX_PLANES];
        first_error?;
        Ok(new_bad)
    }
}
