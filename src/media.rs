//! Media and drive level API.
//!
//! A `Media` owns the NAND driver, the mapper, the drive regions, the
//! recovery manager, and the background worker. The filesystem above
//! only ever sees the drive calls: read or write a sector of a drive
//! identified by its tag, erase, flush, query info.
//!
//! The media state is guarded by one mutex (the NAND lock); every
//! logical operation locks it for its full multi-step duration. The
//! background worker locks it per work unit so foreground I/O can
//! interleave with long rewrites.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::geometry::{BlockAddr, NandGeometry};
use crate::mapper::{MapKind, Mapper};
use crate::metadata::{Metadata, METADATA_SIZE};
use crate::nand::{NandDriver, PersistentBit, PersistentBits};
use crate::region::Region;
use crate::system_drive::RecoveryManager;
use crate::tasks::{DeferredTaskQueue, Task};
use crate::virtual_block::VirtualBlock;
use crate::{NandError, Result};

/// Protection value required by the erase calls.
pub const MEDIA_ERASE_MAGIC: u32 = u32::from_be_bytes(*b"WIPE");

/// Blocks reserved at the top of the array for map storage. Two blocks
/// hold the current zone map and phymap; the rest is headroom for
/// consolidation.
const MAP_RANGE_BLOCKS: u32 = 8;

/// Virtual blocks held back from the data drive's reported capacity so
/// remapping always has somewhere to go.
const DATA_SPARE_VIRTUAL_BLOCKS: u32 = 2;

/// Blocks of padding per system region, consumed as blocks go bad.
const SYSTEM_PAD_BLOCKS: u32 = 1;

/// Identifies one logical drive on the media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriveTag {
    /// The user data drive.
    Data,
    /// Hidden data drive; separately allocated so its content can
    /// survive a preserving media erase.
    Hidden,
    /// Firmware copy the ROM boots from.
    PrimaryFirmware,
    /// Backup firmware copy.
    SecondaryFirmware,
    /// Master firmware copy, written once at manufacturing.
    MasterFirmware,
    /// Raw boot block area.
    Boot,
}

impl DriveTag {
    pub fn is_system(&self) -> bool {
        matches!(
            self,
            DriveTag::PrimaryFirmware
                | DriveTag::SecondaryFirmware
                | DriveTag::MasterFirmware
                | DriveTag::Boot
        )
    }

    pub fn is_firmware(&self) -> bool {
        matches!(
            self,
            DriveTag::PrimaryFirmware | DriveTag::SecondaryFirmware | DriveTag::MasterFirmware
        )
    }

    /// Only the firmware copies kept in triplicate can be rebuilt.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DriveTag::PrimaryFirmware | DriveTag::SecondaryFirmware)
    }

    pub fn is_data(&self) -> bool {
        matches!(self, DriveTag::Data | DriveTag::Hidden)
    }
}

/// Info selectors for `drive_get_info`/`drive_set_info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveInfoSelector {
    SectorSize,
    SectorCount,
    SizeBytes,
    Tag,
    IsSystem,
    ComponentVersion,
    ProjectVersion,
}

/// One entry of the allocation table handed to `media_allocate`.
#[derive(Debug, Clone, Copy)]
pub struct DriveSpec {
    pub tag: DriveTag,
    /// Blocks for system and hidden drives; ignored for the data
    /// drive, which takes everything that is left.
    pub block_count: u32,
    pub is_write_protected: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct DriveState {
    pub tag: DriveTag,
    pub is_initialized: bool,
    pub is_write_protected: bool,
    pub is_being_rewritten: bool,
    /// Logical block currently being refreshed in place; reads of it
    /// divert to the backup while the block is erased.
    pub refreshing_block: Option<u32>,
    pub sector_count: u32,
    pub component_version: u32,
    pub project_version: u32,
}

pub struct MediaCore<N: NandDriver, P: PersistentBits> {
    pub(crate) nand: N,
    pub(crate) geometry: NandGeometry,
    pub(crate) persistent: P,
    pub(crate) mapper: Mapper,
    pub(crate) regions: Vec<Region>,
    pub(crate) drives: Vec<DriveState>,
    pub(crate) recovery: RecoveryManager,
    pub(crate) queue: DeferredTaskQueue,
    pub(crate) is_allocated: bool,
    pub(crate) boot_drive: DriveTag,
}

impl<N: NandDriver, P: PersistentBits> MediaCore<N, P> {
    pub(crate) fn map_range(&self) -> (BlockAddr, BlockAddr) {
        let total = self.geometry.total_blocks();
        (total - MAP_RANGE_BLOCKS, total - 1)
    }

    pub(crate) fn region_index_for_tag(&self, tag: DriveTag) -> Option<usize> {
        self.regions.iter().position(|r| r.drive_tag == tag)
    }

    pub(crate) fn drive_state(&self, tag: DriveTag) -> Result<&DriveState> {
        self.drives
            .iter()
            .find(|d| d.tag == tag)
            .ok_or(NandError::InvalidDriveType)
    }

    pub(crate) fn drive_state_mut(&mut self, tag: DriveTag) -> Result<&mut DriveState> {
        self.drives
            .iter_mut()
            .find(|d| d.tag == tag)
            .ok_or(NandError::InvalidDriveType)
    }

    /// Carve regions out of the block array for an allocation table.
    /// The derivation is deterministic so discovery can rebuild the
    /// same layout from the same table.
    fn build_regions(&mut self, table: &[DriveSpec]) -> Result<()> {
        self.regions.clear();
        self.drives.clear();

        let mut cursor: BlockAddr = 0;
        let (map_start, _) = self.map_range();

        for spec in table.iter().filter(|s| !s.tag.is_data()) {
            let count = spec.block_count + SYSTEM_PAD_BLOCKS;
            if cursor + count > map_start {
                return Err(NandError::OutOfSpace);
            }
            let chip = self.geometry.chip_for_block(cursor);
            self.regions
                .push(Region::new(spec.tag, chip, cursor, count));
            self.drives.push(DriveState {
                tag: spec.tag,
                is_initialized: false,
                is_write_protected: spec.is_write_protected,
                is_being_rewritten: false,
                refreshing_block: None,
                sector_count: spec.block_count * self.geometry.pages_per_block,
                component_version: 0,
                project_version: 0,
            });
            cursor += count;
        }

        // Hidden data drives get their own regions ahead of the data
        // drive. They hold content (DRM stores and the like) that must
        // survive a media erase, so they can never share blocks with
        // the data drive.
        for spec in table.iter().filter(|s| s.tag == DriveTag::Hidden) {
            let planes = self.geometry.planes_per_die;
            let start = (cursor + planes - 1) & !(planes - 1);
            let count = (spec.block_count + planes - 1) & !(planes - 1);
            if count == 0 || start + count > map_start {
                return Err(NandError::OutOfSpace);
            }
            let usable = (count / planes).saturating_sub(1);
            self.regions.push(Region::new(
                DriveTag::Hidden,
                self.geometry.chip_for_block(start),
                start,
                count,
            ));
            self.drives.push(DriveState {
                tag: DriveTag::Hidden,
                is_initialized: false,
                is_write_protected: spec.is_write_protected,
                is_being_rewritten: false,
                refreshing_block: None,
                sector_count: usable * self.geometry.virtual_pages_per_block(),
                component_version: 0,
                project_version: 0,
            });
            cursor = start + count;
        }

        // The data drive takes the remaining space up to the map range,
        // aligned down to whole virtual blocks.
        if let Some(spec) = table.iter().find(|s| s.tag == DriveTag::Data) {
            let planes = self.geometry.planes_per_die;
            let start = (cursor + planes - 1) & !(planes - 1);
            let count = (map_start - start) & !(planes - 1);
            if count == 0 {
                return Err(NandError::OutOfSpace);
            }
            let virtual_blocks = count / planes;
            let usable = virtual_blocks.saturating_sub(DATA_SPARE_VIRTUAL_BLOCKS);
            self.regions.push(Region::new(
                DriveTag::Data,
                self.geometry.chip_for_block(start),
                start,
                count,
            ));
            self.drives.push(DriveState {
                tag: DriveTag::Data,
                is_initialized: false,
                is_write_protected: spec.is_write_protected,
                is_being_rewritten: false,
                refreshing_block: None,
                sector_count: usable * self.geometry.virtual_pages_per_block(),
                component_version: 0,
                project_version: 0,
            });
        }

        Ok(())
    }

    fn configure_mapper_ranges(&mut self) {
        let (map_start, map_end) = self.map_range();
        self.mapper
            .set_range(crate::mapper::BlockType::Map, map_start, map_end);
        if let Some(idx) = self.region_index_for_tag(DriveTag::Data) {
            let r = &self.regions[idx];
            self.mapper.set_range(
                crate::mapper::BlockType::Normal,
                r.start_block,
                r.start_block + r.block_count - 1,
            );
        }
    }

    /// Fresh-format the media for an allocation table: scan for factory
    /// bad blocks, free the data and map ranges, and create new maps.
    pub(crate) fn allocate(&mut self, table: &[DriveSpec]) -> Result<()> {
        self.build_regions(table)?;
        self.configure_mapper_ranges();

        // Data and hidden ranges: free every good block (erasing as
        // needed), retire factory bad ones into the owning region's
        // table.
        for idx in 0..self.regions.len() {
            if !self.regions[idx].drive_tag.is_data() {
                continue;
            }
            let (start, count) = {
                let r = &self.regions[idx];
                (r.start_block, r.block_count)
            };
            for block in start..start + count {
                if self.nand.is_block_factory_bad(block) {
                    self.regions[idx].add_new_bad_block(block);
                    self.mapper.phymap_mut().mark_block_used(block);
                } else if let Some(bad) = self
                    .mapper
                    .phymap_mut()
                    .mark_block_free_and_erase(&mut self.nand, block)?
                {
                    self.regions[idx].add_new_bad_block(bad);
                }
            }
        }

        // System regions: record factory bad blocks; their blocks stay
        // marked used since they are reserved.
        for region in self.regions.iter_mut() {
            if region.drive_tag.is_data() {
                continue;
            }
            for block in region.start_block..region.start_block + region.block_count {
                if self.nand.is_block_factory_bad(block) {
                    region.add_new_bad_block(block);
                }
            }
        }

        // Map range: free good blocks so the map allocator can draw
        // from them.
        let (map_start, map_end) = self.map_range();
        for block in map_start..=map_end {
            if !self.nand.is_block_factory_bad(block) {
                if let Some(bad) = self
                    .mapper
                    .phymap_mut()
                    .mark_block_free_and_erase(&mut self.nand, block)?
                {
                    log::warn!("map range block {} bad at format", bad);
                }
            }
        }

        self.mapper.format_new_maps(&mut self.nand)?;
        self.is_allocated = true;
        Ok(())
    }

    /// Mount an already-formatted media. The allocation table comes
    /// from the logical-drive layout the boot area describes; the same
    /// table always derives the same regions.
    pub(crate) fn discover(&mut self, table: &[DriveSpec]) -> Result<()> {
        self.build_regions(table)?;
        self.configure_mapper_ranges();

        let (map_start, map_end) = self.map_range();
        let wants_rewrite = match self.mapper.mount(&mut self.nand, map_start, map_end) {
            Ok(w) => w,
            Err(NandError::NotFound) => return Err(NandError::MediaNotAllocated),
            Err(e) => return Err(e),
        };

        if wants_rewrite {
            self.queue.post(Task::ConsolidateMap {
                which: MapKind::Zone,
            });
        }

        self.is_allocated = true;
        Ok(())
    }

    // ----- data drive paths (the data drive proper and hidden drives) -----

    fn data_region_index(&self, tag: DriveTag) -> Result<usize> {
        if !tag.is_data() {
            return Err(NandError::InvalidDriveType);
        }
        self.region_index_for_tag(tag)
            .ok_or(NandError::MediaNotAllocated)
    }

    /// Scope data-block allocation to one region. Hidden drives must
    /// never have their blocks handed to the data drive and vice
    /// versa, so every allocating operation pins the range first.
    fn scope_allocator_to_region(&mut self, region_idx: usize) {
        let r = &self.regions[region_idx];
        self.mapper.set_range(
            crate::mapper::BlockType::Normal,
            r.start_block,
            r.start_block + r.block_count - 1,
        );
    }

    pub(crate) fn data_read_sector(
        &mut self,
        tag: DriveTag,
        lba: u32,
        buffer: &mut [u8],
    ) -> Result<()> {
        let region_idx = self.data_region_index(tag)?;
        let mut vb = VirtualBlock::new(self.geometry);
        let offset = vb.set_from_region(&self.regions[region_idx], lba);

        let page = match vb.physical_page_for_virtual_offset(&mut self.nand, &mut self.mapper, offset)
        {
            Ok(page) => page,
            Err(NandError::MapperInvalidPhysicalAddress) => {
                // Never written; an erased sector reads as all 0xff.
                buffer.fill(0xff);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let mut meta = vec![0u8; self.geometry.page_metadata_size];
        match self.nand.read_page(page, buffer, &mut meta) {
            Ok(()) | Err(NandError::EccFixed) => Ok(()),
            Err(NandError::EccFixedShouldRewrite) => {
                // The data is good but the block is hot; refresh it in
                // the background.
                let logical_block = lba / self.geometry.virtual_pages_per_block();
                self.queue.post(Task::RefreshBlock {
                    drive: tag,
                    logical_block,
                });
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn data_write_sector(
        &mut self,
        tag: DriveTag,
        lba: u32,
        buffer: &[u8],
    ) -> Result<()> {
        let region_idx = self.data_region_index(tag)?;
        self.scope_allocator_to_region(region_idx);
        let mut vb = VirtualBlock::new(self.geometry);
        let offset = vb.set_from_region(&self.regions[region_idx], lba);
        let plane = self.geometry.plane_for_virtual_offset(offset) as usize;
        let physical_offset = self.geometry.physical_offset_for_virtual_offset(offset);

        let mut meta_buf = vec![0xffu8; self.geometry.page_metadata_size];
        meta_buf[..METADATA_SIZE].copy_from_slice(Metadata::for_lba(lba, offset as u16).bytes());

        // A failed program means the block just went bad: retire it and
        // retry on a fresh block, carrying over any pages already
        // written there.
        for attempt in 0..2 {
            let block = match vb.physical_block_for_plane(&mut self.nand, &mut self.mapper, plane) {
                Ok(block) => block,
                Err(NandError::MapperInvalidPhysicalAddress) => {
                    vb.allocate_block_for_plane(&mut self.nand, &mut self.mapper, plane)?
                }
                Err(e) => return Err(e),
            };

            let page = self.geometry.block_to_page(block) + physical_offset;

            // Pages can only be programmed once between erases, so a
            // rewrite of a live sector relocates the whole virtual
            // block with the new data folded in.
            let mut check = vec![0u8; self.geometry.page_metadata_size];
            let occupied = match self.nand.read_metadata(page, &mut check) {
                Ok(())
                | Err(NandError::EccFixed)
                | Err(NandError::EccFixedShouldRewrite) => {
                    !Metadata::from_bytes(&check).is_erased()
                }
                Err(_) => true,
            };
            if occupied {
                return self.data_replace_sector(region_idx, &mut vb, lba, offset, buffer);
            }

            match self.nand.write_page(page, buffer, &meta_buf) {
                Ok(()) => return Ok(()),
                Err(NandError::HalWriteFailed) if attempt == 0 => {
                    self.retire_data_block(region_idx, &mut vb, plane, block, physical_offset)?;
                }
                Err(e) => return Err(e),
            }
        }

        Err(NandError::HalWriteFailed)
    }

    /// Replace a sector that already holds data: salvage the rest of
    /// the virtual block, release the old physical blocks, and rewrite
    /// everything with the new sector folded in.
    fn data_replace_sector(
        &mut self,
        region_idx: usize,
        vb: &mut VirtualBlock,
        lba: u32,
        offset: u32,
        buffer: &[u8],
    ) -> Result<()> {
        let mut pages: Vec<(u32, Vec<u8>, Vec<u8>)> = Vec::new();
        for off in 0..self.geometry.virtual_pages_per_block() {
            if off == offset {
                continue;
            }
            let page =
                match vb.physical_page_for_virtual_offset(&mut self.nand, &mut self.mapper, off) {
                    Ok(page) => page,
                    Err(NandError::MapperInvalidPhysicalAddress) => continue,
                    Err(e) => return Err(e),
                };
            let mut data = vec![0u8; self.geometry.page_data_size];
            let mut meta = vec![0u8; self.geometry.page_metadata_size];
            match self.nand.read_page(page, &mut data, &mut meta) {
                Ok(())
                | Err(NandError::EccFixed)
                | Err(NandError::EccFixedShouldRewrite) => {
                    if !Metadata::from_bytes(&meta).is_erased() {
                        pages.push((off, data, meta));
                    }
                }
                Err(_) => {}
            }
        }

        let mut new_meta = vec![0xffu8; self.geometry.page_metadata_size];
        new_meta[..METADATA_SIZE].copy_from_slice(Metadata::for_lba(lba, offset as u16).bytes());
        pages.push((offset, buffer.to_vec(), new_meta));
        // Ascending virtual offsets keep each plane's program order
        // ascending too.
        pages.sort_by_key(|p| p.0);

        let new_bad = vb.free_and_erase_all_planes(&mut self.nand, &mut self.mapper)?;
        for bad in new_bad {
            self.regions[region_idx].add_new_bad_block(bad);
        }

        for (off, data, meta) in pages {
            let plane = self.geometry.plane_for_virtual_offset(off) as usize;
            let block = match vb.physical_block_for_plane(&mut self.nand, &mut self.mapper, plane) {
                Ok(block) => block,
                Err(NandError::MapperInvalidPhysicalAddress) => {
                    vb.allocate_block_for_plane(&mut self.nand, &mut self.mapper, plane)?
                }
                Err(e) => return Err(e),
            };
            let page = self.geometry.block_to_page(block)
                + self.geometry.physical_offset_for_virtual_offset(off);
            self.nand.write_page(page, &data, &meta)?;
        }

        Ok(())
    }

    /// A data block failed to program. Salvage the pages below the
    /// failed offset, retire the block, and move the salvage into a
    /// freshly allocated block on the same plane.
    fn retire_data_block(
        &mut self,
        region_idx: usize,
        vb: &mut VirtualBlock,
        plane: usize,
        old_block: BlockAddr,
        failed_offset: u32,
    ) -> Result<()> {
        log::warn!("data block {} went bad during program", old_block);

        // Salvage what was already written, before the erase.
        let mut salvaged: Vec<(u32, Vec<u8>, Vec<u8>)> = Vec::new();
        for off in 0..failed_offset {
            let mut data = vec![0u8; self.geometry.page_data_size];
            let mut meta = vec![0u8; self.geometry.page_metadata_size];
            let page = self.geometry.block_to_page(old_block) + off;
            match self.nand.read_page(page, &mut data, &mut meta) {
                Ok(())
                | Err(NandError::EccFixed)
                | Err(NandError::EccFixedShouldRewrite) => {
                    if !Metadata::from_bytes(&meta).is_erased() {
                        salvaged.push((off, data, meta));
                    }
                }
                Err(_) => {}
            }
        }

        // Retire: unmap, pin in the phymap, record in the region, and
        // stamp the bad-block marker.
        self.mapper.handle_new_bad_block(&mut self.nand, old_block)?;
        self.regions[region_idx].add_new_bad_block(old_block);
        let _ = self.nand.erase_block(old_block);
        let mut marker = Metadata::erased();
        marker.mark_bad();
        let zero = vec![0u8; self.geometry.page_data_size];
        let mut marker_meta = vec![0xffu8; self.geometry.page_metadata_size];
        marker_meta[..METADATA_SIZE].copy_from_slice(marker.bytes());
        let _ = self
            .nand
            .write_page(self.geometry.block_to_page(old_block), &zero, &marker_meta);

        // Re-target the virtual block and replay the salvage.
        let address = vb.address();
        vb.set(address);
        let new_block = vb.allocate_block_for_plane(&mut self.nand, &mut self.mapper, plane)?;
        for (off, data, meta) in salvaged {
            let page = self.geometry.block_to_page(new_block) + off;
            self.nand.write_page(page, &data, &meta)?;
        }

        Ok(())
    }

    /// Relocate one virtual block of a data-type drive to fresh
    /// physical blocks. This is the refresh run by the worker when a
    /// read came back with rewrite advice.
    pub(crate) fn data_refresh_block(&mut self, tag: DriveTag, logical_block: u32) -> Result<()> {
        let region_idx = self.data_region_index(tag)?;
        self.scope_allocator_to_region(region_idx);
        let mut vb = VirtualBlock::new(self.geometry);
        let first_sector = logical_block * self.geometry.virtual_pages_per_block();
        vb.set_from_region(&self.regions[region_idx], first_sector);

        // Pull every written page out before releasing the blocks.
        let mut pages: Vec<(u32, Vec<u8>, Vec<u8>)> = Vec::new();
        for offset in 0..self.geometry.virtual_pages_per_block() {
            let page =
                match vb.physical_page_for_virtual_offset(&mut self.nand, &mut self.mapper, offset)
                {
                    Ok(page) => page,
                    Err(NandError::MapperInvalidPhysicalAddress) => continue,
                    Err(e) => return Err(e),
                };
            let mut data = vec![0u8; self.geometry.page_data_size];
            let mut meta = vec![0u8; self.geometry.page_metadata_size];
            match self.nand.read_page(page, &mut data, &mut meta) {
                Ok(())
                | Err(NandError::EccFixed)
                | Err(NandError::EccFixedShouldRewrite) => {
                    if !Metadata::from_bytes(&meta).is_erased() {
                        pages.push((offset, data, meta));
                    }
                }
                Err(NandError::EccUncorrectable) => {
                    // Nothing left to salvage for this page.
                    log::warn!(
                        "refresh of virtual block {} lost page offset {}",
                        vb.address(),
                        offset
                    );
                }
                Err(e) => return Err(e),
            }
        }

        let new_bad = vb.free_and_erase_all_planes(&mut self.nand, &mut self.mapper)?;
        for bad in new_bad {
            self.regions[region_idx].add_new_bad_block(bad);
        }

        for (offset, data, meta) in pages {
            let plane = self.geometry.plane_for_virtual_offset(offset) as usize;
            let block = match vb.physical_block_for_plane(&mut self.nand, &mut self.mapper, plane) {
                Ok(block) => block,
                Err(NandError::MapperInvalidPhysicalAddress) => {
                    vb.allocate_block_for_plane(&mut self.nand, &mut self.mapper, plane)?
                }
                Err(e) => return Err(e),
            };
            let page = self.geometry.block_to_page(block)
                + self.geometry.physical_offset_for_virtual_offset(offset);
            self.nand.write_page(page, &data, &meta)?;
        }

        Ok(())
    }

    pub(crate) fn erase_data_drive(&mut self, tag: DriveTag) -> Result<()> {
        let region_idx = self.data_region_index(tag)?;
        let (start, count) = {
            let r = &self.regions[region_idx];
            (r.start_block, r.block_count)
        };

        // Drop every mapping that points into the region, then return
        // the good blocks to the erased free pool.
        for key in start..start + count {
            if self.mapper.block_info(&mut self.nand, key)?.is_some() {
                self.mapper.unassign(&mut self.nand, key)?;
            }
        }

        for block in start..start + count {
            if self.regions[region_idx].bad_blocks.contains(block) {
                continue;
            }
            if let Some(bad) = self
                .mapper
                .phymap_mut()
                .mark_block_free_and_erase(&mut self.nand, block)?
            {
                self.regions[region_idx].add_new_bad_block(bad);
            }
        }

        self.mapper.flush(&mut self.nand)
    }
}

/// Public handle to one media. Owns the background worker.
pub struct Media<N: NandDriver + Send + 'static, P: PersistentBits + Send + 'static> {
    core: Arc<Mutex<MediaCore<N, P>>>,
    queue: DeferredTaskQueue,
    worker: Option<JoinHandle<()>>,
}

impl<N: NandDriver + Send + 'static, P: PersistentBits + Send + 'static> Media<N, P> {
    /// Bring up the media: build the mapper and start the worker. No
    /// NAND scanning happens yet; call `media_allocate` on a fresh
    /// media or `media_discover_allocation` on a formatted one.
    pub fn media_init(mut nand: N, persistent: P) -> Self {
        let geometry = nand.geometry();
        let seed = nand.entropy_seed();
        let queue = DeferredTaskQueue::new();

        let mut mapper = Mapper::new(geometry, seed);

        // Persist the phymap in the background whenever it turns dirty.
        let listener_queue = queue.clone();
        mapper
            .phymap_mut()
            .set_dirty_listener(Box::new(move |was, now| {
                if !was && now {
                    listener_queue.post(Task::SavePhyMap);
                }
            }));

        let core = Arc::new(Mutex::new(MediaCore {
            nand,
            geometry,
            persistent,
            mapper,
            regions: Vec::new(),
            drives: Vec::new(),
            recovery: RecoveryManager::new(),
            queue: queue.clone(),
            is_allocated: false,
            boot_drive: DriveTag::PrimaryFirmware,
        }));

        let worker_core = core.clone();
        let worker_queue = queue.clone();
        let worker = std::thread::spawn(move || {
            while let Some(task) = worker_queue.wait_for_task() {
                run_deferred_task(&worker_core, task);
                worker_queue.task_finished();
            }
        });

        Media {
            core,
            queue,
            worker: Some(worker),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MediaCore<N, P>> {
        // A poisoned lock means a worker panicked; the state is still
        // the best we have.
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn media_allocate(&self, table: &[DriveSpec]) -> Result<()> {
        self.lock().allocate(table)
    }

    pub fn media_discover_allocation(&self, table: &[DriveSpec]) -> Result<()> {
        self.lock().discover(table)
    }

    pub fn media_is_allocated(&self) -> bool {
        self.lock().is_allocated
    }

    /// Erase the user-visible content of the media. With
    /// `preserve_hidden` the hidden drives are skipped, so their
    /// content (DRM stores and the like) survives the wipe.
    pub fn media_erase(&self, magic: u32, preserve_hidden: bool) -> Result<()> {
        if magic != MEDIA_ERASE_MAGIC {
            return Err(NandError::WriteProtected);
        }
        let mut core = self.lock();
        if !core.is_allocated {
            return Err(NandError::MediaNotAllocated);
        }
        core.erase_data_drive(DriveTag::Data)?;
        if !preserve_hidden && core.region_index_for_tag(DriveTag::Hidden).is_some() {
            core.erase_data_drive(DriveTag::Hidden)?;
        }
        Ok(())
    }

    pub fn media_set_boot_drive(&self, tag: DriveTag) -> Result<()> {
        if !tag.is_firmware() {
            return Err(NandError::InvalidDriveType);
        }
        let mut core = self.lock();
        core.boot_drive = tag;
        let secondary = tag == DriveTag::SecondaryFirmware;
        core.persistent
            .write_bit(PersistentBit::NandSecondaryBoot, secondary);
        Ok(())
    }

    /// Flush dirty state and stop the worker. The worker's in-flight
    /// task is allowed to finish; pending tasks are abandoned. The
    /// media object is consumed.
    pub fn media_shutdown(mut self) -> Result<()> {
        self.queue.shutdown();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        let mut core = self.lock();
        if core.is_allocated {
            let core = &mut *core;
            core.mapper.flush(&mut core.nand)?;
        }
        Ok(())
    }

    // ----- drive API -----

    pub fn drive_init(&self, tag: DriveTag) -> Result<()> {
        let mut core = self.lock();
        if !core.is_allocated {
            return Err(NandError::MediaNotAllocated);
        }
        core.drive_state_mut(tag)?.is_initialized = true;
        if tag.is_firmware() {
            core.recovery.register_drive(tag);
        }
        Ok(())
    }

    pub fn drive_read_sector(&self, tag: DriveTag, lba: u32, buffer: &mut [u8]) -> Result<()> {
        let mut core = self.lock();
        core.check_drive_ready(tag, lba)?;
        match tag {
            DriveTag::Data | DriveTag::Hidden => core.data_read_sector(tag, lba, buffer),
            _ => core.system_read_sector_with_recovery(tag, lba, buffer),
        }
    }

    pub fn drive_write_sector(&self, tag: DriveTag, lba: u32, buffer: &[u8]) -> Result<()> {
        let mut core = self.lock();
        core.check_drive_ready(tag, lba)?;
        if core.drive_state(tag)?.is_write_protected {
            return Err(NandError::WriteProtected);
        }
        match tag {
            DriveTag::Data | DriveTag::Hidden => core.data_write_sector(tag, lba, buffer),
            _ => core.system_write_sector(tag, lba, buffer),
        }
    }

    pub fn drive_erase(&self, tag: DriveTag, magic: u32) -> Result<()> {
        if magic != MEDIA_ERASE_MAGIC {
            return Err(NandError::WriteProtected);
        }
        let mut core = self.lock();
        if core.drive_state(tag)?.is_write_protected {
            return Err(NandError::WriteProtected);
        }
        match tag {
            DriveTag::Data | DriveTag::Hidden => core.erase_data_drive(tag),
            _ => core.system_drive_erase(tag),
        }
    }

    pub fn drive_flush(&self, tag: DriveTag) -> Result<()> {
        let mut core = self.lock();
        if !core.drive_state(tag)?.is_initialized {
            return Err(NandError::NotInitialized);
        }
        if tag.is_data() {
            let core = &mut *core;
            core.mapper.flush(&mut core.nand)?;
        }
        Ok(())
    }

    pub fn drive_get_info(&self, tag: DriveTag, selector: DriveInfoSelector) -> Result<u64> {
        let core = self.lock();
        let state = core.drive_state(tag)?;
        let value = match selector {
            DriveInfoSelector::SectorSize => core.geometry.page_data_size as u64,
            DriveInfoSelector::SectorCount => state.sector_count as u64,
            DriveInfoSelector::SizeBytes => {
                state.sector_count as u64 * core.geometry.page_data_size as u64
            }
            DriveInfoSelector::Tag => state.tag as u64,
            DriveInfoSelector::IsSystem => state.tag.is_system() as u64,
            DriveInfoSelector::ComponentVersion => state.component_version as u64,
            DriveInfoSelector::ProjectVersion => state.project_version as u64,
        };
        Ok(value)
    }

    pub fn drive_set_info(
        &self,
        tag: DriveTag,
        selector: DriveInfoSelector,
        value: u64,
    ) -> Result<()> {
        let mut core = self.lock();
        let state = core.drive_state_mut(tag)?;
        match selector {
            DriveInfoSelector::ComponentVersion => state.component_version = value as u32,
            DriveInfoSelector::ProjectVersion => state.project_version = value as u32,
            _ => return Err(NandError::InvalidInfoSelector),
        }
        Ok(())
    }

    /// The firmware drive the boot ROM is pointed at.
    pub fn boot_drive(&self) -> DriveTag {
        self.lock().boot_drive
    }

    /// Currently selected firmware read source. Test and diagnostic
    /// hook.
    pub fn current_firmware_drive(&self) -> DriveTag {
        self.lock().recovery.current_drive()
    }

    /// Whether a drive rewrite is in flight.
    pub fn recovery_active(&self) -> bool {
        self.lock().recovery.is_active()
    }

    /// Refresh statistics: rewrites of the primary and of the
    /// secondary firmware drive.
    pub fn recovery_refresh_counts(&self) -> [u32; 2] {
        self.lock().recovery.refresh_counts()
    }

    /// Wait until the background queue is empty and the worker is idle.
    pub fn drain_background_work(&self) {
        self.queue.wait_until_idle();
    }

    /// Free blocks across the whole array, straight from the phymap.
    pub fn free_block_count(&self) -> u32 {
        self.lock().mapper.phymap().free_count()
    }

    /// The physical block mapped for a zone-map key, if any.
    pub fn physical_block_for_key(&self, key: u32) -> Result<Option<BlockAddr>> {
        let mut core = self.lock();
        let core = &mut *core;
        core.mapper.block_info(&mut core.nand, key)
    }

    /// Snapshot of a drive region's discovered bad blocks.
    pub fn region_bad_blocks(&self, tag: DriveTag) -> Vec<BlockAddr> {
        let core = self.lock();
        match core.region_index_for_tag(tag) {
            Some(idx) => core.regions[idx].bad_blocks.iter().copied().collect(),
            None => Vec::new(),
        }
    }

    /// The first absolute block of a drive's region, for tests that
    /// need to compute physical positions.
    pub fn region_start_block(&self, tag: DriveTag) -> Option<BlockAddr> {
        let core = self.lock();
        core.region_index_for_tag(tag)
            .map(|idx| core.regions[idx].start_block)
    }
}

impl<N: NandDriver + Send + 'static, P: PersistentBits + Send + 'static> MediaCore<N, P> {
    fn check_drive_ready(&self, tag: DriveTag, lba: u32) -> Result<()> {
        if !self.is_allocated {
            return Err(NandError::MediaNotAllocated);
        }
        let state = self.drive_state(tag)?;
        if !state.is_initialized {
            return Err(NandError::NotInitialized);
        }
        if lba >= state.sector_count {
            return Err(NandError::AddressOutOfRange);
        }
        Ok(())
    }
}

/// One unit of background work, run with the core locked per step.
fn run_deferred_task<N, P>(core: &Arc<Mutex<MediaCore<N, P>>>, task: Task)
where
    N: NandDriver + Send + 'static,
    P: PersistentBits + Send + 'static,
{
    log::debug!("deferred worker running {:?}", task);
    let result = match task {
        Task::SavePhyMap => {
            let mut guard = core.lock().unwrap_or_else(|e| e.into_inner());
            let c = &mut *guard;
            c.mapper.flush(&mut c.nand)
        }
        Task::ConsolidateMap { which } => {
            let mut guard = core.lock().unwrap_or_else(|e| e.into_inner());
            let c = &mut *guard;
            c.mapper.consolidate(&mut c.nand, which)
        }
        Task::RefreshBlock {
            drive,
            logical_block,
        } if drive.is_data() => {
            let mut guard = core.lock().unwrap_or_else(|e| e.into_inner());
            guard.data_refresh_block(drive, logical_block)
        }
        Task::RefreshBlock {
            drive,
            logical_block,
        } => crate::system_drive::run_block_refresh(core, drive, logical_block),
        Task::RewriteDrive {
            drive,
            switch_on_success,
        } => crate::system_drive::run_drive_rewrite(core, drive, switch_on_success),
    };

    if let Err(e) = result {
        log::warn!("deferred task failed: {:?}", e);
    }
}
