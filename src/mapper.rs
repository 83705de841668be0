//! Virtual to physical block mapping.
//!
//! The mapper answers "where does this virtual block live" and hands out
//! fresh physical blocks, keeping two persistent structures current: the
//! zone map (virtual block key -> physical block) and the phymap
//! (occupancy bitmap). Both are stored on the media through
//! `persistent_map`; the zone map is loaded section by section on
//! demand, while the phymap is loaded in full at mount.

use crate::allocator::{AllocationConstraints, LinearBlockAllocator, RandomBlockAllocator};
use crate::geometry::{BlockAddr, NandGeometry};
use crate::metadata::{Metadata, METADATA_SIZE};
use crate::nand::NandDriver;
use crate::persistent_map::{
    ConsolidateSource, MapResources, PersistentMap, PersistentPhyMap, ZONE_MAP_METADATA_TAG,
    ZONE_MAP_TYPE, PHYS_MAP_METADATA_TAG,
};
use crate::phymap::PhyMap;
use crate::{NandError, Result, BLOCK_NONE};

/// What a block is being allocated for. Each type draws from its own
/// block range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    /// Data drive blocks.
    Normal,
    /// Blocks reserved for storing the zone map and phymap.
    Map,
    /// Per-drive reserved blocks (system drives).
    System,
}

/// Which persistent map is meant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    Zone,
    Phy,
}

pub struct Mapper {
    geometry: NandGeometry,
    phymap: PhyMap,
    persistent_phymap: PersistentPhyMap,
    zone_map: PersistentMap,

    // In-memory zone map cache, one entry per mapper key. Sections are
    // pulled in lazily and written back when dirty.
    zone_entries: Vec<u32>,
    zone_section_loaded: Vec<bool>,
    zone_section_dirty: Vec<bool>,
    zone_entry_size: usize,
    unallocated: u32,

    map_allocator: LinearBlockAllocator,
    normal_allocator: RandomBlockAllocator,
    system_allocator: LinearBlockAllocator,
}

impl Mapper {
    pub fn new(geometry: NandGeometry, entropy_seed: u32) -> Self {
        let total_blocks = geometry.total_blocks();

        // Zone entries only need to address physical blocks; three bytes
        // cover every NAND we support, four are used past 16M blocks.
        let zone_entry_size = if total_blocks < 0x00ff_ffff { 3 } else { 4 };
        let unallocated = if zone_entry_size == 3 {
            0x00ff_ffff
        } else {
            0xffff_ffff
        };

        let mut zone_map = PersistentMap::new(ZONE_MAP_TYPE, ZONE_MAP_METADATA_TAG);
        zone_map.init(&geometry, zone_entry_size, total_blocks as usize);
        let section_count = zone_map.total_section_count();

        let mut persistent_phymap = PersistentPhyMap::new();
        persistent_phymap.init(&geometry);

        Mapper {
            geometry,
            phymap: PhyMap::new(total_blocks),
            persistent_phymap,
            zone_map,
            zone_entries: vec![unallocated; total_blocks as usize],
            zone_section_loaded: vec![false; section_count],
            zone_section_dirty: vec![false; section_count],
            zone_entry_size,
            unallocated,
            map_allocator: LinearBlockAllocator::new(),
            normal_allocator: RandomBlockAllocator::new(entropy_seed),
            system_allocator: LinearBlockAllocator::new(),
        }
    }

    pub fn geometry(&self) -> NandGeometry {
        self.geometry
    }

    pub fn phymap(&self) -> &PhyMap {
        &self.phymap
    }

    pub fn phymap_mut(&mut self) -> &mut PhyMap {
        &mut self.phymap
    }

    pub fn unallocated_sentinel(&self) -> u32 {
        self.unallocated
    }

    /// Set the block range each allocation type draws from. Ends are
    /// inclusive.
    pub fn set_range(&mut self, block_type: BlockType, start: BlockAddr, end: BlockAddr) {
        match block_type {
            BlockType::Normal => self.normal_allocator.set_range(start, end),
            BlockType::Map => self.map_allocator.set_range(start, end),
            BlockType::System => self.system_allocator.set_range(start, end),
        }
    }

    fn resources<'a, N: NandDriver>(
        nand: &'a mut N,
        phymap: &'a mut PhyMap,
        map_allocator: &'a mut LinearBlockAllocator,
        geometry: NandGeometry,
    ) -> MapResources<'a, N> {
        MapResources {
            nand,
            phymap,
            map_allocator,
            geometry,
        }
    }

    /// Look up the physical block for a mapper key. `Ok(None)` means
    /// the key is unallocated.
    pub fn block_info<N: NandDriver>(
        &mut self,
        nand: &mut N,
        key: u32,
    ) -> Result<Option<BlockAddr>> {
        self.ensure_section_loaded(nand, self.section_for_key(key))?;
        let entry = self.zone_entries[key as usize];
        if entry == self.unallocated {
            Ok(None)
        } else {
            Ok(Some(entry))
        }
    }

    /// Allocate a free physical block for a mapper key, record the
    /// assignment, and mark the block used. Constrained allocations that
    /// find nothing report `MapperPhyMapFull`; the caller decides
    /// whether to retry unconstrained.
    pub fn block_and_assign<N: NandDriver>(
        &mut self,
        nand: &mut N,
        key: u32,
        block_type: BlockType,
        constraints: AllocationConstraints,
    ) -> Result<BlockAddr> {
        let block = match block_type {
            BlockType::Normal => {
                self.normal_allocator.set_constraints(constraints);
                self.normal_allocator.allocate(&self.phymap, &self.geometry)
            }
            BlockType::Map => {
                self.map_allocator.set_constraints(constraints);
                self.map_allocator.allocate(&self.phymap, &self.geometry)
            }
            BlockType::System => {
                self.system_allocator.set_constraints(constraints);
                self.system_allocator.allocate(&self.phymap, &self.geometry)
            }
        }
        .ok_or(NandError::MapperPhyMapFull)?;

        self.phymap.mark_block_used(block);
        self.set_block_info(nand, key, block)?;
        Ok(block)
    }

    /// Drop a key's assignment, returning it to "unallocated". The
    /// physical block's phymap state is the caller's business.
    pub fn unassign<N: NandDriver>(&mut self, nand: &mut N, key: u32) -> Result<()> {
        let sentinel = self.unallocated;
        self.set_block_info(nand, key, sentinel)
    }

    /// Record an assignment (or clear one by passing the sentinel).
    fn set_block_info<N: NandDriver>(&mut self, nand: &mut N, key: u32, value: u32) -> Result<()> {
        let section = self.section_for_key(key);
        self.ensure_section_loaded(nand, section)?;
        self.zone_entries[key as usize] = value;
        self.zone_section_dirty[section] = true;
        Ok(())
    }

    /// A block just failed an erase or program. Make sure nothing maps
    /// to it anymore and that it can never be handed out again. The
    /// caller still has to record it in the owning region's bad-block
    /// table.
    pub fn handle_new_bad_block<N: NandDriver>(
        &mut self,
        nand: &mut N,
        block: BlockAddr,
    ) -> Result<()> {
        log::warn!("mapper: retiring new bad block {}", block);
        self.phymap.mark_block_used(block);

        // Un-map any virtual key pointing at the dead block.
        for section in 0..self.zone_section_loaded.len() {
            self.ensure_section_loaded(nand, section)?;
        }
        for key in 0..self.zone_entries.len() {
            if self.zone_entries[key] == block {
                self.zone_entries[key] = self.unallocated;
                let section = self.section_for_key(key as u32);
                self.zone_section_dirty[section] = true;
            }
        }
        Ok(())
    }

    /// Scan the reserved map range for the block holding the given map,
    /// recognizable by the signature in its first page's metadata.
    pub fn find_map_block<N: NandDriver>(
        &mut self,
        nand: &mut N,
        which: MapKind,
        range_start: BlockAddr,
        range_end: BlockAddr,
    ) -> Result<BlockAddr> {
        let wanted = match which {
            MapKind::Zone => ZONE_MAP_METADATA_TAG,
            MapKind::Phy => PHYS_MAP_METADATA_TAG,
        };
        let mut meta = vec![0u8; self.geometry.page_metadata_size];

        for block in range_start..=range_end {
            match nand.read_metadata(self.geometry.block_to_page(block), &mut meta) {
                Ok(()) | Err(NandError::EccFixed) | Err(NandError::EccFixedShouldRewrite) => {}
                Err(_) => continue,
            }
            let parsed = Metadata::from_bytes(&meta[..METADATA_SIZE]);
            if !parsed.is_erased() && parsed.signature() == wanted {
                return Ok(block);
            }
        }

        Err(NandError::NotFound)
    }

    /// Mount existing maps from the media: the phymap is loaded in
    /// full, the zone map's offset table is built and its sections load
    /// on demand. Returns true when either map wants a consolidation
    /// pass (a corrupt or hot page was seen).
    pub fn mount<N: NandDriver>(
        &mut self,
        nand: &mut N,
        map_range_start: BlockAddr,
        map_range_end: BlockAddr,
    ) -> Result<bool> {
        let phy_block = self.find_map_block(nand, MapKind::Phy, map_range_start, map_range_end)?;
        let zone_block = self.find_map_block(nand, MapKind::Zone, map_range_start, map_range_end)?;

        let mut wants_rewrite;
        {
            let mut res = Self::resources(
                nand,
                &mut self.phymap,
                &mut self.map_allocator,
                self.geometry,
            );
            wants_rewrite = self.persistent_phymap.load(&mut res, phy_block)?;
        }

        {
            let mut res = Self::resources(
                nand,
                &mut self.phymap,
                &mut self.map_allocator,
                self.geometry,
            );
            self.zone_map.set_block(zone_block);
            wants_rewrite |= self.zone_map.build_section_offset_table(&mut res)?;
        }
        self.zone_section_loaded.fill(false);
        self.zone_section_dirty.fill(false);

        // The loaded bitmap may predate the final location of the map
        // blocks themselves; pin them down.
        self.phymap.mark_block_used(self.persistent_phymap.block());
        self.phymap.mark_block_used(self.zone_map.block());
        self.phymap.clear_dirty();

        Ok(wants_rewrite)
    }

    /// Create fresh maps on a formatted media. The phymap must already
    /// reflect the media's occupancy; the zone map starts fully
    /// unallocated.
    pub fn format_new_maps<N: NandDriver>(&mut self, nand: &mut N) -> Result<()> {
        {
            let mut res = Self::resources(
                nand,
                &mut self.phymap,
                &mut self.map_allocator,
                self.geometry,
            );
            self.persistent_phymap.save_new_copy(&mut res)?;
        }

        self.zone_entries.fill(self.unallocated);
        self.zone_section_loaded.fill(true);
        self.zone_section_dirty.fill(false);

        // Write every zone section out; the first write allocates the
        // zone map's block.
        self.zone_map.set_block(BLOCK_NONE);
        for section in 0..self.zone_map.total_section_count() {
            self.write_zone_section(nand, section)?;
        }

        // The save above dirtied the phymap again; persist the final
        // state so a clean mount sees both maps.
        self.flush(nand)?;
        Ok(())
    }

    /// Write back anything dirty: zone sections first, then the phymap
    /// (whose bitmap the zone writes may touch through consolidation).
    pub fn flush<N: NandDriver>(&mut self, nand: &mut N) -> Result<()> {
        for section in 0..self.zone_section_dirty.len() {
            if self.zone_section_dirty[section] {
                self.write_zone_section(nand, section)?;
            }
        }

        if self.phymap.is_dirty() {
            let mut res = Self::resources(
                nand,
                &mut self.phymap,
                &mut self.map_allocator,
                self.geometry,
            );
            self.persistent_phymap.save(&mut res)?;
        }
        Ok(())
    }

    /// Force the whole zone map through a consolidation, e.g. after a
    /// corrupt section page was noticed at mount.
    pub fn consolidate<N: NandDriver>(&mut self, nand: &mut N, which: MapKind) -> Result<()> {
        match which {
            MapKind::Zone => {
                let mut res = Self::resources(
                    nand,
                    &mut self.phymap,
                    &mut self.map_allocator,
                    self.geometry,
                );
                self.zone_map
                    .consolidate(&mut res, ConsolidateSource::Media, None)
            }
            MapKind::Phy => {
                let mut res = Self::resources(
                    nand,
                    &mut self.phymap,
                    &mut self.map_allocator,
                    self.geometry,
                );
                self.persistent_phymap.save(&mut res)
            }
        }
    }

    pub fn is_map_block(&self, block: BlockAddr) -> bool {
        self.zone_map.is_map_block(block) || self.persistent_phymap.is_map_block(block)
    }

    fn section_for_key(&self, key: u32) -> usize {
        key as usize / self.zone_map.max_entries_per_page()
    }

    fn ensure_section_loaded<N: NandDriver>(&mut self, nand: &mut N, section: usize) -> Result<()> {
        if self.zone_section_loaded[section] {
            return Ok(());
        }

        if self.zone_map.block() == BLOCK_NONE || self.zone_map.section_offset(section).is_none() {
            // Nothing on media yet; the RAM default (unallocated) is
            // authoritative.
            self.zone_section_loaded[section] = true;
            return Ok(());
        }

        let per_page = self.zone_map.max_entries_per_page();
        let mut buffer = vec![0u8; per_page * self.zone_entry_size];
        let count;
        {
            let mut res = Self::resources(
                nand,
                &mut self.phymap,
                &mut self.map_allocator,
                self.geometry,
            );
            count = self.zone_map.retrieve_section(
                &mut res,
                (section * per_page) as u32,
                &mut buffer,
                true,
            )?;
        }

        let base = section * per_page;
        for i in 0..count as usize {
            let lo = i * self.zone_entry_size;
            let mut value = 0u32;
            for b in 0..self.zone_entry_size {
                value |= (buffer[lo + b] as u32) << (8 * b);
            }
            self.zone_entries[base + i] = value;
        }

        self.zone_section_loaded[section] = true;
        Ok(())
    }

    fn write_zone_section<N: NandDriver>(&mut self, nand: &mut N, section: usize) -> Result<()> {
        // First write ever: the zone map needs a home block.
        if self.zone_map.block() == BLOCK_NONE {
            let mut res = Self::resources(
                nand,
                &mut self.phymap,
                &mut self.map_allocator,
                self.geometry,
            );
            let block = res.allocate_map_block()?;
            self.zone_map.set_block(block);
        }

        let per_page = self.zone_map.max_entries_per_page();
        let base = section * per_page;
        let count = (self.zone_entries.len() - base).min(per_page);

        let mut packed = vec![0u8; count * self.zone_entry_size];
        for i in 0..count {
            let value = self.zone_entries[base + i];
            for b in 0..self.zone_entry_size {
                packed[i * self.zone_entry_size + b] = (value >> (8 * b)) as u8;
            }
        }

        {
            let mut res = Self::resources(
                nand,
                &mut self.phymap,
                &mut self.map_allocator,
                self.geometry,
            );
            self.zone_map.add_section(
                &mut res,
                &packed,
                base as u32,
                count as u32,
                ConsolidateSource::Media,
            )?;
        }

        self.zone_section_dirty[section] = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_matches_entry_size() {
        let geometry = NandGeometry {
            chip_count: 1,
            dice_per_chip: 1,
            planes_per_die: 1,
            blocks_per_chip: 64,
            pages_per_block: 8,
            page_data_size: 2048,
            page_metadata_size: 64,
        };
        let mapper = Mapper::new(geometry, 1);
        assert_eq!(mapper.unallocated_sentinel(), 0x00ff_ffff);
    }
}
