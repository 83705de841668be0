//! Maps stored on the NAND in a log-structured block.
//!
//! A persistent map is an array of fixed-size entries broken into
//! sections, each section sized to fit one NAND page behind a small
//! header. Sections are written sequentially to pages within a single
//! erase block: when a newer version of a section becomes available it is
//! appended to the next free page, so the block can hold the sections in
//! any order with any number of stale copies. The effective value of a
//! section is always its highest-offset copy. Only when the block runs
//! out of pages is the whole map rewritten (consolidated) into a freshly
//! allocated block.
//!
//! The content of the sections is not interpreted here; the zone map and
//! the persistent phymap layer their own meaning on top.

use crate::allocator::LinearBlockAllocator;
use crate::bytes::{r32_le, w32_le};
use crate::geometry::{BlockAddr, NandGeometry};
use crate::metadata::{Metadata, METADATA_SIZE};
use crate::nand::NandDriver;
use crate::phymap::PhyMap;
use crate::{NandError, Result, BLOCK_NONE};

/// Header signature shared by all map types.
pub const MAP_HEADER_SIGNATURE: u32 = u32::from_be_bytes(*b"xmap");

/// Section header map-type code for the zone map.
pub const ZONE_MAP_TYPE: u32 = u32::from_be_bytes(*b"zone");

/// Section header map-type code for the phy map.
pub const PHYS_MAP_TYPE: u32 = u32::from_be_bytes(*b"phys");

/// Metadata signature tag on zone map pages.
pub const ZONE_MAP_METADATA_TAG: u32 = u32::from_be_bytes(*b"LBAM");

/// Metadata signature tag on phy map pages.
pub const PHYS_MAP_METADATA_TAG: u32 = u32::from_be_bytes(*b"EXMA");

/// Current version of the section header. Low byte is the minor version.
pub const MAP_SECTION_HEADER_VERSION: u32 = 0x0200;

/// Size of the on-media section header in bytes.
pub const MAP_SECTION_HEADER_SIZE: usize = 24;

/// Header at the front of every map section page. All fields are
/// little-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader {
    pub signature: u32,
    pub map_type: u32,
    pub version: u32,
    pub entry_size: u32,
    pub entry_count: u32,
    pub start_lba: u32,
}

impl SectionHeader {
    pub fn parse(data: &[u8]) -> Self {
        SectionHeader {
            signature: r32_le(&data[0..]),
            map_type: r32_le(&data[4..]),
            version: r32_le(&data[8..]),
            entry_size: r32_le(&data[12..]),
            entry_count: r32_le(&data[16..]),
            start_lba: r32_le(&data[20..]),
        }
    }

    pub fn write(&self, data: &mut [u8]) {
        w32_le(&mut data[0..], self.signature);
        w32_le(&mut data[4..], self.map_type);
        w32_le(&mut data[8..], self.version);
        w32_le(&mut data[12..], self.entry_size);
        w32_le(&mut data[16..], self.entry_count);
        w32_le(&mut data[20..], self.start_lba);
    }

    pub fn is_valid_for(&self, map_type: u32, entry_size: u32) -> bool {
        self.signature == MAP_HEADER_SIGNATURE
            && self.map_type == map_type
            && self.version == MAP_SECTION_HEADER_VERSION
            && self.entry_size == entry_size
    }
}

/// Borrowed resources a persistent map needs to touch the media: the
/// driver, the occupancy bitmap, and the allocator scoped to the block
/// range reserved for maps. The mapper assembles one of these from its
/// own fields for the duration of a call, which is what lets the map
/// reach back without a stored parent reference.
pub struct MapResources<'a, N: NandDriver> {
    pub nand: &'a mut N,
    pub phymap: &'a mut PhyMap,
    pub map_allocator: &'a mut LinearBlockAllocator,
    pub geometry: NandGeometry,
}

impl<'a, N: NandDriver> MapResources<'a, N> {
    /// Take a free block from the reserved map range and mark it used.
    pub fn allocate_map_block(&mut self) -> Result<BlockAddr> {
        let block = self
            .map_allocator
            .allocate(self.phymap, &self.geometry)
            .ok_or(NandError::MapperPhyMapFull)?;
        self.phymap.mark_block_used(block);
        Ok(block)
    }
}

/// Where consolidation gets the authoritative section data from.
#[derive(Clone, Copy)]
pub enum ConsolidateSource<'a> {
    /// Re-read each section from the map's current block.
    Media,
    /// Slice the section out of this RAM image of the whole entry
    /// array. Used by the persistent phymap, whose RAM copy is
    /// authoritative except while it is being loaded.
    Ram(&'a [u8]),
}

pub struct PersistentMap {
    map_type: u32,
    metadata_signature: u32,
    entry_size: usize,
    total_entry_count: usize,
    max_entries_per_page: usize,
    total_section_count: usize,
    block: BlockAddr,
    top_page_index: u32,
    section_offsets: Vec<Option<u32>>,
    did_consolidate_during_add: bool,
}

impl PersistentMap {
    pub fn new(map_type: u32, metadata_signature: u32) -> Self {
        PersistentMap {
            map_type,
            metadata_signature,
            entry_size: 0,
            total_entry_count: 0,
            max_entries_per_page: 0,
            total_section_count: 0,
            block: BLOCK_NONE,
            top_page_index: 0,
            section_offsets: Vec::new(),
            did_consolidate_during_add: false,
        }
    }

    pub fn init(&mut self, geometry: &NandGeometry, entry_size: usize, entry_count: usize) {
        self.entry_size = entry_size;
        self.total_entry_count = entry_count;
        self.max_entries_per_page =
            (geometry.page_data_size - MAP_SECTION_HEADER_SIZE) / entry_size;
        self.total_section_count =
            (entry_count + self.max_entries_per_page - 1) / self.max_entries_per_page;
        self.section_offsets = vec![None; self.total_section_count];
        self.top_page_index = 0;
    }

    pub fn block(&self) -> BlockAddr {
        self.block
    }

    pub fn set_block(&mut self, block: BlockAddr) {
        self.block = block;
        self.top_page_index = 0;
        self.section_offsets.fill(None);
    }

    pub fn is_map_block(&self, block: BlockAddr) -> bool {
        self.block == block
    }

    pub fn metadata_signature(&self) -> u32 {
        self.metadata_signature
    }

    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    pub fn max_entries_per_page(&self) -> usize {
        self.max_entries_per_page
    }

    pub fn total_section_count(&self) -> usize {
        self.total_section_count
    }

    pub fn top_page_index(&self) -> u32 {
        self.top_page_index
    }

    pub fn section_offset(&self, section: usize) -> Option<u32> {
        self.section_offsets[section]
    }

    pub fn take_did_consolidate(&mut self) -> bool {
        std::mem::replace(&mut self.did_consolidate_during_add, false)
    }

    /// Scan the map's block and build the section offset table.
    ///
    /// Returns true if a page was seen whose metadata claims it belongs
    /// to this map but whose header does not parse; the caller should
    /// schedule a consolidation to rewrite the map cleanly.
    pub fn build_section_offset_table<N: NandDriver>(
        &mut self,
        res: &mut MapResources<N>,
    ) -> Result<bool> {
        self.section_offsets.fill(None);
        self.top_page_index = self.find_top_page_index(res)?;
        let needs_rewrite = self.fill_unknown_section_offsets(res)?;

        if self.section_offsets.iter().any(|o| o.is_none()) {
            log::warn!(
                "map {:08x}: block {} is missing sections",
                self.map_type,
                self.block
            );
            return Err(NandError::CorruptMap);
        }

        Ok(needs_rewrite)
    }

    // Binary search for the first erased page, which is the number of
    // pages already written. A page is "used" when its metadata is
    // programmed; erased metadata is all 0xff.
    fn find_top_page_index<N: NandDriver>(&mut self, res: &mut MapResources<N>) -> Result<u32> {
        let first_page = res.geometry.block_to_page(self.block);
        let mut low = 0u32;
        let mut high = res.geometry.pages_per_block;
        let mut meta = vec![0u8; res.geometry.page_metadata_size];

        while low < high {
            let mid = (low + high) / 2;
            match res.nand.read_metadata(first_page + mid, &mut meta) {
                Ok(()) | Err(NandError::EccFixed) | Err(NandError::EccFixedShouldRewrite) => {}
                Err(NandError::EccUncorrectable) => {
                    // Unreadable metadata still means the page was
                    // programmed at some point.
                    low = mid + 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
            if Metadata::from_bytes(&meta).is_erased() {
                high = mid;
            } else {
                low = mid + 1;
            }
        }

        Ok(low)
    }

    // Walk backward from the top filling in the most recent copy of
    // each section. Sections already filled by a newer page are skipped.
    fn fill_unknown_section_offsets<N: NandDriver>(
        &mut self,
        res: &mut MapResources<N>,
    ) -> Result<bool> {
        let first_page = res.geometry.block_to_page(self.block);
        let mut data = vec![0u8; res.geometry.page_data_size];
        let mut meta = vec![0u8; res.geometry.page_metadata_size];
        let mut needs_rewrite = false;

        for page_index in (0..self.top_page_index).rev() {
            match res.nand.read_page(first_page + page_index, &mut data, &mut meta) {
                Ok(()) | Err(NandError::EccFixed) => {}
                Err(NandError::EccFixedShouldRewrite) => {
                    needs_rewrite = true;
                }
                Err(NandError::EccUncorrectable) => {
                    needs_rewrite = true;
                    continue;
                }
                Err(e) => return Err(e),
            }

            let header = SectionHeader::parse(&data);
            if !header.is_valid_for(self.map_type, self.entry_size as u32) {
                // The metadata says this is one of our pages but the
                // header disagrees; rewrite the map once it's loaded.
                if Metadata::from_bytes(&meta).signature() == self.metadata_signature {
                    needs_rewrite = true;
                }
                continue;
            }

            let section = (header.start_lba as usize) / self.max_entries_per_page;
            if section < self.total_section_count && self.section_offsets[section].is_none() {
                self.section_offsets[section] = Some(page_index);
            }
        }

        Ok(needs_rewrite)
    }

    /// Write an updated section of the map.
    ///
    /// `entries` holds at least `min(remaining, entries-per-page)`
    /// packed entries starting at entry number `start_entry`, which must
    /// be section aligned. When the map block is full this consolidates
    /// into a new block, folding the new section data in.
    pub fn add_section<N: NandDriver>(
        &mut self,
        res: &mut MapResources<N>,
        entries: &[u8],
        start_entry: u32,
        remaining: u32,
        source: ConsolidateSource<'_>,
    ) -> Result<()> {
        debug_assert!(start_entry as usize % self.max_entries_per_page == 0);
        let count = (remaining as usize).min(self.max_entries_per_page) as u32;
        let section = start_entry as usize / self.max_entries_per_page;

        if self.top_page_index >= res.geometry.pages_per_block {
            // No room left; rebuild the map in a new block with this
            // section's fresh data taking priority.
            self.consolidate(res, source, Some((section, entries, count)))?;
            self.did_consolidate_during_add = true;
            return Ok(());
        }

        match self.write_section_page(res, self.block, self.top_page_index, start_entry, count, entries)
        {
            Ok(()) => {
                self.section_offsets[section] = Some(self.top_page_index);
                self.top_page_index += 1;
                Ok(())
            }
            Err(NandError::HalWriteFailed) => {
                // The map block just went bad mid-append. Relocating the
                // map also evicts the bad block; the stale copies on it
                // are still readable for the other sections.
                log::warn!(
                    "map {:08x}: write failed on block {}, consolidating",
                    self.map_type,
                    self.block
                );
                self.consolidate(res, source, Some((section, entries, count)))?;
                self.did_consolidate_during_add = true;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Load the section containing `entry_number` into `out`, which must
    /// hold at least entries-per-page packed entries. Returns the number
    /// of entries in the section.
    ///
    /// With `allow_consolidate`, a corrupt or rewrite-worthy section
    /// page causes the map to be consolidated (evicting the bad page)
    /// and the read retried from the new block.
    pub fn retrieve_section<N: NandDriver>(
        &mut self,
        res: &mut MapResources<N>,
        entry_number: u32,
        out: &mut [u8],
        allow_consolidate: bool,
    ) -> Result<u32> {
        let section = entry_number as usize / self.max_entries_per_page;
        if section >= self.total_section_count {
            return Err(NandError::NotFound);
        }

        let mut data = vec![0u8; res.geometry.page_data_size];
        let mut meta = vec![0u8; res.geometry.page_metadata_size];
        let mut attempts = 0;

        loop {
            let offset = self.section_offsets[section].ok_or(NandError::NotFound)?;
            let page = res.geometry.block_to_page(self.block) + offset;

            let read_result = res.nand.read_page(page, &mut data, &mut meta);
            let (usable, wants_rewrite) = match read_result {
                Ok(()) | Err(NandError::EccFixed) => (true, false),
                Err(NandError::EccFixedShouldRewrite) => (true, true),
                Err(NandError::EccUncorrectable) => (false, true),
                Err(e) => return Err(e),
            };

            let header = SectionHeader::parse(&data);
            let valid = usable
                && header.is_valid_for(self.map_type, self.entry_size as u32)
                && header.start_lba as usize / self.max_entries_per_page == section;

            if valid && !wants_rewrite {
                let bytes = header.entry_count as usize * self.entry_size;
                out[..bytes].copy_from_slice(&data[MAP_SECTION_HEADER_SIZE..MAP_SECTION_HEADER_SIZE + bytes]);
                return Ok(header.entry_count);
            }

            if valid && wants_rewrite && !allow_consolidate {
                // Data is good; the advice can't be acted on here.
                let bytes = header.entry_count as usize * self.entry_size;
                out[..bytes].copy_from_slice(&data[MAP_SECTION_HEADER_SIZE..MAP_SECTION_HEADER_SIZE + bytes]);
                return Ok(header.entry_count);
            }

            if !allow_consolidate || attempts >= 1 {
                return Err(NandError::CorruptMap);
            }

            log::warn!(
                "map {:08x}: section {} unreadable at page offset {}, consolidating",
                self.map_type,
                section,
                offset
            );
            self.consolidate(res, ConsolidateSource::Media, None)?;
            attempts += 1;
        }
    }

    /// Rebuild the map into a new block.
    ///
    /// Every section is written in order to a freshly allocated map
    /// block; afterward the offset table is dense and the old block is
    /// released. `carried` supplies one section's fresh data that has
    /// not made it to the media yet.
    pub fn consolidate<N: NandDriver>(
        &mut self,
        res: &mut MapResources<N>,
        source: ConsolidateSource<'_>,
        carried: Option<(usize, &[u8], u32)>,
    ) -> Result<()> {
        let old_block = self.block;
        let old_offsets = self.section_offsets.clone();
        let mut scratch = vec![0u8; res.geometry.page_data_size];
        let mut meta = vec![0u8; res.geometry.page_metadata_size];

        let mut attempts = 0;
        'rebuild: loop {
            let new_block = res.allocate_map_block()?;
            log::info!(
                "map {:08x}: consolidating block {} -> {}",
                self.map_type,
                old_block,
                new_block
            );

            for section in 0..self.total_section_count {
                let start_entry = (section * self.max_entries_per_page) as u32;
                let count = (self.total_entry_count - section * self.max_entries_per_page)
                    .min(self.max_entries_per_page) as u32;

                // Locate this section's entries.
                let entry_bytes: &[u8] = match carried {
                    Some((carried_section, data, carried_count)) if carried_section == section => {
                        debug_assert_eq!(carried_count, count);
                        data
                    }
                    _ => match source {
                        ConsolidateSource::Ram(all) => {
                            let lo = section * self.max_entries_per_page * self.entry_size;
                            &all[lo..lo + count as usize * self.entry_size]
                        }
                        ConsolidateSource::Media => {
                            let offset =
                                old_offsets[section].ok_or(NandError::CorruptMap)?;
                            let page = res.geometry.block_to_page(old_block) + offset;
                            match res.nand.read_page(page, &mut scratch, &mut meta) {
                                Ok(())
                                | Err(NandError::EccFixed)
                                | Err(NandError::EccFixedShouldRewrite) => {}
                                Err(NandError::EccUncorrectable) => {
                                    return Err(NandError::CorruptMap)
                                }
                                Err(e) => return Err(e),
                            }
                            let header = SectionHeader::parse(&scratch);
                            if !header.is_valid_for(self.map_type, self.entry_size as u32) {
                                return Err(NandError::CorruptMap);
                            }
                            &scratch[MAP_SECTION_HEADER_SIZE
                                ..MAP_SECTION_HEADER_SIZE + count as usize * self.entry_size]
                        }
                    },
                };
                // Borrowing scratch twice trips the borrow checker, so
                // copy the entries out before composing the page.
                let entry_copy = entry_bytes.to_vec();

                match self.write_section_page(
                    res,
                    new_block,
                    section as u32,
                    start_entry,
                    count,
                    &entry_copy,
                ) {
                    Ok(()) => {}
                    Err(NandError::HalWriteFailed) if attempts < 2 => {
                        // The fresh block failed to program; retire it
                        // and start over on another one.
                        log::warn!(
                            "map {:08x}: consolidate target block {} went bad",
                            self.map_type,
                            new_block
                        );
                        res.phymap.mark_block_used(new_block);
                        attempts += 1;
                        continue 'rebuild;
                    }
                    Err(e) => return Err(e),
                }
            }

            self.block = new_block;
            for section in 0..self.total_section_count {
                self.section_offsets[section] = Some(section as u32);
            }
            self.top_page_index = self.total_section_count as u32;
            break;
        }

        // Release the old block back to the free pool.
        if old_block != BLOCK_NONE {
            if let Some(bad) = res.phymap.mark_block_free_and_erase(res.nand, old_block)? {
                log::warn!("map {:08x}: old map block {} went bad on erase", self.map_type, bad);
            }
        }

        Ok(())
    }

    // Compose and program one section page: header, packed entries, and
    // the map's metadata tag.
    fn write_section_page<N: NandDriver>(
        &self,
        res: &mut MapResources<N>,
        block: BlockAddr,
        page_offset: u32,
        start_entry: u32,
        entry_count: u32,
        entries: &[u8],
    ) -> Result<()> {
        let mut data = vec![0xffu8; res.geometry.page_data_size];
        let header = SectionHeader {
            signature: MAP_HEADER_SIGNATURE,
            map_type: self.map_type,
            version: MAP_SECTION_HEADER_VERSION,
            entry_size: self.entry_size as u32,
            entry_count,
            start_lba: start_entry,
        };
        header.write(&mut data);
        let bytes = entry_count as usize * self.entry_size;
        data[MAP_SECTION_HEADER_SIZE..MAP_SECTION_HEADER_SIZE + bytes]
            .copy_from_slice(&entries[..bytes]);

        let mut meta = vec![0xffu8; res.geometry.page_metadata_size];
        meta[..METADATA_SIZE]
            .copy_from_slice(Metadata::for_signature(self.metadata_signature).bytes());

        let page = res.geometry.block_to_page(block) + page_offset;
        res.nand.write_page(page, &data, &meta)
    }
}

/// Persistent form of the phymap.
///
/// The phymap differs from the zone map in that the whole bitmap is held
/// in RAM, so saving dumps the RAM copy and consolidation can take its
/// data straight from memory. The one exception is while the map is
/// being loaded: the RAM copy is not authoritative yet, so consolidation
/// must reread from the media.
pub struct PersistentPhyMap {
    map: PersistentMap,
    is_loading: bool,
}

impl PersistentPhyMap {
    pub fn new() -> Self {
        PersistentPhyMap {
            map: PersistentMap::new(PHYS_MAP_TYPE, PHYS_MAP_METADATA_TAG),
            is_loading: false,
        }
    }

    pub fn init(&mut self, geometry: &NandGeometry) {
        let entry_count = PhyMap::entry_count_for_block_count(geometry.total_blocks()) as usize;
        self.map
            .init(geometry, crate::phymap::BLOCKS_PER_ENTRY as usize / 8, entry_count);
    }

    pub fn block(&self) -> BlockAddr {
        self.map.block()
    }

    pub fn set_block(&mut self, block: BlockAddr) {
        self.map.set_block(block);
    }

    pub fn is_map_block(&self, block: BlockAddr) -> bool {
        self.map.is_map_block(block)
    }

    /// Read the whole bitmap out of the map block into the phymap held
    /// by `res`.
    pub fn load<N: NandDriver>(
        &mut self,
        res: &mut MapResources<N>,
        block: BlockAddr,
    ) -> Result<bool> {
        self.is_loading = true;
        let result = self.load_inner(res, block);
        self.is_loading = false;
        result
    }

    fn load_inner<N: NandDriver>(
        &mut self,
        res: &mut MapResources<N>,
        block: BlockAddr,
    ) -> Result<bool> {
        log::debug!("loading phymap from block {}", block);
        self.map.set_block(block);
        let needs_rewrite = self.map.build_section_offset_table(res)?;

        let mut buffer = vec![0u8; self.map.max_entries_per_page() * self.map.entry_size()];
        let mut entry_number = 0u32;
        let total = self.map.total_entry_count as u32;

        while entry_number < total {
            let count = self.map.retrieve_section(res, entry_number, &mut buffer, true)?;
            let bytes = count as usize * self.map.entry_size();
            res.phymap
                .load_entry_bytes(entry_number as usize, &buffer[..bytes]);
            entry_number += count;
        }

        res.phymap.clear_dirty();
        Ok(needs_rewrite)
    }

    /// Append the RAM bitmap to the map block, one section per page.
    pub fn save<N: NandDriver>(&mut self, res: &mut MapResources<N>) -> Result<()> {
        debug_assert!(self.map.block() != BLOCK_NONE);

        let image = res.phymap.entry_bytes();
        let per_page = self.map.max_entries_per_page();
        let entry_size = self.map.entry_size();
        let total = self.map.total_entry_count;
        let source = if self.is_loading {
            ConsolidateSource::Media
        } else {
            ConsolidateSource::Ram(&image)
        };

        let mut entry_number = 0usize;
        while entry_number < total {
            let remaining = (total - entry_number) as u32;
            let lo = entry_number * entry_size;
            let hi = (entry_number + per_page.min(total - entry_number)) * entry_size;
            self.map
                .add_section(res, &image[lo..hi], entry_number as u32, remaining, source)?;
            entry_number += per_page;
        }

        res.phymap.clear_dirty();
        log::debug!(
            "saved phymap to block {} (top page {})",
            self.map.block(),
            self.map.top_page_index()
        );
        Ok(())
    }

    /// Save the bitmap into a newly allocated block, abandoning the old
    /// one. Used when no phymap exists on the media yet.
    pub fn save_new_copy<N: NandDriver>(&mut self, res: &mut MapResources<N>) -> Result<()> {
        let block = res.allocate_map_block()?;
        self.map.set_block(block);
        self.save(res)
    }
}
