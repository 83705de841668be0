// Simulated NAND array backing the integration tests.
//
// The simulator keeps the full data and metadata image in memory and
// models the failure modes the core has to survive: factory bad blocks,
// blocks that fail on program/erase, "timebomb" blocks that fail after a
// set number of operations, and injected per-page read errors for
// exercising the ECC and recovery paths. State lives behind an Arc so a
// test can keep a handle for fault injection while the media owns the
// driver, and so a "power cycle" can hand the same image to a fresh
// media instance.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use nandmap_rs::geometry::{BlockAddr, NandGeometry, PageAddr};
use nandmap_rs::nand::{MultiplaneEraseBlock, NandDriver, PersistentBit, PersistentBits};
use nandmap_rs::{NandError, Result};

use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};

const BLOCK_BAD_MARK: u8 = 0x01;
const BLOCK_FAILED: u8 = 0x02;

// Call counts, for asserting which paths ran.
#[derive(Default, Clone)]
pub struct SimStats {
    pub reads: usize,
    pub metadata_reads: usize,
    pub progs: usize,
    pub prog_fails: usize,
    pub firmware_progs: usize,
    pub erases: usize,
    pub erase_fails: usize,
    pub multiplane_erases: usize,
}

#[derive(Clone, Copy)]
struct BlockStatus {
    flags: u8,
    // Index of the next unprogrammed page. 0 is a fully erased block.
    next_page: u32,
    // Operations until permanent failure; 0 means no bomb.
    timebomb: u32,
}

struct SimState {
    geometry: NandGeometry,
    data: Vec<u8>,
    meta: Vec<u8>,
    blocks: Vec<BlockStatus>,
    // Sticky injected read results per page, cleared by erasing the
    // containing block.
    read_errors: HashMap<PageAddr, NandError>,
    stats: SimStats,
    entropy: u32,
    die_interleaving: bool,
}

#[derive(Clone)]
pub struct SimNand {
    state: Arc<Mutex<SimState>>,
}

impl SimNand {
    pub fn new(geometry: NandGeometry) -> Self {
        let total_pages = geometry.total_pages() as usize;
        let state = SimState {
            geometry,
            data: vec![0xff; total_pages * geometry.page_data_size],
            meta: vec![0xff; total_pages * geometry.page_metadata_size],
            blocks: vec![
                BlockStatus {
                    flags: 0,
                    next_page: 0,
                    timebomb: 0,
                };
                geometry.total_blocks() as usize
            ],
            read_errors: HashMap::new(),
            stats: SimStats::default(),
            entropy: 0x5eed_1234,
            die_interleaving: false,
        };
        SimNand {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// A second driver handle over the same simulated array. Used to
    /// model a power cycle: the old media is dropped, a new one mounts
    /// this handle, and only what was programmed survives.
    pub fn another_handle(&self) -> SimNand {
        SimNand {
            state: self.state.clone(),
        }
    }

    pub fn stats(&self) -> SimStats {
        self.state.lock().unwrap().stats.clone()
    }

    pub fn reset_stats(&self) {
        self.state.lock().unwrap().stats = SimStats::default();
    }

    pub fn set_factory_bad(&self, block: BlockAddr) {
        self.state.lock().unwrap().blocks[block as usize].flags |= BLOCK_BAD_MARK;
    }

    /// Make every program and erase of this block fail from now on.
    pub fn set_failed(&self, block: BlockAddr) {
        self.state.lock().unwrap().blocks[block as usize].flags |= BLOCK_FAILED;
    }

    pub fn clear_failed(&self, block: BlockAddr) {
        self.state.lock().unwrap().blocks[block as usize].flags &= !BLOCK_FAILED;
    }

    /// Fail the block permanently after `ttl` more program/erase
    /// operations.
    pub fn set_timebomb(&self, block: BlockAddr, ttl: u32) {
        self.state.lock().unwrap().blocks[block as usize].timebomb = ttl;
    }

    /// Make reads of one page report `error` until the block is erased.
    pub fn inject_read_error(&self, page: PageAddr, error: NandError) {
        self.state.lock().unwrap().read_errors.insert(page, error);
    }

    pub fn set_die_interleaving(&self, value: bool) {
        self.state.lock().unwrap().die_interleaving = value;
    }

    /// Whether a block is fully erased in the simulated image.
    pub fn block_erased(&self, block: BlockAddr) -> bool {
        self.state.lock().unwrap().blocks[block as usize].next_page == 0
    }

    pub fn page_data(&self, page: PageAddr) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        let size = state.geometry.page_data_size;
        let lo = page as usize * size;
        state.data[lo..lo + size].to_vec()
    }
}

impl SimState {
    fn page_range(&self, page: PageAddr) -> (usize, usize) {
        let size = self.geometry.page_data_size;
        let lo = page as usize * size;
        (lo, lo + size)
    }

    fn meta_range(&self, page: PageAddr) -> (usize, usize) {
        let size = self.geometry.page_metadata_size;
        let lo = page as usize * size;
        (lo, lo + size)
    }

    fn tick_timebomb(&mut self, block: usize) {
        if self.blocks[block].timebomb != 0 {
            self.blocks[block].timebomb -= 1;
            if self.blocks[block].timebomb == 0 {
                self.blocks[block].flags |= BLOCK_FAILED;
            }
        }
    }

    fn program(&mut self, page: PageAddr, data: &[u8], metadata: &[u8]) -> Result<()> {
        let block = self.geometry.page_to_block(page) as usize;
        let offset = self.geometry.page_offset(page);
        assert!(
            offset >= self.blocks[block].next_page,
            "sim: out-of-order program of block {} page {} (expected {})",
            block,
            offset,
            self.blocks[block].next_page
        );

        self.blocks[block].next_page = offset + 1;
        self.tick_timebomb(block);

        if self.blocks[block].flags & BLOCK_FAILED != 0 {
            self.stats.prog_fails += 1;
            let (lo, hi) = self.page_range(page);
            seq_gen(page as u64 * 57 + 29, &mut self.data[lo..hi]);
            return Err(NandError::HalWriteFailed);
        }

        let (lo, hi) = self.page_range(page);
        self.data[lo..hi.min(lo + data.len())].copy_from_slice(&data[..data.len().min(hi - lo)]);
        let (mlo, mhi) = self.meta_range(page);
        let count = metadata.len().min(mhi - mlo);
        self.meta[mlo..mlo + count].copy_from_slice(&metadata[..count]);
        Ok(())
    }
}

impl NandDriver for SimNand {
    fn geometry(&self) -> NandGeometry {
        self.state.lock().unwrap().geometry
    }

    fn read_page(&mut self, page: PageAddr, data: &mut [u8], metadata: &mut [u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.stats.reads += 1;

        let (lo, hi) = state.page_range(page);
        let count = data.len().min(hi - lo);
        data[..count].copy_from_slice(&state.data[lo..lo + count]);
        let (mlo, mhi) = state.meta_range(page);
        let mcount = metadata.len().min(mhi - mlo);
        metadata[..mcount].copy_from_slice(&state.meta[mlo..mlo + mcount]);

        if let Some(&error) = state.read_errors.get(&page) {
            return Err(error);
        }
        Ok(())
    }

    fn read_metadata(&mut self, page: PageAddr, metadata: &mut [u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.stats.metadata_reads += 1;

        let (mlo, mhi) = state.meta_range(page);
        let mcount = metadata.len().min(mhi - mlo);
        metadata[..mcount].copy_from_slice(&state.meta[mlo..mlo + mcount]);

        if let Some(&error) = state.read_errors.get(&page) {
            return Err(error);
        }
        Ok(())
    }

    fn write_page(&mut self, page: PageAddr, data: &[u8], metadata: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.stats.progs += 1;
        state.program(page, data, metadata)
    }

    fn write_firmware_page(&mut self, page: PageAddr, data: &[u8], metadata: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.stats.firmware_progs += 1;
        state.program(page, data, metadata)
    }

    fn erase_block(&mut self, block: BlockAddr) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.stats.erases += 1;

        let blk = block as usize;
        state.blocks[blk].next_page = 0;
        state.tick_timebomb(blk);

        let first_page = state.geometry.block_to_page(block);
        let pages = state.geometry.pages_per_block;

        if state.blocks[blk].flags & BLOCK_FAILED != 0 {
            state.stats.erase_fails += 1;
            let (lo, _) = state.page_range(first_page);
            let (_, hi) = state.page_range(first_page + pages - 1);
            seq_gen(block as u64 * 57 + 31, &mut state.data[lo..hi]);
            return Err(NandError::HalEraseFailed);
        }

        let (lo, _) = state.page_range(first_page);
        let (_, hi) = state.page_range(first_page + pages - 1);
        state.data[lo..hi].fill(0xff);
        let (mlo, _) = state.meta_range(first_page);
        let (_, mhi) = state.meta_range(first_page + pages - 1);
        state.meta[mlo..mhi].fill(0xff);

        // Erase heals injected read disturbance.
        for page in first_page..first_page + pages {
            state.read_errors.remove(&page);
        }
        Ok(())
    }

    fn erase_multiple_blocks(&mut self, blocks: &mut [MultiplaneEraseBlock]) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            state.stats.multiplane_erases += 1;
        }
        for pb in blocks.iter_mut() {
            pb.status = match self.erase_block(pb.address) {
                Ok(()) => Ok(()),
                Err(NandError::HalEraseFailed) => Err(NandError::HalWriteFailed),
                Err(e) => Err(e),
            };
        }
        Ok(())
    }

    fn is_block_factory_bad(&mut self, block: BlockAddr) -> bool {
        self.state.lock().unwrap().blocks[block as usize].flags & BLOCK_BAD_MARK != 0
    }

    fn supports_die_interleaving(&self) -> bool {
        self.state.lock().unwrap().die_interleaving
    }

    fn entropy_seed(&mut self) -> u32 {
        let mut state = self.state.lock().unwrap();
        state.entropy = state.entropy.wrapping_mul(1664525).wrapping_add(1013904223);
        state.entropy
    }
}

/// Persistent RTC-style bits shared between a test and the media.
#[derive(Clone, Default)]
pub struct SimBits {
    bits: Arc<Mutex<HashMap<u8, bool>>>,
}

impl SimBits {
    pub fn new() -> Self {
        SimBits::default()
    }

    fn key(which: PersistentBit) -> u8 {
        match which {
            PersistentBit::NandSecondaryBoot => 0,
            PersistentBit::FirmwareRecoveryInProgress => 1,
            PersistentBit::LbaNandSecondaryBoot => 2,
        }
    }

    pub fn get(&self, which: PersistentBit) -> bool {
        *self
            .bits
            .lock()
            .unwrap()
            .get(&Self::key(which))
            .unwrap_or(&false)
    }
}

impl PersistentBits for SimBits {
    fn read_bit(&mut self, which: PersistentBit) -> bool {
        self.get(which)
    }

    fn write_bit(&mut self, which: PersistentBit, value: bool) {
        self.bits.lock().unwrap().insert(Self::key(which), value);
    }
}

/// Deterministic pseudo-random page contents keyed by a seed.
pub fn seq_gen(seed: u64, buf: &mut [u8]) {
    let mut rng = SmallRng::seed_from_u64(seed);
    rng.fill_bytes(buf);
}

pub fn seq_assert(seed: u64, buf: &[u8]) {
    let mut expected = vec![0u8; buf.len()];
    seq_gen(seed, &mut expected);
    assert_eq!(buf, &expected[..], "seq_assert: mismatch in sequences");
}

/// The standard small geometry most tests run on: two chips, two
/// planes, 64 blocks total.
pub fn small_geometry() -> NandGeometry {
    NandGeometry {
        chip_count: 2,
        dice_per_chip: 1,
        planes_per_die: 2,
        blocks_per_chip: 32,
        pages_per_block: 8,
        page_data_size: 2048,
        page_metadata_size: 64,
    }
}
