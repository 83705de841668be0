//! Free-block allocation strategies.
//!
//! An allocator searches the phymap for a free block inside a configured
//! range, subject to optional chip/die/plane constraints. The linear
//! strategy keeps a rolling cursor so consecutive allocations walk the
//! range; the random strategy starts each search at a pseudo-random
//! position, giving block allocation a fixed worst-case time when the
//! range is full.

use crate::geometry::{BlockAddr, NandGeometry};
use crate::phymap::PhyMap;
use crate::taus88::Taus88;

/// Constraints on which blocks may be selected during allocation.
///
/// Each field may be `None` to be ignored. A die constraint only takes
/// effect when the chip is constrained too; dice always belong to a
/// given chip, so a die without a chip is meaningless and the range
/// clipping ignores it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationConstraints {
    pub chip: Option<u32>,
    pub die: Option<u32>,
    pub plane: Option<u32>,
}

impl AllocationConstraints {
    pub const NONE: AllocationConstraints = AllocationConstraints {
        chip: None,
        die: None,
        plane: None,
    };
}

/// Range and constraint state shared by both strategies. The range must
/// be set before the allocator is used; `end` is inclusive.
#[derive(Debug, Clone, Copy)]
struct SearchWindow {
    start: BlockAddr,
    end: BlockAddr,
    constraints: AllocationConstraints,
}

impl SearchWindow {
    fn new() -> Self {
        SearchWindow {
            start: 0,
            end: 0,
            constraints: AllocationConstraints::NONE,
        }
    }

    /// The configured range clipped to the chip and die constraints.
    /// Only chip and die limit the range; the plane constraint is
    /// applied bit-wise during the bitmap search. Returns `None` when
    /// the range and the constraint window do not overlap.
    fn constrained_range(&self, geometry: &NandGeometry) -> Option<(BlockAddr, BlockAddr)> {
        let chip = match self.constraints.chip {
            Some(chip) => chip,
            // Covers the die-without-chip case as well: the full range.
            None => return Some((self.start, self.end)),
        };

        let mut limit_start = geometry.chip_base_block(chip);
        let mut limit_end = limit_start + geometry.blocks_per_chip - 1;

        if let Some(die) = self.constraints.die {
            debug_assert!(die < geometry.dice_per_chip);
            limit_start += die * geometry.blocks_per_die();
            limit_end = limit_start + geometry.blocks_per_die() - 1;
        }

        if self.start > limit_end || self.end < limit_start {
            return None;
        }

        Some((self.start.max(limit_start), self.end.min(limit_end)))
    }

    /// Search from `position` to the end of the range, then wrap and
    /// search from the start up to `position`.
    fn split_search(
        &self,
        phymap: &PhyMap,
        geometry: &NandGeometry,
        start: BlockAddr,
        end: BlockAddr,
        position: BlockAddr,
    ) -> Option<BlockAddr> {
        debug_assert!(position >= start && position <= end);

        let (plane_mask, plane_number) = match self.constraints.plane {
            Some(plane) => (geometry.planes_per_die - 1, plane),
            None => (0, 0),
        };

        let found = phymap.find_first_free(position, end, plane_mask, plane_number);
        if found.is_none() && position > start {
            return phymap.find_first_free(start, position - 1, plane_mask, plane_number);
        }
        found
    }
}

/// Allocator that loops around the search range.
pub struct LinearBlockAllocator {
    window: SearchWindow,
    current_position: BlockAddr,
}

impl LinearBlockAllocator {
    pub fn new() -> Self {
        LinearBlockAllocator {
            window: SearchWindow::new(),
            current_position: 0,
        }
    }

    pub fn set_range(&mut self, start: BlockAddr, end: BlockAddr) {
        self.window.start = start;
        self.window.end = end;
    }

    pub fn set_constraints(&mut self, constraints: AllocationConstraints) {
        self.window.constraints = constraints;
    }

    pub fn clear_constraints(&mut self) {
        self.window.constraints = AllocationConstraints::NONE;
    }

    /// Set the position the next search starts from, clamped to the
    /// configured range.
    pub fn set_current_position(&mut self, position: BlockAddr) {
        self.current_position = position.clamp(self.window.start, self.window.end);
    }

    pub fn allocate(&mut self, phymap: &PhyMap, geometry: &NandGeometry) -> Option<BlockAddr> {
        let (start, end) = self.window.constrained_range(geometry)?;

        if self.current_position < start || self.current_position > end {
            self.current_position = start;
        }

        let found = self
            .window
            .split_search(phymap, geometry, start, end, self.current_position)?;

        // Start the next search where this one left off.
        self.current_position = if found >= end { start } else { found };
        Some(found)
    }
}

/// Allocator that starts from a random location each time.
pub struct RandomBlockAllocator {
    window: SearchWindow,
    rng: Taus88,
}

impl RandomBlockAllocator {
    /// The seed should come from hardware entropy mixed with a running
    /// counter so every instance scatters differently.
    pub fn new(seed: u32) -> Self {
        RandomBlockAllocator {
            window: SearchWindow::new(),
            rng: Taus88::new(seed),
        }
    }

    pub fn set_range(&mut self, start: BlockAddr, end: BlockAddr) {
        self.window.start = start;
        self.window.end = end;
    }

    pub fn set_constraints(&mut self, constraints: AllocationConstraints) {
        self.window.constraints = constraints;
    }

    pub fn clear_constraints(&mut self) {
        self.window.constraints = AllocationConstraints::NONE;
    }

    pub fn allocate(&mut self, phymap: &PhyMap, geometry: &NandGeometry) -> Option<BlockAddr> {
        let (start, end) = self.window.constrained_range(geometry)?;
        let range_size = end - start + 1;
        let position = start + self.rng.next_bounded(range_size);
        self.window
            .split_search(phymap, geometry, start, end, position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geo() -> NandGeometry {
        NandGeometry {
            chip_count: 2,
            dice_per_chip: 2,
            planes_per_die: 2,
            blocks_per_chip: 64,
            pages_per_block: 8,
            page_data_size: 2048,
            page_metadata_size: 64,
        }
    }

    fn map_with_free(free: &[BlockAddr]) -> PhyMap {
        let mut map = PhyMap::new(128);
        for &b in free {
            map.mark_block_free(b);
        }
        map
    }

    #[test]
    fn linear_advances_cursor() {
        let g = geo();
        let map = map_with_free(&[3, 7, 9]);
        let mut alloc = LinearBlockAllocator::new();
        alloc.set_range(0, 127);
        assert_eq!(alloc.allocate(&map, &g), Some(3));
        // The cursor sits on the last result, and that block is still
        // free in this test, so it is found again until marked used.
        assert_eq!(alloc.allocate(&map, &g), Some(3));
    }

    #[test]
    fn linear_walks_as_blocks_fill() {
        let g = geo();
        let mut map = map_with_free(&[3, 7, 9]);
        let mut alloc = LinearBlockAllocator::new();
        alloc.set_range(0, 127);
        for expected in [3, 7, 9] {
            let got = alloc.allocate(&map, &g).unwrap();
            assert_eq!(got, expected);
            map.mark_block_used(got);
        }
        assert_eq!(alloc.allocate(&map, &g), None);
    }

    #[test]
    fn linear_wraps_around() {
        let g = geo();
        let map = map_with_free(&[2]);
        let mut alloc = LinearBlockAllocator::new();
        alloc.set_range(0, 127);
        alloc.set_current_position(50);
        assert_eq!(alloc.allocate(&map, &g), Some(2));
    }

    #[test]
    fn chip_constraint_clips_range() {
        let g = geo();
        let map = map_with_free(&[10, 70]);
        let mut alloc = LinearBlockAllocator::new();
        alloc.set_range(0, 127);
        alloc.set_constraints(AllocationConstraints {
            chip: Some(1),
            die: None,
            plane: None,
        });
        assert_eq!(alloc.allocate(&map, &g), Some(70));
    }

    #[test]
    fn die_constraint_needs_chip() {
        let g = geo();
        let map = map_with_free(&[10]);
        let mut alloc = LinearBlockAllocator::new();
        alloc.set_range(0, 127);
        // A die without a chip is ignored and the full range is used.
        alloc.set_constraints(AllocationConstraints {
            chip: None,
            die: Some(1),
            plane: None,
        });
        assert_eq!(alloc.allocate(&map, &g), Some(10));
    }

    #[test]
    fn die_constraint_clips_to_die() {
        let g = geo();
        // Chip 1 die 1 covers blocks 96..=127.
        let map = map_with_free(&[70, 100]);
        let mut alloc = LinearBlockAllocator::new();
        alloc.set_range(0, 127);
        alloc.set_constraints(AllocationConstraints {
            chip: Some(1),
            die: Some(1),
            plane: None,
        });
        assert_eq!(alloc.allocate(&map, &g), Some(100));
    }

    #[test]
    fn plane_constraint_filters_blocks() {
        let g = geo();
        let map = map_with_free(&[4, 5]);
        let mut alloc = LinearBlockAllocator::new();
        alloc.set_range(0, 127);
        alloc.set_constraints(AllocationConstraints {
            chip: None,
            die: None,
            plane: Some(1),
        });
        assert_eq!(alloc.allocate(&map, &g), Some(5));
    }

    #[test]
    fn disjoint_constraint_window_is_empty() {
        let g = geo();
        let map = map_with_free(&[70]);
        let mut alloc = LinearBlockAllocator::new();
        alloc.set_range(0, 63); // chip 0 only
        alloc.set_constraints(AllocationConstraints {
            chip: Some(1),
            die: None,
            plane: None,
        });
        assert_eq!(alloc.allocate(&map, &g), None);
    }

    #[test]
    fn random_respects_constraints() {
        let g = geo();
        let map = map_with_free(&[8, 9, 72, 73]);
        let mut alloc = RandomBlockAllocator::new(0x1234);
        alloc.set_range(0, 127);
        alloc.set_constraints(AllocationConstraints {
            chip: Some(1),
            die: None,
            plane: Some(0),
        });
        for _ in 0..16 {
            assert_eq!(alloc.allocate(&map, &g), Some(72));
        }
    }

    #[test]
    fn random_full_map_fails() {
        let g = geo();
        let map = PhyMap::new(128);
        let mut alloc = RandomBlockAllocator::new(99);
        alloc.set_range(0, 127);
        assert_eq!(alloc.allocate(&map, &g), None);
    }
}
