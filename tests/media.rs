// End-to-end tests of the media and drive surface over the simulated
// NAND: fresh format and remount, bad blocks discovered during writes,
// rewrites of live sectors, and erase behavior.

mod sim;

use nandmap_rs::geometry::NandGeometry;
use nandmap_rs::media::{DriveSpec, DriveTag, Media, MEDIA_ERASE_MAGIC};
use nandmap_rs::NandError;
use sim::{seq_assert, seq_gen, small_geometry, SimBits, SimNand};

fn data_only_table() -> Vec<DriveSpec> {
    vec![DriveSpec {
        tag: DriveTag::Data,
        block_count: 0,
        is_write_protected: false,
    }]
}

fn bring_up(nand: &SimNand, table: &[DriveSpec]) -> Media<SimNand, SimBits> {
    let media = Media::media_init(nand.another_handle(), SimBits::new());
    media.media_allocate(table).expect("allocate");
    for spec in table {
        media.drive_init(spec.tag).expect("drive_init");
    }
    media
}

#[test]
fn fresh_format_write_read_power_cycle() {
    // Four planes, two chips, 128 pages per block.
    let geometry = NandGeometry {
        chip_count: 2,
        dice_per_chip: 1,
        planes_per_die: 4,
        blocks_per_chip: 32,
        pages_per_block: 128,
        page_data_size: 2048,
        page_metadata_size: 64,
    };
    let nand = SimNand::new(geometry);
    let table = data_only_table();

    let media = bring_up(&nand, &table);
    let total_blocks = geometry.total_blocks();
    assert!(media.free_block_count() < total_blocks);

    let mut pattern = vec![0xAAu8; geometry.page_data_size];
    media
        .drive_write_sector(DriveTag::Data, 0, &pattern)
        .expect("write");
    media.drain_background_work();
    media.media_shutdown().expect("shutdown");

    // Power cycle: all RAM state is gone, only the NAND image remains.
    let media = Media::media_init(nand.another_handle(), SimBits::new());
    media
        .media_discover_allocation(&table)
        .expect("discover");
    media.drive_init(DriveTag::Data).expect("drive_init");

    pattern.fill(0);
    media
        .drive_read_sector(DriveTag::Data, 0, &mut pattern)
        .expect("read");
    assert!(pattern.iter().all(|&b| b == 0xAA));

    // At least one data block plus the two map blocks are in use.
    assert!(media.free_block_count() <= total_blocks - 3);

    // Virtual block 0 of the data region has a physical binding.
    let key = media.region_start_block(DriveTag::Data).unwrap();
    let mapped = media.physical_block_for_key(key).expect("lookup");
    assert!(mapped.is_some());
    media.media_shutdown().expect("shutdown 2");
}

#[test]
fn discover_without_format_reports_unallocated() {
    let nand = SimNand::new(small_geometry());
    let media = Media::media_init(nand.another_handle(), SimBits::new());
    assert_eq!(
        media.media_discover_allocation(&data_only_table()),
        Err(NandError::MediaNotAllocated)
    );
    media.media_shutdown().expect("shutdown");
}

#[test]
fn write_failure_retires_block_and_retries() {
    let geometry = small_geometry();
    let table = data_only_table();
    let vpb = geometry.virtual_pages_per_block();

    // Dry run to learn which block the allocator hands virtual block 5.
    // The allocator seeding is deterministic for a fresh simulator, so
    // an identical run makes the same choice.
    let lba = 5 * vpb;
    let (key, first_choice) = {
        let nand = SimNand::new(geometry);
        let media = bring_up(&nand, &table);
        let pattern = vec![0x5au8; geometry.page_data_size];
        media.drive_write_sector(DriveTag::Data, lba, &pattern).unwrap();
        let key =
            media.region_start_block(DriveTag::Data).unwrap() + 5 * geometry.planes_per_die;
        (key, media.physical_block_for_key(key).unwrap().unwrap())
    };

    // Real run: the allocator's first choice fails to program.
    let nand = SimNand::new(geometry);
    let media = bring_up(&nand, &table);
    nand.set_failed(first_choice);

    let mut pattern = vec![0u8; geometry.page_data_size];
    seq_gen(42, &mut pattern);
    media
        .drive_write_sector(DriveTag::Data, lba, &pattern)
        .expect("write should relocate and succeed");

    // The dead block is recorded and a different block carries the
    // data now.
    assert!(media.region_bad_blocks(DriveTag::Data).contains(&first_choice));
    let remapped = media.physical_block_for_key(key).unwrap().unwrap();
    assert_ne!(remapped, first_choice);

    let mut read_back = vec![0u8; geometry.page_data_size];
    media
        .drive_read_sector(DriveTag::Data, lba, &mut read_back)
        .expect("read");
    seq_assert(42, &read_back);
    media.media_shutdown().expect("shutdown");
}

#[test]
fn rewriting_a_sector_keeps_its_neighbors() {
    let geometry = small_geometry();
    let nand = SimNand::new(geometry);
    let media = bring_up(&nand, &data_only_table());

    let mut a = vec![0u8; geometry.page_data_size];
    let mut b = vec![0u8; geometry.page_data_size];
    seq_gen(1, &mut a);
    seq_gen(2, &mut b);
    media.drive_write_sector(DriveTag::Data, 0, &a).unwrap();
    media.drive_write_sector(DriveTag::Data, 1, &b).unwrap();

    // Overwrite sector 0; sector 1 must survive the relocation.
    seq_gen(3, &mut a);
    media.drive_write_sector(DriveTag::Data, 0, &a).unwrap();

    let mut read_back = vec![0u8; geometry.page_data_size];
    media.drive_read_sector(DriveTag::Data, 0, &mut read_back).unwrap();
    seq_assert(3, &read_back);
    media.drive_read_sector(DriveTag::Data, 1, &mut read_back).unwrap();
    seq_assert(2, &read_back);
    media.media_shutdown().expect("shutdown");
}

#[test]
fn unwritten_sectors_read_erased() {
    let geometry = small_geometry();
    let nand = SimNand::new(geometry);
    let media = bring_up(&nand, &data_only_table());

    let mut buffer = vec![0u8; geometry.page_data_size];
    media.drive_read_sector(DriveTag::Data, 7, &mut buffer).unwrap();
    assert!(buffer.iter().all(|&b| b == 0xff));
    media.media_shutdown().expect("shutdown");
}

#[test]
fn out_of_range_lba_is_rejected() {
    let geometry = small_geometry();
    let nand = SimNand::new(geometry);
    let media = bring_up(&nand, &data_only_table());

    let sector_count = media
        .drive_get_info(
            DriveTag::Data,
            nandmap_rs::media::DriveInfoSelector::SectorCount,
        )
        .unwrap() as u32;
    let mut buffer = vec![0u8; geometry.page_data_size];
    assert_eq!(
        media.drive_read_sector(DriveTag::Data, sector_count, &mut buffer),
        Err(NandError::AddressOutOfRange)
    );
    media.media_shutdown().expect("shutdown");
}

#[test]
fn media_erase_requires_the_magic() {
    let geometry = small_geometry();
    let nand = SimNand::new(geometry);
    let media = bring_up(&nand, &data_only_table());

    assert_eq!(
        media.media_erase(0xdeadbeef, false),
        Err(NandError::WriteProtected)
    );

    let pattern = vec![0x11u8; geometry.page_data_size];
    media.drive_write_sector(DriveTag::Data, 3, &pattern).unwrap();
    media.media_erase(MEDIA_ERASE_MAGIC, false).expect("erase");

    let mut buffer = vec![0u8; geometry.page_data_size];
    media.drive_read_sector(DriveTag::Data, 3, &mut buffer).unwrap();
    assert!(buffer.iter().all(|&b| b == 0xff));
    media.media_shutdown().expect("shutdown");
}

#[test]
fn media_erase_can_preserve_the_hidden_drive() {
    let geometry = small_geometry();
    let nand = SimNand::new(geometry);
    let table = vec![
        DriveSpec {
            tag: DriveTag::Hidden,
            block_count: 4,
            is_write_protected: false,
        },
        DriveSpec {
            tag: DriveTag::Data,
            block_count: 0,
            is_write_protected: false,
        },
    ];
    let media = bring_up(&nand, &table);

    let mut hidden = vec![0u8; geometry.page_data_size];
    let mut data = vec![0u8; geometry.page_data_size];
    seq_gen(7, &mut hidden);
    seq_gen(8, &mut data);
    media.drive_write_sector(DriveTag::Hidden, 0, &hidden).unwrap();
    media.drive_write_sector(DriveTag::Data, 0, &data).unwrap();

    // The hidden drive has its own region ahead of the data drive and
    // its blocks are bound inside it.
    let hidden_start = media.region_start_block(DriveTag::Hidden).unwrap();
    let data_start = media.region_start_block(DriveTag::Data).unwrap();
    assert!(hidden_start < data_start);
    let hidden_block = media
        .physical_block_for_key(hidden_start)
        .unwrap()
        .unwrap();
    assert!(hidden_block < data_start);

    // A preserving erase wipes the data drive but leaves the hidden
    // content alone.
    media.media_erase(MEDIA_ERASE_MAGIC, true).expect("erase");
    let mut read_back = vec![0u8; geometry.page_data_size];
    media.drive_read_sector(DriveTag::Data, 0, &mut read_back).unwrap();
    assert!(read_back.iter().all(|&b| b == 0xff));
    media.drive_read_sector(DriveTag::Hidden, 0, &mut read_back).unwrap();
    seq_assert(7, &read_back);

    // A full erase takes the hidden drive with it.
    media.media_erase(MEDIA_ERASE_MAGIC, false).expect("full erase");
    media.drive_read_sector(DriveTag::Hidden, 0, &mut read_back).unwrap();
    assert!(read_back.iter().all(|&b| b == 0xff));
    media.media_shutdown().expect("shutdown");
}

#[test]
fn factory_bad_blocks_are_never_allocated() {
    let geometry = small_geometry();
    let nand = SimNand::new(geometry);
    // Poison a handful of blocks in what will be the data range.
    for block in [3, 9, 20] {
        nand.set_factory_bad(block);
        nand.set_failed(block);
    }

    let media = bring_up(&nand, &data_only_table());
    let bad = media.region_bad_blocks(DriveTag::Data);
    for block in [3, 9, 20] {
        assert!(bad.contains(&block));
    }

    // Fill a good chunk of the drive; nothing may land on the bad
    // blocks (their program would fail the writes).
    let pattern = vec![0x77u8; geometry.page_data_size];
    for lba in 0..64 {
        media.drive_write_sector(DriveTag::Data, lba, &pattern).unwrap();
    }
    for block in [3u32, 9, 20] {
        assert!(nand.block_erased(block) || nand.page_data(geometry.block_to_page(block))[0] != 0x77);
    }
    media.media_shutdown().expect("shutdown");
}

#[test]
fn hot_data_page_is_refreshed_in_the_background() {
    let geometry = small_geometry();
    let nand = SimNand::new(geometry);
    let media = bring_up(&nand, &data_only_table());

    let mut pattern = vec![0u8; geometry.page_data_size];
    for lba in 0..4 {
        seq_gen(100 + lba as u64, &mut pattern);
        media.drive_write_sector(DriveTag::Data, lba, &pattern).unwrap();
    }

    // The read succeeds but advises a rewrite; the worker relocates
    // the whole virtual block.
    let key = media.region_start_block(DriveTag::Data).unwrap();
    let old_block = media.physical_block_for_key(key).unwrap().unwrap();
    let hot_page = geometry.block_to_page(old_block);
    nand.inject_read_error(hot_page, NandError::EccFixedShouldRewrite);

    let mut read_back = vec![0u8; geometry.page_data_size];
    media.drive_read_sector(DriveTag::Data, 0, &mut read_back).unwrap();
    seq_assert(100, &read_back);
    media.drain_background_work();

    // Every sector survived the move and the disturbance is gone (the
    // old block was erased on its way back to the free pool).
    for lba in 0..4 {
        media.drive_read_sector(DriveTag::Data, lba, &mut read_back).unwrap();
        seq_assert(100 + lba as u64, &read_back);
    }
    media.media_shutdown().expect("shutdown");
}

#[test]
fn drive_info_reports_geometry() {
    use nandmap_rs::media::DriveInfoSelector::*;

    let geometry = small_geometry();
    let nand = SimNand::new(geometry);
    let media = bring_up(&nand, &data_only_table());

    let sector_size = media.drive_get_info(DriveTag::Data, SectorSize).unwrap();
    assert_eq!(sector_size, geometry.page_data_size as u64);
    let count = media.drive_get_info(DriveTag::Data, SectorCount).unwrap();
    let bytes = media.drive_get_info(DriveTag::Data, SizeBytes).unwrap();
    assert_eq!(bytes, count * sector_size);
    assert_eq!(media.drive_get_info(DriveTag::Data, IsSystem).unwrap(), 0);

    media
        .drive_set_info(DriveTag::Data, ComponentVersion, 0x0102)
        .unwrap();
    assert_eq!(
        media.drive_get_info(DriveTag::Data, ComponentVersion).unwrap(),
        0x0102
    );
    assert_eq!(
        media.drive_set_info(DriveTag::Data, SectorCount, 1),
        Err(NandError::InvalidInfoSelector)
    );
    media.media_shutdown().expect("shutdown");
}
