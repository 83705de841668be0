//! Read-disturbance recovery for system drives.
//!
//! The firmware lives on the media in triplicate: primary, secondary,
//! and a master copy written at manufacturing. Reads normally come from
//! the primary. When a read fails uncorrectably, the failing drive is
//! taken out of rotation, reads are redirected to its backup, and a
//! background task rewrites the whole drive from the backup. Persistent
//! bits record the recovery so an unexpected reset can resume it, and
//! steer the boot ROM at the secondary copy while the primary is
//! incomplete.
//!
//! A milder form handles pages that were corrected but are running hot:
//! a single-block refresh task rereads the block's sectors from the
//! backup and rewrites the block in place.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::media::{DriveTag, MediaCore};
use crate::metadata::{Metadata, METADATA_SIZE, STMP_TAG};
use crate::nand::{self, NandDriver, PersistentBit, PersistentBits};
use crate::tasks::Task;
use crate::{NandError, Result};

/// Tracks which firmware copy reads are currently served from and the
/// recovery bookkeeping around it.
pub struct RecoveryManager {
    registered: Vec<DriveTag>,
    current_drive: DriveTag,
    is_recovery_active: bool,
    refresh_counts: [u32; 2],
    last_elapsed_micros: u64,
}

impl RecoveryManager {
    pub fn new() -> Self {
        RecoveryManager {
            registered: Vec::new(),
            current_drive: DriveTag::PrimaryFirmware,
            is_recovery_active: false,
            refresh_counts: [0, 0],
            last_elapsed_micros: 0,
        }
    }

    pub fn register_drive(&mut self, tag: DriveTag) {
        if !self.registered.contains(&tag) {
            self.registered.push(tag);
        }
        if tag == DriveTag::PrimaryFirmware {
            self.current_drive = tag;
        }
    }

    /// Recovery needs all three copies present.
    pub fn is_available(&self) -> bool {
        self.registered.contains(&DriveTag::PrimaryFirmware)
            && self.registered.contains(&DriveTag::SecondaryFirmware)
            && self.registered.contains(&DriveTag::MasterFirmware)
    }

    pub fn current_drive(&self) -> DriveTag {
        self.current_drive
    }

    pub fn set_current_drive(&mut self, tag: DriveTag) {
        self.current_drive = tag;
    }

    pub fn is_active(&self) -> bool {
        self.is_recovery_active
    }

    pub(crate) fn begin_recovery(&mut self, failed: DriveTag) {
        self.is_recovery_active = true;
        let index = if failed == DriveTag::SecondaryFirmware { 1 } else { 0 };
        self.refresh_counts[index] += 1;
    }

    pub(crate) fn finish_recovery(&mut self, elapsed_micros: u64) {
        self.is_recovery_active = false;
        self.last_elapsed_micros = elapsed_micros;
    }

    pub fn refresh_counts(&self) -> [u32; 2] {
        self.refresh_counts
    }

    pub fn last_elapsed_micros(&self) -> u64 {
        self.last_elapsed_micros
    }
}

impl Default for RecoveryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: NandDriver, P: PersistentBits> MediaCore<N, P> {
    fn system_region_index(&self, tag: DriveTag) -> Result<usize> {
        self.region_index_for_tag(tag)
            .ok_or(NandError::InvalidDriveType)
    }

    /// The drive a failed read of `tag` falls back to: the other
    /// firmware copy unless it is itself mid-rewrite, otherwise the
    /// master. The master has no backup.
    pub(crate) fn backup_drive_for(&self, tag: DriveTag) -> Option<DriveTag> {
        let backup = match tag {
            DriveTag::PrimaryFirmware => Some(DriveTag::SecondaryFirmware),
            DriveTag::SecondaryFirmware => Some(DriveTag::PrimaryFirmware),
            DriveTag::MasterFirmware => None,
            _ => None,
        }?;

        let backup_busy = self
            .drive_state(backup)
            .map(|d| d.is_being_rewritten)
            .unwrap_or(true);
        if backup_busy {
            Some(DriveTag::MasterFirmware)
        } else {
            Some(backup)
        }
    }

    /// Plain sector read from a system drive, no recovery. A corrected
    /// page above the rewrite threshold schedules a block refresh and
    /// still succeeds.
    pub(crate) fn system_read_sector_raw(
        &mut self,
        tag: DriveTag,
        sector: u32,
        buffer: &mut [u8],
    ) -> Result<()> {
        let region_idx = self.system_region_index(tag)?;
        let logical_block = sector >> self.geometry.page_shift();
        let page_in_block = self.geometry.page_offset(sector);

        let physical_block = self.regions[region_idx]
            .logical_to_physical(logical_block)
            .ok_or(NandError::OutOfSpace)?;
        let page = self.geometry.block_to_page(physical_block) + page_in_block;

        let mut meta = vec![0u8; self.geometry.page_metadata_size];
        match self.nand.read_page(page, buffer, &mut meta) {
            Ok(()) | Err(NandError::EccFixed) => Ok(()),
            Err(NandError::EccFixedShouldRewrite) => {
                self.queue.post(Task::RefreshBlock {
                    drive: tag,
                    logical_block,
                });
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Sector read that rides through read-disturb failures. On an
    /// uncorrectable read of a recoverable drive, recovery is kicked
    /// off and the read is retried against the newly selected current
    /// drive.
    pub(crate) fn system_read_sector_with_recovery(
        &mut self,
        tag: DriveTag,
        sector: u32,
        buffer: &mut [u8],
    ) -> Result<()> {
        let mut source = if self
            .drive_state(tag)
            .map(|d| d.is_being_rewritten)
            .unwrap_or(false)
        {
            self.recovery.current_drive()
        } else {
            tag
        };

        // Primary, secondary, then master is the longest possible
        // chain.
        for _ in 0..3 {
            // A block mid-refresh is erased or partially rewritten;
            // serve its sectors from the backup until it settles.
            let logical_block = sector >> self.geometry.page_shift();
            if self
                .drive_state(source)
                .map(|d| d.refreshing_block == Some(logical_block))
                .unwrap_or(false)
            {
                if let Some(backup) = self.backup_drive_for(source) {
                    source = backup;
                }
            }

            match self.system_read_sector_raw(source, sector, buffer) {
                Ok(()) => return Ok(()),
                Err(NandError::EccUncorrectable) | Err(NandError::HalReadFailed) => {
                    if !source.is_recoverable() || !self.recovery.is_available() {
                        return Err(NandError::DriveNotRecoverable);
                    }
                    self.start_recovery(source)?;
                    source = self.recovery.current_drive();
                }
                Err(e) => return Err(e),
            }
        }

        Err(NandError::DriveNotRecoverable)
    }

    /// Mark a drive failed, redirect reads to its backup, and post the
    /// asynchronous rewrite.
    pub(crate) fn start_recovery(&mut self, failed: DriveTag) -> Result<()> {
        if !failed.is_recoverable() {
            return Err(NandError::DriveNotRecoverable);
        }

        log::warn!("starting recovery of {:?}", failed);
        self.drive_state_mut(failed)?.is_being_rewritten = true;
        self.recovery.begin_recovery(failed);

        let backup = self
            .backup_drive_for(failed)
            .ok_or(NandError::DriveNotRecoverable)?;
        self.recovery.set_current_drive(backup);

        self.queue.post(Task::RewriteDrive {
            drive: failed,
            switch_on_success: true,
        });
        Ok(())
    }

    /// Program one sector of a system drive. System pages carry the
    /// boot signature and the erase-block serial in their metadata and
    /// go through the firmware ECC path the ROM reads.
    pub(crate) fn system_write_sector(
        &mut self,
        tag: DriveTag,
        sector: u32,
        buffer: &[u8],
    ) -> Result<()> {
        let region_idx = self.system_region_index(tag)?;
        let logical_block = sector >> self.geometry.page_shift();
        let page_in_block = self.geometry.page_offset(sector);

        let physical_block = self.regions[region_idx]
            .logical_to_physical(logical_block)
            .ok_or(NandError::OutOfSpace)?;
        let page = self.geometry.block_to_page(physical_block) + page_in_block;

        let mut record = Metadata::for_signature(STMP_TAG);
        record.set_block_number(logical_block as u8);
        let mut meta = vec![0xffu8; self.geometry.page_metadata_size];
        meta[..METADATA_SIZE].copy_from_slice(record.bytes());

        match self.nand.write_firmware_page(page, buffer, &meta) {
            Ok(()) => Ok(()),
            Err(NandError::HalWriteFailed) => {
                log::warn!(
                    "system drive {:?}: block {} failed to program",
                    tag,
                    physical_block
                );
                let _ = nand::erase_and_mark_on_failure(&mut self.nand, physical_block);
                self.regions[region_idx].add_new_bad_block(physical_block);
                Err(NandError::HalWriteFailed)
            }
            Err(e) => Err(e),
        }
    }

    /// Erase every good block of a system drive region.
    pub(crate) fn system_drive_erase(&mut self, tag: DriveTag) -> Result<()> {
        let region_idx = self.system_region_index(tag)?;
        let (start, count) = {
            let r = &self.regions[region_idx];
            (r.start_block, r.block_count)
        };

        for block in start..start + count {
            if self.regions[region_idx].bad_blocks.contains(block) {
                continue;
            }
            if let Err(e) = nand::erase_and_mark_on_failure(&mut self.nand, block) {
                log::warn!("system erase: block {} went bad ({:?})", block, e);
                self.regions[region_idx].add_new_bad_block(block);
            }
        }
        Ok(())
    }
}

fn lock_core<N, P>(core: &Arc<Mutex<MediaCore<N, P>>>) -> MutexGuard<'_, MediaCore<N, P>>
where
    N: NandDriver,
    P: PersistentBits,
{
    core.lock().unwrap_or_else(|e| e.into_inner())
}

/// Background rewrite of a whole system drive from its backup.
///
/// The persistent recovery bit frames the whole operation, and the
/// secondary-boot bit covers the window where the primary copy is
/// incomplete. The core lock is taken per sector so foreground I/O is
/// not starved for the duration of the copy.
pub(crate) fn run_drive_rewrite<N, P>(
    core: &Arc<Mutex<MediaCore<N, P>>>,
    drive: DriveTag,
    switch_on_success: bool,
) -> Result<()>
where
    N: NandDriver,
    P: PersistentBits,
{
    let timer = Instant::now();
    log::info!("rewrite of {:?} starting", drive);

    let (mut source, sector_count, sector_size) = {
        let mut c = lock_core(core);
        c.persistent
            .write_bit(PersistentBit::FirmwareRecoveryInProgress, true);
        if drive == DriveTag::PrimaryFirmware {
            c.persistent.write_bit(PersistentBit::NandSecondaryBoot, true);
        }
        c.drive_state_mut(drive)?.is_being_rewritten = true;
        let source = c
            .backup_drive_for(drive)
            .ok_or(NandError::DriveNotRecoverable)?;
        (
            source,
            c.drive_state(drive)?.sector_count,
            c.geometry.page_data_size,
        )
    };

    let result = (|| -> Result<()> {
        {
            let mut c = lock_core(core);
            c.system_drive_erase(drive)?;
        }

        let mut buffer = vec![0u8; sector_size];
        let mut sector = 0u32;
        while sector < sector_count {
            // Lock only for this single read and write so we don't
            // hold the whole NAND driver hostage.
            let mut c = lock_core(core);

            c.system_read_sector_with_recovery(source, sector, &mut buffer)?;

            match c.system_write_sector(drive, sector, &buffer) {
                Ok(()) => {}
                Err(NandError::HalWriteFailed) => {
                    // The bad block is recorded; erase the target and
                    // start the copy over so the new block gets
                    // skipped.
                    c.system_drive_erase(drive)?;
                    sector = 0;
                    continue;
                }
                Err(e) => return Err(e),
            }

            // The source may itself have entered recovery mid-copy;
            // fall back to the master for the rest.
            if c.drive_state(source)?.is_being_rewritten {
                source = DriveTag::MasterFirmware;
            }

            sector += 1;
        }
        Ok(())
    })();

    {
        let mut c = lock_core(core);
        c.drive_state_mut(drive)?.is_being_rewritten = false;

        if result.is_ok() {
            if switch_on_success {
                c.recovery.set_current_drive(drive);
            }
            if drive == DriveTag::PrimaryFirmware {
                c.persistent
                    .write_bit(PersistentBit::NandSecondaryBoot, false);
            }
        }

        c.persistent
            .write_bit(PersistentBit::FirmwareRecoveryInProgress, false);
        c.recovery.finish_recovery(timer.elapsed().as_micros() as u64);
    }

    log::info!(
        "rewrite of {:?} finished in {} us: {:?}",
        drive,
        timer.elapsed().as_micros(),
        result
    );
    result
}

/// Background refresh of one logical block of a system drive: reread
/// its sectors from the backup and rewrite the physical block in place.
/// A block that goes bad during the refresh upgrades the task to a full
/// drive rewrite, which knows how to skip it.
pub(crate) fn run_block_refresh<N, P>(
    core: &Arc<Mutex<MediaCore<N, P>>>,
    drive: DriveTag,
    logical_block: u32,
) -> Result<()>
where
    N: NandDriver,
    P: PersistentBits,
{
    log::debug!("refreshing {:?} block {}", drive, logical_block);

    let (mut source, physical_block, pages_per_block, sector_size) = {
        let mut c = lock_core(core);
        let region_idx = c
            .region_index_for_tag(drive)
            .ok_or(NandError::InvalidDriveType)?;
        let source = c
            .backup_drive_for(drive)
            .ok_or(NandError::DriveNotRecoverable)?;
        let physical_block = c.regions[region_idx]
            .logical_to_physical(logical_block)
            .ok_or(NandError::OutOfSpace)?;

        // Divert readers away from the block while it is torn down.
        c.drive_state_mut(drive)?.refreshing_block = Some(logical_block);

        // Erase in preparation for the rewrite.
        if let Err(e) = nand::erase_and_mark_on_failure(&mut c.nand, physical_block) {
            log::warn!(
                "refresh: erase of block {} failed ({:?}), rewriting drive",
                physical_block,
                e
            );
            c.drive_state_mut(drive)?.refreshing_block = None;
            c.regions[region_idx].add_new_bad_block(physical_block);
            c.start_recovery(drive)?;
            return Ok(());
        }

        (
            source,
            physical_block,
            c.geometry.pages_per_block,
            c.geometry.page_data_size,
        )
    };

    let finish = |core: &Arc<Mutex<MediaCore<N, P>>>| {
        let mut c = lock_core(core);
        if let Ok(state) = c.drive_state_mut(drive) {
            state.refreshing_block = None;
        }
    };

    let mut buffer = vec![0u8; sector_size];
    for page_in_block in 0..pages_per_block {
        let mut c = lock_core(core);
        let sector = (logical_block << c.geometry.page_shift()) + page_in_block;

        if let Err(e) = c.system_read_sector_with_recovery(source, sector, &mut buffer) {
            drop(c);
            finish(core);
            return Err(e);
        }

        let mut record = Metadata::for_signature(STMP_TAG);
        record.set_block_number(logical_block as u8);
        let mut meta = vec![0xffu8; c.geometry.page_metadata_size];
        meta[..METADATA_SIZE].copy_from_slice(record.bytes());

        let page = c.geometry.block_to_page(physical_block) + page_in_block;
        match c.nand.write_firmware_page(page, &buffer, &meta) {
            Ok(()) => {}
            Err(NandError::HalWriteFailed) => {
                let region_idx = c
                    .region_index_for_tag(drive)
                    .ok_or(NandError::InvalidDriveType)?;
                c.regions[region_idx].add_new_bad_block(physical_block);
                c.drive_state_mut(drive)?.refreshing_block = None;
                c.start_recovery(drive)?;
                return Ok(());
            }
            Err(e) => {
                drop(c);
                finish(core);
                return Err(e);
            }
        }

        if c.drive_state(source)?.is_being_rewritten {
            source = DriveTag::MasterFirmware;
        }
    }

    finish(core);
    Ok(())
}
