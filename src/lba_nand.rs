//! LBA-NAND device driver: partition modes and sequential transfers.
//!
//! An LBA-NAND is a managed NAND that multiplexes three partitions
//! behind one bus: a plain-NAND boot partition (PNP, read-only until
//! explicitly reopened writable as BCM), a vendor firmware partition
//! (VFP), and the multimedia data partition (MDP). Exactly one
//! partition is accessible at a time; switching is a device mode change
//! that must first close whatever streaming transfer the outgoing
//! partition had open.
//!
//! Reads and writes use the device's sequential transfer protocol: the
//! column address of the first access announces how many 512-byte base
//! sectors the sequence intends to move, and consecutive accesses at
//! consecutive addresses ride the same open sequence. Any direction
//! change, address jump, or mode change terminates the sequence with an
//! explicit command.
//!
//! All bus commands and DMA run under one mutex; a scoped lock guards
//! every outward command.

use std::sync::{Mutex, MutexGuard};

use crate::{NandError, Result};

// ---- timeouts, in microseconds ----

pub const TIMEOUT_RESET_US: u32 = 5_000_000;
pub const TIMEOUT_READ_PAGE_US: u32 = 1_500_000;
pub const TIMEOUT_WRITE_PAGE_US: u32 = 1_500_000;
/// Resizing the firmware partition reshuffles the device internally and
/// can take tens of seconds.
pub const TIMEOUT_SET_VFP_SIZE_US: u32 = 40_000_000;

// ---- geometry of the transfer protocol ----

/// The device's native sector size.
pub const BASE_SECTOR_SIZE: usize = 512;
/// Base sectors per logical sector; we run the 8-sector transfer unit.
pub const SECTOR_MULTIPLE: u32 = 8;
/// The logical sector size presented for the MDP and VFP.
pub const LOGICAL_SECTOR_SIZE: usize = BASE_SECTOR_SIZE * SECTOR_MULTIPLE as usize;
/// Base sectors announced for one open-ended transfer sequence.
pub const SEQUENTIAL_TRANSFER_BASE_SECTORS: u32 = 8192;

/// The boot partition is fixed at 256 sectors of 2KiB.
pub const PNP_SECTOR_COUNT: u32 = 256;
pub const PNP_SECTOR_SIZE: usize = 2048;

// ---- command codes ----

pub const CMD_READ_STATUS_1: u8 = 0x70;
pub const CMD_READ_STATUS_2: u8 = 0x71;
pub const CMD_REBOOT_DEVICE: u8 = 0xfd;
pub const CMD_MODE_CHANGE_TO_MDP: u8 = 0xfc;
pub const CMD_MODE_CHANGE_TO_VFP: u8 = 0xbe;
pub const CMD_MODE_CHANGE_TO_BCM: u8 = 0xbf;
pub const CMD_CACHE_FLUSH: u8 = 0xf9;
pub const CMD_GET_MDP_SIZE: u8 = 0xb0;
pub const CMD_SET_VFP_SIZE: u8 = 0x22;
pub const CMD_GET_VFP_SIZE: u8 = 0xb5;
pub const CMD_EX_SET_VFP_SIZE: u8 = 0x24;
pub const CMD_EX_GET_VFP_SIZE: u8 = 0xb7;
pub const CMD_ENABLE_POWER_SAVE: u8 = 0xba;
pub const CMD_DISABLE_POWER_SAVE: u8 = 0xbb;
pub const CMD_GARBAGE_AREA_SET_START: u8 = 0x5e;
pub const CMD_GARBAGE_AREA_SET_CLOSE: u8 = 0x5f;
pub const CMD_TERMINATE_READ_WRITE: u8 = 0xfb;

// ---- VFP sizing ----

pub const VFP_PASSWORD: u16 = 0xffff;
/// Minimum non-zero VFP size, in base sectors.
pub const VFP_MIN_SIZE: u32 = 0x4000;
/// Maximum standard VFP size, in base sectors.
pub const VFP_MAX_SIZE: u32 = 0x10000;
/// VFP allocation granularity, in base sectors.
pub const VFP_STEP_SIZE: u32 = 0x0200;
/// Get-size response meaning "the VFP has zero size".
pub const VFP_ZERO_SIZE_VALUE: u32 = 0x2020;
/// Get-size response meaning "sized by the EX command".
pub const VFP_EX_SIZE_VALUE: u32 = 0x3fff;
/// Capacity model type used by the EX sizing command.
pub const VFP_EX_CAPACITY_MODEL_TYPE: u8 = 0x11;
/// Logical sectors per EX capacity unit (16MiB).
pub const VFP_EX_CAPACITY_UNIT_SECTORS: u32 = 0x0100_0000 / LOGICAL_SECTOR_SIZE as u32;

/// Valid EX capacity parameters, in capacity units.
pub const VFP_CAPACITY_PARAMETER_TABLE: [u8; 13] =
    [3, 4, 6, 8, 12, 16, 24, 32, 48, 64, 96, 128, 192];

bitflags::bitflags! {
    /// View of the Status_1_Read response byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status1: u8 {
        const FAILURE = 1 << 0;
        const SECTOR_WRITE_TRANSFER_ERROR = 1 << 2;
        const NEW_COMMAND_START = 1 << 5;
        const READY = 1 << 6;
    }
}

bitflags::bitflags! {
    /// View of the Status_2_Read response byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status2: u8 {
        const POWER_SAVE_MODE = 1 << 0;
        const CURRENT_PARTITION = (1 << 1) | (1 << 2);
        const HIGH_SPEED_WRITE_MODE = 1 << 3;
        const ADDRESS_OUT_OF_RANGE = 1 << 4;
        const SPARE_BLOCKS_EXHAUSTED = 1 << 5;
        const COMMAND_PARAMETER_ERROR = 1 << 6;
    }
}

impl Status2 {
    /// The pre-shifted current-partition field, comparable against
    /// `LbaNandMode as u8`.
    pub fn current_partition(&self) -> u8 {
        self.bits() & Status2::CURRENT_PARTITION.bits()
    }
}

/// Modes the LBA-NAND can be put into. The values are the pre-shifted
/// current-partition field of the status-2 response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LbaNandMode {
    /// Read-only plain NAND mode, only entered by a device reboot.
    /// Asking for it lands in BCM instead.
    Pnp = 0,
    /// Read-write plain NAND (boot) mode.
    Bcm = 2,
    /// Vendor firmware partition access.
    Vfp = 4,
    /// Multimedia data partition access.
    Mdp = 6,
}

/// The three partitions presented by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    Boot,
    Firmware,
    Data,
}

impl PartitionKind {
    fn index(self) -> usize {
        match self {
            PartitionKind::Boot => 0,
            PartitionKind::Firmware => 1,
            PartitionKind::Data => 2,
        }
    }

    fn mode(self) -> LbaNandMode {
        match self {
            PartitionKind::Boot => LbaNandMode::Pnp,
            PartitionKind::Firmware => LbaNandMode::Vfp,
            PartitionKind::Data => LbaNandMode::Mdp,
        }
    }
}

/// Commands and DMA kicks the driver issues to the device. The real
/// implementation programs the GPMI DMA descriptors; tests script a
/// fake device. Sector arguments are in base (512-byte) sectors.
pub trait LbaBus {
    /// One-byte command with no address or data phase.
    fn send_reset_command(&mut self, code: u8, wait_for_ready: bool) -> Result<()>;

    /// General command with four data bytes and an optional response.
    fn send_general_command(
        &mut self,
        code: u8,
        data: Option<[u8; 4]>,
        response: &mut [u8],
        wait_for_ready: bool,
    ) -> Result<()>;

    /// Sequential read DMA. `column` carries the announced base-sector
    /// count of the sequence.
    fn read_sectors(&mut self, column: u32, base_sector: u32, buffer: &mut [u8]) -> Result<()>;

    /// Sequential write DMA; an empty buffer is a data-less transfer
    /// (used by the garbage-area commands).
    fn write_sectors(&mut self, column: u32, base_sector: u32, buffer: &[u8]) -> Result<()>;

    fn read_status(&mut self, code: u8) -> Result<u8>;

    /// Software-controlled ready poll for commands that outlast the
    /// DMA engine's own timeout.
    fn wait_for_ready(&mut self, timeout_us: u32) -> Result<()>;

    /// Boot partition transfers run through the boot ECC layout.
    fn read_boot_page(&mut self, sector: u32, buffer: &mut [u8]) -> Result<()>;
    fn write_boot_page(&mut self, sector: u32, buffer: &[u8]) -> Result<()>;
    fn erase_boot_sectors(&mut self, start_sector: u32, count: u32) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
struct TransferSequence {
    /// Logical sectors left in the open sequence; nonzero means a
    /// sequence is in flight.
    remaining_sectors: u32,
    /// Next logical sector the open sequence expects.
    next_sector: u32,
    is_reading: bool,
    /// Base-sector count to announce when the next sequence starts.
    next_base_count: u32,
}

impl TransferSequence {
    fn new() -> Self {
        TransferSequence {
            remaining_sectors: 0,
            next_sector: 0,
            is_reading: false,
            next_base_count: SEQUENTIAL_TRANSFER_BASE_SECTORS,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PartitionState {
    sector_size: usize,
    sector_count: u32,
    has_unflushed_changes: bool,
    sequence: TransferSequence,
}

impl PartitionState {
    fn new(sector_size: usize) -> Self {
        PartitionState {
            sector_size,
            sector_count: 0,
            has_unflushed_changes: false,
            sequence: TransferSequence::new(),
        }
    }
}

struct Inner<B: LbaBus> {
    bus: B,
    mode: LbaNandMode,
    partitions: [PartitionState; 3],
    power_save_enabled: bool,
}

/// One LBA-NAND device. The inner mutex is the HAL lock: every public
/// operation acquires it once for its full command sequence.
pub struct LbaNandDevice<B: LbaBus> {
    inner: Mutex<Inner<B>>,
}

impl<B: LbaBus> LbaNandDevice<B> {
    /// Bring up a freshly powered (or rebooted) device, which starts in
    /// PNP mode. Partition sizes are read from the device.
    pub fn init(bus: B) -> Result<Self> {
        let mut inner = Inner {
            bus,
            mode: LbaNandMode::Pnp,
            partitions: [
                PartitionState::new(PNP_SECTOR_SIZE),
                PartitionState::new(LOGICAL_SECTOR_SIZE),
                PartitionState::new(LOGICAL_SECTOR_SIZE),
            ],
            power_save_enabled: false,
        };

        inner.partitions[PartitionKind::Boot.index()].sector_count = PNP_SECTOR_COUNT;
        inner.partitions[PartitionKind::Data.index()].sector_count = inner.read_mdp_size()?;
        inner.partitions[PartitionKind::Firmware.index()].sector_count = inner.read_vfp_size()?;

        Ok(LbaNandDevice {
            inner: Mutex::new(inner),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner<B>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn mode(&self) -> LbaNandMode {
        self.lock().mode
    }

    /// Run a closure over the bus under the HAL lock. Diagnostics and
    /// test hook.
    pub fn inspect_bus<R>(&self, f: impl FnOnce(&B) -> R) -> R {
        f(&self.lock().bus)
    }

    /// Mutable variant of `inspect_bus`.
    pub fn with_bus_mut<R>(&self, f: impl FnOnce(&mut B) -> R) -> R {
        f(&mut self.lock().bus)
    }

    pub fn sector_count(&self, kind: PartitionKind) -> u32 {
        self.lock().partitions[kind.index()].sector_count
    }

    pub fn sector_size(&self, kind: PartitionKind) -> usize {
        self.lock().partitions[kind.index()].sector_size
    }

    /// Announce the expected length of an upcoming transfer so the
    /// first access opens a right-sized sequence.
    pub fn start_transfer_sequence(&self, kind: PartitionKind, sector_count: u32) -> Result<()> {
        let mut inner = self.lock();
        if inner.partitions[kind.index()].sequence.remaining_sectors != 0 {
            inner.terminate_read_write(kind)?;
        }

        let mut base = sector_count * SECTOR_MULTIPLE;
        if base == 0 || base > SEQUENTIAL_TRANSFER_BASE_SECTORS {
            base = SEQUENTIAL_TRANSFER_BASE_SECTORS;
        }
        inner.partitions[kind.index()].sequence.next_base_count = base;
        Ok(())
    }

    pub fn read_sector(&self, kind: PartitionKind, sector: u32, buffer: &mut [u8]) -> Result<()> {
        let mut inner = self.lock();
        inner.check_sector(kind, sector)?;

        if kind == PartitionKind::Boot {
            inner.set_mode(LbaNandMode::Pnp)?;
            return inner.bus.read_boot_page(sector, buffer);
        }

        inner.set_mode(kind.mode())?;

        // A write sequence, or a read at the wrong address, cannot be
        // continued.
        let seq = inner.partitions[kind.index()].sequence;
        if seq.remaining_sectors != 0 && (!seq.is_reading || seq.next_sector != sector) {
            inner.terminate_read_write(kind)?;
        }

        let column = inner.advance_sequence(kind, sector, true);
        inner
            .bus
            .read_sectors(column, sector * SECTOR_MULTIPLE, buffer)
    }

    pub fn write_sector(&self, kind: PartitionKind, sector: u32, buffer: &[u8]) -> Result<()> {
        let mut inner = self.lock();
        inner.check_sector(kind, sector)?;

        if kind == PartitionKind::Boot {
            inner.set_mode(LbaNandMode::Bcm)?;
            inner.bus.write_boot_page(sector, buffer)?;
            inner.partitions[kind.index()].has_unflushed_changes = true;
            return Ok(());
        }

        inner.set_mode(kind.mode())?;

        let seq = inner.partitions[kind.index()].sequence;
        if seq.remaining_sectors != 0 && (seq.is_reading || seq.next_sector != sector) {
            inner.terminate_read_write(kind)?;
        }

        let column = inner.advance_sequence(kind, sector, false);
        inner
            .bus
            .write_sectors(column, sector * SECTOR_MULTIPLE, buffer)?;

        // The device reports a failed program through status 1 only.
        let status1 = Status1::from_bits_retain(inner.bus.read_status(CMD_READ_STATUS_1)?);
        if status1.contains(Status1::FAILURE) {
            let status2 = Status2::from_bits_retain(inner.bus.read_status(CMD_READ_STATUS_2)?);
            inner.terminate_read_write(kind)?;
            let _ = inner.bus.read_status(CMD_READ_STATUS_1)?;

            log::warn!(
                "lba write failed: status1={:#04x} status2={:#04x}",
                status1.bits(),
                status2.bits()
            );

            return Err(if status2.contains(Status2::ADDRESS_OUT_OF_RANGE) {
                NandError::AddressOutOfRange
            } else if status2.contains(Status2::SPARE_BLOCKS_EXHAUSTED) {
                NandError::SpareBlocksExhausted
            } else {
                NandError::HalWriteFailed
            });
        }

        inner.partitions[kind.index()].has_unflushed_changes = true;
        Ok(())
    }

    /// Mark a sector range as garbage so the device can reclaim it.
    pub fn erase_sectors(&self, kind: PartitionKind, start_sector: u32, count: u32) -> Result<()> {
        if count == 0 {
            return Ok(());
        }

        let mut inner = self.lock();

        if kind == PartitionKind::Boot {
            inner.set_mode(LbaNandMode::Bcm)?;
            return inner
                .bus
                .erase_boot_sectors(start_sector, count);
        }

        inner.set_mode(kind.mode())?;
        inner.terminate_read_write(kind)?;

        inner
            .bus
            .send_general_command(CMD_GARBAGE_AREA_SET_START, None, &mut [], true)?;

        let status = inner.bus.write_sectors(
            count * SECTOR_MULTIPLE,
            start_sector * SECTOR_MULTIPLE,
            &[],
        );

        // Close the bracket no matter how the transfer went.
        let close =
            inner
                .bus
                .send_general_command(CMD_GARBAGE_AREA_SET_CLOSE, None, &mut [], true);
        status.and(close)?;

        inner.partitions[kind.index()].has_unflushed_changes = true;
        Ok(())
    }

    /// Flush the device's write cache for one partition. Skipped when
    /// the partition saw no writes since the last flush.
    pub fn flush_cache(&self, kind: PartitionKind) -> Result<()> {
        let mut inner = self.lock();
        if !inner.partitions[kind.index()].has_unflushed_changes {
            return Ok(());
        }

        inner.terminate_read_write(kind)?;
        inner.set_mode(kind.mode())?;
        inner.bus.send_reset_command(CMD_CACHE_FLUSH, true)?;
        inner.partitions[kind.index()].has_unflushed_changes = false;
        Ok(())
    }

    /// Reboot the device. Afterwards it is back in true PNP mode.
    pub fn reboot(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.bus.send_reset_command(CMD_REBOOT_DEVICE, false)?;
        inner.bus.wait_for_ready(TIMEOUT_RESET_US)?;
        inner.mode = LbaNandMode::Pnp;
        for p in inner.partitions.iter_mut() {
            p.sequence = TransferSequence::new();
        }
        Ok(())
    }

    /// Power save halves standby draw but must not interrupt an open
    /// transfer sequence.
    pub fn enable_power_save(&self, enable: bool) -> Result<()> {
        let mut inner = self.lock();
        if inner
            .partitions
            .iter()
            .any(|p| p.sequence.remaining_sectors != 0)
        {
            return Err(NandError::DmaBusy);
        }

        let code = if enable {
            CMD_ENABLE_POWER_SAVE
        } else {
            CMD_DISABLE_POWER_SAVE
        };
        inner.bus.send_reset_command(code, true)?;
        inner.power_save_enabled = enable;
        Ok(())
    }

    pub fn power_save_enabled(&self) -> bool {
        self.lock().power_save_enabled
    }

    pub fn vfp_size(&self) -> Result<u32> {
        self.lock().read_vfp_size()
    }

    pub fn mdp_size(&self) -> Result<u32> {
        self.lock().read_mdp_size()
    }

    /// Resize the firmware partition to `new_sector_count` logical
    /// sectors.
    ///
    /// Small sizes are clamped to the device minimum and rounded up to
    /// the step size; sizes beyond the standard maximum use the EX
    /// command with the capacity parameter table. The command itself is
    /// sent without the DMA's ready wait because the device can stay
    /// busy far longer than the engine's timeout allows; a software
    /// ready poll bounded in seconds follows. The result is verified by
    /// reading the size back, and the partition objects are
    /// re-initialized.
    pub fn set_vfp_size(&self, new_sector_count: u32) -> Result<u32> {
        let mut inner = self.lock();

        let mut command_code = CMD_SET_VFP_SIZE;
        let mut command_data: u32;
        let mut expected_count = new_sector_count;

        if new_sector_count == 0 {
            command_data = VFP_ZERO_SIZE_VALUE;
        } else if new_sector_count <= VFP_MAX_SIZE / SECTOR_MULTIPLE {
            // Standard sizing, in base sectors.
            command_data = new_sector_count * SECTOR_MULTIPLE;
            command_data = command_data.max(VFP_MIN_SIZE);
            command_data = (command_data + VFP_STEP_SIZE - 1) & !(VFP_STEP_SIZE - 1);
            expected_count = command_data / SECTOR_MULTIPLE;
            if command_data == VFP_MAX_SIZE {
                // The command encodes the maximum as zero.
                command_data = 0;
            }
        } else {
            // EX sizing from the capacity parameter table.
            command_code = CMD_EX_SET_VFP_SIZE;
            let mut chosen = None;
            for &table_value in VFP_CAPACITY_PARAMETER_TABLE.iter() {
                let size = table_value as u32 * VFP_EX_CAPACITY_UNIT_SECTORS;
                if size >= new_sector_count {
                    chosen = Some((table_value, size));
                    break;
                }
            }
            let (table_value, size) = chosen.ok_or(NandError::VfpSizeTooLarge)?;
            expected_count = size;
            command_data = (VFP_EX_CAPACITY_MODEL_TYPE as u32) | ((table_value as u32) << 8);
        }

        let data = [
            command_data as u8,
            (command_data >> 8) as u8,
            (!command_data) as u8,
            ((!command_data) >> 8) as u8,
        ];

        // The sizing commands only work in VFP mode.
        inner.set_mode(LbaNandMode::Vfp)?;

        inner
            .bus
            .send_general_command(command_code, Some(data), &mut [], false)?;
        inner.bus.wait_for_ready(TIMEOUT_SET_VFP_SIZE_US)?;

        let actual = inner.read_vfp_size()?;
        if actual != expected_count {
            log::warn!(
                "set vfp size: wanted {} sectors, device reports {}",
                expected_count,
                actual
            );
            return Err(NandError::SetVfpSizeFailed);
        }

        // Both data partitions moved; re-read their sizes.
        inner.partitions[PartitionKind::Data.index()].sector_count = inner.read_mdp_size()?;
        inner.partitions[PartitionKind::Firmware.index()].sector_count = actual;
        inner.partitions[PartitionKind::Firmware.index()].sequence = TransferSequence::new();
        inner.partitions[PartitionKind::Data.index()].sequence = TransferSequence::new();

        Ok(actual)
    }
}

impl<B: LbaBus> Inner<B> {
    fn check_sector(&self, kind: PartitionKind, sector: u32) -> Result<()> {
        if sector >= self.partitions[kind.index()].sector_count {
            return Err(NandError::AddressOutOfRange);
        }
        Ok(())
    }

    /// Continue or open the partition's transfer sequence for an access
    /// at `sector`, returning the column value (the announced base
    /// sector count) for the DMA.
    fn advance_sequence(&mut self, kind: PartitionKind, sector: u32, is_reading: bool) -> u32 {
        let seq = &mut self.partitions[kind.index()].sequence;

        let expected_base = if seq.remaining_sectors == 0 {
            let base = seq.next_base_count;
            seq.next_base_count = SEQUENTIAL_TRANSFER_BASE_SECTORS;
            base
        } else {
            seq.remaining_sectors * SECTOR_MULTIPLE
        };

        if seq.remaining_sectors == 0 {
            seq.remaining_sectors = expected_base / SECTOR_MULTIPLE;
            seq.next_sector = sector;
            seq.is_reading = is_reading;
        }

        seq.remaining_sectors -= 1;
        seq.next_sector += 1;

        expected_base
    }

    /// Close the partition's open transfer sequence, if any.
    fn terminate_read_write(&mut self, kind: PartitionKind) -> Result<()> {
        let seq = &mut self.partitions[kind.index()].sequence;
        if seq.remaining_sectors != 0 {
            self.bus
                .send_reset_command(CMD_TERMINATE_READ_WRITE, true)?;
            let seq = &mut self.partitions[kind.index()].sequence;
            seq.remaining_sectors = 0;
            seq.next_sector = 0;
        }
        Ok(())
    }

    /// Let the partition that owns the current mode close up before the
    /// device switches away from it.
    fn exit_current_partition(&mut self) -> Result<()> {
        let kind = match self.mode {
            LbaNandMode::Pnp | LbaNandMode::Bcm => PartitionKind::Boot,
            LbaNandMode::Vfp => PartitionKind::Firmware,
            LbaNandMode::Mdp => PartitionKind::Data,
        };
        self.terminate_read_write(kind)
    }

    fn set_mode(&mut self, mode: LbaNandMode) -> Result<()> {
        if self.mode == mode {
            return Ok(());
        }

        // A failure to close the outgoing partition aborts the switch.
        self.exit_current_partition()?;

        let mut target = mode;

        // The VFP can only be entered from MDP when the device is still
        // in its boot mode.
        if mode == LbaNandMode::Vfp && self.mode == LbaNandMode::Pnp {
            self.mode_change_to_mdp()?;
            if cfg!(debug_assertions) {
                self.verify_mode(LbaNandMode::Mdp)?;
            }
        }

        match mode {
            LbaNandMode::Pnp | LbaNandMode::Bcm => {
                // The device can only return to true PNP by rebooting;
                // asking for it opens the boot partition writable.
                self.mode_change_to_bcm()?;
                target = LbaNandMode::Bcm;
            }
            LbaNandMode::Vfp => self.mode_change_to_vfp()?,
            LbaNandMode::Mdp => self.mode_change_to_mdp()?,
        }

        if cfg!(debug_assertions) {
            self.verify_mode(target)?;
        }

        self.mode = target;
        Ok(())
    }

    fn mode_change_to_mdp(&mut self) -> Result<()> {
        self.bus.send_reset_command(CMD_MODE_CHANGE_TO_MDP, true)
    }

    fn mode_change_to_vfp(&mut self) -> Result<()> {
        let password = VFP_PASSWORD;
        let data = [
            password as u8,
            (password >> 8) as u8,
            (!password) as u8,
            ((!password) >> 8) as u8,
        ];
        self.bus
            .send_general_command(CMD_MODE_CHANGE_TO_VFP, Some(data), &mut [], true)
    }

    fn mode_change_to_bcm(&mut self) -> Result<()> {
        self.bus
            .send_general_command(CMD_MODE_CHANGE_TO_BCM, None, &mut [], true)
    }

    fn verify_mode(&mut self, mode: LbaNandMode) -> Result<()> {
        let status = Status2::from_bits_retain(self.bus.read_status(CMD_READ_STATUS_2)?);
        if status.current_partition() != mode as u8 {
            return Err(NandError::ModeNotSet);
        }
        Ok(())
    }

    fn read_mdp_size(&mut self) -> Result<u32> {
        let mut response = [0u8; 5];
        self.bus
            .send_general_command(CMD_GET_MDP_SIZE, None, &mut response, true)?;
        debug_assert_eq!(response[4], 0);
        let base = u32::from_le_bytes([response[0], response[1], response[2], response[3]]);
        Ok(base / SECTOR_MULTIPLE)
    }

    fn read_vfp_size(&mut self) -> Result<u32> {
        let mut response = [0u8; 2];
        self.bus
            .send_general_command(CMD_GET_VFP_SIZE, None, &mut response, true)?;
        let size = (response[0] as u32) | ((response[1] as u32) << 8);

        if size == 0 {
            // Zero is how the device reports the maximum.
            return Ok(VFP_MAX_SIZE / SECTOR_MULTIPLE);
        }
        if size == VFP_ZERO_SIZE_VALUE {
            return Ok(0);
        }
        if size == VFP_EX_SIZE_VALUE {
            // Sized by the EX command; read it the EX way.
            let mut ex = [0u8; 2];
            self.bus
                .send_general_command(CMD_EX_GET_VFP_SIZE, None, &mut ex, true)?;
            if ex[0] == 0 || ex[1] == 0 {
                // The standard readback said "EX" but the EX readback
                // says nothing. Observed on real parts; report empty.
                log::warn!("vfp size paradox: standard says EX, EX says zero");
                return Ok(0);
            }
            if ex[0] != VFP_EX_CAPACITY_MODEL_TYPE {
                return Err(NandError::UnknownVfpCapacityModelType);
            }
            return Ok(ex[1] as u32 * VFP_EX_CAPACITY_UNIT_SECTORS);
        }

        Ok(size / SECTOR_MULTIPLE)
    }
}
