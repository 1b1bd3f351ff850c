// vim: tw=80
//! Interface to the raw zoned-device I/O layer.
//!
//! The allocation core never issues syscalls itself.  Everything it needs
//! from the device below it passes through [`RawZonedDevice`]: geometry and
//! limits at open time, a zone report to rebuild in-core state, and the four
//! data-plane verbs (`write_at`, `reset_zone`, `finish_zone`, `close_zone`).

#[cfg(test)] use mockall::automock;
use std::os::unix::io::RawFd;

use crate::types::*;

/// Condition of a zone as reported by the device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ZoneCondition {
    /// Nothing written since the last reset.
    Empty,
    /// The zone has an open write session on the device.
    Open,
    /// Partially written, no open session; appending may resume at `wp`.
    Closed,
    /// No further writes are possible until the zone is reset.
    Full,
    /// The zone can be read but never again written.
    ReadOnly,
    /// The zone is dead; reads and writes both fail.
    Offline,
}

/// One entry of a device zone report.
#[derive(Clone, Copy, Debug)]
pub struct ZoneInfo {
    /// Device byte offset of the first block in the zone.
    pub start: u64,
    /// The zone's write pointer.
    pub wp: u64,
    /// Usable span of the zone in bytes.  May be smaller than the zone size.
    pub max_capacity: u64,
    pub cond: ZoneCondition,
}

/// Geometry and limits of a zoned block device.
#[derive(Clone, Copy, Debug)]
pub struct DeviceInfo {
    /// Minimum unit of a write, in bytes.
    pub block_size: u64,
    /// Distance between the start offsets of adjacent zones, in bytes.
    pub zone_size: u64,
    pub nr_zones: ZoneT,
    /// Hardware limit on simultaneously active zones.  0 means unbounded.
    pub max_nr_active_zones: u32,
    /// Hardware limit on simultaneously open zones.  0 means unbounded.
    pub max_nr_open_zones: u32,
}

/// File descriptors opened once at device-open time.
///
/// The core holds these for the benefit of the I/O layer above it; it never
/// reads or writes through them directly.  `write` is `None` for read-only
/// opens, and implementations that aren't backed by a file may leave all
/// three unset.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceHandles {
    pub read: Option<RawFd>,
    pub read_direct: Option<RawFd>,
    pub write: Option<RawFd>,
}

/// The device-side collaborator of the allocation core.
///
/// Implementations translate these verbs into whatever the medium requires:
/// zone-management commands for real zoned hardware, emulation for tests.
/// All methods may be called concurrently from multiple threads.
#[cfg_attr(test, automock)]
pub trait RawZonedDevice: std::fmt::Debug + Send + Sync {
    /// Name of the backing device, for diagnostics only.
    fn filename(&self) -> String;

    /// Open the backing device and return its fd-like handles.
    fn open(&self, readonly: bool) -> Result<DeviceHandles>;

    /// Query geometry and zone-concurrency limits.
    fn info(&self) -> Result<DeviceInfo>;

    /// Report the current state of every zone on the device.
    fn report_zones(&self) -> Result<Vec<ZoneInfo>>;

    /// Write `buf` at `offset`, which must equal the containing zone's write
    /// pointer.  Returns only after the full buffer is transferred.
    fn write_at(&self, buf: IoVec, offset: u64) -> Result<()>;

    /// Rewind the zone at `start` to empty.
    fn reset_zone(&self, start: u64) -> Result<()>;

    /// Transition the zone at `start` to full, ending its write session.
    fn finish_zone(&self, start: u64) -> Result<()>;

    /// Close the zone's write session, preserving its write pointer.
    fn close_zone(&self, start: u64) -> Result<()>;
}
