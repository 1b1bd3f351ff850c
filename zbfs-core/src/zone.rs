// vim: tw=80

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
        Mutex,
    },
};

use crate::{
    raw::{RawZonedDevice, ZoneCondition, ZoneInfo},
    types::*,
    zbd::ZoneResources,
};

/// Mutable state of a `Zone`, guarded by the zone's own lock.
#[derive(Debug)]
struct ZoneState {
    /// Offset of the next writable byte.  Non-decreasing until the next
    /// reset.
    wp: u64,
    /// Remaining writable bytes.  Always `max_capacity - (wp - start)`.
    capacity: u64,
    /// A writer currently holds the zone; only that writer may append.
    open_for_write: bool,
    /// Expected longevity of the data in the zone.  Allocation matching
    /// only.
    lifetime: WriteLifetimeHint,
    /// Files owning bytes in the zone, keyed to their extent start offset.
    ///
    /// This is a back-reference registry, not an ownership edge: the file
    /// layer registers itself after writing an extent and must remove
    /// itself before it goes away.
    files: BTreeMap<ZoneFileId, u64>,
}

/// In-core representation of one zone of a zoned block device.
///
/// A zone is constructed once per physical zone at device-open time and
/// lives for as long as the device is open, cycling through its states as
/// data is written and reclaimed.
///
/// Zone life cycle
///
/// +-------+
/// | Empty |
/// +-------+
///     |
///     | ZonedBlockDevice::allocate_io_zone() when no open zone fits.
///     V
/// +-------+
/// | Open  |  append() advances wp; close_writer() releases the zone so a
/// +-------+  later allocation may continue it.
///     |
///     | append() exhausts capacity, or finish() gives up the remainder.
///     V
/// +-------+
/// | Full  |
/// +-------+
///     |
///     | reset(), once every extent has been invalidated.
///     V
/// +-------+
/// | Empty |
/// +-------+
#[derive(Debug)]
pub struct Zone {
    raw: Arc<dyn RawZonedDevice>,
    resources: Arc<ZoneResources>,
    /// Device byte offset of the zone's first block.  Never changes.
    start: u64,
    /// Total writable span of the zone in bytes.  Never changes.
    max_capacity: u64,
    /// Addressing pitch of the device's zones.
    zone_sz: u64,
    /// Write granularity of the device.
    block_sz: u64,
    /// The device reported the zone read-only; it can never be written or
    /// reset again.
    readonly: bool,
    /// Bytes in the zone still referenced by at least one live file extent.
    /// Maintained by the file layer, independently of the zone lock.
    used_capacity: AtomicU64,
    state: Mutex<ZoneState>,
}

impl Zone {
    pub(crate) fn new(
        raw: Arc<dyn RawZonedDevice>,
        resources: Arc<ZoneResources>,
        info: &ZoneInfo,
        zone_sz: u64,
        block_sz: u64,
    ) -> Self {
        debug_assert!(info.wp >= info.start);
        let capacity = match info.cond {
            ZoneCondition::Full |
            ZoneCondition::ReadOnly |
            ZoneCondition::Offline => 0,
            _ => info.max_capacity.saturating_sub(info.wp - info.start),
        };
        Zone {
            raw,
            resources,
            start: info.start,
            max_capacity: info.max_capacity,
            zone_sz,
            block_sz,
            readonly: info.cond == ZoneCondition::ReadOnly,
            used_capacity: AtomicU64::new(0),
            state: Mutex::new(ZoneState {
                wp: info.wp,
                capacity,
                open_for_write: false,
                lifetime: WriteLifetimeHint::NotSet,
                files: BTreeMap::new(),
            }),
        }
    }

    /// Device byte offset of the zone's first block.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Total writable span of the zone in bytes.
    pub fn max_capacity(&self) -> u64 {
        self.max_capacity
    }

    /// The zone's current write pointer.
    pub fn wp(&self) -> u64 {
        self.state.lock().unwrap().wp
    }

    /// How many more bytes can be appended to the zone?
    pub fn capacity_left(&self) -> u64 {
        self.state.lock().unwrap().capacity
    }

    /// Index of the zone within the device.
    pub fn zone_nr(&self) -> ZoneT {
        (self.start / self.zone_sz) as ZoneT
    }

    pub fn lifetime(&self) -> WriteLifetimeHint {
        self.state.lock().unwrap().lifetime
    }

    /// Does a writer currently hold the zone?
    pub fn open_for_write(&self) -> bool {
        self.state.lock().unwrap().open_for_write
    }

    /// Did the device report the zone read-only?
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Is there anything in the zone, live or stale?
    pub fn is_used(&self) -> bool {
        self.used_capacity() > 0 || self.wp() > self.start
    }

    pub fn is_full(&self) -> bool {
        self.state.lock().unwrap().capacity == 0
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().wp == self.start
    }

    /// Bytes still referenced by at least one live file extent.
    pub fn used_capacity(&self) -> u64 {
        self.used_capacity.load(Ordering::Relaxed)
    }

    /// Account `bytes` of freshly written data as live.
    pub fn add_used(&self, bytes: u64) {
        self.used_capacity.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Account `bytes` of the zone's data as no longer referenced.
    pub fn release_used(&self, bytes: u64) {
        let prev = self.used_capacity.fetch_sub(bytes, Ordering::Relaxed);
        assert!(prev >= bytes,
            "Double free of zone bytes detected.  released={bytes}, \
             used={prev}");
    }

    /// Record that `file` owns an extent starting at `extent_start`.
    ///
    /// Registering the same file again updates its extent start.
    pub fn set_file(&self, file: ZoneFileId, extent_start: u64) {
        self.state.lock().unwrap().files.insert(file, extent_start);
    }

    /// Where does `file`'s extent in this zone begin?
    pub fn extent_start(&self, file: ZoneFileId) -> Option<u64> {
        self.state.lock().unwrap().files.get(&file).copied()
    }

    /// Drop the back-reference to `file`.
    ///
    /// The caller is responsible for releasing the extent's bytes with
    /// [`Zone::release_used`], using [`Zone::extent_start`] to size the
    /// extent first.
    pub fn remove_file(&self, file: ZoneFileId) {
        self.state.lock().unwrap().files.remove(&file);
    }

    /// How many files hold extents in the zone?
    pub fn file_count(&self) -> usize {
        self.state.lock().unwrap().files.len()
    }

    /// Claim the zone for a single writer.
    ///
    /// Must only be called by the allocator, with the allocation lock held.
    /// `lifetime` is set when the allocator opens a fresh zone; a reused
    /// zone keeps the classification of the data already in it.
    pub(crate) fn claim_for_write(&self, lifetime: Option<WriteLifetimeHint>) {
        let mut st = self.state.lock().unwrap();
        assert!(!st.open_for_write, "Zone is already claimed by a writer");
        assert!(st.capacity > 0, "Can't claim a full zone for writing");
        if let Some(lifetime) = lifetime {
            st.lifetime = lifetime;
        }
        st.open_for_write = true;
    }

    /// Append `data` at the write pointer.
    ///
    /// The zone must be held by the calling writer, and `data` must be a
    /// multiple of the device block size.  Fails with `ENOSPC` if the zone
    /// has too little capacity left, leaving the zone unchanged.
    pub fn append(&self, data: IoVec) -> Result<()> {
        let len = data.len() as u64;
        let mut st = self.state.lock().unwrap();
        assert!(st.open_for_write, "Can't append to a zone nobody holds");
        assert_eq!(len % self.block_sz, 0,
            "Appends must be block-aligned");
        if len > st.capacity {
            return Err(Error::ENOSPC);
        }
        self.raw.write_at(data, st.wp)?;
        st.wp += len;
        st.capacity -= len;
        Ok(())
    }

    /// Mark the zone full, giving up its remaining capacity.
    ///
    /// The zone's contents stay readable, but it is excluded from every
    /// future allocation search until it has been reset.
    pub fn finish(&self) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        assert!(!st.open_for_write, "Can't finish a zone a writer holds");
        self.raw.finish_zone(self.start)?;
        st.wp = self.start + self.max_capacity;
        st.capacity = 0;
        Ok(())
    }

    /// Close the zone's on-device write session, keeping its write pointer
    /// so a later allocation can continue appending where it left off.
    ///
    /// Empty and full zones have no session to close.
    pub fn close(&self) -> Result<()> {
        let st = self.state.lock().unwrap();
        assert!(!st.open_for_write, "Can't close a zone a writer holds");
        if st.wp > self.start && st.capacity > 0 {
            self.raw.close_zone(self.start)?;
        }
        Ok(())
    }

    /// Rewind the zone to empty.
    ///
    /// Fails with `EBUSY` if any live data remains: the device must only
    /// reset zones already confirmed reclaimable, and a reset that loses
    /// live extents must never proceed.
    pub fn reset(&self) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        assert!(!st.open_for_write, "Can't reset a zone a writer holds");
        if self.readonly {
            return Err(Error::EROFS);
        }
        if self.used_capacity() > 0 || !st.files.is_empty() {
            return Err(Error::EBUSY);
        }
        self.raw.reset_zone(self.start)?;
        st.wp = self.start;
        st.capacity = self.max_capacity;
        st.lifetime = WriteLifetimeHint::NotSet;
        self.used_capacity.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Release the zone after the holding writer is done with it.
    ///
    /// Frees the writer's open-zone slot whether or not the on-device close
    /// succeeds, and frees the zone's active slot if it filled up (or was
    /// never written at all).  The on-device write session is closed only
    /// for partially written zones, where a later allocation may continue.
    pub fn close_writer(&self) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        assert!(st.open_for_write, "Zone is not held by any writer");
        st.open_for_write = false;
        let empty = st.wp == self.start;
        let full = st.capacity == 0;
        let r = if !empty && !full {
            self.raw.close_zone(self.start)
        } else {
            Ok(())
        };
        drop(st);
        self.resources.release_open();
        if full || empty {
            self.resources.release_active();
        }
        r
    }
}

impl Display for Zone {
    /// Print a one-line summary of the zone's state.
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let st = self.state.lock().unwrap();
        write!(f,
            "zone {:4}: wp {:#12x} cap {:>10}/{:<10} used {:>10} files {:3}{}",
            self.zone_nr(), st.wp, st.capacity, self.max_capacity,
            self.used_capacity.load(Ordering::Relaxed), st.files.len(),
            if st.open_for_write { " (writing)" } else { "" })
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {

use divbuf::DivBufShared;
use mockall::predicate::*;

use super::*;
use crate::raw::MockRawZonedDevice;

const ZONE_SZ: u64 = 4096;
const CAP: u64 = 100;

/// Build a zone of capacity 100 at start 4096, with byte-granular blocks.
fn zone(raw: MockRawZonedDevice) -> Zone {
    zone_at(raw, ZONE_SZ, ZONE_SZ)
}

fn zone_at(raw: MockRawZonedDevice, start: u64, wp: u64) -> Zone {
    let resources = Arc::new(ZoneResources::new(8, 8));
    let info = ZoneInfo {
        start,
        wp,
        max_capacity: CAP,
        cond: if wp == start {
            ZoneCondition::Empty
        } else {
            ZoneCondition::Closed
        },
    };
    Zone::new(Arc::new(raw), resources, &info, ZONE_SZ, 1)
}

fn iovec(len: usize) -> IoVec {
    let dbs = DivBufShared::from(vec![0u8; len]);
    dbs.try_const().unwrap()
}

mod append {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ok() {
        let mut raw = MockRawZonedDevice::default();
        raw.expect_write_at()
            .withf(|buf, offset| buf.len() == 60 && *offset == ZONE_SZ)
            .once()
            .returning(|_, _| Ok(()));
        let z = zone(raw);
        z.claim_for_write(Some(WriteLifetimeHint::Short));

        z.append(iovec(60)).unwrap();
        assert_eq!(z.wp(), ZONE_SZ + 60);
        assert_eq!(z.capacity_left(), 40);
        assert!(!z.is_full());
        assert!(z.is_used());
    }

    #[test]
    fn to_the_brim() {
        let mut raw = MockRawZonedDevice::default();
        raw.expect_write_at()
            .times(2)
            .returning(|_, _| Ok(()));
        let z = zone(raw);
        z.claim_for_write(None);

        z.append(iovec(60)).unwrap();
        z.append(iovec(40)).unwrap();
        assert!(z.is_full());
        assert_eq!(z.capacity_left(), 0);
    }

    // An oversized append fails and leaves the zone untouched.
    #[test]
    fn enospc() {
        let mut raw = MockRawZonedDevice::default();
        raw.expect_write_at()
            .once()
            .returning(|_, _| Ok(()));
        let z = zone(raw);
        z.claim_for_write(None);

        z.append(iovec(60)).unwrap();
        assert_eq!(z.append(iovec(50)).unwrap_err(), Error::ENOSPC);
        assert_eq!(z.wp(), ZONE_SZ + 60);
        assert_eq!(z.capacity_left(), 40);
    }

    #[test]
    fn device_error() {
        let mut raw = MockRawZonedDevice::default();
        raw.expect_write_at()
            .once()
            .returning(|_, _| Err(Error::EIO));
        let z = zone(raw);
        z.claim_for_write(None);

        assert_eq!(z.append(iovec(60)).unwrap_err(), Error::EIO);
        assert_eq!(z.wp(), ZONE_SZ);
        assert_eq!(z.capacity_left(), CAP);
    }

    #[test]
    #[should_panic(expected = "nobody holds")]
    fn unclaimed() {
        let z = zone(MockRawZonedDevice::default());
        let _ = z.append(iovec(1));
    }
}

mod finish {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ok() {
        let mut raw = MockRawZonedDevice::default();
        raw.expect_write_at()
            .once()
            .returning(|_, _| Ok(()));
        raw.expect_close_zone()
            .once()
            .returning(|_| Ok(()));
        raw.expect_finish_zone()
            .with(eq(ZONE_SZ))
            .once()
            .returning(|_| Ok(()));
        let z = zone(raw);
        z.resources.add_active();
        z.resources.add_open();
        z.claim_for_write(None);
        z.append(iovec(60)).unwrap();
        z.add_used(60);
        z.close_writer().unwrap();

        z.finish().unwrap();
        assert!(z.is_full());
        assert_eq!(z.wp(), ZONE_SZ + CAP);
        // the data is still there
        assert_eq!(z.used_capacity(), 60);
    }

    #[test]
    fn device_error() {
        let mut raw = MockRawZonedDevice::default();
        raw.expect_finish_zone()
            .once()
            .returning(|_| Err(Error::EIO));
        let z = zone_at(raw, ZONE_SZ, ZONE_SZ + 60);

        assert_eq!(z.finish().unwrap_err(), Error::EIO);
        assert_eq!(z.capacity_left(), CAP - 60);
    }
}

mod close {
    use super::*;

    #[test]
    fn partially_written() {
        let mut raw = MockRawZonedDevice::default();
        raw.expect_close_zone()
            .with(eq(ZONE_SZ))
            .once()
            .returning(|_| Ok(()));
        let z = zone_at(raw, ZONE_SZ, ZONE_SZ + 60);
        z.close().unwrap();
    }

    // Nothing to close on the device for an empty zone.
    #[test]
    fn empty() {
        let z = zone(MockRawZonedDevice::default());
        z.close().unwrap();
    }
}

mod close_writer {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn partially_written() {
        let mut raw = MockRawZonedDevice::default();
        raw.expect_write_at()
            .once()
            .returning(|_, _| Ok(()));
        raw.expect_close_zone()
            .once()
            .returning(|_| Ok(()));
        let z = zone(raw);
        z.resources.add_active();
        z.resources.add_open();
        z.claim_for_write(None);

        z.append(iovec(60)).unwrap();
        z.close_writer().unwrap();
        assert!(!z.open_for_write());
        assert_eq!(z.resources.open(), 0);
        // Partially written zones stay active.
        assert_eq!(z.resources.active(), 1);
    }

    #[test]
    fn full() {
        let mut raw = MockRawZonedDevice::default();
        raw.expect_write_at()
            .once()
            .returning(|_, _| Ok(()));
        let z = zone(raw);
        z.resources.add_active();
        z.resources.add_open();
        z.claim_for_write(None);

        z.append(iovec(CAP as usize)).unwrap();
        z.close_writer().unwrap();
        assert_eq!(z.resources.open(), 0);
        assert_eq!(z.resources.active(), 0);
    }

    // A writer that never appended gives back its active slot too.
    #[test]
    fn unwritten() {
        let z = zone(MockRawZonedDevice::default());
        z.resources.add_active();
        z.resources.add_open();
        z.claim_for_write(None);

        z.close_writer().unwrap();
        assert_eq!(z.resources.open(), 0);
        assert_eq!(z.resources.active(), 0);
    }
}

mod reset {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ok() {
        let mut raw = MockRawZonedDevice::default();
        raw.expect_reset_zone()
            .with(eq(ZONE_SZ))
            .once()
            .returning(|_| Ok(()));
        let z = zone_at(raw, ZONE_SZ, ZONE_SZ + 60);

        z.reset().unwrap();
        assert!(z.is_empty());
        assert_eq!(z.wp(), ZONE_SZ);
        assert_eq!(z.capacity_left(), CAP);
        assert_eq!(z.lifetime(), WriteLifetimeHint::NotSet);
    }

    #[test]
    fn ebusy_with_used_bytes() {
        let z = zone_at(MockRawZonedDevice::default(), ZONE_SZ, ZONE_SZ + 60);
        z.add_used(60);

        assert_eq!(z.reset().unwrap_err(), Error::EBUSY);
        assert_eq!(z.wp(), ZONE_SZ + 60);
        assert_eq!(z.used_capacity(), 60);
    }

    #[test]
    fn ebusy_with_file_association() {
        let z = zone_at(MockRawZonedDevice::default(), ZONE_SZ, ZONE_SZ + 60);
        z.set_file(ZoneFileId(1), ZONE_SZ);

        assert_eq!(z.reset().unwrap_err(), Error::EBUSY);
        assert_eq!(z.wp(), ZONE_SZ + 60);
    }

    #[test]
    fn device_error() {
        let mut raw = MockRawZonedDevice::default();
        raw.expect_reset_zone()
            .once()
            .returning(|_| Err(Error::EIO));
        let z = zone_at(raw, ZONE_SZ, ZONE_SZ + 60);

        assert_eq!(z.reset().unwrap_err(), Error::EIO);
        assert_eq!(z.wp(), ZONE_SZ + 60);
    }
}

mod files {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn set_get_remove() {
        let z = zone(MockRawZonedDevice::default());
        assert_eq!(z.extent_start(ZoneFileId(1)), None);

        z.set_file(ZoneFileId(1), ZONE_SZ);
        z.set_file(ZoneFileId(2), ZONE_SZ + 60);
        assert_eq!(z.extent_start(ZoneFileId(1)), Some(ZONE_SZ));
        assert_eq!(z.extent_start(ZoneFileId(2)), Some(ZONE_SZ + 60));
        assert_eq!(z.file_count(), 2);

        z.remove_file(ZoneFileId(1));
        assert_eq!(z.extent_start(ZoneFileId(1)), None);
        assert_eq!(z.file_count(), 1);
    }

    #[test]
    fn reregistering_updates_extent_start() {
        let z = zone(MockRawZonedDevice::default());
        z.set_file(ZoneFileId(1), ZONE_SZ);
        z.set_file(ZoneFileId(1), ZONE_SZ + 60);
        assert_eq!(z.extent_start(ZoneFileId(1)), Some(ZONE_SZ + 60));
        assert_eq!(z.file_count(), 1);
    }
}

mod used_capacity {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn add_and_release() {
        let z = zone(MockRawZonedDevice::default());
        z.add_used(60);
        z.add_used(40);
        assert_eq!(z.used_capacity(), 100);
        z.release_used(60);
        assert_eq!(z.used_capacity(), 40);
    }

    #[test]
    #[should_panic(expected = "Double free")]
    fn double_free() {
        let z = zone(MockRawZonedDevice::default());
        z.add_used(60);
        z.release_used(61);
    }
}

mod queries {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn zone_nr() {
        let z = zone_at(MockRawZonedDevice::default(), 5 * ZONE_SZ,
            5 * ZONE_SZ);
        assert_eq!(z.zone_nr(), 5);
    }

    #[test]
    fn fresh_zone() {
        let z = zone(MockRawZonedDevice::default());
        assert!(z.is_empty());
        assert!(!z.is_full());
        assert!(!z.is_used());
        assert!(!z.open_for_write());
        assert_eq!(z.capacity_left(), CAP);
        assert_eq!(z.max_capacity(), CAP);
        assert_eq!(z.start(), ZONE_SZ);
    }

    // A zone that was mid-write when the device was opened resumes with
    // correct accounting.
    #[test]
    fn reopened_zone() {
        let z = zone_at(MockRawZonedDevice::default(), ZONE_SZ, ZONE_SZ + 60);
        assert!(!z.is_empty());
        assert!(z.is_used());
        assert_eq!(z.capacity_left(), CAP - 60);
    }

    // pet kcov
    #[test]
    fn display() {
        let z = zone(MockRawZonedDevice::default());
        format!("{z}");
    }
}
}
// LCOV_EXCL_STOP
