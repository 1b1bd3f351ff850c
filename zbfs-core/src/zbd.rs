// vim: tw=80

//! The zone pool: allocation, concurrency gating, and garbage collection.

use std::{
    fmt::{self, Display, Formatter},
    os::unix::io::RawFd,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
        Condvar,
        Mutex,
    },
    time::Instant,
};

use itertools::Itertools;
use tracing::{debug, info, warn};

use crate::{
    raw::{DeviceHandles, RawZonedDevice, ZoneCondition},
    types::*,
    zone::Zone,
};

/// Zones reserved for metadata at the head of the device.
const META_ZONES: usize = 3;

/// Lifetime distance of a zone whose data is expected to die before the
/// incoming data.  Such a zone is never a best-fit match: mixing in
/// longer-lived bytes would keep the whole zone from dying together.
const LIFETIME_MISMATCH: u32 = u32::MAX;

/// How well does a zone's lifetime classification fit incoming data?
/// Smaller is better; 0 is an exact match.
fn lifetime_distance(zone: WriteLifetimeHint, incoming: WriteLifetimeHint)
    -> u32
{
    use WriteLifetimeHint::*;
    // Unhinted data only mixes with unhinted data.
    if incoming == NotSet || incoming == None {
        return if zone == incoming { 0 } else { LIFETIME_MISMATCH };
    }
    if zone >= incoming {
        zone as u32 - incoming as u32
    } else {
        LIFETIME_MISMATCH
    }
}

/// Outcome of a single garbage-collection decision for one zone.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ZoneGcState {
    /// The zone holds live data or a writer; leave it alone.
    NotGcTarget,
    /// The zone held nothing live and was reset back into the empty pool.
    DoReset,
    /// The zone was finished: closed off from further writes, but its live
    /// data remains until the file layer invalidates it.
    NormalExit,
}

/// Accounting for the device's ceilings on simultaneously active and open
/// zones.
///
/// Counter increments happen only with the allocation lock held, so a
/// ceiling check followed by an increment cannot race another increment.
/// Decrements may come from any thread; they take `mtx` and wake every
/// parked allocator, and each waiter re-checks its own ceiling.
#[derive(Debug)]
pub(crate) struct ZoneResources {
    mtx: Mutex<()>,
    cv: Condvar,
    active_io_zones: AtomicU32,
    open_io_zones: AtomicU32,
    max_nr_active_io_zones: u32,
    max_nr_open_io_zones: u32,
}

impl ZoneResources {
    pub(crate) fn new(max_nr_active_io_zones: u32, max_nr_open_io_zones: u32)
        -> Self
    {
        ZoneResources {
            mtx: Mutex::new(()),
            cv: Condvar::new(),
            active_io_zones: AtomicU32::new(0),
            open_io_zones: AtomicU32::new(0),
            max_nr_active_io_zones,
            max_nr_open_io_zones,
        }
    }

    pub(crate) fn active(&self) -> u32 {
        self.active_io_zones.load(Ordering::Relaxed)
    }

    pub(crate) fn open(&self) -> u32 {
        self.open_io_zones.load(Ordering::Relaxed)
    }

    pub(crate) fn max_active(&self) -> u32 {
        self.max_nr_active_io_zones
    }

    pub(crate) fn max_open(&self) -> u32 {
        self.max_nr_open_io_zones
    }

    pub(crate) fn add_active(&self) {
        self.active_io_zones.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_open(&self) {
        self.open_io_zones.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn release_active(&self) {
        let _guard = self.mtx.lock().unwrap();
        let prev = self.active_io_zones.fetch_sub(1, Ordering::Relaxed);
        assert!(prev > 0, "Active zone count underflow");
        self.cv.notify_all();
    }

    pub(crate) fn release_open(&self) {
        let _guard = self.mtx.lock().unwrap();
        let prev = self.open_io_zones.fetch_sub(1, Ordering::Relaxed);
        assert!(prev > 0, "Open zone count underflow");
        self.cv.notify_all();
    }

    /// Park the calling thread until a writer slot is free.
    pub(crate) fn wait_open_slot(&self) {
        let mut guard = self.mtx.lock().unwrap();
        while self.open_io_zones.load(Ordering::Relaxed) >=
            self.max_nr_open_io_zones
        {
            guard = self.cv.wait(guard).unwrap();
        }
    }

    /// Park the calling thread until the device can take another active
    /// zone.
    pub(crate) fn wait_active_slot(&self) {
        let mut guard = self.mtx.lock().unwrap();
        while self.active_io_zones.load(Ordering::Relaxed) >=
            self.max_nr_active_io_zones
        {
            guard = self.cv.wait(guard).unwrap();
        }
    }
}

/// A pool of zones on one zoned block device.
///
/// Owns every in-core [`Zone`], partitioned into a small metadata pool and
/// the I/O pool, and decides which zone satisfies each write request.
/// Writers from any number of threads may call in concurrently; a request
/// that cannot proceed without exceeding the device's open/active ceilings
/// blocks the calling thread until another writer releases a slot or a
/// garbage-collection pass reclaims a zone.
#[derive(Debug)]
pub struct ZonedBlockDevice {
    raw: Arc<dyn RawZonedDevice>,
    filename: String,
    block_sz: u64,
    zone_sz: u64,
    nr_zones: ZoneT,
    readonly: bool,
    handles: DeviceHandles,
    meta_zones: Vec<Zone>,
    io_zones: Vec<Zone>,
    /// Serializes the allocation search over both pools.  Distinct from the
    /// resource-accounting lock inside `resources`.
    io_zones_mtx: Mutex<()>,
    resources: Arc<ZoneResources>,
    /// Percentage of max capacity below which a partially written,
    /// non-matching zone is finished rather than left fragmented.
    finish_threshold: AtomicU32,
    start_time: Instant,
}

impl ZonedBlockDevice {
    /// Open the device and build the zone pools from its zone report.
    ///
    /// Offline zones are dropped.  The first usable zones are reserved for
    /// metadata; everything else becomes the I/O pool.  Zones that were
    /// mid-write when the device was opened resume with their reported
    /// write pointers and immediately count against the active ceiling.
    pub fn open(raw: Arc<dyn RawZonedDevice>, readonly: bool) -> Result<Self>
    {
        let dinfo = raw.info()?;
        let handles = raw.open(readonly)?;
        let report = raw.report_zones()?;

        let max_active = if dinfo.max_nr_active_zones == 0 {
            dinfo.nr_zones
        } else {
            dinfo.max_nr_active_zones
        };
        let max_open = if dinfo.max_nr_open_zones == 0 {
            dinfo.nr_zones
        } else {
            dinfo.max_nr_open_zones
        };
        let resources = Arc::new(ZoneResources::new(max_active, max_open));

        let mut meta_zones = Vec::with_capacity(META_ZONES);
        let mut io_zones = Vec::with_capacity(report.len());
        for zi in &report {
            if zi.cond == ZoneCondition::Offline {
                continue;
            }
            let zone = Zone::new(raw.clone(), resources.clone(), zi,
                dinfo.zone_size, dinfo.block_size);
            if meta_zones.len() < META_ZONES &&
                zi.cond != ZoneCondition::ReadOnly
            {
                meta_zones.push(zone);
            } else {
                io_zones.push(zone);
            }
        }
        if meta_zones.len() < META_ZONES || io_zones.is_empty() {
            return Err(Error::EINVAL);
        }
        for z in meta_zones.iter().chain(io_zones.iter()) {
            if !z.is_empty() && !z.is_full() {
                resources.add_active();
            }
        }
        let filename = raw.filename();
        info!(filename = %filename, nr_zones = dinfo.nr_zones,
            zone_size = dinfo.zone_size, block_size = dinfo.block_size,
            max_active, max_open, readonly, "opened zoned block device");
        Ok(ZonedBlockDevice {
            raw,
            filename,
            block_sz: dinfo.block_size,
            zone_sz: dinfo.zone_size,
            nr_zones: dinfo.nr_zones,
            readonly,
            handles,
            meta_zones,
            io_zones,
            io_zones_mtx: Mutex::new(()),
            resources,
            finish_threshold: AtomicU32::new(0),
            start_time: Instant::now(),
        })
    }

    /// Pick a zone for a writer with the given lifetime hint.
    ///
    /// `file` and `prev_zone` request continuation: a writer extending a
    /// file keeps appending to the zone that already holds the file's tail
    /// whenever it still has room.  Otherwise the search prefers, in order:
    /// the open zone with the smallest lifetime distance (ties to the most
    /// remaining capacity), then an empty zone if the active ceiling
    /// allows, then finishing a fragmented victim to make room.  Blocks
    /// until a zone can be produced; fails with `ENOSPC` only when the
    /// pool holds no empty zone and nothing matches.
    ///
    /// The returned zone is exclusively claimed for the caller, who must
    /// hand it back with [`Zone::close_writer`].
    pub fn allocate_io_zone<'a>(
        &'a self,
        lifetime: WriteLifetimeHint,
        file: Option<ZoneFileId>,
        prev_zone: Option<&'a Zone>,
    ) -> Result<&'a Zone>
    {
        let _alloc = self.io_zones_mtx.lock().unwrap();
        if self.readonly {
            return Err(Error::EROFS);
        }
        self.resources.wait_open_slot();

        if let (Some(file), Some(prev)) = (file, prev_zone) {
            if !prev.open_for_write() && !prev.is_full() &&
                prev.extent_start(file).is_some()
            {
                prev.claim_for_write(None);
                self.resources.add_open();
                debug!(zone = prev.zone_nr(), %file, "continuing zone");
                return Ok(prev);
            }
        }

        loop {
            let (nreset, finish_victim) = self.sweep_io_zones();
            if nreset > 0 {
                debug!(nreset, "reclaimed zones during allocation");
            }

            // Best fit among the zones already open on the device.
            let mut best: Option<(&Zone, u32)> = None;
            for z in self.io_zones.iter() {
                if z.open_for_write() || z.is_empty() || z.is_full() {
                    continue;
                }
                let diff = lifetime_distance(z.lifetime(), lifetime);
                if diff == LIFETIME_MISMATCH {
                    continue;
                }
                best = match best {
                    Some((bz, bd)) if bd < diff ||
                        (bd == diff &&
                         bz.capacity_left() >= z.capacity_left()) =>
                            Some((bz, bd)),
                    _ => Some((z, diff)),
                };
            }
            if let Some((z, diff)) = best {
                z.claim_for_write(None);
                self.resources.add_open();
                debug!(zone = z.zone_nr(), ?lifetime, diff,
                    "allocated open zone");
                return Ok(z);
            }

            // No open zone matches; open an empty one if the device can
            // take another active zone.
            if self.resources.active() < self.resources.max_active() {
                if let Some(z) = self.io_zones.iter().find(|z| {
                    z.is_empty() && !z.open_for_write() &&
                        z.capacity_left() > 0
                }) {
                    z.claim_for_write(Some(lifetime));
                    self.resources.add_active();
                    self.resources.add_open();
                    debug!(zone = z.zone_nr(), ?lifetime,
                        "allocated empty zone");
                    return Ok(z);
                }
                // Nothing empty and nothing matched.
                return Err(Error::ENOSPC);
            }

            // At the active ceiling: finish the fullest fragmented zone to
            // free a slot, then restart the search.
            if let Some(v) = finish_victim {
                debug!(zone = v.zone_nr(),
                    capacity = v.capacity_left(), "finishing victim zone");
                v.finish()?;
                self.resources.release_active();
                continue;
            }

            // Every active slot is held by a zone with live data.  Park
            // until a writer fills one up or the file layer invalidates
            // one, then search again.
            self.resources.wait_active_slot();
        }
    }

    /// Pick a zone for a metadata write.
    ///
    /// Metadata has a single implicit lifetime class, so there is no hint
    /// matching: the search returns the metadata zone already in use if it
    /// has room, and otherwise opens an empty one, reclaiming stale
    /// metadata rolls as needed.  Shares the open/active accounting with
    /// the I/O pool.
    pub fn allocate_meta_zone(&self) -> Result<&Zone> {
        let _alloc = self.io_zones_mtx.lock().unwrap();
        if self.readonly {
            return Err(Error::EROFS);
        }
        self.resources.wait_open_slot();

        // Keep filling the metadata zone already in use.
        for z in self.meta_zones.iter() {
            if !z.open_for_write() && !z.is_full() && !z.is_empty() {
                z.claim_for_write(None);
                self.resources.add_open();
                return Ok(z);
            }
        }
        // Otherwise open an empty metadata zone, reclaiming stale rolls.
        for z in self.meta_zones.iter() {
            if z.open_for_write() {
                continue;
            }
            if !z.is_empty() {
                if z.used_capacity() > 0 || z.file_count() > 0 {
                    continue;
                }
                let was_full = z.is_full();
                if let Err(e) = z.reset() {
                    warn!(zone = z.zone_nr(), error = %e,
                        "meta zone reset failed");
                    continue;
                }
                if !was_full {
                    self.resources.release_active();
                }
            }
            self.resources.wait_active_slot();
            z.claim_for_write(None);
            self.resources.add_active();
            self.resources.add_open();
            return Ok(z);
        }
        Err(Error::ENOSPC)
    }

    /// One garbage-collection decision for one zone.
    ///
    /// `reset_condition` and `finish_condition` are sampled by the caller;
    /// [`Zone::reset`] re-verifies that nothing live remains under the
    /// zone's own lock, so a stale sample cannot lose data.
    fn zone_gc(&self, z: &Zone, reset_condition: bool, finish_condition: bool)
        -> ZoneGcState
    {
        if z.open_for_write() || z.is_empty() {
            return ZoneGcState::NotGcTarget;
        }
        if reset_condition {
            let was_full = z.is_full();
            return match z.reset() {
                Ok(()) => {
                    if !was_full {
                        self.resources.release_active();
                    }
                    debug!(zone = z.zone_nr(), "reset unused zone");
                    ZoneGcState::DoReset
                }
                // A live extent appeared after the condition was sampled.
                Err(Error::EBUSY) => ZoneGcState::NotGcTarget,
                Err(e) => {
                    warn!(zone = z.zone_nr(), error = %e,
                        "zone reset failed");
                    ZoneGcState::NotGcTarget
                }
            };
        }
        if finish_condition && !z.is_full() {
            match z.finish() {
                Ok(()) => {
                    self.resources.release_active();
                    debug!(zone = z.zone_nr(), "finished fragmented zone");
                    return ZoneGcState::NormalExit;
                }
                Err(e) => {
                    warn!(zone = z.zone_nr(), error = %e,
                        "zone finish failed");
                }
            }
        }
        ZoneGcState::NotGcTarget
    }

    /// Tidy the I/O pool ahead of an allocation search.
    ///
    /// Resets zones whose data has been wholly invalidated, finishes
    /// fragmented zones below the finish threshold, and returns the number
    /// of zones reset along with the fullest zone still suitable as a
    /// finish victim.
    fn sweep_io_zones(&self) -> (usize, Option<&Zone>) {
        let threshold = self.finish_threshold.load(Ordering::Relaxed) as u64;
        let mut nreset = 0;
        let mut finish_victim: Option<&Zone> = None;
        for z in self.io_zones.iter() {
            if z.open_for_write() || z.is_empty() || z.is_readonly() {
                continue;
            }
            let reset_condition =
                z.used_capacity() == 0 && z.file_count() == 0;
            let finish_condition = !reset_condition && !z.is_full() &&
                z.capacity_left() < z.max_capacity() * threshold / 100;
            match self.zone_gc(z, reset_condition, finish_condition) {
                ZoneGcState::DoReset => nreset += 1,
                ZoneGcState::NormalExit => {}
                ZoneGcState::NotGcTarget => {
                    if !z.is_full() {
                        finish_victim = match finish_victim {
                            Some(v)
                                if v.capacity_left() <= z.capacity_left() =>
                                    Some(v),
                            _ => Some(z),
                        };
                    }
                }
            }
        }
        (nreset, finish_victim)
    }

    /// Reset every I/O zone whose data has been wholly invalidated.
    ///
    /// The allocation path already does this opportunistically; this entry
    /// point exists for the storage engine to drive periodically so empty
    /// zones are available before writers start queueing for them.
    pub fn reset_unused_io_zones(&self) {
        let _alloc = self.io_zones_mtx.lock().unwrap();
        let mut nreset = 0;
        for z in self.io_zones.iter() {
            if z.open_for_write() || z.is_empty() || z.is_readonly() {
                continue;
            }
            let reset_condition =
                z.used_capacity() == 0 && z.file_count() == 0;
            if self.zone_gc(z, reset_condition, false) ==
                ZoneGcState::DoReset
            {
                nreset += 1;
            }
        }
        if nreset > 0 {
            debug!(nreset, "reset unused io zones");
        }
    }

    /// Sum of the remaining capacity of every I/O zone.
    pub fn free_space(&self) -> u64 {
        self.io_zones.iter().map(Zone::capacity_left).sum()
    }

    /// How many I/O zones are completely empty?
    pub fn nr_empty_zones(&self) -> ZoneT {
        self.io_zones.iter().filter(|z| z.is_empty()).count() as ZoneT
    }

    /// The I/O zone containing the device byte offset, if any.
    pub fn io_zone_at(&self, offset: u64) -> Option<&Zone> {
        self.io_zones.iter().find(|z| {
            z.start() <= offset && offset < z.start() + self.zone_sz
        })
    }

    pub fn io_zones(&self) -> impl Iterator<Item = &Zone> {
        self.io_zones.iter()
    }

    pub fn meta_zones(&self) -> impl Iterator<Item = &Zone> {
        self.meta_zones.iter()
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn block_size(&self) -> u64 {
        self.block_sz
    }

    pub fn zone_size(&self) -> u64 {
        self.zone_sz
    }

    pub fn nr_zones(&self) -> ZoneT {
        self.nr_zones
    }

    pub fn readonly(&self) -> bool {
        self.readonly
    }

    pub fn read_fd(&self) -> Option<RawFd> {
        self.handles.read
    }

    pub fn read_direct_fd(&self) -> Option<RawFd> {
        self.handles.read_direct
    }

    pub fn write_fd(&self) -> Option<RawFd> {
        self.handles.write
    }

    /// Set the fraction (in percent) of zone capacity below which a
    /// partially written, non-matching zone is finished rather than left
    /// open.  0 disables proactive finishing.
    pub fn set_finish_threshold(&self, threshold: u32) {
        assert!(threshold <= 100, "finish threshold is a percentage");
        self.finish_threshold.store(threshold, Ordering::Relaxed);
    }

    /// Zones currently claimed by writers.
    pub fn open_io_zones(&self) -> u32 {
        self.resources.open()
    }

    /// Zones currently counted against the device's active ceiling.
    pub fn active_io_zones(&self) -> u32 {
        self.resources.active()
    }

    pub fn max_nr_open_io_zones(&self) -> u32 {
        self.resources.max_open()
    }

    pub fn max_nr_active_io_zones(&self) -> u32 {
        self.resources.max_active()
    }

    /// Log a snapshot of pool-wide counters.  Best effort, never on the
    /// correctness path.
    pub fn log_zone_stats(&self) {
        let mut used = 0;
        let mut written = 0;
        let mut free = 0;
        for z in self.io_zones.iter() {
            used += z.used_capacity();
            written += z.max_capacity() - z.capacity_left();
            free += z.capacity_left();
        }
        info!(free, used, reclaimable = written.saturating_sub(used),
            empty_zones = self.nr_empty_zones(),
            open = self.resources.open(), active = self.resources.active(),
            uptime_s = self.start_time.elapsed().as_secs(),
            "io zone pool stats");
    }

    /// Log the usage of every zone holding data.  Best effort.
    pub fn log_zone_usage(&self) {
        for z in self.io_zones.iter().filter(|z| z.is_used()) {
            debug!("{z}");
        }
    }
}

impl Display for ZonedBlockDevice {
    /// Print a human-readable summary of both zone pools.
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let writing =
            self.io_zones.iter().filter(|z| z.open_for_write()).count();
        writeln!(f,
            "{}: {} io zones, {} empty, {} writing, open {}/{}, \
             active {}/{}",
            self.filename, self.io_zones.len(), self.nr_empty_zones(),
            writing, self.resources.open(), self.resources.max_open(),
            self.resources.active(), self.resources.max_active())?;
        writeln!(f, "{}", self.meta_zones.iter().format("\n"))?;
        write!(f, "{}",
            self.io_zones.iter().filter(|z| !z.is_empty()).format("\n"))
    }
}

// LCOV_EXCL_STOP
