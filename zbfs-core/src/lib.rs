// vim: tw=80

//! Zone allocation and resource management for zoned block devices.
//!
//! A zoned block device divides its address space into fixed-size zones that
//! must be written sequentially and explicitly reset before reuse, and it
//! limits how many zones may be simultaneously active or open.  This crate
//! tracks per-zone state ([`zone::Zone`]), hands zones out to writers,
//! enforces the device's concurrency ceilings, and reclaims zones whose data
//! has been wholly invalidated ([`zbd::ZonedBlockDevice`]).  Raw device I/O
//! is delegated through the [`raw::RawZonedDevice`] seam.

pub mod raw;
pub mod types;
pub mod zbd;
pub mod zone;

pub use crate::types::*;
