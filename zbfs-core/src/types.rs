// vim: tw=80
//! Common type definitions used throughout the zone-allocation core

use std::{
    fmt::{self, Display, Formatter},
    io,
};

use divbuf::{DivBuf, DivBufMut};
use enum_primitive_derive::Primitive;
use num_traits::{FromPrimitive, ToPrimitive};
use thiserror::Error;

/// Our `IoVec`.  Unlike the standard library's, ours is reference-counted so
/// it can have more than one owner.
pub type IoVec = DivBuf;

/// Mutable version of `IoVec`.  Uniquely owned.
pub type IoVecMut = DivBufMut;

/// Indexes a zone within a zoned block device.
pub type ZoneT = u32;

/// Stable identity of a file that owns extents within a zone.
///
/// The file abstraction itself is out of this crate's hands; zones only use
/// the identity as the key of their back-reference registry, and the file
/// layer is responsible for registering and removing itself symmetrically.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ZoneFileId(pub u64);

impl Display for ZoneFileId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Expected longevity of written data.
///
/// The ordering reflects how long the data is expected to live.  Allocation
/// uses the hint to steer similarly-lived data into the same zones, so whole
/// zones tend to die together and can be reclaimed without relocation.  The
/// hint never affects correctness.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum WriteLifetimeHint {
    /// The writer gave no hint at all.
    NotSet,
    /// The writer explicitly declined to predict a lifetime.
    None,
    Short,
    Medium,
    Long,
    Extreme,
}

/// The core's error type.  Basically just an errno
///
/// Device I/O failures surface as `EIO`, appends beyond a zone's remaining
/// capacity as `ENOSPC`, and resetting a zone that still holds live data as
/// `EBUSY`.  Running out of zones is also `ENOSPC`; running out of
/// open/active slots is not an error at all, it blocks (see
/// [`crate::zbd::ZonedBlockDevice`]).
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq, Primitive)]
pub enum Error {
    #[error("Input/output error")]
    EIO         = libc::EIO as isize,
    #[error("Device busy")]
    EBUSY       = libc::EBUSY as isize,
    #[error("No such device")]
    ENODEV      = libc::ENODEV as isize,
    #[error("Invalid argument")]
    EINVAL      = libc::EINVAL as isize,
    #[error("No space left on device")]
    ENOSPC      = libc::ENOSPC as isize,
    #[error("Read-only file system")]
    EROFS       = libc::EROFS as isize,
    #[error("Operation not supported")]
    EOPNOTSUPP  = libc::EOPNOTSUPP as isize,
    #[error("Unknown error")]
    EUNKNOWN    = 256,
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        e.raw_os_error()
            .and_then(Error::from_i32)
            .unwrap_or(Error::EUNKNOWN)
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::from_i32(e as i32).unwrap_or(Error::EUNKNOWN)
    }
}

impl From<Error> for i32 {
    fn from(e: Error) -> Self {
        match e {
            Error::EUNKNOWN =>
                panic!("Unknown error codes should never be exposed"),
            _ => e.to_i32().unwrap()
        }
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;

// LCOV_EXCL_STOP
