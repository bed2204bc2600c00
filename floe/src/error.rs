//! Error types.

use {std::{io, path::PathBuf}, thiserror::Error};

/// Returned when a bucket cannot be allocated.
///
/// A failed allocation leaves the bucket table untouched,
/// so a later attempt may succeed.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum AllocationError
{
    #[error("Cannot allocate an empty bucket")]
    Empty,

    #[error("Cannot allocate {0} bytes; bucket sizes are limited to 32 bits")]
    TooLarge(usize),

    #[error("Cannot map {len} bytes of memory")]
    Map
    {
        len: usize,
        #[source]
        source: io::Error,
    },

    #[error("Cannot prepare backing file {path:?}")]
    File
    {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Returned when an index lies outside the valid range.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[error("Index {index} is out of bounds; the bound is {bound}")]
pub struct IndexError
{
    /// The offending index.
    pub index: usize,

    /// The exclusive upper bound that was violated.
    pub bound: usize,
}

/// Returned when a bucket cannot be moved between memory and disk.
///
/// The bucket stays in the residency state it had before the attempt.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum MigrationError
{
    #[error("Cannot create archive file {path:?}")]
    File
    {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot copy bucket contents to {path:?}")]
    Write
    {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot remap bucket memory")]
    Map(#[source] io::Error),

    #[error("Cannot flush bucket memory")]
    Sync(#[source] io::Error),
}

/// Any error produced by this crate.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum Error
{
    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Migration(#[from] MigrationError),
}

/// Result type defaulting to [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;
