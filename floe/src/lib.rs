//! Concurrent growable arrays whose buckets can migrate to disk.
//!
//! The central structure is the [`BucketArray`]:
//! a table of exponentially growing buckets that are allocated on first use
//! and never move. On top of it sit the append logs
//! ([`WriteStalledLog`] and [`RelaxedLog`]), the [`BitVector`],
//! and the file-backed [`MmapLog`].
//!
//! Every bucket is a separate memory mapping with a [`PtrMetadata`] record.
//! A bucket can be archived, which moves its contents into a file-backed
//! mapping at the same address, and restored, which moves them back.
//! See the [`archive`] module for details.

#![warn(missing_docs)]

pub use self::{
    append::*,
    archive::*,
    array::*,
    bitvec::*,
    config::*,
    error::*,
    meta::{AllocKind, PtrMetadata, Residency, thread_id},
    mmap_log::*,
};

pub mod archive;

mod append;
mod array;
mod bitvec;
mod config;
mod error;
mod meta;
mod mmap_log;
