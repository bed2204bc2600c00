//! Per-allocation metadata records.
//!
//! Every bucket allocation carries exactly one [`PtrMetadata`] record.
//! The record is packed into a single 64-bit word so that it can be read
//! without locking while the allocator flips its residency state.

use {
    serde::Deserialize,
    std::{
        cell::Cell,
        sync::atomic::{AtomicU64, AtomicU8, Ordering::{Acquire, Relaxed, Release}},
    },
};

/// How the memory of an allocation was obtained.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum AllocKind
{
    /// Anonymous process memory.
    #[default]
    Default = 0,

    /// A shared mapping of a named file.
    MemoryMapped = 1,
}

/// Where the contents of an allocation currently live.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum Residency
{
    /// Backed by normal process memory.
    Resident = 0,

    /// Backed by a memory-mapped file.
    Archived = 1,
}

/// Metadata describing one allocation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PtrMetadata
{
    /// Size of the allocation in bytes.
    pub size: u32,

    /// Identifier of the thread that performed the allocation.
    pub thread_id: u8,

    /// Whether the allocation is resident or archived.
    pub state: Residency,

    /// How the allocation was obtained.
    pub kind: AllocKind,
}

// Bit layout of a packed record.
const THREAD_SHIFT: u32 = 32;
const STATE_SHIFT:  u32 = 40;
const KIND_SHIFT:   u32 = 42;

impl PtrMetadata
{
    /// Pack the record into a single word.
    pub fn pack(self) -> u64
    {
        u64::from(self.size)
            | u64::from(self.thread_id) << THREAD_SHIFT
            | (self.state as u64) << STATE_SHIFT
            | (self.kind as u64) << KIND_SHIFT
    }

    /// Inverse of [`pack`][`Self::pack`].
    pub fn unpack(word: u64) -> Self
    {
        let state = match (word >> STATE_SHIFT) & 0b11 {
            0 => Residency::Resident,
            _ => Residency::Archived,
        };
        let kind = match (word >> KIND_SHIFT) & 0b1 {
            0 => AllocKind::Default,
            _ => AllocKind::MemoryMapped,
        };
        Self{
            size: word as u32,
            thread_id: (word >> THREAD_SHIFT) as u8,
            state,
            kind,
        }
    }
}

/// Atomically readable metadata record.
///
/// Only the residency state ever changes after construction,
/// and only while the owning allocation's migration lock is held exclusively.
pub (crate) struct MetaCell(AtomicU64);

impl MetaCell
{
    pub (crate) fn new(meta: PtrMetadata) -> Self
    {
        Self(AtomicU64::new(meta.pack()))
    }

    pub (crate) fn load(&self) -> PtrMetadata
    {
        PtrMetadata::unpack(self.0.load(Acquire))
    }

    pub (crate) fn set_state(&self, state: Residency)
    {
        let meta = PtrMetadata{state, ..self.load()};
        self.0.store(meta.pack(), Release);
    }
}

/// Small identifier of the calling thread.
///
/// Identifiers are handed out in order of first use and wrap after 256
/// threads, so they are suitable for diagnostics but not for identity.
pub fn thread_id() -> u8
{
    static NEXT: AtomicU8 = AtomicU8::new(0);

    thread_local! {
        static ID: Cell<Option<u8>> = const { Cell::new(None) };
    }

    ID.with(|id| match id.get() {
        Some(id) => id,
        None => {
            let fresh = NEXT.fetch_add(1, Relaxed);
            id.set(Some(fresh));
            fresh
        },
    })
}
