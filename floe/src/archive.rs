//! Bucket allocation and archival.
//!
//! Buckets are always obtained through mmap(2), so that every bucket
//! occupies a page-aligned address range owned exclusively by its
//! [`Allocation`]. This is what makes archival possible without changing
//! the address of the bucket: archiving writes the contents of the bucket
//! to a file and maps that file over the very same range with `MAP_FIXED`,
//! and restoring moves fresh anonymous memory back over it with mremap(2).
//! Pointers into the bucket therefore remain valid across migrations.
//!
//! # Locking
//!
//! Each allocation has a migration lock.
//! Migrations hold it exclusively for the duration of the copy and remap.
//! Element writes hold it shared (see [`Allocation::pin`]),
//! so no write can slip in between the copy and the remap and be lost.
//! Element reads take no lock: the kernel replaces the mapping atomically
//! with respect to page faults, and both mappings hold the same bytes.

use {
    crate::{
        AllocKind,
        AllocationError,
        ArrayOptions,
        MigrationError,
        PtrMetadata,
        Residency,
        meta::{MetaCell, thread_id},
    },
    os_ext::{
        MAP_ANONYMOUS, MAP_FIXED, MAP_PRIVATE, MAP_SHARED, MS_SYNC,
        O_CREAT, O_EXCL, O_RDWR, PROT_READ, PROT_WRITE,
        fstat, ftruncate, mkdirat, mmap, mremap_fixed, msync, munmap, open,
        pwrite_all, unlinkat,
    },
    std::{
        env,
        io::{self, ErrorKind::AlreadyExists},
        mem,
        os::unix::io::AsFd,
        path::{Path, PathBuf},
        process,
        ptr::{self, NonNull},
        slice,
        sync::{
            PoisonError,
            RwLock,
            RwLockReadGuard,
            atomic::{AtomicU64, Ordering::Relaxed},
        },
    },
};

const PROT_RW: libc::c_int = PROT_READ | PROT_WRITE;

/// Allocates buckets and migrates them between memory and disk.
///
/// Each array owns one allocator.
/// The allocator knows where backing files go and how to name them.
#[derive(Debug)]
pub struct Allocator
{
    directory: PathBuf,
    name: String,
    kind: AllocKind,
}

/// What currently backs an allocation.
#[derive(Debug)]
enum Backing
{
    /// Anonymous memory.
    Anonymous,

    /// An archive file created by [`Allocator::archive`].
    ///
    /// Deleted when the allocation is restored or released.
    Scratch(PathBuf),

    /// A persistent backing file. Never deleted by this crate.
    File(PathBuf),
}

/// Handle to the memory of one bucket.
///
/// The handle owns the mapping and carries the metadata record
/// of the allocation. Dropping the handle releases the mapping.
pub struct Allocation
{
    ptr: NonNull<u8>,
    len: usize,
    bucket: usize,
    meta: MetaCell,
    migration: RwLock<Backing>,
}

// SAFETY: The mapping is owned by the allocation and only accessed through
//         atomics or under the migration lock.
unsafe impl Send for Allocation { }
unsafe impl Sync for Allocation { }

/// Held while writing to an allocation.
///
/// Prevents the allocation from migrating until dropped.
pub struct Pin<'a>
{
    _guard: RwLockReadGuard<'a, Backing>,
}

impl Allocator
{
    /// Create an allocator from array options.
    ///
    /// For file-backed allocators, the directory is created if missing.
    pub fn new(options: &ArrayOptions) -> Result<Self, AllocationError>
    {
        let name = match &options.name {
            Some(name) => name.clone(),
            None => unique_name(),
        };

        if options.kind == AllocKind::MemoryMapped {
            mkdirat(None, &options.directory, 0o755)
                .or_else(ok_if_already_exists)
                .map_err(|source| AllocationError::File{
                    path: options.directory.clone(),
                    source,
                })?;
        }

        Ok(Self{directory: options.directory.clone(), name, kind: options.kind})
    }

    /// Create an allocator for anonymous buckets
    /// that archives to the temporary directory.
    pub fn in_memory() -> Self
    {
        Self{directory: env::temp_dir(), name: unique_name(), kind: AllocKind::Default}
    }

    /// The name from which backing file names are derived.
    pub fn name(&self) -> &str
    {
        &self.name
    }

    /// How this allocator obtains memory.
    pub fn kind(&self) -> AllocKind
    {
        self.kind
    }

    /// Path of the persistent backing file for a bucket.
    pub fn bucket_path(&self, bucket: usize) -> PathBuf
    {
        self.directory.join(format!("{}_{}.bucket", self.name, bucket))
    }

    /// Path of the archive file for a bucket.
    ///
    /// Archiving fails with [`MigrationError::File`]
    /// if this file already belongs to another allocator with the same name.
    pub fn archive_path(&self, bucket: usize) -> PathBuf
    {
        self.directory.join(format!("{}_{}.archive", self.name, bucket))
    }

    /// Allocate `size` zeroed bytes for the given bucket.
    ///
    /// Memory-mapped allocations reuse an existing backing file
    /// with the same name if it has the right length,
    /// so their contents survive restarts.
    pub fn allocate(&self, bucket: usize, size: usize)
        -> Result<Allocation, AllocationError>
    {
        if size == 0 {
            return Err(AllocationError::Empty);
        }
        let size32 = u32::try_from(size)
            .map_err(|_| AllocationError::TooLarge(size))?;

        let (ptr, backing) = match self.kind {
            AllocKind::Default => (map_anonymous(size)?, Backing::Anonymous),
            AllocKind::MemoryMapped => {
                let path = self.bucket_path(bucket);
                let ptr = map_file(&path, size)?;
                (ptr, Backing::File(path))
            },
        };

        let meta = PtrMetadata{
            size: size32,
            thread_id: thread_id(),
            state: Residency::Resident,
            kind: self.kind,
        };

        tracing::trace!(bucket, size, kind = ?self.kind, "Allocated bucket");

        Ok(Allocation{
            ptr,
            len: size,
            bucket,
            meta: MetaCell::new(meta),
            migration: RwLock::new(backing),
        })
    }

    /// The metadata record of an allocation.
    pub fn metadata_of(&self, allocation: &Allocation) -> PtrMetadata
    {
        allocation.metadata()
    }

    /// Move a resident allocation to a file-backed mapping.
    ///
    /// The allocation keeps its address. Does nothing if already archived.
    /// Anonymous allocations are copied into a fresh archive file
    /// that is mapped over the allocation. File-backed allocations
    /// are already on disk; they are flushed.
    pub fn archive(&self, allocation: &Allocation) -> Result<(), MigrationError>
    {
        let mut backing = allocation.migration.write()
            .unwrap_or_else(PoisonError::into_inner);

        if allocation.metadata().state == Residency::Archived {
            return Ok(());
        }

        if let Backing::Anonymous = *backing {
            let path = self.archive_path(allocation.bucket);
            // SAFETY: Writers are excluded by the migration lock.
            unsafe { remap_to_file(allocation.ptr, allocation.len, &path)?; }
            *backing = Backing::Scratch(path);
        } else {
            // SAFETY: The range is mapped for as long as the allocation lives.
            unsafe { msync(allocation.ptr, allocation.len, MS_SYNC) }
                .map_err(MigrationError::Sync)?;
        }

        allocation.meta.set_state(Residency::Archived);
        tracing::debug!(bucket = allocation.bucket, size = allocation.len,
                        "Archived bucket");
        Ok(())
    }

    /// Move an archived allocation back to resident memory.
    ///
    /// The allocation keeps its address. Does nothing if already resident.
    /// The archive file of an anonymous allocation is deleted.
    /// File-backed allocations stay mapped to their backing file.
    pub fn restore(&self, allocation: &Allocation) -> Result<(), MigrationError>
    {
        let mut backing = allocation.migration.write()
            .unwrap_or_else(PoisonError::into_inner);

        if allocation.metadata().state == Residency::Resident {
            return Ok(());
        }

        if let Backing::Scratch(..) = *backing {
            // SAFETY: Writers are excluded by the migration lock.
            unsafe { remap_to_anonymous(allocation.ptr, allocation.len)?; }
            if let Backing::Scratch(path) =
                mem::replace(&mut *backing, Backing::Anonymous)
            {
                remove_scratch(&path);
            }
        }

        allocation.meta.set_state(Residency::Resident);
        tracing::debug!(bucket = allocation.bucket, size = allocation.len,
                        "Restored bucket");
        Ok(())
    }

    /// Flush a file-backed allocation to disk.
    ///
    /// Anonymous allocations have nothing to flush.
    pub fn sync(&self, allocation: &Allocation) -> Result<(), MigrationError>
    {
        let backing = allocation.migration.read()
            .unwrap_or_else(PoisonError::into_inner);
        if let Backing::Anonymous = *backing {
            return Ok(());
        }
        // SAFETY: The range is mapped for as long as the allocation lives.
        unsafe { msync(allocation.ptr, allocation.len, MS_SYNC) }
            .map_err(MigrationError::Sync)
    }
}

impl Allocation
{
    /// Address of the first byte of the allocation.
    ///
    /// The address never changes, not even across migrations.
    pub fn as_ptr(&self) -> NonNull<u8>
    {
        self.ptr
    }

    /// Size of the allocation in bytes.
    pub fn len(&self) -> usize
    {
        self.len
    }

    /// Allocations are never empty.
    pub fn is_empty(&self) -> bool
    {
        false
    }

    /// Index of the bucket this allocation was made for.
    pub fn bucket(&self) -> usize
    {
        self.bucket
    }

    /// The metadata record of this allocation.
    pub fn metadata(&self) -> PtrMetadata
    {
        self.meta.load()
    }

    /// Prevent migration while writing.
    pub fn pin(&self) -> Pin<'_>
    {
        let guard = self.migration.read().unwrap_or_else(PoisonError::into_inner);
        Pin{_guard: guard}
    }
}

impl Drop for Allocation
{
    fn drop(&mut self)
    {
        // SAFETY: Nothing can reference the allocation anymore.
        if let Err(err) = unsafe { munmap(self.ptr, self.len) } {
            tracing::warn!(bucket = self.bucket, error = %err,
                           "Failed to unmap bucket");
        }

        let backing = self.migration.get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        match backing {
            Backing::Anonymous => { },
            Backing::Scratch(path) => remove_scratch(path),
            Backing::File(path) =>
                tracing::trace!(path = %path.display(), "Detached backing file"),
        }
    }
}

/// Generate an allocator name unique within this process.
fn unique_name() -> String
{
    static NEXT: AtomicU64 = AtomicU64::new(0);
    format!("floe-{}-{}", process::id(), NEXT.fetch_add(1, Relaxed))
}

fn ok_if_already_exists(err: io::Error) -> io::Result<()>
{
    if err.kind() == AlreadyExists {
        Ok(())
    } else {
        Err(err)
    }
}

fn remove_scratch(path: &Path)
{
    if let Err(err) = unlinkat(None, path, 0) {
        tracing::warn!(path = %path.display(), error = %err,
                       "Failed to remove archive file");
    }
}

/// Map `len` zeroed bytes of anonymous memory.
fn map_anonymous(len: usize) -> Result<NonNull<u8>, AllocationError>
{
    let flags = MAP_PRIVATE | MAP_ANONYMOUS;
    // SAFETY: No MAP_FIXED, so nothing is replaced.
    unsafe { mmap(None, len, PROT_RW, flags, None, 0) }
        .map_err(|source| AllocationError::Map{len, source})
}

/// Map the file at `path`, creating or resizing it to `len` bytes.
fn map_file(path: &Path, len: usize) -> Result<NonNull<u8>, AllocationError>
{
    let file_error = |source| AllocationError::File{path: path.into(), source};

    let fd = open(path, O_CREAT | O_RDWR, 0o644).map_err(file_error)?;

    // Existing files of the right length are reattached as they are.
    let stat = fstat(fd.as_fd()).map_err(file_error)?;
    if stat.st_size as u64 != len as u64 {
        ftruncate(fd.as_fd(), len as u64).map_err(file_error)?;
    }

    // SAFETY: No MAP_FIXED, so nothing is replaced.
    unsafe { mmap(None, len, PROT_RW, MAP_SHARED, Some(fd.as_fd()), 0) }
        .map_err(|source| AllocationError::Map{len, source})
}

/// Copy `len` bytes at `ptr` into a new file at `path`
/// and map that file over `ptr`.
///
/// Fails if `path` already exists, which happens when two allocators
/// share a name and a directory.
/// On failure the original mapping is untouched,
/// and a file created by this call is removed.
///
/// # Safety
///
/// `ptr` must be an owned mapping of `len` bytes that is not being written.
unsafe fn remap_to_file(ptr: NonNull<u8>, len: usize, path: &Path)
    -> Result<(), MigrationError>
{
    let fd = open(path, O_CREAT | O_EXCL | O_RDWR, 0o600)
        .map_err(|source| MigrationError::File{path: path.into(), source})?;
    let cleanup = scope_exit::guard(|| { let _ = unlinkat(None, path, 0); });

    let write_error = |source| MigrationError::Write{path: path.into(), source};
    ftruncate(fd.as_fd(), len as u64).map_err(write_error)?;
    let contents = slice::from_raw_parts(ptr.as_ptr(), len);
    pwrite_all(fd.as_fd(), contents, 0).map_err(write_error)?;

    let flags = MAP_SHARED | MAP_FIXED;
    mmap(Some(ptr), len, PROT_RW, flags, Some(fd.as_fd()), 0)
        .map_err(MigrationError::Map)?;

    cleanup.dismiss();
    Ok(())
}

/// Move a copy of the `len` bytes at `ptr` into anonymous memory at `ptr`.
///
/// On failure the original mapping is untouched.
///
/// # Safety
///
/// `ptr` must be an owned mapping of `len` bytes that is not being written.
unsafe fn remap_to_anonymous(ptr: NonNull<u8>, len: usize)
    -> Result<(), MigrationError>
{
    let flags = MAP_PRIVATE | MAP_ANONYMOUS;
    let fresh = mmap(None, len, PROT_RW, flags, None, 0)
        .map_err(MigrationError::Map)?;
    let cleanup = scope_exit::guard(|| { let _ = unsafe { munmap(fresh, len) }; });

    ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), len);
    mremap_fixed(fresh, ptr, len).map_err(MigrationError::Map)?;

    cleanup.dismiss();
    Ok(())
}
