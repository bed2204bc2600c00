//! Lock-free bucketed arrays.
//!
//! A [`BucketArray`] is a table of lazily allocated buckets.
//! Bucket `k` holds `F * 2^k` elements, where `F` is the first bucket size,
//! so the first `n` buckets together hold `F * (2^n - 1)` elements.
//! Index translation is a division, a bit length, and a subtraction.
//!
//! Buckets are installed with a single compare-and-swap on their table slot.
//! A thread that loses the race releases its candidate
//! and uses the bucket installed by the winner.
//! Installed buckets stay until the array is dropped.

use {
    crate::{
        Allocation,
        AllocationError,
        Allocator,
        ArrayOptions,
        DEFAULT_BUCKET_LIMIT,
        IndexError,
        MigrationError,
        PtrMetadata,
        Result,
    },
    std::{
        marker::PhantomData,
        mem::size_of,
        ptr,
        sync::atomic::{
            self,
            AtomicPtr,
            Ordering::{AcqRel, Acquire, Release},
        },
    },
};

/// Number of slots in the bucket table of every array.
pub const MAX_BUCKETS: usize = 64;

/// First bucket size used when none is given.
pub const DEFAULT_FIRST_BUCKET_SIZE: usize = 16;

/// Values that can be stored in buckets.
///
/// Elements are read and written through their atomic counterpart,
/// so that concurrent readers never observe torn values.
///
/// # Safety
///
/// `Atomic` must have the same size and alignment as `Self`,
/// and the all-zero bit pattern must be a valid `Atomic`
/// whose value is the zero of `Self`.
pub unsafe trait Element: Copy + Send + Sync + 'static
{
    /// Atomic type with the same representation.
    type Atomic: Send + Sync;

    /// Atomically load the value in `cell`.
    fn load(cell: &Self::Atomic) -> Self;

    /// Atomically store `value` in `cell`.
    fn store(cell: &Self::Atomic, value: Self);
}

/// Unsigned elements that support atomic bitwise operations.
pub trait Word: Element
{
    /// Number of bits in a word.
    const BITS: u32;

    /// Atomically OR `mask` into `cell`, returning the previous value.
    fn fetch_or(cell: &Self::Atomic, mask: Self) -> Self;

    /// Atomically AND `mask` into `cell`, returning the previous value.
    fn fetch_and(cell: &Self::Atomic, mask: Self) -> Self;
}

macro_rules! element
{
    { $($ty:ty => $atomic:ty,)* } => {
        $(
            // SAFETY: Atomic integers have the same in-memory
            //         representation as the underlying integer type.
            unsafe impl Element for $ty
            {
                type Atomic = $atomic;

                fn load(cell: &$atomic) -> Self
                {
                    cell.load(Acquire)
                }

                fn store(cell: &$atomic, value: Self)
                {
                    cell.store(value, Release)
                }
            }
        )*
    };
}

macro_rules! word
{
    { $($ty:ty,)* } => {
        $(
            impl Word for $ty
            {
                const BITS: u32 = <$ty>::BITS;

                fn fetch_or(cell: &Self::Atomic, mask: Self) -> Self
                {
                    cell.fetch_or(mask, AcqRel)
                }

                fn fetch_and(cell: &Self::Atomic, mask: Self) -> Self
                {
                    cell.fetch_and(mask, AcqRel)
                }
            }
        )*
    };
}

element!
{
    u8    => atomic::AtomicU8,
    u16   => atomic::AtomicU16,
    u32   => atomic::AtomicU32,
    u64   => atomic::AtomicU64,
    usize => atomic::AtomicUsize,
    i8    => atomic::AtomicI8,
    i16   => atomic::AtomicI16,
    i32   => atomic::AtomicI32,
    i64   => atomic::AtomicI64,
    isize => atomic::AtomicIsize,
}

word!
{
    u8, u16, u32, u64, usize,
}

/// Translate an index into a bucket index and an offset within that bucket.
///
/// Returns [`None`] only when the computation overflows,
/// which requires an index close to `usize::MAX` with a first bucket size of 1.
pub fn locate(first_bucket_size: usize, index: usize) -> Option<(usize, usize)>
{
    let hi = (index / first_bucket_size).checked_add(1)?;
    let bucket = hi.ilog2() as usize;
    // The subtrahend never exceeds index, by choice of bucket.
    let offset = index - first_bucket_size * ((1 << bucket) - 1);
    Some((bucket, offset))
}

/// Number of elements in bucket `bucket`, if representable.
pub fn bucket_capacity(first_bucket_size: usize, bucket: usize) -> Option<usize>
{
    let factor = 1usize.checked_shl(u32::try_from(bucket).ok()?)?;
    first_bucket_size.checked_mul(factor)
}

/// Number of elements in the first `buckets` buckets, saturating.
pub fn total_capacity(first_bucket_size: usize, buckets: usize) -> usize
{
    if buckets >= usize::BITS as usize {
        return usize::MAX;
    }
    first_bucket_size.saturating_mul((1usize << buckets) - 1)
}

/// Number of buckets needed to hold `elements` elements.
pub fn buckets_for(first_bucket_size: usize, elements: usize) -> usize
{
    match elements.checked_sub(1) {
        None => 0,
        Some(last) => locate(first_bucket_size, last)
            .map(|(bucket, _)| bucket + 1)
            .unwrap_or(usize::BITS as usize),
    }
}

/// Concurrent array of lazily allocated, exponentially growing buckets.
///
/// All operations take `&self` and may be called from many threads.
/// Reading an index allocates its bucket if necessary,
/// so that file-backed arrays see data written before a restart.
pub struct BucketArray<T, const F: usize = DEFAULT_FIRST_BUCKET_SIZE>
{
    buckets: [AtomicPtr<Allocation>; MAX_BUCKETS],
    bucket_limit: usize,
    allocator: Allocator,
    _element: PhantomData<T>,
}

impl<T, const F: usize> BucketArray<T, F>
    where T: Element
{
    const FIRST_BUCKET_SIZE_IS_POWER_OF_TWO: () =
        assert!(F.is_power_of_two(), "First bucket size must be a power of two");

    /// Create an in-memory array with default options.
    pub fn new() -> Self
    {
        Self::with_allocator(Allocator::in_memory(), DEFAULT_BUCKET_LIMIT)
    }

    /// Create an array with the given options.
    pub fn with_options(options: &ArrayOptions) -> Result<Self, AllocationError>
    {
        let allocator = Allocator::new(options)?;
        Ok(Self::with_allocator(allocator, options.bucket_limit))
    }

    fn with_allocator(allocator: Allocator, bucket_limit: usize) -> Self
    {
        let () = Self::FIRST_BUCKET_SIZE_IS_POWER_OF_TWO;
        Self{
            buckets: [(); MAX_BUCKETS].map(|()| AtomicPtr::new(ptr::null_mut())),
            bucket_limit: bucket_limit.min(MAX_BUCKETS),
            allocator,
            _element: PhantomData,
        }
    }

    /// Number of elements in the first bucket.
    pub const fn first_bucket_size(&self) -> usize
    {
        F
    }

    /// Number of buckets this array may install.
    pub fn bucket_limit(&self) -> usize
    {
        self.bucket_limit
    }

    /// Maximum number of elements this array can address.
    pub fn capacity(&self) -> usize
    {
        total_capacity(F, self.bucket_limit)
    }

    /// The allocator that provides the buckets.
    pub fn allocator(&self) -> &Allocator
    {
        &self.allocator
    }

    /// The installed bucket with the given index, if any.
    pub fn bucket(&self, bucket: usize) -> Option<&Allocation>
    {
        let ptr = self.buckets.get(bucket)?.load(Acquire);
        // SAFETY: Installed buckets live as long as the array.
        unsafe { ptr.as_ref() }
    }

    /// Number of installed buckets.
    pub fn installed_buckets(&self) -> usize
    {
        (0 .. self.bucket_limit).filter(|&k| self.bucket(k).is_some()).count()
    }

    /// Metadata record of an installed bucket.
    pub fn metadata(&self, bucket: usize) -> Option<PtrMetadata>
    {
        self.bucket(bucket).map(Allocation::metadata)
    }

    /// Return bucket `bucket`, installing it first if necessary.
    ///
    /// Concurrent callers all receive the same bucket.
    pub fn ensure_bucket(&self, bucket: usize) -> Result<&Allocation>
    {
        if bucket >= self.bucket_limit {
            return Err(IndexError{index: bucket, bound: self.bucket_limit}.into());
        }

        if let Some(installed) = self.bucket(bucket) {
            return Ok(installed);
        }

        let size = bucket_capacity(F, bucket)
            .and_then(|elements| elements.checked_mul(size_of::<T>()))
            .ok_or(AllocationError::TooLarge(usize::MAX))?;
        let candidate = Box::into_raw(Box::new(
            self.allocator.allocate(bucket, size)?
        ));

        let slot = &self.buckets[bucket];
        match slot.compare_exchange(ptr::null_mut(), candidate, AcqRel, Acquire) {
            Ok(_) => {
                tracing::debug!(bucket, size, "Installed bucket");
                // SAFETY: Installed buckets live as long as the array.
                Ok(unsafe { &*candidate })
            },
            Err(winner) => {
                tracing::trace!(bucket, "Lost bucket installation race");
                // SAFETY: The candidate was never shared.
                drop(unsafe { Box::from_raw(candidate) });
                // SAFETY: Installed buckets live as long as the array.
                Ok(unsafe { &*winner })
            },
        }
    }

    /// Bounds check an index and translate it.
    fn translate(&self, index: usize) -> Result<(usize, usize), IndexError>
    {
        match locate(F, index) {
            Some((bucket, offset)) if bucket < self.bucket_limit =>
                Ok((bucket, offset)),
            _ => Err(IndexError{index, bound: self.capacity()}),
        }
    }

    /// The bucket and the cell for an index, installing the bucket if needed.
    fn cell(&self, index: usize) -> Result<(&Allocation, &T::Atomic)>
    {
        let (bucket, offset) = self.translate(index)?;
        let allocation = self.ensure_bucket(bucket)?;
        // SAFETY: The bucket holds bucket_capacity(F, bucket) elements,
        //         offset is less than that, and the mapping is suitably
        //         aligned because it is page-aligned.
        let cell = unsafe {
            &*allocation.as_ptr().as_ptr().cast::<T::Atomic>().add(offset)
        };
        Ok((allocation, cell))
    }

    /// Read the element at `index`.
    pub fn get(&self, index: usize) -> Result<T>
    {
        let (_, cell) = self.cell(index)?;
        Ok(T::load(cell))
    }

    /// Write the element at `index`.
    pub fn set(&self, index: usize, value: T) -> Result<()>
    {
        let (allocation, cell) = self.cell(index)?;
        let _pin = allocation.pin();
        T::store(cell, value);
        Ok(())
    }

    /// Read the element at `index`, which must be below the capacity.
    ///
    /// Equivalent to [`get`][`Self::get`].
    pub fn at(&self, index: usize) -> Result<T>
    {
        self.get(index)
    }

    /// Read the element at `index` without installing its bucket.
    ///
    /// Returns [`None`] if the index is out of range
    /// or its bucket has not been installed.
    pub fn peek(&self, index: usize) -> Option<T>
    {
        let (bucket, offset) = self.translate(index).ok()?;
        let allocation = self.bucket(bucket)?;
        // SAFETY: See cell.
        let cell = unsafe {
            &*allocation.as_ptr().as_ptr().cast::<T::Atomic>().add(offset)
        };
        Some(T::load(cell))
    }

    /// Archive an installed bucket.
    ///
    /// Buckets that are not installed are left alone.
    pub fn archive_bucket(&self, bucket: usize) -> Result<()>
    {
        self.migrate(bucket, Allocator::archive)
    }

    /// Restore an archived bucket to resident memory.
    ///
    /// Buckets that are not installed are left alone.
    pub fn restore_bucket(&self, bucket: usize) -> Result<()>
    {
        self.migrate(bucket, Allocator::restore)
    }

    fn migrate<M>(&self, bucket: usize, migration: M) -> Result<()>
        where M: FnOnce(&Allocator, &Allocation) -> Result<(), MigrationError>
    {
        if bucket >= self.bucket_limit {
            return Err(IndexError{index: bucket, bound: self.bucket_limit}.into());
        }
        match self.bucket(bucket) {
            Some(allocation) => Ok(migration(&self.allocator, allocation)?),
            None => Ok(()),
        }
    }

    /// Flush every installed file-backed bucket to disk.
    pub fn sync(&self) -> Result<(), MigrationError>
    {
        (0 .. self.bucket_limit)
            .filter_map(|k| self.bucket(k))
            .try_for_each(|allocation| self.allocator.sync(allocation))
    }
}

impl<T, const F: usize> BucketArray<T, F>
    where T: Word
{
    /// Atomically OR `mask` into the element at `index`.
    ///
    /// Returns the previous value.
    pub fn fetch_or(&self, index: usize, mask: T) -> Result<T>
    {
        let (allocation, cell) = self.cell(index)?;
        let _pin = allocation.pin();
        Ok(T::fetch_or(cell, mask))
    }

    /// Atomically AND `mask` into the element at `index`.
    ///
    /// Returns the previous value.
    pub fn fetch_and(&self, index: usize, mask: T) -> Result<T>
    {
        let (allocation, cell) = self.cell(index)?;
        let _pin = allocation.pin();
        Ok(T::fetch_and(cell, mask))
    }
}

impl<T, const F: usize> Default for BucketArray<T, F>
    where T: Element
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl<T, const F: usize> Drop for BucketArray<T, F>
{
    fn drop(&mut self)
    {
        for slot in &mut self.buckets {
            let ptr = *slot.get_mut();
            if !ptr.is_null() {
                // SAFETY: The bucket was installed by ensure_bucket
                //         and nothing can reference it anymore.
                drop(unsafe { Box::from_raw(ptr) });
            }
        }
    }
}

#[cfg(test)]
mod tests
{
    use {
        super::*,
        crate::{Error, Residency},
        os_ext::mkdtemp,
        proptest::proptest,
        scope_exit::scope_exit,
        std::{fs::remove_dir_all, path::Path, sync::Barrier, thread},
    };

    const N: usize = 1024 * 1024;

    #[test]
    fn locate_first_buckets()
    {
        assert_eq!(locate(16, 0), Some((0, 0)));
        assert_eq!(locate(16, 15), Some((0, 15)));
        assert_eq!(locate(16, 16), Some((1, 0)));
        assert_eq!(locate(16, 47), Some((1, 31)));
        assert_eq!(locate(16, 48), Some((2, 0)));
        assert_eq!(locate(1, usize::MAX), None);
    }

    #[test]
    fn buckets_for_covers_elements()
    {
        assert_eq!(buckets_for(8, 0), 0);
        assert_eq!(buckets_for(8, 8), 1);
        assert_eq!(buckets_for(8, 9), 2);
        assert_eq!(buckets_for(8, 1024 * 1024), 17);
        assert!(total_capacity(8, 17) >= 1024 * 1024);
        assert!(total_capacity(8, 16) < 1024 * 1024);
    }

    proptest!
    {
        #[test]
        fn locate_agrees_with_cumulative_capacity(
            first_exp in 0u32 .. 10,
            index in 0usize .. 1 << 40,
        )
        {
            let first = 1usize << first_exp;
            let (bucket, offset) = locate(first, index).unwrap();
            assert!(offset < bucket_capacity(first, bucket).unwrap());
            assert_eq!(total_capacity(first, bucket) + offset, index);
        }
    }

    #[test]
    fn random_access_round_trip()
    {
        let array = BucketArray::<u64>::new();
        for i in 0 .. N {
            array.set(i, i as u64).unwrap();
        }
        for i in 0 .. N {
            assert_eq!(array.get(i).unwrap(), i as u64);
        }
        assert_eq!(array.installed_buckets(), buckets_for(16, N));
    }

    #[test]
    fn unset_elements_read_as_zero()
    {
        let array = BucketArray::<i32, 4>::new();
        assert_eq!(array.peek(100), None);
        assert_eq!(array.get(100).unwrap(), 0);
        assert_eq!(array.peek(100), Some(0));
    }

    #[test]
    fn index_beyond_capacity_is_rejected()
    {
        let options = ArrayOptions::default().with_bucket_limit(3);
        let array = BucketArray::<u16, 2>::with_options(&options).unwrap();
        assert_eq!(array.capacity(), 14);
        array.set(13, 1).unwrap();
        let err = array.at(14).unwrap_err();
        assert!(matches!(err, Error::Index(IndexError{index: 14, bound: 14})));
        assert!(array.set(14, 1).is_err());
        assert_eq!(array.installed_buckets(), 1);
    }

    #[test]
    fn oversized_bucket_leaves_slot_empty()
    {
        let options = ArrayOptions::default().with_bucket_limit(MAX_BUCKETS);
        let array = BucketArray::<u64>::with_options(&options).unwrap();
        // Bucket 30 would need 16 * 2^30 * 8 bytes.
        let index = total_capacity(16, 30);
        assert!(matches!(
            array.set(index, 1),
            Err(Error::Allocation(AllocationError::TooLarge(_))),
        ));
        assert!(array.bucket(30).is_none());
    }

    #[test]
    fn concurrent_first_touch_installs_one_bucket()
    {
        const THREADS: usize = 8;
        let array = BucketArray::<u64>::new();
        let barrier = Barrier::new(THREADS);

        let seen: Vec<usize> = thread::scope(|s| {
            let handles: Vec<_> = (0 .. THREADS).map(|t| {
                let (array, barrier) = (&array, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    // All indices fall into bucket 5.
                    array.set(16 * 31 + t, t as u64).unwrap();
                    array.bucket(5).unwrap().as_ptr().as_ptr() as usize
                })
            }).collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(seen.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(array.installed_buckets(), 1);
        for t in 0 .. THREADS {
            assert_eq!(array.get(16 * 31 + t).unwrap(), t as u64);
        }
    }

    #[test]
    fn archive_bucket_round_trip()
    {
        let dir = mkdtemp(Path::new("/tmp/floe-test-XXXXXX")).unwrap();
        scope_exit! { let _ = remove_dir_all(&dir); }

        let options = ArrayOptions::default().with_directory(&dir);
        let array = BucketArray::<u32>::with_options(&options).unwrap();
        for i in 0 .. 10_000 {
            array.set(i, i as u32 * 3).unwrap();
        }

        for k in 0 .. array.bucket_limit() {
            array.archive_bucket(k).unwrap();
        }
        for k in 0 .. array.installed_buckets() {
            assert_eq!(array.metadata(k).unwrap().state, Residency::Archived);
        }
        for i in 0 .. 10_000 {
            assert_eq!(array.get(i).unwrap(), i as u32 * 3);
        }

        // Archived buckets remain writable.
        array.set(7, 7).unwrap();
        array.restore_bucket(0).unwrap();
        assert_eq!(array.metadata(0).unwrap().state, Residency::Resident);
        assert_eq!(array.get(7).unwrap(), 7);
        assert_eq!(array.get(9_999).unwrap(), 9_999 * 3);
    }

    #[test]
    fn archive_during_concurrent_writes_loses_nothing()
    {
        let dir = mkdtemp(Path::new("/tmp/floe-test-XXXXXX")).unwrap();
        scope_exit! { let _ = remove_dir_all(&dir); }

        let options = ArrayOptions::default().with_directory(&dir);
        let array = BucketArray::<u64, 1024>::with_options(&options).unwrap();
        array.ensure_bucket(0).unwrap();

        thread::scope(|s| {
            s.spawn(|| {
                for i in 0 .. 1024 {
                    array.set(i, i as u64 + 1).unwrap();
                }
            });
            s.spawn(|| {
                for _ in 0 .. 16 {
                    array.archive_bucket(0).unwrap();
                    array.restore_bucket(0).unwrap();
                }
            });
        });

        for i in 0 .. 1024 {
            assert_eq!(array.get(i).unwrap(), i as u64 + 1);
        }
    }
}
