//! Concurrent append logs.
//!
//! Both logs reserve slots by incrementing an atomic tail
//! and then write the reserved slots into a [`BucketArray`].
//! They differ in what [`size`][`AppendLog::size`] promises.
//!
//! [`WriteStalledLog`] keeps a second counter that only advances
//! once every slot below it has been written. A reader that observes
//! a size of `n` also observes the values of all `n` slots.
//!
//! [`RelaxedLog`] reports the tail itself. A reader may observe
//! a reserved slot before it is written, in which case it reads zero.

use {
    crate::{
        Allocation,
        AllocationError,
        ArrayOptions,
        BucketArray,
        DEFAULT_FIRST_BUCKET_SIZE,
        Element,
        IndexError,
        MigrationError,
        PtrMetadata,
        Result,
        Word,
    },
    std::{
        hint,
        ops::Range,
        sync::atomic::{AtomicUsize, Ordering::{AcqRel, Acquire, Relaxed, Release}},
        thread,
    },
};

/// Number of busy iterations before a waiting publisher starts yielding.
const SPIN_LIMIT: u32 = 64;

/// Operations shared by the append logs.
pub trait AppendLog
{
    /// Type of the elements in the log.
    type Element: Element;

    /// Append a value, returning its index.
    fn push_back(&self, value: Self::Element) -> Result<usize>;

    /// Append values to contiguous slots, returning the first index.
    ///
    /// Values appended by other threads do not interleave with these.
    fn push_back_all(&self, values: &[Self::Element]) -> Result<usize>;

    /// Number of elements in the log.
    fn size(&self) -> usize;

    /// Read the element at `index`, which must be below the size.
    fn at(&self, index: usize) -> Result<Self::Element>;
}

/// Write `values` to consecutive indices starting at `start`.
///
/// Every value is written even if an earlier write fails;
/// the first error is returned.
fn write_all<T, const F: usize>(array: &BucketArray<T, F>, start: usize, values: &[T])
    -> Result<()>
    where T: Element
{
    let mut result = Ok(());
    for (index, &value) in (start ..).zip(values) {
        let written = array.set(index, value);
        if result.is_ok() {
            result = written;
        }
    }
    result
}

fn check_size(index: usize, size: usize) -> Result<(), IndexError>
{
    if index < size {
        Ok(())
    } else {
        Err(IndexError{index, bound: size})
    }
}

/* -------------------------------------------------------------------------- */
/*                              Write-stalled log                             */
/* -------------------------------------------------------------------------- */

/// Append log whose size only covers written slots.
pub struct WriteStalledLog<T, const F: usize = DEFAULT_FIRST_BUCKET_SIZE>
{
    array: BucketArray<T, F>,
    tail: AtomicUsize,
    published: AtomicUsize,
}

impl<T, const F: usize> WriteStalledLog<T, F>
    where T: Element
{
    /// Create an empty in-memory log.
    pub fn new() -> Self
    {
        Self::from_array(BucketArray::new())
    }

    /// Create an empty log with the given options.
    pub fn with_options(options: &ArrayOptions) -> Result<Self, AllocationError>
    {
        Ok(Self::from_array(BucketArray::with_options(options)?))
    }

    fn from_array(array: BucketArray<T, F>) -> Self
    {
        Self{array, tail: AtomicUsize::new(0), published: AtomicUsize::new(0)}
    }

    /// Wait until all slots below `start` are published,
    /// then publish the `count` slots from `start`.
    ///
    /// Publishers complete in the order in which they reserved,
    /// so this blocks for as long as any predecessor has not finished writing.
    fn publish(&self, start: usize, count: usize)
    {
        let mut spins = 0;
        while self.published
            .compare_exchange_weak(start, start + count, Release, Relaxed)
            .is_err()
        {
            if spins < SPIN_LIMIT {
                spins += 1;
                hint::spin_loop();
            } else {
                thread::yield_now();
            }
        }
    }

    /// Append a value, returning its index.
    ///
    /// The value becomes visible through [`size`][`Self::size`]
    /// once all values appended before it are visible.
    /// If the write fails, the slot is still published so that
    /// later appends are not blocked forever, and it reads as zero.
    pub fn push_back(&self, value: T) -> Result<usize>
    {
        let index = self.tail.fetch_add(1, Relaxed);
        let written = self.array.set(index, value);
        self.publish(index, 1);
        written.map(|()| index)
    }

    /// Append values to contiguous slots, returning the first index.
    ///
    /// The whole range is published at once.
    pub fn push_back_all(&self, values: &[T]) -> Result<usize>
    {
        let start = self.tail.fetch_add(values.len(), Relaxed);
        if values.is_empty() {
            return Ok(start);
        }
        let written = write_all(&self.array, start, values);
        self.publish(start, values.len());
        written.map(|()| start)
    }

    /// Number of slots that are written, together with all slots below them.
    ///
    /// Slots whose write failed are counted too; they read as zero.
    pub fn size(&self) -> usize
    {
        self.published.load(Acquire)
    }

    /// Number of reserved slots, written or not.
    pub fn reserved(&self) -> usize
    {
        self.tail.load(Relaxed)
    }

    /// Read the element at `index`, which must be below the size.
    pub fn at(&self, index: usize) -> Result<T>
    {
        check_size(index, self.size())?;
        self.array.get(index)
    }

    /// Read the element at `index` regardless of the size.
    pub fn get(&self, index: usize) -> Result<T>
    {
        self.array.get(index)
    }

    /// Write the element at `index` regardless of the size.
    ///
    /// Does not change the size.
    pub fn set(&self, index: usize, value: T) -> Result<()>
    {
        self.array.set(index, value)
    }

    /// The underlying bucket array.
    pub fn array(&self) -> &BucketArray<T, F>
    {
        &self.array
    }

    /// Archive an installed bucket. See [`BucketArray::archive_bucket`].
    pub fn archive_bucket(&self, bucket: usize) -> Result<()>
    {
        self.array.archive_bucket(bucket)
    }

    /// Restore an archived bucket. See [`BucketArray::restore_bucket`].
    pub fn restore_bucket(&self, bucket: usize) -> Result<()>
    {
        self.array.restore_bucket(bucket)
    }

    /// Metadata record of an installed bucket.
    pub fn metadata(&self, bucket: usize) -> Option<PtrMetadata>
    {
        self.array.metadata(bucket)
    }
}

impl<T, const F: usize> Default for WriteStalledLog<T, F>
    where T: Element
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl<T, const F: usize> AppendLog for WriteStalledLog<T, F>
    where T: Element
{
    type Element = T;

    fn push_back(&self, value: T) -> Result<usize>
    {
        WriteStalledLog::push_back(self, value)
    }

    fn push_back_all(&self, values: &[T]) -> Result<usize>
    {
        WriteStalledLog::push_back_all(self, values)
    }

    fn size(&self) -> usize
    {
        WriteStalledLog::size(self)
    }

    fn at(&self, index: usize) -> Result<T>
    {
        WriteStalledLog::at(self, index)
    }
}

/* -------------------------------------------------------------------------- */
/*                                 Relaxed log                                */
/* -------------------------------------------------------------------------- */

/// Append log whose size covers reserved slots.
pub struct RelaxedLog<T, const F: usize = DEFAULT_FIRST_BUCKET_SIZE>
{
    array: BucketArray<T, F>,
    tail: AtomicUsize,
}

impl<T, const F: usize> RelaxedLog<T, F>
    where T: Element
{
    /// Create an empty in-memory log.
    pub fn new() -> Self
    {
        Self{array: BucketArray::new(), tail: AtomicUsize::new(0)}
    }

    /// Create an empty log with the given options.
    pub fn with_options(options: &ArrayOptions) -> Result<Self, AllocationError>
    {
        let array = BucketArray::with_options(options)?;
        Ok(Self{array, tail: AtomicUsize::new(0)})
    }

    /// Reserve `count` contiguous slots without writing them.
    ///
    /// The slots read as zero until written with [`set`][`Self::set`].
    pub fn reserve(&self, count: usize) -> Range<usize>
    {
        let start = self.tail.fetch_add(count, AcqRel);
        start .. start + count
    }

    /// Reserve `count` contiguous slots that all lie below `bound`.
    ///
    /// If they do not fit, no slots are reserved.
    pub fn reserve_within(&self, count: usize, bound: usize)
        -> Result<Range<usize>, IndexError>
    {
        self.tail
            .fetch_update(AcqRel, Acquire, |tail| {
                tail.checked_add(count).filter(|&end| end <= bound)
            })
            .map(|start| start .. start + count)
            .map_err(|tail| IndexError{
                index: tail.saturating_add(count).saturating_sub(1),
                bound,
            })
    }

    /// Grow the size to at least `size`.
    ///
    /// Never shrinks the log. Returns the previous size.
    pub fn ensure_size(&self, size: usize) -> usize
    {
        self.tail.fetch_max(size, AcqRel)
    }

    /// Append a value, returning its index.
    ///
    /// Fails without reserving a slot if the log is full.
    /// If the write itself fails, the reserved slot reads as zero.
    pub fn push_back(&self, value: T) -> Result<usize>
    {
        let Range{start: index, ..} = self.reserve_within(1, self.capacity())?;
        self.array.set(index, value)?;
        Ok(index)
    }

    /// Append values to contiguous slots, returning the first index.
    ///
    /// Fails without reserving any slots if the values do not all fit.
    pub fn push_back_all(&self, values: &[T]) -> Result<usize>
    {
        let Range{start, ..} = self.reserve_within(values.len(), self.capacity())?;
        write_all(&self.array, start, values)?;
        Ok(start)
    }

    /// Number of reserved slots.
    pub fn size(&self) -> usize
    {
        self.tail.load(Acquire)
    }

    /// Read the element at `index`, which must be below the size.
    pub fn at(&self, index: usize) -> Result<T>
    {
        check_size(index, self.size())?;
        self.array.get(index)
    }

    /// Read the element at `index` regardless of the size.
    pub fn get(&self, index: usize) -> Result<T>
    {
        self.array.get(index)
    }

    /// Read the element at `index` without allocating.
    /// See [`BucketArray::peek`].
    pub fn peek(&self, index: usize) -> Option<T>
    {
        self.array.peek(index)
    }

    /// Write the element at `index` regardless of the size.
    ///
    /// Does not change the size.
    pub fn set(&self, index: usize, value: T) -> Result<()>
    {
        self.array.set(index, value)
    }

    /// Maximum number of elements the log can hold.
    pub fn capacity(&self) -> usize
    {
        self.array.capacity()
    }

    /// Number of installed buckets.
    pub fn bucket_count(&self) -> usize
    {
        self.array.installed_buckets()
    }

    /// The installed bucket with the given index, if any.
    pub fn bucket(&self, bucket: usize) -> Option<&Allocation>
    {
        self.array.bucket(bucket)
    }

    /// The underlying bucket array.
    pub fn array(&self) -> &BucketArray<T, F>
    {
        &self.array
    }

    /// Archive an installed bucket. See [`BucketArray::archive_bucket`].
    pub fn archive_bucket(&self, bucket: usize) -> Result<()>
    {
        self.array.archive_bucket(bucket)
    }

    /// Restore an archived bucket. See [`BucketArray::restore_bucket`].
    pub fn restore_bucket(&self, bucket: usize) -> Result<()>
    {
        self.array.restore_bucket(bucket)
    }

    /// Metadata record of an installed bucket.
    pub fn metadata(&self, bucket: usize) -> Option<PtrMetadata>
    {
        self.array.metadata(bucket)
    }

    /// Flush every installed file-backed bucket to disk.
    pub fn sync(&self) -> Result<(), MigrationError>
    {
        self.array.sync()
    }
}

impl<T, const F: usize> RelaxedLog<T, F>
    where T: Word
{
    /// Atomically OR `mask` into the element at `index`.
    ///
    /// Does not change the size.
    pub fn fetch_or(&self, index: usize, mask: T) -> Result<T>
    {
        self.array.fetch_or(index, mask)
    }

    /// Atomically AND `mask` into the element at `index`.
    ///
    /// Does not change the size.
    pub fn fetch_and(&self, index: usize, mask: T) -> Result<T>
    {
        self.array.fetch_and(index, mask)
    }
}

impl<T, const F: usize> Default for RelaxedLog<T, F>
    where T: Element
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl<T, const F: usize> AppendLog for RelaxedLog<T, F>
    where T: Element
{
    type Element = T;

    fn push_back(&self, value: T) -> Result<usize>
    {
        RelaxedLog::push_back(self, value)
    }

    fn push_back_all(&self, values: &[T]) -> Result<usize>
    {
        RelaxedLog::push_back_all(self, values)
    }

    fn size(&self) -> usize
    {
        RelaxedLog::size(self)
    }

    fn at(&self, index: usize) -> Result<T>
    {
        RelaxedLog::at(self, index)
    }
}

#[cfg(test)]
mod tests
{
    use {
        super::*,
        crate::{Error, Residency},
        std::sync::atomic::AtomicBool,
    };

    const PUSHES_PER_THREAD: u64 = 250_000;

    /// Push from several threads and check that every value
    /// lands exactly once, in per-thread order.
    fn check_conservation<L>(make: impl Fn() -> L)
        where L: AppendLog<Element = u64> + Sync
    {
        for threads in 1 ..= 4u64 {
            let log = make();

            thread::scope(|s| {
                for t in 0 .. threads {
                    let log = &log;
                    s.spawn(move || {
                        for i in 0 .. PUSHES_PER_THREAD {
                            log.push_back(t << 32 | i).unwrap();
                        }
                    });
                }
            });

            let total = threads * PUSHES_PER_THREAD;
            assert_eq!(log.size() as u64, total);

            let mut next = vec![0; threads as usize];
            for index in 0 .. total as usize {
                let value = log.at(index).unwrap();
                let (t, i) = ((value >> 32) as usize, value & 0xFFFF_FFFF);
                assert_eq!(i, next[t], "thread {} out of order at {}", t, index);
                next[t] += 1;
            }
            assert!(next.iter().all(|&n| n == PUSHES_PER_THREAD));
        }
    }

    #[test]
    fn write_stalled_conservation()
    {
        check_conservation(WriteStalledLog::<u64>::new);
    }

    #[test]
    fn relaxed_conservation()
    {
        check_conservation(RelaxedLog::<u64>::new);
    }

    #[test]
    fn write_stalled_size_covers_only_written_slots()
    {
        const WRITERS: u64 = 4;
        const PUSHES: u64 = 100_000;

        let log = WriteStalledLog::<u64, 64>::new();
        let done = AtomicBool::new(false);

        thread::scope(|s| {
            let reader = s.spawn(|| {
                let mut checked = 0;
                let mut observations = 0u64;
                loop {
                    let finished = done.load(Acquire);
                    let size = log.size();
                    for index in checked .. size {
                        assert_ne!(log.at(index).unwrap(), 0, "unwritten slot {}", index);
                    }
                    checked = checked.max(size);
                    observations += 1;
                    if finished {
                        return (checked, observations);
                    }
                }
            });

            thread::scope(|w| {
                for t in 0 .. WRITERS {
                    let log = &log;
                    w.spawn(move || {
                        for i in 0 .. PUSHES {
                            log.push_back(t << 32 | (i + 1)).unwrap();
                        }
                    });
                }
            });
            done.store(true, Release);

            let (checked, observations) = reader.join().unwrap();
            assert_eq!(checked as u64, WRITERS * PUSHES);
            assert!(observations > 0);
        });
    }

    #[test]
    fn push_back_all_is_contiguous()
    {
        let log = WriteStalledLog::<u32>::new();
        let batch: Vec<u32> = (1 ..= 100).collect();

        thread::scope(|s| {
            for _ in 0 .. 4 {
                s.spawn(|| log.push_back_all(&batch).unwrap());
            }
        });

        assert_eq!(log.size(), 400);
        for start in (0 .. 400).step_by(100) {
            let run: Vec<u32> =
                (start .. start + 100).map(|i| log.at(i).unwrap()).collect();
            assert_eq!(run, batch);
        }
    }

    #[test]
    fn empty_push_back_all_changes_nothing()
    {
        let log = WriteStalledLog::<u8>::new();
        log.push_back(1).unwrap();
        assert_eq!(log.push_back_all(&[]).unwrap(), 1);
        assert_eq!(log.size(), 1);
        assert_eq!(log.reserved(), 1);
    }

    #[test]
    fn at_checks_size()
    {
        let log = RelaxedLog::<i64>::new();
        log.push_back(-5).unwrap();
        assert_eq!(log.at(0).unwrap(), -5);
        assert!(matches!(
            log.at(1),
            Err(Error::Index(IndexError{index: 1, bound: 1})),
        ));
    }

    #[test]
    fn failed_write_is_still_published()
    {
        let options = ArrayOptions::default().with_bucket_limit(1);
        let log = WriteStalledLog::<u16, 2>::with_options(&options).unwrap();
        log.push_back(1).unwrap();
        log.push_back(2).unwrap();
        assert!(log.push_back(3).is_err());

        // Later appends do not wait forever on the failed slot.
        assert!(log.push_back(4).is_err());
        assert_eq!(log.size(), 4);
    }

    #[test]
    fn reserve_and_ensure_size()
    {
        let log = RelaxedLog::<u32>::new();
        assert_eq!(log.reserve(10), 0 .. 10);
        assert_eq!(log.at(9).unwrap(), 0);
        log.set(9, 99).unwrap();
        assert_eq!(log.at(9).unwrap(), 99);

        assert_eq!(log.ensure_size(5), 10);
        assert_eq!(log.size(), 10);
        assert_eq!(log.ensure_size(20), 10);
        assert_eq!(log.size(), 20);
        assert_eq!(log.push_back(7).unwrap(), 20);
    }

    #[test]
    fn full_relaxed_log_reserves_nothing()
    {
        let options = ArrayOptions::default().with_bucket_limit(1);
        let log = RelaxedLog::<u8, 4>::with_options(&options).unwrap();
        assert_eq!(log.capacity(), 4);

        log.push_back_all(&[1, 2]).unwrap();
        assert!(matches!(
            log.push_back_all(&[3, 4, 5]),
            Err(Error::Index(IndexError{index: 4, bound: 4})),
        ));
        assert_eq!(log.size(), 2);

        assert_eq!(log.push_back(3).unwrap(), 2);
        assert_eq!(log.push_back(4).unwrap(), 3);
        assert!(matches!(
            log.push_back(5),
            Err(Error::Index(IndexError{index: 4, bound: 4})),
        ));
        assert_eq!(log.size(), 4);
        let values: Vec<u8> = (0 .. 4).map(|i| log.at(i).unwrap()).collect();
        assert_eq!(values, [1, 2, 3, 4]);
    }

    #[test]
    fn reserve_within_refuses_overflow()
    {
        let log = RelaxedLog::<u32>::new();
        assert_eq!(log.reserve_within(3, 5).unwrap(), 0 .. 3);
        assert_eq!(log.reserve_within(3, 5), Err(IndexError{index: 5, bound: 5}));
        assert_eq!(log.reserve_within(usize::MAX, usize::MAX).map_err(|e| e.bound),
                   Err(usize::MAX));
        assert_eq!(log.size(), 3);
        assert_eq!(log.reserve_within(2, 5).unwrap(), 3 .. 5);
    }

    #[test]
    fn set_does_not_grow()
    {
        let log = RelaxedLog::<u8>::new();
        log.set(3, 3).unwrap();
        assert_eq!(log.size(), 0);
        assert_eq!(log.get(3).unwrap(), 3);
        assert_eq!(log.peek(3), Some(3));
        assert_eq!(log.bucket_count(), 1);
    }

    #[test]
    fn archived_log_keeps_appending()
    {
        let log = RelaxedLog::<u64, 512>::new();
        for i in 0 .. 512 {
            log.push_back(i).unwrap();
        }
        log.archive_bucket(0).unwrap();
        assert_eq!(log.metadata(0).unwrap().state, Residency::Archived);

        for i in 0 .. 512 {
            log.set(i as usize, i * 2).unwrap();
        }
        log.push_back(1000).unwrap();

        log.restore_bucket(0).unwrap();
        assert_eq!(log.metadata(0).unwrap().state, Residency::Resident);
        for i in 0 .. 512 {
            assert_eq!(log.at(i as usize).unwrap(), i * 2);
        }
        assert_eq!(log.at(512).unwrap(), 1000);
    }
}
