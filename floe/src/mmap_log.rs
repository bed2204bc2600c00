//! Append logs backed by named files.

use {
    crate::{
        AllocKind,
        AllocationError,
        AppendLog,
        ArrayOptions,
        Element,
        IndexError,
        MigrationError,
        PtrMetadata,
        RelaxedLog,
        Result,
        buckets_for,
    },
    std::path::PathBuf,
};

/// Relaxed append log whose buckets are shared mappings of files.
///
/// Bucket `k` lives in the file `{name}_{k}.bucket` in the directory
/// of the log, sized to exactly the byte capacity of the bucket.
/// Opening a log with the same name and directory again
/// reattaches to the existing files, so element values survive restarts.
/// The size does not: callers that track it restore it with
/// [`ensure_size`][`Self::ensure_size`].
///
/// At most `MAX_ELEMENTS` elements can be stored.
pub struct MmapLog<T, const F: usize, const MAX_ELEMENTS: usize>
{
    log: RelaxedLog<T, F>,
}

impl<T, const F: usize, const MAX_ELEMENTS: usize> MmapLog<T, F, MAX_ELEMENTS>
    where T: Element
{
    /// Open the log with the given name in the given directory.
    ///
    /// The directory is created if it does not exist.
    pub fn open(name: &str, directory: impl Into<PathBuf>)
        -> Result<Self, AllocationError>
    {
        let options = ArrayOptions::default()
            .with_name(name)
            .with_directory(directory);
        Self::with_options(options)
    }

    /// Open a log with the given options.
    ///
    /// The kind and bucket limit of the options are overridden.
    pub fn with_options(options: ArrayOptions) -> Result<Self, AllocationError>
    {
        let options = options
            .with_kind(AllocKind::MemoryMapped)
            .with_bucket_limit(buckets_for(F, MAX_ELEMENTS));
        let log = RelaxedLog::with_options(&options)?;
        tracing::debug!(
            log_name = log.array().allocator().name(),
            directory = %options.directory.display(),
            buckets = options.bucket_limit,
            "Opened memory-mapped log"
        );
        Ok(Self{log})
    }

    fn check_index(index: usize) -> Result<(), IndexError>
    {
        if index < MAX_ELEMENTS {
            Ok(())
        } else {
            Err(IndexError{index, bound: MAX_ELEMENTS})
        }
    }

    /// Append a value, returning its index.
    ///
    /// Fails without reserving a slot if the log is full.
    pub fn push_back(&self, value: T) -> Result<usize>
    {
        let index = self.log.reserve_within(1, MAX_ELEMENTS)?.start;
        self.log.set(index, value)?;
        Ok(index)
    }

    /// Append values to contiguous slots, returning the first index.
    ///
    /// Nothing is reserved or written if the values do not all fit.
    pub fn push_back_all(&self, values: &[T]) -> Result<usize>
    {
        let slots = self.log.reserve_within(values.len(), MAX_ELEMENTS)?;
        for (index, &value) in slots.clone().zip(values) {
            self.log.set(index, value)?;
        }
        Ok(slots.start)
    }

    /// Number of elements in the log.
    pub fn size(&self) -> usize
    {
        self.log.size().min(MAX_ELEMENTS)
    }

    /// Grow the size to at least `size`, returning the previous size.
    pub fn ensure_size(&self, size: usize) -> Result<usize>
    {
        if size > MAX_ELEMENTS {
            return Err(IndexError{index: size - 1, bound: MAX_ELEMENTS}.into());
        }
        Ok(self.log.ensure_size(size).min(MAX_ELEMENTS))
    }

    /// Read the element at `index`, which must be below the size.
    pub fn at(&self, index: usize) -> Result<T>
    {
        let size = self.size();
        if index >= size {
            return Err(IndexError{index, bound: size}.into());
        }
        self.log.get(index)
    }

    /// Read the element at `index` regardless of the size.
    pub fn get(&self, index: usize) -> Result<T>
    {
        Self::check_index(index)?;
        self.log.get(index)
    }

    /// Write the element at `index` regardless of the size.
    pub fn set(&self, index: usize, value: T) -> Result<()>
    {
        Self::check_index(index)?;
        self.log.set(index, value)
    }

    /// Maximum number of elements.
    pub const fn capacity(&self) -> usize
    {
        MAX_ELEMENTS
    }

    /// Number of installed buckets.
    pub fn bucket_count(&self) -> usize
    {
        self.log.bucket_count()
    }

    /// Metadata record of an installed bucket.
    pub fn metadata(&self, bucket: usize) -> Option<PtrMetadata>
    {
        self.log.metadata(bucket)
    }

    /// Flush an installed bucket to its file and mark it archived.
    pub fn archive_bucket(&self, bucket: usize) -> Result<()>
    {
        self.log.archive_bucket(bucket)
    }

    /// Mark an archived bucket resident again.
    pub fn restore_bucket(&self, bucket: usize) -> Result<()>
    {
        self.log.restore_bucket(bucket)
    }

    /// Flush every installed bucket to its file.
    pub fn sync(&self) -> Result<(), MigrationError>
    {
        self.log.sync()
    }

    /// The underlying relaxed log.
    pub fn log(&self) -> &RelaxedLog<T, F>
    {
        &self.log
    }
}

impl<T, const F: usize, const MAX_ELEMENTS: usize> AppendLog
    for MmapLog<T, F, MAX_ELEMENTS>
    where T: Element
{
    type Element = T;

    fn push_back(&self, value: T) -> Result<usize>
    {
        MmapLog::push_back(self, value)
    }

    fn push_back_all(&self, values: &[T]) -> Result<usize>
    {
        MmapLog::push_back_all(self, values)
    }

    fn size(&self) -> usize
    {
        MmapLog::size(self)
    }

    fn at(&self, index: usize) -> Result<T>
    {
        MmapLog::at(self, index)
    }
}

#[cfg(test)]
mod tests
{
    use {
        super::*,
        crate::{Error, Residency},
        os_ext::mkdtemp,
        scope_exit::scope_exit,
        std::{fs::{metadata, remove_dir_all}, path::Path, thread},
    };

    type Log = MmapLog<u64, 16, 10_000>;

    fn temp_dir() -> PathBuf
    {
        mkdtemp(Path::new("/tmp/floe-mmap-log-XXXXXX")).unwrap()
    }

    #[test]
    fn bucket_limit_covers_max_elements()
    {
        let dir = temp_dir();
        scope_exit! { let _ = remove_dir_all(&dir); }

        let log = Log::open("limit", &dir).unwrap();
        assert_eq!(log.log().array().bucket_limit(), buckets_for(16, 10_000));
        assert!(log.log().capacity() >= log.capacity());
    }

    #[test]
    fn round_trip_creates_one_file_per_bucket()
    {
        let dir = temp_dir();
        scope_exit! { let _ = remove_dir_all(&dir); }

        let log = Log::open("ticks", &dir).unwrap();
        for i in 0 .. 100 {
            assert_eq!(log.push_back(i * 3).unwrap(), i as usize);
        }
        for i in 0 .. 100 {
            assert_eq!(log.at(i as usize).unwrap(), i * 3);
        }

        // Indices 0 .. 100 span buckets 0 through 2.
        assert_eq!(log.bucket_count(), 3);
        for bucket in 0 .. 3 {
            let path = dir.join(format!("ticks_{}.bucket", bucket));
            let expected = (16u64 << bucket) * 8;
            assert_eq!(metadata(&path).unwrap().len(), expected);
            assert_eq!(log.metadata(bucket).unwrap().kind, AllocKind::MemoryMapped);
        }
    }

    #[test]
    fn reopening_reattaches_to_existing_files()
    {
        let dir = temp_dir();
        scope_exit! { let _ = remove_dir_all(&dir); }

        {
            let log = Log::open("orders", &dir).unwrap();
            let values: Vec<u64> = (1 ..= 1000).collect();
            log.push_back_all(&values).unwrap();
            log.sync().unwrap();
        }

        let log = Log::open("orders", &dir).unwrap();
        assert_eq!(log.size(), 0);
        assert_eq!(log.ensure_size(1000).unwrap(), 0);
        for i in 0 .. 1000 {
            assert_eq!(log.at(i).unwrap(), i as u64 + 1);
        }
        assert_eq!(log.push_back(5000).unwrap(), 1000);
    }

    #[test]
    fn indices_beyond_max_elements_are_rejected()
    {
        let dir = temp_dir();
        scope_exit! { let _ = remove_dir_all(&dir); }

        let log = MmapLog::<u32, 4, 10>::open("small", &dir).unwrap();
        for i in 0 .. 10 {
            log.push_back(i).unwrap();
        }
        assert!(matches!(
            log.push_back(10),
            Err(Error::Index(IndexError{index: 10, bound: 10})),
        ));
        assert!(log.get(10).is_err());
        assert!(log.set(12, 0).is_err());
        assert!(log.ensure_size(11).is_err());
        assert!(log.push_back_all(&[1]).is_err());
        assert_eq!(log.size(), 10);
    }

    #[test]
    fn rejected_batch_reserves_nothing()
    {
        let dir = temp_dir();
        scope_exit! { let _ = remove_dir_all(&dir); }

        let log = MmapLog::<u32, 4, 10>::open("batch", &dir).unwrap();
        for i in 1 ..= 8 {
            log.push_back(i).unwrap();
        }
        assert!(matches!(
            log.push_back_all(&[100, 200, 300]),
            Err(Error::Index(IndexError{index: 10, bound: 10})),
        ));
        assert_eq!(log.size(), 8);
        assert!(log.at(8).is_err());

        assert_eq!(log.push_back(9).unwrap(), 8);
        assert_eq!(log.push_back_all(&[10]).unwrap(), 9);
        assert_eq!(log.size(), 10);
        let values: Vec<u32> = (0 .. 10).map(|i| log.at(i).unwrap()).collect();
        assert_eq!(values, (1 ..= 10).collect::<Vec<u32>>());
    }

    #[test]
    fn concurrent_appends()
    {
        const THREADS: u64 = 4;
        const PUSHES: u64 = 2_000;

        let dir = temp_dir();
        scope_exit! { let _ = remove_dir_all(&dir); }

        let log = Log::open("concurrent", &dir).unwrap();
        thread::scope(|s| {
            for t in 0 .. THREADS {
                let log = &log;
                s.spawn(move || {
                    for i in 0 .. PUSHES {
                        log.push_back(t * PUSHES + i + 1).unwrap();
                    }
                });
            }
        });

        let total = (THREADS * PUSHES) as usize;
        assert_eq!(log.size(), total);
        let mut seen: Vec<u64> = (0 .. total).map(|i| log.at(i).unwrap()).collect();
        seen.sort_unstable();
        assert!(seen.iter().copied().eq(1 ..= THREADS * PUSHES));
    }

    #[test]
    fn archive_flushes_and_flips_state()
    {
        let dir = temp_dir();
        scope_exit! { let _ = remove_dir_all(&dir); }

        let log = Log::open("archived", &dir).unwrap();
        log.push_back(42).unwrap();
        log.archive_bucket(0).unwrap();
        assert_eq!(log.metadata(0).unwrap().state, Residency::Archived);
        assert_eq!(log.at(0).unwrap(), 42);
        log.restore_bucket(0).unwrap();
        assert_eq!(log.metadata(0).unwrap().state, Residency::Resident);
        assert!(dir.join("archived_0.bucket").exists());
    }
}
