use {
    std::{
        io,
        os::unix::io::{AsRawFd, BorrowedFd},
        ptr::{self, NonNull},
    },
};

/// Call mmap(2) with the given arguments.
///
/// If `addr` is [`None`], the kernel picks the address.
/// If `fd` is [`None`], `-1` is passed, as required for `MAP_ANONYMOUS`.
///
/// # Safety
///
/// With `MAP_FIXED`, any existing mapping at `addr` is replaced.
/// The caller must own the replaced range
/// and must ensure nothing relies on its old contents.
pub unsafe fn mmap(
    addr:   Option<NonNull<u8>>,
    len:    usize,
    prot:   libc::c_int,
    flags:  libc::c_int,
    fd:     Option<BorrowedFd>,
    offset: u64,
) -> io::Result<NonNull<u8>>
{
    let addr = addr.map(|a| a.as_ptr().cast()).unwrap_or(ptr::null_mut());
    let fd = fd.map(|fd| fd.as_raw_fd()).unwrap_or(-1);
    let offset = libc::off_t::try_from(offset)
        .map_err(|_| io::Error::from_raw_os_error(libc::EOVERFLOW))?;

    let result = libc::mmap(addr, len, prot, flags, fd, offset);

    if result == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }

    // mmap(2) never returns a null mapping unless asked to with MAP_FIXED.
    NonNull::new(result.cast())
        .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))
}

/// Call mremap(2) with `MREMAP_MAYMOVE | MREMAP_FIXED`.
///
/// Moves the mapping at `old` onto `new`, atomically replacing
/// whatever was mapped at `new`. The range at `old` is unmapped.
///
/// # Safety
///
/// Both ranges must be owned by the caller and be `len` bytes long.
/// After the call, `old` must no longer be used.
pub unsafe fn mremap_fixed(old: NonNull<u8>, new: NonNull<u8>, len: usize)
    -> io::Result<()>
{
    let result = libc::mremap(
        old.as_ptr().cast(),
        len,
        len,
        libc::MREMAP_MAYMOVE | libc::MREMAP_FIXED,
        new.as_ptr().cast::<libc::c_void>(),
    );

    if result == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Call munmap(2) with the given arguments.
///
/// # Safety
///
/// The range must have been mapped by [`mmap`] and not be used afterwards.
pub unsafe fn munmap(addr: NonNull<u8>, len: usize) -> io::Result<()>
{
    let result = libc::munmap(addr.as_ptr().cast(), len);

    if result == -1 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Call msync(2) with the given arguments.
///
/// # Safety
///
/// The range must be mapped.
pub unsafe fn msync(addr: NonNull<u8>, len: usize, flags: libc::c_int)
    -> io::Result<()>
{
    let result = libc::msync(addr.as_ptr().cast(), len, flags);

    if result == -1 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}
