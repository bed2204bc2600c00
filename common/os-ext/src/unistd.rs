use {
    crate::{path_cstring, retry_on_eintr},
    std::{
        io,
        os::unix::io::{AsRawFd, BorrowedFd},
        path::Path,
    },
};

/// Call ftruncate(2) with the given arguments.
pub fn ftruncate(fd: BorrowedFd, length: u64) -> io::Result<()>
{
    let length = libc::off_t::try_from(length)
        .map_err(|_| io::Error::from_raw_os_error(libc::EFBIG))?;

    retry_on_eintr(|| {
        // SAFETY: This is always safe.
        let result = unsafe { libc::ftruncate(fd.as_raw_fd(), length) };

        if result == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    })
}

/// Call pwrite(2) until all of `buf` is written at `offset`.
///
/// Short writes are continued where they left off,
/// so this either writes the whole buffer or fails.
pub fn pwrite_all(fd: BorrowedFd, mut buf: &[u8], mut offset: u64)
    -> io::Result<()>
{
    while !buf.is_empty() {
        let off = libc::off_t::try_from(offset)
            .map_err(|_| io::Error::from_raw_os_error(libc::EFBIG))?;

        let written = retry_on_eintr(|| {
            // SAFETY: buf is valid for buf.len() bytes.
            let result = unsafe {
                libc::pwrite(
                    fd.as_raw_fd(),
                    buf.as_ptr().cast(),
                    buf.len(),
                    off,
                )
            };

            if result == -1 {
                return Err(io::Error::last_os_error());
            }

            Ok(result as usize)
        })?;

        if written == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }

        buf = &buf[written ..];
        offset += written as u64;
    }

    Ok(())
}

/// Call unlinkat(2) with the given arguments.
///
/// If `dirfd` is [`None`], `AT_FDCWD` is passed.
pub fn unlinkat(dirfd: Option<BorrowedFd>, pathname: &Path, flags: libc::c_int)
    -> io::Result<()>
{
    let dirfd = dirfd.map(|fd| fd.as_raw_fd()).unwrap_or(libc::AT_FDCWD);
    let pathname = path_cstring(pathname)?;

    retry_on_eintr(|| {
        // SAFETY: pathname is NUL-terminated.
        let result = unsafe { libc::unlinkat(dirfd, pathname.as_ptr(), flags) };

        if result == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    })
}

/// Call sysconf(3) for `_SC_PAGESIZE`.
pub fn page_size() -> usize
{
    // SAFETY: This is always safe.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    // POSIX requires a page size of at least 1; fall back to 4 KiB anyway.
    if size <= 0 { 4096 } else { size as usize }
}

#[cfg(test)]
mod tests
{
    use {
        super::*,
        crate::{O_CREAT, O_RDWR, fstat, mkdtemp, open},
        std::{fs::{read, remove_dir_all}, os::unix::io::AsFd},
    };

    #[test]
    fn pwrite_all_then_ftruncate()
    {
        let dir = mkdtemp(Path::new("/tmp/os-ext-test-XXXXXX")).unwrap();
        let path = dir.join("data");

        let fd = open(&path, O_CREAT | O_RDWR, 0o644).unwrap();
        pwrite_all(fd.as_fd(), b"hello", 3).unwrap();
        assert_eq!(read(&path).unwrap(), b"\0\0\0hello");

        ftruncate(fd.as_fd(), 16).unwrap();
        assert_eq!(fstat(fd.as_fd()).unwrap().st_size, 16);

        unlinkat(None, &path, 0).unwrap();
        assert!(!path.exists());

        remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn page_size_is_power_of_two()
    {
        assert!(page_size().is_power_of_two());
    }
}
