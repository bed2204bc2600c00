use {
    crate::{path_cstring, retry_on_eintr, stat},
    std::{
        io,
        mem::MaybeUninit,
        os::unix::io::{AsRawFd, BorrowedFd},
        path::Path,
    },
};

/// Call fstat(2) with the given file descriptor.
pub fn fstat(fd: BorrowedFd) -> io::Result<stat>
{
    let mut statbuf = MaybeUninit::uninit();

    retry_on_eintr(|| {
        // SAFETY: statbuf is large enough to hold a stat structure.
        let result = unsafe { libc::fstat(fd.as_raw_fd(), statbuf.as_mut_ptr()) };

        if result == -1 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: fstat initialized statbuf.
        Ok(unsafe { statbuf.assume_init() })
    })
}

/// Call mkdirat(2) with the given arguments.
///
/// If `dirfd` is [`None`], `AT_FDCWD` is passed.
pub fn mkdirat(dirfd: Option<BorrowedFd>, pathname: &Path, mode: libc::mode_t)
    -> io::Result<()>
{
    let dirfd = dirfd.map(|fd| fd.as_raw_fd()).unwrap_or(libc::AT_FDCWD);
    let pathname = path_cstring(pathname)?;

    retry_on_eintr(|| {
        // SAFETY: pathname is NUL-terminated.
        let result = unsafe { libc::mkdirat(dirfd, pathname.as_ptr(), mode) };

        if result == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    })
}
