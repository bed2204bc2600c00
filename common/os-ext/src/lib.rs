//! Extra items for talking to the operating system.
//!
//! This crate provides a safe, low-level interface to the operating system,
//! restricted to the calls needed for managing file-backed memory.
//! The functions in this crate are named after their underlying system calls,
//! and their behavior is identical except for the differences listed below.
//! The exact semantics of each function can be found in their man pages.
//!
//! # Differences with underlying system calls
//!
//! Errors are reported using [`Result`] rather than
//! through `errno` and an arbitrary return value.
//!
//! Path arguments are accepted as [`Path`] rather than NUL-terminated strings.
//! They are automatically made NUL-terminated by the wrapper functions.
//! If an interior NUL is found within the path,
//! the wrapper function fails with `EINVAL`.
//!
//! When a new file descriptor is created by one of the functions,
//! it is created with the `FD_CLOEXEC` bit set (atomically).
//!
//! If the system call fails with `EINTR` (interrupted),
//! the wrapper function automatically retries it.
//!
//! [`Result`]: `std::io::Result`
//! [`Path`]: `std::path::Path`

#![warn(missing_docs)]

pub use {
    self::{fcntl::*, stdlib::*, sys_mman::*, sys_stat::*, unistd::*},
    libc::{
        MAP_ANONYMOUS, MAP_FIXED, MAP_PRIVATE, MAP_SHARED,
        MS_SYNC,
        O_CREAT, O_EXCL, O_RDWR,
        PROT_READ, PROT_WRITE,
    },
};

use std::{
    ffi::CString,
    io::{self, ErrorKind::Interrupted},
    os::unix::ffi::OsStrExt,
    path::Path,
};

mod fcntl;
mod stdlib;
mod sys_mman;
mod sys_stat;
mod unistd;

// Cannot `pub use` as that would also export the stat function.
#[allow(missing_docs, non_camel_case_types)]
pub type stat = libc::stat;

/// Call `f` until it no longer fails with `EINTR`.
fn retry_on_eintr<F, T>(mut f: F) -> io::Result<T>
    where F: FnMut() -> io::Result<T>
{
    loop {
        match f() {
            Err(err) if err.kind() == Interrupted => continue,
            result                                => return result,
        }
    }
}

/// Convert a path into a NUL-terminated string.
///
/// Fails with `EINVAL` if the path contains an interior NUL.
fn path_cstring(path: &Path) -> io::Result<CString>
{
    Ok(CString::new(path.as_os_str().as_bytes())?)
}
