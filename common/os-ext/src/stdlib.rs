use {
    crate::path_cstring,
    std::{ffi::OsString, io, os::unix::ffi::OsStringExt, path::{Path, PathBuf}},
};

/// Call mkdtemp(3) with the given template.
///
/// The template must end in `XXXXXX`.
/// Returns the path of the newly created directory.
pub fn mkdtemp(template: &Path) -> io::Result<PathBuf>
{
    // CString::as_mut_ptr does not exist.
    let mut template = path_cstring(template)?.into_bytes_with_nul();

    // SAFETY: template is NUL-terminated.
    let ptr = unsafe {
        libc::mkdtemp(template.as_mut_ptr() as *mut libc::c_char)
    };

    if ptr.is_null() {
        return Err(io::Error::last_os_error());
    }

    // Remove NUL.
    template.pop();

    Ok(PathBuf::from(OsString::from_vec(template)))
}
