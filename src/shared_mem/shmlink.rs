use std::{
    ffi::{CStr, CString},
    fs::File,
    io,
    os::fd::FromRawFd,
};

use memmap2::MmapMut;

pub fn shm_open(name: &CStr) -> io::Result<File> {
    let mode = 0o600;
    let options = libc::O_RDWR | libc::O_CREAT | libc::O_EXCL;

    match unsafe { libc::shm_open(name.as_ptr(), options, mode) } {
        -1 => Err(io::Error::last_os_error()),
        fd => Ok(unsafe { File::from_raw_fd(fd) }),
    }
}

pub fn shm_unlink(name: &CStr) -> io::Result<()> {
    match unsafe { libc::shm_unlink(name.as_ptr()) } {
        0 => Ok(()),
        _ => Err(io::Error::last_os_error()),
    }
}

fn into_shm_name(path: &str) -> io::Result<CString> {
    CString::new(format!("/{path}")).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// A `MAP_SHARED` mapping of a POSIX shared memory object. The mapping is
/// inherited across `fork`, so parent and child see the same bytes.
pub struct SharedMem {
    map: MmapMut,
}

impl SharedMem {
    /// Create `path`, map `length` zeroed bytes of it, and drop the name again;
    /// the mapping keeps the object alive.
    pub fn new(path: &str, length: usize) -> io::Result<Self> {
        let name = into_shm_name(path)?;
        let file = shm_open(&name)?;
        let mapped = file
            .set_len(length as u64)
            .and_then(|()| unsafe { MmapMut::map_mut(&file) });
        shm_unlink(&name)?;
        Ok(Self { map: mapped? })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.map.as_ptr().cast_mut()
    }
}
