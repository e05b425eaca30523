//! Named POSIX shared memory segments.
//!
//! Thin `shm_open` + `mmap` wrapper. Lifetime of the kernel object is
//! managed explicitly: dropping a handle only unmaps; `purge`-style
//! cleanup goes through [`ShmSegment::unlink_by_name`].

use std::ffi::CString;
use std::io;
use std::ptr;

use crate::error::{IpcError, Result};

/// How to acquire a named segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmMode {
    /// Create exclusively; fail if the name exists.
    Create,
    /// Open an existing segment; fail if it does not exist.
    Open,
    /// Create if missing, otherwise open.
    CreateOrOpen,
}

/// A mapped, named shared memory region.
#[derive(Debug)]
pub struct ShmSegment {
    mem: *mut u8,
    len: usize,
    name: String,
    created: bool,
}

// The region is process-shared by design; all access goes through raw
// pointers guarded by the transport lock.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Acquires a segment of `len` bytes under `name` (leading `/`).
    ///
    /// A newly created segment is sized with `ftruncate` and arrives
    /// zero-filled; an existing one is mapped at its established size
    /// request, so all participants must agree on `len`.
    ///
    /// # Errors
    /// Any `shm_open`/`ftruncate`/`mmap` failure, classified so that a
    /// vanished name surfaces as an identity error.
    pub fn acquire(name: &str, len: usize, mode: ShmMode) -> Result<Self> {
        if !name.starts_with('/') || name.len() < 2 {
            return Err(IpcError::Invalid(format!("bad shm name {name:?}")));
        }
        if len == 0 {
            return Err(IpcError::Invalid("shm size is 0".into()));
        }
        let c_name = CString::new(name.as_bytes())
            .map_err(|e| IpcError::Invalid(format!("shm name: {e}")))?;
        let perms: libc::mode_t = 0o600;

        let (fd, created) = match mode {
            ShmMode::Create => (
                shm_open_raw(&c_name, libc::O_RDWR | libc::O_CREAT | libc::O_EXCL, perms)?,
                true,
            ),
            ShmMode::Open => (shm_open_raw(&c_name, libc::O_RDWR, perms)?, false),
            ShmMode::CreateOrOpen => {
                // Try the exclusive create first so ftruncate only runs on
                // a segment we actually own.
                match shm_open_raw(&c_name, libc::O_RDWR | libc::O_CREAT | libc::O_EXCL, perms) {
                    Ok(fd) => (fd, true),
                    Err(e) if raw_os(&e) == Some(libc::EEXIST) => {
                        (shm_open_raw(&c_name, libc::O_RDWR, perms)?, false)
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        if created {
            let rc = unsafe { libc::ftruncate(fd, len as libc::off_t) };
            if rc != 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
                return Err(IpcError::Io(err));
            }
        }

        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if mem == libc::MAP_FAILED {
            return Err(IpcError::Io(io::Error::last_os_error()));
        }

        Ok(Self {
            mem: mem.cast::<u8>(),
            len,
            name: name.to_string(),
            created,
        })
    }

    /// Base pointer of the mapping.
    #[must_use]
    pub const fn as_ptr(&self) -> *const u8 {
        self.mem
    }

    /// Mutable base pointer of the mapping.
    #[must_use]
    pub const fn as_mut_ptr(&self) -> *mut u8 {
        self.mem
    }

    /// Mapped length in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Always false; a segment cannot be zero-sized.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// The POSIX name this segment was opened under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when this handle created the kernel object (and therefore
    /// observed it zero-filled).
    #[must_use]
    pub const fn created(&self) -> bool {
        self.created
    }

    /// Removes the kernel object for `name`. Existing mappings survive
    /// until unmapped; new `acquire(Open)` calls will fail.
    pub fn unlink_by_name(name: &str) {
        if let Ok(c_name) = CString::new(name.as_bytes()) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        if !self.mem.is_null() {
            unsafe { libc::munmap(self.mem.cast::<libc::c_void>(), self.len) };
        }
    }
}

fn shm_open_raw(name: &CString, oflag: libc::c_int, mode: libc::mode_t) -> Result<libc::c_int> {
    let fd = unsafe { libc::shm_open(name.as_ptr(), oflag, libc::c_uint::from(mode)) };
    if fd == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            return Err(IpcError::Identity(format!("shm {:?} is gone", name)));
        }
        return Err(IpcError::Io(err));
    }
    Ok(fd)
}

fn raw_os(err: &IpcError) -> Option<i32> {
    match err {
        IpcError::Io(io) => io.raw_os_error(),
        _ => None,
    }
}
