//! Inter-process mutual exclusion for the payload store.
//!
//! A `pthread_mutex_t` with the `PROCESS_SHARED` and `ROBUST`
//! attributes, living in its own small shared memory segment. Robust
//! mode matters here: a worker killed while holding the lock must not
//! wedge the parent, so `EOWNERDEAD` is made consistent and treated as
//! a successful acquisition.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{IpcError, Result};
use crate::shm::{ShmMode, ShmSegment};

// Init-state word: 0 while the creator initializes, 1 once usable.
const STATE_READY: u32 = 1;

// Segment layout: one init-state word, padding to 8, then the mutex.
const MUTEX_OFFSET: usize = 8;

extern "C" {
    fn pthread_mutexattr_setrobust(
        attr: *mut libc::pthread_mutexattr_t,
        robustness: libc::c_int,
    ) -> libc::c_int;
    fn pthread_mutex_consistent(mutex: *mut libc::pthread_mutex_t) -> libc::c_int;
}

const PTHREAD_MUTEX_ROBUST: libc::c_int = 1;

/// A named, process-shared mutex.
pub struct ShmLock {
    seg: ShmSegment,
}

impl ShmLock {
    /// Opens (or creates and initializes) the lock under `name`.
    ///
    /// The creator initializes the mutex and then publishes a ready
    /// flag; openers spin briefly on that flag so nobody locks a
    /// half-initialized mutex.
    ///
    /// # Errors
    /// Segment acquisition or `pthread_mutex_init` failures.
    pub fn open(name: &str) -> Result<Self> {
        let size = MUTEX_OFFSET + std::mem::size_of::<libc::pthread_mutex_t>();
        let seg = ShmSegment::acquire(name, size, ShmMode::CreateOrOpen)?;
        let lock = Self { seg };

        if lock.seg.created() {
            lock.init_mutex()?;
            lock.state().store(STATE_READY, Ordering::Release);
        } else {
            // Bounded wait for the creator to finish initialization.
            let mut spins = 0u32;
            while lock.state().load(Ordering::Acquire) != STATE_READY {
                spins += 1;
                if spins > 2_000 {
                    return Err(IpcError::Setup(format!(
                        "lock {name} never became ready"
                    )));
                }
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        }
        Ok(lock)
    }

    /// Blocks until the lock is held, then returns a guard that
    /// releases it on drop.
    ///
    /// # Errors
    /// Propagates `pthread_mutex_lock` failures other than
    /// `EOWNERDEAD` (which is recovered via `pthread_mutex_consistent`).
    pub fn guard(&self) -> Result<LockGuard<'_>> {
        loop {
            let eno = unsafe { libc::pthread_mutex_lock(self.mutex_ptr()) };
            match eno {
                0 => return Ok(LockGuard { lock: self }),
                libc::EOWNERDEAD => {
                    let eno2 = unsafe { pthread_mutex_consistent(self.mutex_ptr()) };
                    if eno2 != 0 {
                        return Err(IpcError::Io(io::Error::from_raw_os_error(eno2)));
                    }
                    return Ok(LockGuard { lock: self });
                }
                libc::EINTR => continue,
                other => return Err(IpcError::Io(io::Error::from_raw_os_error(other))),
            }
        }
    }

    /// Attempts the lock without blocking; `None` when contended.
    ///
    /// # Errors
    /// Propagates unexpected `pthread_mutex_trylock` failures.
    pub fn try_guard(&self) -> Result<Option<LockGuard<'_>>> {
        let eno = unsafe { libc::pthread_mutex_trylock(self.mutex_ptr()) };
        match eno {
            0 => Ok(Some(LockGuard { lock: self })),
            libc::EBUSY => Ok(None),
            libc::EOWNERDEAD => {
                let eno2 = unsafe { pthread_mutex_consistent(self.mutex_ptr()) };
                if eno2 != 0 {
                    return Err(IpcError::Io(io::Error::from_raw_os_error(eno2)));
                }
                Ok(Some(LockGuard { lock: self }))
            }
            other => Err(IpcError::Io(io::Error::from_raw_os_error(other))),
        }
    }

    /// Removes the kernel object backing the lock.
    pub fn unlink_by_name(name: &str) {
        ShmSegment::unlink_by_name(name);
    }

    fn state(&self) -> &AtomicU32 {
        unsafe { &*self.seg.as_ptr().cast::<AtomicU32>() }
    }

    fn mutex_ptr(&self) -> *mut libc::pthread_mutex_t {
        unsafe { self.seg.as_mut_ptr().add(MUTEX_OFFSET) }.cast::<libc::pthread_mutex_t>()
    }

    fn init_mutex(&self) -> Result<()> {
        unsafe {
            self.mutex_ptr().write_bytes(0, 1);

            let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
            let mut eno = libc::pthread_mutexattr_init(&mut attr);
            if eno != 0 {
                return Err(IpcError::Io(io::Error::from_raw_os_error(eno)));
            }
            eno = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
            if eno == 0 {
                eno = pthread_mutexattr_setrobust(&mut attr, PTHREAD_MUTEX_ROBUST);
            }
            if eno == 0 {
                eno = libc::pthread_mutex_init(self.mutex_ptr(), &attr);
            }
            libc::pthread_mutexattr_destroy(&mut attr);
            if eno != 0 {
                return Err(IpcError::Io(io::Error::from_raw_os_error(eno)));
            }
        }
        Ok(())
    }
}

/// RAII guard; unlocks on drop.
pub struct LockGuard<'a> {
    lock: &'a ShmLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        unsafe { libc::pthread_mutex_unlock(self.lock.mutex_ptr()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("/stoker_locktest_{}_{}", tag, std::process::id())
    }

    #[test]
    fn lock_and_unlock() {
        let name = unique_name("basic");
        let lock = ShmLock::open(&name).unwrap();
        {
            let _g = lock.guard().unwrap();
            // Same-process second handle sees the mutex held.
            let other = ShmLock::open(&name).unwrap();
            assert!(other.try_guard().unwrap().is_none());
        }
        // Released after the guard drops.
        assert!(lock.try_guard().unwrap().is_some());
        ShmLock::unlink_by_name(&name);
    }

    #[test]
    fn reopen_does_not_reinitialize() {
        let name = unique_name("reopen");
        let first = ShmLock::open(&name).unwrap();
        let _held = first.guard().unwrap();
        // A second open must observe the existing (locked) mutex, not a
        // freshly zeroed one.
        let second = ShmLock::open(&name).unwrap();
        assert!(second.try_guard().unwrap().is_none());
        ShmLock::unlink_by_name(&name);
    }
}
