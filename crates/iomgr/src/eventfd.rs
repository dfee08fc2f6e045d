//! `EventFd` — owned counter descriptor used as an in-process wake-up.
//!
//! Two users: the per-thread message fd (semaphore mode, one counter
//! value drained per wake) and the AIO completion fd (plain mode, the
//! whole counter drained at once). Multiple writes before the consumer
//! reads coalesce into a single wakeup.

use std::os::unix::io::RawFd;

use iomgr_core::{IomgrError, Result};

pub struct EventFd {
    fd: RawFd,
}

impl EventFd {
    pub fn new(init: u32, semaphore: bool) -> Result<Self> {
        let mut flags = libc::EFD_NONBLOCK | libc::EFD_CLOEXEC;
        if semaphore {
            flags |= libc::EFD_SEMAPHORE;
        }
        let fd = unsafe { libc::eventfd(init, flags) };
        if fd < 0 {
            return Err(IomgrError::last_os());
        }
        Ok(EventFd { fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Add 1 to the counter. EAGAIN means the counter would overflow,
    /// which implies a wake is already pending — that counts as success.
    pub fn write_one(&self) -> Result<()> {
        write_one_raw(self.fd)
    }

    /// Non-blocking read of the counter. In semaphore mode this drains
    /// one unit; otherwise the whole counter. Returns 0 when empty.
    pub fn read_count(&self) -> Result<u64> {
        let mut val: u64 = 0;
        let rc = unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if rc < 0 {
            let errno = unsafe { *libc::__errno_location() };
            if errno == libc::EAGAIN {
                return Ok(0);
            }
            return Err(IomgrError::Os(errno));
        }
        Ok(val)
    }
}

/// Wake an eventfd the caller does not own (a remote thread's message fd).
pub fn write_one_raw(fd: RawFd) -> Result<()> {
    let val: u64 = 1;
    let rc = unsafe {
        libc::write(
            fd,
            &val as *const u64 as *const libc::c_void,
            std::mem::size_of::<u64>(),
        )
    };
    if rc < 0 {
        let errno = unsafe { *libc::__errno_location() };
        // EAGAIN: counter saturated, so the receiver has a wake pending
        // anyway.
        if errno != libc::EAGAIN {
            return Err(IomgrError::Os(errno));
        }
    }
    Ok(())
}

impl Drop for EventFd {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
    }
}
