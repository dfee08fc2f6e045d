//! `Epoll` — thin RAII wrapper over the readiness multiplexer.
//!
//! Level-triggered, descriptor-keyed. Exactly one thread waits on an
//! instance; `add`/`del` are safe from any thread (epoll_ctl is
//! thread-safe against a concurrent epoll_wait).

use std::os::unix::io::RawFd;

use iomgr_core::{IomgrError, Result};

pub struct Epoll {
    epfd: RawFd,
}

impl Epoll {
    pub fn new() -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(IomgrError::last_os());
        }
        Ok(Epoll { epfd })
    }

    pub fn fd(&self) -> RawFd {
        self.epfd
    }

    /// Register `fd` for `events`. The descriptor itself is the key
    /// carried back in the ready event.
    pub fn add(&self, fd: RawFd, events: u32) -> Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if rc < 0 {
            return Err(IomgrError::last_os());
        }
        Ok(())
    }

    pub fn del(&self, fd: RawFd) -> Result<()> {
        let rc = unsafe {
            libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if rc < 0 {
            return Err(IomgrError::last_os());
        }
        Ok(())
    }

    /// Wait indefinitely for readiness, retrying on EINTR. Returns the
    /// number of entries filled into `events`.
    pub fn wait(&self, events: &mut [libc::epoll_event]) -> Result<usize> {
        loop {
            let rc = unsafe {
                libc::epoll_wait(self.epfd, events.as_mut_ptr(), events.len() as i32, -1)
            };
            if rc >= 0 {
                return Ok(rc as usize);
            }
            let errno = unsafe { *libc::__errno_location() };
            if errno != libc::EINTR {
                return Err(IomgrError::Os(errno));
            }
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        if self.epfd >= 0 {
            unsafe { libc::close(self.epfd) };
            self.epfd = -1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventfd::EventFd;

    #[test]
    fn add_wait_del_roundtrip() {
        let ep = Epoll::new().unwrap();
        let efd = EventFd::new(0, false).unwrap();
        ep.add(efd.fd(), libc::EPOLLIN as u32).unwrap();

        efd.write_one().unwrap();
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 4];
        let n = ep.wait(&mut events).unwrap();
        assert_eq!(n, 1);
        let ev0 = events[0];
        let ev0_u64 = ev0.u64;
        let ev0_events = ev0.events;
        assert_eq!(ev0_u64, efd.fd() as u64);
        assert_ne!(ev0_events & libc::EPOLLIN as u32, 0);

        ep.del(efd.fd()).unwrap();
        // Removing twice reports the OS error instead of panicking.
        assert!(ep.del(efd.fd()).is_err());
    }
}
