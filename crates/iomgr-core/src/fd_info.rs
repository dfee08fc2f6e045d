//! `FdInfo` — the record describing one registered file descriptor.
//!
//! An `FdInfo` is created once, published behind an `Arc`, and from then
//! on only its busy flags mutate. The manager's global map and every
//! thread context that installed the FD hold a share; the record is
//! released when the last holder drops it. Closing the descriptor itself
//! stays the registering subsystem's job.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;

use crate::interface::IoInterface;

/// Readiness callback: `(fd, cookie, event_mask)`.
pub type EvCallback = Box<dyn Fn(RawFd, u64, u32) + Send + Sync>;

/// I/O direction, used to index the busy flags and the drive metrics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Read = 0,
    Write = 1,
}

pub struct FdInfo {
    pub fd: RawFd,
    /// Non-owning back reference to the interface that registered the FD.
    /// `None` for manager-internal descriptors (message fd).
    pub iface: Option<Weak<dyn IoInterface>>,
    pub callback: EvCallback,
    /// Subscribed event mask (epoll semantics).
    pub events: u32,
    /// Priority in 0..MAX_PRI.
    pub pri: u32,
    /// Opaque client value echoed to the readiness callback.
    pub cookie: u64,
    /// true: installed on every I/O thread; false: exactly one thread.
    pub is_global: bool,
    busy: [AtomicBool; 2],
}

impl FdInfo {
    pub fn new(
        fd: RawFd,
        iface: Option<Weak<dyn IoInterface>>,
        callback: EvCallback,
        events: u32,
        pri: u32,
        cookie: u64,
        is_global: bool,
    ) -> Self {
        FdInfo {
            fd,
            iface,
            callback,
            events,
            pri,
            cookie,
            is_global,
            busy: [AtomicBool::new(false), AtomicBool::new(false)],
        }
    }

    /// Claim the busy flag for one direction. Returns false if it was
    /// already held. Callers of global-FD callbacks use this to guard
    /// against concurrent delivery on other threads.
    pub fn set_busy(&self, dir: Direction) -> bool {
        !self.busy[dir as usize].swap(true, Ordering::AcqRel)
    }

    pub fn clear_busy(&self, dir: Direction) {
        self.busy[dir as usize].store(false, Ordering::Release);
    }

    pub fn is_busy(&self, dir: Direction) -> bool {
        self.busy[dir as usize].load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for FdInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdInfo")
            .field("fd", &self.fd)
            .field("events", &self.events)
            .field("pri", &self.pri)
            .field("cookie", &self.cookie)
            .field("is_global", &self.is_global)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_info(fd: RawFd) -> FdInfo {
        FdInfo::new(fd, None, Box::new(|_, _, _| {}), 0, 9, 0, false)
    }

    #[test]
    fn busy_flags_start_clear() {
        let info = noop_info(3);
        assert!(!info.is_busy(Direction::Read));
        assert!(!info.is_busy(Direction::Write));
    }

    #[test]
    fn busy_flags_are_per_direction() {
        let info = noop_info(3);
        assert!(info.set_busy(Direction::Read));
        assert!(info.is_busy(Direction::Read));
        assert!(!info.is_busy(Direction::Write));

        // Second claim on the same direction fails until cleared.
        assert!(!info.set_busy(Direction::Read));
        info.clear_busy(Direction::Read);
        assert!(info.set_busy(Direction::Read));
    }
}
