//! `Timer` — timerfd-backed callbacks delivered through the FD machinery.
//!
//! The timer's descriptor is registered as a global FD, so expiries are
//! dispatched like any other readiness event on whichever I/O thread
//! picks them up first. The manager holds the process-wide instance and
//! releases it during `stop()`.

use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::trace;

use iomgr_core::constants::DEFAULT_FD_PRI;
use iomgr_core::{EvCallback, FdInfo, IoInterface, IomgrError, Result};

use crate::manager::IoManager;

/// Invoked with the number of expiries since the previous invocation.
pub type TimerCallback = Arc<dyn Fn(u64) + Send + Sync>;

pub struct Timer {
    mgr: Weak<IoManager>,
    fd: RawFd,
    fd_info: Option<Arc<FdInfo>>,
    iface: Arc<dyn IoInterface>,
}

impl Timer {
    /// Create and arm a timer. Registration is global, so this blocks
    /// until the manager is running. A non-recurring timer fires once.
    pub fn new_global(
        mgr: &Arc<IoManager>,
        period: Duration,
        recurring: bool,
        cb: TimerCallback,
    ) -> Result<Timer> {
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(IomgrError::last_os());
        }

        let value = libc::timespec {
            tv_sec: period.as_secs() as libc::time_t,
            tv_nsec: period.subsec_nanos() as libc::c_long,
        };
        let interval = if recurring {
            value
        } else {
            libc::timespec { tv_sec: 0, tv_nsec: 0 }
        };
        let spec = libc::itimerspec {
            it_interval: interval,
            it_value: value,
        };
        let rc = unsafe { libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut()) };
        if rc < 0 {
            let err = IomgrError::last_os();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let iface: Arc<dyn IoInterface> = mgr
            .default_general_interface()
            .ok_or(IomgrError::NotRunning)?;

        let callback: EvCallback = Box::new(move |tfd, _cookie, _events| {
            // Competing threads race for the expiry count; losers read 0.
            let mut expiries: u64 = 0;
            let n = unsafe {
                libc::read(
                    tfd,
                    &mut expiries as *mut u64 as *mut libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
            if n == std::mem::size_of::<u64>() as isize && expiries > 0 {
                cb(expiries);
            }
        });

        let info = mgr.add_fd(&iface, fd, callback, libc::EPOLLIN as u32, DEFAULT_FD_PRI, 0, false)?;
        trace!("global timer armed on fd {} (period {:?})", fd, period);
        Ok(Timer {
            mgr: Arc::downgrade(mgr),
            fd,
            fd_info: Some(info),
            iface,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let (Some(mgr), Some(info)) = (self.mgr.upgrade(), self.fd_info.take()) {
            let _ = mgr.remove_fd(&self.iface, &info, None);
        }
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Instant;

    fn wait_for(pred: impl Fn() -> bool, limit: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < limit {
            if pred() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        pred()
    }

    #[test]
    fn recurring_timer_fires_until_released() {
        let mgr = IoManager::new();
        mgr.start(0, 1, None).unwrap();
        mgr.wait_to_be_ready().unwrap();

        let fired = Arc::new(AtomicU64::new(0));
        let fired_cb = Arc::clone(&fired);
        let timer = Timer::new_global(
            &mgr,
            Duration::from_millis(20),
            true,
            Arc::new(move |expiries| {
                fired_cb.fetch_add(expiries, Ordering::Relaxed);
            }),
        )
        .unwrap();
        mgr.set_global_timer(timer);

        assert!(wait_for(
            || fired.load(Ordering::Relaxed) >= 2,
            Duration::from_secs(5)
        ));
        mgr.stop();
    }

    #[test]
    fn one_shot_timer_fires_once() {
        let mgr = IoManager::new();
        mgr.start(0, 1, None).unwrap();
        mgr.wait_to_be_ready().unwrap();

        let fired = Arc::new(AtomicU64::new(0));
        let fired_cb = Arc::clone(&fired);
        let timer = Timer::new_global(
            &mgr,
            Duration::from_millis(10),
            false,
            Arc::new(move |_| {
                fired_cb.fetch_add(1, Ordering::Relaxed);
            }),
        )
        .unwrap();

        assert!(wait_for(
            || fired.load(Ordering::Relaxed) == 1,
            Duration::from_secs(5)
        ));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(fired.load(Ordering::Relaxed), 1);

        drop(timer);
        mgr.stop();
    }
}
