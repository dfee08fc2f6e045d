//! `IoThreadContext` — the per-thread event loop.
//!
//! Each worker (or any caller thread that invokes
//! `IoManager::run_io_loop`) owns one context: an epoll instance, an
//! internally created message eventfd, a bounded MPMC queue of control
//! messages, and the counters the manager uses for least-busy selection.
//!
//! Within the loop the thread is single-threaded cooperative: the epoll
//! wait is the only suspension point, and readiness callbacks, message
//! handlers and closures all run to completion before the next wait.
//! Cross-thread mutation is confined to the message queue (plus the
//! thread-safe epoll_ctl calls used to install global FDs).

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crossbeam_queue::ArrayQueue;
use log::{debug, error, trace, warn};

use iomgr_core::constants::{DEFAULT_FD_PRI, MSG_QUEUE_DEPTH};
use iomgr_core::{FdInfo, IoMsg, IomgrError, Result, ThreadContext};

use crate::epoll::Epoll;
use crate::eventfd::EventFd;
use crate::manager::IoManager;
use crate::metrics::ThreadMetrics;

/// Predicate deciding which already-registered FDs a thread installs.
pub type FdSelector = Box<dyn Fn(&Arc<FdInfo>) -> bool + Send>;

/// Per-thread override for non-core control messages.
pub type ThreadMsgHandler = Box<dyn Fn(IoMsg) + Send>;

const MAX_EPOLL_EVENTS: usize = 64;

pub struct IoThreadContext {
    thread_num: u32,
    epoll: RwLock<Option<Epoll>>,
    msg_fd: RwLock<Option<EventFd>>,
    msg_fd_info: RwLock<Option<Arc<FdInfo>>>,
    /// FDs installed on this thread's multiplexer, keyed by descriptor.
    fds: Mutex<HashMap<RawFd, Arc<FdInfo>>>,
    msg_q: ArrayQueue<IoMsg>,
    /// Operations handled; the manager's load-balance key.
    count: AtomicU64,
    is_io_thread: AtomicBool,
    is_manager_thread: AtomicBool,
    keep_running: AtomicBool,
    fd_selector: Mutex<Option<FdSelector>>,
    msg_handler: Mutex<Option<ThreadMsgHandler>>,
    /// Back reference to the manager while the loop runs; used for the
    /// default custom-message handler.
    mgr: RwLock<Option<std::sync::Weak<IoManager>>>,
    pub(crate) metrics: ThreadMetrics,
}

impl IoThreadContext {
    pub(crate) fn new(thread_num: u32) -> Self {
        IoThreadContext {
            thread_num,
            epoll: RwLock::new(None),
            msg_fd: RwLock::new(None),
            msg_fd_info: RwLock::new(None),
            fds: Mutex::new(HashMap::new()),
            msg_q: ArrayQueue::new(MSG_QUEUE_DEPTH),
            count: AtomicU64::new(0),
            is_io_thread: AtomicBool::new(false),
            is_manager_thread: AtomicBool::new(false),
            keep_running: AtomicBool::new(false),
            fd_selector: Mutex::new(None),
            msg_handler: Mutex::new(None),
            mgr: RwLock::new(None),
            metrics: ThreadMetrics::new(),
        }
    }

    /// Become an I/O thread and run the event loop until relinquished.
    pub fn run(
        self: &Arc<Self>,
        mgr: &Arc<IoManager>,
        is_manager_thread: bool,
        fd_selector: Option<FdSelector>,
        msg_handler: Option<ThreadMsgHandler>,
    ) -> Result<()> {
        self.iothread_init(mgr, is_manager_thread, fd_selector, msg_handler)?;
        self.listen();
        self.iothread_teardown(mgr);
        Ok(())
    }

    pub fn op_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Whether the running loop was spawned by the manager itself (as
    /// opposed to a caller thread that joined the pool).
    pub fn is_manager_thread(&self) -> bool {
        self.is_manager_thread.load(Ordering::Relaxed)
    }

    /// The raw message fd, if this thread's loop is (still) up.
    pub(crate) fn msg_fd_raw(&self) -> Option<RawFd> {
        self.msg_fd_info.read().unwrap().as_ref().map(|i| i.fd)
    }

    /// Enqueue a message for this thread. The caller separately wakes the
    /// message fd. A full queue hands the message back.
    pub fn put_msg(&self, msg: IoMsg) -> std::result::Result<(), IoMsg> {
        self.msg_q.push(msg)
    }

    /// Evaluate the FD selector; FDs are addable by default.
    pub fn is_fd_addable(&self, info: &Arc<FdInfo>) -> bool {
        self.fd_selector
            .lock()
            .unwrap()
            .as_ref()
            .map_or(true, |sel| sel(info))
    }

    pub(crate) fn add_fd_to_thread(&self, info: Arc<FdInfo>) -> Result<()> {
        let mut fds = self.fds.lock().unwrap();
        if fds.contains_key(&info.fd) {
            // Already installed here; the bring-up scan and a concurrent
            // global add can race to the same descriptor.
            return Ok(());
        }
        let guard = self.epoll.read().unwrap();
        let ep = guard.as_ref().ok_or(IomgrError::NotIoThread)?;
        ep.add(info.fd, info.events)?;
        trace!("fd {} added to thread {}", info.fd, self.thread_num);
        fds.insert(info.fd, info);
        Ok(())
    }

    pub(crate) fn remove_fd_from_thread(&self, info: &Arc<FdInfo>) -> Result<()> {
        let removed = self.fds.lock().unwrap().remove(&info.fd);
        if removed.is_some() {
            let guard = self.epoll.read().unwrap();
            if let Some(ep) = guard.as_ref() {
                ep.del(info.fd)?;
            }
            trace!("fd {} removed from thread {}", info.fd, self.thread_num);
        }
        Ok(())
    }

    fn iothread_init(
        self: &Arc<Self>,
        mgr: &Arc<IoManager>,
        is_manager_thread: bool,
        fd_selector: Option<FdSelector>,
        msg_handler: Option<ThreadMsgHandler>,
    ) -> Result<()> {
        *self.fd_selector.lock().unwrap() = fd_selector;
        *self.msg_handler.lock().unwrap() = msg_handler;
        *self.mgr.write().unwrap() = Some(Arc::downgrade(mgr));
        self.is_manager_thread
            .store(is_manager_thread, Ordering::Relaxed);
        self.keep_running.store(true, Ordering::Release);

        let epoll = Epoll::new()?;

        // The message fd is semaphore-like: one counter value drained per
        // wake, the queue drained to empty on each.
        let msg_efd = EventFd::new(0, true)?;
        let msg_info = Arc::new(FdInfo::new(
            msg_efd.fd(),
            None,
            Box::new(|_, _, _| {}),
            libc::EPOLLIN as u32,
            DEFAULT_FD_PRI,
            0,
            false,
        ));
        epoll.add(msg_info.fd, msg_info.events)?;
        trace!(
            "thread {}: msg fd {} registered with multiplexer",
            self.thread_num,
            msg_info.fd
        );

        *self.epoll.write().unwrap() = Some(epoll);
        *self.msg_fd.write().unwrap() = Some(msg_efd);
        *self.msg_fd_info.write().unwrap() = Some(msg_info);
        self.is_io_thread.store(true, Ordering::Release);

        // Interfaces initialise their per-thread resources and may
        // register per-thread FDs through us.
        let ctx: &dyn ThreadContext = self.as_ref();
        mgr.foreach_interface(|iface| iface.on_io_thread_start(ctx));

        // Install every already-known global FD this thread accepts.
        mgr.foreach_fd_info(|info| {
            if self.is_fd_addable(info) {
                if let Err(e) = self.add_fd_to_thread(Arc::clone(info)) {
                    warn!(
                        "thread {}: failed to install global fd {}: {}",
                        self.thread_num, info.fd, e
                    );
                }
            }
        });

        mgr.io_thread_started(is_manager_thread);
        debug!("thread {} is now an io thread", self.thread_num);
        Ok(())
    }

    fn listen(self: &Arc<Self>) {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EPOLL_EVENTS];
        while self.keep_running.load(Ordering::Acquire) {
            let n = {
                let guard = self.epoll.read().unwrap();
                let Some(ep) = guard.as_ref() else { break };
                match ep.wait(&mut events) {
                    Ok(n) => n,
                    Err(e) => {
                        error!("thread {}: epoll wait failed: {}", self.thread_num, e);
                        break;
                    }
                }
            };
            let msg_fd = self.msg_fd_raw();
            for ev in &events[..n] {
                let fd = ev.u64 as RawFd;
                if Some(fd) == msg_fd {
                    self.on_msg_fd_notification();
                } else {
                    self.on_user_fd_notification(fd, ev.events);
                }
            }
        }
    }

    fn on_msg_fd_notification(self: &Arc<Self>) {
        if let Some(efd) = self.msg_fd.read().unwrap().as_ref() {
            let _ = efd.read_count();
        }
        // Several wake writes can coalesce into one epoll wake; the queue
        // is drained to empty regardless.
        while let Some(msg) = self.msg_q.pop() {
            self.handle_msg(msg);
        }
    }

    fn handle_msg(self: &Arc<Self>, msg: IoMsg) {
        self.metrics.msg_recvd_count.fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        match msg {
            IoMsg::Reschedule { fd, events } => {
                trace!(
                    "thread {}: rescheduled-in event {:#x} for fd {}",
                    self.thread_num,
                    events,
                    fd.fd
                );
                self.metrics.rescheduled_in.fetch_add(1, Ordering::Relaxed);
                (fd.callback)(fd.fd, fd.cookie, events);
            }
            IoMsg::RunClosure(f) => {
                if catch_unwind(AssertUnwindSafe(move || f())).is_err() {
                    error!(
                        "thread {}: closure panicked in io context; loop continues",
                        self.thread_num
                    );
                }
            }
            IoMsg::Relinquish => {
                debug!("thread {} asked to relinquish io thread state", self.thread_num);
                self.keep_running.store(false, Ordering::Release);
            }
            msg @ IoMsg::Custom { .. } => {
                let guard = self.msg_handler.lock().unwrap();
                match guard.as_ref() {
                    Some(handler) => handler(msg),
                    None => {
                        drop(guard);
                        if let Some(mgr) = self.manager() {
                            mgr.handle_msg_default(msg);
                        }
                    }
                }
            }
        }
    }

    fn on_user_fd_notification(&self, fd: RawFd, events: u32) {
        let info = self.fds.lock().unwrap().get(&fd).cloned();
        match info {
            Some(info) => {
                self.count.fetch_add(1, Ordering::Relaxed);
                self.metrics.io_count.fetch_add(1, Ordering::Relaxed);
                trace!(
                    "thread {}: event {:#x} on fd {}",
                    self.thread_num,
                    events,
                    fd
                );
                (info.callback)(info.fd, info.cookie, events);
            }
            None => warn!(
                "thread {}: readiness for unregistered fd {}",
                self.thread_num, fd
            ),
        }
    }

    fn iothread_teardown(self: &Arc<Self>, mgr: &Arc<IoManager>) {
        // Stop accepting message deliveries first; a send that observed
        // the old state at the instant of send is still drained below.
        self.is_io_thread.store(false, Ordering::Release);

        let ctx: &dyn ThreadContext = self.as_ref();
        mgr.foreach_interface(|iface| iface.on_io_thread_stopped(ctx));

        let remaining: Vec<Arc<FdInfo>> = {
            let mut fds = self.fds.lock().unwrap();
            fds.drain().map(|(_, v)| v).collect()
        };
        if let Some(ep) = self.epoll.read().unwrap().as_ref() {
            for info in &remaining {
                let _ = ep.del(info.fd);
            }
        }

        *self.msg_fd_info.write().unwrap() = None;
        *self.msg_fd.write().unwrap() = None;
        *self.epoll.write().unwrap() = None;
        *self.fd_selector.lock().unwrap() = None;
        *self.msg_handler.lock().unwrap() = None;
        *self.mgr.write().unwrap() = None;

        mgr.io_thread_stopped();
        debug!("thread {} left io thread state", self.thread_num);
    }

    fn manager(&self) -> Option<Arc<IoManager>> {
        self.mgr.read().unwrap().as_ref().and_then(|w| w.upgrade())
    }
}

impl ThreadContext for IoThreadContext {
    fn thread_num(&self) -> u32 {
        self.thread_num
    }

    fn is_io_thread(&self) -> bool {
        self.is_io_thread.load(Ordering::Acquire)
    }

    fn add_fd(&self, info: Arc<FdInfo>) -> Result<()> {
        self.add_fd_to_thread(info)
    }

    fn remove_fd(&self, info: &Arc<FdInfo>) -> Result<()> {
        self.remove_fd_from_thread(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_info(fd: RawFd) -> Arc<FdInfo> {
        Arc::new(FdInfo::new(
            fd,
            None,
            Box::new(|_, _, _| {}),
            libc::EPOLLIN as u32,
            DEFAULT_FD_PRI,
            0,
            false,
        ))
    }

    #[test]
    fn fd_addable_defaults_to_true() {
        let ctx = IoThreadContext::new(0);
        assert!(ctx.is_fd_addable(&dummy_info(10)));

        *ctx.fd_selector.lock().unwrap() = Some(Box::new(|info| info.fd % 2 == 0));
        assert!(ctx.is_fd_addable(&dummy_info(10)));
        assert!(!ctx.is_fd_addable(&dummy_info(11)));
    }

    #[test]
    fn msg_queue_is_bounded() {
        let ctx = IoThreadContext::new(0);
        for _ in 0..MSG_QUEUE_DEPTH {
            assert!(ctx.put_msg(IoMsg::Relinquish).is_ok());
        }
        // The queue hands an overflowing message back to the sender.
        let rejected = ctx.put_msg(IoMsg::Custom { tag: 9 });
        match rejected {
            Err(IoMsg::Custom { tag }) => assert_eq!(tag, 9),
            _ => panic!("expected queue-full rejection"),
        }
    }

    #[test]
    fn add_fd_without_loop_is_an_error() {
        let ctx = IoThreadContext::new(3);
        let err = ctx.add_fd_to_thread(dummy_info(10)).unwrap_err();
        assert!(matches!(err, IomgrError::NotIoThread));
    }

    #[test]
    fn not_an_io_thread_until_run() {
        let ctx = IoThreadContext::new(1);
        assert!(!ctx.is_io_thread());
        assert_eq!(ctx.thread_num(), 1);
        assert!(ctx.msg_fd_raw().is_none());
    }
}
