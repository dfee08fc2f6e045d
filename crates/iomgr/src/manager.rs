//! `IoManager` — lifecycle, registration and cross-thread brokering.
//!
//! The manager owns the registered interfaces, the global FD map and the
//! worker thread pool. It moves strictly forward through
//! `Start → WaitingForInterfaces → WaitingForThreads → Running →
//! Stopping → Stopped`; `Running` is reached only once every expected
//! interface is registered *and* every requested worker has entered its
//! event loop.
//!
//! There is no hidden process-wide instance: create one with
//! [`IoManager::new`], drive it with `start`/`stop`, and hand the `Arc`
//! to whoever needs it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::thread::JoinHandle;

use log::{error, info, trace, warn};

use iomgr_core::constants::INBUILT_INTERFACE_COUNT;
use iomgr_core::{
    DriveInterface, EvCallback, FdInfo, IoInterface, IoMsg, IomgrError, MsgKind, Result,
    ThreadContext,
};

use crate::default_interface::DefaultIoInterface;
use crate::eventfd::write_one_raw;
use crate::io_thread::{FdSelector, IoThreadContext, ThreadMsgHandler};
use crate::timer::Timer;

/// Manager-wide fallback handler for `Custom` messages.
pub type MsgHandler = Arc<dyn Fn(IoMsg) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ManagerState {
    Start,
    WaitingForInterfaces,
    WaitingForThreads,
    Running,
    Stopping,
    Stopped,
}

/// Start-time knobs; `IoManager::start` covers the common path, this
/// covers the rest.
#[derive(Clone, Debug)]
pub struct IomgrConfig {
    pub num_threads: usize,
    pub expected_custom_ifaces: usize,
    pub thread_name_prefix: String,
}

impl Default for IomgrConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        IomgrConfig {
            num_threads: cpus,
            expected_custom_ifaces: 0,
            thread_name_prefix: "iomgr".to_string(),
        }
    }
}

impl IomgrConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_threads(mut self, n: usize) -> Self {
        self.num_threads = n;
        self
    }

    pub fn expected_custom_ifaces(mut self, n: usize) -> Self {
        self.expected_custom_ifaces = n;
        self
    }

    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }
}

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// The calling thread's context, keyed by manager id so tests that
    /// cycle managers on one thread get a fresh context per manager.
    static THREAD_CTX: RefCell<Option<(u64, Arc<IoThreadContext>)>> = const { RefCell::new(None) };
}

pub struct IoManager {
    id: u64,
    state: Mutex<ManagerState>,
    state_cv: Condvar,
    iface_list: RwLock<Vec<Arc<dyn IoInterface>>>,
    drive_ifaces: RwLock<Vec<Arc<dyn DriveInterface>>>,
    default_drive_iface: RwLock<Option<Arc<dyn DriveInterface>>>,
    default_general_iface: RwLock<Option<Arc<DefaultIoInterface>>>,
    /// Global FDs only; per-thread FDs live in their thread's context.
    fd_info_map: RwLock<HashMap<RawFd, Arc<FdInfo>>>,
    registry: Mutex<Vec<Weak<IoThreadContext>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    expected_ifaces: AtomicUsize,
    yet_to_start: AtomicI64,
    yet_to_stop: AtomicI64,
    next_thread_num: AtomicU32,
    default_msg_handler: RwLock<Option<MsgHandler>>,
    global_timer: Mutex<Option<Timer>>,
    thread_name_prefix: Mutex<String>,
}

impl IoManager {
    pub fn new() -> Arc<Self> {
        Arc::new(IoManager {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(ManagerState::Start),
            state_cv: Condvar::new(),
            iface_list: RwLock::new(Vec::with_capacity(INBUILT_INTERFACE_COUNT + 5)),
            drive_ifaces: RwLock::new(Vec::new()),
            default_drive_iface: RwLock::new(None),
            default_general_iface: RwLock::new(None),
            fd_info_map: RwLock::new(HashMap::new()),
            registry: Mutex::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
            expected_ifaces: AtomicUsize::new(INBUILT_INTERFACE_COUNT),
            yet_to_start: AtomicI64::new(0),
            yet_to_stop: AtomicI64::new(0),
            next_thread_num: AtomicU32::new(0),
            default_msg_handler: RwLock::new(None),
            global_timer: Mutex::new(None),
            thread_name_prefix: Mutex::new("iomgr".to_string()),
        })
    }

    // ── Lifecycle ─────────────────────────────────────────────────────

    pub fn start(
        self: &Arc<Self>,
        expected_custom_ifaces: usize,
        num_threads: usize,
        handler: Option<MsgHandler>,
    ) -> Result<()> {
        info!("starting io manager {}", self.id);
        self.expected_ifaces
            .fetch_add(expected_custom_ifaces, Ordering::AcqRel);
        self.yet_to_start.store(num_threads as i64, Ordering::Release);
        *self.default_msg_handler.write().unwrap() = handler;

        self.set_state_and_notify(ManagerState::WaitingForInterfaces);

        // The inbuilt general interface counts toward the expected total.
        let iface = DefaultIoInterface::new();
        *self.default_general_iface.write().unwrap() = Some(Arc::clone(&iface));
        self.add_interface(iface)
    }

    pub fn start_with_config(self: &Arc<Self>, cfg: &IomgrConfig, handler: Option<MsgHandler>) -> Result<()> {
        *self.thread_name_prefix.lock().unwrap() = cfg.thread_name_prefix.clone();
        self.start(cfg.expected_custom_ifaces, cfg.num_threads, handler)
    }

    pub fn stop(&self) {
        info!("stopping io manager {}", self.id);
        self.set_state_and_notify(ManagerState::Stopping);

        // Guard increment so a manager with zero io threads cannot hang
        // waiting for a decrement that never comes.
        self.yet_to_stop.fetch_add(1, Ordering::AcqRel);

        // Ask every io thread to relinquish its status.
        self.send_msg(-1, IoMsg::Relinquish);

        // Free up and unregister the global timer's descriptor.
        *self.global_timer.lock().unwrap() = None;

        if self.yet_to_stop.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.set_state_and_notify(ManagerState::Stopped);
        } else {
            self.wait_to_be_stopped();
        }

        info!("all io threads stopped; joining manager {} threads", self.id);
        let handles: Vec<JoinHandle<()>> = self.threads.lock().unwrap().drain(..).collect();
        for h in handles {
            let _ = h.join();
        }

        self.yet_to_start.store(0, Ordering::Release);
        self.expected_ifaces
            .store(INBUILT_INTERFACE_COUNT, Ordering::Release);
        self.drive_ifaces.write().unwrap().clear();
        *self.default_drive_iface.write().unwrap() = None;
        *self.default_general_iface.write().unwrap() = None;
        self.iface_list.write().unwrap().clear();
        self.fd_info_map.write().unwrap().clear();
        debug_assert_eq!(self.state(), ManagerState::Stopped);
    }

    pub fn state(&self) -> ManagerState {
        *self.state.lock().unwrap()
    }

    fn set_state_and_notify(&self, new_state: ManagerState) {
        let mut st = self.state.lock().unwrap();
        debug_assert!(
            new_state > *st,
            "state must move strictly forward: {:?} -> {:?}",
            *st,
            new_state
        );
        *st = new_state;
        self.state_cv.notify_all();
    }

    /// Block until the manager reaches `Running`.
    pub fn wait_to_be_ready(&self) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        while *st < ManagerState::Running {
            st = self.state_cv.wait(st).unwrap();
        }
        if *st > ManagerState::Running {
            return Err(IomgrError::NotRunning);
        }
        Ok(())
    }

    fn wait_to_be_stopped(&self) {
        let mut st = self.state.lock().unwrap();
        while *st < ManagerState::Stopped {
            st = self.state_cv.wait(st).unwrap();
        }
    }

    // ── Interface registration ────────────────────────────────────────

    pub fn add_interface(self: &Arc<Self>, iface: Arc<dyn IoInterface>) -> Result<()> {
        let iface_count = {
            let mut list = self.iface_list.write().unwrap();
            list.push(iface);
            list.len()
        };
        let expected = self.expected_ifaces.load(Ordering::Acquire);

        if iface_count == expected {
            info!(
                "registered expected {} interfaces, io manager waiting for threads",
                iface_count
            );
            let nthreads = self.yet_to_start.load(Ordering::Acquire);
            if nthreads > 0 {
                self.set_state_and_notify(ManagerState::WaitingForThreads);
                info!("starting {} io threads", nthreads);
                let prefix = self.thread_name_prefix.lock().unwrap().clone();
                let mut handles = self.threads.lock().unwrap();
                for i in 0..nthreads {
                    let mgr = Arc::clone(self);
                    let handle = std::thread::Builder::new()
                        .name(format!("{}-{}", prefix, i))
                        .spawn(move || {
                            if let Err(e) = mgr.run_io_loop(true, None, None) {
                                error!("io thread exited with error: {}", e);
                            }
                        })
                        .map_err(|e| IomgrError::Os(e.raw_os_error().unwrap_or(libc::EAGAIN)))?;
                    handles.push(handle);
                    trace!("created io manager thread {}", i);
                }
            } else {
                self.set_state_and_notify(ManagerState::Running);
            }
        } else if iface_count < expected {
            info!(
                "only {} of {} expected interfaces registered, waiting for the rest",
                iface_count, expected
            );
        }
        Ok(())
    }

    pub fn add_drive_interface(
        self: &Arc<Self>,
        iface: Arc<dyn DriveInterface>,
        default_iface: bool,
    ) -> Result<()> {
        let base: Arc<dyn IoInterface> = iface.clone();
        self.add_interface(base)?;
        self.drive_ifaces.write().unwrap().push(Arc::clone(&iface));
        if default_iface {
            *self.default_drive_iface.write().unwrap() = Some(iface);
        }
        Ok(())
    }

    pub fn default_drive_interface(&self) -> Option<Arc<dyn DriveInterface>> {
        self.default_drive_iface.read().unwrap().clone()
    }

    pub fn default_general_interface(&self) -> Option<Arc<DefaultIoInterface>> {
        self.default_general_iface.read().unwrap().clone()
    }

    // ── Thread contexts ───────────────────────────────────────────────

    /// The calling thread's context, created and registered on first use.
    pub fn thread_ctx(self: &Arc<Self>) -> Arc<IoThreadContext> {
        THREAD_CTX.with(|cell| {
            let mut slot = cell.borrow_mut();
            if let Some((id, ctx)) = slot.as_ref() {
                if *id == self.id {
                    return Arc::clone(ctx);
                }
            }
            let ctx = Arc::new(IoThreadContext::new(
                self.next_thread_num.fetch_add(1, Ordering::Relaxed),
            ));
            self.registry.lock().unwrap().push(Arc::downgrade(&ctx));
            *slot = Some((self.id, Arc::clone(&ctx)));
            ctx
        })
    }

    /// The calling thread's context if one already exists for this manager.
    fn current_thread_ctx(&self) -> Option<Arc<IoThreadContext>> {
        THREAD_CTX.with(|cell| {
            cell.borrow()
                .as_ref()
                .filter(|(id, _)| *id == self.id)
                .map(|(_, ctx)| Arc::clone(ctx))
        })
    }

    /// Turn the calling thread into an I/O thread until relinquished.
    pub fn run_io_loop(
        self: &Arc<Self>,
        is_manager_thread: bool,
        fd_selector: Option<FdSelector>,
        msg_handler: Option<ThreadMsgHandler>,
    ) -> Result<()> {
        let ctx = self.thread_ctx();
        ctx.run(self, is_manager_thread, fd_selector, msg_handler)
    }

    pub(crate) fn io_thread_started(&self, is_manager_thread: bool) {
        self.yet_to_stop.fetch_add(1, Ordering::AcqRel);
        if is_manager_thread && self.yet_to_start.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.set_state_and_notify(ManagerState::Running);
        }
    }

    pub(crate) fn io_thread_stopped(&self) {
        if self.yet_to_stop.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.set_state_and_notify(ManagerState::Stopped);
        }
    }

    /// Visit every live thread context. The registry lock is held for
    /// the whole visit: visitors must not block.
    pub(crate) fn access_all_threads(&self, mut visitor: impl FnMut(&IoThreadContext)) {
        let mut registry = self.registry.lock().unwrap();
        registry.retain(|w| w.strong_count() > 0);
        for weak in registry.iter() {
            if let Some(ctx) = weak.upgrade() {
                visitor(&ctx);
            }
        }
    }

    pub(crate) fn access_specific_thread(
        &self,
        thread_num: u32,
        visitor: impl FnOnce(&IoThreadContext),
    ) -> bool {
        let registry = self.registry.lock().unwrap();
        for weak in registry.iter() {
            if let Some(ctx) = weak.upgrade() {
                if ctx.thread_num() == thread_num {
                    visitor(&ctx);
                    return true;
                }
            }
        }
        false
    }

    // ── FD registration ───────────────────────────────────────────────

    /// Factory for descriptor records.
    pub fn create_fd_info(
        &self,
        iface: &Arc<dyn IoInterface>,
        fd: RawFd,
        callback: EvCallback,
        events: u32,
        pri: u32,
        cookie: u64,
        is_global: bool,
    ) -> Arc<FdInfo> {
        Arc::new(FdInfo::new(
            fd,
            Some(Arc::downgrade(iface)),
            callback,
            events,
            pri,
            cookie,
            is_global,
        ))
    }

    /// Register an FD. Per-thread FDs go to the calling thread's context
    /// and work in any state; global FDs wait for `Running`, install on
    /// every current I/O thread and are picked up by threads that enter
    /// I/O-thread state later.
    #[allow(clippy::too_many_arguments)]
    pub fn add_fd(
        self: &Arc<Self>,
        iface: &Arc<dyn IoInterface>,
        fd: RawFd,
        callback: EvCallback,
        events: u32,
        pri: u32,
        cookie: u64,
        is_per_thread: bool,
    ) -> Result<Arc<FdInfo>> {
        if !is_per_thread && self.state() != ManagerState::Running {
            info!("io manager not ready to add fd {}, waiting for it", fd);
            self.wait_to_be_ready()?;
            info!("io manager ready, proceeding to add fd {}", fd);
        }

        trace!(
            "fd {} requested to be added to {} thread(s)",
            fd,
            if is_per_thread { "this" } else { "all" }
        );
        let info = self.create_fd_info(iface, fd, callback, events, pri, cookie, !is_per_thread);

        if is_per_thread {
            let ctx = self.thread_ctx();
            if ctx.is_fd_addable(&info) {
                ctx.add_fd_to_thread(Arc::clone(&info))?;
            }
        } else {
            self.access_all_threads(|ctx| {
                if ctx.is_io_thread() && ctx.is_fd_addable(&info) {
                    if let Err(e) = ctx.add_fd_to_thread(Arc::clone(&info)) {
                        warn!(
                            "failed to install global fd {} on thread {}: {}",
                            info.fd,
                            ctx.thread_num(),
                            e
                        );
                    }
                }
            });
            self.fd_info_map
                .write()
                .unwrap()
                .insert(fd, Arc::clone(&info));
        }
        Ok(info)
    }

    /// Unregister an FD. `ctx` selects the thread for per-thread FDs,
    /// defaulting to the caller's context.
    pub fn remove_fd(
        self: &Arc<Self>,
        _iface: &Arc<dyn IoInterface>,
        info: &Arc<FdInfo>,
        ctx: Option<&Arc<IoThreadContext>>,
    ) -> Result<()> {
        let state = self.state();
        if state != ManagerState::Running && state != ManagerState::Stopping {
            error!(
                "remove_fd for fd {} expects a running or stopping io manager (state {:?})",
                info.fd, state
            );
            return Err(IomgrError::NotRunning);
        }

        if info.is_global {
            self.access_all_threads(|tctx| {
                if tctx.is_io_thread() {
                    let _ = tctx.remove_fd_from_thread(info);
                }
            });
            self.fd_info_map.write().unwrap().remove(&info.fd);
            Ok(())
        } else {
            match ctx {
                Some(tctx) => tctx.remove_fd_from_thread(info),
                None => self.thread_ctx().remove_fd_from_thread(info),
            }
        }
    }

    pub fn fd_to_info(&self, fd: RawFd) -> Option<Arc<FdInfo>> {
        self.fd_info_map.read().unwrap().get(&fd).cloned()
    }

    pub fn foreach_fd_info(&self, mut cb: impl FnMut(&Arc<FdInfo>)) {
        for info in self.fd_info_map.read().unwrap().values() {
            cb(info);
        }
    }

    pub fn foreach_interface(&self, mut cb: impl FnMut(&Arc<dyn IoInterface>)) {
        for iface in self.iface_list.read().unwrap().iter() {
            cb(iface);
        }
    }

    // ── Messaging ─────────────────────────────────────────────────────

    /// Deliver `msg` to one thread (`thread_num >= 0`) or broadcast to
    /// every I/O thread (`thread_num == -1`). Returns how many threads
    /// accepted the message; a thread accepts iff it has a live message
    /// fd and is in I/O-thread state at the instant of send.
    pub fn send_msg(&self, thread_num: i32, msg: IoMsg) -> u32 {
        let mut sent_count = 0u32;
        if thread_num == -1 {
            if msg.kind() == MsgKind::RunClosure {
                error!("closure messages cannot be broadcast; dropping");
                debug_assert!(false, "broadcast of RunClosure");
                return 0;
            }
            self.access_all_threads(|ctx| {
                let Some(clone) = msg.try_clone() else { return };
                let mut slot = Some(clone);
                if Self::deliver(ctx, &mut slot) {
                    sent_count += 1;
                }
            });
        } else {
            let mut slot = Some(msg);
            self.access_specific_thread(thread_num as u32, |ctx| {
                if Self::deliver(ctx, &mut slot) {
                    sent_count = 1;
                }
            });
        }
        sent_count
    }

    fn deliver(ctx: &IoThreadContext, slot: &mut Option<IoMsg>) -> bool {
        let Some(msg_fd) = ctx.msg_fd_raw() else {
            return false;
        };
        if !ctx.is_io_thread() {
            return false;
        }
        trace!(
            "sending msg {:?} to thread {} msg fd {}",
            slot.as_ref().map(|m| m.kind()),
            ctx.thread_num(),
            msg_fd
        );
        let msg = slot.take().expect("message already consumed");
        if let Err(rejected) = ctx.put_msg(msg) {
            warn!("thread {} message queue is full", ctx.thread_num());
            *slot = Some(rejected);
            return false;
        }
        let _ = write_one_raw(msg_fd);
        true
    }

    /// Deliver to the I/O thread with the smallest operation count,
    /// retrying if the chosen thread relinquishes between selection and
    /// send. Fails only when no I/O thread exists at all.
    pub fn send_to_least_busy_thread(&self, msg: IoMsg) -> Result<()> {
        let mut slot = Some(msg);
        loop {
            let Some(min_id) = self.find_least_busy_thread_id() else {
                return Err(IomgrError::NoIoThread);
            };
            let mut sent = false;
            self.access_specific_thread(min_id, |ctx| {
                sent = Self::deliver(ctx, &mut slot);
            });
            if sent {
                return Ok(());
            }
            // The thread went away between selection and send; pick again.
            std::thread::yield_now();
        }
    }

    fn find_least_busy_thread_id(&self) -> Option<u32> {
        let mut min: Option<(u64, u32)> = None;
        self.access_all_threads(|ctx| {
            if !ctx.is_io_thread() {
                return;
            }
            let count = ctx.op_count();
            if min.map_or(true, |(min_count, _)| count < min_count) {
                min = Some((count, ctx.thread_num()));
            }
        });
        min.map(|(_, id)| id)
    }

    /// Move a readiness invocation for a registered global FD to the
    /// least busy I/O thread.
    pub fn fd_reschedule(self: &Arc<Self>, fd: RawFd, events: u32) -> Result<()> {
        let info = self
            .fd_to_info(fd)
            .ok_or(IomgrError::UnknownFd(fd))?;
        self.fd_reschedule_info(info, events)
    }

    pub fn fd_reschedule_info(self: &Arc<Self>, info: Arc<FdInfo>, events: u32) -> Result<()> {
        if let Some(ctx) = self.current_thread_ctx() {
            if ctx.is_io_thread() {
                ctx.metrics.rescheduled_out.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.send_to_least_busy_thread(IoMsg::reschedule(info, events))
    }

    /// Run a closure in I/O context on the least busy thread. The
    /// closure's storage travels with the message and is released by the
    /// receiving thread after invocation.
    pub fn run_in_io_thread(&self, f: impl FnOnce() + Send + 'static) -> Result<()> {
        self.send_to_least_busy_thread(IoMsg::run_closure(f))
    }

    pub(crate) fn handle_msg_default(&self, msg: IoMsg) {
        match self.default_msg_handler.read().unwrap().as_ref() {
            Some(handler) => handler(msg),
            None => warn!("no handler for custom message {:?}", msg),
        }
    }

    // ── Timer ─────────────────────────────────────────────────────────

    /// Install the process-wide timer; the manager releases it (and its
    /// descriptor) during `stop()`.
    pub fn set_global_timer(&self, timer: Timer) {
        *self.global_timer.lock().unwrap() = Some(timer);
    }
}
