//! # iomgr — per-process I/O manager runtime
//!
//! Owns a pool of dedicated I/O worker threads, multiplexes FD readiness
//! to them over epoll, brokers cross-thread control messages over
//! per-thread event fds, and drives asynchronous block I/O through the
//! Linux-native AIO interface with per-thread submission-slot pools.
//!
//! The embedding flow:
//! 1. `IoManager::start(expected_custom_ifaces, num_threads, handler)`
//! 2. register interfaces (`add_interface` / `add_drive_interface`)
//!    until the expected count is reached — the thread pool then spins up
//! 3. register FDs (`add_fd`), submit block I/O through a
//!    [`AioDriveInterface`], push work with `run_in_io_thread`
//! 4. `stop()` relinquishes every loop, joins the pool and tears down
//!
//! All callbacks — readiness, message closures, AIO completions — run on
//! I/O threads, never on the submitting caller's thread.

pub mod aio_drive;
pub mod default_interface;
pub mod epoll;
pub mod eventfd;
pub mod io_thread;
pub mod manager;
pub mod metrics;
pub mod timer;

pub use aio_drive::AioDriveInterface;
pub use default_interface::DefaultIoInterface;
pub use io_thread::{FdSelector, IoThreadContext, ThreadMsgHandler};
pub use manager::{IoManager, IomgrConfig, ManagerState, MsgHandler};
pub use timer::Timer;

pub use iomgr_core::{
    constants, CompletionCb, Direction, DriveInterface, EvCallback, FdInfo, InterfaceKind, IoInterface,
    IoMsg, IomgrError, MsgKind, Result, ThreadContext,
};
