//! Interface traits — the polymorphic seams of the I/O manager.
//!
//! Every FD owner implements [`IoInterface`]; block-device drivers
//! additionally implement [`DriveInterface`] with the eight I/O
//! primitives (read/write x sync/async x contiguous/vector).
//!
//! Thread lifecycle hooks receive a [`ThreadContext`] capability handle
//! rather than a concrete runtime type: implementations can install and
//! tear down their per-thread resources (event fds, AIO contexts)
//! without depending on the runtime crate.

use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::fd_info::FdInfo;

/// Completion callback for asynchronous drive I/O: `(result, cookie)`.
/// `result` is the byte count, or a negative errno. Invoked on the
/// thread that submitted the request.
pub type CompletionCb = Arc<dyn Fn(i64, u64) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterfaceKind {
    /// The manager's inbuilt general-purpose interface.
    General,
    /// The Linux-native AIO block driver.
    AioDrive,
    /// Application-defined interfaces.
    Custom(u32),
}

/// Capabilities a thread context exposes to interfaces while they run
/// inside its start/stop hooks (and to any code holding a context).
pub trait ThreadContext: Send + Sync {
    /// Stable ordinal of this thread for the thread's lifetime.
    fn thread_num(&self) -> u32;

    /// Whether the thread currently dispatches readiness events.
    fn is_io_thread(&self) -> bool;

    /// Install a descriptor on this thread's multiplexer.
    fn add_fd(&self, info: Arc<FdInfo>) -> Result<()>;

    /// Uninstall a descriptor from this thread's multiplexer.
    fn remove_fd(&self, info: &Arc<FdInfo>) -> Result<()>;
}

pub trait IoInterface: Send + Sync {
    fn interface_kind(&self) -> InterfaceKind;

    /// Install the callback invoked on every asynchronous I/O completion.
    fn attach_completion_cb(&self, cb: CompletionCb);

    /// Called by a thread's context as it enters I/O-thread state.
    /// Initialise thread-local resources and register per-thread FDs here.
    fn on_io_thread_start(&self, ctx: &dyn ThreadContext);

    /// Called by a thread's context as it leaves I/O-thread state.
    fn on_io_thread_stopped(&self, ctx: &dyn ThreadContext);
}

/// Block-device specialisation.
///
/// The async variants take raw buffer pointers because the buffer must
/// outlive the submission: the caller keeps it alive until the
/// completion callback fires with the matching `cookie`. The sync
/// variants borrow and may therefore use slices.
pub trait DriveInterface: IoInterface {
    /// Open a device node or file with flags suitable for AIO.
    fn open_dev(&self, path: &Path, oflags: i32) -> Result<RawFd>;

    fn sync_read(&self, fd: RawFd, buf: &mut [u8], offset: u64) -> Result<usize>;
    fn sync_write(&self, fd: RawFd, buf: &[u8], offset: u64) -> Result<usize>;
    fn sync_readv(&self, fd: RawFd, iov: &[libc::iovec], size: u32, offset: u64) -> Result<usize>;
    fn sync_writev(&self, fd: RawFd, iov: &[libc::iovec], size: u32, offset: u64) -> Result<usize>;

    fn async_read(&self, fd: RawFd, buf: *mut u8, size: u32, offset: u64, cookie: u64)
        -> Result<()>;
    fn async_write(
        &self,
        fd: RawFd,
        buf: *const u8,
        size: u32,
        offset: u64,
        cookie: u64,
    ) -> Result<()>;
    fn async_readv(
        &self,
        fd: RawFd,
        iov: *const libc::iovec,
        iovcnt: i32,
        size: u32,
        offset: u64,
        cookie: u64,
    ) -> Result<()>;
    fn async_writev(
        &self,
        fd: RawFd,
        iov: *const libc::iovec,
        iovcnt: i32,
        size: u32,
        offset: u64,
        cookie: u64,
    ) -> Result<()>;
}
