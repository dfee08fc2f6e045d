//! Tunable constants shared by the manager and the AIO driver.

/// Upper bound on in-flight AIO submissions per worker thread.
/// `io_submit` starts failing past this on stock kernels.
pub const MAX_OUTSTANDING_IO: usize = 200;

/// How many completion events to harvest in one `io_getevents` call.
pub const MAX_COMPLETIONS: usize = MAX_OUTSTANDING_IO;

/// Priorities run 0..MAX_PRI-1.
pub const MAX_PRI: u32 = 10;

/// Default priority assigned to a registered FD.
pub const DEFAULT_FD_PRI: u32 = 9;

/// Depth of the per-thread control-message queue.
pub const MSG_QUEUE_DEPTH: usize = 4096;

/// Interfaces the manager installs on its own during `start()`.
pub const INBUILT_INTERFACE_COUNT: usize = 1;
