//! iomgr error types.

use std::fmt;

#[derive(Debug)]
pub enum IomgrError {
    /// OS error with errno.
    Os(i32),
    /// Manager is not in (or past) the running state.
    NotRunning,
    /// The calling thread has no live event loop.
    NotIoThread,
    /// No thread in the pool is currently an I/O thread.
    NoIoThread,
    /// The target thread's message queue is full.
    MsgQueueFull,
    /// AIO submission was rejected with a hard error (negative errno).
    SubmitFailed(i32),
    /// The descriptor is not registered with the manager.
    UnknownFd(i32),
}

impl IomgrError {
    /// Capture the calling thread's errno.
    pub fn last_os() -> Self {
        Self::Os(unsafe { *libc::__errno_location() })
    }

    /// The errno carried by this error, if any.
    pub fn os_err(&self) -> Option<i32> {
        match self {
            Self::Os(e) | Self::SubmitFailed(e) => Some(*e),
            _ => None,
        }
    }
}

impl fmt::Display for IomgrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Os(e) => write!(f, "OS error: errno {}", e),
            Self::NotRunning => write!(f, "io manager not running"),
            Self::NotIoThread => write!(f, "calling thread is not an io thread"),
            Self::NoIoThread => write!(f, "no io thread available"),
            Self::MsgQueueFull => write!(f, "thread message queue full"),
            Self::SubmitFailed(e) => write!(f, "aio submission failed: errno {}", e),
            Self::UnknownFd(fd) => write!(f, "fd {} is not registered", fd),
        }
    }
}

impl std::error::Error for IomgrError {}

pub type Result<T> = std::result::Result<T, IomgrError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_errno() {
        let e = IomgrError::Os(libc::EAGAIN);
        assert!(e.to_string().contains(&libc::EAGAIN.to_string()));
        assert_eq!(e.os_err(), Some(libc::EAGAIN));
    }

    #[test]
    fn non_os_errors_have_no_errno() {
        assert_eq!(IomgrError::NotRunning.os_err(), None);
        assert_eq!(IomgrError::NoIoThread.os_err(), None);
    }
}
