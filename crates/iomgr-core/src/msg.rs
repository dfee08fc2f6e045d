//! `IoMsg` — in-band control messages delivered over a thread's message fd.
//!
//! Messages are values until handed to a target thread's queue. The
//! `RunClosure` payload is owned by the message, so handing the message
//! over transfers the closure to the receiving thread, which drops it
//! after invocation — the release-after-execution contract is enforced
//! by move semantics rather than by convention.

use std::sync::Arc;

use crate::fd_info::FdInfo;

/// Heap-allocated closure executed once in I/O-thread context.
pub type RunMethod = Box<dyn FnOnce() + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgKind {
    Reschedule,
    RunClosure,
    Relinquish,
    Custom,
}

pub enum IoMsg {
    /// Re-deliver a readiness invocation for `fd` on the receiving thread.
    Reschedule { fd: Arc<FdInfo>, events: u32 },
    /// Execute the closure on the receiving thread, then drop it.
    RunClosure(RunMethod),
    /// Leave I/O-thread state and exit the event loop.
    Relinquish,
    /// Anything else; routed to the thread's override handler if present,
    /// falling back to the manager's default handler.
    Custom { tag: u32 },
}

impl IoMsg {
    pub fn reschedule(fd: Arc<FdInfo>, events: u32) -> Self {
        IoMsg::Reschedule { fd, events }
    }

    pub fn run_closure(f: impl FnOnce() + Send + 'static) -> Self {
        IoMsg::RunClosure(Box::new(f))
    }

    pub fn kind(&self) -> MsgKind {
        match self {
            IoMsg::Reschedule { .. } => MsgKind::Reschedule,
            IoMsg::RunClosure(_) => MsgKind::RunClosure,
            IoMsg::Relinquish => MsgKind::Relinquish,
            IoMsg::Custom { .. } => MsgKind::Custom,
        }
    }

    /// Clone for broadcast delivery. Closures are single-shot and cannot
    /// be duplicated; every other variant clones cheaply.
    pub fn try_clone(&self) -> Option<IoMsg> {
        match self {
            IoMsg::Reschedule { fd, events } => Some(IoMsg::Reschedule {
                fd: Arc::clone(fd),
                events: *events,
            }),
            IoMsg::RunClosure(_) => None,
            IoMsg::Relinquish => Some(IoMsg::Relinquish),
            IoMsg::Custom { tag } => Some(IoMsg::Custom { tag: *tag }),
        }
    }
}

impl std::fmt::Debug for IoMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoMsg::Reschedule { fd, events } => f
                .debug_struct("Reschedule")
                .field("fd", &fd.fd)
                .field("events", events)
                .finish(),
            IoMsg::RunClosure(_) => f.write_str("RunClosure(..)"),
            IoMsg::Relinquish => f.write_str("Relinquish"),
            IoMsg::Custom { tag } => f.debug_struct("Custom").field("tag", tag).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn kinds_match_variants() {
        assert_eq!(IoMsg::Relinquish.kind(), MsgKind::Relinquish);
        assert_eq!(IoMsg::Custom { tag: 7 }.kind(), MsgKind::Custom);
        assert_eq!(IoMsg::run_closure(|| {}).kind(), MsgKind::RunClosure);
    }

    #[test]
    fn closure_runs_once_and_is_consumed() {
        static HITS: AtomicUsize = AtomicUsize::new(0);
        let msg = IoMsg::run_closure(|| {
            HITS.fetch_add(1, Ordering::Relaxed);
        });
        match msg {
            IoMsg::RunClosure(f) => f(),
            _ => unreachable!(),
        }
        assert_eq!(HITS.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn broadcastable_variants_clone() {
        assert!(IoMsg::Relinquish.try_clone().is_some());
        assert!(IoMsg::Custom { tag: 1 }.try_clone().is_some());
        assert!(IoMsg::run_closure(|| {}).try_clone().is_none());

        let fd = Arc::new(FdInfo::new(5, None, Box::new(|_, _, _| {}), 1, 9, 42, true));
        let msg = IoMsg::reschedule(Arc::clone(&fd), 1);
        let dup = msg.try_clone().expect("reschedule clones");
        match dup {
            IoMsg::Reschedule { fd: f, events } => {
                assert_eq!(f.fd, 5);
                assert_eq!(events, 1);
            }
            _ => unreachable!(),
        }
        // Both the original and the clone share the descriptor record.
        assert_eq!(Arc::strong_count(&fd), 3);
    }
}
