//! `DefaultIoInterface` — the manager's inbuilt general-purpose interface.
//!
//! Installed by `IoManager::start()` and counted in
//! `INBUILT_INTERFACE_COUNT`. Owns no descriptors of its own; it exists
//! so application FDs (and the global timer) have an owning interface
//! without the application defining one.

use std::sync::{Arc, RwLock};

use iomgr_core::{CompletionCb, InterfaceKind, IoInterface, ThreadContext};

pub struct DefaultIoInterface {
    comp_cb: RwLock<Option<CompletionCb>>,
}

impl DefaultIoInterface {
    pub fn new() -> Arc<Self> {
        Arc::new(DefaultIoInterface {
            comp_cb: RwLock::new(None),
        })
    }

    pub fn completion_cb(&self) -> Option<CompletionCb> {
        self.comp_cb.read().unwrap().clone()
    }
}

impl IoInterface for DefaultIoInterface {
    fn interface_kind(&self) -> InterfaceKind {
        InterfaceKind::General
    }

    fn attach_completion_cb(&self, cb: CompletionCb) {
        *self.comp_cb.write().unwrap() = Some(cb);
    }

    fn on_io_thread_start(&self, _ctx: &dyn ThreadContext) {}

    fn on_io_thread_stopped(&self, _ctx: &dyn ThreadContext) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn completion_cb_attach_and_invoke() {
        let iface = DefaultIoInterface::new();
        assert!(iface.completion_cb().is_none());
        assert_eq!(iface.interface_kind(), InterfaceKind::General);

        let hits = Arc::new(AtomicU64::new(0));
        let hits2 = Arc::clone(&hits);
        iface.attach_completion_cb(Arc::new(move |res, cookie| {
            assert_eq!(res, 512);
            assert_eq!(cookie, 7);
            hits2.fetch_add(1, Ordering::Relaxed);
        }));
        (iface.completion_cb().unwrap())(512, 7);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }
}
