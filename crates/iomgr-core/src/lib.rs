//! # iomgr-core — Trait boundaries for the iomgr I/O manager
//!
//! This crate defines the seams of the I/O manager: the registered-FD
//! record, the cross-thread control message, the interface traits every
//! FD owner implements, and the error type. The runtime crate (`iomgr`)
//! implements the event loops, the manager and the AIO driver against
//! these traits; nothing here touches the kernel.
//!
//! ## Design principle
//!
//! > "Program to the interface. The manager never depends on a concrete
//! >  interface type, and interfaces never depend on the manager."
//!
//! Interfaces receive their thread lifecycle hooks through the
//! [`ThreadContext`] capability trait, so an interface crate can be
//! compiled and tested without the runtime.

pub mod constants;
pub mod error;
pub mod fd_info;
pub mod interface;
pub mod msg;

pub use error::{IomgrError, Result};
pub use fd_info::{Direction, EvCallback, FdInfo};
pub use interface::{CompletionCb, DriveInterface, InterfaceKind, IoInterface, ThreadContext};
pub use msg::{IoMsg, MsgKind, RunMethod};
