//! Platform readiness-notification backend.
//!
//! The poller is the reactor's window onto the kernel: it registers
//! descriptors with read/write interests, blocks for readiness, and
//! reports level-triggered events. Handlers driven from these events
//! must tolerate being invoked repeatedly while a condition persists.
//!
//! Only the Linux `epoll` backend is provided.

pub(crate) mod common;

pub(crate) use common::Waker;

#[cfg(target_os = "linux")]
mod epoll;

#[cfg(target_os = "linux")]
pub(crate) type Poller = epoll::EpollPoller;
