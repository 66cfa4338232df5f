//! Linux system api.
//!
//! The narrow slice of the OS the event loops need:
//!
//! * an I/O event notification queue backed by epoll ([`Poller`])
//! * a pipe used to wake a blocked poller from another thread ([`Awakener`])
//! * raw fd read/write helpers and socket option setters

pub(crate) mod awakener;
pub(crate) mod event;
pub(crate) mod io;
pub(crate) mod poller;
pub(crate) mod socket;

pub(crate) use self::awakener::Awakener;
pub(crate) use self::event::{PollOpt, Ready, Token};
pub(crate) use self::poller::{Events, Poller};

/// Token the awakener's read end is registered under.
///
/// Every other token is the fd of the registered descriptor, and fds are
/// never negative.
pub(crate) const AWAKENER_TOKEN: Token = Token(usize::MAX);
