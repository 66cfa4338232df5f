//! Readiness event types.

use std::{fmt, ops};

/// Associates readiness notifications with the descriptor they belong to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Token(pub(crate) usize);

/// Options supplied when registering a descriptor with the poller.
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord)]
pub(crate) struct PollOpt(usize);

const EDGE: usize = 0b001;
const LEVEL: usize = 0b010;
const ONESHOT: usize = 0b100;

impl PollOpt {
    /// Edge-triggered notifications.
    pub(crate) fn edge() -> PollOpt {
        PollOpt(EDGE)
    }

    /// Level-triggered notifications.
    pub(crate) fn level() -> PollOpt {
        PollOpt(LEVEL)
    }

    /// Disarm after the first notification.
    #[allow(dead_code)]
    pub(crate) fn oneshot() -> PollOpt {
        PollOpt(ONESHOT)
    }

    pub(crate) fn is_edge(self) -> bool {
        self.0 & EDGE != 0
    }

    pub(crate) fn is_oneshot(self) -> bool {
        self.0 & ONESHOT != 0
    }

    pub(crate) fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl ops::BitOr for PollOpt {
    type Output = PollOpt;

    fn bitor(self, other: PollOpt) -> PollOpt {
        PollOpt(self.0 | other.0)
    }
}

impl fmt::Debug for PollOpt {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = [(EDGE, "Edge"), (LEVEL, "Level"), (ONESHOT, "OneShot")];
        let mut one = false;
        for &(flag, msg) in flags.iter() {
            if self.0 & flag != 0 {
                if one {
                    write!(fmt, " | ")?
                }
                write!(fmt, "{}", msg)?;
                one = true
            }
        }
        if self.is_empty() {
            fmt.write_str("(empty)")?;
        }
        Ok(())
    }
}

/// A set of readiness event kinds.
///
/// `error` and `hup` are only ever reported, never requested.
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord)]
pub(crate) struct Ready(usize);

const READABLE: usize = 0b0001;
const WRITABLE: usize = 0b0010;
const ERROR: usize = 0b0100;
const HUP: usize = 0b1000;

impl Ready {
    pub(crate) fn empty() -> Ready {
        Ready(0)
    }

    pub(crate) fn readable() -> Ready {
        Ready(READABLE)
    }

    pub(crate) fn writable() -> Ready {
        Ready(WRITABLE)
    }

    pub(crate) fn error() -> Ready {
        Ready(ERROR)
    }

    pub(crate) fn hup() -> Ready {
        Ready(HUP)
    }

    pub(crate) fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn is_readable(self) -> bool {
        self.contains(Ready::readable())
    }

    pub(crate) fn is_writable(self) -> bool {
        self.contains(Ready::writable())
    }

    pub(crate) fn is_error(self) -> bool {
        self.contains(Ready::error())
    }

    pub(crate) fn is_hup(self) -> bool {
        self.contains(Ready::hup())
    }

    pub(crate) fn contains(self, other: Ready) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl ops::BitOr for Ready {
    type Output = Ready;

    fn bitor(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }
}

impl ops::BitOrAssign for Ready {
    fn bitor_assign(&mut self, other: Ready) {
        self.0 |= other.0;
    }
}

impl ops::Sub for Ready {
    type Output = Ready;

    fn sub(self, other: Ready) -> Ready {
        Ready(self.0 & !other.0)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = [
            (Ready::readable(), "Readable"),
            (Ready::writable(), "Writable"),
            (Ready::error(), "Error"),
            (Ready::hup(), "Hup"),
        ];
        let mut one = false;
        for &(flag, msg) in flags.iter() {
            if self.contains(flag) {
                if one {
                    write!(fmt, " | ")?
                }
                write!(fmt, "{}", msg)?;
                one = true
            }
        }
        if self.is_empty() {
            fmt.write_str("(empty)")?;
        }
        Ok(())
    }
}

/// A readiness event returned by [`Poller::wait`](super::Poller::wait).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Event {
    kind: Ready,
    token: Token,
}

impl Event {
    pub(crate) fn new(kind: Ready, token: Token) -> Event {
        Event { kind, token }
    }

    pub(crate) fn readiness(&self) -> Ready {
        self.kind
    }

    pub(crate) fn token(&self) -> Token {
        self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_ops() {
        let mut r = Ready::readable();
        assert!(r.is_readable() && !r.is_writable());
        r |= Ready::writable();
        assert!(r.is_writable());
        assert_eq!(r - Ready::readable(), Ready::writable());
        assert!(Ready::empty().is_empty());
        assert!((Ready::hup() | Ready::error()).is_hup());
        assert_eq!(format!("{:?}", r), "Readable | Writable");
    }

    #[test]
    fn poll_opts() {
        let opt = PollOpt::edge() | PollOpt::oneshot();
        assert!(opt.is_edge() && opt.is_oneshot());
        assert!(!PollOpt::level().is_edge());
        assert_eq!(format!("{:?}", PollOpt::level()), "Level");
        assert!(PollOpt(0).is_empty());
        assert_eq!(format!("{:?}", PollOpt(0)), "(empty)");
    }
}
