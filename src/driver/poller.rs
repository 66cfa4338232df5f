use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use libc::{EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

use super::event::{Event, PollOpt, Ready, Token};
use super::io::cvt;

/// An epoll instance.
#[derive(Debug)]
pub(crate) struct Poller {
    epfd: RawFd,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Poller> {
        let epfd = unsafe { cvt(libc::epoll_create1(libc::EPOLL_CLOEXEC))? };
        Ok(Poller { epfd })
    }

    /// Blocks until at least one registered descriptor is ready or `timeout`
    /// elapses. An interrupted wait returns with no events.
    pub(crate) fn wait(&self, evts: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout_ms = timeout
            .map(|to| {
                let ms = to.as_millis();
                // round sub-millisecond waits up so they do not spin
                let ms = if ms == 0 && to.as_nanos() > 0 { 1 } else { ms };
                ms.min(libc::c_int::max_value() as u128) as libc::c_int
            })
            .unwrap_or(-1);

        evts.clear();
        let cnt = unsafe {
            libc::epoll_wait(
                self.epfd,
                evts.events.as_mut_ptr(),
                evts.events.capacity() as libc::c_int,
                timeout_ms,
            )
        };
        match cvt(cnt) {
            Ok(cnt) => {
                unsafe { evts.events.set_len(cnt as usize) };
                Ok(())
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn register(
        &self,
        fd: RawFd,
        token: Token,
        interests: Ready,
        opts: PollOpt,
    ) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interests, opts)
    }

    pub(crate) fn reregister(
        &self,
        fd: RawFd,
        token: Token,
        interests: Ready,
        opts: PollOpt,
    ) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interests, opts)
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        // pre-2.6.9 kernels want a non-null event even for DEL
        let mut info = libc::epoll_event { events: 0, u64: 0 };
        unsafe {
            cvt(libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut info))?;
        }
        Ok(())
    }

    fn ctl(
        &self,
        op: libc::c_int,
        fd: RawFd,
        token: Token,
        interests: Ready,
        opts: PollOpt,
    ) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: ioevent_to_epoll(interests, opts),
            u64: token.0 as u64,
        };
        unsafe {
            cvt(libc::epoll_ctl(self.epfd, op, fd, &mut info))?;
        }
        Ok(())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.epfd);
        }
    }
}

fn ioevent_to_epoll(interest: Ready, opts: PollOpt) -> u32 {
    let mut kind = 0;
    if interest.is_readable() {
        kind |= EPOLLIN | EPOLLRDHUP;
    }
    if interest.is_writable() {
        kind |= EPOLLOUT;
    }
    if opts.is_edge() {
        kind |= EPOLLET;
    }
    if opts.is_oneshot() {
        kind |= EPOLLONESHOT;
    }
    kind as u32
}

/// Buffer of readiness events filled by [`Poller::wait`].
pub(crate) struct Events {
    events: Vec<libc::epoll_event>,
}

impl Events {
    pub(crate) fn with_capacity(u: usize) -> Events {
        Events {
            events: Vec::with_capacity(u),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }

    pub(crate) fn get(&self, idx: usize) -> Option<Event> {
        self.events.get(idx).map(|event| {
            let epoll = event.events as libc::c_int;
            let mut kind = Ready::empty();

            if (epoll & EPOLLIN) != 0 || (epoll & EPOLLPRI) != 0 {
                kind |= Ready::readable();
            }
            if (epoll & EPOLLOUT) != 0 {
                kind |= Ready::writable();
            }
            if (epoll & EPOLLERR) != 0 {
                kind |= Ready::error();
            }
            if (epoll & EPOLLRDHUP) != 0 || (epoll & EPOLLHUP) != 0 {
                kind |= Ready::hup();
            }

            let token = event.u64;
            Event::new(kind, Token(token as usize))
        })
    }

    fn clear(&mut self) {
        unsafe {
            self.events.set_len(0);
        }
    }
}

impl std::fmt::Debug for Events {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Events").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Awakener;

    #[test]
    fn awakener_readiness() {
        let poller = Poller::new().unwrap();
        let awakener = Awakener::new().unwrap();
        poller
            .register(
                awakener.reader_fd(),
                Token(7),
                Ready::readable(),
                PollOpt::level(),
            )
            .unwrap();

        let mut events = Events::with_capacity(8);
        poller
            .wait(&mut events, Some(Duration::from_millis(10)))
            .unwrap();
        assert_eq!(events.len(), 0);

        awakener.wakeup().unwrap();
        poller.wait(&mut events, None).unwrap();
        assert_eq!(events.len(), 1);
        let event = events.get(0).unwrap();
        assert_eq!(event.token(), Token(7));
        assert!(event.readiness().is_readable());

        awakener.cleanup();
        poller.deregister(awakener.reader_fd()).unwrap();
    }
}
