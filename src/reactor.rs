//! Readiness notification over epoll, level-triggered.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};
use nix::unistd::close;

const MAX_EVENTS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

/// What a descriptor is ready for, restricted to its registered interests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct Registration {
    read: bool,
    write: bool,
}

impl Registration {
    fn flags(self) -> EpollFlags {
        let mut flags = EpollFlags::empty();
        if self.read {
            flags |= EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP;
        }
        if self.write {
            flags |= EpollFlags::EPOLLOUT;
        }
        flags
    }

    fn is_empty(self) -> bool {
        !self.read && !self.write
    }
}

#[derive(Debug)]
pub struct Reactor {
    epfd: RawFd,
    registrations: HashMap<RawFd, Registration>,
    events: Vec<EpollEvent>,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        let epfd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Self {
            epfd,
            registrations: HashMap::new(),
            events: vec![EpollEvent::empty(); MAX_EVENTS],
        })
    }

    pub fn is_watched(&self, fd: RawFd, interest: Interest) -> bool {
        self.registrations
            .get(&fd)
            .map_or(false, |registration| match interest {
                Interest::Read => registration.read,
                Interest::Write => registration.write,
            })
    }

    /// Add `interest` for `fd`. Watching an interest twice is harmless.
    pub fn watch(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let existing = self.registrations.get(&fd).copied();
        let mut registration = existing.unwrap_or_default();
        match interest {
            Interest::Read => registration.read = true,
            Interest::Write => registration.write = true,
        }
        let mut event = EpollEvent::new(registration.flags(), fd as u64);
        let op = if existing.is_some() {
            EpollOp::EpollCtlMod
        } else {
            EpollOp::EpollCtlAdd
        };
        epoll_ctl(self.epfd, op, fd, &mut event)?;
        self.registrations.insert(fd, registration);
        Ok(())
    }

    /// Drop `interest` for `fd`; the registration goes away with its last interest.
    pub fn unwatch(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut registration = match self.registrations.get(&fd) {
            Some(registration) => *registration,
            None => return Ok(()),
        };
        match interest {
            Interest::Read => registration.read = false,
            Interest::Write => registration.write = false,
        }
        if registration.is_empty() {
            self.registrations.remove(&fd);
            epoll_ctl(self.epfd, EpollOp::EpollCtlDel, fd, &mut EpollEvent::empty())?;
        } else {
            let mut event = EpollEvent::new(registration.flags(), fd as u64);
            epoll_ctl(self.epfd, EpollOp::EpollCtlMod, fd, &mut event)?;
            self.registrations.insert(fd, registration);
        }
        Ok(())
    }

    /// Block until a watched descriptor is ready or `timeout` passes (empty result).
    ///
    /// A signal arriving during the wait surfaces as `ErrorKind::Interrupted`.
    pub fn wait(&mut self, timeout: Duration) -> io::Result<Vec<(RawFd, Readiness)>> {
        let timeout_ms = isize::try_from(timeout.as_millis()).unwrap_or(isize::MAX);
        let count = epoll_wait(self.epfd, &mut self.events, timeout_ms)?;
        let ready = self.events[..count]
            .iter()
            .filter_map(|event| {
                let fd = event.data() as RawFd;
                let registration = self.registrations.get(&fd)?;
                let flags = event.events();
                let failed = flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR);
                let readiness = Readiness {
                    readable: registration.read
                        && (failed
                            || flags.intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP)),
                    writable: registration.write
                        && (failed || flags.contains(EpollFlags::EPOLLOUT)),
                };
                (readiness.readable || readiness.writable).then(|| (fd, readiness))
            })
            .collect();
        Ok(ready)
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        let _ = close(self.epfd);
    }
}
