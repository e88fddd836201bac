use std::cmp::min;
use std::io;
use std::io::ErrorKind;
use std::ops::Deref;
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Pass this as timeout to block until the event fires
pub const INFINITE: u64 = u64::MAX;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventWaitType {
    /// uninitialized event
    Invalid,
    /// placeholder that never fires - it keeps positions in an [crate::event_set::EventSet] stable
    ///  without repacking the wait list
    Dummy,
    /// application triggered signal
    Signal,
    /// socket is readable
    Read,
    /// socket is writable
    Write,
}

/// WaitableEvent is a flag that is either 'set' or 'cleared', and that a thread can block on
///  without busy waiting. It represents either an application triggered signal (backed by a
///  non-blocking pipe) or read / write readiness of a socket, so that a mixture of both can be
///  waited on in a single `poll()` call (see [crate::event_set::EventSet]).
///
/// NB: This is a *handle* to an OS object with explicit lifecycle, not an RAII wrapper:
/// * [WaitableEvent::default] creates a null event
/// * clones are aliases of the same OS object - it does not matter which of them is set or waited on
/// * [WaitableEvent::create] does *not* close a previously created OS object
/// * dropping does *not* close the OS object; call [WaitableEvent::close] exactly once. All
///    aliases are invalid after that, using them is a bug.
///
/// [OwnedEvent] closes the event on drop for code that has a single owner.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WaitableEvent {
    kind: EventWaitType,
    /// fd[0] is the pipe's read end or the wrapped socket, fd[1] the pipe's write end
    fd: [RawFd; 2],
}

impl Default for WaitableEvent {
    fn default() -> Self {
        Self::null()
    }
}

impl WaitableEvent {
    pub const fn null() -> WaitableEvent {
        WaitableEvent {
            kind: EventWaitType::Invalid,
            fd: [-1, -1],
        }
    }

    pub fn new(kind: EventWaitType) -> io::Result<WaitableEvent> {
        let mut result = WaitableEvent::null();
        result.create(kind)?;
        Ok(result)
    }

    /// Wraps a socket's read or write readiness. The event does not own the socket, and closing
    ///  the event leaves the socket open.
    pub fn from_socket(socket: &impl AsRawFd, kind: EventWaitType) -> WaitableEvent {
        assert!(matches!(kind, EventWaitType::Read | EventWaitType::Write), "socket events are either Read or Write, not {:?}", kind);
        WaitableEvent {
            kind,
            fd: [socket.as_raw_fd(), -1],
        }
    }

    /// Initializes this event with a new OS object. If it was previously initialized, the
    ///  previous OS object is *not* closed.
    pub fn create(&mut self, kind: EventWaitType) -> io::Result<()> {
        match kind {
            EventWaitType::Signal => {
                self.fd = create_nonblocking_pipe()?;
            }
            EventWaitType::Invalid | EventWaitType::Dummy => {
                self.fd = [-1, -1];
            }
            EventWaitType::Read | EventWaitType::Write => {
                return Err(io::Error::new(ErrorKind::InvalidInput, "socket events are created from a socket"));
            }
        }
        self.kind = kind;
        Ok(())
    }

    pub fn close(&mut self) {
        if self.kind == EventWaitType::Signal {
            trace!("closing signal event {:?}", self.fd);
            for fd in self.fd {
                // SAFETY: both ends were created by `create_nonblocking_pipe`
                unsafe { libc::close(fd); }
            }
        }
        *self = WaitableEvent::null();
    }

    pub fn is_null(&self) -> bool {
        self.kind == EventWaitType::Invalid
    }

    pub fn is_valid(&self) -> bool {
        !self.is_null()
    }

    pub fn kind(&self) -> EventWaitType {
        self.kind
    }

    /// Clears a signal event. Socket readiness is controlled by the socket, so this is a no-op
    ///  for socket events.
    pub fn reset(&self) {
        if self.kind != EventWaitType::Signal {
            return;
        }

        let mut buf = [0u8; 64];
        loop {
            // SAFETY: fd[0] is the non-blocking read end of the pipe, buf is valid
            let ret = unsafe { libc::read(self.fd[0], buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if ret <= 0 {
                break;
            }
        }
    }

    /// Sets a signal event. This is a no-op for socket events.
    pub fn set(&self) {
        match self.kind {
            EventWaitType::Signal => {}
            EventWaitType::Invalid => {
                debug_assert!(false, "setting a null event");
                return;
            }
            _ => {
                trace!("set() on a {:?} event has no effect", self.kind);
                return;
            }
        }

        if self.test() {
            return;
        }

        let buf = [1u8];
        // SAFETY: fd[1] is the non-blocking write end of the pipe, buf is valid
        let ret = unsafe { libc::write(self.fd[1], buf.as_ptr() as *const libc::c_void, buf.len()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // a full pipe means the event is set already
            if err.kind() != ErrorKind::WouldBlock {
                warn!("setting signal event failed: {}", err);
            }
        }
    }

    /// Non-blocking check whether the event is set
    pub fn test(&self) -> bool {
        if self.is_null() {
            return false;
        }
        self.wait(0)
    }

    /// Blocks until the event is set or the timeout elapses. Returns `true` iff the event was
    ///  observed set. A timeout of 0 polls, [INFINITE] waits without timeout.
    pub fn wait(&self, msecs: u64) -> bool {
        debug_assert!(self.is_valid(), "waiting on a null event");
        if self.is_null() {
            return false;
        }

        let mut poll_fd = self.poll_fd();
        match poll(std::slice::from_mut(&mut poll_fd), msecs) {
            Ok(num_ready) => num_ready > 0 && poll_fd.revents != 0,
            Err(e) => {
                warn!("waiting on {:?} event failed: {}", self.kind, e);
                false
            }
        }
    }

    /// The entry for this event in a `poll()` list - dummy and null events get a negative fd,
    ///  which `poll()` ignores
    pub(crate) fn poll_fd(&self) -> libc::pollfd {
        let (fd, events) = match self.kind {
            EventWaitType::Invalid | EventWaitType::Dummy => (-1, 0),
            EventWaitType::Signal | EventWaitType::Read => (self.fd[0], libc::POLLIN),
            EventWaitType::Write => (self.fd[0], libc::POLLOUT),
        };
        libc::pollfd { fd, events, revents: 0 }
    }
}

/// `poll()` that resumes after signal interruptions with the remaining part of the timeout.
///  Returns the number of entries with non-zero `revents`.
pub(crate) fn poll(poll_fds: &mut [libc::pollfd], msecs: u64) -> io::Result<usize> {
    let deadline = if msecs == INFINITE {
        None
    }
    else {
        Instant::now().checked_add(Duration::from_millis(msecs))
    };

    loop {
        let timeout = match deadline {
            None => INFINITE,
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                min(remaining.as_micros().div_ceil(1000), msecs as u128) as u64
            }
        };

        // SAFETY: poll_fds is a valid, initialized slice of pollfd structs
        let ret = unsafe {
            libc::poll(poll_fds.as_mut_ptr(), poll_fds.len() as libc::nfds_t, to_poll_timeout(timeout))
        };
        if ret >= 0 {
            return Ok(ret as usize);
        }

        let err = io::Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
        trace!("poll() was interrupted by a signal - resuming");
    }
}

pub(crate) fn to_poll_timeout(msecs: u64) -> libc::c_int {
    if msecs == INFINITE {
        -1
    }
    else {
        min(msecs, libc::c_int::MAX as u64) as libc::c_int
    }
}

fn create_nonblocking_pipe() -> io::Result<[RawFd; 2]> {
    let mut fds: [libc::c_int; 2] = [-1, -1];

    // SAFETY: fds has room for the two descriptors
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }

    for fd in fds {
        // SAFETY: fd was just created by pipe()
        let ok = unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            flags >= 0
                && libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) >= 0
                && libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) >= 0
        };
        if !ok {
            let err = io::Error::last_os_error();
            // SAFETY: both descriptors are owned here and not handed out yet
            unsafe {
                libc::close(fds[0]);
                libc::close(fds[1]);
            }
            return Err(err);
        }
    }
    Ok(fds)
}

/// Scoped ownership of an event: closes it on drop. Aliases handed out through
///  [OwnedEvent::alias] must not be used after that.
#[derive(Debug)]
pub struct OwnedEvent(WaitableEvent);

impl OwnedEvent {
    pub fn new(kind: EventWaitType) -> io::Result<OwnedEvent> {
        Ok(OwnedEvent(WaitableEvent::new(kind)?))
    }

    pub fn alias(&self) -> WaitableEvent {
        self.0.clone()
    }
}

impl Deref for OwnedEvent {
    type Target = WaitableEvent;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Drop for OwnedEvent {
    fn drop(&mut self) {
        self.0.close();
    }
}
