use crate::event::{poll, EventWaitType, WaitableEvent};
use tracing::{trace, warn};

/// A list of [WaitableEvent]s that can be waited on with a single `poll()` call, mixing
///  application signals and socket readiness.
///
/// Events are addressed by their index, which is stable for the lifetime of the set: removing an
///  event turns its slot into a dummy rather than shifting the events after it. Dummy slots are
///  passed to `poll()` with a negative fd, so they cost nothing.
///
/// NB: The set does not own its events - closing them remains the caller's responsibility
#[derive(Default)]
pub struct EventSet {
    events: Vec<WaitableEvent>,
    poll_fds: Vec<libc::pollfd>,
}

impl EventSet {
    pub fn new() -> EventSet {
        Self::default()
    }

    /// Returns the index of the new event
    pub fn add(&mut self, event: WaitableEvent) -> usize {
        if event.is_null() {
            warn!("adding a null event to an event set - it will be treated as a dummy");
        }
        self.poll_fds.push(event.poll_fd());
        self.events.push(event);
        self.events.len() - 1
    }

    /// Replaces the event at a given index
    pub fn set(&mut self, index: usize, event: WaitableEvent) {
        self.poll_fds[index] = event.poll_fd();
        self.events[index] = event;
    }

    /// Turns the slot into a dummy, keeping all other indices unchanged
    pub fn remove(&mut self, index: usize) -> WaitableEvent {
        self.poll_fds[index] = WaitableEvent::null().poll_fd();
        std::mem::replace(&mut self.events[index], dummy())
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.poll_fds.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&WaitableEvent> {
        self.events.get(index)
    }

    /// Blocks until at least one event is set or the timeout elapses, and returns the indices of
    ///  *all* events that are set, in index order. An empty result means the wait timed out.
    ///
    /// For socket events, error and hang-up conditions count as 'set' so that the owner of the
    ///  socket runs into the error on its next socket call.
    ///
    /// NB: Signal events stay set - resetting them is up to the caller
    pub fn wait(&mut self, msecs: u64) -> Vec<usize> {
        if self.poll_fds.iter().all(|p| p.fd < 0) {
            trace!("waiting on an event set without active events - returning immediately");
            return Vec::new();
        }

        for poll_fd in &mut self.poll_fds {
            poll_fd.revents = 0;
        }

        match poll(&mut self.poll_fds, msecs) {
            Ok(0) => return Vec::new(),
            Ok(_) => {}
            Err(e) => {
                warn!("poll() on event set failed: {}", e);
                return Vec::new();
            }
        }

        self.poll_fds.iter()
            .enumerate()
            .filter(|(_, p)| p.fd >= 0 && p.revents != 0)
            .map(|(idx, _)| idx)
            .collect()
    }
}

fn dummy() -> WaitableEvent {
    let mut result = WaitableEvent::null();
    result.create(EventWaitType::Dummy)
        .expect("creating a dummy event does not involve the OS");
    result
}
