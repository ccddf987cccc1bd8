use crate::{CommError, Envelope, Rank, Source, Status, TagMatch};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    Aborted(i32),
    Shutdown,
}

impl From<CloseReason> for CommError {
    fn from(r: CloseReason) -> Self {
        match r {
            CloseReason::Aborted(code) => CommError::Aborted(code),
            CloseReason::Shutdown => CommError::Closed,
        }
    }
}

struct Posted {
    id: u64,
    source: Source,
    tag: TagMatch,
}

#[derive(Default)]
struct State {
    queue: VecDeque<Envelope>,
    posted: Vec<Posted>,
    claimed: HashMap<u64, Envelope>,
    next_id: u64,
    down: HashSet<Rank>,
    closed: Option<CloseReason>,
}

impl State {
    fn find(&self, source: Source, tag: TagMatch) -> Option<usize> {
        self.queue.iter().position(|e| source.matches(e.source) && tag.matches(e.tag))
    }

    fn check_open(&self, source: Source) -> Result<(), CommError> {
        if let Some(reason) = self.closed {
            return Err(reason.into());
        }
        if let Source::Rank(r) = source {
            if self.down.contains(&r) {
                return Err(CommError::Disconnected(r));
            }
        }
        Ok(())
    }
}

/// Receive-side matching engine of one rank.
///
/// Transports push arriving envelopes with [`Mailbox::deliver`]. An arriving
/// envelope goes to the oldest posted receive it matches; otherwise it is
/// queued for probes and receives. Messages from one source with one tag are
/// matched in arrival order.
#[derive(Default)]
pub struct Mailbox {
    state: Mutex<State>,
    changed: Condvar,
}

impl Mailbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
        self.changed.wait(guard).unwrap_or_else(|p| p.into_inner())
    }

    pub fn deliver(&self, env: Envelope) {
        let mut st = self.lock();
        if st.closed.is_some() {
            return;
        }
        let hit = st
            .posted
            .iter()
            .position(|p| p.source.matches(env.source) && p.tag.matches(env.tag));
        match hit {
            Some(i) => {
                let p = st.posted.remove(i);
                st.claimed.insert(p.id, env);
            }
            None => st.queue.push_back(env),
        }
        drop(st);
        self.changed.notify_all();
    }

    pub fn probe(&self, source: Source, tag: TagMatch) -> Result<Option<Status>, CommError> {
        let st = self.lock();
        match st.find(source, tag) {
            Some(i) => Ok(Some(st.queue[i].status())),
            None => st.check_open(source).map(|_| None),
        }
    }

    pub fn try_take(&self, source: Source, tag: TagMatch) -> Result<Option<Envelope>, CommError> {
        let mut st = self.lock();
        match st.find(source, tag) {
            Some(i) => Ok(st.queue.remove(i)),
            None => st.check_open(source).map(|_| None),
        }
    }

    /// Blocks until a matching envelope arrives or the source can no longer send.
    pub fn recv(&self, source: Source, tag: TagMatch) -> Result<Envelope, CommError> {
        let mut st = self.lock();
        loop {
            if let Some(i) = st.find(source, tag) {
                if let Some(env) = st.queue.remove(i) {
                    return Ok(env);
                }
            }
            st.check_open(source)?;
            st = self.wait(st);
        }
    }

    pub(crate) fn post(&self, source: Source, tag: TagMatch) -> u64 {
        let mut st = self.lock();
        let id = st.next_id;
        st.next_id += 1;
        match st.find(source, tag).and_then(|i| st.queue.remove(i)) {
            Some(env) => {
                st.claimed.insert(id, env);
            }
            None => st.posted.push(Posted { id, source, tag }),
        }
        id
    }

    fn posted_source(st: &State, id: u64) -> Source {
        st.posted
            .iter()
            .find(|p| p.id == id)
            .map(|p| p.source)
            .unwrap_or(Source::Any)
    }

    pub(crate) fn poll_posted(&self, id: u64) -> Result<Option<Envelope>, CommError> {
        let mut st = self.lock();
        if let Some(env) = st.claimed.remove(&id) {
            return Ok(Some(env));
        }
        let source = Self::posted_source(&st, id);
        st.check_open(source).map(|_| None)
    }

    pub(crate) fn wait_posted(&self, id: u64) -> Result<Envelope, CommError> {
        let mut st = self.lock();
        loop {
            if let Some(env) = st.claimed.remove(&id) {
                return Ok(env);
            }
            let source = Self::posted_source(&st, id);
            st.check_open(source)?;
            st = self.wait(st);
        }
    }

    pub(crate) fn cancel(&self, id: u64) {
        let mut st = self.lock();
        st.posted.retain(|p| p.id != id);
        if let Some(env) = st.claimed.remove(&id) {
            // Unclaimed data goes back to the front so ordering is preserved.
            st.queue.push_front(env);
        }
    }

    /// Marks a peer as gone; receives that name it fail once its queued
    /// messages are consumed.
    pub fn peer_down(&self, rank: Rank) {
        self.lock().down.insert(rank);
        self.changed.notify_all();
    }

    pub fn close(&self, reason: CloseReason) {
        {
            let mut st = self.lock();
            if st.closed.is_none() {
                st.closed = Some(reason);
            }
        }
        self.changed.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }
}
