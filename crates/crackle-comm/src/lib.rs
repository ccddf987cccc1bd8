//! Process-group messaging: ranks, point-to-point sends with tag matching,
//! non-blocking requests and the collectives the executor needs.
//!
//! Transports only move bytes into the destination rank's [`Mailbox`]; all
//! matching, probing and the collectives are shared through the provided
//! methods of [`Communicator`].

use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

mod local;
mod mailbox;
mod solo;
mod tcp;

pub use local::LocalComm;
pub use mailbox::{CloseReason, Mailbox};
pub use solo::SoloComm;
pub use tcp::{TcpComm, TcpConfig, TcpRendezvous};

pub type Rank = usize;

const TAG_BCAST: i32 = -101;
const TAG_GATHER: i32 = -102;
const TAG_SCATTER: i32 = -103;

#[derive(Debug, Error)]
pub enum CommError {
    #[error("rank {rank} out of range for group of {size}")]
    InvalidRank { rank: Rank, size: usize },
    #[error("no route from rank {from} to rank {to}")]
    Unroutable { from: Rank, to: Rank },
    #[error("rank {0} disconnected")]
    Disconnected(Rank),
    #[error("group aborted with code {0}")]
    Aborted(i32),
    #[error("communicator closed")]
    Closed,
    #[error("expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Source {
    Any,
    Rank(Rank),
}

impl Source {
    pub fn matches(self, rank: Rank) -> bool {
        match self {
            Source::Any => true,
            Source::Rank(r) => r == rank,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TagMatch {
    /// Any application tag. Negative tags are reserved for collectives and
    /// never match.
    Any,
    Tag(i32),
}

impl TagMatch {
    pub fn matches(self, tag: i32) -> bool {
        match self {
            TagMatch::Any => tag >= 0,
            TagMatch::Tag(t) => t == tag,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Status {
    pub source: Rank,
    pub tag: i32,
    pub len: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub source: Rank,
    pub tag: i32,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn status(&self) -> Status {
        Status { source: self.source, tag: self.tag, len: self.payload.len() }
    }
}

enum RequestState {
    Done(Option<Envelope>),
    Posted { mailbox: Arc<Mailbox>, id: u64 },
}

/// Handle for a non-blocking operation. Sends complete when issued; receives
/// stay posted in the mailbox until a matching message arrives. Dropping an
/// incomplete receive cancels it.
pub struct Request {
    state: RequestState,
}

impl Request {
    pub(crate) fn sent() -> Self {
        Self { state: RequestState::Done(None) }
    }

    pub(crate) fn posted(mailbox: Arc<Mailbox>, id: u64) -> Self {
        Self { state: RequestState::Posted { mailbox, id } }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, RequestState::Done(_))
    }

    pub fn test(&mut self) -> Result<bool, CommError> {
        if let RequestState::Posted { mailbox, id } = &self.state {
            match mailbox.poll_posted(*id)? {
                Some(env) => self.state = RequestState::Done(Some(env)),
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    pub fn wait(&mut self) -> Result<(), CommError> {
        if let RequestState::Posted { mailbox, id } = &self.state {
            let env = mailbox.wait_posted(*id)?;
            self.state = RequestState::Done(Some(env));
        }
        Ok(())
    }

    /// The received envelope, once a receive request has completed.
    pub fn take(&mut self) -> Option<Envelope> {
        match &mut self.state {
            RequestState::Done(env) => env.take(),
            RequestState::Posted { .. } => None,
        }
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if let RequestState::Posted { mailbox, id } = &self.state {
            mailbox.cancel(*id);
        }
    }
}

pub trait Communicator: Send + Sync {
    fn size(&self) -> usize;
    fn rank(&self) -> Rank;
    fn mailbox(&self) -> &Arc<Mailbox>;

    /// Delivers `payload` to `dest`. Returns once the bytes are handed to the
    /// transport; sending to oneself loops back through the local mailbox.
    fn send(&self, dest: Rank, tag: i32, payload: &[u8]) -> Result<(), CommError>;

    /// Tears the group down so every rank blocked on this one fails.
    fn abort(&self, code: i32);

    fn is_coordinator(&self) -> bool {
        self.rank() == 0
    }

    fn check_rank(&self, rank: Rank) -> Result<(), CommError> {
        if rank >= self.size() {
            return Err(CommError::InvalidRank { rank, size: self.size() });
        }
        Ok(())
    }

    fn recv(&self, source: Source, tag: TagMatch) -> Result<Envelope, CommError> {
        self.mailbox().recv(source, tag)
    }

    fn try_recv(&self, source: Source, tag: TagMatch) -> Result<Option<Envelope>, CommError> {
        self.mailbox().try_take(source, tag)
    }

    fn iprobe(&self, source: Source, tag: TagMatch) -> Result<Option<Status>, CommError> {
        self.mailbox().probe(source, tag)
    }

    fn isend(&self, dest: Rank, tag: i32, payload: &[u8]) -> Result<Request, CommError> {
        self.send(dest, tag, payload)?;
        Ok(Request::sent())
    }

    fn irecv(&self, source: Source, tag: TagMatch) -> Request {
        let mailbox = self.mailbox().clone();
        let id = mailbox.post(source, tag);
        Request::posted(mailbox, id)
    }

    fn test(&self, req: &mut Request) -> Result<bool, CommError> {
        req.test()
    }

    fn wait_all(&self, reqs: &mut [Request]) -> Result<(), CommError> {
        for r in reqs.iter_mut() {
            r.wait()?;
        }
        Ok(())
    }

    /// After return every rank holds root's `buf`.
    fn broadcast(&self, buf: &mut Vec<u8>, root: Rank) -> Result<(), CommError> {
        self.check_rank(root)?;
        if self.size() == 1 {
            return Ok(());
        }
        if self.rank() == root {
            for r in (0..self.size()).filter(|&r| r != root) {
                self.send(r, TAG_BCAST, buf)?;
            }
        } else {
            *buf = self.recv(Source::Rank(root), TagMatch::Tag(TAG_BCAST))?.payload;
        }
        trace!(rank = self.rank(), root, len = buf.len(), "broadcast");
        Ok(())
    }

    /// Root receives every rank's `data` in rank order; other ranks get an
    /// empty vector back.
    fn gather(&self, data: &[u8], root: Rank) -> Result<Vec<Vec<u8>>, CommError> {
        self.check_rank(root)?;
        if self.rank() != root {
            self.send(root, TAG_GATHER, data)?;
            return Ok(Vec::new());
        }
        let mut out = Vec::with_capacity(self.size());
        for r in 0..self.size() {
            if r == root {
                out.push(data.to_vec());
            } else {
                out.push(self.recv(Source::Rank(r), TagMatch::Tag(TAG_GATHER))?.payload);
            }
        }
        Ok(out)
    }

    /// Root supplies one part per rank; every rank gets its own part back.
    fn scatter(&self, parts: &[Vec<u8>], root: Rank) -> Result<Vec<u8>, CommError> {
        self.check_rank(root)?;
        if self.rank() != root {
            return Ok(self.recv(Source::Rank(root), TagMatch::Tag(TAG_SCATTER))?.payload);
        }
        if parts.len() != self.size() {
            return Err(CommError::Protocol(format!(
                "scatter needs {} parts, got {}",
                self.size(),
                parts.len()
            )));
        }
        for (r, part) in parts.iter().enumerate().filter(|&(r, _)| r != root) {
            self.send(r, TAG_SCATTER, part)?;
        }
        Ok(parts[root].clone())
    }

    fn broadcast_u32(&self, value: u32, root: Rank) -> Result<u32, CommError> {
        let mut buf = value.to_le_bytes().to_vec();
        self.broadcast(&mut buf, root)?;
        let a: [u8; 4] = buf
            .as_slice()
            .try_into()
            .map_err(|_| CommError::Truncated { expected: 4, got: buf.len() })?;
        Ok(u32::from_le_bytes(a))
    }

    fn broadcast_u64(&self, value: u64, root: Rank) -> Result<u64, CommError> {
        let mut buf = value.to_le_bytes().to_vec();
        self.broadcast(&mut buf, root)?;
        let a: [u8; 8] = buf
            .as_slice()
            .try_into()
            .map_err(|_| CommError::Truncated { expected: 8, got: buf.len() })?;
        Ok(u64::from_le_bytes(a))
    }
}
