use crate::{CloseReason, CommError, Communicator, Envelope, Mailbox, Rank};
use std::sync::Arc;
use tracing::error;

/// Group of one. Collectives are identities and sends loop back to rank 0.
pub struct SoloComm {
    mailbox: Arc<Mailbox>,
}

impl Default for SoloComm {
    fn default() -> Self {
        Self::new()
    }
}

impl SoloComm {
    pub fn new() -> Self {
        Self { mailbox: Mailbox::new() }
    }
}

impl Communicator for SoloComm {
    fn size(&self) -> usize {
        1
    }

    fn rank(&self) -> Rank {
        0
    }

    fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    fn send(&self, dest: Rank, tag: i32, payload: &[u8]) -> Result<(), CommError> {
        self.check_rank(dest)?;
        self.mailbox.deliver(Envelope { source: 0, tag, payload: payload.to_vec() });
        Ok(())
    }

    fn abort(&self, code: i32) {
        error!(code, "abort");
        self.mailbox.close(CloseReason::Aborted(code));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Source, TagMatch};

    #[test]
    fn collectives_are_identities() {
        let c = SoloComm::new();
        assert_eq!((c.size(), c.rank()), (1, 0));
        let mut buf = vec![1, 2, 3];
        c.broadcast(&mut buf, 0).unwrap();
        assert_eq!(buf, vec![1, 2, 3]);
        assert_eq!(c.gather(&[9], 0).unwrap(), vec![vec![9]]);
        assert_eq!(c.scatter(&[vec![4, 5]], 0).unwrap(), vec![4, 5]);
        assert_eq!(c.broadcast_u64(77, 0).unwrap(), 77);
        assert!(c.broadcast(&mut buf, 1).is_err());
    }

    #[test]
    fn send_to_self_loops_back() {
        let c = SoloComm::new();
        let mut req = c.irecv(Source::Rank(0), TagMatch::Tag(3));
        assert!(!c.test(&mut req).unwrap());
        c.isend(0, 3, b"hi").unwrap();
        assert!(c.test(&mut req).unwrap());
        assert_eq!(req.take().unwrap().payload, b"hi");
        assert!(c.send(1, 3, b"x").is_err());
    }

    #[test]
    fn abort_fails_pending_receives() {
        let c = SoloComm::new();
        c.abort(-5);
        assert!(matches!(c.recv(Source::Any, TagMatch::Any), Err(CommError::Aborted(-5))));
    }
}
