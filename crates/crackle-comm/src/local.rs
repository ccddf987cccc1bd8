use crate::{CloseReason, CommError, Communicator, Envelope, Mailbox, Rank};
use std::sync::Arc;
use tracing::error;

/// One rank of an in-process group; ranks usually live on separate threads.
pub struct LocalComm {
    rank: Rank,
    boxes: Arc<Vec<Arc<Mailbox>>>,
}

impl LocalComm {
    /// Creates a fully connected group of `size` ranks.
    pub fn cluster(size: usize) -> Vec<LocalComm> {
        let boxes: Arc<Vec<Arc<Mailbox>>> = Arc::new((0..size).map(|_| Mailbox::new()).collect());
        (0..size).map(|rank| LocalComm { rank, boxes: boxes.clone() }).collect()
    }
}

impl Communicator for LocalComm {
    fn size(&self) -> usize {
        self.boxes.len()
    }

    fn rank(&self) -> Rank {
        self.rank
    }

    fn mailbox(&self) -> &Arc<Mailbox> {
        &self.boxes[self.rank]
    }

    fn send(&self, dest: Rank, tag: i32, payload: &[u8]) -> Result<(), CommError> {
        self.check_rank(dest)?;
        let target = &self.boxes[dest];
        if target.is_closed() {
            return Err(CommError::Disconnected(dest));
        }
        target.deliver(Envelope { source: self.rank, tag, payload: payload.to_vec() });
        Ok(())
    }

    fn abort(&self, code: i32) {
        error!(rank = self.rank, code, "abort");
        for b in self.boxes.iter() {
            b.close(CloseReason::Aborted(code));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Source, TagMatch};
    use std::thread;

    fn run<T: Send + 'static>(
        size: usize,
        f: impl Fn(LocalComm) -> T + Send + Sync + Clone + 'static,
    ) -> Vec<T> {
        let handles: Vec<_> = LocalComm::cluster(size)
            .into_iter()
            .map(|c| {
                let f = f.clone();
                thread::spawn(move || f(c))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn broadcast_from_root() {
        let out = run(4, |c| {
            let mut buf = if c.rank() == 2 { b"root".to_vec() } else { Vec::new() };
            c.broadcast(&mut buf, 2).unwrap();
            buf
        });
        assert!(out.iter().all(|b| b == b"root"));
    }

    #[test]
    fn gather_is_rank_ordered() {
        let out = run(3, |c| c.gather(&[c.rank() as u8 * 10], 0).unwrap());
        assert_eq!(out[0], vec![vec![0], vec![10], vec![20]]);
        assert!(out[1].is_empty() && out[2].is_empty());
    }

    #[test]
    fn scatter_hands_out_slices() {
        let out = run(3, |c| {
            let parts: Vec<Vec<u8>> = if c.rank() == 0 {
                (0..3u8).map(|r| vec![r; r as usize + 1]).collect()
            } else {
                Vec::new()
            };
            c.scatter(&parts, 0).unwrap()
        });
        assert_eq!(out, vec![vec![0], vec![1, 1], vec![2, 2, 2]]);
    }

    #[test]
    fn collectives_do_not_collide_with_app_traffic() {
        let out = run(2, |c| {
            if c.rank() == 1 {
                c.send(0, 7, b"app").unwrap();
                c.broadcast_u32(0, 0).unwrap()
            } else {
                let v = c.broadcast_u32(42, 0).unwrap();
                let st = c.iprobe(Source::Any, TagMatch::Any).unwrap();
                let got = c.recv(Source::Rank(1), TagMatch::Tag(7)).unwrap();
                assert_eq!(got.payload, b"app");
                assert!(st.is_none() || st.unwrap().tag == 7);
                v
            }
        });
        assert_eq!(out, vec![42, 42]);
    }

    #[test]
    fn abort_reaches_every_rank() {
        let comms = LocalComm::cluster(2);
        let waiter = thread::spawn({
            let c = LocalComm { rank: 1, boxes: comms[1].boxes.clone() };
            move || c.recv(Source::Rank(0), TagMatch::Any)
        });
        thread::sleep(std::time::Duration::from_millis(20));
        comms[0].abort(-5);
        assert!(matches!(waiter.join().unwrap(), Err(CommError::Aborted(-5))));
        assert!(comms[0].send(1, 1, b"late").is_err());
    }
}
