use crate::{CloseReason, CommError, Communicator, Envelope, Mailbox, Rank};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

const MAGIC: &[u8; 4] = b"CRKL";
const MAX_FRAME: usize = 256 << 20;

#[derive(Clone, Debug)]
pub struct TcpConfig {
    pub rank: Rank,
    pub size: usize,
    /// Rank 0 listens on this address; workers connect to it.
    pub coordinator: String,
    pub connect_attempts: u32,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl TcpConfig {
    pub fn new(rank: Rank, size: usize, coordinator: impl Into<String>) -> Self {
        Self {
            rank,
            size,
            coordinator: coordinator.into(),
            connect_attempts: 50,
            backoff_min: Duration::from_millis(100),
            backoff_max: Duration::from_secs(2),
        }
    }
}

/// Star-shaped group over TCP: rank 0 holds a connection to every worker and
/// each worker holds one connection to rank 0.
///
/// Frames are `[tag i32][len u32][payload]`, little-endian. Sends block the
/// calling thread on the tokio runtime the group was created on, so they must
/// be issued from outside async tasks (e.g. `spawn_blocking`).
pub struct TcpComm {
    rank: Rank,
    size: usize,
    mailbox: Arc<Mailbox>,
    peers: HashMap<Rank, Arc<AsyncMutex<OwnedWriteHalf>>>,
    readers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    handle: Handle,
}

/// Coordinator socket that is bound but still waiting for workers.
pub struct TcpRendezvous {
    cfg: TcpConfig,
    listener: TcpListener,
}

impl TcpRendezvous {
    pub fn local_addr(&self) -> Result<SocketAddr, CommError> {
        Ok(self.listener.local_addr()?)
    }

    /// Waits until every worker rank has connected and announced itself.
    pub async fn accept(self) -> Result<TcpComm, CommError> {
        let size = self.cfg.size;
        let mut streams: HashMap<Rank, TcpStream> = HashMap::new();
        while streams.len() + 1 < size {
            let (mut stream, addr) = self.listener.accept().await?;
            stream.set_nodelay(true)?;
            let (rank, peer_size) = match read_hello(&mut stream).await {
                Ok(h) => h,
                Err(e) => {
                    warn!(%addr, "dropping connection with bad hello: {e}");
                    continue;
                }
            };
            if peer_size != size || rank == 0 || rank >= size || streams.contains_key(&rank) {
                warn!(%addr, rank, peer_size, "rejecting worker");
                let _ = write_ack(&mut stream, 1).await;
                continue;
            }
            write_ack(&mut stream, 0).await?;
            info!(%addr, rank, "worker joined ({}/{})", streams.len() + 1, size - 1);
            streams.insert(rank, stream);
        }
        Ok(TcpComm::from_streams(0, size, streams))
    }
}

async fn read_hello(stream: &mut TcpStream) -> Result<(Rank, usize), CommError> {
    let mut buf = [0u8; 12];
    stream.read_exact(&mut buf).await?;
    if &buf[..4] != MAGIC {
        return Err(CommError::Protocol("bad magic".into()));
    }
    let rank = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as Rank;
    let size = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
    Ok((rank, size))
}

async fn write_ack(stream: &mut TcpStream, code: u32) -> Result<(), CommError> {
    let mut buf = MAGIC.to_vec();
    buf.extend_from_slice(&code.to_le_bytes());
    stream.write_all(&buf).await?;
    Ok(())
}

impl TcpComm {
    /// Binds the coordinator socket without waiting for workers.
    pub async fn listen(cfg: TcpConfig) -> Result<TcpRendezvous, CommError> {
        if cfg.rank != 0 {
            return Err(CommError::Protocol("only rank 0 listens".into()));
        }
        if cfg.size == 0 {
            return Err(CommError::InvalidRank { rank: 0, size: 0 });
        }
        let listener = TcpListener::bind(&cfg.coordinator).await?;
        info!("coordinator listening on {}", listener.local_addr()?);
        Ok(TcpRendezvous { cfg, listener })
    }

    /// Joins the group: rank 0 listens and waits for all workers, other ranks
    /// dial the coordinator with exponential backoff.
    pub async fn connect(cfg: TcpConfig) -> Result<Self, CommError> {
        if cfg.rank >= cfg.size {
            return Err(CommError::InvalidRank { rank: cfg.rank, size: cfg.size });
        }
        if cfg.rank == 0 {
            return Self::listen(cfg).await?.accept().await;
        }

        let mut backoff = cfg.backoff_min;
        let mut attempt = 0u32;
        let mut stream = loop {
            attempt += 1;
            match TcpStream::connect(&cfg.coordinator).await {
                Ok(s) => break s,
                Err(e) if attempt < cfg.connect_attempts.max(1) => {
                    debug!(attempt, "coordinator {} not reachable ({e}), retrying in {:?}", cfg.coordinator, backoff);
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(cfg.backoff_max);
                }
                Err(e) => {
                    error!(attempt, "giving up on coordinator {}: {e}", cfg.coordinator);
                    return Err(e.into());
                }
            }
        };
        stream.set_nodelay(true)?;

        let mut hello = MAGIC.to_vec();
        hello.extend_from_slice(&(cfg.rank as u32).to_le_bytes());
        hello.extend_from_slice(&(cfg.size as u32).to_le_bytes());
        stream.write_all(&hello).await?;
        let mut ack = [0u8; 8];
        stream.read_exact(&mut ack).await?;
        if &ack[..4] != MAGIC || ack[4..] != [0, 0, 0, 0] {
            return Err(CommError::Protocol(format!("coordinator rejected rank {}", cfg.rank)));
        }
        info!(rank = cfg.rank, "joined group of {} via {}", cfg.size, cfg.coordinator);

        let mut streams = HashMap::new();
        streams.insert(0, stream);
        Ok(Self::from_streams(cfg.rank, cfg.size, streams))
    }

    fn from_streams(rank: Rank, size: usize, streams: HashMap<Rank, TcpStream>) -> Self {
        let handle = Handle::current();
        let mailbox = Mailbox::new();
        let mut peers = HashMap::with_capacity(streams.len());
        let mut readers = Vec::with_capacity(streams.len());
        for (peer, stream) in streams {
            let (rd, wr) = stream.into_split();
            readers.push(handle.spawn(read_loop(rd, peer, mailbox.clone())));
            peers.insert(peer, Arc::new(AsyncMutex::new(wr)));
        }
        Self { rank, size, mailbox, peers, readers: std::sync::Mutex::new(readers), handle }
    }

    fn stop_readers(&self) {
        let mut readers = self.readers.lock().unwrap_or_else(|p| p.into_inner());
        for r in readers.drain(..) {
            r.abort();
        }
    }
}

async fn read_loop(mut rd: OwnedReadHalf, peer: Rank, mailbox: Arc<Mailbox>) {
    loop {
        let mut hdr = [0u8; 8];
        if let Err(e) = rd.read_exact(&mut hdr).await {
            if e.kind() != ErrorKind::UnexpectedEof {
                warn!(peer, "read failed: {e}");
            }
            break;
        }
        let tag = i32::from_le_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);
        let len = u32::from_le_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]) as usize;
        if len > MAX_FRAME {
            warn!(peer, len, "frame too large, dropping connection");
            break;
        }
        let mut payload = vec![0u8; len];
        if let Err(e) = rd.read_exact(&mut payload).await {
            warn!(peer, "truncated frame: {e}");
            break;
        }
        mailbox.deliver(Envelope { source: peer, tag, payload });
    }
    debug!(peer, "connection closed");
    mailbox.peer_down(peer);
}

impl Communicator for TcpComm {
    fn size(&self) -> usize {
        self.size
    }

    fn rank(&self) -> Rank {
        self.rank
    }

    fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    fn send(&self, dest: Rank, tag: i32, payload: &[u8]) -> Result<(), CommError> {
        self.check_rank(dest)?;
        if dest == self.rank {
            self.mailbox.deliver(Envelope { source: dest, tag, payload: payload.to_vec() });
            return Ok(());
        }
        let writer = self
            .peers
            .get(&dest)
            .cloned()
            .ok_or(CommError::Unroutable { from: self.rank, to: dest })?;
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|&l| l as usize <= MAX_FRAME)
            .ok_or_else(|| CommError::Protocol(format!("{} byte frame too large", payload.len())))?;
        let mut frame = Vec::with_capacity(8 + payload.len());
        frame.extend_from_slice(&tag.to_le_bytes());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(payload);
        self.handle
            .block_on(async move {
                let mut w = writer.lock().await;
                w.write_all(&frame).await?;
                w.flush().await
            })
            .map_err(|e| {
                warn!(rank = self.rank, dest, tag, "send failed: {e}");
                match e.kind() {
                    ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::NotConnected => {
                        CommError::Disconnected(dest)
                    }
                    _ => CommError::Io(e),
                }
            })
    }

    fn abort(&self, code: i32) {
        error!(rank = self.rank, code, "abort");
        self.mailbox.close(CloseReason::Aborted(code));
        for w in self.peers.values() {
            let w = w.clone();
            self.handle.spawn(async move {
                let _ = w.lock().await.shutdown().await;
            });
        }
        self.stop_readers();
    }
}

impl Drop for TcpComm {
    fn drop(&mut self) {
        self.stop_readers();
    }
}
