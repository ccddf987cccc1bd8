use crate::sink::aggregate;
use crate::{Application, ExecError, Flow, ProgressTracker, RunContext, StopSignal, CODE_OK, CODE_STOP};
use crackle_comm::{CommError, Communicator, Rank, Request, Source, TagMatch};
use crackle_proto::{decode_batch, decode_code, encode_stop, TAG_COMPLETED, TAG_RESULTS, TAG_STOP};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Default)]
pub struct ListenerReport {
    /// A stop was raised while workers were still running.
    pub stopped: bool,
    pub failure: Option<ExecError>,
}

/// Coordinator-side receiver for worker results and completion notices.
///
/// Runs on its own thread next to the coordinator's round loop. `stop` is
/// shared with that loop in both directions; `breaker` is raised by the
/// coordinator when its own loop failed and the listener should leave as soon
/// as workers have been told to stop.
pub struct Listener<'a> {
    comm: &'a dyn Communicator,
    app: &'a dyn Application,
    ctx: RunContext,
    progress: &'a Mutex<ProgressTracker>,
    stop: StopSignal,
    breaker: StopSignal,
}

impl<'a> Listener<'a> {
    pub fn new(
        comm: &'a dyn Communicator,
        app: &'a dyn Application,
        ctx: RunContext,
        progress: &'a Mutex<ProgressTracker>,
        stop: StopSignal,
        breaker: StopSignal,
    ) -> Self {
        Self { comm, app, ctx, progress, stop, breaker }
    }

    pub fn run(&self) -> ListenerReport {
        let mut report = ListenerReport::default();
        let mut pending: Vec<(Rank, Request)> = (1..self.comm.size())
            .map(|r| (r, self.comm.irecv(Source::Rank(r), TagMatch::Tag(TAG_COMPLETED))))
            .collect();
        let mut stop_sent = false;
        if let Err(e) = self.listen(&mut pending, &mut stop_sent, &mut report) {
            error!("result listener failed: {e}");
            self.stop.raise();
            if !stop_sent && !pending.is_empty() {
                if let Err(send) = self.send_stop(&pending) {
                    warn!("could not stop workers: {send}");
                }
                report.stopped = true;
            }
            report.failure.get_or_insert(e);
        }
        report
    }

    fn listen(
        &self,
        pending: &mut Vec<(Rank, Request)>,
        stop_sent: &mut bool,
        report: &mut ListenerReport,
    ) -> Result<(), ExecError> {
        while !pending.is_empty() {
            self.poll_completions(pending, report)?;

            let interrupted = self.breaker.is_raised();
            if (interrupted || self.stop.is_raised()) && !*stop_sent {
                *stop_sent = true;
                self.send_stop(pending)?;
                report.stopped = true;
            }
            if interrupted {
                debug!(pending = pending.len(), "listener interrupted");
                return Ok(());
            }
            match self.poll_message() {
                Ok(true) => {}
                Ok(false) => thread::sleep(POLL_INTERVAL),
                // Workers are stopped on the next pass; their notices are still awaited.
                Err(e) if !e.is_messaging() => {
                    error!("aggregating worker results failed: {e}");
                    report.failure.get_or_insert(e);
                    self.stop.raise();
                }
                Err(e) => return Err(e),
            }
        }
        // Batches sent right before a completion notice are already queued.
        while self.poll_message()? {}
        debug!("all workers completed");
        Ok(())
    }

    fn poll_completions(
        &self,
        pending: &mut Vec<(Rank, Request)>,
        report: &mut ListenerReport,
    ) -> Result<(), ExecError> {
        let mut i = 0;
        while i < pending.len() {
            if !self.comm.test(&mut pending[i].1)? {
                i += 1;
                continue;
            }
            let (rank, mut req) = pending.remove(i);
            let code = match req.take() {
                Some(env) => decode_code(&env.payload)?,
                None => CODE_OK,
            };
            match code {
                CODE_OK => debug!(rank, "worker completed"),
                CODE_STOP => debug!(rank, "worker stopped"),
                c if c < 0 => {
                    error!(rank, code = c, "worker failed");
                    report.failure.get_or_insert(ExecError::Remote { rank, code: c });
                    self.stop.raise();
                }
                c => warn!(rank, code = c, "unexpected completion code"),
            }
        }
        Ok(())
    }

    fn send_stop(&self, pending: &[(Rank, Request)]) -> Result<(), ExecError> {
        info!(workers = pending.len(), "broadcasting stop");
        let payload = encode_stop(self.ctx.run);
        let mut sends = Vec::with_capacity(pending.len());
        for (rank, _) in pending {
            match self.comm.isend(*rank, TAG_STOP, &payload) {
                Ok(req) => sends.push(req),
                // Its completion notice is already queued behind the disconnect.
                Err(CommError::Disconnected(r)) => debug!(rank = r, "worker already gone"),
                Err(e) => return Err(e.into()),
            }
        }
        self.comm.wait_all(&mut sends)?;
        Ok(())
    }

    /// Handles at most one queued message. Returns false when none was waiting.
    fn poll_message(&self) -> Result<bool, ExecError> {
        let Some(status) = self.comm.iprobe(Source::Any, TagMatch::Any)? else {
            return Ok(false);
        };
        let env = self
            .comm
            .recv(Source::Rank(status.source), TagMatch::Tag(status.tag))?;
        if env.tag != TAG_RESULTS {
            warn!(rank = env.source, tag = env.tag, len = env.payload.len(), "discarding unexpected message");
            return Ok(true);
        }
        if self.stop.is_raised() {
            debug!(rank = env.source, "draining results after stop");
            return Ok(true);
        }
        let batch = decode_batch(&env.payload)?;
        debug!(rank = env.source, chunks = batch.len(), "received results");
        for r in &batch {
            if aggregate(self.app, &self.ctx, self.progress, r)? == Flow::Stop {
                self.stop.raise();
            }
        }
        Ok(true)
    }
}
