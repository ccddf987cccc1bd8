use crate::{Application, ChunkStatus, ExecError, Flow, ProgressTracker, RunContext, TaskRange};
use crackle_comm::{Communicator, Source, TagMatch};
use crackle_proto::{decode_stop, encode_batch, ChunkResult, TAG_RESULTS, TAG_STOP};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Shared early-stop flag. Once raised it stays raised.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Where a round's chunk results go once all of its devices are done.
pub trait ResultSink {
    fn deliver(&mut self, results: Vec<ChunkResult>) -> Result<Flow, ExecError>;

    /// Polled after every round.
    fn stop_requested(&mut self) -> Result<bool, ExecError>;
}

/// Hands one chunk to the aggregation callback, advancing progress.
pub(crate) fn aggregate(
    app: &dyn Application,
    ctx: &RunContext,
    progress: &Mutex<ProgressTracker>,
    result: &ChunkResult,
) -> Result<Flow, ExecError> {
    let range = TaskRange::new(result.start, result.end);
    let flow = app.on_receive_range_results(
        ctx,
        range,
        ChunkStatus::from_code(result.code),
        &result.data,
    )?;
    let report = progress
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .advance(range.len());
    if let Some(r) = report {
        app.progress(ctx, r.percent, r.eta);
    }
    Ok(flow)
}

/// Coordinator-local sink: aggregates in place.
pub struct DirectSink<'a> {
    app: &'a dyn Application,
    ctx: RunContext,
    progress: &'a Mutex<ProgressTracker>,
    stop: StopSignal,
}

impl<'a> DirectSink<'a> {
    pub fn new(
        app: &'a dyn Application,
        ctx: RunContext,
        progress: &'a Mutex<ProgressTracker>,
        stop: StopSignal,
    ) -> Self {
        Self { app, ctx, progress, stop }
    }
}

impl ResultSink for DirectSink<'_> {
    fn deliver(&mut self, results: Vec<ChunkResult>) -> Result<Flow, ExecError> {
        let mut flow = Flow::Continue;
        for r in &results {
            if aggregate(self.app, &self.ctx, self.progress, r)? == Flow::Stop {
                flow = Flow::Stop;
            }
        }
        if flow == Flow::Stop {
            self.stop.raise();
        }
        Ok(flow)
    }

    fn stop_requested(&mut self) -> Result<bool, ExecError> {
        Ok(self.stop.is_raised())
    }
}

/// Worker sink: ships each round's batch to the coordinator and checks for a
/// stop notice in between. Stops addressed to another run are dropped.
pub struct RemoteSink<'a> {
    comm: &'a dyn Communicator,
    run: u64,
    stopped: bool,
}

impl<'a> RemoteSink<'a> {
    pub fn new(comm: &'a dyn Communicator, run: u64) -> Self {
        Self { comm, run, stopped: false }
    }
}

impl ResultSink for RemoteSink<'_> {
    fn deliver(&mut self, results: Vec<ChunkResult>) -> Result<Flow, ExecError> {
        if results.is_empty() {
            return Ok(Flow::Continue);
        }
        debug!(rank = self.comm.rank(), chunks = results.len(), "sending results");
        let batch = encode_batch(&results)?;
        self.comm.send(0, TAG_RESULTS, &batch)?;
        Ok(Flow::Continue)
    }

    fn stop_requested(&mut self) -> Result<bool, ExecError> {
        while !self.stopped {
            let Some(env) = self.comm.try_recv(Source::Rank(0), TagMatch::Tag(TAG_STOP))? else {
                break;
            };
            let run = decode_stop(&env.payload)?;
            if run == self.run {
                debug!(rank = self.comm.rank(), run, "stop notice received");
                self.stopped = true;
            } else {
                debug!(rank = self.comm.rank(), run, current = self.run, "ignoring stale stop notice");
            }
        }
        Ok(self.stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crackle_comm::LocalComm;
    use crackle_device_api::{Device, Event};
    use crackle_proto::decode_batch;

    struct Counting;

    impl Application for Counting {
        fn get_code(&self, _: &RunContext) -> Result<Vec<u8>, ExecError> {
            Ok(Vec::new())
        }
        fn get_num_tasks(&self, _: &RunContext) -> u64 {
            10
        }
        fn on_device_range_exec(
            &self,
            _: &RunContext,
            _: &Device,
            _: usize,
            _: &[u8],
            _: TaskRange,
        ) -> Result<Option<Event>, ExecError> {
            Ok(None)
        }
        fn on_receive_range_results(
            &self,
            _: &RunContext,
            _: TaskRange,
            status: ChunkStatus,
            _: &[u8],
        ) -> Result<Flow, ExecError> {
            Ok(if status == ChunkStatus::Stop { Flow::Stop } else { Flow::Continue })
        }
    }

    fn chunk(start: u64, end: u64, code: i32) -> ChunkResult {
        ChunkResult { start, end, code, data: Vec::new() }
    }

    #[test]
    fn direct_sink_raises_stop_and_tracks_progress() {
        let progress = Mutex::new(ProgressTracker::new(10));
        let stop = StopSignal::new();
        let mut sink = DirectSink::new(&Counting, RunContext::default(), &progress, stop.clone());
        assert_eq!(sink.deliver(vec![chunk(0, 4, 0)]).unwrap(), Flow::Continue);
        assert!(!sink.stop_requested().unwrap());
        assert_eq!(sink.deliver(vec![chunk(4, 6, 1), chunk(6, 8, 0)]).unwrap(), Flow::Stop);
        assert!(stop.is_raised());
        assert!(sink.stop_requested().unwrap());
        assert_eq!(progress.lock().unwrap().done(), 8);
    }

    #[test]
    fn remote_sink_ships_batches_and_sees_stop() {
        let mut group = LocalComm::cluster(2);
        let worker = group.pop().unwrap();
        let root = group.pop().unwrap();

        let mut sink = RemoteSink::new(&worker, 2);
        sink.deliver(vec![chunk(0, 3, 0)]).unwrap();
        sink.deliver(Vec::new()).unwrap();
        let env = root.recv(Source::Rank(1), TagMatch::Tag(TAG_RESULTS)).unwrap();
        assert_eq!(decode_batch(&env.payload).unwrap(), vec![chunk(0, 3, 0)]);
        assert!(root.iprobe(Source::Any, TagMatch::Any).unwrap().is_none());

        assert!(!sink.stop_requested().unwrap());
        root.send(1, TAG_STOP, &crackle_proto::encode_stop(1)).unwrap();
        assert!(!sink.stop_requested().unwrap());
        root.send(1, TAG_STOP, &crackle_proto::encode_stop(2)).unwrap();
        assert!(sink.stop_requested().unwrap());
        assert!(sink.stop_requested().unwrap());
    }
}
