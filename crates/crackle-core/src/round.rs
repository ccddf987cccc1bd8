use crate::{Application, CompletionLatch, ExecError, Flow, ResultSink, RunContext, TaskRange, CODE_OK, CODE_STOP};
use crackle_device_api::{Device, DeviceError, Event, EventStatus};
use crackle_proto::ChunkResult;
use tracing::{debug, error};

struct Dispatch {
    index: usize,
    range: TaskRange,
    event: Option<Event>,
}

/// Drives one participant's range through its devices, one round at a time.
///
/// Coordinator and workers run the same loop; they differ only in the
/// [`ResultSink`] that receives each round's chunk results.
pub struct RoundLoop<'a> {
    app: &'a dyn Application,
    devices: &'a [Device],
    global: &'a [u8],
    ctx: RunContext,
    multiplier: u32,
}

impl<'a> RoundLoop<'a> {
    pub fn new(
        app: &'a dyn Application,
        devices: &'a [Device],
        global: &'a [u8],
        ctx: RunContext,
        multiplier: u32,
    ) -> Self {
        Self { app, devices, global, ctx, multiplier: multiplier.max(1) }
    }

    fn chunk_size(&self, device: &Device) -> u64 {
        device.capacity().saturating_mul(u64::from(self.multiplier)).max(1)
    }

    /// Runs rounds until `range` is exhausted or a stop is observed.
    pub fn run(&self, range: TaskRange, sink: &mut dyn ResultSink) -> Result<Flow, ExecError> {
        if range.is_empty() {
            debug!(rank = self.ctx.rank, "empty task range, nothing to run");
            return Ok(Flow::Continue);
        }
        if self.devices.is_empty() {
            return Err(ExecError::BadState("no devices to run on".into()));
        }
        let mut cursor = range.start;
        let mut round = 0u64;
        while cursor < range.end {
            let (dispatched, next) = self.dispatch(cursor, range.end)?;
            debug!(
                rank = self.ctx.rank,
                round,
                devices = dispatched.len(),
                start = cursor,
                end = next,
                "round complete"
            );
            cursor = next;
            round += 1;

            let (results, collected) = self.collect(&dispatched);
            let sink_flow = sink.deliver(results)?;
            let flow = collected?;
            if flow == Flow::Stop || sink_flow == Flow::Stop || sink.stop_requested()? {
                debug!(rank = self.ctx.rank, round, "stopping round loop");
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    /// Submits one round and blocks until every submitted chunk completed.
    fn dispatch(&self, start: u64, end: u64) -> Result<(Vec<Dispatch>, u64), ExecError> {
        let latch = CompletionLatch::new();
        let mut dispatched = Vec::with_capacity(self.devices.len());
        let mut cursor = start;
        let mut failure = None;

        for (index, device) in self.devices.iter().enumerate() {
            if cursor >= end {
                break;
            }
            let chunk_end = cursor.saturating_add(self.chunk_size(device)).min(end);
            let range = TaskRange::new(cursor, chunk_end);
            let event = match self.app.on_device_range_exec(&self.ctx, device, index, self.global, range) {
                Ok(ev) => ev,
                Err(e) => {
                    error!(rank = self.ctx.rank, device = index, %range, "range exec failed: {e}");
                    failure = Some(e);
                    break;
                }
            };
            let flushed = match &event {
                Some(ev) => {
                    latch.register();
                    let l = latch.clone();
                    if let Err(e) = ev.set_callback(Box::new(move |_: EventStatus| l.count_down())) {
                        latch.count_down();
                        error!(rank = self.ctx.rank, device = index, "set_callback failed: {e}");
                        failure = Some(e.into());
                        break;
                    }
                    device.queue.flush()
                }
                None => Ok(()),
            };
            if let Err(e) = flushed {
                error!(rank = self.ctx.rank, device = index, "flush failed: {e}");
                failure = Some(e.into());
                break;
            }
            dispatched.push(Dispatch { index, range, event });
            cursor = chunk_end;
        }

        if let Some(e) = failure {
            // The failing device's event may never fire, so the latch is
            // abandoned; chunks flushed before it still drain.
            for ev in dispatched.iter().filter_map(|d| d.event.as_ref()) {
                ev.wait();
            }
            return Err(e);
        }
        latch.wait();
        for d in &dispatched {
            if let Some(EventStatus::Failed(code)) = d.event.as_ref().map(|ev| ev.status()) {
                error!(rank = self.ctx.rank, device = d.index, range = %d.range, code, "device event failed");
                return Err(DeviceError::Runtime { call: "device_event", code }.into());
            }
        }
        Ok((dispatched, cursor))
    }

    /// Harvests each device's chunk in dispatch order. A stop or an error
    /// skips the remaining devices; the chunks gathered so far are returned
    /// either way.
    fn collect(&self, dispatched: &[Dispatch]) -> (Vec<ChunkResult>, Result<Flow, ExecError>) {
        let mut results = Vec::with_capacity(dispatched.len());
        for d in dispatched {
            let device = &self.devices[d.index];
            let r = d.range;
            match self.app.on_device_range_done(&self.ctx, device, d.index, self.global, r) {
                Ok(out) => {
                    let code = if out.flow == Flow::Stop { CODE_STOP } else { CODE_OK };
                    results.push(ChunkResult { start: r.start, end: r.end, code, data: out.data });
                    if out.flow == Flow::Stop {
                        debug!(rank = self.ctx.rank, device = d.index, range = %r, "device requested stop");
                        return (results, Ok(Flow::Stop));
                    }
                }
                Err(e) => {
                    error!(rank = self.ctx.rank, device = d.index, range = %r, "range done failed: {e}");
                    results.push(ChunkResult { start: r.start, end: r.end, code: e.code(), data: Vec::new() });
                    let err = ExecError::BadState(format!("device {} chunk {r} failed: {e}", d.index));
                    return (results, Err(err));
                }
            }
        }
        (results, Ok(Flow::Continue))
    }
}
