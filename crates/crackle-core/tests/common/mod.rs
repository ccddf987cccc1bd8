#![allow(dead_code)]

use crackle_core::{
    Application, ChunkOutput, ChunkStatus, ExecError, Flow, RunContext, TaskRange,
};
use crackle_device_api::{
    CommandQueue, Device, DeviceError, DeviceInfo, DeviceKind, DeviceRuntime, DeviceType, Event,
    Kernel, Program, UserEvent,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Queue whose launches complete on a helper thread after `flush`, last
/// launch first.
struct FakeQueue {
    pending: Mutex<Vec<(Arc<UserEvent>, Vec<u8>)>>,
    delay: Duration,
}

impl CommandQueue for FakeQueue {
    fn enqueue(&self, _: &Kernel, offset: u64, size: u64, _: Arc<[u8]>) -> Result<Event, DeviceError> {
        let ev = Arc::new(UserEvent::new());
        let out = TaskRange::new(offset, offset + size).to_bytes().to_vec();
        self.pending.lock().unwrap().push((ev.clone(), out));
        Ok(ev)
    }

    fn flush(&self) -> Result<(), DeviceError> {
        let batch = std::mem::take(&mut *self.pending.lock().unwrap());
        let delay = self.delay;
        thread::spawn(move || {
            thread::sleep(delay);
            for (ev, out) in batch.into_iter().rev() {
                ev.complete(out);
            }
        });
        Ok(())
    }

    fn finish(&self) -> Result<(), DeviceError> {
        self.flush()
    }
}

struct FakeProgram(u32);

impl Program for FakeProgram {
    fn context(&self) -> u32 {
        self.0
    }

    fn build_options(&self) -> &str {
        ""
    }

    fn create_kernel(&self, name: &str) -> Result<Kernel, DeviceError> {
        Ok(Kernel::new(name, Arc::new(())))
    }
}

/// Runtime with one device per entry of `capacities` (work-group size 1).
/// Later devices complete sooner, so completion order is reversed.
pub struct FakeRuntime {
    capacities: Vec<u32>,
    pub builds: AtomicUsize,
}

impl FakeRuntime {
    pub fn new(capacities: &[u32]) -> Arc<Self> {
        Arc::new(Self { capacities: capacities.to_vec(), builds: AtomicUsize::new(0) })
    }
}

impl DeviceRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "fake"
    }

    fn enumerate(&self, _: DeviceType) -> Result<Vec<DeviceInfo>, DeviceError> {
        Ok(self
            .capacities
            .iter()
            .enumerate()
            .map(|(i, &cu)| DeviceInfo {
                index: i as u32,
                name: format!("fake{i}"),
                kind: DeviceKind::Cpu,
                compute_units: cu,
                workgroup_size: 1,
                address_bits: 64,
                global_mem_bytes: 1 << 20,
                context: 0,
            })
            .collect())
    }

    fn open_queue(&self, device: &DeviceInfo) -> Result<Arc<dyn CommandQueue>, DeviceError> {
        let delay = Duration::from_micros(200 * (self.capacities.len() as u64 - u64::from(device.index)));
        Ok(Arc::new(FakeQueue { pending: Mutex::new(Vec::new()), delay }))
    }

    fn build_program(
        &self,
        context: u32,
        _: &[DeviceInfo],
        _: &[u8],
        _: &str,
    ) -> Result<Arc<dyn Program>, DeviceError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeProgram(context)))
    }
}

/// Application that records every callback. Finds `target` when set.
#[derive(Default)]
pub struct RecordingApp {
    pub num_tasks: u64,
    pub multiplier: u32,
    pub target: Option<u64>,
    pub global: Option<Vec<u8>>,
    /// Ranks whose `on_device_range_exec` fails.
    pub fail_on_rank: Option<usize>,
    /// Aggregation fails for chunks starting at or past this task.
    pub reject_from: Option<u64>,

    pub executed: Mutex<Vec<TaskRange>>,
    pub aggregated: Mutex<Vec<(TaskRange, ChunkStatus)>>,
    pub found: Mutex<Option<u64>>,
    pub progress: Mutex<Vec<f32>>,
    pub received_global: Mutex<Option<Vec<u8>>>,
    pub freed_global: Mutex<Option<Vec<u8>>>,
    pub device_starts: AtomicUsize,
    pub device_finishes: AtomicUsize,
    pub finishes: AtomicUsize,
    events: Mutex<HashMap<usize, Event>>,
}

impl RecordingApp {
    pub fn new(num_tasks: u64) -> Self {
        Self { num_tasks, multiplier: 1, ..Self::default() }
    }

    pub fn with_target(mut self, target: u64) -> Self {
        self.target = Some(target);
        self
    }

    pub fn executed_sorted(&self) -> Vec<TaskRange> {
        let mut v = self.executed.lock().unwrap().clone();
        v.sort_by_key(|r| r.start);
        v
    }

    pub fn aggregated_tasks(&self) -> u64 {
        self.aggregated.lock().unwrap().iter().map(|(r, _)| r.len()).sum()
    }
}

/// Asserts `ranges` tile `[0, n)` exactly.
pub fn assert_tiles(mut ranges: Vec<TaskRange>, n: u64) {
    ranges.sort_by_key(|r| r.start);
    let mut cursor = 0;
    for r in ranges {
        assert_eq!(r.start, cursor, "gap or overlap at {r}");
        cursor = r.end;
    }
    assert_eq!(cursor, n);
}

impl Application for RecordingApp {
    fn get_code(&self, _: &RunContext) -> Result<Vec<u8>, ExecError> {
        Ok(b"kernel search".to_vec())
    }

    fn get_num_tasks(&self, _: &RunContext) -> u64 {
        self.num_tasks
    }

    fn get_task_range_multiplier(&self, _: &RunContext) -> u32 {
        self.multiplier
    }

    fn get_global_data(&self, _: &RunContext) -> Result<Option<Vec<u8>>, ExecError> {
        Ok(self.global.clone())
    }

    fn free_global_data(&self, _: &RunContext, data: Vec<u8>) {
        *self.freed_global.lock().unwrap() = Some(data);
    }

    fn on_receive_global_data(&self, _: &RunContext, data: &[u8]) -> Result<(), ExecError> {
        *self.received_global.lock().unwrap() = Some(data.to_vec());
        Ok(())
    }

    fn on_finish(&self, _: &RunContext) -> Result<(), ExecError> {
        self.finishes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_device_start(&self, _: &RunContext, _: &Device, _: usize, _: &[u8]) -> Result<(), ExecError> {
        self.device_starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_device_finish(&self, _: &RunContext, _: &Device, _: usize, _: &[u8]) -> Result<(), ExecError> {
        self.device_finishes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_device_range_exec(
        &self,
        ctx: &RunContext,
        device: &Device,
        index: usize,
        _: &[u8],
        range: TaskRange,
    ) -> Result<Option<Event>, ExecError> {
        if self.fail_on_rank == Some(ctx.rank) {
            return Err(ExecError::InvalidParameter("refusing to run".into()));
        }
        let program = device
            .program
            .as_ref()
            .ok_or_else(|| ExecError::BadState("no program".into()))?;
        let kernel = program.create_kernel("search")?;
        let ev = device.queue.enqueue(&kernel, range.start, range.len(), Vec::<u8>::new().into())?;
        self.events.lock().unwrap().insert(index, ev.clone());
        self.executed.lock().unwrap().push(range);
        Ok(Some(ev))
    }

    fn on_device_range_done(
        &self,
        _: &RunContext,
        _: &Device,
        index: usize,
        _: &[u8],
        range: TaskRange,
    ) -> Result<ChunkOutput, ExecError> {
        let ev = self
            .events
            .lock()
            .unwrap()
            .remove(&index)
            .ok_or_else(|| ExecError::BadState("no event".into()))?;
        let out = ev.take_output().unwrap_or_default();
        assert_eq!(TaskRange::from_bytes(&out), Some(range));
        match self.target {
            Some(t) if range.contains(t) => Ok(ChunkOutput::stop(t.to_le_bytes().to_vec())),
            _ => Ok(ChunkOutput::proceed()),
        }
    }

    fn on_receive_range_results(
        &self,
        _: &RunContext,
        range: TaskRange,
        status: ChunkStatus,
        data: &[u8],
    ) -> Result<Flow, ExecError> {
        if self.reject_from.is_some_and(|r| range.start >= r) {
            return Err(ExecError::BadState("aggregation rejected".into()));
        }
        self.aggregated.lock().unwrap().push((range, status));
        if status == ChunkStatus::Stop {
            let mut b = [0u8; 8];
            b.copy_from_slice(data);
            *self.found.lock().unwrap() = Some(u64::from_le_bytes(b));
            return Ok(Flow::Stop);
        }
        Ok(Flow::Continue)
    }

    fn progress(&self, _: &RunContext, percent: f32, _: Option<Duration>) {
        self.progress.lock().unwrap().push(percent);
    }
}
