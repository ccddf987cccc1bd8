use crate::coordinator::{Listener, ListenerReport};
use crate::{
    decompose, Application, DirectSink, ExecError, Flow, ProgressTracker, RemoteSink, RoundLoop,
    RunContext, RunOutcome, RunState, StopSignal, TaskRange, CODE_MESSAGING, CODE_OK, CODE_STOP,
};
use crackle_comm::{CommError, Communicator, Source, TagMatch};
use crackle_device_api::{Device, DevicePool, DeviceRuntime, DeviceType};
use crackle_proto::{encode_code, TAG_COMPLETED, TAG_RESULTS};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, error, info, warn};

const ROOT: usize = 0;

fn decode_u64(buf: &[u8]) -> Result<u64, CommError> {
    let a: [u8; 8] = buf
        .try_into()
        .map_err(|_| CommError::Truncated { expected: 8, got: buf.len() })?;
    Ok(u64::from_le_bytes(a))
}

/// Drops messages an earlier run on the same group left behind. Peers send
/// them ahead of their part of this run's collectives, so they are queued
/// by the time the caller gets here.
fn discard_stale(comm: &dyn Communicator, source: Source, tags: &[i32]) -> Result<usize, CommError> {
    let mut dropped = 0;
    for &tag in tags {
        while comm.try_recv(source, TagMatch::Tag(tag))?.is_some() {
            dropped += 1;
        }
    }
    Ok(dropped)
}

/// Runs an [`Application`] across every rank of a communicator.
///
/// Every rank constructs an executor over the same group, calls [`setup`]
/// and then [`run`]. Rank 0 coordinates: it decomposes the task space,
/// broadcasts the application's global data and aggregates results, while
/// also running its own share of the work.
///
/// [`setup`]: Executor::setup
/// [`run`]: Executor::run
pub struct Executor {
    comm: Arc<dyn Communicator>,
    runtime: Arc<dyn DeviceRuntime>,
    pool: Option<DevicePool>,
    app: Option<Arc<dyn Application>>,
    device_type: DeviceType,
    max_devices: u32,
    state: RunState,
    num_tasks: u64,
    multiplier: u32,
    global_data: Option<Vec<u8>>,
    capacities: Vec<u64>,
    ranges: Vec<TaskRange>,
    my_range: TaskRange,
    abort_on_error: bool,
    /// Incremented by every `run`; stop notices from another run are ignored.
    runs: u64,
}

impl Executor {
    pub fn new(comm: Arc<dyn Communicator>, runtime: Arc<dyn DeviceRuntime>) -> Self {
        Self {
            comm,
            runtime,
            pool: None,
            app: None,
            device_type: DeviceType::Any,
            max_devices: 0,
            state: RunState::NotStarted,
            num_tasks: 0,
            multiplier: 1,
            global_data: None,
            capacities: Vec::new(),
            ranges: Vec::new(),
            my_range: TaskRange::default(),
            abort_on_error: false,
            runs: 0,
        }
    }

    /// Installs the application. The coordinator's device preferences are
    /// broadcast so every rank builds an equivalent pool; a pool created
    /// under different preferences is dropped.
    pub fn setup(&mut self, app: Arc<dyn Application>) -> Result<(), ExecError> {
        let mut prefs = Vec::with_capacity(8);
        prefs.extend_from_slice(&app.device_type().to_u32().to_le_bytes());
        prefs.extend_from_slice(&app.max_devices().to_le_bytes());
        if let Err(e) = self.comm.broadcast(&mut prefs, ROOT) {
            error!(rank = self.comm.rank(), "broadcast of device preferences failed: {e}");
            self.comm.abort(CODE_MESSAGING);
            return Err(e.into());
        }
        if prefs.len() != 8 {
            return Err(CommError::Truncated { expected: 8, got: prefs.len() }.into());
        }
        let kind = u32::from_le_bytes([prefs[0], prefs[1], prefs[2], prefs[3]]);
        let device_type = DeviceType::from_u32(kind)
            .ok_or_else(|| ExecError::InvalidParameter(format!("device type code {kind}")))?;
        let max_devices = u32::from_le_bytes([prefs[4], prefs[5], prefs[6], prefs[7]]);

        if self.pool.as_ref().is_some_and(|p| !p.matches(device_type, max_devices)) {
            debug!(%device_type, max_devices, "device preferences changed, dropping pool");
            self.pool = None;
        }
        self.device_type = device_type;
        self.max_devices = max_devices;
        self.app = Some(app);
        Ok(())
    }

    /// Executes the installed application over the whole task space.
    ///
    /// Teardown (`free_global_data`, `on_finish`) runs even when an earlier
    /// stage failed. Error codes are not combined: the earliest error is the
    /// one returned, a teardown error only when the run itself succeeded, and
    /// a teardown error that follows another failure is logged. Bitwise OR of
    /// two negative codes would name a different error kind.
    pub fn run(&mut self) -> Result<RunOutcome, ExecError> {
        let app = self.app.clone().ok_or(ExecError::MissingCallback("setup"))?;
        self.runs += 1;
        self.reset();

        let outcome = match self.pre_run(app.as_ref()) {
            Ok(()) => self.execute(app.as_ref()),
            Err(e) => {
                error!(rank = self.comm.rank(), state = %self.state, "pre-run failed: {e}");
                self.abort_on_error = self.comm.size() > 1;
                Err(e)
            }
        };
        let outcome = match (outcome, self.post_run(app.as_ref())) {
            (Ok(_), Err(post)) => Err(post),
            (Err(e), Err(post)) => {
                warn!(rank = self.comm.rank(), "teardown also failed: {post}");
                Err(e)
            }
            (outcome, Ok(())) => outcome,
        };
        if let Err(e) = &outcome {
            if self.abort_on_error || e.is_messaging() {
                self.comm.abort(e.code());
            }
        }
        outcome
    }

    fn reset(&mut self) {
        self.state = RunState::NotStarted;
        self.num_tasks = 0;
        self.multiplier = 1;
        self.global_data = None;
        self.capacities.clear();
        self.ranges.clear();
        self.my_range = TaskRange::default();
        self.abort_on_error = false;
    }

    fn ctx(&self) -> RunContext {
        RunContext {
            rank: self.comm.rank(),
            size: self.comm.size(),
            num_devices: self.num_devices(),
            num_tasks: self.num_tasks,
            run: self.runs,
        }
    }

    fn pool_capacity(&self) -> u64 {
        self.pool.as_ref().map_or(0, DevicePool::capacity)
    }

    fn pre_run(&mut self, app: &dyn Application) -> Result<(), ExecError> {
        if !self.pool.as_ref().is_some_and(DevicePool::is_usable) {
            self.pool = None;
            self.pool = Some(DevicePool::init(self.runtime.clone(), self.device_type, self.max_devices)?);
        }
        self.state = RunState::DeviceInited;

        let ctx = self.ctx();
        app.on_start(&ctx)?;
        self.state = RunState::Started;

        let code = app.get_code(&ctx)?;
        if code.is_empty() {
            return Err(ExecError::InvalidValue("program source is empty".into()));
        }
        self.state = RunState::GotCode;
        let options = app.get_build_options(&ctx).unwrap_or_default();
        self.state = RunState::GotBuildOpts;

        let pool = self
            .pool
            .as_mut()
            .ok_or_else(|| ExecError::BadState("device pool missing".into()))?;
        let built = pool.load_program(&code, &options);
        app.on_code_compiled(&ctx, built.is_ok());
        built?;
        self.state = RunState::Compiled;

        if self.comm.is_coordinator() {
            self.coordinator_pre_run(app)
        } else {
            self.worker_pre_run(app)
        }
    }

    fn coordinator_pre_run(&mut self, app: &dyn Application) -> Result<(), ExecError> {
        let gathered = self.comm.gather(&self.pool_capacity().to_le_bytes(), ROOT)?;
        self.capacities = gathered
            .iter()
            .map(|b| decode_u64(b))
            .collect::<Result<_, _>>()?;
        let stale = discard_stale(self.comm.as_ref(), Source::Any, &[TAG_COMPLETED, TAG_RESULTS])?;
        if stale > 0 {
            debug!(stale, "discarded worker messages from an earlier run");
        }
        self.state = RunState::GotTaskCounts;

        let ctx = self.ctx();
        let global = app.get_global_data(&ctx)?;
        if global.as_ref().is_some_and(Vec::is_empty) {
            return Err(ExecError::BadState("global data is empty".into()));
        }
        let len = global.as_ref().map_or(0, Vec::len);
        let len = u32::try_from(len)
            .map_err(|_| ExecError::InvalidValue(format!("global data of {len} bytes is too large")))?;
        self.global_data = global;
        self.comm.broadcast_u32(len, ROOT)?;
        self.state = RunState::GotGlobalDataLength;
        if let Some(data) = self.global_data.as_mut() {
            self.comm.broadcast(data, ROOT)?;
        }
        self.state = RunState::GotGlobalData;

        let num_tasks = app.get_num_tasks(&ctx);
        if num_tasks == 0 {
            return Err(ExecError::InvalidValue("number of tasks is zero".into()));
        }
        self.num_tasks = self.comm.broadcast_u64(num_tasks, ROOT)?;
        self.state = RunState::GotNumTasks;

        let multiplier = app.get_task_range_multiplier(&self.ctx()).max(1);
        self.multiplier = self.comm.broadcast_u32(multiplier, ROOT)?;
        self.state = RunState::GotRangeMultiplier;

        let plan = decompose(self.num_tasks, &self.capacities, self.multiplier)?;
        info!(
            tasks = self.num_tasks,
            rounds = plan.num_rounds,
            multiplier = self.multiplier,
            participants = plan.ranges.len(),
            "task space decomposed"
        );
        self.state = RunState::DataDecomposed;

        let parts: Vec<Vec<u8>> = plan.ranges.iter().map(|r| r.to_bytes().to_vec()).collect();
        let mine = self.comm.scatter(&parts, ROOT)?;
        self.my_range = TaskRange::from_bytes(&mine)
            .ok_or(CommError::Truncated { expected: 16, got: mine.len() })?;
        self.ranges = plan.ranges;
        self.state = RunState::GotTaskRanges;
        Ok(())
    }

    fn worker_pre_run(&mut self, app: &dyn Application) -> Result<(), ExecError> {
        self.comm.gather(&self.pool_capacity().to_le_bytes(), ROOT)?;
        self.state = RunState::GotTaskCounts;

        let ctx = self.ctx();
        let len = self.comm.broadcast_u32(0, ROOT)? as usize;
        self.state = RunState::GotGlobalDataLength;
        if len > 0 {
            let mut buf = Vec::new();
            self.comm.broadcast(&mut buf, ROOT)?;
            if buf.len() != len {
                return Err(CommError::Truncated { expected: len, got: buf.len() }.into());
            }
            let data = self.global_data.insert(buf);
            app.on_receive_global_data(&ctx, data.as_slice())?;
        }
        self.state = RunState::GotGlobalData;

        self.num_tasks = self.comm.broadcast_u64(0, ROOT)?;
        self.state = RunState::GotNumTasks;
        self.multiplier = self.comm.broadcast_u32(0, ROOT)?.max(1);
        self.state = RunState::GotRangeMultiplier;

        let mine = self.comm.scatter(&[], ROOT)?;
        self.my_range = TaskRange::from_bytes(&mine)
            .ok_or(CommError::Truncated { expected: 16, got: mine.len() })?;
        self.state = RunState::GotTaskRanges;
        debug!(rank = self.comm.rank(), range = %self.my_range, "received task range");
        Ok(())
    }

    fn execute(&mut self, app: &dyn Application) -> Result<RunOutcome, ExecError> {
        let devices: Vec<Device> = self.pool.as_ref().map(|p| p.devices().to_vec()).unwrap_or_default();
        let global = self.global_data.clone().unwrap_or_default();
        let ctx = self.ctx();
        info!(rank = ctx.rank, range = %self.my_range, devices = devices.len(), "starting execution");

        let mut started = Ok(());
        for (i, d) in devices.iter().enumerate() {
            if let Err(e) = app.on_device_start(&ctx, d, i, &global) {
                error!(rank = ctx.rank, device = i, "device start failed: {e}");
                started = Err(e);
                break;
            }
        }
        self.state = RunState::DeviceStarted;

        let outcome = if ctx.size <= 1 {
            self.run_single(app, &devices, &global, ctx, started)
        } else if ctx.is_coordinator() {
            self.run_coordinator(app, &devices, &global, ctx, started)
        } else {
            self.run_worker(app, &devices, &global, ctx, started)
        };
        self.state = RunState::DeviceDoneRunning;

        let mut finished = Ok(());
        for (i, d) in devices.iter().enumerate() {
            if let Err(e) = app.on_device_finish(&ctx, d, i, &global) {
                error!(rank = ctx.rank, device = i, "device finish failed: {e}");
                if finished.is_ok() {
                    finished = Err(e);
                }
            }
        }
        self.state = RunState::DeviceFinished;
        let outcome = outcome?;
        finished?;
        Ok(outcome)
    }

    fn run_single(
        &self,
        app: &dyn Application,
        devices: &[Device],
        global: &[u8],
        ctx: RunContext,
        started: Result<(), ExecError>,
    ) -> Result<RunOutcome, ExecError> {
        started?;
        let progress = Mutex::new(ProgressTracker::new(self.num_tasks));
        let stop = StopSignal::new();
        let mut sink = DirectSink::new(app, ctx, &progress, stop.clone());
        let flow = RoundLoop::new(app, devices, global, ctx, self.multiplier).run(self.my_range, &mut sink)?;
        Ok(if flow == Flow::Stop || stop.is_raised() { RunOutcome::Stopped } else { RunOutcome::Completed })
    }

    fn run_coordinator(
        &self,
        app: &dyn Application,
        devices: &[Device],
        global: &[u8],
        ctx: RunContext,
        started: Result<(), ExecError>,
    ) -> Result<RunOutcome, ExecError> {
        let progress = Mutex::new(ProgressTracker::new(self.num_tasks));
        let stop = StopSignal::new();
        let breaker = StopSignal::new();
        let comm: &dyn Communicator = self.comm.as_ref();

        let (own, report) = thread::scope(|s| {
            let listener = Listener::new(comm, app, ctx, &progress, stop.clone(), breaker.clone());
            let handle = thread::Builder::new()
                .name("crackle-listener".into())
                .spawn_scoped(s, move || listener.run());
            let handle = match handle {
                Ok(h) => h,
                Err(e) => {
                    let err = ExecError::System(format!("failed to spawn result listener: {e}"));
                    return (Err(err), ListenerReport::default());
                }
            };

            let own = started.and_then(|()| {
                let mut sink = DirectSink::new(app, ctx, &progress, stop.clone());
                RoundLoop::new(app, devices, global, ctx, self.multiplier).run(self.my_range, &mut sink)
            });
            match &own {
                Ok(Flow::Stop) => stop.raise(),
                Ok(Flow::Continue) => {}
                Err(e) => {
                    error!("coordinator round loop failed: {e}");
                    stop.raise();
                    breaker.raise();
                }
            }
            let report = handle.join().unwrap_or_else(|_| ListenerReport {
                stopped: true,
                failure: Some(ExecError::System("result listener panicked".into())),
            });
            (own, report)
        });

        let flow = own?;
        if let Some(e) = report.failure {
            return Err(e);
        }
        if flow == Flow::Stop || report.stopped || stop.is_raised() {
            Ok(RunOutcome::Stopped)
        } else {
            Ok(RunOutcome::Completed)
        }
    }

    fn run_worker(
        &self,
        app: &dyn Application,
        devices: &[Device],
        global: &[u8],
        ctx: RunContext,
        started: Result<(), ExecError>,
    ) -> Result<RunOutcome, ExecError> {
        let comm: &dyn Communicator = self.comm.as_ref();
        let result = started.and_then(|()| {
            let mut sink = RemoteSink::new(comm, ctx.run);
            RoundLoop::new(app, devices, global, ctx, self.multiplier).run(self.my_range, &mut sink)
        });
        let code = match &result {
            Ok(Flow::Stop) => CODE_STOP,
            Ok(Flow::Continue) => CODE_OK,
            Err(e) => e.code(),
        };
        let notice = comm.send(ROOT, TAG_COMPLETED, &encode_code(code));
        debug!(rank = ctx.rank, code, "completion notice sent");
        let flow = result?;
        notice?;
        Ok(if flow == Flow::Stop { RunOutcome::Stopped } else { RunOutcome::Completed })
    }

    fn post_run(&mut self, app: &dyn Application) -> Result<(), ExecError> {
        let reached = self.state;
        let ctx = self.ctx();
        if let Some(data) = self.global_data.take() {
            app.free_global_data(&ctx, data);
            self.state = RunState::FreedGlobalData;
        }
        if reached == RunState::NotStarted {
            return Ok(());
        }
        let finished = app.on_finish(&ctx);
        self.state = RunState::Finished;
        finished
    }

    pub fn num_systems(&self) -> usize {
        self.comm.size()
    }

    pub fn system_id(&self) -> usize {
        self.comm.rank()
    }

    pub fn num_tasks(&self) -> u64 {
        self.num_tasks
    }

    pub fn num_devices(&self) -> usize {
        self.pool.as_ref().map_or(0, DevicePool::len)
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// This rank's share of the task space, once ranges were scattered.
    pub fn task_range(&self) -> TaskRange {
        self.my_range
    }

    pub fn devices(&self) -> &[Device] {
        self.pool.as_ref().map(DevicePool::devices).unwrap_or(&[])
    }

    /// Per-rank capacities; only populated on the coordinator.
    pub fn capacities(&self) -> &[u64] {
        &self.capacities
    }

    /// Per-rank ranges; only populated on the coordinator.
    pub fn ranges(&self) -> &[TaskRange] {
        &self.ranges
    }

    pub fn dump(&self) {
        info!(
            rank = self.system_id(),
            systems = self.num_systems(),
            devices = self.num_devices(),
            capacity = self.pool_capacity(),
            state = %self.state,
            tasks = self.num_tasks,
            multiplier = self.multiplier,
            range = %self.my_range,
            "executor"
        );
        for (i, d) in self.devices().iter().enumerate() {
            info!(device = i, name = %d.info.name, kind = %d.info.kind, capacity = d.capacity(), "local device");
        }
        for (rank, (cap, range)) in self.capacities.iter().zip(&self.ranges).enumerate() {
            info!(rank, capacity = cap, range = %range, "participant");
        }
    }
}
