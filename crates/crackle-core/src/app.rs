use crate::{ChunkStatus, ExecError, Flow, TaskRange};
use crackle_device_api::{Device, DeviceType, Event};
use std::time::Duration;

/// Snapshot of the executor handed to every callback.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunContext {
    pub rank: usize,
    pub size: usize,
    pub num_devices: usize,
    /// Zero until the coordinator has published the task count.
    pub num_tasks: u64,
    /// Number of `run` calls made on the executor so far, this one included.
    pub run: u64,
}

impl RunContext {
    pub fn is_coordinator(&self) -> bool {
        self.rank == 0
    }
}

/// What `on_device_range_done` hands back for one chunk.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChunkOutput {
    pub flow: Flow,
    pub data: Vec<u8>,
}

impl ChunkOutput {
    pub fn proceed() -> Self {
        Self::default()
    }

    pub fn stop(data: Vec<u8>) -> Self {
        Self { flow: Flow::Stop, data }
    }
}

/// Callbacks the executor drives. `get_code`, `get_num_tasks` and
/// `on_device_range_exec` are required; everything else defaults to a no-op.
///
/// Callbacks take `&self` because the coordinator's listener thread calls
/// `on_receive_range_results` and `progress` while the coordinator's own round
/// loop is running device callbacks.
pub trait Application: Send + Sync {
    /// Device filter; the coordinator's choice is applied on every rank.
    fn device_type(&self) -> DeviceType {
        DeviceType::Any
    }

    /// Device cap; 0 uses every matching device.
    fn max_devices(&self) -> u32 {
        0
    }

    fn on_start(&self, _ctx: &RunContext) -> Result<(), ExecError> {
        Ok(())
    }

    fn on_finish(&self, _ctx: &RunContext) -> Result<(), ExecError> {
        Ok(())
    }

    /// Program source compiled for every device.
    fn get_code(&self, ctx: &RunContext) -> Result<Vec<u8>, ExecError>;

    fn get_build_options(&self, _ctx: &RunContext) -> Option<String> {
        None
    }

    fn on_code_compiled(&self, _ctx: &RunContext, _success: bool) {}

    /// Size of the task space. Zero is a configuration error.
    fn get_num_tasks(&self, ctx: &RunContext) -> u64;

    fn get_task_range_multiplier(&self, _ctx: &RunContext) -> u32 {
        1
    }

    /// Payload broadcast from the coordinator to every worker. `Ok(None)`
    /// means there is none; an empty buffer is rejected.
    fn get_global_data(&self, _ctx: &RunContext) -> Result<Option<Vec<u8>>, ExecError> {
        Ok(None)
    }

    /// Hands the payload back at teardown. Dropping it is the default.
    fn free_global_data(&self, _ctx: &RunContext, _data: Vec<u8>) {}

    /// Workers only.
    fn on_receive_global_data(&self, _ctx: &RunContext, _data: &[u8]) -> Result<(), ExecError> {
        Ok(())
    }

    fn on_device_start(
        &self,
        _ctx: &RunContext,
        _device: &Device,
        _index: usize,
        _global: &[u8],
    ) -> Result<(), ExecError> {
        Ok(())
    }

    fn on_device_finish(
        &self,
        _ctx: &RunContext,
        _device: &Device,
        _index: usize,
        _global: &[u8],
    ) -> Result<(), ExecError> {
        Ok(())
    }

    /// Submits `range` to the device. Returning an event makes the round wait
    /// for it; `None` means the work already finished synchronously.
    fn on_device_range_exec(
        &self,
        ctx: &RunContext,
        device: &Device,
        index: usize,
        global: &[u8],
        range: TaskRange,
    ) -> Result<Option<Event>, ExecError>;

    fn on_device_range_done(
        &self,
        _ctx: &RunContext,
        _device: &Device,
        _index: usize,
        _global: &[u8],
        _range: TaskRange,
    ) -> Result<ChunkOutput, ExecError> {
        Ok(ChunkOutput::proceed())
    }

    /// Coordinator-side aggregation; called once per chunk, local or remote.
    fn on_receive_range_results(
        &self,
        _ctx: &RunContext,
        _range: TaskRange,
        _status: ChunkStatus,
        _data: &[u8],
    ) -> Result<Flow, ExecError> {
        Ok(Flow::Continue)
    }

    fn progress(&self, _ctx: &RunContext, _percent: f32, _eta: Option<Duration>) {}
}
