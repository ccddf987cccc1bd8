use crate::keyspace::{self, MAX_NCHARS};
use crate::kernel::{KERNEL_NAME, KERNEL_SOURCE, LEN_DEFINE};
use crate::{Charset, GlobalData, PREFIX_CAPACITY};
use anyhow::{bail, Result};
use crackle_core::{Application, ChunkOutput, ChunkStatus, ExecError, Flow, RunContext, TaskRange};
use crackle_device_api::{Device, DeviceType, Event, Kernel};
use crackle_metrics::Metrics;
use crackle_utils::{bytes_to_hex, hex_to_digest, MD5_DIGEST_LEN};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{error, info, warn};

/// Tasks per compute unit and charset symbol in one round.
const MULTIPLIER_PER_SYMBOL: u32 = 32;

#[derive(Clone, Debug)]
pub struct CrackParams {
    pub digest: [u8; MD5_DIGEST_LEN],
    pub prefix: Vec<u8>,
    pub charset: Charset,
    pub nchars: u8,
    pub device_type: DeviceType,
    pub max_devices: u32,
    /// Replaces the built-in kernel manifest.
    pub kernel_source: Option<Vec<u8>>,
}

impl CrackParams {
    /// Defaults for everything but the target: alnum, 8 characters, no prefix.
    pub fn new(md5_hex: &str) -> Result<Self> {
        Ok(Self {
            digest: hex_to_digest(md5_hex)?,
            prefix: Vec::new(),
            charset: Charset::default(),
            nchars: MAX_NCHARS,
            device_type: DeviceType::Any,
            max_devices: 0,
            kernel_source: None,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.nchars == 0 || self.nchars > MAX_NCHARS {
            bail!("string length must be between 1 and {MAX_NCHARS}, got {}", self.nchars);
        }
        if self.prefix.len() >= PREFIX_CAPACITY {
            bail!("prefix must be shorter than {PREFIX_CAPACITY} bytes");
        }
        if self.prefix.contains(&0) {
            bail!("prefix contains a NUL byte");
        }
        Ok(())
    }

    pub fn num_tasks(&self) -> u64 {
        keyspace::num_tasks(self.charset, self.nchars, self.prefix.len()).unwrap_or(0)
    }

    fn global(&self) -> GlobalData {
        GlobalData {
            prefix: self.prefix.clone(),
            digest: self.digest,
            charset: self.charset,
            nchars: self.nchars,
        }
    }
}

/// What a device reports when its chunk contained the preimage.
///
/// Layout (little-endian): candidate[16, NUL padded] | kernel counter u64 | rank u32
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchRecord {
    pub candidate: [u8; MD5_DIGEST_LEN],
    pub kernel_counter: u64,
    pub rank: u32,
}

impl MatchRecord {
    pub const LEN: usize = 28;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(&self.candidate);
        out.extend_from_slice(&self.kernel_counter.to_le_bytes());
        out.extend_from_slice(&self.rank.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::LEN {
            return None;
        }
        let mut candidate = [0u8; MD5_DIGEST_LEN];
        candidate.copy_from_slice(&buf[..16]);
        let kernel_counter = u64::from_le_bytes(buf[16..24].try_into().ok()?);
        let rank = u32::from_le_bytes(buf[24..28].try_into().ok()?);
        Some(Self { candidate, kernel_counter, rank })
    }

    pub fn text(&self) -> String {
        let end = self.candidate.iter().position(|&b| b == 0).unwrap_or(MD5_DIGEST_LEN);
        String::from_utf8_lossy(&self.candidate[..end]).into_owned()
    }
}

#[derive(Default)]
struct DeviceSlot {
    kernel: Option<Kernel>,
    event: Option<Event>,
}

/// MD5 preimage search: finds the `nchars`-long string over a charset, with
/// an optional known prefix, whose MD5 equals the target digest.
pub struct Md5Crack {
    params: CrackParams,
    metrics: Option<Arc<Metrics>>,
    slots: Mutex<Vec<DeviceSlot>>,
    kernel_counter: AtomicU64,
    received: Mutex<Option<GlobalData>>,
    found: Mutex<Option<MatchRecord>>,
}

impl Md5Crack {
    pub fn new(params: CrackParams) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            params,
            metrics: None,
            slots: Mutex::new(Vec::new()),
            kernel_counter: AtomicU64::new(0),
            received: Mutex::new(None),
            found: Mutex::new(None),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn params(&self) -> &CrackParams {
        &self.params
    }

    /// Match aggregated on the coordinator, if any.
    pub fn found(&self) -> Option<MatchRecord> {
        lock(&self.found).clone()
    }

    pub fn kernel_counter(&self) -> u64 {
        self.kernel_counter.load(Ordering::Relaxed)
    }

    /// Search parameters received from the coordinator (workers only).
    pub fn received(&self) -> Option<GlobalData> {
        lock(&self.received).clone()
    }

    pub fn dump(&self) {
        let p = &self.params;
        info!("MD5 sum: {}", bytes_to_hex(&p.digest));
        info!("Prefix: {}", String::from_utf8_lossy(&p.prefix));
        info!("Charset: {}", p.charset);
        info!("No. of chars: {}", p.nchars);
        info!("Device type: {} (max {})", p.device_type, p.max_devices);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

fn slot_err(index: usize, what: &str) -> ExecError {
    ExecError::BadState(format!("device {index} has no {what}"))
}

impl Application for Md5Crack {
    fn device_type(&self) -> DeviceType {
        self.params.device_type
    }

    fn max_devices(&self) -> u32 {
        self.params.max_devices
    }

    fn on_start(&self, ctx: &RunContext) -> Result<(), ExecError> {
        if ctx.num_devices == 0 {
            return Err(ExecError::BadState("no devices to search on".into()));
        }
        let mut slots = lock(&self.slots);
        slots.clear();
        slots.resize_with(ctx.num_devices, DeviceSlot::default);
        self.kernel_counter.store(0, Ordering::Relaxed);
        *lock(&self.found) = None;
        Ok(())
    }

    fn on_finish(&self, ctx: &RunContext) -> Result<(), ExecError> {
        lock(&self.slots).clear();
        info!(rank = ctx.rank, kernel_calls = self.kernel_counter(), "search finished");
        Ok(())
    }

    fn get_code(&self, _ctx: &RunContext) -> Result<Vec<u8>, ExecError> {
        Ok(self
            .params
            .kernel_source
            .clone()
            .unwrap_or_else(|| KERNEL_SOURCE.as_bytes().to_vec()))
    }

    fn get_build_options(&self, _ctx: &RunContext) -> Option<String> {
        Some(format!("-D{LEN_DEFINE}={}", self.params.nchars))
    }

    fn on_code_compiled(&self, ctx: &RunContext, success: bool) {
        if !success {
            error!(rank = ctx.rank, "md5 kernel failed to build");
        }
    }

    fn get_num_tasks(&self, _ctx: &RunContext) -> u64 {
        let n = self.params.num_tasks();
        info!("Max possibilities: {n}");
        n
    }

    fn get_task_range_multiplier(&self, _ctx: &RunContext) -> u32 {
        self.params.charset.size() as u32 * MULTIPLIER_PER_SYMBOL
    }

    fn get_global_data(&self, _ctx: &RunContext) -> Result<Option<Vec<u8>>, ExecError> {
        let buf = self
            .params
            .global()
            .encode()
            .map_err(|e| ExecError::InvalidParameter(e.to_string()))?;
        Ok(Some(buf))
    }

    fn on_receive_global_data(&self, ctx: &RunContext, data: &[u8]) -> Result<(), ExecError> {
        let global = GlobalData::decode(data).map_err(|e| ExecError::InvalidValue(e.to_string()))?;
        info!(
            rank = ctx.rank,
            prefix = %String::from_utf8_lossy(&global.prefix),
            digest = %bytes_to_hex(&global.digest),
            charset = %global.charset,
            nchars = global.nchars,
            "received search parameters"
        );
        *lock(&self.received) = Some(global);
        Ok(())
    }

    fn on_device_start(
        &self,
        _ctx: &RunContext,
        device: &Device,
        index: usize,
        global: &[u8],
    ) -> Result<(), ExecError> {
        GlobalData::decode(global).map_err(|e| ExecError::BadState(e.to_string()))?;
        let program = device.program.as_ref().ok_or_else(|| slot_err(index, "program"))?;
        let kernel = program.create_kernel(KERNEL_NAME)?;
        let mut slots = lock(&self.slots);
        let slot = slots.get_mut(index).ok_or_else(|| slot_err(index, "slot"))?;
        slot.kernel = Some(kernel);
        Ok(())
    }

    fn on_device_finish(
        &self,
        _ctx: &RunContext,
        _device: &Device,
        index: usize,
        _global: &[u8],
    ) -> Result<(), ExecError> {
        let mut slots = lock(&self.slots);
        let slot = slots.get_mut(index).ok_or_else(|| slot_err(index, "slot"))?;
        *slot = DeviceSlot::default();
        Ok(())
    }

    fn on_device_range_exec(
        &self,
        _ctx: &RunContext,
        device: &Device,
        index: usize,
        global: &[u8],
        range: TaskRange,
    ) -> Result<Option<Event>, ExecError> {
        let mut slots = lock(&self.slots);
        let slot = slots.get_mut(index).ok_or_else(|| slot_err(index, "slot"))?;
        let kernel = slot.kernel.as_ref().ok_or_else(|| slot_err(index, "kernel"))?;
        let event = device.queue.enqueue(kernel, range.start, range.len(), Arc::from(global))?;
        slot.event = Some(event.clone());
        self.kernel_counter.fetch_add(1, Ordering::Relaxed);
        if let Some(m) = &self.metrics {
            m.kernel_launches.inc();
        }
        Ok(Some(event))
    }

    fn on_device_range_done(
        &self,
        ctx: &RunContext,
        _device: &Device,
        index: usize,
        _global: &[u8],
        range: TaskRange,
    ) -> Result<ChunkOutput, ExecError> {
        let event = {
            let mut slots = lock(&self.slots);
            let slot = slots.get_mut(index).ok_or_else(|| slot_err(index, "slot"))?;
            slot.event.take().ok_or_else(|| slot_err(index, "pending launch"))?
        };
        let output = event.take_output().unwrap_or_default();
        if let Some(m) = &self.metrics {
            m.chunks.inc();
            m.tasks_completed.inc_by(range.len());
        }
        if !output.iter().any(|&b| b != 0) {
            return Ok(ChunkOutput::proceed());
        }
        let mut candidate = [0u8; MD5_DIGEST_LEN];
        let n = output.len().min(MD5_DIGEST_LEN);
        candidate[..n].copy_from_slice(&output[..n]);
        let record = MatchRecord {
            candidate,
            kernel_counter: self.kernel_counter(),
            rank: ctx.rank as u32,
        };
        info!(device = index, %range, "Found match in {}th kernel call: {}", record.kernel_counter, record.text());
        Ok(ChunkOutput::stop(record.encode()))
    }

    fn on_receive_range_results(
        &self,
        _ctx: &RunContext,
        range: TaskRange,
        status: ChunkStatus,
        data: &[u8],
    ) -> Result<Flow, ExecError> {
        let flow = match status {
            ChunkStatus::Ok => Flow::Continue,
            ChunkStatus::Stop => {
                warn!(%range, "stop requested for task range");
                Flow::Stop
            }
            ChunkStatus::Failed(code) => {
                warn!(%range, code, "task range failed");
                Flow::Continue
            }
        };
        if let Some(record) = MatchRecord::decode(data) {
            info!(
                rank = record.rank,
                "Found match in {}th kernel call on system {}",
                record.kernel_counter,
                record.rank
            );
            if let Some(m) = &self.metrics {
                m.matches_found.inc();
            }
            *lock(&self.found) = Some(record);
        }
        Ok(flow)
    }

    fn progress(&self, _ctx: &RunContext, percent: f32, eta: Option<Duration>) {
        if let Some(m) = &self.metrics {
            m.progress_percent.set(f64::from(percent));
        }
        match eta {
            Some(eta) => info!(
                "Progress: {percent:.2}% Estimated Remaining Time: {:.3} seconds",
                eta.as_secs_f64()
            ),
            None => info!("Progress: {percent:.2}%"),
        }
    }
}
