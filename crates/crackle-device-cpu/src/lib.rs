//! Device runtime that executes native kernels on host threads.
//!
//! Each configured device gets its own queue thread; a launch is split across
//! the device's compute units with scoped threads. Programs are kernel
//! manifests resolved against a [`KernelRegistry`].

use crackle_device_api::{
    CommandQueue, DeviceError, DeviceInfo, DeviceKind, DeviceRuntime, DeviceType, Program,
};
use std::sync::Arc;
use tracing::debug;

mod kernel;
mod program;
mod queue;

pub use kernel::{CpuKernel, Defines, KernelContext, KernelError, KernelRegistry};
pub use program::{parse_manifest, parse_options, CpuProgram};
pub use queue::{CpuQueue, LAUNCH_FAILURE};

const DEFAULT_WORKGROUP: u64 = 64;

#[derive(Clone, Debug)]
pub struct CpuDeviceSpec {
    pub name: String,
    /// Kind reported to filters. Simulated GPUs still run on host threads.
    pub kind: DeviceKind,
    pub compute_units: u32,
    pub workgroup_size: u64,
    pub context: u32,
}

impl CpuDeviceSpec {
    /// The host CPU, using `lanes` threads (or every available core).
    pub fn host(lanes: Option<u32>, workgroup_size: Option<u64>) -> Self {
        let lanes = lanes.filter(|&l| l > 0).unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1)
        });
        Self {
            name: "host-cpu".into(),
            kind: DeviceKind::Cpu,
            compute_units: lanes,
            workgroup_size: workgroup_size.filter(|&w| w > 0).unwrap_or(DEFAULT_WORKGROUP),
            context: 0,
        }
    }
}

#[derive(Clone)]
pub struct CpuRuntime {
    devices: Vec<CpuDeviceSpec>,
    kernels: KernelRegistry,
}

impl CpuRuntime {
    pub fn new(kernels: KernelRegistry) -> Self {
        Self::with_devices(vec![CpuDeviceSpec::host(None, None)], kernels)
    }

    pub fn with_devices(devices: Vec<CpuDeviceSpec>, kernels: KernelRegistry) -> Self {
        Self { devices, kernels }
    }

    pub fn registry(&self) -> &KernelRegistry {
        &self.kernels
    }

    pub fn specs(&self) -> &[CpuDeviceSpec] {
        &self.devices
    }
}

impl DeviceRuntime for CpuRuntime {
    fn name(&self) -> &str {
        "cpu"
    }

    fn enumerate(&self, filter: DeviceType) -> Result<Vec<DeviceInfo>, DeviceError> {
        Ok(self
            .devices
            .iter()
            .enumerate()
            .filter(|(_, s)| filter.accepts(s.kind))
            .map(|(i, s)| DeviceInfo {
                index: i as u32,
                name: s.name.clone(),
                kind: s.kind,
                compute_units: s.compute_units,
                workgroup_size: s.workgroup_size,
                address_bits: usize::BITS,
                global_mem_bytes: 1 << 30,
                context: s.context,
            })
            .collect())
    }

    fn open_queue(&self, device: &DeviceInfo) -> Result<Arc<dyn CommandQueue>, DeviceError> {
        Ok(Arc::new(CpuQueue::spawn(device.index, device.compute_units)?))
    }

    fn build_program(
        &self,
        context: u32,
        devices: &[DeviceInfo],
        source: &[u8],
        options: &str,
    ) -> Result<Arc<dyn Program>, DeviceError> {
        let program = CpuProgram::build(context, &self.kernels, source, options)?;
        debug!(
            context,
            devices = devices.len(),
            kernels = ?program.kernel_names(),
            "built host program"
        );
        Ok(Arc::new(program))
    }
}
