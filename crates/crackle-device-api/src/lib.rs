use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

mod event;
mod pool;

pub use event::UserEvent;
pub use pool::{Device, DevicePool};

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no devices match filter {0}")]
    NoDevices(DeviceType),
    #[error("program build failed for context {context}: {reason}")]
    Build { context: u32, reason: String },
    #[error("kernel `{0}` not found in program")]
    UnknownKernel(String),
    #[error("kernel handle does not belong to runtime {0}")]
    ForeignKernel(String),
    #[error("command queue for device {0} is closed")]
    QueueClosed(u32),
    #[error("{call} failed with code {code}")]
    Runtime { call: &'static str, code: i32 },
}

/// Device filter used when enumerating.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Cpu,
    Gpu,
    #[default]
    Any,
}

impl DeviceType {
    pub fn accepts(self, kind: DeviceKind) -> bool {
        match self {
            DeviceType::Any => true,
            DeviceType::Cpu => kind == DeviceKind::Cpu,
            DeviceType::Gpu => kind == DeviceKind::Gpu,
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            DeviceType::Cpu => 1,
            DeviceType::Gpu => 2,
            DeviceType::Any => 3,
        }
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(DeviceType::Cpu),
            2 => Some(DeviceType::Gpu),
            3 => Some(DeviceType::Any),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceType::Cpu => "cpu",
            DeviceType::Gpu => "gpu",
            DeviceType::Any => "any",
        })
    }
}

impl FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(DeviceType::Cpu),
            "gpu" => Ok(DeviceType::Gpu),
            "any" | "all" => Ok(DeviceType::Any),
            other => Err(format!("unknown device type `{other}` (expected cpu, gpu or any)")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Gpu,
    Accelerator,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Gpu => "gpu",
            DeviceKind::Accelerator => "accelerator",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Position in the runtime's enumeration order.
    pub index: u32,
    pub name: String,
    pub kind: DeviceKind,

    /// Number of parallel compute units.
    pub compute_units: u32,

    /// Maximum work-items per work-group.
    pub workgroup_size: u64,

    /// Device address width; kernels may size their counters from it.
    pub address_bits: u32,
    pub global_mem_bytes: u64,

    /// Devices with the same context id share one compiled program.
    pub context: u32,
}

impl DeviceInfo {
    /// Work-items the device runs concurrently: compute units times work-group size.
    pub fn capacity(&self) -> u64 {
        u64::from(self.compute_units).saturating_mul(self.workgroup_size)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventStatus {
    Queued,
    Running,
    Complete,
    Failed(i32),
}

impl EventStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, EventStatus::Complete | EventStatus::Failed(_))
    }
}

pub type EventCallback = Box<dyn FnOnce(EventStatus) + Send + 'static>;

/// Completion handle for one piece of asynchronous device work.
///
/// Callbacks registered with `set_callback` run exactly once, on whichever
/// thread drives the event to a terminal status. Registering on an event that
/// already finished runs the callback immediately on the caller's thread.
pub trait CompletionEvent: Send + Sync {
    fn status(&self) -> EventStatus;
    fn set_callback(&self, cb: EventCallback) -> Result<(), DeviceError>;
    fn wait(&self) -> EventStatus;

    /// Takes the output buffer produced by the work, if any.
    fn take_output(&self) -> Option<Vec<u8>>;
}

pub type Event = Arc<dyn CompletionEvent>;

/// Opaque kernel handle created from a [`Program`]. Each runtime stores its own
/// handle type inside and downcasts it back on enqueue.
#[derive(Clone)]
pub struct Kernel {
    name: String,
    handle: Arc<dyn Any + Send + Sync>,
}

impl Kernel {
    pub fn new(name: impl Into<String>, handle: Arc<dyn Any + Send + Sync>) -> Self {
        Self { name: name.into(), handle }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.handle.downcast_ref::<T>()
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel").field("name", &self.name).finish()
    }
}

pub trait Program: Send + Sync {
    fn context(&self) -> u32;
    fn build_options(&self) -> &str;
    fn create_kernel(&self, name: &str) -> Result<Kernel, DeviceError>;
}

/// In-order submission queue owned by one device.
///
/// Launches may be buffered until `flush`; `finish` flushes and blocks until
/// everything submitted so far has completed.
pub trait CommandQueue: Send + Sync {
    fn enqueue(
        &self,
        kernel: &Kernel,
        offset: u64,
        size: u64,
        args: Arc<[u8]>,
    ) -> Result<Event, DeviceError>;
    fn flush(&self) -> Result<(), DeviceError>;
    fn finish(&self) -> Result<(), DeviceError>;
}

pub trait DeviceRuntime: Send + Sync {
    fn name(&self) -> &str;
    fn enumerate(&self, filter: DeviceType) -> Result<Vec<DeviceInfo>, DeviceError>;
    fn open_queue(&self, device: &DeviceInfo) -> Result<Arc<dyn CommandQueue>, DeviceError>;
    fn build_program(
        &self,
        context: u32,
        devices: &[DeviceInfo],
        source: &[u8],
        options: &str,
    ) -> Result<Arc<dyn Program>, DeviceError>;
}
