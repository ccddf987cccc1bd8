use crate::kernel::{Defines, KernelContext, KernelError};
use crate::program::CpuKernelHandle;
use crate::CpuKernel;
use crackle_device_api::{CommandQueue, DeviceError, Event, Kernel, UserEvent};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Status reported through a failed event when a kernel returns an error.
pub const LAUNCH_FAILURE: i32 = -9999;

struct Launch {
    kernel_name: String,
    kernel: Arc<dyn CpuKernel>,
    defines: Arc<Defines>,
    offset: u64,
    size: u64,
    args: Arc<[u8]>,
    event: Arc<UserEvent>,
}

enum Command {
    Launch(Launch),
    Barrier(Sender<()>),
}

/// In-order queue backed by one worker thread. Launches are held back until
/// `flush` and then split across the device's lanes.
pub struct CpuQueue {
    device: u32,
    pending: Mutex<Vec<Command>>,
    tx: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
}

impl CpuQueue {
    pub(crate) fn spawn(device: u32, lanes: u32) -> Result<Self, DeviceError> {
        let (tx, rx) = unbounded::<Command>();
        let worker = thread::Builder::new()
            .name(format!("crackle-cpu-dev{device}"))
            .spawn(move || worker_loop(device, lanes.max(1), rx))
            .map_err(|e| {
                warn!(device, "failed to spawn queue thread: {e}");
                DeviceError::Runtime { call: "spawn_queue", code: e.raw_os_error().unwrap_or(-1) }
            })?;
        Ok(Self {
            device,
            pending: Mutex::new(Vec::new()),
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    fn submit(&self, cmds: Vec<Command>) -> Result<(), DeviceError> {
        let tx = self.tx.as_ref().ok_or(DeviceError::QueueClosed(self.device))?;
        for cmd in cmds {
            tx.send(cmd).map_err(|_| DeviceError::QueueClosed(self.device))?;
        }
        Ok(())
    }
}

impl CommandQueue for CpuQueue {
    fn enqueue(
        &self,
        kernel: &Kernel,
        offset: u64,
        size: u64,
        args: Arc<[u8]>,
    ) -> Result<Event, DeviceError> {
        let handle = kernel
            .downcast::<CpuKernelHandle>()
            .ok_or_else(|| DeviceError::ForeignKernel("cpu".into()))?;
        let event = Arc::new(UserEvent::new());
        let launch = Launch {
            kernel_name: kernel.name().to_string(),
            kernel: handle.kernel.clone(),
            defines: handle.defines.clone(),
            offset,
            size,
            args,
            event: event.clone(),
        };
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Command::Launch(launch));
        Ok(event)
    }

    fn flush(&self) -> Result<(), DeviceError> {
        let cmds = std::mem::take(&mut *self.pending.lock().unwrap_or_else(|p| p.into_inner()));
        self.submit(cmds)
    }

    fn finish(&self) -> Result<(), DeviceError> {
        self.flush()?;
        let (done_tx, done_rx) = bounded(1);
        self.submit(vec![Command::Barrier(done_tx)])?;
        done_rx.recv().map_err(|_| DeviceError::QueueClosed(self.device))
    }
}

impl Drop for CpuQueue {
    fn drop(&mut self) {
        // Closing the channel ends the worker once queued launches drain.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(device = self.device, "queue thread panicked");
            }
        }
    }
}

fn worker_loop(device: u32, lanes: u32, rx: Receiver<Command>) {
    while let Ok(cmd) = rx.recv() {
        match cmd {
            Command::Launch(launch) => {
                launch.event.set_running();
                debug!(device, kernel = %launch.kernel_name, offset = launch.offset, size = launch.size, "launch");
                match run_lanes(&launch, lanes) {
                    Ok(out) => launch.event.complete(out),
                    Err(e) => {
                        warn!(device, "{e}");
                        launch.event.fail(LAUNCH_FAILURE);
                    }
                }
            }
            Command::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!(device, "queue thread exiting");
}

fn lane_bounds(offset: u64, size: u64, lanes: u64, lane: u64) -> (u64, u64) {
    let base = size / lanes;
    let extra = size % lanes;
    let start = lane * base + lane.min(extra);
    let len = base + u64::from(lane < extra);
    (offset + start, len)
}

fn run_lanes(launch: &Launch, lanes: u32) -> Result<Vec<u8>, KernelError> {
    let lanes = u64::from(lanes).min(launch.size).max(1);
    if lanes == 1 {
        return launch.kernel.run(&KernelContext {
            offset: launch.offset,
            size: launch.size,
            args: &launch.args,
            defines: &launch.defines,
            lane: 0,
        });
    }
    let results: Vec<Result<Vec<u8>, KernelError>> = thread::scope(|s| {
        let handles: Vec<_> = (0..lanes)
            .map(|lane| {
                let (offset, size) = lane_bounds(launch.offset, launch.size, lanes, lane);
                s.spawn(move || {
                    launch.kernel.run(&KernelContext {
                        offset,
                        size,
                        args: &launch.args,
                        defines: &launch.defines,
                        lane: lane as u32,
                    })
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join().unwrap_or_else(|_| {
                    Err(KernelError::new(launch.kernel_name.clone(), "lane panicked"))
                })
            })
            .collect()
    });
    let mut out = Vec::new();
    for r in results {
        out.extend_from_slice(&r?);
    }
    Ok(out)
}
