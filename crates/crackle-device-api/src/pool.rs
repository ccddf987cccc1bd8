use crate::{CommandQueue, DeviceError, DeviceInfo, DeviceRuntime, DeviceType, Program};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};

/// One device of the pool together with its queue and (once built) program.
#[derive(Clone)]
pub struct Device {
    pub info: DeviceInfo,
    pub queue: Arc<dyn CommandQueue>,
    pub program: Option<Arc<dyn Program>>,
}

impl Device {
    pub fn capacity(&self) -> u64 {
        self.info.capacity()
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("info", &self.info)
            .field("has_program", &self.program.is_some())
            .finish()
    }
}

pub struct DevicePool {
    runtime: Arc<dyn DeviceRuntime>,
    filter: DeviceType,
    max_devices: u32,
    devices: Vec<Device>,
    build_attempted: bool,
    built: bool,
}

impl DevicePool {
    /// Enumerates devices accepted by `filter`, keeping at most `max_devices`
    /// of them (0 keeps all), and opens a command queue on each.
    pub fn init(
        runtime: Arc<dyn DeviceRuntime>,
        filter: DeviceType,
        max_devices: u32,
    ) -> Result<Self, DeviceError> {
        let mut infos = runtime.enumerate(filter)?;
        infos.retain(|d| filter.accepts(d.kind));
        if max_devices > 0 {
            infos.truncate(max_devices as usize);
        }
        if infos.is_empty() {
            error!(runtime = runtime.name(), %filter, "no devices found");
            return Err(DeviceError::NoDevices(filter));
        }
        let mut devices = Vec::with_capacity(infos.len());
        for info in infos {
            info!(
                "device {}: {} ({}, {} CU x {} WG, {} MiB)",
                info.index,
                info.name,
                info.kind,
                info.compute_units,
                info.workgroup_size,
                info.global_mem_bytes >> 20
            );
            let queue = runtime.open_queue(&info)?;
            devices.push(Device { info, queue, program: None });
        }
        Ok(Self {
            runtime,
            filter,
            max_devices,
            devices,
            build_attempted: false,
            built: false,
        })
    }

    /// Builds `source` once per device context and hands the program to every
    /// device in that context. A failure in any context leaves the pool unusable.
    pub fn load_program(&mut self, source: &[u8], options: &str) -> Result<(), DeviceError> {
        self.build_attempted = true;
        self.built = false;
        for d in &mut self.devices {
            d.program = None;
        }

        let mut contexts: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        for (i, d) in self.devices.iter().enumerate() {
            contexts.entry(d.info.context).or_default().push(i);
        }

        let mut built = Vec::with_capacity(contexts.len());
        for (context, members) in &contexts {
            let infos: Vec<DeviceInfo> = members.iter().map(|&i| self.devices[i].info.clone()).collect();
            match self.runtime.build_program(*context, &infos, source, options) {
                Ok(p) => {
                    debug!(context, devices = members.len(), "program built");
                    built.push((members, p));
                }
                Err(e) => {
                    error!(context, "program build failed: {e}");
                    return Err(e);
                }
            }
        }
        for (members, program) in built {
            for &i in members {
                self.devices[i].program = Some(program.clone());
            }
        }
        self.built = true;
        Ok(())
    }

    pub fn is_usable(&self) -> bool {
        !self.devices.is_empty() && (!self.build_attempted || self.built)
    }

    /// True when the pool was created with these settings.
    pub fn matches(&self, filter: DeviceType, max_devices: u32) -> bool {
        self.filter == filter && self.max_devices == max_devices
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Sum of per-device capacities.
    pub fn capacity(&self) -> u64 {
        self.devices.iter().map(Device::capacity).fold(0u64, u64::saturating_add)
    }

    pub fn min_address_bits(&self) -> u32 {
        self.devices.iter().map(|d| d.info.address_bits).min().unwrap_or(0)
    }

    pub fn runtime(&self) -> &Arc<dyn DeviceRuntime> {
        &self.runtime
    }
}

impl fmt::Debug for DevicePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DevicePool")
            .field("runtime", &self.runtime.name())
            .field("filter", &self.filter)
            .field("max_devices", &self.max_devices)
            .field("devices", &self.devices)
            .finish()
    }
}
