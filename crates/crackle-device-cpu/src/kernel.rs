use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("kernel {kernel} failed: {message}")]
pub struct KernelError {
    pub kernel: String,
    pub message: String,
}

impl KernelError {
    pub fn new(kernel: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kernel: kernel.into(), message: message.into() }
    }
}

/// Preprocessor-style defines collected from `-D` build options.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Defines(BTreeMap<String, String>);

impl Defines {
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn get_u64(&self, name: &str) -> Option<u64> {
        self.get(name).and_then(|v| v.parse().ok())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Everything a kernel sees for one lane of a launch.
pub struct KernelContext<'a> {
    /// First task index of this lane.
    pub offset: u64,
    /// Tasks in this lane.
    pub size: u64,
    pub args: &'a [u8],
    pub defines: &'a Defines,
    pub lane: u32,
}

/// Native kernel run by the host runtime. Lanes of one launch run concurrently
/// and their outputs are concatenated in lane order.
pub trait CpuKernel: Send + Sync {
    fn run(&self, ctx: &KernelContext<'_>) -> Result<Vec<u8>, KernelError>;
}

/// Name-to-kernel table shared by a runtime and every program it builds.
#[derive(Clone, Default)]
pub struct KernelRegistry {
    kernels: Arc<RwLock<HashMap<String, Arc<dyn CpuKernel>>>>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, kernel: Arc<dyn CpuKernel>) {
        let mut map = self.kernels.write().unwrap_or_else(|p| p.into_inner());
        map.insert(name.into(), kernel);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CpuKernel>> {
        let map = self.kernels.read().unwrap_or_else(|p| p.into_inner());
        map.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let map = self.kernels.read().unwrap_or_else(|p| p.into_inner());
        let mut names: Vec<String> = map.keys().cloned().collect();
        names.sort();
        names
    }
}
