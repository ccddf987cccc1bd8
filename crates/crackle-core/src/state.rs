use std::fmt;

/// How far a run got. Only used for diagnostics and to decide whether
/// `on_finish` runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RunState {
    #[default]
    NotStarted,
    DeviceInited,
    Started,
    GotCode,
    GotBuildOpts,
    Compiled,
    GotTaskCounts,
    GotGlobalDataLength,
    GotGlobalData,
    GotNumTasks,
    GotRangeMultiplier,
    DataDecomposed,
    GotTaskRanges,
    DeviceStarted,
    DeviceDoneRunning,
    DeviceFinished,
    FreedGlobalData,
    Finished,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::NotStarted => "not-started",
            RunState::DeviceInited => "device-inited",
            RunState::Started => "started",
            RunState::GotCode => "got-code",
            RunState::GotBuildOpts => "got-build-opts",
            RunState::Compiled => "compiled",
            RunState::GotTaskCounts => "got-task-counts",
            RunState::GotGlobalDataLength => "got-global-data-length",
            RunState::GotGlobalData => "got-global-data",
            RunState::GotNumTasks => "got-num-tasks",
            RunState::GotRangeMultiplier => "got-range-multiplier",
            RunState::DataDecomposed => "data-decomposed",
            RunState::GotTaskRanges => "got-task-ranges",
            RunState::DeviceStarted => "device-started",
            RunState::DeviceDoneRunning => "device-done-running",
            RunState::DeviceFinished => "device-finished",
            RunState::FreedGlobalData => "freed-global-data",
            RunState::Finished => "finished",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
