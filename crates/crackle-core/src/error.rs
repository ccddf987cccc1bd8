use crackle_comm::CommError;
use crackle_device_api::DeviceError;
use crackle_proto::{DecodeError, EncodeError};
use thiserror::Error;

pub const CODE_OK: i32 = 0;
pub const CODE_STOP: i32 = 1;
pub const CODE_BAD_STATE: i32 = -1;
pub const CODE_OUT_OF_MEMORY: i32 = -2;
pub const CODE_SYSTEM: i32 = -3;
pub const CODE_DEVICE: i32 = -4;
pub const CODE_MESSAGING: i32 = -5;
pub const CODE_INVALID_PARAMETER: i32 = -6;
pub const CODE_MISSING_CALLBACK: i32 = -7;
pub const CODE_INVALID_VALUE: i32 = -8;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("bad state: {0}")]
    BadState(String),
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    #[error("system error: {0}")]
    System(String),
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
    #[error("messaging error: {0}")]
    Messaging(#[from] CommError),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("missing callback: {0}")]
    MissingCallback(&'static str),
    #[error("invalid value: {0}")]
    InvalidValue(String),
    /// Failure reported by another rank; `code` keeps that rank's error kind.
    #[error("rank {rank} failed with code {code}")]
    Remote { rank: usize, code: i32 },
}

impl ExecError {
    pub fn code(&self) -> i32 {
        match self {
            ExecError::BadState(_) => CODE_BAD_STATE,
            ExecError::OutOfMemory(_) => CODE_OUT_OF_MEMORY,
            ExecError::System(_) => CODE_SYSTEM,
            ExecError::Device(_) => CODE_DEVICE,
            ExecError::Messaging(_) => CODE_MESSAGING,
            ExecError::InvalidParameter(_) => CODE_INVALID_PARAMETER,
            ExecError::MissingCallback(_) => CODE_MISSING_CALLBACK,
            ExecError::InvalidValue(_) => CODE_INVALID_VALUE,
            ExecError::Remote { code, .. } => *code,
        }
    }

    /// Rebuilds an error from a numeric code received over the wire. Returns
    /// `None` for `CODE_OK`, `CODE_STOP` and unknown positive codes.
    pub fn from_code(code: i32, context: impl Into<String>) -> Option<Self> {
        let context = context.into();
        Some(match code {
            CODE_BAD_STATE => ExecError::BadState(context),
            CODE_OUT_OF_MEMORY => ExecError::OutOfMemory(context),
            CODE_SYSTEM => ExecError::System(context),
            CODE_DEVICE => ExecError::Device(DeviceError::Runtime { call: "remote", code }),
            CODE_MESSAGING => ExecError::Messaging(CommError::Protocol(context)),
            CODE_INVALID_PARAMETER => ExecError::InvalidParameter(context),
            CODE_MISSING_CALLBACK => ExecError::MissingCallback("remote"),
            CODE_INVALID_VALUE => ExecError::InvalidValue(context),
            c if c < 0 => ExecError::System(format!("{context} (code {c})")),
            _ => return None,
        })
    }

    pub fn is_messaging(&self) -> bool {
        matches!(self, ExecError::Messaging(_)) || self.code() == CODE_MESSAGING
    }
}

impl From<DecodeError> for ExecError {
    fn from(e: DecodeError) -> Self {
        ExecError::Messaging(CommError::Protocol(e.to_string()))
    }
}

impl From<EncodeError> for ExecError {
    fn from(e: EncodeError) -> Self {
        ExecError::InvalidValue(e.to_string())
    }
}

/// Non-error control value returned by callbacks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Flow {
    #[default]
    Continue,
    Stop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// The whole task space was processed.
    Completed,
    /// A participant requested an early stop.
    Stopped,
}

impl RunOutcome {
    pub fn code(self) -> i32 {
        match self {
            RunOutcome::Completed => CODE_OK,
            RunOutcome::Stopped => CODE_STOP,
        }
    }
}

/// Status of one chunk as seen by the aggregation callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkStatus {
    Ok,
    Stop,
    Failed(i32),
}

impl ChunkStatus {
    pub fn from_code(code: i32) -> Self {
        match code {
            CODE_OK => ChunkStatus::Ok,
            CODE_STOP => ChunkStatus::Stop,
            other => ChunkStatus::Failed(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            ChunkStatus::Ok => CODE_OK,
            ChunkStatus::Stop => CODE_STOP,
            ChunkStatus::Failed(c) => c,
        }
    }
}
