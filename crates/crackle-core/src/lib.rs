//! Distributed brute-force executor.
//!
//! Rank 0 of a [`Communicator`](crackle_comm::Communicator) group gathers
//! every rank's device capacity, splits the task space into proportional
//! ranges with [`decompose`] and scatters them. Every rank then walks its
//! range in rounds ([`RoundLoop`]): one chunk per local device, joined on a
//! [`CompletionLatch`]. Workers ship each round's results to rank 0, where a
//! listener thread feeds them to the application and broadcasts a stop once
//! any participant asks for one.

mod app;
mod coordinator;
mod decompose;
mod error;
mod executor;
mod latch;
mod progress;
mod round;
mod sink;
mod state;

pub use app::{Application, ChunkOutput, RunContext};
pub use coordinator::{Listener, ListenerReport};
pub use decompose::{decompose, Decomposition, TaskRange};
pub use error::{
    ChunkStatus, ExecError, Flow, RunOutcome, CODE_BAD_STATE, CODE_DEVICE, CODE_INVALID_PARAMETER,
    CODE_INVALID_VALUE, CODE_MESSAGING, CODE_MISSING_CALLBACK, CODE_OK, CODE_OUT_OF_MEMORY,
    CODE_STOP, CODE_SYSTEM,
};
pub use executor::Executor;
pub use latch::CompletionLatch;
pub use progress::{ProgressReport, ProgressTracker, PROGRESS_HYSTERESIS};
pub use round::RoundLoop;
pub use sink::{DirectSink, RemoteSink, ResultSink, StopSignal};
pub use state::RunState;
