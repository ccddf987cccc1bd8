//! MD5 preimage search on top of the crackle executor.
//!
//! The task space is every suffix that completes a known prefix to `nchars`
//! characters over a [`Charset`]. Task `i` is the suffix whose symbol digits
//! spell `i` most significant first. The search kernel runs on the host
//! device runtime and stops the whole group at the first match.

mod app;
mod charset;
mod global;
mod kernel;
mod keyspace;

pub use app::{CrackParams, MatchRecord, Md5Crack};
pub use charset::Charset;
pub use global::{GlobalData, GLOBAL_DATA_LEN, PREFIX_CAPACITY};
pub use kernel::{
    digest_words, md5_single_block, register_kernels, search, Md5SearchKernel, KERNEL_NAME,
    KERNEL_SOURCE, LEN_DEFINE, MAX_SINGLE_BLOCK,
};
pub use keyspace::{num_tasks, possibilities, Keyspace, MAX_NCHARS};
