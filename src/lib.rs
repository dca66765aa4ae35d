//! codelet-rt: a heterogeneous task runtime
//!
//! Applications register buffers as [`DataHandle`]s, describe computations as
//! [`Codelet`]s with one implementation per architecture, and submit tasks
//! that name the buffers they touch. The runtime infers dependencies from
//! the access modes, moves replicas between memory nodes, and places each
//! job on a worker chosen by the scheduling policy of its context.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use codelet_rt::{Codelet, Runtime, RuntimeConfig, TaskBuilder};
//!
//! let rt = Runtime::new(RuntimeConfig::default()).unwrap();
//! let inc = Arc::new(Codelet::new("inc").cpu(|bufs, _| {
//!     let v = bufs.get_mut(0);
//!     let x: u64 = v.get(0);
//!     v.set(0, x + 1);
//!     Ok(())
//! }));
//! let counter = rt.register_variable(0u64).unwrap();
//! for _ in 0..10 {
//!     rt.submit(TaskBuilder::new(&inc).read_write(&counter)).unwrap();
//! }
//! assert_eq!(rt.unregister_vector::<u64>(&counter).unwrap(), vec![10]);
//! ```

#![doc(html_root_url = "https://docs.rs/codelet-rt")]
#![warn(rust_2018_idioms)]

pub mod runtime;
pub mod util;

pub use runtime::{
    AccessMode, Acquired, Buffers, Codelet, DataError, DataHandle, Filter, JobHandle, JobOutcome, KernelError,
    KernelResult, Layout, NodeId, Result, Runtime, RuntimeError, SchedCtxId, TaskBuilder, WorkerArch, WorkerId,
    HOST_NODE, ROOT_CONTEXT,
};
pub use util::config::{PolicyKind, RuntimeConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Runtime name
pub const NAME: &str = "codelet-rt";
