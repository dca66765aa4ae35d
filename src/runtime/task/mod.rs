//! Task and job lifecycle
//!
//! `Created → Submitted → Blocked → Ready → Scheduled → Executing → Completed`,
//! with `Aborted` reserved for runtime shutdown. Codelet failures are not a
//! state: they reach the application through the job outcome.

pub mod builder;
pub mod codelet;
pub mod deps;
pub mod job;

pub use builder::TaskBuilder;
pub use codelet::{BufferView, Buffers, CanExecuteFn, Codelet, Implementation, KernelFn, KernelResult};
pub use deps::SeqState;
pub use job::{BufferAccess, Callback, Job, JobHandle, JobId, JobOutcome, JobState, Prediction};

#[cfg(test)]
mod tests;
