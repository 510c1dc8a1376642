//! Sandboxed execution: worker protocol, process isolation, and
//! reclamation.

pub mod executor;
pub mod protocol;

pub use executor::{SandboxExecutor, WorkerRegistry};
pub use protocol::{run_worker_stdio, WorkerJob, WorkerLine};
