//! Job orchestration for the darkroom service.
//!
//! The engine owns the invariant that defines the system: at most one job
//! on the accelerator, but many in flight conceptually. Producers submit
//! from any task or thread; a single dedicated OS thread executes jobs
//! strictly serially against the loaded worker.

pub mod blob;
pub mod dream;
pub mod fileref;
pub mod pool;
pub mod queue;
pub mod worker;

pub use blob::BlobStore;
pub use dream::{DreamController, DreamStartParams};
pub use fileref::FileRefStore;
pub use pool::{JobTicket, PoolOptions, WorkerPool};
pub use worker::{ProgressUpdate, RunOutput, Worker, WorkerError, WorkerFactory};
