//! Client-side upload orchestration.
//!
//! An [`UploadOrchestrator`] drives one file through the upload pipeline:
//!
//! 1. **Hash** the source file to get its content address
//! 2. **Fast upload** if the backend already holds the merged artifact
//! 3. **Resume** by probing which chunks are already stored
//! 4. **Upload** the remaining chunks through a bounded [`UploadPool`]
//! 5. **Merge** once every chunk is confirmed
//!
//! The backend is reached through the [`UploadBackend`] trait;
//! [`LocalBackend`] adapts an in-process
//! [`UploadService`](chunkflow_chunk_store::UploadService).

pub mod backend;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod pool;
pub mod retry;

pub use backend::{BackendFuture, LocalBackend, UploadBackend};
pub use config::{DEFAULT_CONCURRENCY, UploadConfig};
pub use error::UploadError;
pub use orchestrator::UploadOrchestrator;
pub use pool::{ChunkWorker, CompletionHandler, UploadPool, WorkerFuture};
pub use retry::RetryPolicy;
