//! Embedder workers, the worker pool and the embedding queue.
//!
//! Workers are isolated OS processes; the pool dispatches to them
//! round-robin and restarts them when they age out, bloat or die. The
//! embedding queue batches chunks by token estimate, applies backpressure to
//! producers and recovers batches lost to worker restarts.

mod error;
mod pool;
mod queue;
mod worker;

pub use error::EmbedError;
pub use pool::{Embedder, EmbedderPool, PoolConfig, default_pool_size};
pub use queue::{
  BatchSink, EmbeddedChunk, EmbeddingQueue, FileHandle, FileOutcome, QueueConfig, QueueSnapshot, QueuedChunk,
};
pub use worker::{WorkerConfig, WorkerEvent, WorkerHandle};
