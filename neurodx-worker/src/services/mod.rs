//! Adapters to the worker's external systems
//!
//! Each adapter sits behind a small async trait so the orchestrator can be
//! driven by in-memory doubles in tests.

pub mod object_store;
pub mod queue;

pub use object_store::{ObjectStore, S3ObjectStore, StorageError};
pub use queue::{QueueError, RedisTaskQueue, TaskQueue};
