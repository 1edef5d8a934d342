//! GPU-direct packet capture and batching engine.
//!
//! Matched TCP/IPv4 traffic is steered by hardware flow rules into a receive
//! queue whose storage is visible to the GPU, parsed and gathered into flat
//! field arrays by a pair of device kernels coordinated through a fixed ring
//! of semaphore slots, then accumulated and windowed by a host-side convert
//! stage that emits one columnar record batch per flush window.
//!
//! The hot path never round-trips packet bytes through host memory: the only
//! host/device synchronization points are the size read-backs needed to
//! allocate downstream buffers.

pub mod batch;
pub mod config;
pub mod context;
pub mod convert;
pub mod dev;
pub mod error;
pub mod flow;
pub mod kernel;
pub mod rxq;
pub mod sem;
pub mod source;
pub mod table;
pub mod wire;

pub use config::{CaptureConfig, SchemaKind};
pub use context::DeviceContext;
pub use error::{Error, Result};
pub use source::{CaptureSource, StopHandle};

/// A boxed error type for gpurx operations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
