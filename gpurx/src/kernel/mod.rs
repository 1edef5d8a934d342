//! Device kernels and their launch geometry.
//!
//! Both kernels run as a single logical block of cooperating threads; the
//! software device executes the per-thread work on the rayon pool with the
//! same strided assignment a hardware block would use.

pub mod gather;
pub mod receive;

pub use gather::{GatherOutput, exclusive_prefix_sum, packet_gather};
pub use receive::{ReceiveResult, packet_receive};

/// Packets each thread of the block is responsible for.
pub const PACKETS_PER_THREAD: usize = 4;
/// Threads per kernel block.
pub const THREADS_PER_BLOCK: usize = 512;
/// Upper bound on packets accepted by one receive invocation.
pub const PACKETS_PER_BLOCK: usize = PACKETS_PER_THREAD * THREADS_PER_BLOCK;

/// Largest packet the capture path accounts for.
pub const MAX_PKT_SIZE: usize = 4096;
/// Largest batch the convert stage sizes its default buffers against.
pub const MAX_PKT_RECEIVE: usize = PACKETS_PER_BLOCK;
