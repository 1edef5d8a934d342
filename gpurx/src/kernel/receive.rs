//! Receive kernel: polls the hardware queue for one batch of packets,
//! computes its aggregate payload size and publishes the batch descriptor
//! into a semaphore slot.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

use rayon::prelude::*;

use crate::dev::Stream;
use crate::error::Result;
use crate::rxq::RxQueueGpu;
use crate::sem::SemaphoreRing;
use crate::wire;

use super::{PACKETS_PER_BLOCK, PACKETS_PER_THREAD};

/// Host-visible scalars written back by one receive invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReceiveResult {
    /// Packets captured into the slot; zero for an empty poll.
    pub packet_count: i32,
    /// Sum of the batch's per-packet payload sizes, for allocation sizing.
    pub payload_size_total: i32,
}

/// One invocation of the receive kernel against `sem_idx`.
///
/// Waits until the target slot is free (abandoning the poll if `stop` is
/// raised first), performs a block-wide receive bounded by
/// [`PACKETS_PER_BLOCK`] and `rx_timeout`, accumulates the total payload
/// byte count across the block, and publishes `(count, address)` with the
/// slot's FREE→HOLD transition. A zero-packet poll returns without touching
/// the slot or any counter.
pub fn packet_receive(
    rxq: &RxQueueGpu,
    sem: &SemaphoreRing,
    sem_idx: u32,
    rx_timeout: Duration,
    stop: &AtomicBool,
    stream: &Stream,
) -> Result<ReceiveResult> {
    if !sem.wait_free(sem_idx, stop) {
        return Ok(ReceiveResult::default());
    }

    // SAFETY: the slot was observed Free and stays so until the publish
    // below; this invocation is the cell's only writer.
    let count = unsafe { rxq.receive_block(sem_idx, PACKETS_PER_BLOCK, rx_timeout) };
    if count == 0 {
        return Ok(ReceiveResult::default());
    }

    // SAFETY: same exclusivity as above; the slot is still ours.
    let frames = unsafe { rxq.batch(sem_idx) };

    let total = AtomicI32::new(0);
    frames.par_chunks(PACKETS_PER_THREAD).for_each(|chunk| {
        let mut thread_total = 0i32;
        for frame in chunk {
            thread_total += wire::parse(&frame.data).payload_size.max(0);
        }
        total.fetch_add(thread_total, Ordering::Relaxed);
    });

    sem.publish(sem_idx, count as u32, u64::from(sem_idx))?;
    stream.synchronize()?;

    Ok(ReceiveResult {
        packet_count: count as i32,
        payload_size_total: total.load(Ordering::Relaxed),
    })
}
