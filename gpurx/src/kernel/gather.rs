//! Gather kernel: drains a held semaphore slot into flat per-field output
//! arrays and one contiguous payload buffer.
//!
//! The only cross-thread dependency is the exclusive prefix sum over payload
//! sizes that assigns each packet its non-overlapping write offset; the scan
//! is deterministic and order-preserving, so packet index order always equals
//! input order.

use rayon::prelude::*;

use crate::dev::{DeviceBuffer, RawFrame};
use crate::error::Result;
use crate::rxq::RxQueueGpu;
use crate::sem::SemaphoreRing;
use crate::wire;

/// Flat per-field output arrays of one gather invocation.
///
/// All arrays are indexed by packet position; `data_offsets` has one extra
/// trailing entry holding the payload byte total.
pub struct GatherOutput {
    pub timestamps: DeviceBuffer<u64>,
    pub src_mac: DeviceBuffer<u64>,
    pub dst_mac: DeviceBuffer<u64>,
    pub src_ip: DeviceBuffer<u32>,
    pub dst_ip: DeviceBuffer<u32>,
    pub src_port: DeviceBuffer<u16>,
    pub dst_port: DeviceBuffer<u16>,
    pub data_offsets: DeviceBuffer<i32>,
    pub data_sizes: DeviceBuffer<i32>,
    pub tcp_flags: DeviceBuffer<i32>,
    pub ether_type: DeviceBuffer<i32>,
    pub next_proto_id: DeviceBuffer<i32>,
    pub data: DeviceBuffer<u8>,
}

impl GatherOutput {
    /// Allocate outputs for `packet_count` packets totalling
    /// `payload_size_total` payload bytes (both read back from the receive
    /// kernel's scalars).
    pub fn with_capacity(packet_count: usize, payload_size_total: usize) -> Self {
        Self {
            timestamps: DeviceBuffer::zeroed(packet_count),
            src_mac: DeviceBuffer::zeroed(packet_count),
            dst_mac: DeviceBuffer::zeroed(packet_count),
            src_ip: DeviceBuffer::zeroed(packet_count),
            dst_ip: DeviceBuffer::zeroed(packet_count),
            src_port: DeviceBuffer::zeroed(packet_count),
            dst_port: DeviceBuffer::zeroed(packet_count),
            data_offsets: DeviceBuffer::zeroed(packet_count + 1),
            data_sizes: DeviceBuffer::zeroed(packet_count),
            tcp_flags: DeviceBuffer::zeroed(packet_count),
            ether_type: DeviceBuffer::zeroed(packet_count),
            next_proto_id: DeviceBuffer::zeroed(packet_count),
            data: DeviceBuffer::zeroed(payload_size_total),
        }
    }

    /// Packets this output was sized for.
    #[inline]
    pub fn packet_count(&self) -> usize {
        self.timestamps.len()
    }
}

/// Exclusive prefix sum over per-packet payload sizes.
///
/// `offsets` must hold `sizes.len() + 1` entries; entry `i` receives the sum
/// of all sizes strictly before `i`, the final entry the total. Implausible
/// (negative) sizes contribute zero so they can never corrupt the offsets of
/// the packets behind them.
pub fn exclusive_prefix_sum(sizes: &[i32], offsets: &mut [i32]) {
    debug_assert_eq!(offsets.len(), sizes.len() + 1);
    let mut running = 0i32;
    for (i, &size) in sizes.iter().enumerate() {
        offsets[i] = running;
        running += size.max(0);
    }
    offsets[sizes.len()] = running;
}

/// Raw output base pointer shared across the block's payload-copy threads.
struct PayloadBase(*mut u8);

impl PayloadBase {
    #[inline]
    fn get(&self) -> *mut u8 {
        self.0
    }
}

// SAFETY: every thread writes only its packets' [offset, offset + size)
// range, and the exclusive prefix sum makes those ranges disjoint.
unsafe impl Send for PayloadBase {}
unsafe impl Sync for PayloadBase {}

/// One invocation of the gather kernel against a held slot.
///
/// Reads the slot's packet count and batch address (spinning on the status
/// check until the producer's hand-off is visible), extracts the fixed
/// fields of every packet, computes payload write offsets via the exclusive
/// prefix sum, copies payload bytes into the shared output buffer, and
/// finally returns the slot to the free state.
pub fn packet_gather(
    rxq: &RxQueueGpu,
    sem: &SemaphoreRing,
    sem_idx: u32,
    out: &mut GatherOutput,
) -> Result<()> {
    let (packet_count, addr) = sem.packet_info(sem_idx);
    let packet_count = (packet_count as usize).min(out.packet_count());

    // SAFETY: the slot is Hold and stays held until the release below, so
    // the cell cannot be rewritten underneath this read.
    let frames: &[RawFrame] = unsafe { rxq.batch(addr as u32) };
    let frames = &frames[..packet_count.min(frames.len())];

    let fields: Vec<wire::PacketFields> = frames
        .par_iter()
        .map(|frame| wire::parse(&frame.data))
        .collect();

    for (i, (frame, f)) in frames.iter().zip(&fields).enumerate() {
        out.timestamps.as_mut_slice()[i] = frame.timestamp;
        out.src_mac.as_mut_slice()[i] = f.src_mac;
        out.dst_mac.as_mut_slice()[i] = f.dst_mac;
        out.src_ip.as_mut_slice()[i] = f.src_ip;
        out.dst_ip.as_mut_slice()[i] = f.dst_ip;
        out.src_port.as_mut_slice()[i] = f.src_port;
        out.dst_port.as_mut_slice()[i] = f.dst_port;
        out.data_sizes.as_mut_slice()[i] = f.payload_size.max(0);
        out.tcp_flags.as_mut_slice()[i] = f.tcp_flags;
        out.ether_type.as_mut_slice()[i] = f.ether_type;
        out.next_proto_id.as_mut_slice()[i] = f.next_proto_id;
    }

    exclusive_prefix_sum(
        &out.data_sizes.as_slice()[..packet_count],
        &mut out.data_offsets.as_mut_slice()[..packet_count + 1],
    );

    let base = PayloadBase(out.data.as_mut_slice().as_mut_ptr());
    let offsets = out.data_offsets.as_slice();
    frames
        .par_iter()
        .zip(&fields)
        .enumerate()
        .for_each(|(i, (frame, f))| {
            let size = f.payload_size.max(0) as usize;
            if size == 0 {
                return;
            }
            let src = &frame.data[f.payload_offset..f.payload_offset + size];
            // SAFETY: [offset, offset + size) ranges are pairwise disjoint
            // by the exclusive prefix sum and lie within the output buffer,
            // which was allocated for the batch's payload total.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src.as_ptr(),
                    base.get().add(offsets[i] as usize),
                    size,
                );
            }
        });

    sem.release(sem_idx)?;
    Ok(())
}
