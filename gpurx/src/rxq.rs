//! Hardware-backed receive queue with GPU-visible and host-visible handles.
//!
//! The queue owns a communication buffer of batch cells, one per semaphore
//! slot. The receive kernel writes a cell through the GPU handle; the gather
//! kernel reads it back; the host handle only exposes the flow queue id used
//! as the RSS steering target. Cell access is serialized exclusively by the
//! semaphore FREE/HOLD protocol; the queue itself takes no locks on the
//! packet path.

use std::cell::UnsafeCell;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use nix::errno::Errno;

use crate::context::DeviceContext;
use crate::dev::RawFrame;
use crate::error::{Error, Result};

#[derive(Default)]
struct BatchCell {
    frames: Vec<RawFrame>,
}

/// Communication buffer shared between the receive and gather kernels.
///
/// One cell per semaphore slot; the slot's opaque address is the cell index.
struct CommBuffer {
    cells: Box<[UnsafeCell<BatchCell>]>,
}

// SAFETY: a cell is written only by the receive kernel while its semaphore
// slot is Free and read only by the gather kernel while the slot is Hold;
// the slot state transitions carry the fences that order those accesses.
unsafe impl Sync for CommBuffer {}

/// One hardware ingress queue bound 1:1 to a device context.
pub struct RxQueue {
    context: Arc<DeviceContext>,
    flow_queue_id: u16,
    intake: Receiver<RawFrame>,
    comm: CommBuffer,
}

impl std::fmt::Debug for RxQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RxQueue")
            .field("flow_queue_id", &self.flow_queue_id)
            .finish_non_exhaustive()
    }
}

impl RxQueue {
    /// Register a new queue with the NIC.
    ///
    /// `ring_size` is the semaphore ring capacity; the communication buffer
    /// allocates one batch cell per slot. Exceeding the context's maximum
    /// queue count fails with `ENOSPC`.
    pub fn new(context: &Arc<DeviceContext>, ring_size: u16) -> Result<Arc<Self>> {
        let nic = context.nic();
        if nic.queue_count() >= context.max_queue_count() {
            return Err(Error::device("eth_rxq_create", Errno::ENOSPC));
        }

        // Intake ring deep enough to absorb a full burst per cell in flight.
        let intake_depth = crate::kernel::PACKETS_PER_BLOCK * 4;
        let (flow_queue_id, intake) = nic.bind_queue(intake_depth);

        let cells = (0..ring_size)
            .map(|_| UnsafeCell::new(BatchCell::default()))
            .collect::<Vec<_>>();

        tracing::debug!(queue = flow_queue_id, ring = ring_size, "rx queue bound");
        Ok(Arc::new(Self {
            context: Arc::clone(context),
            flow_queue_id,
            intake,
            comm: CommBuffer {
                cells: cells.into_boxed_slice(),
            },
        }))
    }

    /// Device context this queue belongs to.
    #[inline]
    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.context
    }

    /// GPU-resident descriptor, used by the kernels.
    pub fn gpu_handle(self: &Arc<Self>) -> RxQueueGpu {
        RxQueueGpu {
            inner: Arc::clone(self),
        }
    }

    /// Host-resident descriptor.
    pub fn cpu_handle(self: &Arc<Self>) -> RxQueueCpu {
        RxQueueCpu {
            inner: Arc::clone(self),
        }
    }
}

/// Host-visible queue descriptor.
#[derive(Clone)]
pub struct RxQueueCpu {
    inner: Arc<RxQueue>,
}

impl RxQueueCpu {
    /// Flow queue id registered with the NIC, used as the RSS target.
    #[inline]
    pub fn flow_queue_id(&self) -> u16 {
        self.inner.flow_queue_id
    }
}

/// GPU-visible queue descriptor.
#[derive(Clone)]
pub struct RxQueueGpu {
    inner: Arc<RxQueue>,
}

impl RxQueueGpu {
    /// Number of batch cells in the communication buffer.
    #[inline]
    pub fn cell_count(&self) -> u32 {
        self.inner.comm.cells.len() as u32
    }

    /// Block-wide receive: drain up to `max_packets` arrived frames into the
    /// batch cell at `cell`, waiting at most `timeout` for the first frame.
    ///
    /// Returns the number of packets received; zero is a normal empty poll.
    ///
    /// # Safety
    ///
    /// The caller must hold the cell exclusively: its semaphore slot must be
    /// observed `Free` and must not transition to `Hold` until this call
    /// returns.
    pub unsafe fn receive_block(&self, cell: u32, max_packets: usize, timeout: Duration) -> usize {
        // SAFETY: exclusivity of the cell is the caller's contract.
        let batch = unsafe { &mut *self.inner.comm.cells[cell as usize].get() };
        batch.frames.clear();

        match self.inner.intake.recv_timeout(timeout) {
            Ok(frame) => batch.frames.push(frame),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                return 0;
            }
        }
        while batch.frames.len() < max_packets {
            match self.inner.intake.try_recv() {
                Ok(frame) => batch.frames.push(frame),
                Err(_) => break,
            }
        }
        batch.frames.len()
    }

    /// Read back the frames of a published batch cell.
    ///
    /// # Safety
    ///
    /// The caller must have observed the cell's semaphore slot in `Hold`
    /// state and must not release it until the returned slice is dropped.
    pub unsafe fn batch(&self, cell: u32) -> &[RawFrame] {
        // SAFETY: the Hold state plus its acquire fence order this read
        // after the producer's writes; the caller keeps the slot held.
        let batch = unsafe { &*self.inner.comm.cells[cell as usize].get() };
        &batch.frames
    }
}
