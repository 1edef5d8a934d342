//! Fixed-size ring of semaphore slots coordinating the receive and gather
//! kernels.
//!
//! Each slot tags one packet batch with a state (`Free` / `Hold`), a packet
//! count and the batch's address inside the receive queue's communication
//! buffer. The ring is the sole hand-off mechanism between the two kernels:
//! no locks, only the state word plus a memory fence on each transition.
//!
//! Transition discipline (single writer per transition):
//! - `Free -> Hold`: receive kernel only, via [`SemaphoreRing::publish`].
//! - `Hold -> Free`: gather kernel only, via [`SemaphoreRing::release`],
//!   after the slot's packets are fully drained.
//!
//! A slot index is reused only after returning to `Free`; the producer spins
//! in [`SemaphoreRing::wait_free`] instead of advancing past a held slot, so
//! the kernels never touch overlapping packet storage.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering, fence};

use crate::error::{Error, Result};

const SLOT_FREE: u32 = 0;
const SLOT_HOLD: u32 = 1;

/// State of one semaphore slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Slot is available to the receive kernel.
    Free,
    /// Slot carries a published batch awaiting the gather kernel.
    Hold,
}

struct Slot {
    state: AtomicU32,
    packet_count: AtomicU32,
    /// Opaque batch address inside the queue's communication buffer.
    addr: AtomicU64,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: AtomicU32::new(SLOT_FREE),
            packet_count: AtomicU32::new(0),
            addr: AtomicU64::new(0),
        }
    }
}

/// Fixed-size array of synchronization slots shared by both kernels.
///
/// The same ring value is handed to the receive kernel (producer side) and
/// the gather kernel (consumer side); cloning the surrounding `Arc` is the
/// GPU-visible handle.
pub struct SemaphoreRing {
    slots: Box<[Slot]>,
}

impl SemaphoreRing {
    /// Create a ring with `size` slots, all `Free`.
    pub fn new(size: u16) -> Self {
        let slots = (0..size).map(|_| Slot::new()).collect::<Vec<_>>();
        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    /// Fixed capacity of the ring.
    #[inline]
    pub fn size(&self) -> u16 {
        self.slots.len() as u16
    }

    /// Current state of a slot.
    #[inline]
    pub fn state(&self, idx: u32) -> SlotState {
        match self.slots[idx as usize].state.load(Ordering::Acquire) {
            SLOT_FREE => SlotState::Free,
            _ => SlotState::Hold,
        }
    }

    /// Producer-side bounded spin until the slot is `Free`.
    ///
    /// Returns `false` if `stop` was raised before the slot freed up; the
    /// caller abandons the poll without touching the slot.
    pub fn wait_free(&self, idx: u32, stop: &AtomicBool) -> bool {
        let mut spins = 0u32;
        loop {
            if self.state(idx) == SlotState::Free {
                return true;
            }
            if stop.load(Ordering::Relaxed) {
                return false;
            }
            spins += 1;
            if spins < 64 {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// Publish a batch into the slot: `Free -> Hold`.
    ///
    /// Count and address are written before the state transition becomes
    /// visible to the consumer side. A slot that is not `Free` is a protocol
    /// violation and is reported, never silently overwritten.
    pub fn publish(&self, idx: u32, packet_count: u32, addr: u64) -> Result<()> {
        let slot = &self.slots[idx as usize];
        slot.packet_count.store(packet_count, Ordering::Relaxed);
        slot.addr.store(addr, Ordering::Relaxed);
        fence(Ordering::Release);
        slot.state
            .compare_exchange(SLOT_FREE, SLOT_HOLD, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::Semaphore { slot: idx })?;
        Ok(())
    }

    /// Read the published batch descriptor of a `Hold` slot.
    ///
    /// Bridges the benign race between the state write and the caller's
    /// observation by spinning on the status check.
    pub fn packet_info(&self, idx: u32) -> (u32, u64) {
        let slot = &self.slots[idx as usize];
        while slot.state.load(Ordering::Acquire) != SLOT_HOLD {
            std::hint::spin_loop();
        }
        fence(Ordering::Acquire);
        (
            slot.packet_count.load(Ordering::Relaxed),
            slot.addr.load(Ordering::Relaxed),
        )
    }

    /// Return a drained slot to the producer: `Hold -> Free`.
    pub fn release(&self, idx: u32) -> Result<()> {
        let slot = &self.slots[idx as usize];
        fence(Ordering::Release);
        slot.state
            .compare_exchange(SLOT_HOLD, SLOT_FREE, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::Semaphore { slot: idx })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_publish_release_cycle() {
        let ring = SemaphoreRing::new(4);
        assert_eq!(ring.size(), 4);
        assert_eq!(ring.state(0), SlotState::Free);

        ring.publish(0, 17, 0).unwrap();
        assert_eq!(ring.state(0), SlotState::Hold);
        assert_eq!(ring.packet_info(0), (17, 0));

        ring.release(0).unwrap();
        assert_eq!(ring.state(0), SlotState::Free);
    }

    #[test]
    fn test_double_publish_rejected() {
        let ring = SemaphoreRing::new(2);
        ring.publish(1, 1, 1).unwrap();
        // Slot still held: a second publish must fail, not overwrite.
        assert!(ring.publish(1, 2, 1).is_err());
        ring.release(1).unwrap();
        assert!(ring.release(1).is_err());
        ring.publish(1, 2, 1).unwrap();
    }

    #[test]
    fn test_wait_free_observes_stop() {
        let ring = SemaphoreRing::new(1);
        ring.publish(0, 1, 0).unwrap();
        let stop = AtomicBool::new(true);
        assert!(!ring.wait_free(0, &stop));
        // The held slot was not disturbed by the abandoned wait.
        assert_eq!(ring.state(0), SlotState::Hold);
    }

    /// Producer and consumer threads cycle the ring far past its capacity;
    /// the protocol must guarantee no slot is read before `Hold` and no slot
    /// is re-published before the prior `Hold` was cleared.
    #[test]
    fn test_round_robin_reuse_across_threads() {
        const RING: u16 = 4;
        const BATCHES: u32 = 256;

        let ring = Arc::new(SemaphoreRing::new(RING));
        let stop = Arc::new(AtomicBool::new(false));

        let producer = {
            let ring = Arc::clone(&ring);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                for batch in 0..BATCHES {
                    let idx = batch % RING as u32;
                    assert!(ring.wait_free(idx, &stop));
                    ring.publish(idx, batch + 1, u64::from(batch)).unwrap();
                }
            })
        };

        let consumer = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || {
                for batch in 0..BATCHES {
                    let idx = batch % RING as u32;
                    let (count, addr) = ring.packet_info(idx);
                    assert_eq!(count, batch + 1);
                    assert_eq!(addr, u64::from(batch));
                    ring.release(idx).unwrap();
                }
            })
        };

        producer.join().unwrap();
        consumer.join().unwrap();
        for idx in 0..u32::from(RING) {
            assert_eq!(ring.state(idx), SlotState::Free);
        }
    }
}
