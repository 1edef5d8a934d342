//! NIC device handle: frame intake, receive timestamping and the hardware
//! flow table consulted on every ingress frame.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::RwLock;

use super::PciAddr;
use crate::flow::FlowTable;

/// One raw frame as delivered by the NIC into a receive queue.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Full Ethernet frame bytes.
    pub data: Bytes,
    /// Receive timestamp, monotonic nanoseconds since device start.
    pub timestamp: u64,
}

struct QueueBinding {
    tx: Sender<RawFrame>,
}

/// Ingress counters, all monotonically increasing.
#[derive(Debug, Default)]
pub struct NicCounters {
    /// Frames offered to the port.
    pub injected: AtomicU64,
    /// Frames steered into a receive queue.
    pub delivered: AtomicU64,
    /// Frames that matched no rule (miss forward is drop).
    pub missed: AtomicU64,
    /// Frames lost because the target queue's intake ring was full.
    pub overflowed: AtomicU64,
}

/// NIC device handle.
pub struct Nic {
    pci_addr: PciAddr,
    mac: [u8; 6],
    epoch: Instant,
    queues: RwLock<Vec<QueueBinding>>,
    flow: FlowTable,
    counters: NicCounters,
}

impl Nic {
    pub(crate) fn new(pci_addr: PciAddr) -> Self {
        // Locally administered address derived from the PCI identifier.
        let mac = [
            0x02,
            0x00,
            0x00,
            pci_addr.bus,
            pci_addr.device,
            pci_addr.function,
        ];
        Self {
            pci_addr,
            mac,
            epoch: Instant::now(),
            queues: RwLock::new(Vec::new()),
            flow: FlowTable::new(),
            counters: NicCounters::default(),
        }
    }

    /// PCI address this device was opened at.
    #[inline]
    pub fn pci_addr(&self) -> PciAddr {
        self.pci_addr
    }

    /// Port MAC address.
    #[inline]
    pub fn mac_addr(&self) -> [u8; 6] {
        self.mac
    }

    /// The port's flow table, programmed by flow pipes.
    #[inline]
    pub(crate) fn flow_table(&self) -> &FlowTable {
        &self.flow
    }

    /// Ingress counters.
    #[inline]
    pub fn counters(&self) -> &NicCounters {
        &self.counters
    }

    /// Number of receive queues currently bound to this port.
    pub fn queue_count(&self) -> u16 {
        self.queues.read().len() as u16
    }

    /// Bind a new receive queue with the given intake-ring capacity.
    ///
    /// Returns the flow queue id used as an RSS target plus the host side of
    /// the intake ring.
    pub(crate) fn bind_queue(&self, capacity: usize) -> (u16, Receiver<RawFrame>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        let mut queues = self.queues.write();
        let queue_id = queues.len() as u16;
        queues.push(QueueBinding { tx });
        (queue_id, rx)
    }

    /// Offer one Ethernet frame to the port.
    ///
    /// The frame runs the installed flow rules; a match steers it into the
    /// target queue's intake ring, a miss drops it. Returns `true` when the
    /// frame was delivered to a queue.
    pub fn inject(&self, frame: impl Into<Bytes>) -> bool {
        let data = frame.into();
        self.counters.injected.fetch_add(1, Ordering::Relaxed);

        let Some(queue_id) = self.flow.dispatch(&data) else {
            self.counters.missed.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        let timestamp = self.epoch.elapsed().as_nanos() as u64;
        let queues = self.queues.read();
        let Some(binding) = queues.get(queue_id as usize) else {
            self.counters.missed.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        match binding.tx.try_send(RawFrame { data, timestamp }) {
            Ok(()) => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.counters.overflowed.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_monotonic() {
        let nic = Nic::new("17:00.1".parse().unwrap());
        let a = nic.epoch.elapsed().as_nanos() as u64;
        let b = nic.epoch.elapsed().as_nanos() as u64;
        assert!(b >= a);
    }

    #[test]
    fn test_inject_without_rules_is_miss() {
        let nic = Nic::new("17:00.2".parse().unwrap());
        let (_queue_id, rx) = nic.bind_queue(16);
        assert!(!nic.inject(vec![0u8; 64]));
        assert_eq!(nic.counters().missed.load(Ordering::Relaxed), 1);
        assert!(rx.is_empty());
    }
}
