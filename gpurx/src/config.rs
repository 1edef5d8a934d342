//! Capture source configuration.

use std::time::Duration;

use crate::batch::PacketHeader;
use crate::kernel::{MAX_PKT_RECEIVE, MAX_PKT_SIZE};

/// Which column set a capture emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchemaKind {
    /// Full per-packet schema: timestamp, addresses, ports, sizes, flags and
    /// payload.
    #[default]
    Full,
    /// Reduced two-column variant: source IP and payload only.
    SrcIp,
}

impl SchemaKind {
    /// Bytes one packet occupies in a packet-data buffer's header region.
    pub fn header_record_bytes(self) -> usize {
        match self {
            SchemaKind::Full => PacketHeader::ENCODED_LEN,
            SchemaKind::SrcIp => std::mem::size_of::<u32>(),
        }
    }
}

/// Construction-time configuration for a capture source.
///
/// # Example
/// ```no_run
/// use gpurx::CaptureConfig;
/// use std::time::Duration;
///
/// let config = CaptureConfig::new("17:00.1", "ca:00.0")
///     .source_ip_filter("192.168.1.10")
///     .semaphore_count(512)
///     .max_time_delta(Duration::from_millis(50));
/// ```
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// NIC hardware address (PCI bus identifier string).
    pub nic_pci_addr: String,
    /// GPU hardware address (PCI bus identifier string).
    pub gpu_pci_addr: String,
    /// Dotted-quad source filter; empty matches all sources.
    pub source_ip_filter: String,
    /// Semaphore ring capacity.
    pub semaphore_count: u16,
    /// Wall-clock window bounding each combined batch.
    pub max_time_delta: Duration,
    /// Convert channel capacity (buffers in flight before backpressure).
    pub channel_capacity: usize,
    /// Bound on one receive kernel poll.
    pub rx_timeout: Duration,
    /// Column set emitted downstream.
    pub schema: SchemaKind,
    /// Default header-region allocation for a combined batch, bytes.
    pub header_buffer_size: usize,
    /// Default payload allocation for a combined batch, bytes.
    pub payload_buffer_size: usize,
    /// Default payload-size-array allocation for a combined batch, bytes.
    pub sizes_buffer_size: usize,
}

impl CaptureConfig {
    /// Configuration with defaults for everything but the device addresses.
    pub fn new(nic_pci_addr: impl Into<String>, gpu_pci_addr: impl Into<String>) -> Self {
        Self {
            nic_pci_addr: nic_pci_addr.into(),
            gpu_pci_addr: gpu_pci_addr.into(),
            source_ip_filter: String::new(),
            semaphore_count: 1024,
            max_time_delta: Duration::from_millis(500),
            channel_capacity: 128,
            rx_timeout: Duration::from_millis(10),
            schema: SchemaKind::Full,
            header_buffer_size: MAX_PKT_RECEIVE * PacketHeader::ENCODED_LEN,
            payload_buffer_size: MAX_PKT_RECEIVE * MAX_PKT_SIZE,
            sizes_buffer_size: MAX_PKT_RECEIVE * std::mem::size_of::<u32>(),
        }
    }

    /// Set the dotted-quad source-IP filter; empty means match all.
    pub fn source_ip_filter(mut self, filter: impl Into<String>) -> Self {
        self.source_ip_filter = filter.into();
        self
    }

    /// Set the semaphore ring size.
    pub fn semaphore_count(mut self, count: u16) -> Self {
        self.semaphore_count = count;
        self
    }

    /// Set the maximum time delta for batch-window flushing.
    pub fn max_time_delta(mut self, delta: Duration) -> Self {
        self.max_time_delta = delta;
        self
    }

    /// Set the convert channel capacity.
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Set the receive kernel poll timeout.
    pub fn rx_timeout(mut self, timeout: Duration) -> Self {
        self.rx_timeout = timeout;
        self
    }

    /// Select the emitted column set.
    pub fn schema(mut self, schema: SchemaKind) -> Self {
        self.schema = schema;
        self
    }

    /// Override the default header-region allocation size.
    pub fn header_buffer_size(mut self, bytes: usize) -> Self {
        self.header_buffer_size = bytes;
        self
    }

    /// Override the default payload allocation size.
    pub fn payload_buffer_size(mut self, bytes: usize) -> Self {
        self.payload_buffer_size = bytes;
        self
    }

    /// Override the default payload-size-array allocation size.
    pub fn sizes_buffer_size(mut self, bytes: usize) -> Self {
        self.sizes_buffer_size = bytes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CaptureConfig::new("17:00.1", "ca:00.0");
        assert_eq!(config.semaphore_count, 1024);
        assert_eq!(config.schema, SchemaKind::Full);
        assert!(config.source_ip_filter.is_empty());
        assert_eq!(config.payload_buffer_size, MAX_PKT_RECEIVE * MAX_PKT_SIZE);
    }

    #[test]
    fn test_builder_chain() {
        let config = CaptureConfig::new("17:00.1", "ca:00.0")
            .source_ip_filter("10.1.2.3")
            .semaphore_count(64)
            .schema(SchemaKind::SrcIp)
            .channel_capacity(8)
            .max_time_delta(Duration::from_millis(50));
        assert_eq!(config.semaphore_count, 64);
        assert_eq!(config.schema, SchemaKind::SrcIp);
        assert_eq!(config.max_time_delta, Duration::from_millis(50));
    }

    #[test]
    fn test_header_record_bytes() {
        assert_eq!(SchemaKind::Full.header_record_bytes(), 52);
        assert_eq!(SchemaKind::SrcIp.header_record_bytes(), 4);
    }
}
