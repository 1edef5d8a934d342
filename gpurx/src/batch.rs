//! Packet-data buffers: the intermediate form between a raw-queue drain and
//! the combined batch a flush window emits.

use crate::config::SchemaKind;
use crate::dev::{DeviceBuffer, Stream};
use crate::error::Result;
use crate::kernel::GatherOutput;

/// Fixed-width per-packet record stored in the header region of a
/// full-schema packet-data buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketHeader {
    pub timestamp: u64,
    pub src_mac: u64,
    pub dst_mac: u64,
    pub src_ip: u32,
    pub dst_ip: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub packet_size: i32,
    pub tcp_flags: i32,
    pub ether_type: i32,
    pub next_proto_id: i32,
}

impl PacketHeader {
    /// Encoded record width in bytes.
    pub const ENCODED_LEN: usize = 52;

    /// Serialize into exactly [`Self::ENCODED_LEN`] bytes.
    pub fn write_to(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.timestamp.to_le_bytes());
        out[8..16].copy_from_slice(&self.src_mac.to_le_bytes());
        out[16..24].copy_from_slice(&self.dst_mac.to_le_bytes());
        out[24..28].copy_from_slice(&self.src_ip.to_le_bytes());
        out[28..32].copy_from_slice(&self.dst_ip.to_le_bytes());
        out[32..34].copy_from_slice(&self.src_port.to_le_bytes());
        out[34..36].copy_from_slice(&self.dst_port.to_le_bytes());
        out[36..40].copy_from_slice(&self.packet_size.to_le_bytes());
        out[40..44].copy_from_slice(&self.tcp_flags.to_le_bytes());
        out[44..48].copy_from_slice(&self.ether_type.to_le_bytes());
        out[48..52].copy_from_slice(&self.next_proto_id.to_le_bytes());
    }

    /// Deserialize from exactly [`Self::ENCODED_LEN`] bytes.
    pub fn read_from(bytes: &[u8]) -> Self {
        let u64_at = |o: usize| u64::from_le_bytes(bytes[o..o + 8].try_into().unwrap());
        let u32_at = |o: usize| u32::from_le_bytes(bytes[o..o + 4].try_into().unwrap());
        let u16_at = |o: usize| u16::from_le_bytes(bytes[o..o + 2].try_into().unwrap());
        let i32_at = |o: usize| i32::from_le_bytes(bytes[o..o + 4].try_into().unwrap());
        Self {
            timestamp: u64_at(0),
            src_mac: u64_at(8),
            dst_mac: u64_at(16),
            src_ip: u32_at(24),
            dst_ip: u32_at(28),
            src_port: u16_at(32),
            dst_port: u16_at(34),
            packet_size: i32_at(36),
            tcp_flags: i32_at(40),
            ether_type: i32_at(44),
            next_proto_id: i32_at(48),
        }
    }
}

/// Intermediate allocation bundle for one drained batch (or a merge of
/// several): header region, payload bytes and the per-packet payload-size
/// array, plus the stream the copies were issued on.
pub struct PacketDataBuffer {
    pub num_packets: usize,
    pub schema: SchemaKind,
    pub header: DeviceBuffer<u8>,
    pub payload: DeviceBuffer<u8>,
    pub payload_sizes: DeviceBuffer<u32>,
    pub stream: Stream,
}

impl PacketDataBuffer {
    /// Total header-region bytes.
    #[inline]
    pub fn header_bytes(&self) -> usize {
        self.header.len()
    }

    /// Total payload bytes.
    #[inline]
    pub fn payload_bytes(&self) -> usize {
        self.payload.len()
    }

    /// Total payload-size-array bytes.
    #[inline]
    pub fn payload_sizes_bytes(&self) -> usize {
        self.payload_sizes.size_bytes()
    }

    /// Pack a gather result into a packet-data buffer.
    ///
    /// The payload is copied first (it carries the early sizing sync
    /// point), then the header region, then the raw payload-size list.
    pub fn from_gather(out: &GatherOutput, schema: SchemaKind, stream: &Stream) -> Result<Self> {
        let num_packets = out.packet_count();

        let payload = DeviceBuffer::from_slice(out.data.as_slice());
        stream.synchronize()?;

        let mut header =
            DeviceBuffer::<u8>::zeroed(num_packets * schema.header_record_bytes());
        match schema {
            SchemaKind::Full => {
                for i in 0..num_packets {
                    let record = PacketHeader {
                        timestamp: out.timestamps.as_slice()[i],
                        src_mac: out.src_mac.as_slice()[i],
                        dst_mac: out.dst_mac.as_slice()[i],
                        src_ip: out.src_ip.as_slice()[i],
                        dst_ip: out.dst_ip.as_slice()[i],
                        src_port: out.src_port.as_slice()[i],
                        dst_port: out.dst_port.as_slice()[i],
                        packet_size: out.data_sizes.as_slice()[i],
                        tcp_flags: out.tcp_flags.as_slice()[i],
                        ether_type: out.ether_type.as_slice()[i],
                        next_proto_id: out.next_proto_id.as_slice()[i],
                    };
                    let offset = i * PacketHeader::ENCODED_LEN;
                    record.write_to(
                        &mut header.as_mut_slice()[offset..offset + PacketHeader::ENCODED_LEN],
                    );
                }
            }
            SchemaKind::SrcIp => {
                for (i, &ip) in out.src_ip.as_slice().iter().enumerate() {
                    header.copy_from_slice_at(i * 4, &ip.to_le_bytes());
                }
            }
        }

        let sizes: Vec<u32> = out
            .data_sizes
            .as_slice()
            .iter()
            .map(|&s| s.max(0) as u32)
            .collect();
        let payload_sizes = DeviceBuffer::from_slice(&sizes);

        Ok(Self {
            num_packets,
            schema,
            header,
            payload,
            payload_sizes,
            stream: stream.clone(),
        })
    }
}

/// Pick an allocation size for an incoming batch against the configured
/// default; the only user-visible effect of an oversized batch is a warning.
pub fn alloc_size(default_size: usize, incoming_size: usize, buffer_name: &str) -> usize {
    if incoming_size > default_size {
        tracing::warn!(
            buffer = buffer_name,
            incoming = incoming_size,
            default = default_size,
            "batch requires a larger {buffer_name} buffer than the default allocation"
        );
        incoming_size
    } else {
        default_size
    }
}

/// Allocation-size hints for combined batches, from the capture config.
#[derive(Debug, Clone, Copy)]
pub struct BufferHints {
    pub header_bytes: usize,
    pub payload_bytes: usize,
    pub sizes_bytes: usize,
}

/// Concatenate packet-data buffers collected within one flush window into a
/// single combined batch.
///
/// All constituent streams are synchronized before their bytes are merged;
/// the combined totals are the exact sums of the constituents'. A single
/// buffer is moved through untouched.
pub fn concat_packet_buffers(
    mut buffers: Vec<PacketDataBuffer>,
    hints: &BufferHints,
) -> Result<PacketDataBuffer> {
    debug_assert!(!buffers.is_empty());
    if buffers.len() == 1 {
        let buffer = buffers.pop().expect("length checked");
        buffer.stream.synchronize()?;
        return Ok(buffer);
    }

    let ttl_packets: usize = buffers.iter().map(|b| b.num_packets).sum();
    let ttl_header_bytes: usize = buffers.iter().map(|b| b.header_bytes()).sum();
    let ttl_payload_bytes: usize = buffers.iter().map(|b| b.payload_bytes()).sum();
    let ttl_sizes: usize = buffers.iter().map(|b| b.payload_sizes.len()).sum();

    let header_cap = alloc_size(hints.header_bytes, ttl_header_bytes, "header");
    let payload_cap = alloc_size(hints.payload_bytes, ttl_payload_bytes, "payload");
    let sizes_cap = alloc_size(
        hints.sizes_bytes,
        ttl_sizes * std::mem::size_of::<u32>(),
        "sizes",
    ) / std::mem::size_of::<u32>();

    let schema = buffers[0].schema;
    let stream = buffers[0].stream.clone();

    let mut header = DeviceBuffer::<u8>::zeroed_with_capacity(ttl_header_bytes, header_cap);
    let mut payload = DeviceBuffer::<u8>::zeroed_with_capacity(ttl_payload_bytes, payload_cap);
    let mut payload_sizes = DeviceBuffer::<u32>::zeroed_with_capacity(ttl_sizes, sizes_cap);

    let mut header_offset = 0;
    let mut payload_offset = 0;
    let mut sizes_offset = 0;
    for buffer in &buffers {
        buffer.stream.synchronize()?;
        header.copy_from_slice_at(header_offset, buffer.header.as_slice());
        payload.copy_from_slice_at(payload_offset, buffer.payload.as_slice());
        payload_sizes.copy_from_slice_at(sizes_offset, buffer.payload_sizes.as_slice());
        header_offset += buffer.header_bytes();
        payload_offset += buffer.payload_bytes();
        sizes_offset += buffer.payload_sizes.len();
    }

    stream.synchronize()?;
    Ok(PacketDataBuffer {
        num_packets: ttl_packets,
        schema,
        header,
        payload,
        payload_sizes,
        stream,
    })
}
