//! Columnar record-set emission.
//!
//! One combined batch becomes one arrow `RecordBatch`, one row per captured
//! packet. The payload column is built from the exclusive-prefix-sum offset
//! buffer plus the contiguous payload bytes, so no per-row copies happen on
//! the way out.

use std::sync::Arc;

use arrow::array::{ArrayRef, BinaryArray, Int32Array, StringArray, UInt16Array, UInt64Array};
use arrow::buffer::{Buffer, OffsetBuffer, ScalarBuffer};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;

use crate::batch::{PacketDataBuffer, PacketHeader};
use crate::config::SchemaKind;
use crate::error::Result;
use crate::wire;

/// Schema of the full per-packet column set.
pub fn full_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("timestamp", DataType::UInt64, false),
        Field::new("src_mac", DataType::Utf8, false),
        Field::new("dst_mac", DataType::Utf8, false),
        Field::new("src_ip", DataType::Utf8, false),
        Field::new("dst_ip", DataType::Utf8, false),
        Field::new("src_port", DataType::UInt16, false),
        Field::new("dst_port", DataType::UInt16, false),
        Field::new("packet_size", DataType::Int32, false),
        Field::new("tcp_flags", DataType::Int32, false),
        Field::new("ether_type", DataType::Int32, false),
        Field::new("next_proto_id", DataType::Int32, false),
        Field::new("data", DataType::Binary, false),
    ]))
}

/// Schema of the reduced two-column variant.
pub fn src_ip_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("src_ip", DataType::Utf8, false),
        Field::new("data", DataType::Binary, false),
    ]))
}

/// Exclusive prefix sum over payload sizes, as a length-prefixed offset
/// vector suitable for a variable-width arrow column.
pub fn sizes_to_offsets(sizes: &[u32]) -> Vec<i32> {
    let mut offsets = Vec::with_capacity(sizes.len() + 1);
    let mut running = 0i32;
    offsets.push(0);
    for &size in sizes {
        running += size as i32;
        offsets.push(running);
    }
    offsets
}

fn payload_column(buffer: &PacketDataBuffer) -> Result<BinaryArray> {
    let offsets = OffsetBuffer::new(ScalarBuffer::from(sizes_to_offsets(
        buffer.payload_sizes.as_slice(),
    )));
    let values = Buffer::from_vec(buffer.payload.as_slice().to_vec());
    Ok(BinaryArray::try_new(offsets, values, None)?)
}

fn full_record_batch(buffer: &PacketDataBuffer) -> Result<RecordBatch> {
    let n = buffer.num_packets;
    let mut timestamps = Vec::with_capacity(n);
    let mut src_mac = Vec::with_capacity(n);
    let mut dst_mac = Vec::with_capacity(n);
    let mut src_ip = Vec::with_capacity(n);
    let mut dst_ip = Vec::with_capacity(n);
    let mut src_port = Vec::with_capacity(n);
    let mut dst_port = Vec::with_capacity(n);
    let mut packet_size = Vec::with_capacity(n);
    let mut tcp_flags = Vec::with_capacity(n);
    let mut ether_type = Vec::with_capacity(n);
    let mut next_proto_id = Vec::with_capacity(n);

    for chunk in buffer
        .header
        .as_slice()
        .chunks_exact(PacketHeader::ENCODED_LEN)
    {
        let record = PacketHeader::read_from(chunk);
        timestamps.push(record.timestamp);
        src_mac.push(wire::mac_to_string(record.src_mac));
        dst_mac.push(wire::mac_to_string(record.dst_mac));
        src_ip.push(wire::ipv4_to_string(record.src_ip));
        dst_ip.push(wire::ipv4_to_string(record.dst_ip));
        src_port.push(record.src_port);
        dst_port.push(record.dst_port);
        packet_size.push(record.packet_size);
        tcp_flags.push(record.tcp_flags);
        ether_type.push(record.ether_type);
        next_proto_id.push(record.next_proto_id);
    }

    let columns: Vec<ArrayRef> = vec![
        Arc::new(UInt64Array::from(timestamps)),
        Arc::new(StringArray::from(src_mac)),
        Arc::new(StringArray::from(dst_mac)),
        Arc::new(StringArray::from(src_ip)),
        Arc::new(StringArray::from(dst_ip)),
        Arc::new(UInt16Array::from(src_port)),
        Arc::new(UInt16Array::from(dst_port)),
        Arc::new(Int32Array::from(packet_size)),
        Arc::new(Int32Array::from(tcp_flags)),
        Arc::new(Int32Array::from(ether_type)),
        Arc::new(Int32Array::from(next_proto_id)),
        Arc::new(payload_column(buffer)?),
    ];
    Ok(RecordBatch::try_new(full_schema(), columns)?)
}

fn src_ip_record_batch(buffer: &PacketDataBuffer) -> Result<RecordBatch> {
    let src_ip: Vec<String> = buffer
        .header
        .as_slice()
        .chunks_exact(4)
        .map(|b| wire::ipv4_to_string(u32::from_le_bytes(b.try_into().unwrap())))
        .collect();

    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(src_ip)),
        Arc::new(payload_column(buffer)?),
    ];
    Ok(RecordBatch::try_new(src_ip_schema(), columns)?)
}

/// Convert a combined batch into the columnar record set handed downstream.
pub fn record_batch(buffer: &PacketDataBuffer) -> Result<RecordBatch> {
    match buffer.schema {
        SchemaKind::Full => full_record_batch(buffer),
        SchemaKind::SrcIp => src_ip_record_batch(buffer),
    }
}
