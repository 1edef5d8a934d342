//! Convert/batch stage: merges drained packet batches across a bounded time
//! window and emits columnar record sets downstream.
//!
//! Two cooperative tasks share one bounded, ordered channel. The producer
//! side pushes one packet-data buffer per raw-queue drain and suspends when
//! the channel is full; the consumer side collects buffers until the flush
//! window elapses (anchored at the first buffer of the window) or the
//! channel closes, concatenates what it collected and emits a single record
//! batch. Channel close is the sole termination signal: the consumer drains
//! the remainder, emits a final batch if non-empty, then completes by
//! dropping its output sender.

use arrow::record_batch::RecordBatch;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};

use crate::batch::{self, BufferHints, PacketDataBuffer};
use crate::config::CaptureConfig;
use crate::error::{Error, Result};
use crate::table;

/// Convert-stage configuration, extracted from the capture config.
#[derive(Debug, Clone)]
pub struct ConvertConfig {
    pub max_time_delta: std::time::Duration,
    pub channel_capacity: usize,
    pub hints: BufferHints,
}

impl ConvertConfig {
    pub fn from_capture(config: &CaptureConfig) -> Self {
        Self {
            max_time_delta: config.max_time_delta,
            channel_capacity: config.channel_capacity,
            hints: BufferHints {
                header_bytes: config.header_buffer_size,
                payload_bytes: config.payload_buffer_size,
                sizes_bytes: config.sizes_buffer_size,
            },
        }
    }
}

/// Producer handle onto the convert channel.
#[derive(Clone)]
pub struct BatchSender {
    tx: mpsc::Sender<PacketDataBuffer>,
}

impl BatchSender {
    /// Push one drained buffer, blocking while the channel is full.
    ///
    /// Used from the host polling thread; the block transfers scheduling
    /// control instead of spinning.
    pub fn blocking_push(&self, buffer: PacketDataBuffer) -> Result<()> {
        self.tx
            .blocking_send(buffer)
            .map_err(|_| Error::ChannelClosed)
    }

    /// Push one drained buffer, suspending while the channel is full.
    pub async fn push(&self, buffer: PacketDataBuffer) -> Result<()> {
        self.tx.send(buffer).await.map_err(|_| Error::ChannelClosed)
    }
}

/// The convert/batch stage.
pub struct ConvertStage;

impl ConvertStage {
    /// Spawn the consumer task.
    ///
    /// Returns the producer handle and the consumer's join handle. Dropping
    /// every clone of the producer handle closes the channel and shuts the
    /// consumer down after a final drain.
    pub fn start(
        config: ConvertConfig,
        output: mpsc::Sender<RecordBatch>,
    ) -> (BatchSender, tokio::task::JoinHandle<Result<()>>) {
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let handle = tokio::spawn(run_consumer(config, rx, output));
        (BatchSender { tx }, handle)
    }
}

async fn run_consumer(
    config: ConvertConfig,
    mut rx: mpsc::Receiver<PacketDataBuffer>,
    output: mpsc::Sender<RecordBatch>,
) -> Result<()> {
    loop {
        // The window is anchored at the first buffer it collects.
        let Some(first) = rx.recv().await else {
            break;
        };
        let deadline = Instant::now() + config.max_time_delta;
        let mut collected = vec![first];
        let mut closed = false;

        loop {
            match timeout_at(deadline, rx.recv()).await {
                Ok(Some(buffer)) => collected.push(buffer),
                Ok(None) => {
                    closed = true;
                    break;
                }
                Err(_elapsed) => break,
            }
        }

        let ttl_packets: usize = collected.iter().map(|b| b.num_packets).sum();
        tracing::debug!(
            buffers = collected.len(),
            packets = ttl_packets,
            "flushing batch window"
        );

        let combined = batch::concat_packet_buffers(collected, &config.hints)?;
        let record_batch = table::record_batch(&combined)?;
        if output.send(record_batch).await.is_err() {
            tracing::debug!("downstream receiver dropped, stopping convert stage");
            return Ok(());
        }

        if closed {
            break;
        }
    }
    tracing::debug!("convert channel closed, consumer drained");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::PacketHeader;
    use crate::config::SchemaKind;
    use crate::dev::{DeviceBuffer, Gpu};
    use std::sync::Arc;
    use std::time::Duration;

    fn test_config(window_ms: u64) -> ConvertConfig {
        ConvertConfig {
            max_time_delta: Duration::from_millis(window_ms),
            channel_capacity: 8,
            hints: BufferHints {
                header_bytes: 0,
                payload_bytes: 0,
                sizes_bytes: 0,
            },
        }
    }

    /// A full-schema buffer of `packets` single-byte-payload packets.
    fn test_buffer(packets: usize) -> PacketDataBuffer {
        let gpu = Arc::new(Gpu::new("ac:00.0".parse().unwrap()));
        let mut header = vec![0u8; packets * PacketHeader::ENCODED_LEN];
        for i in 0..packets {
            let offset = i * PacketHeader::ENCODED_LEN;
            PacketHeader {
                packet_size: 1,
                ..Default::default()
            }
            .write_to(&mut header[offset..offset + PacketHeader::ENCODED_LEN]);
        }
        PacketDataBuffer {
            num_packets: packets,
            schema: SchemaKind::Full,
            header: DeviceBuffer::from_slice(&header),
            payload: DeviceBuffer::from_slice(&vec![0xABu8; packets]),
            payload_sizes: DeviceBuffer::from_slice(&vec![1u32; packets]),
            stream: gpu.create_stream(),
        }
    }

    /// Items arriving at t = 0, 10, 20 and 80 ms against a 50 ms window must
    /// produce exactly two batches: the first three items flushed when the
    /// window anchored at t = 0 elapses, the fourth flushed on close.
    #[tokio::test(start_paused = true)]
    async fn test_batch_windowing() {
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let (sender, handle) = ConvertStage::start(test_config(50), out_tx);

        sender.push(test_buffer(1)).await.unwrap();
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_millis(10)).await;
        sender.push(test_buffer(2)).await.unwrap();
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_millis(10)).await;
        sender.push(test_buffer(3)).await.unwrap();
        tokio::task::yield_now().await;

        // Nothing may flush before the window elapses.
        assert!(out_rx.try_recv().is_err());

        // Cross the t = 50 ms deadline.
        tokio::time::advance(Duration::from_millis(40)).await;
        let first = out_rx.recv().await.expect("window flush");
        assert_eq!(first.num_rows(), 1 + 2 + 3);

        // Fourth item at t = 80 ms, then close.
        tokio::time::advance(Duration::from_millis(20)).await;
        sender.push(test_buffer(4)).await.unwrap();
        drop(sender);

        let second = out_rx.recv().await.expect("final flush");
        assert_eq!(second.num_rows(), 4);

        assert!(out_rx.recv().await.is_none());
        handle.await.unwrap().unwrap();
    }

    /// Close drains buffered items into one final batch without waiting for
    /// the window.
    #[tokio::test(start_paused = true)]
    async fn test_close_drains_remaining() {
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let (sender, handle) = ConvertStage::start(test_config(10_000), out_tx);

        sender.push(test_buffer(2)).await.unwrap();
        sender.push(test_buffer(3)).await.unwrap();
        drop(sender);

        let batch = out_rx.recv().await.expect("final batch");
        assert_eq!(batch.num_rows(), 5);
        assert!(out_rx.recv().await.is_none());
        handle.await.unwrap().unwrap();
    }

    /// An idle channel that closes without ever carrying an item emits
    /// nothing.
    #[tokio::test(start_paused = true)]
    async fn test_empty_close_emits_nothing() {
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let (sender, handle) = ConvertStage::start(test_config(50), out_tx);
        drop(sender);
        assert!(out_rx.recv().await.is_none());
        handle.await.unwrap().unwrap();
    }
}
