//! Capture source: owns the device stack of one capture session and drives
//! the kernels from the host polling loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwap;

use crate::batch::PacketDataBuffer;
use crate::config::CaptureConfig;
use crate::context::DeviceContext;
use crate::convert::{BatchSender, ConvertConfig};
use crate::error::{Error, Result};
use crate::flow::RxPipe;
use crate::kernel::{self, GatherOutput};
use crate::rxq::RxQueue;
use crate::sem::SemaphoreRing;
use crate::wire;

/// Snapshot of capture progress, published after every drained batch.
#[derive(Debug, Clone, Default)]
pub struct CaptureStats {
    /// Packets gathered into packet-data buffers.
    pub packets: u64,
    /// Batches pushed to the convert stage.
    pub batches: u64,
    /// Payload bytes gathered.
    pub payload_bytes: u64,
    /// Receive polls that returned no packets.
    pub empty_polls: u64,
}

/// External stop flag for the host polling loop.
///
/// Raising it is the only way to cancel a healthy capture; the loop notices
/// at its next poll boundary and drains gracefully.
#[derive(Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Request the polling loop to stop.
    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether a stop has been requested.
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// A line-rate capture session: device context, receive queue, semaphore
/// ring and flow pipe, plus the host loop that cycles the kernels.
pub struct CaptureSource {
    config: CaptureConfig,
    context: Arc<DeviceContext>,
    rxq: Arc<RxQueue>,
    sem: Arc<SemaphoreRing>,
    pipe: RxPipe,
    stream: crate::dev::Stream,
    stop: Arc<AtomicBool>,
    stats: ArcSwap<CaptureStats>,
}

impl CaptureSource {
    /// Build the full capture stack.
    ///
    /// Fails fatally on a malformed source-IP filter, an unopenable device
    /// or a flow-rule installation error; nothing here is retried.
    pub fn new(config: CaptureConfig) -> Result<Self> {
        let source_ip = wire::parse_ip_filter(&config.source_ip_filter)?;

        let context = DeviceContext::new(&config.nic_pci_addr, &config.gpu_pci_addr)?;
        let rxq = RxQueue::new(&context, config.semaphore_count)?;
        let sem = Arc::new(SemaphoreRing::new(config.semaphore_count));
        let pipe = RxPipe::new(&context, &rxq, source_ip)?;
        let stream = context.gpu().create_stream();

        tracing::info!(
            nic = %context.nic_pci_addr(),
            gpu = %context.gpu_pci_addr(),
            ring = config.semaphore_count,
            "capture source ready"
        );
        Ok(Self {
            config,
            context,
            rxq,
            sem,
            pipe,
            stream,
            stop: Arc::new(AtomicBool::new(false)),
            stats: ArcSwap::from_pointee(CaptureStats::default()),
        })
    }

    /// The session's device context.
    #[inline]
    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.context
    }

    /// The session's configuration.
    #[inline]
    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// The installed flow pipe.
    #[inline]
    pub fn pipe(&self) -> &RxPipe {
        &self.pipe
    }

    /// Convert-stage configuration matching this source.
    pub fn convert_config(&self) -> ConvertConfig {
        ConvertConfig::from_capture(&self.config)
    }

    /// Stop flag shared with the polling loop.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop))
    }

    /// Latest progress snapshot.
    pub fn stats(&self) -> Arc<CaptureStats> {
        self.stats.load_full()
    }

    /// Host polling loop.
    ///
    /// Cycles the semaphore cursor round-robin: launch the receive kernel,
    /// skip empty polls, gather the published batch, pack it and push it to
    /// the convert stage. Runs until the stop flag is raised, the convert
    /// channel closes, or an unrecoverable device error escalates; in every
    /// case the producer side of the channel is released so the consumer
    /// can drain.
    pub fn run(&self, sender: BatchSender) -> Result<()> {
        let rxq_gpu = self.rxq.gpu_handle();
        let mut sem_idx: u32 = 0;

        while !self.stop.load(Ordering::Relaxed) {
            let received = kernel::packet_receive(
                &rxq_gpu,
                &self.sem,
                sem_idx,
                self.config.rx_timeout,
                &self.stop,
                &self.stream,
            )?;

            if received.packet_count == 0 {
                self.bump(|stats| stats.empty_polls += 1);
                // The receive timeout already bounds the poll; yielding
                // keeps an idle capture from pegging a core.
                std::thread::yield_now();
                continue;
            }

            let packet_count = received.packet_count as usize;
            let payload_total = received.payload_size_total.max(0) as usize;
            let mut gathered = GatherOutput::with_capacity(packet_count, payload_total);
            kernel::packet_gather(&rxq_gpu, &self.sem, sem_idx, &mut gathered)?;
            sem_idx = (sem_idx + 1) % u32::from(self.sem.size());

            // Host reads the gather outputs next; this is the sync point.
            self.stream.synchronize()?;

            let buffer =
                PacketDataBuffer::from_gather(&gathered, self.config.schema, &self.stream)?;
            match sender.blocking_push(buffer) {
                Ok(()) => {}
                Err(Error::ChannelClosed) => {
                    tracing::info!("convert channel closed, stopping capture");
                    break;
                }
                Err(err) => return Err(err),
            }

            self.bump(|stats| {
                stats.packets += packet_count as u64;
                stats.batches += 1;
                stats.payload_bytes += payload_total as u64;
            });
        }

        tracing::info!(stats = ?self.stats(), "capture loop stopped");
        Ok(())
    }

    fn bump(&self, update: impl FnOnce(&mut CaptureStats)) {
        let mut stats = CaptureStats::clone(&self.stats.load());
        update(&mut stats);
        self.stats.store(Arc::new(stats));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dev;

    #[test]
    fn test_malformed_filter_is_fatal() {
        dev::register_nic("b0:00.0").unwrap();
        dev::register_gpu("b0:00.1").unwrap();
        let config = CaptureConfig::new("b0:00.0", "b0:00.1").source_ip_filter("999.1.2");
        assert!(matches!(
            CaptureSource::new(config),
            Err(Error::InvalidIpFilter(_))
        ));
    }

    #[test]
    fn test_missing_device_is_fatal() {
        let config = CaptureConfig::new("b1:00.0", "b1:00.1");
        assert!(matches!(
            CaptureSource::new(config),
            Err(Error::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_stop_handle() {
        dev::register_nic("b2:00.0").unwrap();
        dev::register_gpu("b2:00.1").unwrap();
        let config = CaptureConfig::new("b2:00.0", "b2:00.1").semaphore_count(8);
        let source = CaptureSource::new(config).unwrap();
        let stop = source.stop_handle();
        assert!(!stop.is_stopped());
        stop.stop();
        assert!(stop.is_stopped());
    }
}
