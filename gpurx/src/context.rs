//! Device context: the lifetime anchor for one capture session.

use std::sync::Arc;

use crate::dev::{self, Gpu, Nic, PciAddr};
use crate::error::Result;
use crate::flow::FlowPort;

/// Maximum number of receive queues one context supports.
const MAX_QUEUE: u16 = 4;

/// Owns the GPU device handle, the NIC device handle and the hardware flow
/// port for the lifetime of a capture session.
///
/// Created once per capture source and destroyed only at stage teardown.
/// Every descendant component (queue, pipe, semaphore ring) holds a shared
/// `Arc` to the context, extending its lifetime without ever owning it, so
/// the ownership graph stays a DAG rooted at the capture source.
pub struct DeviceContext {
    gpu: Arc<Gpu>,
    nic: Arc<Nic>,
    flow_port: FlowPort,
    nic_pci: PciAddr,
    gpu_pci: PciAddr,
    nic_port: u16,
    max_queue_count: u16,
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("nic_pci", &self.nic_pci)
            .field("gpu_pci", &self.gpu_pci)
            .field("nic_port", &self.nic_port)
            .field("max_queue_count", &self.max_queue_count)
            .finish()
    }
}

impl DeviceContext {
    /// Open both devices and initialize flow processing on the NIC port.
    ///
    /// Device acquisition failure is a startup-time configuration error:
    /// it is reported up and terminates pipeline construction, never
    /// retried.
    pub fn new(nic_addr: &str, gpu_addr: &str) -> Result<Arc<Self>> {
        let nic = dev::open_nic(nic_addr)?;
        let gpu = dev::open_gpu(gpu_addr)?;
        let nic_pci = nic.pci_addr();
        let gpu_pci = gpu.pci_addr();
        let flow_port = FlowPort::init(Arc::clone(&nic))?;

        tracing::info!(nic = %nic_pci, gpu = %gpu_pci, "device context ready");
        Ok(Arc::new(Self {
            gpu,
            nic,
            flow_port,
            nic_pci,
            gpu_pci,
            nic_port: 0,
            max_queue_count: MAX_QUEUE,
        }))
    }

    /// GPU device handle.
    #[inline]
    pub fn gpu(&self) -> &Arc<Gpu> {
        &self.gpu
    }

    /// NIC device handle.
    #[inline]
    pub fn nic(&self) -> &Arc<Nic> {
        &self.nic
    }

    /// Hardware flow processing port.
    #[inline]
    pub fn flow_port(&self) -> &FlowPort {
        &self.flow_port
    }

    /// NIC port index used for capture.
    #[inline]
    pub fn nic_port(&self) -> u16 {
        self.nic_port
    }

    /// Maximum receive queues supported by this context.
    #[inline]
    pub fn max_queue_count(&self) -> u16 {
        self.max_queue_count
    }

    /// PCI address of the NIC.
    #[inline]
    pub fn nic_pci_addr(&self) -> PciAddr {
        self.nic_pci
    }

    /// PCI address of the GPU.
    #[inline]
    pub fn gpu_pci_addr(&self) -> PciAddr {
        self.gpu_pci
    }
}
