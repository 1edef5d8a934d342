//! Device layer: PCI addressing and the virtual-device registry.
//!
//! Hardware NICs and GPUs are looked up by PCI address at context
//! construction time. The registry is process-global; test harnesses (and
//! loopback setups) register software devices under well-known addresses,
//! much like DPDK deployments register `--vdev` ring devices. Opening an
//! address nobody registered is a fatal configuration error.

pub mod gpu;
pub mod nic;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use nix::errno::Errno;
use parking_lot::RwLock;

use crate::error::{Error, Result};

pub use gpu::{DeviceBuffer, Gpu, Stream};
pub use nic::{Nic, RawFrame};

/// PCI `bus:device.function` identifier, e.g. `"17:00.1"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PciAddr {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl FromStr for PciAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let err = || Error::InvalidPciAddr(s.to_string());
        let (bus, rest) = s.split_once(':').ok_or_else(err)?;
        let (device, function) = rest.split_once('.').ok_or_else(err)?;
        Ok(Self {
            bus: u8::from_str_radix(bus, 16).map_err(|_| err())?,
            device: u8::from_str_radix(device, 16).map_err(|_| err())?,
            function: u8::from_str_radix(function, 16).map_err(|_| err())?,
        })
    }
}

impl std::fmt::Display for PciAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02x}:{:02x}.{:x}", self.bus, self.device, self.function)
    }
}

struct Registry {
    nics: HashMap<PciAddr, Arc<Nic>>,
    gpus: HashMap<PciAddr, Arc<Gpu>>,
}

static REGISTRY: LazyLock<RwLock<Registry>> = LazyLock::new(|| {
    RwLock::new(Registry {
        nics: HashMap::new(),
        gpus: HashMap::new(),
    })
});

/// Register a software NIC device under the given PCI address.
///
/// Returns the device handle so callers can inject frames into it. Fails
/// with `EEXIST` if the address is already taken.
pub fn register_nic(addr: &str) -> Result<Arc<Nic>> {
    let pci: PciAddr = addr.parse()?;
    let mut reg = REGISTRY.write();
    if reg.nics.contains_key(&pci) {
        return Err(Error::device("nic_register", Errno::EEXIST));
    }
    let nic = Arc::new(Nic::new(pci));
    reg.nics.insert(pci, Arc::clone(&nic));
    tracing::info!(addr = %pci, "registered nic device");
    Ok(nic)
}

/// Register a software GPU device under the given PCI address.
pub fn register_gpu(addr: &str) -> Result<Arc<Gpu>> {
    let pci: PciAddr = addr.parse()?;
    let mut reg = REGISTRY.write();
    if reg.gpus.contains_key(&pci) {
        return Err(Error::device("gpu_register", Errno::EEXIST));
    }
    let gpu = Arc::new(Gpu::new(pci));
    reg.gpus.insert(pci, Arc::clone(&gpu));
    tracing::info!(addr = %pci, "registered gpu device");
    Ok(gpu)
}

/// Open a registered NIC device by PCI address.
pub fn open_nic(addr: &str) -> Result<Arc<Nic>> {
    let pci: PciAddr = addr.parse()?;
    REGISTRY
        .read()
        .nics
        .get(&pci)
        .cloned()
        .ok_or_else(|| Error::DeviceNotFound(addr.to_string()))
}

/// Open a registered GPU device by PCI address.
pub fn open_gpu(addr: &str) -> Result<Arc<Gpu>> {
    let pci: PciAddr = addr.parse()?;
    REGISTRY
        .read()
        .gpus
        .get(&pci)
        .cloned()
        .ok_or_else(|| Error::DeviceNotFound(addr.to_string()))
}
