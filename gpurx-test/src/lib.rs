//! Test harness for gpurx.
//!
//! Registers virtual NIC/GPU devices under generated PCI addresses (the
//! software analog of running DPDK with `--vdev net_ring0`) and builds raw
//! Ethernet/IPv4/TCP frames for injection.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use smoltcp::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, IpAddress, IpProtocol, Ipv4Packet, TcpPacket,
};

use gpurx::CaptureConfig;
use gpurx::dev::{self, Gpu, Nic};

const ETHERNET_HEADER_LEN: usize = 14;
const IPV4_HEADER_LEN: usize = 20;
const TCP_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;

/// Counter keeping generated PCI bus numbers unique within the process.
static NEXT_BUS: AtomicU8 = AtomicU8::new(0x20);

/// Builder for a virtual capture device pair.
///
/// # Example
/// ```
/// use gpurx_test::TestContextBuilder;
///
/// let ctx = TestContextBuilder::new().build().unwrap();
/// let config = ctx.capture_config();
/// ```
#[derive(Default)]
pub struct TestContextBuilder {
    nic_addr: Option<String>,
    gpu_addr: Option<String>,
}

impl TestContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an explicit NIC PCI address instead of a generated one.
    pub fn nic_addr(mut self, addr: impl Into<String>) -> Self {
        self.nic_addr = Some(addr.into());
        self
    }

    /// Use an explicit GPU PCI address instead of a generated one.
    pub fn gpu_addr(mut self, addr: impl Into<String>) -> Self {
        self.gpu_addr = Some(addr.into());
        self
    }

    /// Register both virtual devices and return the handles.
    pub fn build(self) -> gpurx::Result<TestContext> {
        let bus = NEXT_BUS.fetch_add(1, Ordering::Relaxed);
        let nic_addr = self.nic_addr.unwrap_or_else(|| format!("{bus:02x}:00.0"));
        let gpu_addr = self.gpu_addr.unwrap_or_else(|| format!("{bus:02x}:00.1"));
        let nic = dev::register_nic(&nic_addr)?;
        let gpu = dev::register_gpu(&gpu_addr)?;
        Ok(TestContext {
            nic,
            gpu,
            nic_addr,
            gpu_addr,
        })
    }
}

/// A registered virtual NIC/GPU pair.
pub struct TestContext {
    /// NIC handle; inject frames through it.
    pub nic: Arc<Nic>,
    /// GPU handle.
    pub gpu: Arc<Gpu>,
    pub nic_addr: String,
    pub gpu_addr: String,
}

impl TestContext {
    /// Capture configuration pointing at this device pair.
    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig::new(&self.nic_addr, &self.gpu_addr)
    }
}

/// Parameters of one generated TCP/IPv4 frame.
#[derive(Debug, Clone)]
pub struct FrameSpec {
    pub src_mac: [u8; 6],
    pub dst_mac: [u8; 6],
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub syn: bool,
    pub psh: bool,
    pub ack: bool,
    pub payload: Vec<u8>,
}

impl Default for FrameSpec {
    fn default() -> Self {
        Self {
            src_mac: [0x02, 0, 0, 0, 0, 0x01],
            dst_mac: [0x02, 0, 0, 0, 0, 0x02],
            src_ip: Ipv4Addr::new(10, 0, 0, 1),
            dst_ip: Ipv4Addr::new(10, 0, 0, 2),
            src_port: 40_000,
            dst_port: 8080,
            syn: false,
            psh: true,
            ack: true,
            payload: Vec::new(),
        }
    }
}

impl FrameSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn src_ip(mut self, addr: Ipv4Addr) -> Self {
        self.src_ip = addr;
        self
    }

    pub fn dst_ip(mut self, addr: Ipv4Addr) -> Self {
        self.dst_ip = addr;
        self
    }

    pub fn src_port(mut self, port: u16) -> Self {
        self.src_port = port;
        self
    }

    pub fn dst_port(mut self, port: u16) -> Self {
        self.dst_port = port;
        self
    }

    pub fn syn(mut self, syn: bool) -> Self {
        self.syn = syn;
        self
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }
}

/// Assemble a complete Ethernet/IPv4/TCP frame from a spec.
pub fn build_tcp_frame(spec: &FrameSpec) -> Vec<u8> {
    let tcp_len = TCP_HEADER_LEN + spec.payload.len();
    let ip_len = IPV4_HEADER_LEN + tcp_len;
    let mut buf = vec![0u8; ETHERNET_HEADER_LEN + ip_len];

    let mut eth = EthernetFrame::new_unchecked(&mut buf[..]);
    eth.set_dst_addr(EthernetAddress(spec.dst_mac));
    eth.set_src_addr(EthernetAddress(spec.src_mac));
    eth.set_ethertype(EthernetProtocol::Ipv4);

    let mut ip = Ipv4Packet::new_unchecked(eth.payload_mut());
    ip.set_version(4);
    ip.set_header_len(IPV4_HEADER_LEN as u8);
    ip.set_total_len(ip_len as u16);
    ip.set_hop_limit(64);
    ip.set_next_header(IpProtocol::Tcp);
    ip.set_src_addr(spec.src_ip);
    ip.set_dst_addr(spec.dst_ip);

    let mut tcp = TcpPacket::new_unchecked(ip.payload_mut());
    tcp.set_src_port(spec.src_port);
    tcp.set_dst_port(spec.dst_port);
    tcp.set_header_len(TCP_HEADER_LEN as u8);
    tcp.set_syn(spec.syn);
    tcp.set_psh(spec.psh);
    tcp.set_ack(spec.ack);
    tcp.payload_mut()[..spec.payload.len()].copy_from_slice(&spec.payload);
    tcp.fill_checksum(
        &IpAddress::Ipv4(spec.src_ip),
        &IpAddress::Ipv4(spec.dst_ip),
    );
    ip.fill_checksum();

    buf
}

/// Assemble an Ethernet/IPv4/UDP frame (useful for verifying miss drops).
pub fn build_udp_frame(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let ip_len = IPV4_HEADER_LEN + UDP_HEADER_LEN + payload.len();
    let mut buf = vec![0u8; ETHERNET_HEADER_LEN + ip_len];

    let mut eth = EthernetFrame::new_unchecked(&mut buf[..]);
    eth.set_dst_addr(EthernetAddress([0x02, 0, 0, 0, 0, 0x02]));
    eth.set_src_addr(EthernetAddress([0x02, 0, 0, 0, 0, 0x01]));
    eth.set_ethertype(EthernetProtocol::Ipv4);

    let mut ip = Ipv4Packet::new_unchecked(eth.payload_mut());
    ip.set_version(4);
    ip.set_header_len(IPV4_HEADER_LEN as u8);
    ip.set_total_len(ip_len as u16);
    ip.set_hop_limit(64);
    ip.set_next_header(IpProtocol::Udp);
    ip.set_src_addr(src_ip);
    ip.set_dst_addr(dst_ip);
    ip.payload_mut()[UDP_HEADER_LEN..UDP_HEADER_LEN + payload.len()].copy_from_slice(payload);
    ip.fill_checksum();

    buf
}

/// Install a tracing subscriber honoring `RUST_LOG`; repeated calls are
/// no-ops.
pub fn try_init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
