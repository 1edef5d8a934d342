//! Hardware flow rules steering matched traffic into a receive queue.
//!
//! Two pipes are installed per capture queue: a basic pipe matching
//! IPv4/TCP (optionally narrowed to one source address) that forwards via
//! RSS to the queue's GPU target with a placeholder catch-all entry, and a
//! traffic-root control pipe whose entry forwards matching IPv4/TCP frames
//! into the basic pipe. The root pipe always processes a frame before the
//! basic pipe. Entries are processed synchronously at build time so no rule
//! installation latency remains on the receive path.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::context::DeviceContext;
use crate::error::{Error, Result};
use crate::rxq::RxQueue;
use crate::wire::{self, PacketFields};

const ETHER_TYPE_IPV4: i32 = 0x0800;
const IP_PROTO_TCP: i32 = 6;

/// Root-entry priority for the IPv4/TCP forward rule.
const PRIORITY_LOW: u32 = 3;

/// Header match for one rule.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FlowMatch {
    ipv4: bool,
    tcp: bool,
    /// Packed big-endian source address; zero matches any source.
    src_ip: u32,
}

impl FlowMatch {
    fn matches(&self, fields: &PacketFields) -> bool {
        if self.ipv4 && fields.ether_type != ETHER_TYPE_IPV4 {
            return false;
        }
        if self.tcp && fields.next_proto_id != IP_PROTO_TCP {
            return false;
        }
        if self.src_ip != 0 && fields.src_ip != self.src_ip {
            return false;
        }
        true
    }
}

/// Forward action of a rule.
#[derive(Debug, Clone)]
enum FlowFwd {
    /// Hash onto one of the listed flow queue ids.
    Rss(Vec<u16>),
    /// Continue matching in another pipe.
    Pipe(u32),
    /// Drop the frame.
    Drop,
}

struct BasicPipe {
    name: &'static str,
    spec: FlowMatch,
    fwd: FlowFwd,
    miss: FlowFwd,
    /// Placeholder entries activating the pipe-level match.
    entries: u32,
    /// Entries become visible to dispatch only once processed.
    processed: bool,
    hits: Arc<AtomicU64>,
}

struct ControlEntry {
    id: u32,
    priority: u32,
    spec: FlowMatch,
    fwd: FlowFwd,
    processed: bool,
    hits: Arc<AtomicU64>,
}

#[derive(Default)]
struct TableInner {
    next_id: u32,
    pipes: HashMap<u32, BasicPipe>,
    /// Root control-pipe entries, kept sorted by ascending priority.
    root_entries: Vec<ControlEntry>,
}

/// The per-port rule table consulted on every ingress frame.
pub(crate) struct FlowTable {
    inner: RwLock<TableInner>,
}

impl FlowTable {
    pub(crate) fn new() -> Self {
        Self {
            inner: RwLock::new(TableInner::default()),
        }
    }

    fn alloc_id(inner: &mut TableInner) -> u32 {
        inner.next_id += 1;
        inner.next_id
    }

    fn create_basic_pipe(
        &self,
        name: &'static str,
        spec: FlowMatch,
        fwd: FlowFwd,
        miss: FlowFwd,
    ) -> u32 {
        let mut inner = self.inner.write();
        let id = Self::alloc_id(&mut inner);
        tracing::debug!(pipe = name, id, "flow pipe created");
        inner.pipes.insert(
            id,
            BasicPipe {
                name,
                spec,
                fwd,
                miss,
                entries: 0,
                processed: false,
                hits: Arc::new(AtomicU64::new(0)),
            },
        );
        id
    }

    fn add_pipe_entry(&self, pipe_id: u32) -> Result<()> {
        let mut inner = self.inner.write();
        let pipe = inner
            .pipes
            .get_mut(&pipe_id)
            .ok_or_else(|| Error::Flow(format!("no such pipe: {pipe_id}")))?;
        pipe.entries += 1;
        pipe.processed = false;
        Ok(())
    }

    fn add_root_entry(&self, priority: u32, spec: FlowMatch, fwd: FlowFwd) -> u32 {
        let mut inner = self.inner.write();
        let id = Self::alloc_id(&mut inner);
        inner.root_entries.push(ControlEntry {
            id,
            priority,
            spec,
            fwd,
            processed: false,
            hits: Arc::new(AtomicU64::new(0)),
        });
        inner.root_entries.sort_by_key(|e| e.priority);
        id
    }

    /// Process all pending entries, blocking until they are active.
    ///
    /// Dispatch ignores unprocessed entries, so rule installation latency
    /// never reaches the steady-state receive path.
    fn process_entries(&self) {
        let mut inner = self.inner.write();
        for pipe in inner.pipes.values_mut() {
            pipe.processed = true;
        }
        for entry in &mut inner.root_entries {
            entry.processed = true;
        }
    }

    fn destroy_pipe(&self, pipe_id: u32) {
        if let Some(pipe) = self.inner.write().pipes.remove(&pipe_id) {
            tracing::debug!(pipe = pipe.name, "flow pipe destroyed");
        }
    }

    fn remove_root_entry(&self, entry_id: u32) {
        self.inner.write().root_entries.retain(|e| e.id != entry_id);
    }

    /// Run one frame through the rules: root pipe first, then the forwarded
    /// pipe. Returns the target flow queue id, or `None` for a drop.
    pub(crate) fn dispatch(&self, frame: &[u8]) -> Option<u16> {
        let fields = wire::parse(frame);
        let inner = self.inner.read();

        for entry in &inner.root_entries {
            if !entry.processed || !entry.spec.matches(&fields) {
                continue;
            }
            entry.hits.fetch_add(1, Ordering::Relaxed);
            return match &entry.fwd {
                FlowFwd::Rss(queues) => Some(rss_select(queues, &fields)),
                FlowFwd::Drop => None,
                FlowFwd::Pipe(pipe_id) => {
                    let pipe = inner.pipes.get(pipe_id)?;
                    if pipe.entries > 0 && pipe.processed && pipe.spec.matches(&fields) {
                        pipe.hits.fetch_add(1, Ordering::Relaxed);
                        match &pipe.fwd {
                            FlowFwd::Rss(queues) => Some(rss_select(queues, &fields)),
                            _ => None,
                        }
                    } else {
                        debug_assert!(matches!(pipe.miss, FlowFwd::Drop));
                        None
                    }
                }
            };
        }
        None
    }
}

/// Pick an RSS target from the 4-tuple hash, preserving flow affinity.
fn rss_select(queues: &[u16], fields: &PacketFields) -> u16 {
    let hash = fields.src_ip
        ^ fields.dst_ip.rotate_left(16)
        ^ u32::from(fields.src_port)
        ^ (u32::from(fields.dst_port) << 16);
    queues[hash as usize % queues.len()]
}

/// Flow processing handle for one NIC port.
///
/// Initialized once by the device context; pipes are created against it.
pub struct FlowPort {
    nic: Arc<crate::dev::Nic>,
}

impl FlowPort {
    /// Initialize flow processing on the NIC port.
    pub(crate) fn init(nic: Arc<crate::dev::Nic>) -> Result<Self> {
        tracing::debug!(addr = %nic.pci_addr(), "flow processing initialized");
        Ok(Self { nic })
    }

    pub(crate) fn table(&self) -> &FlowTable {
        self.nic.flow_table()
    }
}

/// Installed match/forward rules steering IPv4/TCP traffic into one receive
/// queue via its GPU-resident RSS target.
pub struct RxPipe {
    context: Arc<DeviceContext>,
    #[allow(dead_code)] // Keeps the steered queue alive as long as its rules.
    rxq: Arc<RxQueue>,
    pipe_id: u32,
    root_entry_id: u32,
    pipe_hits: Arc<AtomicU64>,
    root_hits: Arc<AtomicU64>,
}

impl RxPipe {
    /// Build and synchronously activate the rule set.
    ///
    /// `source_ip_filter` is the packed big-endian filter address from
    /// [`wire::parse_ip_filter`]; zero matches all sources.
    pub fn new(
        context: &Arc<DeviceContext>,
        rxq: &Arc<RxQueue>,
        source_ip_filter: u32,
    ) -> Result<Self> {
        let table = context.flow_port().table();
        let rss_queue = rxq.cpu_handle().flow_queue_id();

        let pipe_id = table.create_basic_pipe(
            "GPU_RXQ_TCP_PIPE",
            FlowMatch {
                ipv4: true,
                tcp: true,
                src_ip: source_ip_filter,
            },
            FlowFwd::Rss(vec![rss_queue]),
            FlowFwd::Drop,
        );
        table.add_pipe_entry(pipe_id)?;
        table.process_entries();

        let root_entry_id = table.add_root_entry(
            PRIORITY_LOW,
            FlowMatch {
                ipv4: true,
                tcp: true,
                src_ip: 0,
            },
            FlowFwd::Pipe(pipe_id),
        );
        table.process_entries();

        let (pipe_hits, root_hits) = {
            let inner = table.inner.read();
            (
                Arc::clone(&inner.pipes[&pipe_id].hits),
                Arc::clone(
                    &inner
                        .root_entries
                        .iter()
                        .find(|e| e.id == root_entry_id)
                        .expect("entry just added")
                        .hits,
                ),
            )
        };

        tracing::info!(
            queue = rss_queue,
            filter = source_ip_filter,
            "rx pipe installed"
        );
        Ok(Self {
            context: Arc::clone(context),
            rxq: Arc::clone(rxq),
            pipe_id,
            root_entry_id,
            pipe_hits,
            root_hits,
        })
    }

    /// Monitor counters: frames matched by the root entry and by the basic
    /// pipe, respectively.
    pub fn hit_counts(&self) -> (u64, u64) {
        (
            self.root_hits.load(Ordering::Relaxed),
            self.pipe_hits.load(Ordering::Relaxed),
        )
    }
}

impl Drop for RxPipe {
    fn drop(&mut self) {
        let table = self.context.flow_port().table();
        table.remove_root_entry(self.root_entry_id);
        table.destroy_pipe(self.pipe_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_fields() -> PacketFields {
        PacketFields {
            ether_type: ETHER_TYPE_IPV4,
            next_proto_id: IP_PROTO_TCP,
            src_ip: u32::from_be_bytes([10, 0, 0, 1]),
            ..Default::default()
        }
    }

    #[test]
    fn test_match_spec() {
        let spec = FlowMatch {
            ipv4: true,
            tcp: true,
            src_ip: 0,
        };
        assert!(spec.matches(&tcp_fields()));

        let udp = PacketFields {
            next_proto_id: 17,
            ..tcp_fields()
        };
        assert!(!spec.matches(&udp));

        let filtered = FlowMatch {
            ipv4: true,
            tcp: true,
            src_ip: u32::from_be_bytes([10, 0, 0, 2]),
        };
        assert!(!filtered.matches(&tcp_fields()));
    }

    #[test]
    fn test_unprocessed_entries_invisible() {
        let table = FlowTable::new();
        let pipe_id = table.create_basic_pipe(
            "p",
            FlowMatch {
                ipv4: true,
                tcp: true,
                src_ip: 0,
            },
            FlowFwd::Rss(vec![0]),
            FlowFwd::Drop,
        );
        table.add_pipe_entry(pipe_id).unwrap();
        table.add_root_entry(
            PRIORITY_LOW,
            FlowMatch {
                ipv4: true,
                tcp: true,
                src_ip: 0,
            },
            FlowFwd::Pipe(pipe_id),
        );

        let frame = crate::wire::tests_frame_support::minimal_tcp_frame();
        assert_eq!(table.dispatch(&frame), None);
        table.process_entries();
        assert_eq!(table.dispatch(&frame), Some(0));
    }
}
