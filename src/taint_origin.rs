//! Maps (taint source, address) pairs to trace wide origin ids.
//!
//! Origin ids are partitioned by range:
//!
//!   [0, 10000)      the source's own number, for non-network sources
//!   [10000, 11000)  one id per TCP connection
//!   [11000, 20000)  one id per UDP flow
//!   [20000, ...)    one id per loaded module

use crate::{
    log::LogDebug,
    trace::{taint_record::TaintSource, trace_records::ModuleRecord},
};
use std::{collections::HashMap, net::Ipv4Addr, ops::Range};

pub const TAINT_ORIGIN_START_TCP_NIC_IN: u32 = 10000;
pub const TAINT_ORIGIN_START_UDP_NIC_IN: u32 = 11000;
pub const TAINT_ORIGIN_MODULE: u32 = 20000;

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum OriginError {
    #[error("address {address:#x} is not inside any bound network buffer")]
    UnknownConnection { address: u32 },

    #[error("address {address:#x} is not inside any registered module")]
    UnknownModule { address: u32 },

    #[error("no {protocol:?} origin ids left")]
    Exhausted { protocol: Protocol },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    fn id_range(self) -> Range<u32> {
        match self {
            Protocol::Tcp => TAINT_ORIGIN_START_TCP_NIC_IN..TAINT_ORIGIN_START_UDP_NIC_IN,
            Protocol::Udp => TAINT_ORIGIN_START_UDP_NIC_IN..TAINT_ORIGIN_MODULE,
        }
    }
}

/// Identity of one network connection (or UDP flow) as seen by the guest.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct FlowKey {
    pub protocol: Protocol,
    pub local_port: u16,
    pub remote_addr: Ipv4Addr,
    pub remote_port: u16,
}

struct BoundBuffer {
    range: Range<u32>,
    flow: FlowKey,
}

struct RegisteredModule {
    range: Range<u32>,
    id: u32,
}

/// Per trace session origin table. Never share one between sessions without
/// calling `reset()`.
#[derive(Default)]
pub struct OriginResolver {
    flows: HashMap<FlowKey, u32>,
    next_tcp: u32,
    next_udp: u32,
    /// Most recent binding first; buffers get reused by the guest.
    buffers: Vec<BoundBuffer>,
    modules: Vec<RegisteredModule>,
    module_ids: HashMap<u32, u32>,
}

impl OriginResolver {
    pub fn new() -> OriginResolver {
        OriginResolver::default()
    }

    pub fn reset(&mut self) {
        *self = OriginResolver::default();
    }

    /// Record that guest memory `[start, start + len)` received payload of `flow`.
    pub fn bind_buffer(&mut self, flow: FlowKey, start: u32, len: u32) {
        let range = start..start.saturating_add(len);
        self.buffers.retain(|b| b.range != range);
        self.buffers.insert(0, BoundBuffer { range, flow });
    }

    /// Stable id of `flow` for this session, allocating one on first sight.
    pub fn resolve_flow(&mut self, flow: &FlowKey) -> Result<u32, OriginError> {
        if let Some(id) = self.flows.get(flow) {
            return Ok(*id);
        }
        let range = flow.protocol.id_range();
        let next = match flow.protocol {
            Protocol::Tcp => &mut self.next_tcp,
            Protocol::Udp => &mut self.next_udp,
        };
        let id = range.start + *next;
        if !range.contains(&id) {
            return Err(OriginError::Exhausted {
                protocol: flow.protocol,
            });
        }
        *next += 1;
        self.flows.insert(*flow, id);
        log!(LogDebug, "flow {:?} -> origin {}", flow, id);
        Ok(id)
    }

    /// Registering the same base twice keeps the first id.
    pub fn register_module(&mut self, module: &ModuleRecord) -> u32 {
        if let Some(id) = self.module_ids.get(&module.base) {
            return *id;
        }
        let id = TAINT_ORIGIN_MODULE + self.modules.len() as u32;
        self.modules.push(RegisteredModule {
            range: module.base..module.base.saturating_add(module.size),
            id,
        });
        self.module_ids.insert(module.base, id);
        id
    }

    pub fn resolve_origin(&mut self, source: TaintSource, address: u32) -> Result<u32, OriginError> {
        match source {
            TaintSource::NicIn => {
                let flow = self
                    .buffers
                    .iter()
                    .find(|b| b.range.contains(&address))
                    .map(|b| b.flow)
                    .ok_or(OriginError::UnknownConnection { address })?;
                self.resolve_flow(&flow)
            }
            TaintSource::Module => self
                .modules
                .iter()
                .find(|m| m.range.contains(&address))
                .map(|m| m.id)
                .ok_or(OriginError::UnknownModule { address }),
            _ => Ok(source as u32),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(protocol: Protocol, remote_port: u16) -> FlowKey {
        FlowKey {
            protocol,
            local_port: 80,
            remote_addr: Ipv4Addr::new(10, 0, 0, 2),
            remote_port,
        }
    }

    #[test]
    fn non_network_sources_keep_their_number() {
        let mut r = OriginResolver::new();
        assert_eq!(Ok(1), r.resolve_origin(TaintSource::KeyboardIn, 0x1234));
        assert_eq!(Ok(13), r.resolve_origin(TaintSource::LoopIv, 0));
    }

    #[test]
    fn same_connection_same_id() {
        let mut r = OriginResolver::new();
        r.bind_buffer(flow(Protocol::Tcp, 4000), 0x1000, 0x100);
        r.bind_buffer(flow(Protocol::Tcp, 4001), 0x2000, 0x100);
        let a = r.resolve_origin(TaintSource::NicIn, 0x1010).unwrap();
        let b = r.resolve_origin(TaintSource::NicIn, 0x10ff).unwrap();
        let c = r.resolve_origin(TaintSource::NicIn, 0x2000).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!((10000..11000).contains(&a));
        assert!((10000..11000).contains(&c));
    }

    #[test]
    fn udp_never_in_tcp_range() {
        let mut r = OriginResolver::new();
        for port in 0..50 {
            let id = r.resolve_flow(&flow(Protocol::Udp, port)).unwrap();
            assert!(!(10000..11000).contains(&id));
            assert!((11000..20000).contains(&id));
        }
    }

    #[test]
    fn tcp_range_exhausts() {
        let mut r = OriginResolver::new();
        for port in 0..1000 {
            r.resolve_flow(&flow(Protocol::Tcp, port)).unwrap();
        }
        assert_eq!(
            Err(OriginError::Exhausted {
                protocol: Protocol::Tcp
            }),
            r.resolve_flow(&flow(Protocol::Tcp, 1000))
        );
    }

    #[test]
    fn rebinding_a_buffer_moves_it_to_the_new_flow() {
        let mut r = OriginResolver::new();
        r.bind_buffer(flow(Protocol::Tcp, 1), 0x1000, 0x10);
        let first = r.resolve_origin(TaintSource::NicIn, 0x1000).unwrap();
        r.bind_buffer(flow(Protocol::Udp, 2), 0x1000, 0x10);
        let second = r.resolve_origin(TaintSource::NicIn, 0x1000).unwrap();
        assert_ne!(first, second);
        assert!(second >= TAINT_ORIGIN_START_UDP_NIC_IN);
    }

    #[test]
    fn unbound_address_is_an_error() {
        let mut r = OriginResolver::new();
        assert_eq!(
            Err(OriginError::UnknownConnection { address: 0x42 }),
            r.resolve_origin(TaintSource::NicIn, 0x42)
        );
    }

    #[test]
    fn modules() {
        let mut r = OriginResolver::new();
        let a = r.register_module(&ModuleRecord::new("a.dll", 0x40_0000, 0x1000).unwrap());
        let b = r.register_module(&ModuleRecord::new("b.dll", 0x50_0000, 0x1000).unwrap());
        assert_eq!(
            a,
            r.register_module(&ModuleRecord::new("a.dll", 0x40_0000, 0x1000).unwrap())
        );
        assert_eq!(TAINT_ORIGIN_MODULE, a);
        assert_eq!(TAINT_ORIGIN_MODULE + 1, b);
        assert_eq!(Ok(b), r.resolve_origin(TaintSource::Module, 0x50_0fff));
        assert!(r.resolve_origin(TaintSource::Module, 0x50_1000).is_err());
    }

    #[test]
    fn reset_forgets_everything() {
        let mut r = OriginResolver::new();
        r.resolve_flow(&flow(Protocol::Tcp, 1)).unwrap();
        let second = r.resolve_flow(&flow(Protocol::Tcp, 2)).unwrap();
        r.reset();
        assert_eq!(Ok(TAINT_ORIGIN_START_TCP_NIC_IN), r.resolve_flow(&flow(Protocol::Tcp, 2)));
        assert_ne!(second, TAINT_ORIGIN_START_TCP_NIC_IN);
    }
}
