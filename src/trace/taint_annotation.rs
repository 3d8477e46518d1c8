use crate::{
    log::LogWarn,
    taint_origin::{OriginError, OriginResolver},
    trace::entry_header::EntryHeader,
};

/// An entry whose taint byte records carry resolved origin ids and is ready
/// to be written.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TaintAnnotatedEntry {
    pub entry: EntryHeader,
    /// Operands (default slot, operand list and memreg grid) with at least one
    /// tainted byte.
    pub tainted_operands: usize,
}

impl TaintAnnotatedEntry {
    pub fn is_tainted(&self) -> bool {
        self.tainted_operands > 0
    }

    pub fn into_entry(self) -> EntryHeader {
        self.entry
    }
}

/// Stamp `address` on `entry` and resolve the origin of every taint byte
/// record.
///
/// The host fills each record's `origin` with the guest address the byte was
/// read from; it is replaced with the id `resolver` assigns to that
/// (source, address) pair. With `ignore_taint` no lookup happens and the
/// entry is stripped of taint.
///
/// The first origin that cannot be resolved fails the whole entry.
pub fn decode_address(
    resolver: &mut OriginResolver,
    address: u32,
    mut entry: EntryHeader,
    ignore_taint: bool,
) -> Result<TaintAnnotatedEntry, OriginError> {
    entry.address = address;
    if ignore_taint {
        for op in entry.all_operands_mut() {
            op.clear_taint();
        }
        return Ok(TaintAnnotatedEntry {
            entry,
            tainted_operands: 0,
        });
    }

    for op in entry.all_operands_mut() {
        for rec in op.records.iter_mut() {
            for b in rec.byte_records_mut() {
                b.origin = match resolver.resolve_origin(b.source, b.origin) {
                    Ok(id) => id,
                    Err(e) => {
                        log!(
                            LogWarn,
                            "instruction {:#x}: cannot resolve {} taint at {:#x}: {}",
                            address,
                            b.source,
                            b.origin,
                            e
                        );
                        return Err(e);
                    }
                };
            }
        }
    }

    let tainted_operands = entry.num_tainted_operands();
    Ok(TaintAnnotatedEntry {
        entry,
        tainted_operands,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        taint_origin::{FlowKey, Protocol, TAINT_ORIGIN_MODULE},
        trace::{
            operand::{OpType, OperandValue},
            taint_record::{TaintByteRecord, TaintPropagation, TaintRecord, TaintSource},
            trace_records::ModuleRecord,
        },
    };
    use std::net::Ipv4Addr;

    fn tainted(source: TaintSource, raw_addr: u32) -> EntryHeader {
        let mut e = EntryHeader::new(0, 1);
        let mut op = OperandValue::new(OpType::MemLoc, 2, 0x2000, 0);
        let rec = TaintRecord::with_bytes(
            TaintPropagation::Src,
            &[TaintByteRecord::new(source, raw_addr, 0)],
        )
        .unwrap();
        op.set_byte_taint(1, rec).unwrap();
        e.push_operand(op).unwrap();
        e.push_operand(OperandValue::new(OpType::Register, 4, 116, 0))
            .unwrap();
        e
    }

    fn origin_of(a: &TaintAnnotatedEntry) -> u32 {
        a.entry.operands[0].records[1].byte_records()[0].origin
    }

    #[test]
    fn network_taint_gets_flow_id() {
        let mut r = OriginResolver::new();
        r.bind_buffer(
            FlowKey {
                protocol: Protocol::Tcp,
                local_port: 80,
                remote_addr: Ipv4Addr::LOCALHOST,
                remote_port: 5555,
            },
            0x7000,
            0x100,
        );
        let e = tainted(TaintSource::NicIn, 0x7010);
        let a = decode_address(&mut r, 0x40_1000, e, false).unwrap();
        assert_eq!(0x40_1000, a.entry.address);
        assert_eq!(10000, origin_of(&a));
        assert_eq!(1, a.tainted_operands);
    }

    #[test]
    fn module_taint() {
        let mut r = OriginResolver::new();
        r.register_module(&ModuleRecord::new("ntdll.dll", 0x7c90_0000, 0x10_0000).unwrap());
        let a = decode_address(&mut r, 1, tainted(TaintSource::Module, 0x7c91_0000), false)
            .unwrap();
        assert_eq!(TAINT_ORIGIN_MODULE, origin_of(&a));
    }

    #[test]
    fn ignore_taint_clears_everything() {
        let mut r = OriginResolver::new();
        // Unbound address: would fail if it were looked up.
        let a = decode_address(&mut r, 2, tainted(TaintSource::NicIn, 0x42), true).unwrap();
        assert!(!a.is_tainted());
        assert!(!a.entry.is_tainted());
        assert!(a.entry.operands[0].records[1].is_empty());
    }

    #[test]
    fn records_on_clean_bytes_are_resolved_too() {
        let mut r = OriginResolver::new();
        r.register_module(&ModuleRecord::new("ntdll.dll", 0x7c90_0000, 0x10_0000).unwrap());
        let mut e = tainted(TaintSource::Module, 0x7c91_0000);
        e.operands[0].tainted = 0;
        let a = decode_address(&mut r, 3, e, false).unwrap();
        assert_eq!(TAINT_ORIGIN_MODULE, origin_of(&a));
        assert_eq!(0, a.tainted_operands);
    }

    #[test]
    fn unresolvable_taint_is_an_error() {
        let mut r = OriginResolver::new();
        assert_eq!(
            Err(OriginError::UnknownConnection { address: 0x42 }),
            decode_address(&mut r, 2, tainted(TaintSource::NicIn, 0x42), false)
                .map(|a| a.tainted_operands)
        );
    }

    #[test]
    fn keyboard_taint_keeps_source_number() {
        let mut r = OriginResolver::new();
        let a = decode_address(&mut r, 3, tainted(TaintSource::KeyboardIn, 0x1234), false)
            .unwrap();
        assert_eq!(TaintSource::KeyboardIn as u32, origin_of(&a));
    }
}
