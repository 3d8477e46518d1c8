use crate::{
    bounded_vec::BoundedVec,
    trace::{
        operand::OperandValue,
        taint_record::TaintPropagation,
        trace_error::CodecError,
        trace_stream::{ENTRY_HEADER_FIXED_SIZE, MAX_INSN_BYTES, MAX_NUM_MEMREGS, MAX_NUM_OPERANDS},
        wire::{get_bytes, get_i32, get_u16, get_u32, get_u8, put_i32, put_u16, put_u32, put_u8},
    },
};
use std::{
    convert::TryFrom,
    io::{self, stdout, Write},
    iter,
};

/// The x86 DF flag as the host reports it: string operations either walk
/// forward (+1) or backward (-1).
#[repr(i32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum DirectionFlag {
    Forward = 1,
    Backward = -1,
}

impl Default for DirectionFlag {
    fn default() -> Self {
        DirectionFlag::Forward
    }
}

impl TryFrom<i32> for DirectionFlag {
    type Error = CodecError;

    fn try_from(v: i32) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(DirectionFlag::Forward),
            -1 => Ok(DirectionFlag::Backward),
            _ => Err(CodecError::malformed(
                "df",
                format!("direction flag must be +1 or -1, got {}", v),
            )),
        }
    }
}

pub type MemRegGrid = [[OperandValue; MAX_NUM_MEMREGS]; MAX_NUM_MEMREGS];

/// One traced instruction.
///
/// Row `i` of `memregs` describes the addressing components of the `i`-th
/// memory operand; see `registers::memreg_role()` for the slot layout.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EntryHeader {
    /// Load address of the instruction
    pub address: u32,
    pub tid: u32,
    pub tp: TaintPropagation,
    pub eflags: u32,
    /// Condition code operation selector of the CPU emulator
    pub cc_op: u8,
    pub df: DirectionFlag,
    pub hflags: u32,
    pub ldt_base: u32,
    pub gdt_base: u32,
    pub tr_base: u32,
    pub idt_base: u32,
    /// Default operand slot, always serialized.
    pub oper: OperandValue,
    pub operands: BoundedVec<OperandValue, MAX_NUM_OPERANDS>,
    pub memregs: MemRegGrid,
    pub rawbytes: BoundedVec<u8, MAX_INSN_BYTES>,
}

impl EntryHeader {
    pub fn new(address: u32, tid: u32) -> EntryHeader {
        EntryHeader {
            address,
            tid,
            ..Default::default()
        }
    }

    pub fn inst_size(&self) -> u16 {
        self.rawbytes.len() as u16
    }

    pub fn num_operands(&self) -> usize {
        self.operands.len()
    }

    pub fn push_operand(&mut self, op: OperandValue) -> Result<(), CodecError> {
        self.operands.push(op).map_err(|_| {
            CodecError::malformed(
                "num_operands",
                format!("more than {} operands", MAX_NUM_OPERANDS),
            )
        })
    }

    pub fn set_rawbytes(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        self.rawbytes = BoundedVec::from_slice(bytes).map_err(|_| {
            CodecError::malformed(
                "inst_size",
                format!(
                    "{} instruction bytes exceed {}",
                    bytes.len(),
                    MAX_INSN_BYTES
                ),
            )
        })?;
        Ok(())
    }

    /// Default operand, then the operand list, then the memreg grid row by row.
    pub fn all_operands(&self) -> impl Iterator<Item = &OperandValue> {
        iter::once(&self.oper)
            .chain(self.operands.iter())
            .chain(self.memregs.iter().flatten())
    }

    pub fn all_operands_mut(&mut self) -> impl Iterator<Item = &mut OperandValue> {
        iter::once(&mut self.oper)
            .chain(self.operands.iter_mut())
            .chain(self.memregs.iter_mut().flat_map(|row| row.iter_mut()))
    }

    pub fn is_tainted(&self) -> bool {
        self.all_operands().any(|op| op.is_tainted())
    }

    pub fn num_tainted_operands(&self) -> usize {
        self.all_operands().filter(|op| op.is_tainted()).count()
    }

    pub fn validate(&self) -> Result<(), CodecError> {
        for op in self.all_operands() {
            op.validate()?;
        }
        Ok(())
    }

    pub fn encoded_len(&self) -> usize {
        ENTRY_HEADER_FIXED_SIZE
            + self.all_operands().map(|op| op.encoded_len()).sum::<usize>()
            + self.rawbytes.len()
    }

    /// Nothing is appended to `out` unless the whole entry is valid.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        self.validate()?;
        out.reserve(self.encoded_len());
        put_u32(out, self.address);
        put_u32(out, self.tid);
        put_u16(out, self.inst_size());
        put_u8(out, self.operands.len() as u8);
        put_u8(out, self.tp as u16 as u8);
        put_u32(out, self.eflags);
        put_u32(out, self.cc_op as u32);
        put_i32(out, self.df as i32);
        put_u32(out, self.hflags);
        put_u32(out, self.ldt_base);
        put_u32(out, self.gdt_base);
        put_u32(out, self.tr_base);
        put_u32(out, self.idt_base);
        for op in self.all_operands() {
            op.encode(out);
        }
        out.extend_from_slice(&self.rawbytes);
        Ok(())
    }

    /// Decode one entry from the front of `buf`. On failure `buf` may have been
    /// partially consumed; callers that need to retry keep their own copy.
    pub fn decode(buf: &mut &[u8]) -> Result<EntryHeader, CodecError> {
        let address = get_u32(buf, "address")?;
        let tid = get_u32(buf, "tid")?;
        let inst_size = get_u16(buf, "inst_size")? as usize;
        if inst_size > MAX_INSN_BYTES {
            return Err(CodecError::malformed(
                "inst_size",
                format!("{} instruction bytes exceed {}", inst_size, MAX_INSN_BYTES),
            ));
        }
        let num_operands = get_u8(buf, "num_operands")? as usize;
        if num_operands > MAX_NUM_OPERANDS {
            return Err(CodecError::malformed(
                "num_operands",
                format!("{} operands exceed {}", num_operands, MAX_NUM_OPERANDS),
            ));
        }
        let tp = TaintPropagation::try_from(get_u8(buf, "tp")? as u16)?;
        let eflags = get_u32(buf, "eflags")?;
        let cc_op = get_u32(buf, "cc_op")?;
        let cc_op = u8::try_from(cc_op).map_err(|_| {
            CodecError::malformed("cc_op", format!("{:#x} does not fit in 8 bits", cc_op))
        })?;
        let df = DirectionFlag::try_from(get_i32(buf, "df")?)?;
        let hflags = get_u32(buf, "hflags")?;
        let ldt_base = get_u32(buf, "ldt_base")?;
        let gdt_base = get_u32(buf, "gdt_base")?;
        let tr_base = get_u32(buf, "tr_base")?;
        let idt_base = get_u32(buf, "idt_base")?;

        let oper = OperandValue::decode(buf)?;
        let mut operands = BoundedVec::new();
        for _ in 0..num_operands {
            operands
                .push(OperandValue::decode(buf)?)
                .map_err(|_| CodecError::malformed("num_operands", "operand list full"))?;
        }
        let memregs: MemRegGrid = array_init::try_array_init(|_| {
            array_init::try_array_init(|_| OperandValue::decode(&mut *buf))
        })?;
        let rawbytes = BoundedVec::from_slice(get_bytes(buf, inst_size, "rawbytes")?)
            .map_err(|_| CodecError::malformed("inst_size", "too many instruction bytes"))?;

        Ok(EntryHeader {
            address,
            tid,
            tp,
            eflags,
            cc_op,
            df,
            hflags,
            ldt_base,
            gdt_base,
            tr_base,
            idt_base,
            oper,
            operands,
            memregs,
            rawbytes,
        })
    }

    /// Log a human-readable representation of this to `out`
    /// (defaulting to stdout), including a newline character.
    pub fn dump(&self, maybe_out: Option<&mut dyn Write>, with_operands: bool) -> io::Result<()> {
        let sout = &mut stdout();
        let out = maybe_out.unwrap_or(sout);
        write!(
            out,
            "{{\n  address:{:#010x} tid:{} tp:{:?} eflags:{:#x} cc_op:{} df:{}\n  bytes:",
            self.address, self.tid, self.tp, self.eflags, self.cc_op, self.df as i32
        )?;
        for b in &self.rawbytes {
            write!(out, " {:02x}", b)?;
        }
        writeln!(
            out,
            "\n  operands:{} tainted:{}",
            self.operands.len(),
            self.num_tainted_operands()
        )?;
        if with_operands {
            for op in self.operands.iter().filter(|op| op.length > 0) {
                write!(
                    out,
                    "    {} {} len:{} addr:{:#x} value:{:#x} taint:{:#x}",
                    op.op_type, op.acc, op.length, op.addr, op.value, op.tainted
                )?;
                for (i, rec) in op.records[..op.length as usize].iter().enumerate() {
                    for b in rec.byte_records() {
                        write!(out, " [{}:{}/{}@{}]", i, b.source, b.origin, b.offset)?;
                    }
                }
                writeln!(out)?;
            }
        }
        writeln!(out, "}}")
    }

    /// Like `dump()` but in an easily machine-parseable format.
    pub fn dump_raw(&self, maybe_out: Option<&mut dyn Write>) -> io::Result<()> {
        let sout = &mut stdout();
        let out = maybe_out.unwrap_or(sout);
        write!(
            out,
            " {:#x} {} {} {} {:#x} {} {}",
            self.address,
            self.tid,
            self.inst_size(),
            self.operands.len(),
            self.eflags,
            self.tp as u16,
            self.num_tainted_operands()
        )?;
        writeln!(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        registers::memreg_role,
        trace::{
            operand::{OpAccess, OpType},
            taint_record::{TaintByteRecord, TaintRecord, TaintSource},
        },
    };

    fn operand(i: usize) -> OperandValue {
        let length = (i % 9) as u32;
        let mut op = OperandValue::new(OpType::MemLoc, length, 0x1000 + i as u32, i as u32);
        op.acc = OpAccess::RW;
        if length > 0 {
            let rec = TaintRecord::with_bytes(
                TaintPropagation::Src,
                &[TaintByteRecord::new(TaintSource::FileIn, 2, i as u32)],
            )
            .unwrap();
            op.set_byte_taint(length as usize - 1, rec).unwrap();
        }
        op
    }

    fn entry(num_operands: usize) -> EntryHeader {
        let mut e = EntryHeader::new(0x0804_8000, 7);
        e.tp = TaintPropagation::Src;
        e.eflags = 0x246;
        e.cc_op = 0xff;
        e.df = DirectionFlag::Backward;
        e.hflags = 3;
        e.tr_base = 0x8003_f000;
        e.set_rawbytes(&[0x8b, 0x45, 0x08]).unwrap();
        e.oper = OperandValue::new(OpType::Register, 4, 116, 0x55);
        for i in 0..num_operands {
            e.push_operand(operand(i)).unwrap();
        }
        for (slot, op) in e.memregs[0].iter_mut().enumerate() {
            *op = OperandValue::new(OpType::Register, 4, 120 + slot as u32, 0);
            op.usage = memreg_role(slot);
        }
        e
    }

    fn encoded(e: &EntryHeader) -> Vec<u8> {
        let mut out = Vec::new();
        e.encode(&mut out).unwrap();
        out
    }

    #[test]
    fn reads_back_every_operand_count() {
        for n in 0..=MAX_NUM_OPERANDS {
            let e = entry(n);
            let out = encoded(&e);
            assert_eq!(e.encoded_len(), out.len());
            let mut buf = &out[..];
            assert_eq!(e, EntryHeader::decode(&mut buf).unwrap());
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn prefix_layout() {
        let out = encoded(&entry(2));
        assert_eq!(&[0x00, 0x80, 0x04, 0x08], &out[0..4]);
        assert_eq!(&[3, 0], &out[8..10]);
        assert_eq!(2, out[10]);
        assert_eq!(1, out[11]);
        assert_eq!(&[0xff, 0, 0, 0], &out[16..20]);
        assert_eq!(&[0xff, 0xff, 0xff, 0xff], &out[20..24]);
        assert_eq!(&[0x8b, 0x45, 0x08], &out[out.len() - 3..]);
    }

    #[test]
    fn too_many_operands() {
        let mut e = entry(MAX_NUM_OPERANDS);
        assert!(matches!(
            e.push_operand(operand(0)),
            Err(CodecError::MalformedEntry {
                field: "num_operands",
                ..
            })
        ));

        let mut out = encoded(&e);
        out[10] = MAX_NUM_OPERANDS as u8 + 1;
        let mut buf = &out[..];
        assert!(matches!(
            EntryHeader::decode(&mut buf),
            Err(CodecError::MalformedEntry {
                field: "num_operands",
                ..
            })
        ));
    }

    #[test]
    fn too_many_instruction_bytes() {
        let mut e = entry(0);
        assert!(e.set_rawbytes(&[0x90; MAX_INSN_BYTES + 1]).is_err());
        e.set_rawbytes(&[0x90; MAX_INSN_BYTES]).unwrap();

        let mut out = encoded(&e);
        out[8] = MAX_INSN_BYTES as u8 + 1;
        let mut buf = &out[..];
        assert!(matches!(
            EntryHeader::decode(&mut buf),
            Err(CodecError::MalformedEntry {
                field: "inst_size",
                ..
            })
        ));
    }

    #[test]
    fn direction_flag_must_be_plus_or_minus_one() {
        let mut out = encoded(&entry(0));
        out[20..24].copy_from_slice(&[0, 0, 0, 0]);
        let mut buf = &out[..];
        assert!(matches!(
            EntryHeader::decode(&mut buf),
            Err(CodecError::MalformedEntry { field: "df", .. })
        ));
        assert!(DirectionFlag::try_from(2).is_err());
    }

    #[test]
    fn cc_op_over_eight_bits() {
        let mut out = encoded(&entry(0));
        out[16..20].copy_from_slice(&[0, 1, 0, 0]);
        let mut buf = &out[..];
        assert!(matches!(
            EntryHeader::decode(&mut buf),
            Err(CodecError::MalformedEntry { field: "cc_op", .. })
        ));
    }

    #[test]
    fn invalid_operand_is_never_encoded() {
        let mut e = entry(1);
        e.memregs[4][4].tainted = 1;
        let mut out = vec![0xaa];
        assert!(matches!(
            e.encode(&mut out),
            Err(CodecError::InvalidTaintMask { length: 0, mask: 1 })
        ));
        assert_eq!(vec![0xaa], out);
    }

    #[test]
    fn truncated_entry() {
        let out = encoded(&entry(3));
        let mut buf = &out[..out.len() - 1];
        assert!(matches!(
            EntryHeader::decode(&mut buf),
            Err(CodecError::Truncated { field: "rawbytes" })
        ));
    }

    #[test]
    fn taint_counts() {
        let e = entry(3);
        // operand(0) has length 0, the other two carry one tainted byte each.
        assert!(e.is_tainted());
        assert_eq!(2, e.num_tainted_operands());
        assert_eq!(1 + 3 + MAX_NUM_MEMREGS * MAX_NUM_MEMREGS, e.all_operands().count());
    }

    #[test]
    fn dump_formats() {
        let e = entry(2);
        let mut out = Vec::new();
        e.dump(Some(&mut out), true).unwrap();
        let s = String::from_utf8(out).unwrap();
        assert!(s.contains("address:0x08048000"));
        assert!(s.contains("bytes: 8b 45 08"));
        assert!(s.contains("[0:file-in/2@1]"));

        let mut out = Vec::new();
        e.dump_raw(Some(&mut out)).unwrap();
        assert_eq!(" 0x8048000 7 3 2 0x246 1 1\n", String::from_utf8(out).unwrap());
    }
}
