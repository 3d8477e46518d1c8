use crate::trace::{
    taint_record::TaintRecord,
    trace_error::CodecError,
    trace_stream::{MAX_OPERAND_LEN, OPERAND_VAL_FIXED_SIZE},
    wire::{get_u32, get_u64, get_u8, put_u32, put_u64, put_u8},
};
use bit_field::BitField;
use std::{
    convert::TryFrom,
    fmt::{self, Display},
};

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum OpType {
    None = 0,
    Register = 1,
    MemLoc = 2,
    Immediate = 3,
    Jump = 4,
    FloatRegister = 5,
    MemAddress = 6,
    MmxRegister = 7,
    XmmRegister = 8,
    FloatControlRegister = 9,
    Displacement = 10,
}

impl OpType {
    pub fn is_memory(self) -> bool {
        self == OpType::MemLoc || self == OpType::MemAddress
    }
}

impl Default for OpType {
    fn default() -> Self {
        OpType::None
    }
}

impl TryFrom<u8> for OpType {
    type Error = CodecError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        let t = match v {
            0 => OpType::None,
            1 => OpType::Register,
            2 => OpType::MemLoc,
            3 => OpType::Immediate,
            4 => OpType::Jump,
            5 => OpType::FloatRegister,
            6 => OpType::MemAddress,
            7 => OpType::MmxRegister,
            8 => OpType::XmmRegister,
            9 => OpType::FloatControlRegister,
            10 => OpType::Displacement,
            _ => return Err(CodecError::malformed("type", format!("unknown operand type {}", v))),
        };
        Ok(t)
    }
}

impl Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpType::None => "none",
            OpType::Register => "reg",
            OpType::MemLoc => "mem",
            OpType::Immediate => "imm",
            OpType::Jump => "jmp",
            OpType::FloatRegister => "freg",
            OpType::MemAddress => "memaddr",
            OpType::MmxRegister => "mmx",
            OpType::XmmRegister => "xmm",
            OpType::FloatControlRegister => "fctrl",
            OpType::Displacement => "disp",
        };
        write!(f, "{}", name)
    }
}

/// Role an operand plays for the instruction. See `registers::register_role()`.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum OpUsage {
    Unknown = 0,
    Esp = 1,
    Counter = 2,
    MemBase = 3,
    MemIndex = 4,
    MemSegment = 5,
    MemSegEnt0 = 6,
    MemSegEnt1 = 7,
}

impl Default for OpUsage {
    fn default() -> Self {
        OpUsage::Unknown
    }
}

impl TryFrom<u8> for OpUsage {
    type Error = CodecError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        let u = match v {
            0 => OpUsage::Unknown,
            1 => OpUsage::Esp,
            2 => OpUsage::Counter,
            3 => OpUsage::MemBase,
            4 => OpUsage::MemIndex,
            5 => OpUsage::MemSegment,
            6 => OpUsage::MemSegEnt0,
            7 => OpUsage::MemSegEnt1,
            _ => return Err(CodecError::malformed("usage", format!("unknown operand usage {}", v))),
        };
        Ok(u)
    }
}

/// Read/write/conditional access combinations.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum OpAccess {
    Unknown = 0,
    RW = 1,
    R = 2,
    W = 3,
    RCW = 4,
    CW = 5,
    CRW = 6,
    CR = 7,
}

impl OpAccess {
    pub fn reads(self) -> bool {
        match self {
            OpAccess::RW | OpAccess::R | OpAccess::RCW | OpAccess::CRW | OpAccess::CR => true,
            OpAccess::Unknown | OpAccess::W | OpAccess::CW => false,
        }
    }

    pub fn writes(self) -> bool {
        match self {
            OpAccess::RW | OpAccess::W | OpAccess::RCW | OpAccess::CW | OpAccess::CRW => true,
            OpAccess::Unknown | OpAccess::R | OpAccess::CR => false,
        }
    }
}

impl Default for OpAccess {
    fn default() -> Self {
        OpAccess::Unknown
    }
}

impl TryFrom<u8> for OpAccess {
    type Error = CodecError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        let a = match v {
            0 => OpAccess::Unknown,
            1 => OpAccess::RW,
            2 => OpAccess::R,
            3 => OpAccess::W,
            4 => OpAccess::RCW,
            5 => OpAccess::CW,
            6 => OpAccess::CRW,
            7 => OpAccess::CR,
            _ => return Err(CodecError::malformed("acc", format!("unknown operand access {}", v))),
        };
        Ok(a)
    }
}

impl Display for OpAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpAccess::Unknown => "?",
            OpAccess::RW => "rw",
            OpAccess::R => "r",
            OpAccess::W => "w",
            OpAccess::RCW => "rcw",
            OpAccess::CW => "cw",
            OpAccess::CRW => "crw",
            OpAccess::CR => "cr",
        };
        write!(f, "{}", name)
    }
}

/// One operand of a traced instruction.
///
/// `records` is positional: slot `i` describes byte `i` of the operand.
/// Only the first `length` slots travel in the trace, so slots at or beyond
/// `length` must stay empty.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct OperandValue {
    pub op_type: OpType,
    pub usage: OpUsage,
    /// Length in bytes, at most `MAX_OPERAND_LEN`
    pub length: u32,
    /// Effective address for memory operands, register id for registers.
    pub addr: u32,
    pub value: u32,
    /// Bit `i` set means byte `i` is tainted.
    pub tainted: u64,
    pub records: [TaintRecord; MAX_OPERAND_LEN],
    pub acc: OpAccess,
}

impl OperandValue {
    pub fn new(op_type: OpType, length: u32, addr: u32, value: u32) -> OperandValue {
        OperandValue {
            op_type,
            length,
            addr,
            value,
            ..Default::default()
        }
    }

    pub fn is_tainted(&self) -> bool {
        self.tainted != 0
    }

    pub fn is_byte_tainted(&self, i: usize) -> bool {
        i < MAX_OPERAND_LEN && self.tainted.get_bit(i)
    }

    /// Mark byte `i` tainted and attach its provenance.
    pub fn set_byte_taint(&mut self, i: usize, rec: TaintRecord) -> Result<(), CodecError> {
        if i >= self.length as usize || i >= MAX_OPERAND_LEN {
            return Err(CodecError::InvalidTaintMask {
                length: self.length,
                mask: self.tainted | (1u64 << i.min(63)),
            });
        }
        self.tainted.set_bit(i, true);
        self.records[i] = rec;
        Ok(())
    }

    pub fn clear_taint(&mut self) {
        self.tainted = 0;
        for r in self.records.iter_mut() {
            r.clear();
        }
    }

    /// Check everything that decoding would refuse, so a bad operand never
    /// reaches the output.
    pub fn validate(&self) -> Result<(), CodecError> {
        if self.length as usize > MAX_OPERAND_LEN {
            return Err(CodecError::malformed(
                "length",
                format!("operand length {} exceeds {}", self.length, MAX_OPERAND_LEN),
            ));
        }
        check_taint_mask(self.length, self.tainted)?;
        check_clean_bytes(self.tainted, &self.records[..self.length as usize])?;
        let length = self.length as usize;
        if let Some(pos) = self.records[length..].iter().position(|r| !r.is_empty()) {
            return Err(CodecError::malformed(
                "records",
                format!(
                    "taint record at byte {} is beyond operand length {}",
                    length + pos,
                    length
                ),
            ));
        }
        Ok(())
    }

    pub fn encoded_len(&self) -> usize {
        let records: usize = self.records[..self.length as usize]
            .iter()
            .map(|r| r.encoded_len())
            .sum();
        OPERAND_VAL_FIXED_SIZE + records + 1
    }

    /// Caller must have run `validate()`.
    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        put_u8(out, self.op_type as u8);
        put_u8(out, self.usage as u8);
        put_u32(out, self.length);
        put_u32(out, self.addr);
        put_u32(out, self.value);
        put_u64(out, self.tainted);
        for r in &self.records[..self.length as usize] {
            r.encode(out);
        }
        put_u8(out, self.acc as u8);
    }

    pub fn decode(buf: &mut &[u8]) -> Result<OperandValue, CodecError> {
        let op_type = OpType::try_from(get_u8(buf, "type")?)?;
        let usage = OpUsage::try_from(get_u8(buf, "usage")?)?;
        let length = get_u32(buf, "length")?;
        if length as usize > MAX_OPERAND_LEN {
            return Err(CodecError::malformed(
                "length",
                format!("operand length {} exceeds {}", length, MAX_OPERAND_LEN),
            ));
        }
        let addr = get_u32(buf, "addr")?;
        let value = get_u32(buf, "value")?;
        let tainted = get_u64(buf, "tainted")?;
        check_taint_mask(length, tainted)?;

        let mut records: [TaintRecord; MAX_OPERAND_LEN] = Default::default();
        for r in records.iter_mut().take(length as usize) {
            *r = TaintRecord::decode(buf)?;
        }
        check_clean_bytes(tainted, &records[..length as usize])?;
        let acc = OpAccess::try_from(get_u8(buf, "acc")?)?;

        Ok(OperandValue {
            op_type,
            usage,
            length,
            addr,
            value,
            tainted,
            records,
            acc,
        })
    }
}

fn check_taint_mask(length: u32, mask: u64) -> Result<(), CodecError> {
    let length_bits = length as usize;
    if length_bits < 64 && mask.get_bits(length_bits..64) != 0 {
        return Err(CodecError::InvalidTaintMask { length, mask });
    }
    Ok(())
}

/// A byte whose mask bit is clear carries no taint record.
fn check_clean_bytes(mask: u64, records: &[TaintRecord]) -> Result<(), CodecError> {
    match (0..records.len()).find(|&i| !mask.get_bit(i) && !records[i].is_empty()) {
        Some(i) => Err(CodecError::malformed(
            "records",
            format!("taint record at byte {} which is not tainted", i),
        )),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::taint_record::{TaintByteRecord, TaintPropagation, TaintSource};

    fn tainted_dword() -> OperandValue {
        let mut op = OperandValue::new(OpType::MemLoc, 4, 0x0804_a000, 0xdead_beef);
        op.acc = OpAccess::R;
        let rec = TaintRecord::with_bytes(
            TaintPropagation::Src,
            &[TaintByteRecord::new(TaintSource::NicIn, 10_000, 3)],
        )
        .unwrap();
        op.set_byte_taint(1, rec).unwrap();
        op
    }

    #[test]
    fn operand_reads_back() {
        let op = tainted_dword();
        op.validate().unwrap();
        let mut out = Vec::new();
        op.encode(&mut out);
        assert_eq!(op.encoded_len(), out.len());
        let mut buf = &out[..];
        assert_eq!(op, OperandValue::decode(&mut buf).unwrap());
        assert!(buf.is_empty());
    }

    #[test]
    fn only_length_records_are_serialized() {
        let op = OperandValue::new(OpType::Register, 2, 116, 7);
        let mut out = Vec::new();
        op.encode(&mut out);
        assert_eq!(OPERAND_VAL_FIXED_SIZE + 2 * 4 + 1, out.len());
    }

    #[test]
    fn taint_mask_beyond_length_is_rejected() {
        let mut op = OperandValue::new(OpType::Register, 3, 116, 0);
        op.tainted = 1 << 3;
        assert!(matches!(
            op.validate(),
            Err(CodecError::InvalidTaintMask { length: 3, .. })
        ));

        // Bypass validation to check the decoder on its own.
        let mut out = Vec::new();
        op.encode(&mut out);
        let mut buf = &out[..];
        assert!(matches!(
            OperandValue::decode(&mut buf),
            Err(CodecError::InvalidTaintMask {
                length: 3,
                mask: 8
            })
        ));
    }

    #[test]
    fn length_over_max_is_rejected() {
        let mut op = OperandValue::new(OpType::MemLoc, 0, 0, 0);
        op.length = MAX_OPERAND_LEN as u32 + 1;
        assert!(matches!(
            op.validate(),
            Err(CodecError::MalformedEntry { field: "length", .. })
        ));
    }

    #[test]
    fn stray_record_beyond_length_is_rejected() {
        let mut op = OperandValue::new(OpType::MemLoc, 2, 0, 0);
        op.records[5] = TaintRecord::new(TaintPropagation::Src);
        assert!(matches!(
            op.validate(),
            Err(CodecError::MalformedEntry { field: "records", .. })
        ));
    }

    #[test]
    fn record_on_clean_byte_is_rejected() {
        let mut op = tainted_dword();
        op.tainted = 0;
        assert!(matches!(
            op.validate(),
            Err(CodecError::MalformedEntry { field: "records", .. })
        ));

        let mut out = Vec::new();
        op.encode(&mut out);
        let mut buf = &out[..];
        assert!(matches!(
            OperandValue::decode(&mut buf),
            Err(CodecError::MalformedEntry { field: "records", .. })
        ));
    }

    #[test]
    fn set_byte_taint_checks_position() {
        let mut op = OperandValue::new(OpType::Register, 1, 124, 0);
        assert!(op
            .set_byte_taint(1, TaintRecord::new(TaintPropagation::Src))
            .is_err());
        assert!(!op.is_tainted());
        op.set_byte_taint(0, TaintRecord::new(TaintPropagation::Src))
            .unwrap();
        assert!(op.is_byte_tainted(0));
        op.clear_taint();
        assert!(!op.is_tainted());
        assert!(op.records[0].is_empty());
    }

    #[test]
    fn every_length_up_to_max() {
        for length in 0..=MAX_OPERAND_LEN as u32 {
            let mut op = OperandValue::new(OpType::MemLoc, length, 0x1000, 0);
            for i in 0..length as usize {
                op.set_byte_taint(i, TaintRecord::new(TaintPropagation::Src))
                    .unwrap();
            }
            op.validate().unwrap();
            let mut out = Vec::new();
            op.encode(&mut out);
            let mut buf = &out[..];
            assert_eq!(op, OperandValue::decode(&mut buf).unwrap());
        }
    }

    #[test]
    fn access_modes() {
        assert!(OpAccess::RW.reads() && OpAccess::RW.writes());
        assert!(OpAccess::CR.reads() && !OpAccess::CR.writes());
        assert!(!OpAccess::Unknown.reads());
    }
}
