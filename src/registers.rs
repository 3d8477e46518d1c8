use crate::trace::{
    operand::{OpType, OpUsage, OperandValue},
    trace_stream::MAX_NUM_MEMREGS,
};
use std::convert::TryFrom;

/// x86 register ids as they appear in the `addr` field of register operands.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Register {
    Es = 100,
    Cs = 101,
    Ss = 102,
    Ds = 103,
    Fs = 104,
    Gs = 105,

    Eax = 116,
    Ecx = 117,
    Edx = 118,
    Ebx = 119,
    Esp = 120,
    Ebp = 121,
    Esi = 122,
    Edi = 123,

    Al = 124,
    Cl = 125,
    Dl = 126,
    Bl = 127,
    Ah = 128,
    Ch = 129,
    Dh = 130,
    Bh = 131,

    Ax = 132,
    Cx = 133,
    Dx = 134,
    Bx = 135,
    Sp = 136,
    Bp = 137,
    Si = 138,
    Di = 139,
}

use Register::*;

const FULL_REGISTERS: [Register; 8] = [Eax, Ecx, Edx, Ebx, Esp, Ebp, Esi, Edi];

impl TryFrom<u32> for Register {
    type Error = u32;

    fn try_from(id: u32) -> Result<Self, Self::Error> {
        let r = match id {
            100 => Es,
            101 => Cs,
            102 => Ss,
            103 => Ds,
            104 => Fs,
            105 => Gs,
            116..=123 => FULL_REGISTERS[(id - 116) as usize],
            124 => Al,
            125 => Cl,
            126 => Dl,
            127 => Bl,
            128 => Ah,
            129 => Ch,
            130 => Dh,
            131 => Bh,
            132 => Ax,
            133 => Cx,
            134 => Dx,
            135 => Bx,
            136 => Sp,
            137 => Bp,
            138 => Si,
            139 => Di,
            _ => return Err(id),
        };
        Ok(r)
    }
}

impl Register {
    pub fn id(self) -> u32 {
        self as u32
    }

    pub fn is_segment(self) -> bool {
        (Es as u32..=Gs as u32).contains(&(self as u32))
    }

    /// The 32-bit register this one is part of. Segment registers are their
    /// own parent.
    pub fn parent(self) -> Register {
        let id = self as u32;
        match id {
            124..=127 => FULL_REGISTERS[(id - 124) as usize],
            128..=131 => FULL_REGISTERS[(id - 128) as usize],
            132..=139 => FULL_REGISTERS[(id - 132) as usize],
            _ => self,
        }
    }

    /// Byte position of this register inside its parent.
    pub fn offset_in_parent(self) -> u32 {
        match self {
            Ah | Ch | Dh | Bh => 1,
            _ => 0,
        }
    }
}

/// Static register -> usage table. Ids we don't know map to `Unknown`.
pub fn register_role(reg_id: u32) -> OpUsage {
    match Register::try_from(reg_id) {
        Ok(Esp) | Ok(Sp) => OpUsage::Esp,
        Ok(Ecx) | Ok(Cx) | Ok(Cl) | Ok(Ch) => OpUsage::Counter,
        Ok(r) if r.is_segment() => OpUsage::MemSegment,
        _ => OpUsage::Unknown,
    }
}

/// Usage of the operand in slot `slot` of a memreg grid row.
///
/// slot 0 -> segment register, 1 -> base register, 2 -> index register,
/// 3 and 4 -> segment descriptors.
pub fn memreg_role(slot: usize) -> OpUsage {
    match slot {
        0 => OpUsage::MemSegment,
        1 => OpUsage::MemBase,
        2 => OpUsage::MemIndex,
        3 => OpUsage::MemSegEnt0,
        4 => OpUsage::MemSegEnt1,
        _ => OpUsage::Unknown,
    }
}

const_assert_eq!(MAX_NUM_MEMREGS, 5);

/// Register id of the full register a register operand lives in.
pub fn register_number(op: &OperandValue) -> Option<u32> {
    if op.op_type != OpType::Register {
        return None;
    }
    Register::try_from(op.addr).ok().map(|r| r.parent().id())
}

/// Byte offset of the operand's first taint record slot.
///
/// Registers: position inside the 32-bit register (`ah` starts at byte 1 of
/// `eax`). Memory: position of the effective address inside its 4 byte
/// granule. Everything else starts at 0.
pub fn operand_offset(op: &OperandValue) -> u32 {
    match op.op_type {
        OpType::Register => Register::try_from(op.addr)
            .map(|r| r.offset_in_parent())
            .unwrap_or(0),
        OpType::MemLoc | OpType::MemAddress => op.addr & 3,
        _ => 0,
    }
}
