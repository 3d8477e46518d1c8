use serde::Serialize;

/// Update VERSION_NUMBER when you change the layout of any record.
pub const MAGIC_NUMBER: u32 = 0xFFFF_FFFF;
pub const VERSION_NUMBER: u32 = 50;

/// Default size of the staging buffer the writer batches entries in.
pub const FILEBUFSIZE: usize = 104_857_600;

/// FNSAVE has a memory operand of 108 bytes, which is split into many operands.
pub const MAX_NUM_OPERANDS: usize = 30;
/// Max number of memregs per memory operand
pub const MAX_NUM_MEMREGS: usize = 5;
pub const MAX_NUM_TAINTBYTE_RECORDS: usize = 3;
pub const MAX_STRING_LEN: usize = 32;
/// Max length of an operand in bytes
pub const MAX_OPERAND_LEN: usize = 8;
/// Maximum number of bytes in a x86 instruction
pub const MAX_INSN_BYTES: usize = 15;

pub const TRACE_HEADER_SIZE: usize = 20;
pub const PROC_RECORD_SIZE: usize = MAX_STRING_LEN + 12;
pub const MODULE_RECORD_SIZE: usize = MAX_STRING_LEN + 8;
/// Scalar prefix of an entry. The operands, the memreg grid and the raw
/// instruction bytes follow it.
pub const ENTRY_HEADER_FIXED_SIZE: usize = 44;
/// Scalar prefix of an operand. The taint records and the access byte follow it.
pub const OPERAND_VAL_FIXED_SIZE: usize = 22;
pub const TAINT_RECORD_FIXED_SIZE: usize = 4;
pub const TAINT_BYTE_RECORD_FIXED_SIZE: usize = 12;

// One bit per operand byte in the taint bitmap.
const_assert!(MAX_OPERAND_LEN <= 64);
// num_operands travels as a single byte.
const_assert!(MAX_NUM_OPERANDS <= u8::MAX as usize);
const_assert!(MAX_INSN_BYTES <= u16::MAX as usize);
const_assert!(MAX_NUM_TAINTBYTE_RECORDS <= u16::MAX as usize);

/// Knobs for one trace writing session.
///
/// These used to be process wide switches in the instrumentation host. They
/// now belong to the session that owns the trace file.
#[derive(Copy, Clone, Debug)]
pub struct TraceOptions {
    /// Encode and validate entries, count their size, but never touch the
    /// output. Used for dry-run size accounting.
    pub do_not_write: bool,
    /// Allow `rewrite_header()` to patch an already written header.
    pub allow_header_rewrite: bool,
    /// Number of bytes staged before the writer flushes synchronously.
    pub staging_buffer_size: usize,
}

impl Default for TraceOptions {
    fn default() -> Self {
        TraceOptions {
            do_not_write: false,
            allow_header_rewrite: false,
            staging_buffer_size: FILEBUFSIZE,
        }
    }
}

/// Counters for diagnostics. Readable at any time during a session.
#[derive(Copy, Clone, Default, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceStats {
    /// Bytes handed to the underlying output.
    pub bytes_written: u64,
    /// Bytes produced by the encoder, whether written or not.
    pub bytes_encoded: u64,
    /// Instruction counter of the trace.
    pub insns_traced: u64,
    /// Instructions with at least one tainted operand byte.
    pub tainted_insns: u64,
    pub flushes: u64,
}
