use crate::{
    bounded_vec::BoundedVec,
    trace::{
        trace_error::CodecError,
        trace_stream::{
            MAX_NUM_TAINTBYTE_RECORDS, TAINT_BYTE_RECORD_FIXED_SIZE, TAINT_RECORD_FIXED_SIZE,
        },
        wire::{get_u16, get_u32, put_u16, put_u32},
    },
};
use std::{
    convert::TryFrom,
    fmt::{self, Display},
    slice,
};

/// Where a tainted byte originally came from.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TaintSource {
    NicIn = 0,
    KeyboardIn = 1,
    FileIn = 2,
    NetworkOut = 3,
    ApiTimeIn = 4,
    ApiFileIn = 5,
    ApiRegistryIn = 6,
    ApiHostnameIn = 7,
    ApiFileInfoIn = 8,
    ApiSockInfoIn = 9,
    ApiStrIn = 10,
    ApiSysIn = 11,
    HookApi = 12,
    /// Loop induction variable
    LoopIv = 13,
    Module = 14,
}

impl TaintSource {
    pub fn is_network_input(self) -> bool {
        self == TaintSource::NicIn
    }

    pub fn is_api(self) -> bool {
        (TaintSource::ApiTimeIn as u32..=TaintSource::ApiSysIn as u32).contains(&(self as u32))
    }
}

impl TryFrom<u32> for TaintSource {
    type Error = CodecError;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        use TaintSource::*;
        let source = match v {
            0 => NicIn,
            1 => KeyboardIn,
            2 => FileIn,
            3 => NetworkOut,
            4 => ApiTimeIn,
            5 => ApiFileIn,
            6 => ApiRegistryIn,
            7 => ApiHostnameIn,
            8 => ApiFileInfoIn,
            9 => ApiSockInfoIn,
            10 => ApiStrIn,
            11 => ApiSysIn,
            12 => HookApi,
            13 => LoopIv,
            14 => Module,
            _ => {
                return Err(CodecError::malformed(
                    "source",
                    format!("unknown taint source {}", v),
                ))
            }
        };
        Ok(source)
    }
}

impl Display for TaintSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaintSource::NicIn => "nic-in",
            TaintSource::KeyboardIn => "keyboard-in",
            TaintSource::FileIn => "file-in",
            TaintSource::NetworkOut => "network-out",
            TaintSource::ApiTimeIn => "api-time",
            TaintSource::ApiFileIn => "api-file",
            TaintSource::ApiRegistryIn => "api-registry",
            TaintSource::ApiHostnameIn => "api-hostname",
            TaintSource::ApiFileInfoIn => "api-file-info",
            TaintSource::ApiSockInfoIn => "api-sock-info",
            TaintSource::ApiStrIn => "api-str",
            TaintSource::ApiSysIn => "api-sys",
            TaintSource::HookApi => "hook-api",
            TaintSource::LoopIv => "loop-iv",
            TaintSource::Module => "module",
        };
        write!(f, "{}", name)
    }
}

/// How taint moved through an instruction. Advisory for the analysis layer;
/// the codec never interprets it.
#[repr(u16)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TaintPropagation {
    None = 0,
    /// Taint propagated from SRC to DST
    Src = 1,
    /// Cjmp using tainted EFLAG
    Cjmp = 2,
    /// Memory read with tainted index
    MemReadIndex = 3,
    /// Memory write with tainted index
    MemWriteIndex = 4,
    /// Instruction with REP prefix and tainted counter
    RepCounter = 5,
    Sysenter = 6,
}

impl Default for TaintPropagation {
    fn default() -> Self {
        TaintPropagation::None
    }
}

impl TryFrom<u16> for TaintPropagation {
    type Error = CodecError;

    fn try_from(v: u16) -> Result<Self, Self::Error> {
        use TaintPropagation::*;
        let tp = match v {
            0 => None,
            1 => Src,
            2 => Cjmp,
            3 => MemReadIndex,
            4 => MemWriteIndex,
            5 => RepCounter,
            6 => Sysenter,
            _ => {
                return Err(CodecError::malformed(
                    "taint_propag",
                    format!("unknown taint propagation {}", v),
                ))
            }
        };
        Ok(tp)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct TaintByteRecord {
    /// Tainted data source (network,keyboard...)
    pub source: TaintSource,
    /// Identifies a network flow, module etc. See `OriginResolver`.
    pub origin: u32,
    /// Offset in the tainted data buffer
    pub offset: u32,
}

impl TaintByteRecord {
    pub fn new(source: TaintSource, origin: u32, offset: u32) -> TaintByteRecord {
        TaintByteRecord {
            source,
            origin,
            offset,
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, self.source as u32);
        put_u32(out, self.origin);
        put_u32(out, self.offset);
    }

    pub fn decode(buf: &mut &[u8]) -> Result<TaintByteRecord, CodecError> {
        let source = TaintSource::try_from(get_u32(buf, "source")?)?;
        let origin = get_u32(buf, "origin")?;
        let offset = get_u32(buf, "offset")?;
        Ok(TaintByteRecord {
            source,
            origin,
            offset,
        })
    }
}

/// Provenance of one tainted operand byte.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct TaintRecord {
    pub taint_propag: TaintPropagation,
    bytes: BoundedVec<TaintByteRecord, MAX_NUM_TAINTBYTE_RECORDS>,
}

impl TaintRecord {
    pub fn new(taint_propag: TaintPropagation) -> TaintRecord {
        TaintRecord {
            taint_propag,
            bytes: BoundedVec::new(),
        }
    }

    pub fn with_bytes(
        taint_propag: TaintPropagation,
        bytes: &[TaintByteRecord],
    ) -> Result<TaintRecord, CodecError> {
        let bytes = BoundedVec::from_slice(bytes)
            .map_err(|_| CodecError::TooManyTaintRecords { count: bytes.len() })?;
        Ok(TaintRecord {
            taint_propag,
            bytes,
        })
    }

    pub fn add_byte_record(&mut self, rec: TaintByteRecord) -> Result<(), CodecError> {
        let count = self.bytes.len() + 1;
        self.bytes
            .push(rec)
            .map_err(|_| CodecError::TooManyTaintRecords { count })
    }

    /// How many `TaintByteRecord`s are currently used.
    pub fn num_records(&self) -> usize {
        self.bytes.len()
    }

    pub fn byte_records(&self) -> &[TaintByteRecord] {
        &self.bytes
    }

    pub fn byte_records_mut(&mut self) -> slice::IterMut<'_, TaintByteRecord> {
        self.bytes.iter_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.taint_propag == TaintPropagation::None && self.bytes.is_empty()
    }

    pub fn clear(&mut self) {
        self.taint_propag = TaintPropagation::None;
        self.bytes.clear();
    }

    pub fn encoded_len(&self) -> usize {
        TAINT_RECORD_FIXED_SIZE + self.bytes.len() * TAINT_BYTE_RECORD_FIXED_SIZE
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        put_u16(out, self.taint_propag as u16);
        put_u16(out, self.bytes.len() as u16);
        for b in &self.bytes {
            b.encode(out);
        }
    }

    pub fn decode(buf: &mut &[u8]) -> Result<TaintRecord, CodecError> {
        let taint_propag = TaintPropagation::try_from(get_u16(buf, "taint_propag")?)?;
        let num_records = get_u16(buf, "numRecords")? as usize;
        if num_records > MAX_NUM_TAINTBYTE_RECORDS {
            return Err(CodecError::TooManyTaintRecords { count: num_records });
        }
        let mut rec = TaintRecord::new(taint_propag);
        for _ in 0..num_records {
            rec.add_byte_record(TaintByteRecord::decode(buf)?)?;
        }
        Ok(rec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyboard(offset: u32) -> TaintByteRecord {
        TaintByteRecord::new(TaintSource::KeyboardIn, 1, offset)
    }

    #[test]
    fn encoded_layout() {
        let rec = TaintRecord::with_bytes(TaintPropagation::Src, &[keyboard(5)]).unwrap();
        let mut out = Vec::new();
        rec.encode(&mut out);
        assert_eq!(rec.encoded_len(), out.len());
        assert_eq!(
            vec![1, 0, 1, 0, 1, 0, 0, 0, 1, 0, 0, 0, 5, 0, 0, 0],
            out
        );
    }

    #[test]
    fn decode_reads_back_full_record() {
        let rec = TaintRecord::with_bytes(
            TaintPropagation::MemReadIndex,
            &[keyboard(0), keyboard(1), keyboard(2)],
        )
        .unwrap();
        let mut out = Vec::new();
        rec.encode(&mut out);
        let mut buf = &out[..];
        assert_eq!(rec, TaintRecord::decode(&mut buf).unwrap());
        assert!(buf.is_empty());
    }

    #[test]
    fn fourth_byte_record_is_refused() {
        let mut rec = TaintRecord::new(TaintPropagation::Src);
        for i in 0..MAX_NUM_TAINTBYTE_RECORDS as u32 {
            rec.add_byte_record(keyboard(i)).unwrap();
        }
        match rec.add_byte_record(keyboard(99)) {
            Err(CodecError::TooManyTaintRecords { count }) => {
                assert_eq!(MAX_NUM_TAINTBYTE_RECORDS + 1, count)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(MAX_NUM_TAINTBYTE_RECORDS, rec.num_records());
    }

    #[test]
    fn decode_rejects_count_over_max() {
        let mut out = Vec::new();
        put_u16(&mut out, TaintPropagation::Src as u16);
        put_u16(&mut out, (MAX_NUM_TAINTBYTE_RECORDS + 1) as u16);
        for i in 0..=MAX_NUM_TAINTBYTE_RECORDS as u32 {
            keyboard(i).encode(&mut out);
        }
        let mut buf = &out[..];
        assert!(matches!(
            TaintRecord::decode(&mut buf),
            Err(CodecError::TooManyTaintRecords { count: 4 })
        ));
    }

    #[test]
    fn decode_rejects_unknown_tags() {
        let mut out = Vec::new();
        put_u16(&mut out, 7);
        put_u16(&mut out, 0);
        let mut buf = &out[..];
        assert!(matches!(
            TaintRecord::decode(&mut buf),
            Err(CodecError::MalformedEntry {
                field: "taint_propag",
                ..
            })
        ));

        let mut out = Vec::new();
        put_u32(&mut out, 15);
        put_u32(&mut out, 0);
        put_u32(&mut out, 0);
        let mut buf = &out[..];
        assert!(matches!(
            TaintByteRecord::decode(&mut buf),
            Err(CodecError::MalformedEntry { field: "source", .. })
        ));
    }

    #[test]
    fn api_sources() {
        assert!(TaintSource::ApiRegistryIn.is_api());
        assert!(!TaintSource::HookApi.is_api());
        assert!(TaintSource::NicIn.is_network_input());
    }
}
