use crate::{taint_origin::OriginError, trace::trace_stream::MAX_NUM_TAINTBYTE_RECORDS};
use std::io;

/// Failure while encoding or decoding a single entry (or one of its nested
/// operands and taint records). Does not know where in the stream it happened;
/// the trace container wraps it in `TraceError::Entry` with the entry index.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed entry: field `{field}': {detail}")]
    MalformedEntry { field: &'static str, detail: String },

    #[error("{count} taint byte records in one taint record (max {})", MAX_NUM_TAINTBYTE_RECORDS)]
    TooManyTaintRecords { count: usize },

    #[error("taint mask {mask:#x} has bits set at or above operand length {length}")]
    InvalidTaintMask { length: u32, mask: u64 },

    #[error("ran out of data while reading field `{field}'")]
    Truncated { field: &'static str },
}

impl CodecError {
    pub fn malformed(field: &'static str, detail: impl ToString) -> CodecError {
        CodecError::MalformedEntry {
            field,
            detail: detail.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("not a trace file: magic number is {found:#010x}")]
    BadMagic { found: u32 },

    #[error("unsupported trace version {found} (this build reads version {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("process {pid}: declared {declared} modules but {actual} present")]
    CountMismatch {
        pid: u32,
        declared: u32,
        actual: u32,
    },

    #[error("malformed {section}: {detail}")]
    MalformedRecord {
        section: &'static str,
        detail: String,
    },

    #[error("entry {index}: {source}")]
    Entry {
        index: u64,
        #[source]
        source: CodecError,
    },

    #[error("trace truncated after {entries} complete entries at byte offset {offset}")]
    TruncatedStream { entries: u64, offset: u64 },

    #[error("{section} already written")]
    AlreadyWritten { section: &'static str },

    #[error("out of order write: expected {expected}")]
    OutOfOrder { expected: &'static str },

    #[error(transparent)]
    Origin(#[from] OriginError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TraceError {
    pub fn at_entry(index: u64, source: CodecError) -> TraceError {
        TraceError::Entry { index, source }
    }

    /// The codec level error, if this error concerns a single entry.
    pub fn codec_error(&self) -> Option<&CodecError> {
        match self {
            TraceError::Entry { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type TraceResult<T> = Result<T, TraceError>;
