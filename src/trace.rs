pub mod entry_header;
pub mod operand;
pub mod taint_annotation;
pub mod taint_record;
pub mod trace_error;
pub mod trace_reader;
pub mod trace_records;
pub mod trace_stream;
pub mod trace_writer;
mod wire;
