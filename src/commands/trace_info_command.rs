use super::exit_result::ExitResult;
use crate::{
    commands::{
        taintrace_options::{TaintraceOptions, TaintraceSubCommand},
        TaintraceCommand,
    },
    trace::{
        trace_error::TraceError,
        trace_reader::TraceReader,
        trace_records::{ProcSection, TraceHeader},
    },
};
use serde::Serialize;
use std::{io::Read, path::PathBuf};

pub struct TraceInfoCommand {
    trace: PathBuf,
}

impl TraceInfoCommand {
    pub fn new(options: &TaintraceOptions) -> TraceInfoCommand {
        match options.cmd.clone() {
            TaintraceSubCommand::Info { trace } => TraceInfoCommand { trace },
            _ => fatal!("Unexpected TaintraceSubCommand variant. Not an `Info` variant!"),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TraceInfo {
    header: TraceHeader,
    processes: Vec<ProcSection>,
    #[serde(flatten)]
    entries: EntrySummary,
    /// First problem found while scanning, if any.
    error: Option<String>,
}

/// What a full scan of the entries found.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntrySummary {
    pub entries: u64,
    pub tainted_entries: u64,
    pub operands: u64,
    pub tainted_operands: u64,
    /// Bytes covered by the header, the process sections and every complete
    /// entry.
    pub trace_bytes: u64,
}

/// Decode entries until the end of the trace or the first error.
pub fn scan_entries<R: Read>(trace: &mut TraceReader<R>) -> (EntrySummary, Option<TraceError>) {
    let mut summary = EntrySummary::default();
    let error = loop {
        match trace.next_entry() {
            Ok(Some(entry)) => {
                summary.entries += 1;
                summary.operands += entry.num_operands() as u64;
                let tainted = entry.num_tainted_operands() as u64;
                summary.tainted_operands += tainted;
                if tainted > 0 {
                    summary.tainted_entries += 1;
                }
            }
            Ok(None) => break None,
            Err(e) => break Some(e),
        }
    };
    summary.trace_bytes = trace.offset();
    (summary, error)
}

impl TaintraceCommand for TraceInfoCommand {
    fn run(&mut self) -> ExitResult<()> {
        let mut trace = match TraceReader::open(&self.trace) {
            Ok(trace) => trace,
            Err(e) => return ExitResult::err_from(e, 1),
        };
        let header = *trace.header();
        let processes = match trace.procs() {
            Ok(procs) => procs.to_vec(),
            Err(e) => return ExitResult::err_from(e, 1),
        };
        let (entries, error) = scan_entries(&mut trace);
        let info = TraceInfo {
            header,
            processes,
            entries,
            error: error.map(|e| e.to_string()),
        };

        match serde_json::to_string(&info) {
            Ok(serialized) => {
                println!("{}", serialized);
                ExitResult::Ok(())
            }
            Err(e) => ExitResult::err_from(e, 1),
        }
    }
}
