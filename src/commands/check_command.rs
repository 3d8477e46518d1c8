use crate::{
    commands::{
        exit_result::ExitResult,
        taintrace_options::{TaintraceOptions, TaintraceSubCommand},
        trace_info_command::{scan_entries, EntrySummary},
        TaintraceCommand,
    },
    log::LogInfo,
    trace::{
        trace_error::{TraceError, TraceResult},
        trace_reader::TraceReader,
    },
};
use std::{
    io::{stdout, Read, Write},
    path::PathBuf,
};

pub struct CheckCommand {
    trace: PathBuf,
}

impl CheckCommand {
    pub fn new(options: &TaintraceOptions) -> CheckCommand {
        match options.cmd.clone() {
            TaintraceSubCommand::Check { trace } => CheckCommand { trace },
            _ => fatal!("Unexpected TaintraceSubCommand variant. Not a `Check` variant!"),
        }
    }

    /// Walk the process sections and every entry. On success returns what was
    /// seen; otherwise the first error along with what was good before it.
    fn check<R: Read>(
        trace: &mut TraceReader<R>,
    ) -> Result<EntrySummary, (EntrySummary, TraceError)> {
        if let Err(e) = trace.procs() {
            return Err((EntrySummary::default(), e));
        }
        match scan_entries(trace) {
            (summary, None) => Ok(summary),
            (summary, Some(e)) => Err((summary, e)),
        }
    }

    fn report(&self, summary: &EntrySummary, f: &mut dyn Write) -> TraceResult<()> {
        writeln!(
            f,
            "{}: OK, {} entries ({} tainted), {} bytes",
            self.trace.display(),
            summary.entries,
            summary.tainted_entries,
            summary.trace_bytes
        )?;
        Ok(())
    }
}

impl TaintraceCommand for CheckCommand {
    fn run(&mut self) -> ExitResult<()> {
        let mut trace = match TraceReader::open(&self.trace) {
            Ok(trace) => trace,
            Err(e) => return ExitResult::err_from(e, 1),
        };
        match Self::check(&mut trace) {
            Ok(summary) => {
                log!(LogInfo, "{} checked clean", self.trace.display());
                match self.report(&summary, &mut stdout()) {
                    Ok(()) => ExitResult::Ok(()),
                    Err(e) => ExitResult::err_from(e, 1),
                }
            }
            Err((summary, e)) => ExitResult::Err(
                format!(
                    "{}: {} ({} good entries, {} good bytes)",
                    self.trace.display(),
                    e,
                    summary.entries,
                    summary.trace_bytes
                )
                .into(),
                1,
            ),
        }
    }
}
