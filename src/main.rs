use structopt::StructOpt;
use taintrace::{
    commands::{
        check_command::CheckCommand,
        dump_command::DumpCommand,
        exit_result::ExitResult,
        taintrace_options::{TaintraceOptions, TaintraceSubCommand},
        trace_info_command::TraceInfoCommand,
        TaintraceCommand,
    },
    log::{set_all_logging, LogInfo},
};

fn main() -> ExitResult<()> {
    let options = TaintraceOptions::from_args();
    if options.verbose {
        set_all_logging(LogInfo);
    }

    match &options.cmd {
        TaintraceSubCommand::Dump { .. } => DumpCommand::new(&options).run(),
        TaintraceSubCommand::Info { .. } => TraceInfoCommand::new(&options).run(),
        TaintraceSubCommand::Check { .. } => CheckCommand::new(&options).run(),
    }
}
