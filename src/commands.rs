use exit_result::ExitResult;

pub mod check_command;
pub mod dump_command;
pub mod exit_result;
pub mod taintrace_options;
pub mod trace_info_command;

pub trait TaintraceCommand {
    fn run(&mut self) -> ExitResult<()>;
}
