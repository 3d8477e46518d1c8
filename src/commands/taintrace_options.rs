use std::{error::Error, path::PathBuf};
use structopt::{clap, clap::AppSettings, StructOpt};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "taintrace",
    about = "Inspect taint annotated instruction traces",
    after_help = "Use TAINTRACE_LOG to control logging; e.g. TAINTRACE_LOG=all:warn,trace_reader:debug"
)]
#[structopt(global_settings = &[AppSettings::UnifiedHelpMessage])]
pub struct TaintraceOptions {
    /// Log at info level for every module, overriding TAINTRACE_LOG.
    #[structopt(short = "v", long)]
    pub verbose: bool,

    #[structopt(subcommand)]
    pub cmd: TaintraceSubCommand,
}

#[derive(Clone, Debug, StructOpt)]
pub enum TaintraceSubCommand {
    /// Dump the entries of a trace
    #[structopt(name = "dump")]
    Dump {
        /// Dump entries in a more easily machine-parseable
        /// format instead of the default human-readable format
        #[structopt(short = "r", long = "raw")]
        raw_dump: bool,

        /// Also dump every operand with its taint records
        #[structopt(short = "o", long = "operands")]
        operands: bool,

        /// Only dump entries START or START-END (entry indices, inclusive)
        #[structopt(short = "e", long = "entries", parse(try_from_str = parse_range))]
        entry_spec: Option<(u64, Option<u64>)>,

        /// The trace file
        trace: PathBuf,
    },

    /// Print the header, processes, modules and entry statistics in JSON format.
    #[structopt(name = "info")]
    Info {
        /// The trace file
        trace: PathBuf,
    },

    /// Decode every entry and report the first problem.
    #[structopt(name = "check")]
    Check {
        /// The trace file
        trace: PathBuf,
    },
}

fn parse_range(range_or_single: &str) -> Result<(u64, Option<u64>), Box<dyn Error>> {
    let args: Vec<&str> = range_or_single.splitn(2, '-').collect();
    let low = args[0].trim().parse::<u64>()?;
    let mut high: Option<u64> = None;
    if args.len() == 2 {
        let h = args[1].trim().parse::<u64>()?;
        if h < low {
            return Err(Box::new(clap::Error::with_description(
                &format!("Empty entry range `{}'", range_or_single),
                clap::ErrorKind::InvalidValue,
            )));
        }
        high = Some(h);
    }
    Ok((low, high))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges() {
        assert_eq!((5, None), parse_range("5").unwrap());
        assert_eq!((5, Some(9)), parse_range("5-9").unwrap());
        assert!(parse_range("9-5").is_err());
        assert!(parse_range("x").is_err());
    }

    #[test]
    fn dump_command_line() {
        let options =
            TaintraceOptions::from_iter(&["taintrace", "dump", "-r", "-e", "3-4", "t.trace"]);
        match options.cmd {
            TaintraceSubCommand::Dump {
                raw_dump,
                operands,
                entry_spec,
                trace,
            } => {
                assert!(raw_dump);
                assert!(!operands);
                assert_eq!(Some((3, Some(4))), entry_spec);
                assert_eq!(PathBuf::from("t.trace"), trace);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
