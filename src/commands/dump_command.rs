use crate::{
    commands::{
        exit_result::ExitResult,
        taintrace_options::{TaintraceOptions, TaintraceSubCommand},
        TaintraceCommand,
    },
    trace::{trace_error::TraceResult, trace_reader::TraceReader},
};
use std::{
    io::{self, stdout, Read, Write},
    path::PathBuf,
};

pub struct DumpCommand {
    raw_dump: bool,
    dump_operands: bool,
    trace: PathBuf,
    entry_spec: Option<(u64, Option<u64>)>,
}

impl DumpCommand {
    pub fn new(options: &TaintraceOptions) -> DumpCommand {
        match options.cmd.clone() {
            TaintraceSubCommand::Dump {
                raw_dump,
                operands,
                entry_spec,
                trace,
            } => DumpCommand {
                raw_dump,
                dump_operands: operands,
                trace,
                entry_spec,
            },
            _ => fatal!("Unexpected TaintraceSubCommand variant. Not a Dump variant!"),
        }
    }

    fn dump<R: Read>(&self, trace: &mut TraceReader<R>, f: &mut dyn Write) -> TraceResult<()> {
        if self.raw_dump {
            writeln!(f, "index address tid inst_size num_operands eflags tp tainted")?;
        } else {
            let header = *trace.header();
            writeln!(
                f,
                "// version {} processes {} gdt_base {:#x} idt_base {:#x}",
                header.version, header.n_procs, header.gdt_base, header.idt_base
            )?;
            for p in trace.procs()? {
                writeln!(
                    f,
                    "// process `{}' pid {} ldt_base {:#x}",
                    p.proc_record.name, p.proc_record.pid, p.proc_record.ldt_base
                )?;
                for m in &p.modules {
                    writeln!(
                        f,
                        "//   module `{}' base {:#x} size {:#x}",
                        m.name, m.base, m.size
                    )?;
                }
            }
        }

        self.dump_entries_matching(trace, f)
    }

    /// Dump all entries whose index falls in `self.entry_spec` to `f`.
    fn dump_entries_matching<R: Read>(
        &self,
        trace: &mut TraceReader<R>,
        f: &mut dyn Write,
    ) -> TraceResult<()> {
        let (start, end): (u64, u64) = match self.entry_spec {
            None => (0, u64::MAX),
            Some((s, None)) => (s, s),
            Some((s, Some(e))) => (s, e),
        };

        while let Some(entry) = trace.next_entry()? {
            let index = trace.entries_read() - 1;
            if end < index {
                return Ok(());
            }
            if index < start {
                continue;
            }
            if self.raw_dump {
                write!(f, "{}", index)?;
                entry.dump_raw(Some(&mut *f))?;
            } else {
                write!(f, "#{} ", index)?;
                entry.dump(Some(&mut *f), self.dump_operands)?;
            }
        }
        Ok(())
    }
}

impl TaintraceCommand for DumpCommand {
    fn run(&mut self) -> ExitResult<()> {
        let result = TraceReader::open(&self.trace).and_then(|mut trace| {
            let out = stdout();
            let mut out = io::BufWriter::new(out.lock());
            self.dump(&mut trace, &mut out)?;
            out.flush()?;
            Ok(())
        });
        match result {
            Ok(()) => ExitResult::Ok(()),
            Err(e) => ExitResult::err_from(e, 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{
        entry_header::EntryHeader,
        trace_records::{ModuleRecord, ProcRecord, TraceHeader},
        trace_stream::TraceOptions,
        trace_writer::TraceWriter,
    };

    fn trace_bytes() -> Vec<u8> {
        let mut w = TraceWriter::new(Vec::new(), TraceOptions::default());
        w.write_header(&TraceHeader::new(1, 0, 0)).unwrap();
        w.write_proc(
            &ProcRecord::new("calc.exe", 1234, 1, 0).unwrap(),
            &[ModuleRecord::new("kernel32.dll", 0x7c80_0000, 0xf_6000).unwrap()],
        )
        .unwrap();
        for i in 0..5 {
            w.write_entry(&EntryHeader::new(0x100 + i, 2)).unwrap();
        }
        w.finish().unwrap()
    }

    fn dump_to_string(cmd: &DumpCommand) -> String {
        let data = trace_bytes();
        let mut trace = TraceReader::new(&data[..]).unwrap();
        let mut out = Vec::new();
        cmd.dump(&mut trace, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn dump_range() {
        let cmd = DumpCommand {
            raw_dump: true,
            dump_operands: false,
            trace: PathBuf::new(),
            entry_spec: Some((1, Some(2))),
        };
        let s = dump_to_string(&cmd);
        let lines: Vec<&str> = s.lines().collect();
        assert_eq!(3, lines.len());
        assert!(lines[1].starts_with("1 0x101 2 "));
        assert!(lines[2].starts_with("2 0x102 2 "));
    }

    #[test]
    fn dump_human_readable() {
        let cmd = DumpCommand {
            raw_dump: false,
            dump_operands: true,
            trace: PathBuf::new(),
            entry_spec: Some((4, None)),
        };
        let s = dump_to_string(&cmd);
        assert!(s.contains("// process `calc.exe' pid 1234"));
        assert!(s.contains("//   module `kernel32.dll' base 0x7c800000"));
        assert!(s.contains("#4 {"));
        assert!(!s.contains("#3 {"));
    }
}
