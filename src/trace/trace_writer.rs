use crate::{
    log::{LogDebug, LogError, LogInfo},
    trace::{
        entry_header::EntryHeader,
        trace_error::{TraceError, TraceResult},
        trace_records::{ModuleRecord, ProcRecord, TraceHeader},
        trace_stream::{TraceOptions, TraceStats, TRACE_HEADER_SIZE},
    },
};
use nix::fcntl::{flock, FlockArg::LockExclusiveNonblock};
use std::{
    fs::{File, OpenOptions},
    io::{self, Seek, SeekFrom, Write},
    os::unix::io::AsRawFd,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

/// Writing takes a trace through a fixed sequence of sections:
///
/// -- Nothing has been written. Only `write_header()` is accepted.
/// -- The header announced `n_procs` process sections. Until that many
/// `write_proc()` calls succeeded, only `write_proc()` is accepted.
/// -- Any number of `write_entry()` calls.
///
/// Every record is encoded into a scratch buffer first and only reaches the
/// staging buffer once it is known to be valid, so a rejected record leaves
/// the stream exactly as it was.
///
/// Staged bytes are handed to the output when the staging buffer would
/// overflow, on `flush()`, on `finish()` and when the writer is dropped.
pub struct TraceWriter<W: Write> {
    /// `None` only after `finish()`
    out: Option<W>,
    options: TraceOptions,
    staging: Vec<u8>,
    scratch: Vec<u8>,
    header: Option<TraceHeader>,
    procs_written: u32,
    stats: TraceStats,
}

impl TraceWriter<File> {
    /// Create (or truncate) the trace at `path`.
    ///
    /// The file is flock()ed exclusively for as long as the writer lives, so a
    /// second writer on the same trace fails instead of interleaving output.
    pub fn create<P: AsRef<Path>>(path: P, options: TraceOptions) -> TraceResult<TraceWriter<File>> {
        let path = path.as_ref();
        let f = OpenOptions::new().write(true).create(true).open(path)?;
        if let Err(e) = flock(f.as_raw_fd(), LockExclusiveNonblock) {
            log!(LogError, "Unable to lock {:?}", path);
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("{:?} is locked by another writer: {}", path, e),
            )
            .into());
        }
        // Only truncate once we know nobody else is writing to it.
        f.set_len(0)?;
        log!(LogInfo, "Writing trace to {:?}", path);
        Ok(TraceWriter::new(f, options))
    }
}

impl<W: Write> TraceWriter<W> {
    pub fn new(out: W, options: TraceOptions) -> TraceWriter<W> {
        TraceWriter {
            out: Some(out),
            options,
            staging: Vec::new(),
            scratch: Vec::new(),
            header: None,
            procs_written: 0,
            stats: TraceStats::default(),
        }
    }

    pub fn options(&self) -> &TraceOptions {
        &self.options
    }

    pub fn stats(&self) -> TraceStats {
        self.stats
    }

    /// Global instruction counter.
    pub fn insns_traced(&self) -> u64 {
        self.stats.insns_traced
    }

    pub fn header(&self) -> Option<&TraceHeader> {
        self.header.as_ref()
    }

    pub fn procs_written(&self) -> u32 {
        self.procs_written
    }

    pub fn write_header(&mut self, header: &TraceHeader) -> TraceResult<()> {
        if self.header.is_some() {
            return Err(TraceError::AlreadyWritten {
                section: "trace header",
            });
        }
        self.scratch.clear();
        header.encode(&mut self.scratch);
        self.stage_scratch()?;
        self.header = Some(*header);
        log!(
            LogInfo,
            "trace header: {} processes, gdt {:#x}, idt {:#x}",
            header.n_procs,
            header.gdt_base,
            header.idt_base
        );
        Ok(())
    }

    /// Write one process record followed by its modules.
    pub fn write_proc(&mut self, proc_record: &ProcRecord, modules: &[ModuleRecord]) -> TraceResult<()> {
        let n_procs = match &self.header {
            None => {
                return Err(TraceError::OutOfOrder {
                    expected: "trace header",
                })
            }
            Some(h) => h.n_procs,
        };
        if self.procs_written >= n_procs {
            return Err(TraceError::AlreadyWritten {
                section: "every announced process section",
            });
        }
        if proc_record.n_mods as usize != modules.len() {
            return Err(TraceError::CountMismatch {
                pid: proc_record.pid,
                declared: proc_record.n_mods,
                actual: modules.len() as u32,
            });
        }

        self.scratch.clear();
        proc_record.encode(&mut self.scratch)?;
        for m in modules {
            m.encode(&mut self.scratch)?;
        }
        self.stage_scratch()?;
        self.procs_written += 1;
        log!(
            LogInfo,
            "process `{}' pid {} with {} modules",
            proc_record.name,
            proc_record.pid,
            modules.len()
        );
        Ok(())
    }

    /// Append one entry and bump the instruction counter. Returns the number of
    /// bytes the entry takes in the trace.
    pub fn write_entry(&mut self, entry: &EntryHeader) -> TraceResult<usize> {
        self.expect_entries()?;
        self.scratch.clear();
        if let Err(e) = entry.encode(&mut self.scratch) {
            self.scratch.clear();
            return Err(TraceError::at_entry(self.stats.insns_traced, e));
        }
        let len = self.scratch.len();
        self.stage_scratch()?;
        self.stats.insns_traced += 1;
        if entry.is_tainted() {
            self.stats.tainted_insns += 1;
        }
        Ok(len)
    }

    /// Hand everything staged to the output and flush it.
    pub fn flush(&mut self) -> TraceResult<()> {
        self.flush_staging()?;
        if let Some(out) = self.out.as_mut() {
            out.flush()?;
        }
        Ok(())
    }

    /// Flush and give back the output.
    pub fn finish(mut self) -> TraceResult<W> {
        self.flush()?;
        log!(
            LogInfo,
            "trace finished: {} instructions, {} bytes",
            self.stats.insns_traced,
            self.stats.bytes_written
        );
        let out = self.out.take();
        out.ok_or_else(|| io::Error::new(io::ErrorKind::Other, "trace output already taken").into())
    }

    fn expect_entries(&self) -> TraceResult<()> {
        match &self.header {
            None => Err(TraceError::OutOfOrder {
                expected: "trace header",
            }),
            Some(h) if self.procs_written < h.n_procs => Err(TraceError::OutOfOrder {
                expected: "process record",
            }),
            Some(_) => Ok(()),
        }
    }

    /// Move the scratch buffer into the staging buffer, flushing first if it
    /// would not fit.
    fn stage_scratch(&mut self) -> TraceResult<()> {
        if !self.options.do_not_write {
            if !self.staging.is_empty()
                && self.staging.len() + self.scratch.len() > self.options.staging_buffer_size
            {
                self.flush_staging()?;
            }
            self.staging.extend_from_slice(&self.scratch);
        }
        self.stats.bytes_encoded += self.scratch.len() as u64;
        self.scratch.clear();
        Ok(())
    }

    fn flush_staging(&mut self) -> TraceResult<()> {
        if self.staging.is_empty() {
            return Ok(());
        }
        let pending = self.staging.len();
        if let Some(out) = self.out.as_mut() {
            // Whatever the output accepted leaves the staging buffer at once,
            // so a failed flush can be retried without repeating bytes.
            while !self.staging.is_empty() {
                match out.write(&self.staging) {
                    Ok(0) => {
                        return Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "trace output accepts no more bytes",
                        )
                        .into())
                    }
                    Ok(n) => {
                        self.staging.drain(..n);
                        self.stats.bytes_written += n as u64;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        } else {
            self.staging.clear();
        }
        log!(LogDebug, "flushed {} bytes", pending);
        self.stats.flushes += 1;
        Ok(())
    }
}

impl<W: Write + Seek> TraceWriter<W> {
    /// Patch the already written header in place.
    ///
    /// `header.n_procs` may not drop below the number of process sections
    /// already written, and once entries follow the process sections it cannot
    /// announce more of them.
    pub fn rewrite_header(&mut self, header: &TraceHeader) -> TraceResult<()> {
        if self.header.is_none() {
            return Err(TraceError::OutOfOrder {
                expected: "trace header",
            });
        }
        if !self.options.allow_header_rewrite {
            return Err(TraceError::AlreadyWritten {
                section: "trace header",
            });
        }
        if header.n_procs < self.procs_written
            || (self.stats.insns_traced > 0 && header.n_procs != self.procs_written)
        {
            return Err(TraceError::MalformedRecord {
                section: "trace header",
                detail: format!(
                    "cannot announce {} processes: {} written, {} entries follow",
                    header.n_procs, self.procs_written, self.stats.insns_traced
                ),
            });
        }

        if !self.options.do_not_write {
            self.flush_staging()?;
            let mut raw = Vec::with_capacity(TRACE_HEADER_SIZE);
            header.encode(&mut raw);
            if let Some(out) = self.out.as_mut() {
                out.seek(SeekFrom::Start(0))?;
                out.write_all(&raw)?;
                out.seek(SeekFrom::End(0))?;
            }
        }
        self.header = Some(*header);
        log!(LogInfo, "trace header rewritten: {} processes", header.n_procs);
        Ok(())
    }
}

impl<W: Write> Drop for TraceWriter<W> {
    fn drop(&mut self) {
        if self.out.is_some() {
            if let Err(e) = self.flush() {
                log!(LogError, "Unable to flush trace on drop: {}", e);
            }
        }
    }
}

/// A `TraceWriter` that several tracing threads can append to. Each call holds
/// the lock for the whole record, so entries never interleave.
pub struct SharedTraceWriter<W: Write> {
    inner: Arc<Mutex<TraceWriter<W>>>,
}

impl<W: Write> Clone for SharedTraceWriter<W> {
    fn clone(&self) -> Self {
        SharedTraceWriter {
            inner: self.inner.clone(),
        }
    }
}

impl<W: Write> SharedTraceWriter<W> {
    pub fn new(writer: TraceWriter<W>) -> SharedTraceWriter<W> {
        SharedTraceWriter {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    /// A writer whose holder panicked mid-call is still consistent: every
    /// record is staged in one step.
    pub fn lock(&self) -> MutexGuard<'_, TraceWriter<W>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn write_entry(&self, entry: &EntryHeader) -> TraceResult<usize> {
        self.lock().write_entry(entry)
    }

    pub fn stats(&self) -> TraceStats {
        self.lock().stats()
    }

    pub fn flush(&self) -> TraceResult<()> {
        self.lock().flush()
    }
}
