use crate::{
    log::{LogDebug, LogInfo, LogWarn},
    trace::{
        entry_header::EntryHeader,
        trace_error::{CodecError, TraceError, TraceResult},
        trace_records::{ModuleRecord, ProcRecord, ProcSection, TraceHeader},
        trace_stream::{MAGIC_NUMBER, MODULE_RECORD_SIZE, PROC_RECORD_SIZE, TRACE_HEADER_SIZE},
    },
};
use byteorder::{ByteOrder, LittleEndian};
use std::{
    convert::TryInto,
    fs::File,
    io::{self, Read},
    path::Path,
};

/// How much more input is pulled in when the window runs dry.
const READ_CHUNK: usize = 64 * 1024;

/// Forward only reader over one trace.
///
/// The header is checked as soon as the reader is created. Process sections
/// are read (once) on the first call to `procs()` or `next_entry()`. Entries
/// are decoded lazily out of a window of buffered input that is refilled on
/// demand; there is no way back short of opening the trace again.
pub struct TraceReader<R: Read> {
    input: R,
    header: TraceHeader,
    procs: Option<Vec<ProcSection>>,
    /// Buffered input. `buf[pos..]` has not been decoded yet.
    buf: Vec<u8>,
    pos: usize,
    eof: bool,
    /// Bytes of the trace consumed up to `buf[pos]`.
    offset: u64,
    entries_read: u64,
    /// Set once the `Iterator` impl has returned an error.
    failed: bool,
}

impl TraceReader<File> {
    pub fn open<P: AsRef<Path>>(path: P) -> TraceResult<TraceReader<File>> {
        let path = path.as_ref();
        let f = File::open(path)?;
        log!(LogInfo, "Reading trace {:?}", path);
        TraceReader::new(f)
    }
}

impl<R: Read> TraceReader<R> {
    /// Fails with `BadMagic` or `UnsupportedVersion` before anything past the
    /// header is looked at.
    pub fn new(input: R) -> TraceResult<TraceReader<R>> {
        let mut reader = TraceReader {
            input,
            header: TraceHeader::new(0, 0, 0),
            procs: None,
            buf: Vec::new(),
            pos: 0,
            eof: false,
            offset: 0,
            entries_read: 0,
            failed: false,
        };
        reader.fill(TRACE_HEADER_SIZE)?;
        let avail = reader.window();
        if avail.len() >= 4 {
            let found = LittleEndian::read_u32(&avail[..4]);
            if found != MAGIC_NUMBER {
                return Err(TraceError::BadMagic { found });
            }
        }
        let raw: [u8; TRACE_HEADER_SIZE] = match reader.take_record()? {
            Some(raw) => raw,
            None => return Err(reader.truncated()),
        };
        reader.header = TraceHeader::decode(&raw)?;
        Ok(reader)
    }

    pub fn header(&self) -> &TraceHeader {
        &self.header
    }

    /// Every process section announced by the header, each with its modules.
    pub fn procs(&mut self) -> TraceResult<&[ProcSection]> {
        if self.procs.is_none() {
            let procs = self.read_procs()?;
            self.procs = Some(procs);
        }
        Ok(self.procs.as_deref().unwrap_or(&[]))
    }

    /// All modules of all processes, in trace order.
    pub fn modules(&mut self) -> TraceResult<Vec<ModuleRecord>> {
        Ok(self
            .procs()?
            .iter()
            .flat_map(|p| p.modules.iter().cloned())
            .collect())
    }

    /// Number of entries decoded so far.
    pub fn entries_read(&self) -> u64 {
        self.entries_read
    }

    /// Byte offset of the next undecoded record.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Decode the next entry. `Ok(None)` at a clean end of the trace.
    ///
    /// A rejected entry does not move the cursor, so calling again reports the
    /// same error. A trace that ends in the middle of an entry reports
    /// `TruncatedStream` with the number of complete entries.
    pub fn next_entry(&mut self) -> TraceResult<Option<EntryHeader>> {
        if self.procs.is_none() {
            self.procs()?;
        }
        loop {
            let window = self.window();
            if window.is_empty() {
                if self.eof {
                    return Ok(None);
                }
                self.refill()?;
                continue;
            }

            let mut cursor = window;
            let result = EntryHeader::decode(&mut cursor);
            let consumed = window.len() - cursor.len();
            match result {
                Ok(entry) => {
                    self.advance(consumed);
                    self.entries_read += 1;
                    if is_logging!(LogDebug) {
                        let mut line = Vec::new();
                        entry.dump_raw(Some(&mut line))?;
                        log!(LogDebug, "{}", String::from_utf8_lossy(&line).trim_end());
                    }
                    return Ok(Some(entry));
                }
                Err(CodecError::Truncated { .. }) if !self.eof => self.refill()?,
                Err(CodecError::Truncated { .. }) => return Err(self.truncated()),
                Err(e) => {
                    log!(
                        LogWarn,
                        "Rejected entry {} at offset {}: {}",
                        self.entries_read,
                        self.offset,
                        e
                    );
                    return Err(TraceError::at_entry(self.entries_read, e));
                }
            }
        }
    }

    /// Parse every process section out of the buffered window. The cursor
    /// only moves once all of them are in, so a failure reports the same
    /// error on every later call.
    fn read_procs(&mut self) -> TraceResult<Vec<ProcSection>> {
        let n_procs = self.header.n_procs;
        loop {
            let parsed = match parse_procs(self.window(), n_procs, self.offset, self.eof) {
                ParsedProcs::Failed(partial, e) => {
                    realign(self.window(), n_procs, self.offset, partial, e)
                }
                other => other,
            };
            match parsed {
                ParsedProcs::Complete(preamble) => {
                    for p in &preamble.procs {
                        log!(
                            LogDebug,
                            "process `{}' pid {}: {} modules",
                            p.proc_record.name,
                            p.proc_record.pid,
                            p.modules.len()
                        );
                    }
                    self.advance(preamble.len);
                    return Ok(preamble.procs);
                }
                ParsedProcs::NeedMore => self.refill()?,
                ParsedProcs::Failed(_, e) => {
                    log!(LogWarn, "Rejected process sections at offset {}: {}", self.offset, e);
                    return Err(e);
                }
            }
        }
    }

    fn window(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    fn advance(&mut self, n: usize) {
        self.pos += n;
        self.offset += n as u64;
    }

    fn truncated(&self) -> TraceError {
        TraceError::TruncatedStream {
            entries: self.entries_read,
            offset: self.offset,
        }
    }

    /// Take the next `N` bytes, or `None` if the input ends first.
    fn take_record<const N: usize>(&mut self) -> TraceResult<Option<[u8; N]>> {
        if !self.fill(N)? {
            return Ok(None);
        }
        let raw: [u8; N] = match self.window()[..N].try_into() {
            Ok(raw) => raw,
            Err(_) => return Ok(None),
        };
        self.advance(N);
        Ok(Some(raw))
    }

    /// Make sure at least `n` bytes are buffered. False if the input ended
    /// before that.
    fn fill(&mut self, n: usize) -> TraceResult<bool> {
        while self.window().len() < n {
            if self.eof {
                return Ok(false);
            }
            self.refill()?;
        }
        Ok(true)
    }

    fn refill(&mut self) -> TraceResult<()> {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        let old_len = self.buf.len();
        self.buf.resize(old_len + READ_CHUNK, 0);
        let n = loop {
            match self.input.read(&mut self.buf[old_len..]) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.buf.truncate(old_len);
                    return Err(e.into());
                }
            }
        };
        self.buf.truncate(old_len + n);
        if n == 0 {
            self.eof = true;
        }
        Ok(())
    }
}

/// Process sections read so far, with the offset each one starts at.
struct Preamble {
    procs: Vec<ProcSection>,
    starts: Vec<usize>,
    len: usize,
}

enum ParsedProcs {
    Complete(Preamble),
    /// More input is needed before anything can be said.
    NeedMore,
    /// Holds every section read before the failure, the failing one included
    /// when its process record itself was fine.
    Failed(Preamble, TraceError),
}

fn record_at<const N: usize>(bytes: &[u8], at: usize) -> Option<&[u8; N]> {
    bytes.get(at..at.checked_add(N)?)?.try_into().ok()
}

/// Read `n_procs` process sections from the start of `bytes`, which sits at
/// trace offset `base`.
fn parse_procs(bytes: &[u8], n_procs: u32, base: u64, eof: bool) -> ParsedProcs {
    let mut preamble = Preamble {
        procs: Vec::new(),
        starts: Vec::new(),
        len: 0,
    };
    for _ in 0..n_procs {
        let start = preamble.len;
        let proc_record = match record_at::<PROC_RECORD_SIZE>(bytes, start) {
            Some(raw) => match ProcRecord::decode(raw) {
                Ok(p) => p,
                Err(e) => return ParsedProcs::Failed(preamble, e),
            },
            None if !eof => return ParsedProcs::NeedMore,
            None => {
                let e = TraceError::TruncatedStream {
                    entries: 0,
                    offset: base + start as u64,
                };
                return ParsedProcs::Failed(preamble, e);
            }
        };

        let mut at = start + PROC_RECORD_SIZE;
        let mut modules = Vec::with_capacity(proc_record.n_mods.min(1024) as usize);
        let mut failure = None;
        for _ in 0..proc_record.n_mods {
            match record_at::<MODULE_RECORD_SIZE>(bytes, at) {
                Some(raw) => match ModuleRecord::decode(raw) {
                    Ok(m) => modules.push(m),
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                },
                None if !eof => return ParsedProcs::NeedMore,
                None => {
                    failure = Some(TraceError::CountMismatch {
                        pid: proc_record.pid,
                        declared: proc_record.n_mods,
                        actual: modules.len() as u32,
                    });
                    break;
                }
            }
            at += MODULE_RECORD_SIZE;
        }

        preamble.procs.push(ProcSection {
            proc_record,
            modules,
        });
        preamble.starts.push(start);
        if let Some(e) = failure {
            return ParsedProcs::Failed(preamble, e);
        }
        preamble.len = at;
    }
    ParsedProcs::Complete(preamble)
}

/// A process that lists fewer modules than it declares swallows the records
/// after it as modules, which breaks decoding somewhere further on. Look for
/// the first process whose module list, cut short at some module, lets the
/// rest of the sections decode cleanly and blame it with `CountMismatch`.
/// Without such a process the original error stands.
fn realign(
    bytes: &[u8],
    n_procs: u32,
    base: u64,
    partial: Preamble,
    error: TraceError,
) -> ParsedProcs {
    for k in 0..partial.procs.len() {
        let (pid, declared, decoded) = {
            let p = &partial.procs[k];
            (p.proc_record.pid, p.proc_record.n_mods, p.modules.len() as u32)
        };
        if declared == 0 {
            continue;
        }
        let last = decoded.min(declared - 1);
        for actual in (0..=last).rev() {
            let at = partial.starts[k] + PROC_RECORD_SIZE + actual as usize * MODULE_RECORD_SIZE;
            if at > bytes.len() {
                continue;
            }
            let remaining = n_procs - k as u32 - 1;
            // Candidates are judged on what is buffered; a bogus module count
            // must not pull in the rest of the trace.
            let candidate = parse_procs(&bytes[at..], remaining, base + at as u64, true);
            if let ParsedProcs::Complete(_) = candidate {
                let e = TraceError::CountMismatch {
                    pid,
                    declared,
                    actual,
                };
                return ParsedProcs::Failed(partial, e);
            }
        }
    }
    ParsedProcs::Failed(partial, error)
}

impl<R: Read> Iterator for TraceReader<R> {
    type Item = TraceResult<EntryHeader>;

    /// Stops after the first error.
    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
