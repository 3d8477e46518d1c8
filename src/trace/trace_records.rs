use crate::trace::{
    trace_error::{CodecError, TraceError},
    trace_stream::{
        MAGIC_NUMBER, MAX_STRING_LEN, MODULE_RECORD_SIZE, PROC_RECORD_SIZE, TRACE_HEADER_SIZE,
        VERSION_NUMBER,
    },
    wire::{get_bytes, get_u32, put_u32},
};
use serde::Serialize;

/// First record of every trace. Written exactly once.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceHeader {
    pub magicnumber: u32,
    pub version: u32,
    pub n_procs: u32,
    pub gdt_base: u32,
    pub idt_base: u32,
}

impl TraceHeader {
    pub fn new(n_procs: u32, gdt_base: u32, idt_base: u32) -> TraceHeader {
        TraceHeader {
            magicnumber: MAGIC_NUMBER,
            version: VERSION_NUMBER,
            n_procs,
            gdt_base,
            idt_base,
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, self.magicnumber);
        put_u32(out, self.version);
        put_u32(out, self.n_procs);
        put_u32(out, self.gdt_base);
        put_u32(out, self.idt_base);
    }

    /// Magic and version are checked before anything else is looked at.
    pub fn decode(bytes: &[u8; TRACE_HEADER_SIZE]) -> Result<TraceHeader, TraceError> {
        let mut buf = &bytes[..];
        let magicnumber = get_u32(&mut buf, "magicnumber").map_err(header_err)?;
        if magicnumber != MAGIC_NUMBER {
            return Err(TraceError::BadMagic { found: magicnumber });
        }
        let version = get_u32(&mut buf, "version").map_err(header_err)?;
        if version != VERSION_NUMBER {
            return Err(TraceError::UnsupportedVersion {
                found: version,
                expected: VERSION_NUMBER,
            });
        }
        Ok(TraceHeader {
            magicnumber,
            version,
            n_procs: get_u32(&mut buf, "n_procs").map_err(header_err)?,
            gdt_base: get_u32(&mut buf, "gdt_base").map_err(header_err)?,
            idt_base: get_u32(&mut buf, "idt_base").map_err(header_err)?,
        })
    }
}

fn header_err(e: CodecError) -> TraceError {
    TraceError::MalformedRecord {
        section: "trace header",
        detail: e.to_string(),
    }
}

fn record_err(section: &'static str) -> impl Fn(CodecError) -> TraceError {
    move |e| TraceError::MalformedRecord {
        section,
        detail: e.to_string(),
    }
}

/// Names travel as NUL padded `MAX_STRING_LEN` byte fields, so at most
/// `MAX_STRING_LEN - 1` bytes of name fit.
fn check_name(section: &'static str, name: &str) -> Result<(), TraceError> {
    if name.len() >= MAX_STRING_LEN || name.as_bytes().contains(&0) {
        return Err(TraceError::MalformedRecord {
            section,
            detail: format!(
                "name `{}' must be shorter than {} bytes and contain no NUL",
                name, MAX_STRING_LEN
            ),
        });
    }
    Ok(())
}

fn put_name(out: &mut Vec<u8>, name: &str) {
    let mut raw = [0u8; MAX_STRING_LEN];
    raw[..name.len()].copy_from_slice(name.as_bytes());
    out.extend_from_slice(&raw);
}

fn get_name(buf: &mut &[u8], section: &'static str) -> Result<String, TraceError> {
    let raw = get_bytes(buf, MAX_STRING_LEN, "name").map_err(record_err(section))?;
    let len = match memchr::memchr(0, raw) {
        Some(len) => len,
        None => {
            return Err(TraceError::MalformedRecord {
                section,
                detail: "name is not NUL terminated".into(),
            })
        }
    };
    String::from_utf8(raw[..len].to_vec()).map_err(|e| TraceError::MalformedRecord {
        section,
        detail: e.to_string(),
    })
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcRecord {
    pub name: String,
    pub pid: u32,
    /// Number of `ModuleRecord`s that follow this record
    pub n_mods: u32,
    pub ldt_base: u32,
}

impl ProcRecord {
    pub fn new(name: &str, pid: u32, n_mods: u32, ldt_base: u32) -> Result<ProcRecord, TraceError> {
        check_name("process record", name)?;
        Ok(ProcRecord {
            name: name.into(),
            pid,
            n_mods,
            ldt_base,
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), TraceError> {
        check_name("process record", &self.name)?;
        put_name(out, &self.name);
        put_u32(out, self.pid);
        put_u32(out, self.n_mods);
        put_u32(out, self.ldt_base);
        Ok(())
    }

    pub fn decode(bytes: &[u8; PROC_RECORD_SIZE]) -> Result<ProcRecord, TraceError> {
        let section = "process record";
        let mut buf = &bytes[..];
        let name = get_name(&mut buf, section)?;
        let pid = get_u32(&mut buf, "pid").map_err(record_err(section))?;
        let n_mods = get_u32(&mut buf, "n_mods").map_err(record_err(section))?;
        let ldt_base = get_u32(&mut buf, "ldt_base").map_err(record_err(section))?;
        Ok(ProcRecord {
            name,
            pid,
            n_mods,
            ldt_base,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ModuleRecord {
    pub name: String,
    pub base: u32,
    pub size: u32,
}

impl ModuleRecord {
    pub fn new(name: &str, base: u32, size: u32) -> Result<ModuleRecord, TraceError> {
        check_name("module record", name)?;
        Ok(ModuleRecord {
            name: name.into(),
            base,
            size,
        })
    }

    pub fn contains(&self, address: u32) -> bool {
        address >= self.base && address - self.base < self.size
    }

    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), TraceError> {
        check_name("module record", &self.name)?;
        put_name(out, &self.name);
        put_u32(out, self.base);
        put_u32(out, self.size);
        Ok(())
    }

    pub fn decode(bytes: &[u8; MODULE_RECORD_SIZE]) -> Result<ModuleRecord, TraceError> {
        let section = "module record";
        let mut buf = &bytes[..];
        let name = get_name(&mut buf, section)?;
        let base = get_u32(&mut buf, "base").map_err(record_err(section))?;
        let size = get_u32(&mut buf, "size").map_err(record_err(section))?;
        Ok(ModuleRecord { name, base, size })
    }
}

/// A process together with the modules recorded for it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcSection {
    pub proc_record: ProcRecord,
    pub modules: Vec<ModuleRecord>,
}
