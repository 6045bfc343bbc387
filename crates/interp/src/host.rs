//! Host interfaces
//!
//! The engine never touches physical I/O. Streams, the filesystem, the
//! clock, the housekeeping callback and externally registered functions
//! all arrive through this module; the front end wires in real
//! implementations, tests use the in-memory ones.
//!
//! Stream numbering follows the language surface: CONSOLE = 0,
//! IO1..IO4 = -1..-4, FILE1..FILE5 = 1..5.

use crate::error::ExecError;
use rill_core::Value;

bitflags::bitflags! {
    /// Flags the housekeeping callback may raise. Checked at suspension
    /// points only; they never interrupt a token mid-execution.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HostFlags: u8 {
        /// Tear down the interpreter and return to the host
        const KILL          = 0x01;
        /// Abort the running program, keep interpreter state
        const ABORT         = 0x02;
        /// Suspend the running program into debug mode
        const STOP          = 0x04;
        /// Re-route console streams to their defaults
        const CONSOLE_RESET = 0x08;
    }
}

/// A byte/text stream the language can read and write.
pub trait HostStream {
    fn write_str(&mut self, s: &str);
    /// One byte, or None when none arrives within the stream timeout
    fn read_byte(&mut self) -> Option<u8>;
    /// Next byte without consuming it
    fn peek_byte(&mut self) -> Option<u8>;
    /// Bytes available without blocking
    fn available(&self) -> usize;
    /// One line without the trailing newline, or None on timeout
    fn read_line(&mut self) -> Option<String>;
    fn flush(&mut self) {}
    fn set_timeout_ms(&mut self, _ms: u32) {}
    fn timeout_ms(&self) -> u32 {
        1000
    }
}

/// Numbered-slot filesystem access (FILE1..FILE5).
pub trait HostFileSystem {
    /// Open `path` under the mode bitmask; returns the claimed slot 1..5
    fn open(&mut self, path: &str, mode: u8) -> Result<u8, ExecError>;
    fn close(&mut self, file_num: u8) -> Result<(), ExecError>;
    fn close_all(&mut self);
    fn is_open(&self, file_num: u8) -> bool;
    fn read_byte(&mut self, file_num: u8) -> Result<Option<u8>, ExecError>;
    fn peek_byte(&mut self, file_num: u8) -> Result<Option<u8>, ExecError>;
    fn read_line(&mut self, file_num: u8) -> Result<Option<String>, ExecError>;
    fn write(&mut self, file_num: u8, data: &str) -> Result<(), ExecError>;
    fn position(&mut self, file_num: u8) -> Result<u32, ExecError>;
    fn size(&mut self, file_num: u8) -> Result<u32, ExecError>;
    fn seek(&mut self, file_num: u8, pos: u32) -> Result<(), ExecError>;
    fn available(&mut self, file_num: u8) -> Result<u32, ExecError>;
    fn exists(&self, path: &str) -> bool;
    fn remove(&mut self, path: &str) -> Result<(), ExecError>;
    /// Slot number a path is open under, 0 when it is not
    fn file_num_of(&self, path: &str) -> u8;
    fn list_files(&self) -> Vec<(String, u32)>;
    /// Read a whole file (program loading)
    fn read_all(&mut self, path: &str) -> Result<String, ExecError>;
}

/// Monotonic time and blocking delay.
pub trait HostClock {
    fn millis(&self) -> u32;
    fn micros(&self) -> u32;
    fn delay_ms(&mut self, ms: u32);
}

/// Return-type buckets for externally registered functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExtBucket {
    Bool = 0,
    Char = 1,
    Int = 2,
    Long = 3,
    Float = 4,
    Str = 5,
    Void = 6,
}

impl ExtBucket {
    pub fn from_u8(v: u8) -> Option<ExtBucket> {
        match v {
            0 => Some(ExtBucket::Bool),
            1 => Some(ExtBucket::Char),
            2 => Some(ExtBucket::Int),
            3 => Some(ExtBucket::Long),
            4 => Some(ExtBucket::Float),
            5 => Some(ExtBucket::Str),
            6 => Some(ExtBucket::Void),
            _ => None,
        }
    }
}

pub const EXT_BUCKET_COUNT: usize = 7;

/// An external function body. Arguments arrive evaluated; the result is
/// coerced by the bucket's return type.
pub type ExtFn = fn(&[Value]) -> Value;

#[derive(Clone)]
pub struct ExtFnDef {
    pub name: &'static str,
    pub func: ExtFn,
    pub min_args: u8,
    pub max_args: u8,
}

/// The seven registration tables.
#[derive(Default)]
pub struct ExternalFns {
    tables: [Vec<ExtFnDef>; EXT_BUCKET_COUNT],
}

impl ExternalFns {
    pub fn register(&mut self, bucket: ExtBucket, def: ExtFnDef) {
        self.tables[bucket as usize].push(def);
    }

    pub fn find(&self, name: &str) -> Option<(ExtBucket, u8, &ExtFnDef)> {
        for (b, table) in self.tables.iter().enumerate() {
            if let Some((i, def)) = table.iter().enumerate().find(|(_, d)| d.name == name) {
                let bucket = ExtBucket::from_u8(b as u8).unwrap_or(ExtBucket::Void);
                return Some((bucket, i as u8, def));
            }
        }
        None
    }

    pub fn get(&self, bucket: u8, index: u8) -> Option<&ExtFnDef> {
        self.tables
            .get(bucket as usize)
            .and_then(|t| t.get(index as usize))
    }
}

// --- default implementations ---

/// Stream that swallows writes and never delivers input.
#[derive(Debug, Default)]
pub struct NullStream;

impl HostStream for NullStream {
    fn write_str(&mut self, _s: &str) {}
    fn read_byte(&mut self) -> Option<u8> {
        None
    }
    fn peek_byte(&mut self) -> Option<u8> {
        None
    }
    fn available(&self) -> usize {
        0
    }
    fn read_line(&mut self) -> Option<String> {
        None
    }
}

/// In-memory stream for tests and captured console sessions.
#[derive(Debug, Default)]
pub struct MemoryStream {
    pub input: std::collections::VecDeque<u8>,
    pub output: String,
    timeout_ms: u32,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(input: &str) -> Self {
        MemoryStream {
            input: input.bytes().collect(),
            output: String::new(),
            timeout_ms: 0,
        }
    }
}

impl HostStream for MemoryStream {
    fn write_str(&mut self, s: &str) {
        self.output.push_str(s);
    }

    fn read_byte(&mut self) -> Option<u8> {
        self.input.pop_front()
    }

    fn peek_byte(&mut self) -> Option<u8> {
        self.input.front().copied()
    }

    fn available(&self) -> usize {
        self.input.len()
    }

    fn read_line(&mut self) -> Option<String> {
        if self.input.is_empty() {
            return None;
        }
        let mut line = String::new();
        while let Some(b) = self.input.pop_front() {
            if b == b'\n' {
                break;
            }
            line.push(b as char);
        }
        Some(line)
    }

    fn set_timeout_ms(&mut self, ms: u32) {
        self.timeout_ms = ms;
    }

    fn timeout_ms(&self) -> u32 {
        self.timeout_ms
    }
}

/// Filesystem stub that reports every operation as unavailable.
#[derive(Debug, Default)]
pub struct NullFileSystem;

impl HostFileSystem for NullFileSystem {
    fn open(&mut self, _path: &str, _mode: u8) -> Result<u8, ExecError> {
        Err(ExecError::FileIoError)
    }
    fn close(&mut self, _file_num: u8) -> Result<(), ExecError> {
        Err(ExecError::FileNotOpen)
    }
    fn close_all(&mut self) {}
    fn is_open(&self, _file_num: u8) -> bool {
        false
    }
    fn read_byte(&mut self, _file_num: u8) -> Result<Option<u8>, ExecError> {
        Err(ExecError::FileNotOpen)
    }
    fn peek_byte(&mut self, _file_num: u8) -> Result<Option<u8>, ExecError> {
        Err(ExecError::FileNotOpen)
    }
    fn read_line(&mut self, _file_num: u8) -> Result<Option<String>, ExecError> {
        Err(ExecError::FileNotOpen)
    }
    fn write(&mut self, _file_num: u8, _data: &str) -> Result<(), ExecError> {
        Err(ExecError::FileNotOpen)
    }
    fn position(&mut self, _file_num: u8) -> Result<u32, ExecError> {
        Err(ExecError::FileNotOpen)
    }
    fn size(&mut self, _file_num: u8) -> Result<u32, ExecError> {
        Err(ExecError::FileNotOpen)
    }
    fn seek(&mut self, _file_num: u8, _pos: u32) -> Result<(), ExecError> {
        Err(ExecError::FileNotOpen)
    }
    fn available(&mut self, _file_num: u8) -> Result<u32, ExecError> {
        Err(ExecError::FileNotOpen)
    }
    fn exists(&self, _path: &str) -> bool {
        false
    }
    fn remove(&mut self, _path: &str) -> Result<(), ExecError> {
        Err(ExecError::FileIoError)
    }
    fn file_num_of(&self, _path: &str) -> u8 {
        0
    }
    fn list_files(&self) -> Vec<(String, u32)> {
        Vec::new()
    }
    fn read_all(&mut self, _path: &str) -> Result<String, ExecError> {
        Err(ExecError::FileIoError)
    }
}

/// Wall-clock implementation over `std::time`.
pub struct SystemClock {
    start: std::time::Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        SystemClock {
            start: std::time::Instant::now(),
        }
    }
}

impl HostClock for SystemClock {
    fn millis(&self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }

    fn micros(&self) -> u32 {
        self.start.elapsed().as_micros() as u32
    }

    fn delay_ms(&mut self, ms: u32) {
        std::thread::sleep(std::time::Duration::from_millis(ms as u64));
    }
}

/// Everything the engine consumes from the host, with null defaults.
pub struct Host {
    pub console: Box<dyn HostStream>,
    pub io: [Option<Box<dyn HostStream>>; 4],
    pub fs: Box<dyn HostFileSystem>,
    pub clock: Box<dyn HostClock>,
    pub housekeep: Option<Box<dyn FnMut(&mut HostFlags)>>,
    /// RTC callback feeding `sysVal` date/time slots: `(date16, time16)`
    pub rtc: Option<fn() -> (u16, u16)>,
    pub external: ExternalFns,
}

impl Default for Host {
    fn default() -> Self {
        Host {
            console: Box::new(NullStream),
            io: [None, None, None, None],
            fs: Box::new(NullFileSystem),
            clock: Box::<SystemClock>::default(),
            housekeep: None,
            rtc: None,
            external: ExternalFns::default(),
        }
    }
}

impl Host {
    /// Resolve a stream number to its stream. File numbers resolve at the
    /// call sites because they route through the filesystem trait.
    pub fn stream(&mut self, num: i32) -> Option<&mut dyn HostStream> {
        match num {
            0 => Some(self.console.as_mut()),
            -4..=-1 => {
                let idx = (-num - 1) as usize;
                match self.io[idx] {
                    Some(ref mut b) => Some(b.as_mut()),
                    None => None,
                }
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_stream_roundtrip() {
        let mut s = MemoryStream::with_input("ab\ncd");
        s.write_str("out");
        assert_eq!(s.output, "out");
        assert_eq!(s.read_line(), Some("ab".to_string()));
        assert_eq!(s.read_byte(), Some(b'c'));
        assert_eq!(s.peek_byte(), Some(b'd'));
        assert_eq!(s.available(), 1);
    }

    #[test]
    fn test_external_fn_registry() {
        fn twice(args: &[Value]) -> Value {
            match args.first() {
                Some(Value::Long(v)) => Value::Long(v * 2),
                _ => Value::Long(0),
            }
        }
        let mut ext = ExternalFns::default();
        ext.register(
            ExtBucket::Long,
            ExtFnDef {
                name: "twice",
                func: twice,
                min_args: 1,
                max_args: 1,
            },
        );
        let (bucket, index, def) = ext.find("twice").unwrap();
        assert_eq!(bucket, ExtBucket::Long);
        assert_eq!((def.func)(&[Value::Long(21)]), Value::Long(42));
        assert!(ext.get(bucket as u8, index).is_some());
    }

    #[test]
    fn test_host_stream_numbers() {
        let mut host = Host::default();
        assert!(host.stream(0).is_some());
        assert!(host.stream(-1).is_none()); // IO1 not wired
        assert!(host.stream(3).is_none()); // files resolve elsewhere
    }
}
