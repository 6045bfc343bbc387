//! Host implementations over stdio and the local filesystem
//!
//! The engine talks to streams and files through its host traits; this
//! module wires the console stream to stdout (input arrives through the
//! rustyline prompt, so console reads drain a buffer the prompt loop can
//! pre-fill) and the file interface to `std::fs` with the five numbered
//! slots the language exposes.

use rill::{ExecError, HostFileSystem, HostStream};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

/// Console stream: writes to stdout, reads from a buffer fed by the
/// prompt loop (`input` / `cin` style built-ins).
#[derive(Default)]
pub struct StdConsole {
    pending_input: VecDeque<u8>,
    timeout_ms: u32,
}

impl StdConsole {
    pub fn new() -> Self {
        StdConsole {
            pending_input: VecDeque::new(),
            timeout_ms: 1000,
        }
    }
}

impl HostStream for StdConsole {
    fn write_str(&mut self, s: &str) {
        let mut out = std::io::stdout();
        let _ = out.write_all(s.as_bytes());
        let _ = out.flush();
    }

    fn read_byte(&mut self) -> Option<u8> {
        if let Some(b) = self.pending_input.pop_front() {
            return Some(b);
        }
        // blocking console read: one line from stdin
        let mut line = String::new();
        match std::io::stdin().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => {
                self.pending_input.extend(line.bytes());
                self.pending_input.pop_front()
            }
        }
    }

    fn peek_byte(&mut self) -> Option<u8> {
        self.pending_input.front().copied()
    }

    fn available(&self) -> usize {
        self.pending_input.len()
    }

    fn read_line(&mut self) -> Option<String> {
        if !self.pending_input.is_empty() {
            let mut line = String::new();
            while let Some(b) = self.pending_input.pop_front() {
                if b == b'\n' {
                    break;
                }
                line.push(b as char);
            }
            return Some(line);
        }
        let mut line = String::new();
        match std::io::stdin().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
        }
    }

    fn set_timeout_ms(&mut self, ms: u32) {
        self.timeout_ms = ms;
    }

    fn timeout_ms(&self) -> u32 {
        self.timeout_ms
    }
}

/// The language's file-open mode bits.
mod mode {
    pub const READ: u8 = 0x01;
    pub const WRITE: u8 = 0x02;
    pub const APPEND: u8 = 0x06;
    pub const NEW_OK: u8 = 0x10;
    pub const NEW_ONLY: u8 = 0x30;
    pub const TRUNC: u8 = 0x40;
}

struct OpenFile {
    path: PathBuf,
    file: File,
}

/// Five numbered file slots over `std::fs`.
#[derive(Default)]
pub struct LocalFs {
    /// Base directory for relative paths
    root: PathBuf,
    slots: [Option<OpenFile>; 5],
}

impl LocalFs {
    pub fn new(root: PathBuf) -> Self {
        LocalFs {
            root,
            slots: Default::default(),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = PathBuf::from(path);
        if p.is_absolute() {
            p
        } else {
            self.root.join(p)
        }
    }

    fn slot(&mut self, file_num: u8) -> Result<&mut OpenFile, ExecError> {
        if !(1..=5).contains(&file_num) {
            return Err(ExecError::InvalidFileNumber);
        }
        self.slots[file_num as usize - 1]
            .as_mut()
            .ok_or(ExecError::FileNotOpen)
    }
}

impl HostFileSystem for LocalFs {
    fn open(&mut self, path: &str, mode_bits: u8) -> Result<u8, ExecError> {
        let free = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(ExecError::FileIoError)?;
        let full = self.resolve(path);

        let mut options = OpenOptions::new();
        options.read(mode_bits & mode::READ != 0 || mode_bits == 0);
        if mode_bits & mode::WRITE != 0 {
            options.write(true);
        }
        if mode_bits & mode::APPEND == mode::APPEND {
            options.append(true);
        }
        if mode_bits & mode::NEW_ONLY == mode::NEW_ONLY {
            options.create_new(true);
        } else if mode_bits & mode::NEW_OK != 0 {
            options.create(true);
        }
        if mode_bits & mode::TRUNC != 0 {
            options.truncate(true);
        }

        let file = options.open(&full).map_err(|_| ExecError::FileIoError)?;
        self.slots[free] = Some(OpenFile { path: full, file });
        Ok(free as u8 + 1)
    }

    fn close(&mut self, file_num: u8) -> Result<(), ExecError> {
        if !(1..=5).contains(&file_num) {
            return Err(ExecError::InvalidFileNumber);
        }
        match self.slots[file_num as usize - 1].take() {
            Some(_) => Ok(()),
            None => Err(ExecError::FileNotOpen),
        }
    }

    fn close_all(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }

    fn is_open(&self, file_num: u8) -> bool {
        (1..=5).contains(&file_num) && self.slots[file_num as usize - 1].is_some()
    }

    fn read_byte(&mut self, file_num: u8) -> Result<Option<u8>, ExecError> {
        let open = self.slot(file_num)?;
        let mut buf = [0u8; 1];
        match open.file.read(&mut buf) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(buf[0])),
            Err(_) => Err(ExecError::FileIoError),
        }
    }

    fn peek_byte(&mut self, file_num: u8) -> Result<Option<u8>, ExecError> {
        let open = self.slot(file_num)?;
        let pos = open
            .file
            .stream_position()
            .map_err(|_| ExecError::FileIoError)?;
        let mut buf = [0u8; 1];
        let result = match open.file.read(&mut buf) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(buf[0])),
            Err(_) => Err(ExecError::FileIoError),
        };
        open.file
            .seek(SeekFrom::Start(pos))
            .map_err(|_| ExecError::FileIoError)?;
        result
    }

    fn read_line(&mut self, file_num: u8) -> Result<Option<String>, ExecError> {
        let open = self.slot(file_num)?;
        let pos = open
            .file
            .stream_position()
            .map_err(|_| ExecError::FileIoError)?;
        let mut reader = BufReader::new(&mut open.file);
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) => Ok(None),
            Ok(n) => {
                // the buffered reader may have consumed past the line
                open.file
                    .seek(SeekFrom::Start(pos + n as u64))
                    .map_err(|_| ExecError::FileIoError)?;
                Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
            }
            Err(_) => Err(ExecError::FileIoError),
        }
    }

    fn write(&mut self, file_num: u8, data: &str) -> Result<(), ExecError> {
        let open = self.slot(file_num)?;
        open.file
            .write_all(data.as_bytes())
            .map_err(|_| ExecError::FileIoError)
    }

    fn position(&mut self, file_num: u8) -> Result<u32, ExecError> {
        let open = self.slot(file_num)?;
        open.file
            .stream_position()
            .map(|p| p as u32)
            .map_err(|_| ExecError::FileIoError)
    }

    fn size(&mut self, file_num: u8) -> Result<u32, ExecError> {
        let open = self.slot(file_num)?;
        open.file
            .metadata()
            .map(|m| m.len() as u32)
            .map_err(|_| ExecError::FileIoError)
    }

    fn seek(&mut self, file_num: u8, pos: u32) -> Result<(), ExecError> {
        let open = self.slot(file_num)?;
        let size = open
            .file
            .metadata()
            .map(|m| m.len())
            .map_err(|_| ExecError::FileIoError)?;
        if pos as u64 > size {
            return Err(ExecError::FileIoError);
        }
        open.file
            .seek(SeekFrom::Start(pos as u64))
            .map(|_| ())
            .map_err(|_| ExecError::FileIoError)
    }

    fn available(&mut self, file_num: u8) -> Result<u32, ExecError> {
        let size = self.size(file_num)?;
        let pos = self.position(file_num)?;
        Ok(size.saturating_sub(pos))
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).exists()
    }

    fn remove(&mut self, path: &str) -> Result<(), ExecError> {
        let full = self.resolve(path);
        if self.slots.iter().flatten().any(|s| s.path == full) {
            return Err(ExecError::FileIoError);
        }
        std::fs::remove_file(full).map_err(|_| ExecError::FileIoError)
    }

    fn file_num_of(&self, path: &str) -> u8 {
        let full = self.resolve(path);
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(open) = slot {
                if open.path == full {
                    return i as u8 + 1;
                }
            }
        }
        0
    }

    fn list_files(&self) -> Vec<(String, u32)> {
        let mut out = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                if let Ok(meta) = entry.metadata() {
                    if meta.is_file() {
                        out.push((entry.file_name().to_string_lossy().to_string(), meta.len() as u32));
                    }
                }
            }
        }
        out.sort();
        out
    }

    fn read_all(&mut self, path: &str) -> Result<String, ExecError> {
        std::fs::read_to_string(self.resolve(path)).map_err(|_| ExecError::FileIoError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn test_localfs_slots() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = LocalFs::new(dir.path().to_path_buf());

        let mut f = std::fs::File::create(dir.path().join("data.txt")).unwrap();
        writeln!(f, "line one").unwrap();
        writeln!(f, "line two").unwrap();
        drop(f);

        let n = fs.open("data.txt", 0x01).unwrap();
        assert_eq!(n, 1);
        assert!(fs.is_open(n));
        assert_eq!(fs.file_num_of("data.txt"), 1);
        assert_eq!(fs.read_line(n).unwrap(), Some("line one".to_string()));
        assert_eq!(fs.read_line(n).unwrap(), Some("line two".to_string()));
        assert_eq!(fs.read_line(n).unwrap(), None);
        fs.close(n).unwrap();
        assert!(!fs.is_open(n));
    }

    #[test]
    fn test_localfs_seek_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = LocalFs::new(dir.path().to_path_buf());
        std::fs::write(dir.path().join("d.bin"), b"abcdef").unwrap();

        let n = fs.open("d.bin", 0x01).unwrap();
        assert_eq!(fs.size(n).unwrap(), 6);
        fs.seek(n, 3).unwrap();
        assert_eq!(fs.read_byte(n).unwrap(), Some(b'd'));
        assert_eq!(fs.available(n).unwrap(), 2);
        assert!(fs.seek(n, 100).is_err());
    }

    #[test]
    fn test_remove_refuses_open_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = LocalFs::new(dir.path().to_path_buf());
        std::fs::write(dir.path().join("x.txt"), b"x").unwrap();
        let n = fs.open("x.txt", 0x01).unwrap();
        assert!(fs.remove("x.txt").is_err());
        fs.close(n).unwrap();
        assert!(fs.remove("x.txt").is_ok());
    }
}
