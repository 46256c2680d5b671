//! Append-only record of the shutdown sequence.
//!
//! The process may be tearing down its tracing subscriber while the server
//! closes, so the last few lifecycle events go to a plain file instead.

use chrono::Local;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Timestamped line writer backed by a file opened in append mode.
pub struct ShutdownLog {
    file: File,
    path: PathBuf,
}

impl ShutdownLog {
    /// Open (creating if needed) the log file and its parent directory.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `line` prefixed with the local time and flush it.
    pub fn append_line(&mut self, line: &str) -> io::Result<()> {
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        writeln!(self.file, "{stamp} {line}")?;
        self.file.flush()
    }
}
