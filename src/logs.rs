//! Per-service log files.
//!
//! Each launch appends the process's combined output to one file per service
//! key via fd redirection; the `logs` command reads the tail back.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Path of the append-only log file for a service key.
pub fn log_path(log_dir: &Path, key: &str) -> PathBuf {
    log_dir.join(format!("{key}.log"))
}

/// Opens the log file for appending, creating parent directories as needed.
pub fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::Io("failed to create log directory", e))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::Io("failed to open log file", e))
}

/// Last `count` lines of the log, oldest first. A missing file reads as
/// empty rather than failing, matching "nothing logged yet".
pub fn tail(path: &Path, count: usize) -> Result<Vec<String>> {
    let mut raw = String::new();
    match File::open(path) {
        Ok(mut file) => {
            file.read_to_string(&mut raw)
                .map_err(|e| Error::Io("failed to read log file", e))?;
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(Error::Io("failed to open log file", err)),
    }
    let lines: Vec<&str> = raw.lines().collect();
    let start = lines.len().saturating_sub(count);
    Ok(lines[start..].iter().map(|s| s.to_string()).collect())
}
