//! Shared access log with buffering and size-triggered rotation.
//!
//! All workers append to one log through a single mutex, so lines are
//! never interleaved. Lines accumulate in a 4 KiB in-memory buffer that
//! is flushed when it cannot fit the next line, when five seconds have
//! passed since the last flush, immediately before rotation, and on
//! close. When the file on disk reaches 10 MiB it is rotated through
//! `<path>.1` .. `<path>.5`.
//!
//! A write failure drops the line and is reported through the
//! diagnostic log; it never fails the request being logged.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::Local;
use tracing::{error, info};

/// In-memory buffer size.
const BUFFER_CAPACITY: usize = 4096;

/// Flush at least this often.
const FLUSH_INTERVAL_SECS: u64 = 5;

/// Rotate when the file on disk reaches this size.
const ROTATE_AT_BYTES: u64 = 10 * 1024 * 1024;

/// Rotated files kept: `<path>.1` .. `<path>.K`.
const RETAIN_ROTATIONS: u32 = 5;

struct LogInner {
    file: File,
    buffer: String,
    last_flush: Instant,
}

/// Append-only access log shared by all workers.
pub struct AccessLog {
    path: PathBuf,
    inner: Mutex<LogInner>,
}

/// One request's worth of access-log fields.
#[derive(Debug)]
pub struct AccessEntry<'a> {
    pub remote_addr: std::net::IpAddr,
    pub method: &'a str,
    pub path: &'a str,
    pub status: u16,
    pub bytes: u64,
    pub duration_ms: u64,
}

impl AccessLog {
    /// Opens (creating if needed) the log at `path` in append mode. The
    /// parent directory is created first.
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error when the directory or file cannot
    /// be created.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(LogInner {
                file,
                buffer: String::with_capacity(BUFFER_CAPACITY),
                last_flush: Instant::now(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, LogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends one line. All failure paths drop the line after reporting
    /// to the diagnostic log; the lock releases on every path.
    pub fn log(&self, entry: &AccessEntry<'_>) {
        let line = format_line(entry);
        let mut inner = self.lock();

        if self.effective_size(&inner) >= ROTATE_AT_BYTES {
            if let Err(source) = self.rotate(&mut inner) {
                error!(path = %self.path.display(), %source, "log rotation failed");
            }
        }

        if inner.buffer.len() + line.len() > BUFFER_CAPACITY {
            Self::flush_locked(&mut inner, &self.path);
        }
        inner.buffer.push_str(&line);

        if inner.last_flush.elapsed().as_secs() >= FLUSH_INTERVAL_SECS {
            Self::flush_locked(&mut inner, &self.path);
        }
    }

    /// Flushes any buffered lines to disk.
    pub fn flush(&self) {
        let mut inner = self.lock();
        Self::flush_locked(&mut inner, &self.path);
    }

    /// The log path this instance writes to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush_locked(inner: &mut LogInner, path: &Path) {
        if !inner.buffer.is_empty() {
            if let Err(source) = inner.file.write_all(inner.buffer.as_bytes()) {
                error!(path = %path.display(), %source, "access log write failed, dropping lines");
            }
            inner.buffer.clear();
        }
        inner.last_flush = Instant::now();
    }

    /// Size of the log file on disk plus what the buffer would add.
    fn effective_size(&self, inner: &LogInner) -> u64 {
        let on_disk = inner.file.metadata().map(|m| m.len()).unwrap_or(0);
        on_disk + inner.buffer.len() as u64
    }

    /// Shift `<path>.i` up by one, retire `<path>.K`, move the live file
    /// to `<path>.1`, and reopen fresh. The buffer is flushed first so
    /// rotated files hold complete lines.
    fn rotate(&self, inner: &mut LogInner) -> std::io::Result<()> {
        Self::flush_locked(inner, &self.path);

        let numbered = |i: u32| PathBuf::from(format!("{}.{i}", self.path.display()));
        let _ = std::fs::remove_file(numbered(RETAIN_ROTATIONS));
        for i in (1..RETAIN_ROTATIONS).rev() {
            let from = numbered(i);
            if from.exists() {
                std::fs::rename(&from, numbered(i + 1))?;
            }
        }
        std::fs::rename(&self.path, numbered(1))?;

        inner.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        info!(path = %self.path.display(), "rotated access log");
        Ok(())
    }
}

impl Drop for AccessLog {
    fn drop(&mut self) {
        self.flush();
    }
}

/// `IP [DD/Mon/YYYY:HH:MM:SS] "METHOD PATH" STATUS BYTES DURATIONms`
///
/// Method and path are sanitized here, on every path into the log, so
/// each emitted line stays one parseable record no matter what arrived
/// on the wire.
fn format_line(entry: &AccessEntry<'_>) -> String {
    format!(
        "{} [{}] \"{} {}\" {} {} {}ms\n",
        entry.remote_addr,
        Local::now().format("%d/%b/%Y:%H:%M:%S"),
        clean_method(entry.method),
        clean_path(entry.path),
        entry.status,
        entry.bytes,
        entry.duration_ms,
    )
}

/// The method field must be uppercase letters only. Case is folded;
/// anything else (symbols, digits, empty) becomes `BAD`.
fn clean_method(raw: &str) -> String {
    let upper = raw.to_ascii_uppercase();
    if !upper.is_empty() && upper.bytes().all(|b| b.is_ascii_uppercase()) {
        upper
    } else {
        "BAD".to_string()
    }
}

/// The path field sits inside the quoted request; quotes and control
/// characters would break the quoting or the one-line record.
fn clean_path(raw: &str) -> String {
    raw.chars()
        .map(|c| if c == '"' || c.is_control() { '_' } else { c })
        .collect()
}
