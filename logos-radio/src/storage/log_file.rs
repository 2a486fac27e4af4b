//! Append-only persistent log fronted by an in-memory write buffer.
//!
//! Architecture:
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    PersistentLog                        │
//! │                                                        │
//! │  file   : [0 ........................ persisted)       │
//! │  buffer :                         [persisted .. whole) │
//! │                                                        │
//! │  Flush when:                                           │
//! │    1. Buffer cannot hold the next write                │
//! │    2. Periodic flusher fires (flush_interval_ms)       │
//! │    3. Explicit flush() / close()                       │
//! │                                                        │
//! │  Writes larger than the buffer bypass it entirely.     │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! A read range may straddle the boundary, in which case it is assembled as
//! `disk part ++ buffer part`. Only the buffer part is copied under the lock;
//! the disk part is a positional read on the shared file handle, so a large
//! catch-up read never holds up writers. `whole_size()` is served from an
//! atomic and never takes the lock.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (Log-structured storage)

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Log configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Write buffer capacity in bytes. Default: 50KB.
    pub buffer_size: usize,
    /// Period of the background flusher. Default: 20s.
    pub flush_interval_ms: u64,
    /// Call `sync_data` after every flush. Default: false.
    pub sync_on_flush: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            buffer_size: 50 * 1024,
            flush_interval_ms: 20_000,
            sync_on_flush: false,
        }
    }
}

impl LogConfig {
    /// Config for testing (tiny buffer, fast flusher).
    pub fn for_testing() -> Self {
        Self {
            buffer_size: 512,
            flush_interval_ms: 50,
            sync_on_flush: false,
        }
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

/// Log errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    /// Underlying file I/O failed
    Io(String),
    /// Requested range ends past `whole_size()`
    RangeNotAvailable { offset: u64, length: u64, available: u64 },
    /// The file held fewer bytes than the log accounted for
    ShortRead { offset: u64, expected: u64, got: u64 },
    /// Log has been closed
    Closed,
}

impl LogError {
    /// Whether a retry may succeed later without intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, LogError::RangeNotAvailable { .. } | LogError::ShortRead { .. })
    }
}

impl std::fmt::Display for LogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogError::Io(e) => write!(f, "Log I/O error: {e}"),
            LogError::RangeNotAvailable { offset, length, available } => write!(
                f,
                "Range {offset}+{length} not available (log holds {available} bytes)"
            ),
            LogError::ShortRead { offset, expected, got } => {
                write!(f, "Short read at {offset}: expected {expected} bytes, got {got}")
            }
            LogError::Closed => write!(f, "Log is closed"),
        }
    }
}

impl std::error::Error for LogError {}

impl From<std::io::Error> for LogError {
    fn from(e: std::io::Error) -> Self {
        LogError::Io(e.to_string())
    }
}

/// Mutable state, guarded by one mutex per log.
struct LogState {
    buffer: Vec<u8>,
    /// Bytes durably written to the file
    persisted: u64,
    closed: bool,
}

impl LogState {
    fn whole(&self) -> u64 {
        self.persisted + self.buffer.len() as u64
    }
}

/// Buffered append-only file.
pub struct PersistentLog {
    path: PathBuf,
    config: LogConfig,
    /// Appended to only while holding `state`; read positionally without it
    file: File,
    state: Mutex<LogState>,
    /// Mirror of `persisted + buffer.len()` for lock-free size queries
    whole_size: AtomicU64,
}

impl PersistentLog {
    /// Open (or create) the log at `path`.
    ///
    /// An existing file is adopted as-is: its length becomes both the
    /// persisted and the whole size.
    pub fn open(path: impl Into<PathBuf>, config: LogConfig) -> Result<Self, LogError> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&path)?;
        let persisted = file.metadata()?.len();

        log::info!("Opened log {} ({persisted} bytes)", path.display());

        Ok(Self {
            path,
            file,
            state: Mutex::new(LogState {
                buffer: Vec::with_capacity(config.buffer_size),
                persisted,
                closed: false,
            }),
            whole_size: AtomicU64::new(persisted),
            config,
        })
    }

    /// Append `data`, returning the offset it now starts at.
    ///
    /// Flushes first when the buffer lacks room. Data larger than the whole
    /// buffer goes straight to disk. On failure the log is left as it was
    /// before the call.
    pub fn write(&self, data: &[u8]) -> Result<u64, LogError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(LogError::Closed);
        }

        let start = state.whole();
        let capacity = self.config.buffer_size;
        if capacity - state.buffer.len() < data.len() {
            self.flush_locked(&mut state)?;
        }

        if data.len() > capacity {
            log::trace!("Bypassing buffer for {}-byte write at {start}", data.len());
            if let Err(e) = (&self.file).write_all(data) {
                self.rollback(state.persisted);
                return Err(e.into());
            }
            state.persisted += data.len() as u64;
        } else {
            state.buffer.extend_from_slice(data);
        }

        self.whole_size.store(state.whole(), Ordering::Release);
        Ok(start)
    }

    /// Read exactly `length` bytes starting at `offset`.
    ///
    /// The lock is held only to validate the range and copy its buffered
    /// tail; the disk part is read after releasing it. A `clear` racing with
    /// the disk read surfaces as `ShortRead`.
    pub fn read_at(&self, offset: u64, length: u64) -> Result<Vec<u8>, LogError> {
        let (end, persisted, tail) = {
            let state = self.state.lock();
            if state.closed {
                return Err(LogError::Closed);
            }

            let available = state.whole();
            let end = match offset.checked_add(length) {
                Some(end) if end <= available => end,
                _ => return Err(LogError::RangeNotAvailable { offset, length, available }),
            };

            let persisted = state.persisted;
            let tail = if end > persisted {
                let from = offset.saturating_sub(persisted) as usize;
                state.buffer[from..(end - persisted) as usize].to_vec()
            } else {
                Vec::new()
            };
            (end, persisted, tail)
        };

        if offset >= persisted {
            return Ok(tail);
        }

        let disk_len = (end.min(persisted) - offset) as usize;
        let mut out = vec![0u8; length as usize];
        self.read_disk(offset, &mut out[..disk_len])?;
        out[disk_len..].copy_from_slice(&tail);
        Ok(out)
    }

    /// Move the buffered bytes to disk.
    pub fn flush(&self) -> Result<(), LogError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(LogError::Closed);
        }
        self.flush_locked(&mut state)
    }

    /// Truncate the log to zero bytes.
    pub fn clear(&self) -> Result<(), LogError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(LogError::Closed);
        }
        self.file.set_len(0)?;
        state.buffer.clear();
        state.persisted = 0;
        self.whole_size.store(0, Ordering::Release);
        log::debug!("Cleared log {}", self.path.display());
        Ok(())
    }

    /// Total bytes written (disk + buffer).
    pub fn whole_size(&self) -> u64 {
        self.whole_size.load(Ordering::Acquire)
    }

    /// Bytes already on disk.
    pub fn persisted_size(&self) -> u64 {
        self.state.lock().persisted
    }

    /// Bytes held only in memory (the watermark).
    pub fn buffered_size(&self) -> usize {
        self.state.lock().buffer.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Flush and stop accepting reads and writes. Idempotent.
    pub fn close(&self) -> Result<(), LogError> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        self.flush_locked(&mut state)?;
        state.closed = true;
        log::debug!("Closed log {}", self.path.display());
        Ok(())
    }

    /// Close the log and unlink its file.
    pub fn remove(&self) -> Result<(), LogError> {
        self.close()?;
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                log::info!("Removed log {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Start the periodic flusher.
    ///
    /// The task holds only a weak reference and exits once the log is
    /// closed or dropped.
    pub fn spawn_flusher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = self.config.flush_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(log) = weak.upgrade() else { break };
                match log.flush() {
                    Ok(()) => {}
                    Err(LogError::Closed) => break,
                    Err(e) => log::error!("Periodic flush of {} failed: {e}", log.path.display()),
                }
            }
        })
    }

    fn flush_locked(&self, state: &mut LogState) -> Result<(), LogError> {
        if state.buffer.is_empty() {
            return Ok(());
        }

        if let Err(e) = (&self.file).write_all(&state.buffer) {
            self.rollback(state.persisted);
            return Err(e.into());
        }

        state.persisted += state.buffer.len() as u64;
        state.buffer.clear();
        if self.config.sync_on_flush {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Drop a partially written tail so the file matches `persisted` again.
    fn rollback(&self, persisted: u64) {
        if let Err(e) = self.file.set_len(persisted) {
            log::error!("Failed to roll back partial write to {persisted} bytes: {e}");
        }
    }

    fn read_disk(&self, offset: u64, buf: &mut [u8]) -> Result<(), LogError> {
        let mut filled = 0;
        while filled < buf.len() {
            match read_at_offset(&self.file, &mut buf[filled..], offset + filled as u64) {
                Ok(0) => {
                    return Err(LogError::ShortRead {
                        offset,
                        expected: buf.len() as u64,
                        got: filled as u64,
                    })
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn read_at_offset(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn read_at_offset(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

impl Drop for PersistentLog {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("Failed to flush log {} on drop: {e}", self.path.display());
        }
    }
}
