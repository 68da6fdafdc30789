//! Persisted conversation history: an append-only JSON array of `{timestamp, message, response}`.
//!
//! Every read-modify-write holds an exclusive lock on a sidecar `.lock` file, so the CLI and the
//! desktop app can share one history file.

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Display format for entry timestamps, e.g. "03:41 PM · Oct 19, 2026".
pub const TIMESTAMP_FORMAT: &str = "%I:%M %p · %b %d, %Y";

/// How long an operation waits for another process to release the history lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// One saved exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub timestamp: String,
    pub message: String,
    pub response: String,
}

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("history file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("history file {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("history file {path} is locked by another process")]
    Locked { path: PathBuf },
}

/// File-backed history store.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
    lock_timeout: Duration,
}

impl HistoryStore {
    /// Open the store, creating parent directories and an empty `[]` file if needed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, HistoryError> {
        let store = Self {
            path: path.into(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        };
        if let Some(parent) = store.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| store.io_err(e))?;
        }
        if !store.path.exists() {
            store.write_entries(&[])?;
            log::info!("history: created {}", store.path.display());
        }
        Ok(store)
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All entries, oldest first.
    pub fn load(&self) -> Result<Vec<ConversationEntry>, HistoryError> {
        let _lock = self.lock()?;
        self.read_entries()
    }

    /// Append one entry stamped with the current local time and return it.
    pub fn append(
        &self,
        message: &str,
        response: &str,
    ) -> Result<ConversationEntry, HistoryError> {
        let entry = ConversationEntry {
            timestamp: chrono::Local::now().format(TIMESTAMP_FORMAT).to_string(),
            message: message.to_string(),
            response: response.to_string(),
        };
        let _lock = self.lock()?;
        let mut entries = self.read_entries()?;
        entries.push(entry.clone());
        self.write_entries(&entries)?;
        log::debug!("history: saved entry {} to {}", entries.len(), self.path.display());
        Ok(entry)
    }

    /// Remove every entry.
    pub fn clear(&self) -> Result<(), HistoryError> {
        let _lock = self.lock()?;
        self.write_entries(&[])?;
        log::info!("history: cleared {}", self.path.display());
        Ok(())
    }

    fn io_err(&self, source: std::io::Error) -> HistoryError {
        HistoryError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn read_entries(&self) -> Result<Vec<ConversationEntry>, HistoryError> {
        let s = match fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_err(e)),
        };
        if s.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&s).map_err(|source| HistoryError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    /// Write through a temp file and rename so a crash never leaves a half-written array.
    fn write_entries(&self, entries: &[ConversationEntry]) -> Result<(), HistoryError> {
        let json = serde_json::to_string_pretty(entries).map_err(|source| HistoryError::Parse {
            path: self.path.clone(),
            source,
        })?;
        let tmp = self.sidecar("tmp");
        fs::write(&tmp, json).map_err(|e| self.io_err(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))
    }

    /// Take the exclusive lock, polling until `lock_timeout` elapses.
    fn lock(&self) -> Result<HistoryLock, HistoryError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(self.sidecar("lock"))
            .map_err(|e| self.io_err(e))?;
        let deadline = Instant::now() + self.lock_timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(HistoryLock(file)),
                Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                    if Instant::now() >= deadline {
                        log::warn!(
                            "history: {} still locked after {:?}",
                            self.path.display(),
                            self.lock_timeout
                        );
                        return Err(HistoryError::Locked {
                            path: self.path.clone(),
                        });
                    }
                    std::thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => return Err(self.io_err(e)),
            }
        }
    }

    fn sidecar(&self, ext: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".");
        name.push(ext);
        self.path.with_file_name(name)
    }
}

/// Held exclusive lock; released on drop.
struct HistoryLock(File);

impl Drop for HistoryLock {
    fn drop(&mut self) {
        let _ = self.0.unlock();
    }
}
