use std::collections::HashMap;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use chrono::DateTime;
use chrono::Utc;
use tokio::sync::Notify;
use tracing::warn;

use crate::simple_id::SimpleId;

/// Character budget for tail views of captured output.
pub const DEFAULT_TAIL_CHARS: usize = 2000;

/// One append to a process's output stream. Sequence numbers start at 1 and
/// are strictly increasing per process.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub sequence_number: u64,
    pub timestamp: DateTime<Utc>,
    pub bytes: Vec<u8>,
}

struct LogBuffer {
    chunks: Vec<OutputChunk>,
    next_seq: u64,
    total_bytes: usize,
}

/// Append-only capture for a single process. Exactly one drain task writes;
/// any number of readers poll `read_since` and park on `notified`.
pub struct ProcessLog {
    buffer: StdMutex<LogBuffer>,
    mirror: StdMutex<Option<File>>,
    degraded: AtomicBool,
    notify: Notify,
    path: PathBuf,
}

impl ProcessLog {
    fn new(path: PathBuf, mirror: Option<File>) -> Self {
        Self {
            buffer: StdMutex::new(LogBuffer {
                chunks: Vec::new(),
                next_seq: 1,
                total_bytes: 0,
            }),
            mirror: StdMutex::new(mirror),
            degraded: AtomicBool::new(false),
            notify: Notify::new(),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn locked(&self) -> MutexGuard<'_, LogBuffer> {
        self.buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record one chunk and mirror it to the log file. A write failure
    /// degrades the mirror permanently rather than failing the capture.
    pub(crate) fn append(&self, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        if !self.degraded.load(Ordering::Relaxed) {
            let failed = {
                let mut mirror = self
                    .mirror
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                match mirror.as_mut() {
                    Some(file) => {
                        let result = file.write_all(&bytes).and_then(|()| file.flush());
                        if result.is_err() {
                            *mirror = None;
                        }
                        result.err()
                    }
                    None => None,
                }
            };
            if let Some(err) = failed {
                self.degraded.store(true, Ordering::Relaxed);
                warn!("log mirror for {} degraded: {err}", self.path.display());
            }
        }

        {
            let mut buffer = self.locked();
            let sequence_number = buffer.next_seq;
            buffer.next_seq += 1;
            buffer.total_bytes += bytes.len();
            buffer.chunks.push(OutputChunk {
                sequence_number,
                timestamp: Utc::now(),
                bytes,
            });
        }
        self.notify.notify_waiters();
    }

    /// Chunks appended after `offset` (the last sequence number the caller
    /// has seen, 0 for none), plus the new offset to resume from.
    pub fn read_since(&self, offset: u64) -> (Vec<OutputChunk>, u64) {
        let buffer = self.locked();
        let fresh: Vec<OutputChunk> = buffer
            .chunks
            .iter()
            .filter(|c| c.sequence_number > offset)
            .cloned()
            .collect();
        let next = fresh
            .last()
            .map(|c| c.sequence_number)
            .unwrap_or(offset);
        (fresh, next)
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// All captured output as lossily-decoded text.
    pub fn text(&self) -> String {
        let buffer = self.locked();
        let mut bytes = Vec::with_capacity(buffer.total_bytes);
        for chunk in &buffer.chunks {
            bytes.extend_from_slice(&chunk.bytes);
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// The trailing `max_chars` characters of the captured text.
    pub fn tail_text(&self, max_chars: usize) -> String {
        tail_chars(&self.text(), max_chars).to_string()
    }
}

fn tail_chars(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

/// Clip `text` to its trailing `max_chars` characters, prefixing a note with
/// the omitted count and a pointer at the live view when anything was cut.
pub fn clip_tail(text: &str, max_chars: usize, simple_id: SimpleId) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    let omitted = count - max_chars;
    format!(
        "[{omitted} earlier characters omitted; `overseer watch {simple_id}` streams the full log]\n{}",
        tail_chars(text, max_chars)
    )
}

/// Per-process log table. Logs outlive their process so `watch` and `ps` can
/// replay output after exit, and survive restarts via the on-disk mirrors.
pub struct OutputChannel {
    logs: StdMutex<HashMap<SimpleId, Arc<ProcessLog>>>,
    logs_dir: PathBuf,
}

impl OutputChannel {
    pub(crate) fn open(home: &Path) -> std::io::Result<Self> {
        let logs_dir = home.join("logs");
        std::fs::create_dir_all(&logs_dir)?;
        Ok(Self {
            logs: StdMutex::new(HashMap::new()),
            logs_dir,
        })
    }

    fn locked(&self) -> MutexGuard<'_, HashMap<SimpleId, Arc<ProcessLog>>> {
        self.logs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn log_path(&self, simple_id: SimpleId) -> PathBuf {
        self.logs_dir.join(format!("proc-{simple_id}.log"))
    }

    /// Create a fresh log for a newly-spawned process, truncating any stale
    /// file left at the same path.
    pub(crate) fn create(&self, simple_id: SimpleId) -> Arc<ProcessLog> {
        let path = self.log_path(simple_id);
        let mirror = match File::create(&path) {
            Ok(file) => Some(file),
            Err(err) => {
                warn!("cannot open log file {}: {err}", path.display());
                None
            }
        };
        let log = Arc::new(ProcessLog::new(path, mirror));
        self.locked().insert(simple_id, Arc::clone(&log));
        log
    }

    pub fn get(&self, simple_id: SimpleId) -> Option<Arc<ProcessLog>> {
        self.locked().get(&simple_id).cloned()
    }

    /// Rehydrate a log from its on-disk mirror after a restart. Existing
    /// content is replayed as a single pre-seeded chunk.
    pub(crate) fn attach(&self, simple_id: SimpleId, log_path: &Path) -> Arc<ProcessLog> {
        if let Some(log) = self.get(simple_id) {
            return log;
        }
        let existing = std::fs::read(log_path).unwrap_or_default();
        let mirror = match OpenOptions::new().append(true).create(true).open(log_path) {
            Ok(file) => Some(file),
            Err(err) => {
                warn!("cannot reopen log file {}: {err}", log_path.display());
                None
            }
        };
        let log = Arc::new(ProcessLog::new(log_path.to_path_buf(), mirror));
        if !existing.is_empty() {
            let mut buffer = log.locked();
            buffer.total_bytes = existing.len();
            buffer.next_seq = 2;
            buffer.chunks.push(OutputChunk {
                sequence_number: 1,
                timestamp: Utc::now(),
                bytes: existing,
            });
        }
        self.locked().insert(simple_id, Arc::clone(&log));
        log
    }

    /// Forget a process's log, optionally deleting the on-disk mirror.
    pub(crate) fn remove(&self, simple_id: SimpleId, delete_file: bool) {
        let log = self.locked().remove(&simple_id);
        if delete_file {
            let path = log
                .map(|l| l.path.clone())
                .unwrap_or_else(|| self.log_path(simple_id));
            if let Err(err) = std::fs::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!("cannot remove log file {}: {err}", path.display());
                }
            }
        }
    }
}
