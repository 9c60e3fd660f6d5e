use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;
use tracing::warn;

use crate::simple_id::SimpleId;

/// Lifecycle state of a tracked process. Transitions are one-way: once a
/// record leaves `Running` it never goes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProcessStatus {
    Running,
    Completed { exit_code: Option<i32> },
    Killed,
    TimedOut,
}

impl ProcessStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ProcessStatus::Running)
    }

    pub fn label(self) -> String {
        match self {
            ProcessStatus::Running => "running".to_string(),
            ProcessStatus::Completed {
                exit_code: Some(code),
            } => format!("exited {code}"),
            ProcessStatus::Completed { exit_code: None } => "exited".to_string(),
            ProcessStatus::Killed => "killed".to_string(),
            ProcessStatus::TimedOut => "timed out".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub simple_id: SimpleId,
    pub native_pid: u32,
    pub command_text: String,
    pub preview: String,
    pub start_time: DateTime<Utc>,
    pub status: ProcessStatus,
    pub is_interactive: bool,
    pub log_path: PathBuf,
    pub cwd: PathBuf,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    next_id: u32,
    records: Vec<ProcessRecord>,
}

struct RegistryState {
    next_id: u32,
    records: BTreeMap<u32, ProcessRecord>,
}

/// Durable index of every process the supervisor knows about. Mutations are
/// mirrored to `registry.json` in the supervisor home so the table survives
/// restarts of the host application.
pub struct ProcessRegistry {
    state: Mutex<RegistryState>,
    index_path: PathBuf,
}

impl ProcessRegistry {
    /// Load the index from `home`, reconciling records against live pids:
    /// any record still marked `Running` whose pid is gone is flipped to
    /// `Completed` with an unknown exit code.
    pub fn open(home: &Path) -> std::io::Result<Self> {
        let index_path = home.join("registry.json");
        let mut index = match std::fs::read(&index_path) {
            Ok(bytes) => serde_json::from_slice::<IndexFile>(&bytes).unwrap_or_else(|err| {
                warn!("discarding unreadable process index: {err}");
                IndexFile::default()
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => IndexFile::default(),
            Err(err) => return Err(err),
        };

        let mut reconciled = 0usize;
        for record in &mut index.records {
            if record.status == ProcessStatus::Running && !pid_alive(record.native_pid) {
                record.status = ProcessStatus::Completed { exit_code: None };
                reconciled += 1;
            }
        }
        if reconciled > 0 {
            info!("reconciled {reconciled} stale running record(s) on startup");
        }

        let records: BTreeMap<u32, ProcessRecord> = index
            .records
            .into_iter()
            .map(|r| (r.simple_id.0, r))
            .collect();
        let max_seen = records.keys().next_back().copied().unwrap_or(0);
        let next_id = index.next_id.max(max_seen + 1).max(1);

        let registry = Self {
            state: Mutex::new(RegistryState { next_id, records }),
            index_path,
        };
        if reconciled > 0 {
            registry.persist();
        }
        Ok(registry)
    }

    pub(crate) fn next_simple_id(&self) -> SimpleId {
        let mut state = self.locked();
        let id = state.next_id;
        state.next_id += 1;
        SimpleId(id)
    }

    pub(crate) fn insert(&self, record: ProcessRecord) {
        {
            let mut state = self.locked();
            state.records.insert(record.simple_id.0, record);
        }
        self.persist();
    }

    pub fn get(&self, simple_id: SimpleId) -> Option<ProcessRecord> {
        let state = self.locked();
        state.records.get(&simple_id.0).cloned()
    }

    /// Resolve a user-supplied reference: simple id first, then native pid.
    /// Simple ids always win when a number is valid as both.
    pub fn resolve(&self, reference: &str) -> Option<ProcessRecord> {
        let number: u32 = reference.trim().parse().ok()?;
        let state = self.locked();
        if let Some(record) = state.records.get(&number) {
            return Some(record.clone());
        }
        state
            .records
            .values()
            .filter(|r| r.native_pid == number)
            .max_by_key(|r| r.start_time)
            .cloned()
    }

    /// The default target when no reference is given: the most recently
    /// started running process, falling back to the most recent overall.
    pub fn most_recent(&self) -> Option<ProcessRecord> {
        let state = self.locked();
        state
            .records
            .values()
            .filter(|r| r.status == ProcessStatus::Running)
            .max_by_key(|r| r.start_time)
            .or_else(|| state.records.values().max_by_key(|r| r.start_time))
            .cloned()
    }

    /// All records, newest first.
    pub fn list(&self) -> Vec<ProcessRecord> {
        let state = self.locked();
        let mut records: Vec<ProcessRecord> = state.records.values().cloned().collect();
        records.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        records
    }

    /// Flip a record out of `Running`. Terminal states are sticky so a
    /// natural exit observed after a kill cannot overwrite `Killed`.
    pub(crate) fn mark_terminal(&self, simple_id: SimpleId, status: ProcessStatus) {
        let changed = {
            let mut state = self.locked();
            match state.records.get_mut(&simple_id.0) {
                Some(record) if !record.status.is_terminal() => {
                    record.status = status;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.persist();
        }
    }

    pub(crate) fn remove(&self, simple_id: SimpleId) -> Option<ProcessRecord> {
        let removed = {
            let mut state = self.locked();
            state.records.remove(&simple_id.0)
        };
        if removed.is_some() {
            self.persist();
        }
        removed
    }

    /// Drop a terminal record from the index. Running records are kept; the
    /// caller must kill first.
    pub(crate) fn purge(&self, simple_id: SimpleId) -> Option<ProcessRecord> {
        let removed = {
            let mut state = self.locked();
            match state.records.get(&simple_id.0) {
                Some(record) if record.status.is_terminal() => state.records.remove(&simple_id.0),
                _ => None,
            }
        };
        if removed.is_some() {
            self.persist();
        }
        removed
    }

    /// Drop terminal records older than `max_age`, then trim the remaining
    /// terminal set to at most `max_count`, oldest first. Returns the purged
    /// records so callers can delete their logs.
    pub(crate) fn sweep(
        &self,
        max_age: chrono::Duration,
        max_count: usize,
    ) -> Vec<ProcessRecord> {
        let removed = {
            let mut state = self.locked();
            let cutoff = Utc::now() - max_age;
            let mut victims: Vec<u32> = state
                .records
                .values()
                .filter(|r| r.status.is_terminal() && r.start_time < cutoff)
                .map(|r| r.simple_id.0)
                .collect();

            let mut terminal: Vec<&ProcessRecord> = state
                .records
                .values()
                .filter(|r| r.status.is_terminal() && !victims.contains(&r.simple_id.0))
                .collect();
            if terminal.len() > max_count {
                terminal.sort_by_key(|r| r.start_time);
                let excess = terminal.len() - max_count;
                victims.extend(terminal.iter().take(excess).map(|r| r.simple_id.0));
            }

            victims
                .into_iter()
                .filter_map(|id| state.records.remove(&id))
                .collect::<Vec<_>>()
        };
        if !removed.is_empty() {
            self.persist();
        }
        removed
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Rewrite the on-disk index from the current in-memory table. Failure
    /// is logged, not fatal: the in-memory view stays authoritative.
    fn persist(&self) {
        let snapshot = {
            let state = self.locked();
            IndexFile {
                next_id: state.next_id,
                records: state.records.values().cloned().collect(),
            }
        };
        if let Err(err) = write_index(&self.index_path, &snapshot) {
            warn!("failed to persist process index: {err}");
        }
    }
}

fn write_index(path: &Path, index: &IndexFile) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(index)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    let tmp = path.with_extension("json.tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(&json)?;
    file.flush()?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Best-effort liveness probe. On unix, signal 0 checks existence without
/// delivering anything; EPERM still means the pid exists.
#[cfg(unix)]
pub(crate) fn pid_alive(pid: u32) -> bool {
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub(crate) fn pid_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(id: u32, pid: u32, status: ProcessStatus) -> ProcessRecord {
        ProcessRecord {
            simple_id: SimpleId(id),
            native_pid: pid,
            command_text: format!("echo {id}"),
            preview: format!("echo {id}"),
            start_time: Utc::now(),
            status,
            is_interactive: false,
            log_path: PathBuf::from(format!("/tmp/proc-{id}.log")),
            cwd: PathBuf::from("/tmp"),
        }
    }

    #[test]
    fn simple_id_wins_over_pid_collision() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = ProcessRegistry::open(dir.path()).expect("open");
        // Process whose pid happens to equal another process's simple id.
        registry.insert(record(3, 900, ProcessStatus::Running));
        registry.insert(record(7, 3, ProcessStatus::Running));

        let hit = registry.resolve("3").expect("resolved");
        assert_eq!(hit.simple_id, SimpleId(3));

        let by_pid = registry.resolve("900").expect("resolved");
        assert_eq!(by_pid.simple_id, SimpleId(3));
    }

    #[test]
    fn terminal_status_is_sticky() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = ProcessRegistry::open(dir.path()).expect("open");
        registry.insert(record(1, 42, ProcessStatus::Running));
        registry.mark_terminal(SimpleId(1), ProcessStatus::Killed);
        registry.mark_terminal(
            SimpleId(1),
            ProcessStatus::Completed { exit_code: Some(0) },
        );
        assert_eq!(
            registry.get(SimpleId(1)).expect("record").status,
            ProcessStatus::Killed
        );
    }

    #[test]
    fn purge_skips_running_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = ProcessRegistry::open(dir.path()).expect("open");
        registry.insert(record(1, std::process::id(), ProcessStatus::Running));
        assert!(registry.purge(SimpleId(1)).is_none());
        registry.mark_terminal(SimpleId(1), ProcessStatus::Completed { exit_code: Some(0) });
        assert!(registry.purge(SimpleId(1)).is_some());
    }

    #[test]
    fn reload_reconciles_dead_running_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let registry = ProcessRegistry::open(dir.path()).expect("open");
            // Pid that cannot be alive in the test environment.
            registry.insert(record(1, u32::MAX - 1, ProcessStatus::Running));
        }
        let reloaded = ProcessRegistry::open(dir.path()).expect("reopen");
        let rec = reloaded.get(SimpleId(1)).expect("record");
        assert_eq!(rec.status, ProcessStatus::Completed { exit_code: None });
        // Id allocation resumes above the highest persisted id.
        assert_eq!(reloaded.next_simple_id(), SimpleId(2));
    }

    #[cfg(unix)]
    #[test]
    fn reload_keeps_running_records_with_live_pids() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let registry = ProcessRegistry::open(dir.path()).expect("open");
            // Our own pid is definitely alive.
            registry.insert(record(1, std::process::id(), ProcessStatus::Running));
        }
        let reloaded = ProcessRegistry::open(dir.path()).expect("reopen");
        let rec = reloaded.get(SimpleId(1)).expect("record");
        assert_eq!(rec.status, ProcessStatus::Running);
    }

    #[test]
    fn most_recent_prefers_running() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = ProcessRegistry::open(dir.path()).expect("open");
        let mut old = record(1, std::process::id(), ProcessStatus::Running);
        old.start_time = Utc::now() - chrono::Duration::seconds(60);
        registry.insert(old);
        registry.insert(record(2, 999_999, ProcessStatus::Completed { exit_code: Some(0) }));
        assert_eq!(registry.most_recent().expect("record").simple_id, SimpleId(1));
    }

    #[test]
    fn sweep_trims_old_and_excess_terminal_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = ProcessRegistry::open(dir.path()).expect("open");
        let mut ancient = record(1, 1, ProcessStatus::Completed { exit_code: Some(0) });
        ancient.start_time = Utc::now() - chrono::Duration::days(10);
        registry.insert(ancient);
        registry.insert(record(2, 2, ProcessStatus::Killed));
        registry.insert(record(3, 3, ProcessStatus::Running));

        let removed = registry.sweep(chrono::Duration::days(7), 0);
        let mut ids: Vec<u32> = removed.iter().map(|r| r.simple_id.0).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
        // Running records survive any sweep.
        assert!(registry.get(SimpleId(3)).is_some());
    }
}
