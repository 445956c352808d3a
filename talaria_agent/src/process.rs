//! Process tracker: long-lived per-process records reused across polls.
//!
//! Resolving a process's display name and owner is the expensive part of a
//! process listing, so it happens once per process lifetime. Each pass
//! re-enumerates pids, reuses or creates a [`ProcessRecord`] per pid, derives
//! this tick's CPU and memory figures, and drops records for pids that were
//! not seen. Passes never overlap: a caller arriving mid-pass gets the
//! previous completed listing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind, Users};
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::types::ProcessRow;

/// Rows shipped in each snapshot.
pub const TOP_PROCESSES: usize = 25;

const MB: f64 = 1024.0 * 1024.0;

/// Per-process state that survives across passes.
#[derive(Debug, PartialEq)]
pub struct ProcessRecord {
    pub pid: u32,
    /// Start time distinguishes a reused pid from the process we cached.
    pub start_time: u64,
    pub name: String,
    pub user: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub cpu: f32,
    pub rss_bytes: u64,
}

/// Where the tracker gets its process data from.
pub trait ProcessSource: Send {
    /// Re-enumerate live processes as `(pid, start_time)` pairs.
    fn refresh(&mut self) -> anyhow::Result<Vec<(u32, u64)>>;
    /// Resolve `(display name, owner)`. Called once per process lifetime.
    fn describe(&mut self, pid: u32) -> Option<(String, String)>;
    /// This pass's usage figures.
    fn usage(&self, pid: u32) -> Option<Usage>;
    fn total_memory(&self) -> u64;
}

pub struct ProcessTracker {
    // Held for a whole pass; `try_lock` failing means a pass is running.
    pass: Mutex<Box<dyn ProcessSource>>,
    records: Mutex<HashMap<u32, Arc<ProcessRecord>>>,
    last: Mutex<Vec<ProcessRow>>,
}

impl ProcessTracker {
    pub fn new(source: Box<dyn ProcessSource>) -> Self {
        Self {
            pass: Mutex::new(source),
            records: Mutex::new(HashMap::new()),
            last: Mutex::new(Vec::new()),
        }
    }

    /// Tracker backed by the host's process table.
    pub fn host() -> Self {
        Self::new(Box::new(SysinfoProcesses::new()))
    }

    /// Top `n` processes by CPU, descending.
    pub fn list_top(&self, n: usize) -> Vec<ProcessRow> {
        let mut source = match self.pass.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                debug!("process pass already running, serving previous listing");
                return self.previous(n);
            }
            // A panicked pass leaves nothing half-written that we rely on.
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
        };

        let observed = match source.refresh() {
            Ok(pids) => pids,
            Err(e) => {
                warn!(error = %e, "process enumeration failed");
                return self.previous(n);
            }
        };
        let total_mem = source.total_memory();
        let known: HashMap<u32, Arc<ProcessRecord>> = lock(&self.records).clone();

        let mut seen = HashMap::with_capacity(observed.len());
        let mut rows = Vec::with_capacity(observed.len());
        for (pid, start_time) in observed {
            let record = match known.get(&pid) {
                Some(r) if r.start_time == start_time => r.clone(),
                _ => {
                    let Some((name, user)) = source.describe(pid) else {
                        continue;
                    };
                    Arc::new(ProcessRecord {
                        pid,
                        start_time,
                        name,
                        user,
                    })
                }
            };
            if let Some(usage) = source.usage(pid) {
                rows.push(derive_row(&record, usage, total_mem));
            }
            seen.insert(pid, record);
        }
        // Anything not observed this pass is gone.
        *lock(&self.records) = seen;

        rows.sort_by(|a, b| b.cpu.total_cmp(&a.cpu));
        *lock(&self.last) = rows.clone();
        rows.truncate(n);
        rows
    }

    /// The cached record for `pid`, if the last pass observed it.
    pub fn record(&self, pid: u32) -> Option<Arc<ProcessRecord>> {
        lock(&self.records).get(&pid).cloned()
    }

    pub fn tracked(&self) -> usize {
        lock(&self.records).len()
    }

    /// Display name for `pid` from the record table, without touching the OS.
    pub fn resolve_name(&self, pid: u32) -> Option<String> {
        lock(&self.records).get(&pid).map(|r| r.name.clone())
    }

    fn previous(&self, n: usize) -> Vec<ProcessRow> {
        lock(&self.last).iter().take(n).cloned().collect()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn derive_row(record: &ProcessRecord, usage: Usage, total_mem: u64) -> ProcessRow {
    let mem_percent = if total_mem > 0 {
        usage.rss_bytes as f64 / total_mem as f64 * 100.0
    } else {
        0.0
    };
    ProcessRow {
        pid: record.pid,
        name: record.name.clone(),
        cpu: finite_or_zero(usage.cpu),
        mem_mb: usage.rss_bytes as f64 / MB,
        mem_percent,
        user: record.user.clone(),
    }
}

fn finite_or_zero(v: f32) -> f32 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

/// Host process table through a long-lived sysinfo `System`, so per-process
/// CPU usage is measured between consecutive passes.
pub struct SysinfoProcesses {
    sys: System,
    users: Users,
}

impl SysinfoProcesses {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        Self {
            sys,
            users: Users::new_with_refreshed_list(),
        }
    }

    fn owner_name(&mut self, uid: &sysinfo::Uid) -> String {
        if let Some(user) = self.users.get_user_by_id(uid) {
            return user.name().to_string();
        }
        // New account since startup; reload once and retry.
        self.users = Users::new_with_refreshed_list();
        self.users
            .get_user_by_id(uid)
            .map(|u| u.name().to_string())
            .unwrap_or_default()
    }
}

impl Default for SysinfoProcesses {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSource for SysinfoProcesses {
    fn refresh(&mut self) -> anyhow::Result<Vec<(u32, u64)>> {
        self.sys.refresh_memory();
        self.sys.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing()
                .with_cpu()
                .with_memory()
                .with_user(UpdateKind::OnlyIfNotSet),
        );
        Ok(self
            .sys
            .processes()
            .values()
            .map(|p| (p.pid().as_u32(), p.start_time()))
            .collect())
    }

    fn describe(&mut self, pid: u32) -> Option<(String, String)> {
        let process = self.sys.process(Pid::from_u32(pid))?;
        let raw = process.name().to_string_lossy().into_owned();
        let uid = process.user_id().cloned();
        let name = match raw.rsplit('/').next() {
            Some(base) if !base.is_empty() => base.to_string(),
            _ => "unknown".to_string(),
        };
        let user = match uid {
            Some(uid) => self.owner_name(&uid),
            None => String::new(),
        };
        Some((name, user))
    }

    fn usage(&self, pid: u32) -> Option<Usage> {
        let p = self.sys.process(Pid::from_u32(pid))?;
        Some(Usage {
            cpu: p.cpu_usage(),
            rss_bytes: p.memory(),
        })
    }

    fn total_memory(&self) -> u64 {
        self.sys.total_memory()
    }
}

/// Kill `pid`, provided it belongs to the user the agent runs as (a root agent
/// may kill anything).
pub fn terminate(pid: u32) -> Result<(), ApiError> {
    if pid == std::process::id() {
        return Err(ApiError::Forbidden(
            "Refusing to terminate the agent itself".to_string(),
        ));
    }
    let target = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[target]),
        true,
        ProcessRefreshKind::nothing().with_user(UpdateKind::Always),
    );
    let process = sys
        .process(target)
        .ok_or_else(|| ApiError::NotFound("Process not found or access denied".to_string()))?;

    #[cfg(unix)]
    {
        // SAFETY: geteuid has no preconditions and cannot fail.
        let me = unsafe { libc::geteuid() };
        let owner = process.user_id().map(|uid| **uid);
        if me != 0 && owner != Some(me) {
            warn!(pid, ?owner, agent_uid = me, "refused to kill foreign process");
            return Err(ApiError::Forbidden(
                "Unauthorized: You can only kill your own processes".to_string(),
            ));
        }
    }

    if !process.kill() {
        return Err(ApiError::Internal(anyhow::anyhow!(
            "Failed to kill process {pid}"
        )));
    }
    tracing::info!(pid, "process killed on request");
    Ok(())
}
