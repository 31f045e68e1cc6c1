use std::path::{Path, PathBuf};

use sysinfo::{Pid, System};

use fleet_protocol::{AgentHealthState, RepositoryState, RepositoryStatus};

/// Process-level health of the agent itself. Never fails: values that cannot
/// be read fall back to zero.
pub struct AgentHealthProbe {
    system: System,
    pid: Option<Pid>,
}

impl Default for AgentHealthProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentHealthProbe {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::warn!(error = %e, "Cannot resolve own pid; process metrics disabled");
                None
            }
        };
        Self {
            system: System::new(),
            pid,
        }
    }

    /// Take a fresh reading. Update bookkeeping is carried over from
    /// `previous`; the probe runner advances it after the round.
    pub fn probe(&mut self, client_count: usize, code_directories: &[PathBuf], previous: &AgentHealthState) -> AgentHealthState {
        let (thread_count, memory_usage_mb) = self.process_metrics();
        AgentHealthState {
            thread_count,
            memory_usage_mb,
            client_count,
            last_update: previous.last_update,
            update_count: previous.update_count,
            repositories: code_directories.iter().map(|dir| repository_status(dir)).collect(),
        }
    }

    fn process_metrics(&mut self) -> (usize, u64) {
        let Some(pid) = self.pid else {
            return (0, 0);
        };
        if !self.system.refresh_process(pid) {
            return (0, 0);
        }
        match self.system.process(pid) {
            Some(process) => {
                let threads = process.tasks().map(|t| t.len()).filter(|n| *n > 0).unwrap_or(1);
                let memory = private_memory_bytes().unwrap_or_else(|| process.memory());
                (threads, memory / 1024 / 1024)
            }
            None => (0, 0),
        }
    }
}

/// Private memory of this process in bytes. Linux only; elsewhere the caller
/// falls back to resident set size.
fn private_memory_bytes() -> Option<u64> {
    let rollup = std::fs::read_to_string("/proc/self/smaps_rollup").ok()?;
    private_kb(&rollup).map(|kb| kb * 1024)
}

/// Sum of the `Private_Clean` and `Private_Dirty` lines of an smaps rollup.
fn private_kb(rollup: &str) -> Option<u64> {
    let mut total = None;
    for line in rollup.lines() {
        let Some(rest) = line
            .strip_prefix("Private_Clean:")
            .or_else(|| line.strip_prefix("Private_Dirty:"))
        else {
            continue;
        };
        let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
        total = Some(total.unwrap_or(0) + kb);
    }
    total
}

fn repository_status(dir: &Path) -> RepositoryStatus {
    let state = if dir.join(".git").exists() {
        RepositoryState::Present
    } else {
        RepositoryState::Missing
    };
    RepositoryStatus {
        path: dir.to_path_buf(),
        state,
    }
}
