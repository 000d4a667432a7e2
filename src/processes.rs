//! Running process enumeration.

use std::sync::Mutex;

use sysinfo::Pid;
use sysinfo::ProcessesToUpdate;
use sysinfo::System;
use tracing::debug;
use tracing::warn;

use crate::domain::ProcessInfo;

/// Process table backed by `sysinfo`, reused between refreshes.
///
/// Enumeration is best-effort: when a refresh comes back empty the previous
/// snapshot is returned instead.
pub struct ProcessTable {
    system: Mutex<System>,
    last: Mutex<Vec<ProcessInfo>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            last: Mutex::new(Vec::new()),
        }
    }

    /// All running processes, largest resident memory first.
    pub fn snapshot(&self) -> Vec<ProcessInfo> {
        let fresh = match self.system.lock() {
            Ok(mut system) => {
                system.refresh_processes(ProcessesToUpdate::All, true);
                system
                    .processes()
                    .iter()
                    .map(|(pid, process)| ProcessInfo {
                        pid: pid.as_u32(),
                        name: process.name().to_string_lossy().into_owned(),
                        memory: process.memory(),
                    })
                    .collect::<Vec<_>>()
            }
            Err(_) => Vec::new(),
        };

        let Ok(mut last) = self.last.lock() else {
            return sort_by_memory(fresh);
        };

        if fresh.is_empty() {
            warn!("Process enumeration returned nothing, serving last snapshot");
            return last.clone();
        }

        let sorted = sort_by_memory(fresh);
        debug!("Enumerated {} processes", sorted.len());
        last.clone_from(&sorted);
        sorted
    }

    /// Executable name of `pid`, if it is still running.
    pub fn name_of(&self, pid: u32) -> Option<String> {
        let pid = Pid::from_u32(pid);
        let mut system = self.system.lock().ok()?;
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system
            .process(pid)
            .map(|process| process.name().to_string_lossy().into_owned())
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

fn sort_by_memory(mut processes: Vec<ProcessInfo>) -> Vec<ProcessInfo> {
    processes.sort_by(|a, b| b.memory.cmp(&a.memory).then_with(|| a.pid.cmp(&b.pid)));
    processes
}
