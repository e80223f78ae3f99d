//! Process and host resource sampling.

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use sysinfo::{Disks, Pid, System};

use crate::{Result, SkjoldError};

/// Resource usage at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemMetrics {
    /// Host-wide CPU usage since the previous sample, 0-100.
    pub cpu_percent: f32,
    /// This process's resident memory as a share of host memory, 0-100.
    pub memory_percent: f32,
    /// Used space on the filesystem mounted at `/`, 0-100.
    pub disk_usage_percent: f32,
    /// File descriptors held by this process (0 where not observable).
    pub open_files: usize,
    pub thread_count: usize,
}

/// Reads [`SystemMetrics`] for the current process.
///
/// Keeps its `sysinfo` state between samples; CPU usage is only meaningful
/// from the second sample onward.
pub struct SystemSampler {
    pid: Pid,
    system: Mutex<System>,
}

impl SystemSampler {
    pub fn new() -> Result<Self> {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| SkjoldError::operation(format!("cannot determine current pid: {e}")))?;
        Ok(Self {
            pid,
            system: Mutex::new(System::new()),
        })
    }

    pub fn sample(&self) -> Result<SystemMetrics> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_cpu();
        system.refresh_memory();
        if !system.refresh_process(self.pid) {
            return Err(SkjoldError::operation(format!(
                "process {} not found",
                self.pid
            )));
        }
        let process = system
            .process(self.pid)
            .ok_or_else(|| SkjoldError::operation(format!("process {} not found", self.pid)))?;

        let total_memory = system.total_memory();
        let memory_percent = if total_memory == 0 {
            0.0
        } else {
            (process.memory() as f64 / total_memory as f64 * 100.0) as f32
        };

        let thread_count = count_entries(Path::new("/proc/self/task"))
            .or_else(|| process.tasks().map(|tasks| tasks.len()))
            .unwrap_or(1);

        Ok(SystemMetrics {
            cpu_percent: system.global_cpu_info().cpu_usage(),
            memory_percent,
            disk_usage_percent: root_disk_usage(),
            open_files: count_entries(Path::new("/proc/self/fd")).unwrap_or(0),
            thread_count,
        })
    }
}

fn root_disk_usage() -> f32 {
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .find(|disk| disk.mount_point() == Path::new("/"))
        .filter(|disk| disk.total_space() > 0)
        .map(|disk| {
            let used = disk.total_space().saturating_sub(disk.available_space());
            (used as f64 / disk.total_space() as f64 * 100.0) as f32
        })
        .unwrap_or(0.0)
}

/// Number of entries in a procfs directory, if it exists.
fn count_entries(dir: &Path) -> Option<usize> {
    std::fs::read_dir(dir).ok().map(|entries| entries.count())
}
