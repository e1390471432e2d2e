/// Cgroup management for per-group and per-process resource accounting
use crate::types::{InvokerError, Result};
use std::fs;
use std::path::{Path, PathBuf};

const CGROUP_BASE: &str = "/sys/fs/cgroup";
const CONTROLLERS: [&str; 2] = ["memory", "cpuacct"];

/// A group-level cgroup subtree with one child subtree per process.
///
/// Degrades gracefully when cgroups are unavailable or not writable:
/// accounting reads return zero and limits are not enforced, matching the
/// behavior of running unprivileged.
pub struct ControlGroup {
    name: String,
    paths: Vec<(&'static str, PathBuf)>,
    has_cgroup_support: bool,
}

/// Accounting view of one process's subtree
pub struct ProcessCgroup {
    paths: Vec<(&'static str, PathBuf)>,
    has_cgroup_support: bool,
}

impl ControlGroup {
    pub fn create(name: &str) -> Result<Self> {
        if name.is_empty() || name.len() > 255 {
            return Err(InvokerError::Cgroup(
                "Invalid cgroup name length".to_string(),
            ));
        }
        let sanitized = name.replace('/', "_").replace("..", "_");

        if !Self::cgroups_available() {
            log::warn!("Cgroups not available; resource accounting disabled");
            return Ok(Self {
                name: sanitized,
                paths: Vec::new(),
                has_cgroup_support: false,
            });
        }

        let mut paths = Vec::new();
        for controller in CONTROLLERS {
            let path = Path::new(CGROUP_BASE).join(controller).join(&sanitized);
            match fs::create_dir_all(&path) {
                Ok(()) => paths.push((controller, path)),
                Err(e) => {
                    log::warn!("Failed to create cgroup {}: {}", path.display(), e);
                }
            }
        }

        if paths.is_empty() {
            log::warn!("No cgroup controller is writable; accounting disabled");
            return Ok(Self {
                name: sanitized,
                paths,
                has_cgroup_support: false,
            });
        }

        Ok(Self {
            name: sanitized,
            paths,
            has_cgroup_support: true,
        })
    }

    pub fn cgroups_available() -> bool {
        Path::new("/proc/cgroups").exists() && Path::new(CGROUP_BASE).exists()
    }

    pub fn is_active(&self) -> bool {
        self.has_cgroup_support
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create the per-process subtree for one child
    pub fn child(&self, id: usize) -> Result<ProcessCgroup> {
        if !self.has_cgroup_support {
            return Ok(ProcessCgroup {
                paths: Vec::new(),
                has_cgroup_support: false,
            });
        }

        let mut paths = Vec::new();
        for (controller, group_path) in &self.paths {
            let path = group_path.join(id.to_string());
            fs::create_dir_all(&path).map_err(|e| {
                InvokerError::Cgroup(format!(
                    "Failed to create cgroup {}: {}",
                    path.display(),
                    e
                ))
            })?;
            paths.push((*controller, path));
        }

        Ok(ProcessCgroup {
            paths,
            has_cgroup_support: true,
        })
    }

    /// Pids currently accounted in this subtree, children included
    pub fn tasks(&self) -> Vec<i32> {
        let mut pids = Vec::new();
        for (_, group_path) in &self.paths {
            collect_tasks(group_path, &mut pids);
        }
        pids.sort_unstable();
        pids.dedup();
        pids
    }

    /// SIGKILL every pid accounted in the subtree. Belt-and-braces mass kill
    /// backing up the per-pid termination path.
    pub fn kill_all(&self) {
        for pid in self.tasks() {
            unsafe {
                libc::kill(pid, libc::SIGKILL);
            }
        }
    }

    /// Remove the subtree; processes still inside are moved to the root
    /// hierarchy first.
    pub fn remove(&self) {
        if !self.has_cgroup_support {
            return;
        }

        for (controller, group_path) in &self.paths {
            if !group_path.exists() {
                continue;
            }
            let root_tasks = Path::new(CGROUP_BASE).join(controller).join("tasks");
            let mut children: Vec<PathBuf> = Vec::new();
            if let Ok(entries) = fs::read_dir(group_path) {
                for entry in entries.flatten() {
                    if entry.path().is_dir() {
                        children.push(entry.path());
                    }
                }
            }
            children.push(group_path.clone());

            for dir in children {
                if let Ok(tasks) = fs::read_to_string(dir.join("tasks")) {
                    for line in tasks.lines() {
                        let _ = fs::write(&root_tasks, line.trim());
                    }
                }
                if let Err(e) = fs::remove_dir(&dir) {
                    log::warn!("Failed to remove cgroup {}: {}", dir.display(), e);
                }
            }
        }
    }
}

impl Drop for ControlGroup {
    fn drop(&mut self) {
        // Unwinding must not leak children: whatever is still accounted
        // here dies before the subtree goes away.
        self.kill_all();
        self.remove();
    }
}

fn collect_tasks(dir: &Path, pids: &mut Vec<i32>) {
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            if entry.path().is_dir() {
                collect_tasks(&entry.path(), pids);
            }
        }
    }
    if let Ok(tasks) = fs::read_to_string(dir.join("tasks")) {
        for line in tasks.lines() {
            if let Ok(pid) = line.trim().parse::<i32>() {
                pids.push(pid);
            }
        }
    }
}

fn read_u64(path: &Path) -> Option<u64> {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

impl ProcessCgroup {
    fn controller_path(&self, controller: &str) -> Option<&Path> {
        self.paths
            .iter()
            .find(|(c, _)| *c == controller)
            .map(|(_, p)| p.as_path())
    }

    /// Path the child writes its pid to in order to join the subtree,
    /// one per controller.
    pub fn attach_paths(&self) -> Vec<PathBuf> {
        self.paths.iter().map(|(_, p)| p.join("tasks")).collect()
    }

    pub fn set_memory_limit(&self, limit_bytes: u64) -> Result<()> {
        if !self.has_cgroup_support {
            log::warn!("Memory limit requested but cgroups are unavailable");
            return Ok(());
        }
        let memory = self.controller_path("memory").ok_or_else(|| {
            InvokerError::Cgroup("Memory controller path not available".to_string())
        })?;

        fs::write(memory.join("memory.limit_in_bytes"), limit_bytes.to_string()).map_err(
            |e| InvokerError::Cgroup(format!("Failed to set memory limit: {}", e)),
        )?;

        // memory+swap must match the memory cap or the limit is evadable
        let memsw = memory.join("memory.memsw.limit_in_bytes");
        if memsw.exists() {
            fs::write(&memsw, limit_bytes.to_string()).map_err(|e| {
                InvokerError::Cgroup(format!("Failed to set memory+swap limit: {}", e))
            })?;
        }

        let swappiness = memory.join("memory.swappiness");
        if swappiness.exists() {
            let _ = fs::write(&swappiness, "0");
        }

        Ok(())
    }

    /// Cumulative CPU time in nanoseconds from cpuacct.usage
    pub fn cpu_usage_ns(&self) -> u64 {
        self.controller_path("cpuacct")
            .and_then(|p| read_u64(&p.join("cpuacct.usage")))
            .unwrap_or(0)
    }

    /// Peak memory usage in bytes
    pub fn memory_peak_bytes(&self) -> u64 {
        self.controller_path("memory")
            .and_then(|p| read_u64(&p.join("memory.max_usage_in_bytes")))
            .unwrap_or(0)
    }

    /// Whether the kernel OOM killer fired inside this subtree
    pub fn oom_killed(&self) -> bool {
        let memory = match self.controller_path("memory") {
            Some(path) => path,
            None => return false,
        };

        if let Ok(oom_control) = fs::read_to_string(memory.join("memory.oom_control")) {
            if oom_control.contains("under_oom 1") {
                return true;
            }
        }

        if let Ok(stat) = fs::read_to_string(memory.join("memory.stat")) {
            for line in stat.lines() {
                if let Some(count) = line.strip_prefix("oom_kill ") {
                    if count.trim().parse::<u64>().unwrap_or(0) > 0 {
                        return true;
                    }
                }
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_name() {
        assert!(ControlGroup::create("").is_err());
    }

    #[test]
    fn sanitizes_name() {
        let group = ControlGroup::create("a/b..c").unwrap();
        assert_eq!(group.name(), "a_b_c");
    }

    #[test]
    fn degraded_group_accounts_zero() {
        // A child of an inactive group reads zero usage and accepts limits.
        let group = ControlGroup::create("invoker-test-degraded").unwrap();
        if group.is_active() {
            // Running privileged; the real paths are exercised elsewhere.
            return;
        }
        let child = group.child(0).unwrap();
        assert_eq!(child.cpu_usage_ns(), 0);
        assert_eq!(child.memory_peak_bytes(), 0);
        assert!(!child.oom_killed());
        assert!(child.set_memory_limit(16 << 20).is_ok());
        assert!(child.attach_paths().is_empty());
    }
}
