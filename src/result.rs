/// Termination results for processes and groups
use serde::{Deserialize, Serialize};

/// Canonical outcome of a single process
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum CompletionStatus {
    /// Exited with status 0
    Ok,
    /// Exited with a non-zero status
    ExitStatus,
    /// Killed by a signal not attributable to any limit
    TerminatedBySignal,
    /// Killed after breaching its memory limit (cgroup OOM)
    MemoryLimitExceeded,
    /// Killed after breaching its CPU-time limit
    TimeLimitExceeded,
    /// Killed after breaching its output limit (SIGXFSZ)
    OutputLimitExceeded,
    /// Killed because the group's wall-clock deadline fired
    RealTimeLimitExceeded,
    /// Killed by the orchestrator at group completion
    TerminatedBySystem,
    /// Termination state could not be classified
    AbnormalExit,
    /// The process never reached exec
    StartFailed,
}

/// Resource consumption observed for one process
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceUsage {
    /// CPU time, nanoseconds
    pub time_usage_ns: u64,
    /// Peak memory, bytes
    pub memory_usage_bytes: u64,
    /// Bytes written, as last sampled
    pub output_usage_bytes: u64,
    /// Wall-clock time from fork to reap, nanoseconds
    pub real_time_usage_ns: u64,
}

/// Result record for a single process
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessResult {
    pub completion_status: CompletionStatus,
    pub exit_status: Option<i32>,
    pub term_sig: Option<i32>,
    pub resource_usage: ResourceUsage,
}

impl ProcessResult {
    pub fn is_ok(&self) -> bool {
        self.completion_status == CompletionStatus::Ok
    }

    /// Result for a process that never reached exec
    pub fn start_failed() -> Self {
        Self {
            completion_status: CompletionStatus::StartFailed,
            exit_status: None,
            term_sig: None,
            resource_usage: ResourceUsage::default(),
        }
    }
}

/// Group verdict
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum GroupCompletionStatus {
    Ok,
    AbnormalExit,
}

/// Result record for a whole process group, dense over process ids
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GroupResult {
    pub completion_status: GroupCompletionStatus,
    pub processes: Vec<ProcessResult>,
}

impl GroupResult {
    pub fn process(&self, id: usize) -> Option<&ProcessResult> {
        self.processes.get(id)
    }
}
