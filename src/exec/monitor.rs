/// Aggregation of per-process outcomes into the group result
use crate::result::{
    CompletionStatus, GroupCompletionStatus, GroupResult, ProcessResult, ResourceUsage,
};
use crate::types::{InvokerError, Result};
use std::collections::{BTreeSet, HashMap};

/// Raw termination state read from wait
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildStatus {
    Exited(i32),
    Signaled(i32),
}

/// Limit breaches attributed to a process at classification time.
/// When several apply to one signaled death, priority is
/// memory > cpu > output > real-time > plain signal.
#[derive(Clone, Copy, Debug, Default)]
pub struct BreachFlags {
    pub memory: bool,
    pub cpu: bool,
    pub output: bool,
    pub real_time: bool,
    /// Killed by the orchestrator at group completion
    pub system: bool,
    /// Failed before exec
    pub start_failed: bool,
}

/// Translate a wait status and the breach evidence into a completion status.
/// A clean exit always wins over stale breach flags; limit attribution
/// applies only to signaled deaths.
pub fn classify(status: ChildStatus, breach: BreachFlags) -> (CompletionStatus, Option<i32>, Option<i32>) {
    if breach.start_failed {
        return (CompletionStatus::StartFailed, None, None);
    }
    match status {
        ChildStatus::Exited(0) => (CompletionStatus::Ok, Some(0), None),
        ChildStatus::Exited(code) => (CompletionStatus::ExitStatus, Some(code), None),
        ChildStatus::Signaled(sig) => {
            let status = if breach.memory {
                CompletionStatus::MemoryLimitExceeded
            } else if breach.cpu || sig == libc::SIGXCPU {
                CompletionStatus::TimeLimitExceeded
            } else if breach.output || sig == libc::SIGXFSZ {
                CompletionStatus::OutputLimitExceeded
            } else if breach.real_time {
                CompletionStatus::RealTimeLimitExceeded
            } else if breach.system {
                CompletionStatus::TerminatedBySystem
            } else {
                CompletionStatus::TerminatedBySignal
            };
            (status, None, Some(sig))
        }
    }
}

/// Per-group bookkeeping mutated only by the supervision thread
pub struct ExecutionMonitor {
    results: Vec<Option<ProcessResult>>,
    group_waits: Vec<bool>,
    pid2id: HashMap<i32, usize>,
    running: BTreeSet<usize>,
    waiters: BTreeSet<usize>,
}

impl ExecutionMonitor {
    pub fn new(group_waits: Vec<bool>) -> Self {
        Self {
            results: vec![None; group_waits.len()],
            group_waits,
            pid2id: HashMap::new(),
            running: BTreeSet::new(),
            waiters: BTreeSet::new(),
        }
    }

    /// Record a successful fork; pid2id stays injective because pids of
    /// unreaped children are unique.
    pub fn register(&mut self, id: usize, pid: i32) {
        self.pid2id.insert(pid, id);
        self.running.insert(id);
        if self.group_waits[id] {
            self.waiters.insert(id);
        }
    }

    pub fn id_for(&self, pid: i32) -> Option<usize> {
        self.pid2id.get(&pid).copied()
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }

    pub fn running_ids(&self) -> Vec<usize> {
        self.running.iter().copied().collect()
    }

    pub fn is_running(&self, id: usize) -> bool {
        self.running.contains(&id)
    }

    /// Store a prebuilt result for one process and retire it from the
    /// running and waiter sets.
    pub fn record(&mut self, id: usize, result: ProcessResult) -> ProcessResult {
        self.results[id] = Some(result.clone());
        self.running.remove(&id);
        self.waiters.remove(&id);
        result
    }

    /// Store the final result for one process from its classified parts.
    pub fn record_result(
        &mut self,
        id: usize,
        status: CompletionStatus,
        exit_status: Option<i32>,
        term_sig: Option<i32>,
        usage: ResourceUsage,
    ) -> ProcessResult {
        self.record(
            id,
            ProcessResult {
                completion_status: status,
                exit_status,
                term_sig,
                resource_usage: usage,
            },
        )
    }

    /// Final snapshot; OK iff every process the group waits for finished OK.
    pub fn group_result(&self) -> Result<GroupResult> {
        let mut processes = Vec::with_capacity(self.results.len());
        for (id, result) in self.results.iter().enumerate() {
            match result {
                Some(result) => processes.push(result.clone()),
                None => {
                    return Err(InvokerError::IllegalState(format!(
                        "process {} has no recorded result",
                        id
                    )))
                }
            }
        }

        let all_waiters_ok = processes
            .iter()
            .enumerate()
            .filter(|(id, _)| self.group_waits[*id])
            .all(|(_, result)| result.is_ok());

        Ok(GroupResult {
            completion_status: if all_waiters_ok {
                GroupCompletionStatus::Ok
            } else {
                GroupCompletionStatus::AbnormalExit
            },
            processes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_exit_is_ok() {
        let (status, exit, sig) = classify(ChildStatus::Exited(0), BreachFlags::default());
        assert_eq!(status, CompletionStatus::Ok);
        assert_eq!(exit, Some(0));
        assert_eq!(sig, None);
    }

    #[test]
    fn nonzero_exit_keeps_the_code() {
        let (status, exit, _) = classify(ChildStatus::Exited(7), BreachFlags::default());
        assert_eq!(status, CompletionStatus::ExitStatus);
        assert_eq!(exit, Some(7));
    }

    #[test]
    fn plain_signal_is_terminated_by_signal() {
        let (status, exit, sig) =
            classify(ChildStatus::Signaled(libc::SIGKILL), BreachFlags::default());
        assert_eq!(status, CompletionStatus::TerminatedBySignal);
        assert_eq!(exit, None);
        assert_eq!(sig, Some(libc::SIGKILL));
    }

    #[test]
    fn memory_outranks_every_other_breach() {
        let breach = BreachFlags {
            memory: true,
            cpu: true,
            output: true,
            real_time: true,
            system: true,
            start_failed: false,
        };
        let (status, _, _) = classify(ChildStatus::Signaled(libc::SIGKILL), breach);
        assert_eq!(status, CompletionStatus::MemoryLimitExceeded);
    }

    #[test]
    fn cpu_outranks_output_and_real_time() {
        let breach = BreachFlags {
            cpu: true,
            output: true,
            real_time: true,
            ..BreachFlags::default()
        };
        let (status, _, _) = classify(ChildStatus::Signaled(libc::SIGKILL), breach);
        assert_eq!(status, CompletionStatus::TimeLimitExceeded);
    }

    #[test]
    fn sigxcpu_alone_counts_as_time_breach() {
        let (status, _, _) =
            classify(ChildStatus::Signaled(libc::SIGXCPU), BreachFlags::default());
        assert_eq!(status, CompletionStatus::TimeLimitExceeded);
    }

    #[test]
    fn sigxfsz_alone_counts_as_output_breach() {
        let (status, _, _) =
            classify(ChildStatus::Signaled(libc::SIGXFSZ), BreachFlags::default());
        assert_eq!(status, CompletionStatus::OutputLimitExceeded);
    }

    #[test]
    fn real_time_outranks_system_and_signal() {
        let breach = BreachFlags {
            real_time: true,
            system: true,
            ..BreachFlags::default()
        };
        let (status, _, _) = classify(ChildStatus::Signaled(libc::SIGKILL), breach);
        assert_eq!(status, CompletionStatus::RealTimeLimitExceeded);
    }

    #[test]
    fn system_kill_without_breach_is_terminated_by_system() {
        let breach = BreachFlags {
            system: true,
            ..BreachFlags::default()
        };
        let (status, _, sig) = classify(ChildStatus::Signaled(libc::SIGKILL), breach);
        assert_eq!(status, CompletionStatus::TerminatedBySystem);
        assert_eq!(sig, Some(libc::SIGKILL));
    }

    #[test]
    fn start_failure_wins_over_exit_code() {
        let breach = BreachFlags {
            start_failed: true,
            ..BreachFlags::default()
        };
        let (status, exit, sig) = classify(ChildStatus::Exited(127), breach);
        assert_eq!(status, CompletionStatus::StartFailed);
        assert_eq!(exit, None);
        assert_eq!(sig, None);
    }

    #[test]
    fn clean_exit_outranks_stale_breach_flags() {
        let breach = BreachFlags {
            memory: true,
            ..BreachFlags::default()
        };
        let (status, _, _) = classify(ChildStatus::Exited(0), breach);
        assert_eq!(status, CompletionStatus::Ok);
    }

    fn record_ok(monitor: &mut ExecutionMonitor, id: usize) {
        monitor.record_result(
            id,
            CompletionStatus::Ok,
            Some(0),
            None,
            ResourceUsage::default(),
        );
    }

    #[test]
    fn group_verdict_requires_every_waiter_ok() {
        let mut monitor = ExecutionMonitor::new(vec![true, true]);
        monitor.register(0, 100);
        monitor.register(1, 101);
        record_ok(&mut monitor, 0);
        monitor.record_result(
            1,
            CompletionStatus::ExitStatus,
            Some(2),
            None,
            ResourceUsage::default(),
        );
        let group = monitor.group_result().unwrap();
        assert_eq!(group.completion_status, GroupCompletionStatus::AbnormalExit);
        assert_eq!(group.processes.len(), 2);
    }

    #[test]
    fn non_waiter_failure_does_not_taint_the_verdict() {
        let mut monitor = ExecutionMonitor::new(vec![true, false]);
        monitor.register(0, 100);
        monitor.register(1, 101);
        record_ok(&mut monitor, 0);
        monitor.record_result(
            1,
            CompletionStatus::TerminatedBySystem,
            None,
            Some(libc::SIGKILL),
            ResourceUsage::default(),
        );
        let group = monitor.group_result().unwrap();
        assert_eq!(group.completion_status, GroupCompletionStatus::Ok);
    }

    #[test]
    fn waiters_drain_as_results_arrive() {
        let mut monitor = ExecutionMonitor::new(vec![true, false]);
        monitor.register(0, 100);
        monitor.register(1, 101);
        assert!(monitor.has_waiters());
        assert_eq!(monitor.id_for(101), Some(1));
        record_ok(&mut monitor, 0);
        assert!(!monitor.has_waiters());
        assert!(monitor.is_running(1));
        assert_eq!(monitor.running_ids(), vec![1]);
    }

    #[test]
    fn group_result_demands_dense_results() {
        let mut monitor = ExecutionMonitor::new(vec![true, true]);
        monitor.register(0, 100);
        record_ok(&mut monitor, 0);
        assert!(monitor.group_result().is_err());
    }

    #[test]
    fn prebuilt_start_failure_record_drains_the_waiter() {
        let mut monitor = ExecutionMonitor::new(vec![true]);
        monitor.register(0, 100);
        monitor.record(0, ProcessResult::start_failed());
        assert!(!monitor.has_waiters());
        let group = monitor.group_result().unwrap();
        assert_eq!(group.completion_status, GroupCompletionStatus::AbnormalExit);
        assert_eq!(
            group.processes[0].completion_status,
            CompletionStatus::StartFailed
        );
    }
}
