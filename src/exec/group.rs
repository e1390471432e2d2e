/// Orchestration of a whole process group: start, supervise, reap, report
use crate::cgroup::{ControlGroup, ProcessCgroup};
use crate::exec::monitor::{classify, BreachFlags, ChildStatus, ExecutionMonitor};
use crate::exec::starter;
use crate::exec::streams::{self, AllocatedFds};
use crate::notifier::{Event, NotifierSet};
use crate::result::{CompletionStatus, GroupResult, ProcessResult, ResourceUsage};
use crate::task::Task;
use crate::types::Result;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Length of one supervision slice; memory peaks are sampled at this rate
pub const WAIT_INTERVAL: Duration = Duration::from_millis(100);

/// Granularity of the non-blocking wait poll
const POLL_SLICE: Duration = Duration::from_millis(10);

/// Shared per-process state: written by the usage sampler, read by the
/// supervision thread at classification time.
struct ProcessWatch {
    pid: AtomicU64,
    running: AtomicBool,
    time_limit_ns: Option<u64>,
    cpu_ns: AtomicU64,
    memory_peak: AtomicU64,
    output_bytes: AtomicU64,
    memory_breached: AtomicBool,
    cpu_breached: AtomicBool,
    real_time_kill: AtomicBool,
    system_kill: AtomicBool,
    start_failed: AtomicBool,
}

impl ProcessWatch {
    fn new(time_limit_ns: Option<u64>) -> Self {
        Self {
            pid: AtomicU64::new(0),
            running: AtomicBool::new(false),
            time_limit_ns,
            cpu_ns: AtomicU64::new(0),
            memory_peak: AtomicU64::new(0),
            output_bytes: AtomicU64::new(0),
            memory_breached: AtomicBool::new(false),
            cpu_breached: AtomicBool::new(false),
            real_time_kill: AtomicBool::new(false),
            system_kill: AtomicBool::new(false),
            start_failed: AtomicBool::new(false),
        }
    }

    fn breach_flags(&self) -> BreachFlags {
        BreachFlags {
            memory: self.memory_breached.load(Ordering::SeqCst),
            cpu: self.cpu_breached.load(Ordering::SeqCst),
            output: false,
            real_time: self.real_time_kill.load(Ordering::SeqCst),
            system: self.system_kill.load(Ordering::SeqCst),
            start_failed: self.start_failed.load(Ordering::SeqCst),
        }
    }

    fn usage(&self, real_time_ns: u64) -> ResourceUsage {
        ResourceUsage {
            time_usage_ns: self.cpu_ns.load(Ordering::SeqCst),
            memory_usage_bytes: self.memory_peak.load(Ordering::SeqCst),
            output_usage_bytes: self.output_bytes.load(Ordering::SeqCst),
            real_time_usage_ns: real_time_ns,
        }
    }
}

/// Bytes written by a process, from /proc/<pid>/io
fn proc_write_bytes(pid: i32) -> Option<u64> {
    let io = std::fs::read_to_string(format!("/proc/{}/io", pid)).ok()?;
    for line in io.lines() {
        if let Some(value) = line.strip_prefix("write_bytes: ") {
            return value.trim().parse().ok();
        }
    }
    None
}

/// Take one usage snapshot, merge peaks, and enforce the CPU-time cap.
/// The highest observed peak wins across samples.
fn sample_process(watch: &ProcessWatch, cgroup: &ProcessCgroup) {
    if !watch.running.load(Ordering::SeqCst) {
        return;
    }

    let cpu = cgroup.cpu_usage_ns();
    watch.cpu_ns.fetch_max(cpu, Ordering::SeqCst);
    watch
        .memory_peak
        .fetch_max(cgroup.memory_peak_bytes(), Ordering::SeqCst);
    if cgroup.oom_killed() {
        watch.memory_breached.store(true, Ordering::SeqCst);
    }

    let pid = watch.pid.load(Ordering::SeqCst) as i32;
    if pid != 0 {
        if let Some(written) = proc_write_bytes(pid) {
            watch.output_bytes.fetch_max(written, Ordering::SeqCst);
        }
        if let Some(limit) = watch.time_limit_ns {
            if cpu >= limit && !watch.cpu_breached.swap(true, Ordering::SeqCst) {
                log::debug!("pid {} breached its cpu-time limit, killing", pid);
                let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
            }
        }
    }
}

/// Final snapshot at reap time, catching peaks the periodic sampler missed.
/// The /proc entry is gone by now, so output accounting keeps its last value.
fn sample_final(watch: &ProcessWatch, cgroup: &ProcessCgroup) {
    watch
        .cpu_ns
        .fetch_max(cgroup.cpu_usage_ns(), Ordering::SeqCst);
    watch
        .memory_peak
        .fetch_max(cgroup.memory_peak_bytes(), Ordering::SeqCst);
    if cgroup.oom_killed() {
        watch.memory_breached.store(true, Ordering::SeqCst);
    }
}

struct Sampler {
    shutdown: Sender<()>,
    handle: thread::JoinHandle<()>,
}

impl Sampler {
    fn spawn(entries: Vec<(Arc<ProcessWatch>, Arc<ProcessCgroup>)>) -> Self {
        let (shutdown, shutdown_rx) = bounded::<()>(1);
        let handle = thread::spawn(move || loop {
            match shutdown_rx.recv_timeout(WAIT_INTERVAL) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    for (watch, cgroup) in &entries {
                        sample_process(watch, cgroup);
                    }
                }
            }
        });
        Self { shutdown, handle }
    }

    fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.handle.join();
    }
}

enum WaitEvent {
    Reaped(i32, ChildStatus),
    Timeout,
    /// The pid vanished without us reaping it
    Lost(i32),
}

/// Poll the given children until one terminates or the deadline passes.
/// EINTR is absorbed; a child reaped behind our back is reported as lost.
fn wait_until(pids: &[i32], deadline: Instant) -> WaitEvent {
    loop {
        for &pid in pids {
            match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {}
                Ok(WaitStatus::Exited(reaped, code)) => {
                    return WaitEvent::Reaped(reaped.as_raw(), ChildStatus::Exited(code));
                }
                Ok(WaitStatus::Signaled(reaped, signal, _)) => {
                    return WaitEvent::Reaped(reaped.as_raw(), ChildStatus::Signaled(signal as i32));
                }
                Ok(_) => {}
                Err(Errno::EINTR) => {}
                Err(_) => return WaitEvent::Lost(pid),
            }
        }
        let now = Instant::now();
        if now >= deadline {
            return WaitEvent::Timeout;
        }
        thread::sleep(POLL_SLICE.min(deadline - now));
    }
}

/// Drives one Task from fork to the published group result
pub struct ProcessGroupStarter {
    task: Task,
    cgroup: ControlGroup,
    monitor: ExecutionMonitor,
    notifiers: NotifierSet,
    watches: Vec<Arc<ProcessWatch>>,
    child_cgroups: Vec<Arc<ProcessCgroup>>,
    started_at: Vec<Option<Instant>>,
    pids: Vec<Option<i32>>,
    real_time_fired: bool,
}

impl ProcessGroupStarter {
    /// Execute a task to completion. The task is consumed; every process
    /// gets a result and no child survives the call.
    pub fn run(task: Task) -> Result<GroupResult> {
        task.validate()?;

        let notifiers = NotifierSet::connect_all(&task.notifier_sockets);
        let cgroup = ControlGroup::create(&format!("invoker-{}", Uuid::new_v4()))?;
        let monitor = ExecutionMonitor::new(
            task.processes
                .iter()
                .map(|p| p.group_waits_for_termination)
                .collect(),
        );

        let mut starter = Self {
            watches: task
                .processes
                .iter()
                .map(|p| Arc::new(ProcessWatch::new(p.resource_limits.time_limit_ns)))
                .collect(),
            child_cgroups: Vec::new(),
            started_at: vec![None; task.processes.len()],
            pids: vec![None; task.processes.len()],
            real_time_fired: false,
            task,
            cgroup,
            monitor,
            notifiers,
        };
        starter.execute()
    }

    fn execute(&mut self) -> Result<GroupResult> {
        let real_time_limit = self
            .task
            .resource_limits
            .real_time_limit_ms
            .map(Duration::from_millis);

        if let Err(e) = self.start_all() {
            self.abort_started();
            return Err(e);
        }

        let sampler = Sampler::spawn(
            self.watches
                .iter()
                .cloned()
                .zip(self.child_cgroups.iter().cloned())
                .collect(),
        );

        // Crash policy applies to start failures recorded before the loop
        let start_crashed = (0..self.task.processes.len()).any(|id| {
            self.task.processes[id].terminate_group_on_crash
                && self.watches[id].start_failed.load(Ordering::SeqCst)
                && self.pids[id].is_none()
        });
        if start_crashed {
            self.terminate_running();
        }

        let real_time_limit_point = real_time_limit.map(|limit| Instant::now() + limit);
        self.execution_loop(real_time_limit_point);
        self.reap_stragglers();
        sampler.stop();

        let result = self.monitor.group_result()?;
        self.notifiers.publish(&Event::GroupTermination {
            result: result.clone(),
        });
        self.cgroup.remove();
        Ok(result)
    }

    /// Fork every declared process in id order. The full pipe matrix exists
    /// before the first fork and the parent's ends are closed once the last
    /// child is up.
    fn start_all(&mut self) -> Result<()> {
        let mut pipe_fds = AllocatedFds::default();
        let pipes = streams::create_pipes(self.task.pipes, &mut pipe_fds)?;
        let pipe_raw = pipe_fds.raw_fds();

        for id in 0..self.task.processes.len() {
            let spec = self.task.processes[id].clone();
            let child_cgroup = Arc::new(self.cgroup.child(id)?);
            if let Some(limit) = spec.resource_limits.memory_limit_bytes {
                child_cgroup.set_memory_limit(limit)?;
            }
            self.child_cgroups.push(child_cgroup.clone());

            let mut allocated = AllocatedFds::default();
            let resolved = match streams::resolve(&spec, &pipes, &mut allocated) {
                Ok(resolved) => resolved,
                Err(e) => {
                    log::warn!("process {} failed to start: {}", id, e);
                    self.record_start_failure(id, &spec.name);
                    continue;
                }
            };

            let outcome =
                starter::start(&spec, &resolved, &pipe_raw, &child_cgroup, &mut allocated)?;

            let pid = outcome.pid.as_raw();
            self.pids[id] = Some(pid);
            self.started_at[id] = Some(Instant::now());
            let watch = &self.watches[id];
            watch.pid.store(pid as u64, Ordering::SeqCst);
            watch.running.store(true, Ordering::SeqCst);
            if let Some(reason) = outcome.error {
                log::warn!("process {} failed before exec: {}", id, reason);
                watch.start_failed.store(true, Ordering::SeqCst);
            }
            self.monitor.register(id, pid);
            self.notifiers.publish(&Event::ProcessStart {
                id,
                pid: Some(pid),
                name: spec.name.clone(),
            });
        }
        Ok(())
    }

    /// A process that never forked still gets its pair of events and a
    /// dense result entry.
    fn record_start_failure(&mut self, id: usize, name: &Option<String>) {
        self.notifiers.publish(&Event::ProcessStart {
            id,
            pid: None,
            name: name.clone(),
        });
        let result = self.monitor.record(id, ProcessResult::start_failed());
        self.watches[id].start_failed.store(true, Ordering::SeqCst);
        self.notifiers
            .publish(&Event::ProcessTermination { id, result });
    }

    fn running_pids(&self) -> Vec<i32> {
        self.monitor
            .running_ids()
            .iter()
            .filter_map(|&id| self.pids[id])
            .collect()
    }

    /// SIGKILL every running child, then sweep the cgroup so nothing the
    /// children may have spawned survives either.
    fn terminate_running(&mut self) {
        for pid in self.running_pids() {
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        }
        self.cgroup.kill_all();
    }

    fn on_real_time_breach(&mut self) {
        if self.real_time_fired {
            return;
        }
        self.real_time_fired = true;
        log::debug!("real-time limit reached, terminating group");
        for id in self.monitor.running_ids() {
            self.watches[id].real_time_kill.store(true, Ordering::SeqCst);
        }
        self.terminate_running();
    }

    /// The supervision loop: one wait slice per iteration, classification
    /// and events on each reap, crash and deadline policy in between.
    /// Exits once no awaited process remains.
    fn execution_loop(&mut self, real_time_limit_point: Option<Instant>) {
        while self.monitor.has_waiters() {
            let now = Instant::now();
            if let Some(deadline) = real_time_limit_point {
                if now >= deadline {
                    self.on_real_time_breach();
                }
            }

            let mut slice = now + WAIT_INTERVAL;
            if let Some(deadline) = real_time_limit_point {
                if !self.real_time_fired {
                    slice = slice.min(deadline);
                }
            }

            match wait_until(&self.running_pids(), slice) {
                WaitEvent::Reaped(pid, status) => self.handle_reap(pid, status),
                WaitEvent::Timeout => {}
                WaitEvent::Lost(pid) => self.handle_lost(pid),
            }
        }
    }

    fn handle_reap(&mut self, pid: i32, status: ChildStatus) {
        let id = match self.monitor.id_for(pid) {
            Some(id) => id,
            None => {
                log::debug!("reaped unknown pid {}", pid);
                return;
            }
        };
        if !self.monitor.is_running(id) {
            return;
        }

        let watch = self.watches[id].clone();
        watch.running.store(false, Ordering::SeqCst);
        sample_final(&watch, &self.child_cgroups[id]);

        let (completion, exit_status, term_sig) = classify(status, watch.breach_flags());
        let real_time_ns = self.started_at[id]
            .map(|at| at.elapsed().as_nanos() as u64)
            .unwrap_or(0);
        let result = self.monitor.record_result(
            id,
            completion,
            exit_status,
            term_sig,
            watch.usage(real_time_ns),
        );
        self.notifiers
            .publish(&Event::ProcessTermination { id, result: result.clone() });

        if self.task.processes[id].terminate_group_on_crash && !result.is_ok() {
            self.terminate_running();
        }
    }

    /// A child disappeared without being reaped here (ECHILD race or an
    /// interfering waiter). Absorb it as an abnormal exit and move on.
    fn handle_lost(&mut self, pid: i32) {
        let id = match self.monitor.id_for(pid) {
            Some(id) => id,
            None => return,
        };
        if !self.monitor.is_running(id) {
            return;
        }
        log::warn!("lost track of pid {} (process {})", pid, id);

        let watch = self.watches[id].clone();
        watch.running.store(false, Ordering::SeqCst);
        sample_final(&watch, &self.child_cgroups[id]);
        let real_time_ns = self.started_at[id]
            .map(|at| at.elapsed().as_nanos() as u64)
            .unwrap_or(0);
        let result = self.monitor.record_result(
            id,
            CompletionStatus::AbnormalExit,
            None,
            None,
            watch.usage(real_time_ns),
        );
        self.notifiers
            .publish(&Event::ProcessTermination { id, result });
    }

    /// Preflight failure after some children were already forked: the group
    /// errors out, but no child may leak and every started process still
    /// gets its termination event.
    fn abort_started(&mut self) {
        self.terminate_running();
        while !self.monitor.running_ids().is_empty() {
            match wait_until(&self.running_pids(), Instant::now() + WAIT_INTERVAL) {
                WaitEvent::Reaped(pid, _) | WaitEvent::Lost(pid) => {
                    let id = match self.monitor.id_for(pid) {
                        Some(id) => id,
                        None => continue,
                    };
                    if !self.monitor.is_running(id) {
                        continue;
                    }
                    let result = self.monitor.record_result(
                        id,
                        CompletionStatus::AbnormalExit,
                        None,
                        None,
                        ResourceUsage::default(),
                    );
                    self.notifiers
                        .publish(&Event::ProcessTermination { id, result });
                }
                WaitEvent::Timeout => self.terminate_running(),
            }
        }
        self.cgroup.remove();
    }

    /// Hygiene pass after the last awaited process finished: nothing may
    /// outlive the group, so remaining children are killed and reaped.
    fn reap_stragglers(&mut self) {
        if self.monitor.running_ids().is_empty() {
            return;
        }

        for id in self.monitor.running_ids() {
            self.watches[id].system_kill.store(true, Ordering::SeqCst);
        }
        self.terminate_running();

        while !self.monitor.running_ids().is_empty() {
            match wait_until(&self.running_pids(), Instant::now() + WAIT_INTERVAL) {
                WaitEvent::Reaped(pid, status) => self.handle_reap(pid, status),
                WaitEvent::Lost(pid) => self.handle_lost(pid),
                // SIGKILL is not ignorable; a timeout means the kill raced
                // a fork or the child is stuck in the kernel. Kick again.
                WaitEvent::Timeout => self.terminate_running(),
            }
        }
    }
}
