/// Forking and exec'ing one child of a process group
use crate::cgroup::ProcessCgroup;
use crate::exec::streams::{AllocatedFds, ResolvedFd, ResolvedStreams};
use crate::task::ProcessSpec;
use crate::types::{InvokerError, Result};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::{fork, ForkResult, Gid, Pid, Uid};
use std::ffi::CString;
use std::os::unix::io::RawFd;

/// Exit code the child uses when it fails before exec
pub const START_FAILURE_EXIT_CODE: i32 = 127;

/// Outcome of one start attempt. A pid is present whenever the fork
/// happened, even if exec then failed; the child still has to be reaped.
pub struct StartOutcome {
    pub pid: Pid,
    /// Pre-exec failure reason read from the error pipe
    pub error: Option<String>,
}

/// Everything the child needs, prepared before fork so the child performs
/// only async-signal-safe operations until exec.
struct ChildPlan {
    exe: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    cwd: CString,
    attach_paths: Vec<CString>,
    uid: u32,
    gid: u32,
    set_uid: bool,
    set_gid: bool,
    rlimit_fsize: Option<u64>,
    rlimit_cpu_secs: Option<u64>,
    /// (target, source) pairs, sources guaranteed not to collide with targets
    installs: Vec<(i32, RawFd)>,
    /// Descriptors the child closes before exec
    closes: Vec<RawFd>,
}

fn cstring(text: impl Into<Vec<u8>>, what: &str) -> Result<CString> {
    CString::new(text).map_err(|_| {
        InvokerError::Task(format!("{} contains an interior NUL byte", what))
    })
}

fn build_plan(
    spec: &ProcessSpec,
    streams: &ResolvedStreams,
    inherited: &[RawFd],
    cgroup: &ProcessCgroup,
    allocated: &mut AllocatedFds,
) -> Result<ChildPlan> {
    let exe = cstring(spec.executable.to_string_lossy().into_owned(), "executable")?;
    let mut argv = Vec::with_capacity(spec.arguments.len());
    for arg in &spec.arguments {
        argv.push(cstring(arg.clone(), "argument")?);
    }
    let mut envp = Vec::with_capacity(spec.environment.len());
    for (key, value) in &spec.environment {
        envp.push(cstring(format!("{}={}", key, value), "environment entry")?);
    }
    let cwd = cstring(spec.current_path.to_string_lossy().into_owned(), "current path")?;
    let mut attach_paths = Vec::new();
    for path in cgroup.attach_paths() {
        attach_paths.push(cstring(path.to_string_lossy().into_owned(), "cgroup path")?);
    }

    // Relocate any install source that collides with another binding's
    // target number, so the dup2 sequence never clobbers a pending source.
    let targets: Vec<i32> = streams.install_targets();
    let above_targets = targets.iter().copied().max().unwrap_or(2) + 1;
    let mut installs = Vec::new();
    for (&target, &resolved) in &streams.slots {
        if let ResolvedFd::Install(source) = resolved {
            let source = if source != target && targets.contains(&source) {
                let moved = fcntl(source, FcntlArg::F_DUPFD(above_targets))
                    .map_err(|e| InvokerError::Process(format!("dup failed: {}", e)))?;
                allocated.adopt(moved)
            } else {
                source
            };
            installs.push((target, source));
        }
    }

    // Group descriptors the child does not keep are closed after the dup2
    // pass: the pipe matrix, this child's opened files and relocation dups,
    // and any stdio slot left without a binding. An fd that doubles as an
    // install target is skipped; dup2 already replaced it.
    let mut closes: Vec<RawFd> = Vec::new();
    for fd in inherited.iter().copied().chain(allocated.raw_fds()) {
        let kept = installs
            .iter()
            .any(|&(target, source)| source == fd && target == fd);
        if !kept && !targets.contains(&fd) && !closes.contains(&fd) {
            closes.push(fd);
        }
    }
    for fd in 0..=2 {
        if !targets.contains(&fd) && !closes.contains(&fd) {
            closes.push(fd);
        }
    }
    for (&fd, &resolved) in &streams.slots {
        if resolved == ResolvedFd::Close && !closes.contains(&fd) {
            closes.push(fd);
        }
    }

    let current_uid = Uid::effective().as_raw();
    let current_gid = Gid::effective().as_raw();

    Ok(ChildPlan {
        exe,
        argv,
        envp,
        cwd,
        attach_paths,
        uid: spec.owner_id.uid,
        gid: spec.owner_id.gid,
        set_uid: spec.owner_id.uid != current_uid,
        set_gid: spec.owner_id.gid != current_gid,
        rlimit_fsize: spec.resource_limits.output_limit_bytes,
        rlimit_cpu_secs: spec
            .resource_limits
            .time_limit_ns
            .map(|ns| (ns + 999_999_999) / 1_000_000_000),
        installs,
        closes,
    })
}

/// Report a pre-exec failure on the error pipe and die. Async-signal-safe:
/// static text plus the errno description, no allocation.
fn child_fail(error_fd: RawFd, stage: &'static str, errno: Errno) -> ! {
    let _ = nix::unistd::write(error_fd, stage.as_bytes());
    let _ = nix::unistd::write(error_fd, b": ");
    let _ = nix::unistd::write(error_fd, errno.desc().as_bytes());
    unsafe { libc::_exit(START_FAILURE_EXIT_CODE) }
}

/// Format a pid into a stack buffer, avoiding allocation after fork
fn format_pid(pid: i32, buf: &mut [u8; 16]) -> &[u8] {
    let mut value = pid as u32;
    let mut pos = buf.len();
    loop {
        pos -= 1;
        buf[pos] = b'0' + (value % 10) as u8;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    &buf[pos..]
}

fn child_join_cgroup(plan: &ChildPlan, error_fd: RawFd) {
    let pid = unsafe { libc::getpid() };
    let mut buf = [0u8; 16];
    let digits = format_pid(pid, &mut buf);

    for path in &plan.attach_paths {
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_WRONLY) };
        if fd < 0 {
            child_fail(error_fd, "cgroup open", Errno::last());
        }
        let written =
            unsafe { libc::write(fd, digits.as_ptr() as *const libc::c_void, digits.len()) };
        if written < 0 {
            child_fail(error_fd, "cgroup join", Errno::last());
        }
        unsafe { libc::close(fd) };
    }
}

fn child_apply_rlimit(resource: libc::__rlimit_resource_t, soft: u64, hard: u64, error_fd: RawFd) {
    let limit = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        child_fail(error_fd, "setrlimit", Errno::last());
    }
}

/// Child-side setup between fork and exec. Never returns.
fn child_main(plan: &ChildPlan, error_fd: RawFd) -> ! {
    child_join_cgroup(plan, error_fd);

    // gid before uid: dropping uid first would lose the right to setgid
    if plan.set_gid {
        if let Err(e) = nix::unistd::setgid(Gid::from_raw(plan.gid)) {
            child_fail(error_fd, "setgid", e);
        }
    }
    if plan.set_uid {
        if let Err(e) = nix::unistd::setuid(Uid::from_raw(plan.uid)) {
            child_fail(error_fd, "setuid", e);
        }
    }

    if let Err(e) = nix::unistd::chdir(plan.cwd.as_c_str()) {
        child_fail(error_fd, "chdir", e);
    }

    if let Some(limit) = plan.rlimit_fsize {
        child_apply_rlimit(libc::RLIMIT_FSIZE, limit, limit, error_fd);
    }
    if let Some(secs) = plan.rlimit_cpu_secs {
        // soft cap raises SIGXCPU, hard cap one second later forces SIGKILL
        child_apply_rlimit(libc::RLIMIT_CPU, secs, secs + 1, error_fd);
    }

    for &(target, source) in &plan.installs {
        if source != target {
            if let Err(e) = nix::unistd::dup2(source, target) {
                child_fail(error_fd, "dup2", e);
            }
        }
    }

    for &fd in &plan.closes {
        let _ = nix::unistd::close(fd);
    }

    match nix::unistd::execve(plan.exe.as_c_str(), &plan.argv, &plan.envp) {
        Ok(_) => unreachable!(),
        Err(e) => child_fail(error_fd, "execve", e),
    }
}

/// Fork one child and exec its target.
///
/// `inherited` lists every group-owned descriptor currently open in the
/// parent (pipe matrix plus previously opened files); the child closes the
/// ones it does not install. The error pipe is close-on-exec, so the parent
/// reads EOF on successful exec and a reason string on pre-exec failure.
pub fn start(
    spec: &ProcessSpec,
    streams: &ResolvedStreams,
    inherited: &[RawFd],
    cgroup: &ProcessCgroup,
    allocated: &mut AllocatedFds,
) -> Result<StartOutcome> {
    let plan = build_plan(spec, streams, inherited, cgroup, allocated)?;

    let (error_read, error_write) = nix::unistd::pipe2(OFlag::O_CLOEXEC)
        .map_err(|e| InvokerError::Process(format!("failed to create error pipe: {}", e)))?;

    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            let _ = nix::unistd::close(error_read);
            child_main(&plan, error_write)
        }
        Ok(ForkResult::Parent { child }) => {
            let _ = nix::unistd::close(error_write);
            let error = read_error_pipe(error_read);
            let _ = nix::unistd::close(error_read);
            Ok(StartOutcome { pid: child, error })
        }
        Err(e) => {
            let _ = nix::unistd::close(error_read);
            let _ = nix::unistd::close(error_write);
            Err(InvokerError::Process(format!("fork failed: {}", e)))
        }
    }
}

/// Drain the error pipe. EOF with no data means exec succeeded.
fn read_error_pipe(fd: RawFd) -> Option<String> {
    let mut message = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        match nix::unistd::read(fd, &mut buf) {
            Ok(0) => break,
            Ok(n) => message.extend_from_slice(&buf[..n]),
            Err(Errno::EINTR) => continue,
            Err(_) => break,
        }
    }
    if message.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&message).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::ControlGroup;
    use crate::exec::streams;
    use crate::task::{AccessMode, OwnerId, ProcessSpec, StreamBinding};
    use nix::sys::wait::{waitpid, WaitStatus};

    fn current_owner() -> OwnerId {
        OwnerId {
            uid: Uid::effective().as_raw(),
            gid: Gid::effective().as_raw(),
        }
    }

    // The group handle stays alive until the child is reaped; dropping it
    // sweeps the cgroup.
    fn start_spec(spec: &ProcessSpec) -> (ControlGroup, StartOutcome) {
        let group =
            ControlGroup::create(&format!("invoker-starter-{}", uuid::Uuid::new_v4())).unwrap();
        let cgroup = group.child(0).unwrap();
        let mut allocated = AllocatedFds::default();
        let streams = streams::resolve(spec, &[], &mut allocated).unwrap();
        let outcome = start(spec, &streams, &[], &cgroup, &mut allocated).unwrap();
        (group, outcome)
    }

    #[test]
    fn true_exits_zero() {
        if !std::path::Path::new("/bin/true").exists() {
            return;
        }
        let mut spec = ProcessSpec::new("/bin/true");
        spec.owner_id = current_owner();
        let (_group, outcome) = start_spec(&spec);
        assert!(outcome.error.is_none());
        match waitpid(outcome.pid, None).unwrap() {
            WaitStatus::Exited(_, code) => assert_eq!(code, 0),
            other => panic!("unexpected wait status {:?}", other),
        }
    }

    #[test]
    fn missing_executable_reports_start_failure() {
        let mut spec = ProcessSpec::new("/nonexistent/not-a-binary");
        spec.owner_id = current_owner();
        let (_group, outcome) = start_spec(&spec);
        let error = outcome.error.expect("exec should have failed");
        assert!(error.contains("execve"), "unexpected error: {}", error);
        match waitpid(outcome.pid, None).unwrap() {
            WaitStatus::Exited(_, code) => assert_eq!(code, START_FAILURE_EXIT_CODE),
            other => panic!("unexpected wait status {:?}", other),
        }
    }

    #[test]
    fn output_is_redirected_to_file() {
        if !std::path::Path::new("/bin/echo").exists() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");

        let mut spec = ProcessSpec::new("/bin/echo");
        spec.arguments = vec!["echo".into(), "redirected".into()];
        spec.owner_id = current_owner();
        spec.descriptors.insert(
            1,
            StreamBinding::File {
                path: out.clone(),
                access_mode: AccessMode::WriteOnly,
            },
        );
        let (_group, outcome) = start_spec(&spec);
        assert!(outcome.error.is_none());
        waitpid(outcome.pid, None).unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "redirected\n");
    }

    #[test]
    fn environment_reaches_the_child() {
        if !std::path::Path::new("/bin/sh").exists() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("env-out");

        let mut spec = ProcessSpec::new("/bin/sh");
        spec.arguments = vec!["sh".into(), "-c".into(), "echo $PROBE".into()];
        spec.environment.insert("PROBE".into(), "value-42".into());
        spec.owner_id = current_owner();
        spec.descriptors.insert(
            1,
            StreamBinding::File {
                path: out.clone(),
                access_mode: AccessMode::WriteOnly,
            },
        );
        let (_group, outcome) = start_spec(&spec);
        assert!(outcome.error.is_none());
        waitpid(outcome.pid, None).unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "value-42\n");
    }

    #[test]
    fn format_pid_renders_digits() {
        let mut buf = [0u8; 16];
        assert_eq!(format_pid(0, &mut buf), b"0");
        let mut buf = [0u8; 16];
        assert_eq!(format_pid(1, &mut buf), b"1");
        let mut buf = [0u8; 16];
        assert_eq!(format_pid(431_279, &mut buf), b"431279");
    }
}
