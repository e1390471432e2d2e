/// Control-plane wiring between the caller and the in-container helper.
///
/// The helper receives a serialized Task on one descriptor, runs the
/// supervision loop, and returns the serialized GroupResult on another.
use crate::exec::group::ProcessGroupStarter;
use crate::result::GroupResult;
use crate::task::Task;
use crate::types::{InvokerError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::FromRawFd;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::process::{Command, Stdio};

fn read_json_from_fd<T: DeserializeOwned>(fd: RawFd) -> Result<T> {
    let mut file = unsafe { File::from_raw_fd(fd) };
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    serde_json::from_slice(&data)
        .map_err(|e| InvokerError::Process(format!("failed to decode json on fd {}: {}", fd, e)))
}

fn write_json_to_fd<T: Serialize>(fd: RawFd, value: &T) -> Result<()> {
    let mut file = unsafe { File::from_raw_fd(fd) };
    let payload = serde_json::to_vec(value)
        .map_err(|e| InvokerError::Process(format!("failed to encode json for fd {}: {}", fd, e)))?;
    file.write_all(&payload)?;
    file.flush()?;
    Ok(())
}

pub fn read_task_from_fd(fd: RawFd) -> Result<Task> {
    read_json_from_fd(fd)
}

pub fn write_task_to_fd(fd: RawFd, task: &Task) -> Result<()> {
    write_json_to_fd(fd, task)
}

pub fn read_result_from_fd(fd: RawFd) -> Result<GroupResult> {
    read_json_from_fd(fd)
}

pub fn write_result_to_fd(fd: RawFd, result: &GroupResult) -> Result<()> {
    write_json_to_fd(fd, result)
}

/// Helper-side entrypoint: run the task read from `task_fd` and report the
/// group result on `result_fd`. Exits 0 on success; an internal failure is
/// reported on stderr for the parent to capture.
pub fn run_from_fds(task_fd: RawFd, result_fd: RawFd) -> ! {
    let outcome = read_task_from_fd(task_fd).and_then(ProcessGroupStarter::run);
    match outcome {
        Ok(result) => {
            if let Err(e) = write_result_to_fd(result_fd, &result) {
                eprintln!("failed to report group result: {}", e);
                std::process::exit(3);
            }
            std::process::exit(0);
        }
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    }
}

/// Caller-side: run a task through the control helper executable.
///
/// The helper inherits two pipe descriptors and is told their numbers on
/// the command line; stderr is captured so an abnormal exit carries its
/// diagnostics.
pub fn spawn_helper(executable: &Path, task: &Task) -> Result<GroupResult> {
    let (task_read, task_write) = nix::unistd::pipe()
        .map_err(|e| InvokerError::Process(format!("pipe(task): {}", e)))?;
    let (result_read, result_write) = nix::unistd::pipe()
        .map_err(|e| InvokerError::Process(format!("pipe(result): {}", e)))?;

    let spawned = Command::new(executable)
        .arg("--task-fd")
        .arg(task_read.to_string())
        .arg("--result-fd")
        .arg(result_write.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            for fd in [task_read, task_write, result_read, result_write] {
                let _ = nix::unistd::close(fd);
            }
            return Err(InvokerError::ControlHelper {
                status: "failed to start".to_string(),
                stderr: e.to_string(),
            });
        }
    };

    // Child-side ends close here so reads see EOF
    let _ = nix::unistd::close(task_read);
    let _ = nix::unistd::close(result_write);

    if let Err(e) = write_task_to_fd(task_write, task) {
        let _ = nix::unistd::close(result_read);
        let _ = child.kill();
        let _ = child.wait();
        return Err(e);
    }

    let result = read_result_from_fd(result_read);
    let output = child
        .wait_with_output()
        .map_err(|e| InvokerError::Process(format!("waiting for control helper: {}", e)))?;

    if !output.status.success() {
        return Err(InvokerError::ControlHelper {
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::{GroupCompletionStatus, ProcessResult};
    use crate::task::ProcessSpec;

    #[test]
    fn task_round_trips_over_a_pipe() {
        let task = Task {
            processes: vec![ProcessSpec::new("/bin/true")],
            pipes: 0,
            ..Task::default()
        };

        let (read_fd, write_fd) = nix::unistd::pipe().unwrap();
        write_task_to_fd(write_fd, &task).unwrap();
        let decoded = read_task_from_fd(read_fd).unwrap();
        assert_eq!(task, decoded);
    }

    #[test]
    fn result_round_trips_over_a_pipe() {
        let result = GroupResult {
            completion_status: GroupCompletionStatus::Ok,
            processes: vec![ProcessResult {
                completion_status: crate::result::CompletionStatus::Ok,
                exit_status: Some(0),
                term_sig: None,
                resource_usage: Default::default(),
            }],
        };

        let (read_fd, write_fd) = nix::unistd::pipe().unwrap();
        write_result_to_fd(write_fd, &result).unwrap();
        let decoded = read_result_from_fd(read_fd).unwrap();
        assert_eq!(result, decoded);
    }

    #[test]
    fn garbage_on_the_wire_is_a_process_error() {
        let (read_fd, write_fd) = nix::unistd::pipe().unwrap();
        {
            let mut file = unsafe { File::from_raw_fd(write_fd) };
            file.write_all(b"not json").unwrap();
        }
        assert!(matches!(
            read_task_from_fd(read_fd),
            Err(InvokerError::Process(_))
        ));
    }

    #[test]
    fn missing_helper_is_a_control_helper_error() {
        let task = Task::default();
        match spawn_helper(Path::new("/nonexistent/invoker-ctl"), &task) {
            Err(InvokerError::ControlHelper { .. }) => {}
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }
}
