/// Declarative process-group description consumed by the execution core
use crate::types::{InvokerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Access mode for a file stream binding
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// Which side of a pipe a binding refers to
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum PipeEnd {
    Read,
    Write,
}

/// Declarative instruction for a single file-descriptor slot in a child
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum StreamBinding {
    /// Open a file inside the container; WriteOnly implies truncate+create
    File { path: PathBuf, access_mode: AccessMode },
    /// One end of a group-owned pipe
    Pipe { pipe: usize, end: PipeEnd },
    /// Duplicate of another descriptor bound on the same process
    FdAlias { fd: i32 },
    /// The descriptor is closed in the child
    Close,
}

/// Credentials the child runs under
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OwnerId {
    pub uid: u32,
    pub gid: u32,
}

/// Per-process resource limits
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessResourceLimits {
    /// CPU time, nanoseconds
    pub time_limit_ns: Option<u64>,
    pub memory_limit_bytes: Option<u64>,
    pub output_limit_bytes: Option<u64>,
}

/// Group-wide resource limits
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupResourceLimits {
    /// Wall-clock limit for the whole group, milliseconds
    pub real_time_limit_ms: Option<u64>,
}

fn default_true() -> bool {
    true
}

/// Declarative description of one child process
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProcessSpec {
    /// Absolute path inside the container
    pub executable: PathBuf,
    /// argv, including argv[0]
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Working directory inside the container
    #[serde(default = "ProcessSpec::default_current_path")]
    pub current_path: PathBuf,
    #[serde(default)]
    pub owner_id: OwnerId,
    #[serde(default)]
    pub resource_limits: ProcessResourceLimits,
    /// Descriptor number to stream binding
    #[serde(default)]
    pub descriptors: BTreeMap<i32, StreamBinding>,
    /// The group keeps running while any process with this flag runs
    #[serde(default = "default_true")]
    pub group_waits_for_termination: bool,
    /// A non-OK completion of this process terminates the whole group
    #[serde(default = "default_true")]
    pub terminate_group_on_crash: bool,
    /// Optional label carried into events
    #[serde(default)]
    pub name: Option<String>,
}

impl ProcessSpec {
    fn default_current_path() -> PathBuf {
        PathBuf::from("/")
    }

    pub fn new(executable: impl Into<PathBuf>) -> Self {
        let executable = executable.into();
        Self {
            arguments: vec![executable.to_string_lossy().into_owned()],
            executable,
            environment: BTreeMap::new(),
            current_path: Self::default_current_path(),
            owner_id: OwnerId::default(),
            resource_limits: ProcessResourceLimits::default(),
            descriptors: BTreeMap::new(),
            group_waits_for_termination: true,
            terminate_group_on_crash: true,
            name: None,
        }
    }
}

/// Immutable input to the process-group executor
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// Position defines the process id
    pub processes: Vec<ProcessSpec>,
    /// Number of pipes shared by the group
    #[serde(default)]
    pub pipes: usize,
    #[serde(default)]
    pub resource_limits: GroupResourceLimits,
    /// Unix socket paths lifecycle events are published to
    #[serde(default)]
    pub notifier_sockets: Vec<PathBuf>,
}

impl Task {
    /// Check the structural invariants that must hold before any fork:
    /// every pipe end has exactly one reader and at least one writer,
    /// descriptors are non-negative, and every alias resolves to a
    /// non-alias binding on the same process.
    pub fn validate(&self) -> Result<()> {
        let mut readers = vec![0usize; self.pipes];
        let mut writers = vec![0usize; self.pipes];

        for (id, process) in self.processes.iter().enumerate() {
            if process.arguments.is_empty() {
                return Err(InvokerError::Task(format!(
                    "process {} has an empty argv",
                    id
                )));
            }
            for (fd, binding) in &process.descriptors {
                if *fd < 0 {
                    return Err(InvokerError::Task(format!(
                        "process {} binds negative descriptor {}",
                        id, fd
                    )));
                }
                match binding {
                    StreamBinding::Pipe { pipe, end } => {
                        if *pipe >= self.pipes {
                            return Err(InvokerError::Task(format!(
                                "process {} references unknown pipe {}",
                                id, pipe
                            )));
                        }
                        match end {
                            PipeEnd::Read => readers[*pipe] += 1,
                            PipeEnd::Write => writers[*pipe] += 1,
                        }
                    }
                    StreamBinding::FdAlias { fd: target } => {
                        match process.descriptors.get(target) {
                            Some(StreamBinding::FdAlias { .. }) | None => {
                                return Err(InvokerError::Task(format!(
                                    "process {} aliases descriptor {} which is not \
                                     bound to a concrete stream",
                                    id, target
                                )));
                            }
                            Some(_) => {}
                        }
                    }
                    StreamBinding::File { .. } | StreamBinding::Close => {}
                }
            }
        }

        for pipe in 0..self.pipes {
            if readers[pipe] != 1 {
                return Err(InvokerError::Task(format!(
                    "pipe {} has {} readers, expected exactly one",
                    pipe, readers[pipe]
                )));
            }
            if writers[pipe] == 0 {
                return Err(InvokerError::Task(format!(
                    "pipe {} has no writer",
                    pipe
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline_task() -> Task {
        let mut writer = ProcessSpec::new("/bin/echo");
        writer.descriptors.insert(
            1,
            StreamBinding::Pipe {
                pipe: 0,
                end: PipeEnd::Write,
            },
        );
        let mut reader = ProcessSpec::new("/bin/cat");
        reader.descriptors.insert(
            0,
            StreamBinding::Pipe {
                pipe: 0,
                end: PipeEnd::Read,
            },
        );
        Task {
            processes: vec![writer, reader],
            pipes: 1,
            ..Task::default()
        }
    }

    #[test]
    fn validates_pipeline() {
        assert!(pipeline_task().validate().is_ok());
    }

    #[test]
    fn rejects_pipe_without_reader() {
        let mut task = pipeline_task();
        task.processes[1].descriptors.clear();
        let err = task.validate().unwrap_err();
        assert!(err.to_string().contains("readers"));
    }

    #[test]
    fn rejects_pipe_with_two_readers() {
        let mut task = pipeline_task();
        let binding = task.processes[1].descriptors[&0].clone();
        task.processes[1].descriptors.insert(3, binding);
        assert!(task.validate().is_err());
    }

    #[test]
    fn rejects_unknown_pipe() {
        let mut task = pipeline_task();
        task.processes[0].descriptors.insert(
            2,
            StreamBinding::Pipe {
                pipe: 7,
                end: PipeEnd::Write,
            },
        );
        assert!(task.validate().is_err());
    }

    #[test]
    fn rejects_dangling_alias() {
        let mut task = pipeline_task();
        task.processes[0]
            .descriptors
            .insert(2, StreamBinding::FdAlias { fd: 9 });
        assert!(task.validate().is_err());
    }

    #[test]
    fn rejects_alias_of_alias() {
        let mut task = pipeline_task();
        task.processes[0]
            .descriptors
            .insert(2, StreamBinding::FdAlias { fd: 1 });
        task.processes[0]
            .descriptors
            .insert(3, StreamBinding::FdAlias { fd: 2 });
        assert!(task.validate().is_err());
    }

    #[test]
    fn alias_of_concrete_binding_is_accepted() {
        let mut task = pipeline_task();
        task.processes[0]
            .descriptors
            .insert(2, StreamBinding::FdAlias { fd: 1 });
        assert!(task.validate().is_ok());
    }

    #[test]
    fn json_round_trip_is_canonical() {
        let task = pipeline_task();
        let first = serde_json::to_vec(&task).unwrap();
        let decoded: Task = serde_json::from_slice(&first).unwrap();
        let second = serde_json::to_vec(&decoded).unwrap();
        assert_eq!(first, second);
        assert_eq!(task, decoded);
    }

    #[test]
    fn spec_defaults_match_contract() {
        let spec = ProcessSpec::new("/bin/true");
        assert!(spec.group_waits_for_termination);
        assert!(spec.terminate_group_on_crash);
        assert_eq!(spec.arguments, vec!["/bin/true".to_string()]);
        assert_eq!(spec.current_path, PathBuf::from("/"));
    }
}
