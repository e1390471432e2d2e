/// Container handle and the builder API for process groups
use crate::config::{ContainerConfig, ControlProcessConfig, CreateFile, ProcessDefaultSettings};
use crate::ctl;
use crate::exec::group::ProcessGroupStarter;
use crate::result::{GroupResult, ProcessResult};
use crate::task::{
    GroupResourceLimits, OwnerId, PipeEnd, ProcessResourceLimits, ProcessSpec, StreamBinding,
    Task,
};
use crate::types::{InvokerError, Result};
use nix::unistd::{Gid, Uid};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Map a container-absolute path onto the container's root directory
fn rebase(root: &Path, path: &Path) -> PathBuf {
    match path.strip_prefix("/") {
        Ok(relative) => root.join(relative),
        Err(_) => root.join(path),
    }
}

fn create_device(path: &Path, mode: u32, major: u32, minor: u32) -> std::io::Result<()> {
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let dev = libc::makedev(major, minor);
    let rc = unsafe { libc::mknod(c_path.as_ptr(), libc::S_IFCHR | mode, dev) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// An initialized container root. Owns the directory for its lifetime.
pub struct Container {
    config: ContainerConfig,
    root: PathBuf,
    name: String,
}

impl Container {
    /// Create the container root under `containers_dir` and populate it
    /// with the configured filesystem entries.
    pub fn create(config: ContainerConfig) -> Result<Self> {
        let name = format!("invoker-{}", Uuid::new_v4());
        let root = config.containers_dir.join(&name);
        fs::create_dir_all(&root).map_err(|e| {
            InvokerError::Container(format!("cannot create {}: {}", root.display(), e))
        })?;

        let container = Self { config, root, name };
        container.populate_filesystem();
        Ok(container)
    }

    /// Create each configured file relative to the root. Device nodes need
    /// privileges; when mknod is denied the node degrades to a symlink onto
    /// the host's device so unprivileged runs keep working stdio sinks.
    fn populate_filesystem(&self) {
        for entry in &self.config.filesystem_config.create_files {
            let outcome = match entry {
                CreateFile::Directory { path, mode } => {
                    let target = rebase(&self.root, path);
                    fs::create_dir_all(&target).and_then(|()| {
                        fs::set_permissions(&target, fs::Permissions::from_mode(*mode))
                    })
                }
                CreateFile::RegularFile { path, mode } => {
                    let target = rebase(&self.root, path);
                    ensure_parent(&target)
                        .and_then(|()| fs::write(&target, b""))
                        .and_then(|()| {
                            fs::set_permissions(&target, fs::Permissions::from_mode(*mode))
                        })
                }
                CreateFile::Device {
                    path,
                    mode,
                    major,
                    minor,
                } => {
                    let target = rebase(&self.root, path);
                    ensure_parent(&target).and_then(|()| {
                        create_device(&target, *mode, *major, *minor).or_else(|e| {
                            log::warn!(
                                "mknod {} failed ({}), falling back to host symlink",
                                target.display(),
                                e
                            );
                            std::os::unix::fs::symlink(path, &target)
                        })
                    })
                }
                CreateFile::SymLink { value, path } => {
                    let target = rebase(&self.root, path);
                    ensure_parent(&target)
                        .and_then(|()| std::os::unix::fs::symlink(value, &target))
                }
            };
            if let Err(e) = outcome {
                log::warn!("filesystem population entry failed: {}", e);
            }
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn filesystem(&self) -> Filesystem<'_> {
        Filesystem { root: &self.root }
    }

    /// Start building a process group bound to this container
    pub fn create_process_group(&self) -> ProcessGroup {
        ProcessGroup {
            state: Arc::new(Mutex::new(GroupState {
                root: self.root.clone(),
                defaults: self
                    .config
                    .group_default_settings
                    .process_default_settings
                    .clone(),
                control: self.config.control_process.clone(),
                resource_limits: self.config.group_default_settings.resource_limits,
                processes: Vec::new(),
                pipes: 0,
                notifier_sockets: Vec::new(),
                result: None,
                called: false,
            })),
        }
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.root) {
            log::warn!("failed to remove container root {}: {}", self.root.display(), e);
        }
    }
}

fn ensure_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) => fs::create_dir_all(parent),
        None => Ok(()),
    }
}

/// File transfer into and out of a container root
pub struct Filesystem<'a> {
    root: &'a Path,
}

impl Filesystem<'_> {
    /// Copy a host file to a container path, applying mode and ownership.
    /// Ownership changes need privileges and degrade to a warning without.
    pub fn push(&self, src: &Path, dst: &Path, owner: OwnerId, mode: u32) -> Result<()> {
        let target = rebase(self.root, dst);
        ensure_parent(&target)?;
        fs::copy(src, &target).map_err(|e| {
            InvokerError::Container(format!(
                "push {} -> {}: {}",
                src.display(),
                target.display(),
                e
            ))
        })?;
        fs::set_permissions(&target, fs::Permissions::from_mode(mode))?;
        if let Err(e) = nix::unistd::chown(
            &target,
            Some(Uid::from_raw(owner.uid)),
            Some(Gid::from_raw(owner.gid)),
        ) {
            log::warn!("chown {} failed: {}", target.display(), e);
        }
        Ok(())
    }

    /// Copy a container file back out to the host
    pub fn pull(&self, src: &Path, dst: &Path) -> Result<()> {
        let source = rebase(self.root, src);
        fs::copy(&source, dst).map_err(|e| {
            InvokerError::Container(format!(
                "pull {} -> {}: {}",
                source.display(),
                dst.display(),
                e
            ))
        })?;
        Ok(())
    }
}

struct GroupState {
    root: PathBuf,
    defaults: ProcessDefaultSettings,
    control: ControlProcessConfig,
    resource_limits: GroupResourceLimits,
    processes: Vec<ProcessSpec>,
    pipes: usize,
    notifier_sockets: Vec<PathBuf>,
    result: Option<GroupResult>,
    called: bool,
}

/// Handle to a declared process group. The group owns every process spec;
/// `Process` handles address them by index, so there is no ownership cycle.
#[derive(Clone)]
pub struct ProcessGroup {
    state: Arc<Mutex<GroupState>>,
}

/// Handle to one pipe of the group
#[derive(Clone, Copy, Debug)]
pub struct Pipe {
    id: usize,
}

impl Pipe {
    pub fn read_end(&self) -> StreamBinding {
        StreamBinding::Pipe {
            pipe: self.id,
            end: PipeEnd::Read,
        }
    }

    pub fn write_end(&self) -> StreamBinding {
        StreamBinding::Pipe {
            pipe: self.id,
            end: PipeEnd::Write,
        }
    }
}

impl ProcessGroup {
    fn state(&self) -> Result<MutexGuard<'_, GroupState>> {
        self.state
            .lock()
            .map_err(|_| InvokerError::IllegalState("process group state is poisoned".to_string()))
    }

    /// Declare a new process; its id is its creation order
    pub fn create_process(&self, executable: impl Into<PathBuf>) -> Result<Process> {
        let mut state = self.state()?;
        if state.called {
            return Err(InvokerError::IllegalState(
                "cannot add processes after the group was started".to_string(),
            ));
        }
        let executable = executable.into();
        let spec = ProcessSpec {
            arguments: vec![executable.to_string_lossy().into_owned()],
            executable,
            environment: state.defaults.environment.clone(),
            current_path: state.defaults.current_path.clone(),
            owner_id: state.defaults.owner_id,
            resource_limits: state.defaults.resource_limits,
            descriptors: state.defaults.descriptors.clone(),
            group_waits_for_termination: true,
            terminate_group_on_crash: true,
            name: None,
        };
        state.processes.push(spec);
        Ok(Process {
            group: self.clone(),
            id: state.processes.len() - 1,
        })
    }

    pub fn create_pipe(&self) -> Result<Pipe> {
        let mut state = self.state()?;
        let id = state.pipes;
        state.pipes += 1;
        Ok(Pipe { id })
    }

    pub fn set_resource_limits(&self, limits: GroupResourceLimits) -> Result<()> {
        self.state()?.resource_limits = limits;
        Ok(())
    }

    pub fn add_notifier_socket(&self, path: impl Into<PathBuf>) -> Result<()> {
        self.state()?.notifier_sockets.push(path.into());
        Ok(())
    }

    /// Assemble the Task this group describes, with container paths rebased
    /// onto the container root.
    fn build_task(state: &GroupState) -> Task {
        let mut processes = Vec::with_capacity(state.processes.len());
        for spec in &state.processes {
            let mut spec = spec.clone();
            spec.current_path = rebase(&state.root, &spec.current_path);
            let mut descriptors = BTreeMap::new();
            for (fd, binding) in spec.descriptors {
                let binding = match binding {
                    StreamBinding::File { path, access_mode } => StreamBinding::File {
                        path: rebase(&state.root, &path),
                        access_mode,
                    },
                    other => other,
                };
                descriptors.insert(fd, binding);
            }
            spec.descriptors = descriptors;
            processes.push(spec);
        }
        Task {
            processes,
            pipes: state.pipes,
            resource_limits: state.resource_limits,
            notifier_sockets: state.notifier_sockets.clone(),
        }
    }

    /// Run the group to completion and record the result. The underlying
    /// Task is consumed exactly once; a second call is an illegal state.
    pub fn synchronized_call(&self) -> Result<GroupResult> {
        let (task, use_helper, helper) = {
            let mut state = self.state()?;
            if state.called {
                return Err(InvokerError::IllegalState(
                    "process group was already started".to_string(),
                ));
            }
            state.called = true;
            (
                Self::build_task(&state),
                state.control.use_helper,
                state.control.executable.clone(),
            )
        };

        let result = if use_helper {
            ctl::spawn_helper(&helper, &task)?
        } else {
            ProcessGroupStarter::run(task)?
        };

        self.state()?.result = Some(result.clone());
        Ok(result)
    }

    /// Result of a finished group
    pub fn result(&self) -> Result<GroupResult> {
        self.state()?.result.clone().ok_or_else(|| {
            InvokerError::IllegalState("process group has no result yet".to_string())
        })
    }
}

/// Handle to one declared process: a (group, id) pair
#[derive(Clone)]
pub struct Process {
    group: ProcessGroup,
    id: usize,
}

impl Process {
    pub fn id(&self) -> usize {
        self.id
    }

    fn with_spec<T>(&self, f: impl FnOnce(&mut ProcessSpec) -> T) -> Result<T> {
        let mut state = self.group.state()?;
        let id = self.id;
        Ok(f(&mut state.processes[id]))
    }

    pub fn executable(&self) -> Result<PathBuf> {
        self.with_spec(|spec| spec.executable.clone())
    }

    /// argv, including argv[0]
    pub fn set_arguments(&self, arguments: Vec<String>) -> Result<()> {
        self.with_spec(|spec| spec.arguments = arguments)
    }

    pub fn set_environment(&self, environment: BTreeMap<String, String>) -> Result<()> {
        self.with_spec(|spec| spec.environment = environment)
    }

    pub fn set_current_path(&self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        self.with_spec(|spec| spec.current_path = path)
    }

    pub fn set_owner_id(&self, owner: OwnerId) -> Result<()> {
        self.with_spec(|spec| spec.owner_id = owner)
    }

    pub fn set_resource_limits(&self, limits: ProcessResourceLimits) -> Result<()> {
        self.with_spec(|spec| spec.resource_limits = limits)
    }

    pub fn set_group_waits_for_termination(&self, value: bool) -> Result<()> {
        self.with_spec(|spec| spec.group_waits_for_termination = value)
    }

    pub fn set_terminate_group_on_crash(&self, value: bool) -> Result<()> {
        self.with_spec(|spec| spec.terminate_group_on_crash = value)
    }

    pub fn set_name(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.with_spec(|spec| spec.name = Some(name))
    }

    /// Bind a descriptor slot
    pub fn set_stream(&self, fd: i32, binding: StreamBinding) -> Result<()> {
        self.with_spec(|spec| {
            spec.descriptors.insert(fd, binding);
        })
    }

    /// Close a descriptor slot in the child
    pub fn close_stream(&self, fd: i32) -> Result<()> {
        self.set_stream(fd, StreamBinding::Close)
    }

    pub fn has_stream(&self, fd: i32) -> Result<bool> {
        self.with_spec(|spec| spec.descriptors.contains_key(&fd))
    }

    /// The binding currently assigned to a descriptor
    pub fn stream(&self, fd: i32) -> Result<StreamBinding> {
        self.with_spec(|spec| spec.descriptors.get(&fd).cloned())?
            .ok_or(InvokerError::DescriptorOutOfRange { fd })
    }

    /// This process's slice of the finished group result
    pub fn result(&self) -> Result<ProcessResult> {
        let group = self.group.result()?;
        group.process(self.id).cloned().ok_or_else(|| {
            InvokerError::IllegalState(format!("no result recorded for process {}", self.id))
        })
    }
}
