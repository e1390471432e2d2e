/// Resolution of declarative stream bindings into installable descriptors
use crate::task::{AccessMode, PipeEnd, ProcessSpec, StreamBinding};
use crate::types::{InvokerError, Result};
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use std::collections::BTreeMap;
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;

/// Scoped list of descriptors opened during resolution. Everything pushed
/// here is closed when the scope drops, after the child has installed its
/// copies.
#[derive(Default)]
pub struct AllocatedFds {
    fds: Vec<OwnedFd>,
}

impl AllocatedFds {
    pub fn adopt(&mut self, fd: RawFd) -> RawFd {
        self.fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
        fd
    }

    pub fn raw_fds(&self) -> Vec<RawFd> {
        self.fds.iter().map(|fd| fd.as_raw_fd()).collect()
    }
}

/// What to do with one descriptor slot in the child
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolvedFd {
    /// dup2 this parent-side descriptor onto the slot
    Install(RawFd),
    /// Close the slot in the child
    Close,
}

/// Concrete per-process descriptor plan, keyed by target fd number
pub struct ResolvedStreams {
    pub slots: BTreeMap<i32, ResolvedFd>,
}

impl ResolvedStreams {
    pub fn install_targets(&self) -> Vec<i32> {
        self.slots
            .iter()
            .filter(|(_, resolved)| matches!(resolved, ResolvedFd::Install(_)))
            .map(|(fd, _)| *fd)
            .collect()
    }
}

fn open_file(
    path: &PathBuf,
    access_mode: AccessMode,
    current_path: &PathBuf,
) -> Result<RawFd> {
    let flags = match access_mode {
        AccessMode::ReadOnly => OFlag::O_RDONLY,
        AccessMode::WriteOnly => OFlag::O_WRONLY | OFlag::O_TRUNC | OFlag::O_CREAT,
        AccessMode::ReadWrite => OFlag::O_RDWR,
    };
    let absolute = if path.is_absolute() {
        path.clone()
    } else {
        current_path.join(path)
    };
    nix::fcntl::open(&absolute, flags, Mode::from_bits_truncate(0o666)).map_err(|e| {
        InvokerError::Process(format!("failed to open {}: {}", absolute.display(), e))
    })
}

/// Resolve a process's bindings against the shared pipe matrix.
///
/// Two passes: files and pipe ends first, then aliases over the descriptors
/// the first pass produced. `Task::validate` has already ruled out dangling
/// pipe references and dangling or chained aliases.
pub fn resolve(
    spec: &ProcessSpec,
    pipes: &[(RawFd, RawFd)],
    allocated: &mut AllocatedFds,
) -> Result<ResolvedStreams> {
    let mut slots = BTreeMap::new();

    for (fd, binding) in &spec.descriptors {
        let resolved = match binding {
            StreamBinding::File { path, access_mode } => {
                let opened = open_file(path, *access_mode, &spec.current_path)?;
                ResolvedFd::Install(allocated.adopt(opened))
            }
            StreamBinding::Pipe { pipe, end } => {
                let (read_end, write_end) = pipes[*pipe];
                ResolvedFd::Install(match end {
                    PipeEnd::Read => read_end,
                    PipeEnd::Write => write_end,
                })
            }
            StreamBinding::Close => ResolvedFd::Close,
            StreamBinding::FdAlias { .. } => continue,
        };
        slots.insert(*fd, resolved);
    }

    for (fd, binding) in &spec.descriptors {
        if let StreamBinding::FdAlias { fd: target } = binding {
            let resolved = *slots.get(target).ok_or_else(|| {
                InvokerError::Task(format!("alias target {} is unbound", target))
            })?;
            slots.insert(*fd, resolved);
        }
    }

    Ok(ResolvedStreams { slots })
}

/// Create the full pipe matrix before any fork so every child inherits it.
pub fn create_pipes(count: usize, allocated: &mut AllocatedFds) -> Result<Vec<(RawFd, RawFd)>> {
    let mut pipes = Vec::with_capacity(count);
    for _ in 0..count {
        let (read_end, write_end) = nix::unistd::pipe()
            .map_err(|e| InvokerError::Process(format!("failed to create pipe: {}", e)))?;
        allocated.adopt(read_end);
        allocated.adopt(write_end);
        pipes.push((read_end, write_end));
    }
    Ok(pipes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ProcessSpec;
    use std::io::Read;

    #[test]
    fn resolves_file_bindings() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input");
        std::fs::write(&input, b"data").unwrap();

        let mut spec = ProcessSpec::new("/bin/cat");
        spec.descriptors.insert(
            0,
            StreamBinding::File {
                path: input,
                access_mode: AccessMode::ReadOnly,
            },
        );
        spec.descriptors.insert(
            1,
            StreamBinding::File {
                path: dir.path().join("output"),
                access_mode: AccessMode::WriteOnly,
            },
        );
        spec.descriptors.insert(2, StreamBinding::Close);

        let mut allocated = AllocatedFds::default();
        let resolved = resolve(&spec, &[], &mut allocated).unwrap();

        assert_eq!(resolved.slots.len(), 3);
        assert!(matches!(resolved.slots[&0], ResolvedFd::Install(_)));
        assert!(matches!(resolved.slots[&1], ResolvedFd::Install(_)));
        assert_eq!(resolved.slots[&2], ResolvedFd::Close);
        assert_eq!(resolved.install_targets(), vec![0, 1]);
        // WriteOnly creates the file
        assert!(dir.path().join("output").exists());
    }

    #[test]
    fn write_only_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        std::fs::write(&path, b"stale content").unwrap();

        let mut spec = ProcessSpec::new("/bin/true");
        spec.descriptors.insert(
            1,
            StreamBinding::File {
                path: path.clone(),
                access_mode: AccessMode::WriteOnly,
            },
        );
        let mut allocated = AllocatedFds::default();
        resolve(&spec, &[], &mut allocated).unwrap();
        drop(allocated);

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn relative_paths_resolve_against_current_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("rel"), b"x").unwrap();

        let mut spec = ProcessSpec::new("/bin/cat");
        spec.current_path = dir.path().to_path_buf();
        spec.descriptors.insert(
            0,
            StreamBinding::File {
                path: PathBuf::from("rel"),
                access_mode: AccessMode::ReadOnly,
            },
        );
        let mut allocated = AllocatedFds::default();
        assert!(resolve(&spec, &[], &mut allocated).is_ok());
    }

    #[test]
    fn open_failure_is_reported() {
        let mut spec = ProcessSpec::new("/bin/cat");
        spec.descriptors.insert(
            0,
            StreamBinding::File {
                path: PathBuf::from("/nonexistent/path/to/input"),
                access_mode: AccessMode::ReadOnly,
            },
        );
        let mut allocated = AllocatedFds::default();
        assert!(resolve(&spec, &[], &mut allocated).is_err());
    }

    #[test]
    fn alias_points_at_resolved_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = ProcessSpec::new("/bin/true");
        spec.descriptors.insert(
            1,
            StreamBinding::File {
                path: dir.path().join("out"),
                access_mode: AccessMode::WriteOnly,
            },
        );
        spec.descriptors.insert(2, StreamBinding::FdAlias { fd: 1 });

        let mut allocated = AllocatedFds::default();
        let resolved = resolve(&spec, &[], &mut allocated).unwrap();
        assert_eq!(resolved.slots[&1], resolved.slots[&2]);
    }

    #[test]
    fn pipe_ends_map_to_matrix_sides() {
        let mut allocated = AllocatedFds::default();
        let pipes = create_pipes(1, &mut allocated).unwrap();

        let mut spec = ProcessSpec::new("/bin/true");
        spec.descriptors.insert(
            1,
            StreamBinding::Pipe {
                pipe: 0,
                end: PipeEnd::Write,
            },
        );
        let resolved = resolve(&spec, &pipes, &mut allocated).unwrap();
        assert_eq!(resolved.slots[&1], ResolvedFd::Install(pipes[0].1));
    }

    #[test]
    fn allocated_fds_close_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("f");
        std::fs::write(&input, b"x").unwrap();

        let raw;
        {
            let mut allocated = AllocatedFds::default();
            raw = allocated.adopt(
                nix::fcntl::open(&input, OFlag::O_RDONLY, Mode::empty()).unwrap(),
            );
            let mut probe = unsafe { std::fs::File::from_raw_fd(nix::unistd::dup(raw).unwrap()) };
            let mut buf = String::new();
            probe.read_to_string(&mut buf).unwrap();
            assert_eq!(buf, "x");
        }
        // The descriptor is gone once the scope dropped
        assert!(nix::unistd::dup(raw).is_err());
    }

    #[test]
    fn fd_raw_value_is_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("f");
        std::fs::write(&input, b"x").unwrap();
        let mut allocated = AllocatedFds::default();
        let fd = nix::fcntl::open(&input, OFlag::O_RDONLY, Mode::empty()).unwrap();
        assert_eq!(allocated.adopt(fd), fd);
        assert_eq!(allocated.fds.last().unwrap().as_raw_fd(), fd);
    }
}
