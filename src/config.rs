/// Container configuration: a JSON document merged into effective settings
use crate::task::{
    AccessMode, GroupResourceLimits, OwnerId, ProcessResourceLimits, StreamBinding,
};
use crate::types::{InvokerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;

/// Environment variable naming the config file used when no path is given
pub const CONFIG_ENV: &str = "INVOKER_CONFIG";

/// A filesystem entry created inside the container root
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum CreateFile {
    RegularFile {
        path: PathBuf,
        mode: u32,
    },
    Directory {
        path: PathBuf,
        mode: u32,
    },
    Device {
        path: PathBuf,
        mode: u32,
        major: u32,
        minor: u32,
    },
    SymLink {
        value: PathBuf,
        path: PathBuf,
    },
}

/// Filesystem population applied when a container is created
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FilesystemConfig {
    pub create_files: Vec<CreateFile>,
}

fn char_device(path: &str, major: u32, minor: u32) -> CreateFile {
    CreateFile::Device {
        path: PathBuf::from(path),
        mode: 0o666,
        major,
        minor,
    }
}

fn symlink(value: &str, path: &str) -> CreateFile {
    CreateFile::SymLink {
        value: PathBuf::from(value),
        path: PathBuf::from(path),
    }
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            create_files: vec![
                char_device("/dev/null", 1, 3),
                char_device("/dev/zero", 1, 5),
                char_device("/dev/random", 1, 8),
                char_device("/dev/urandom", 1, 9),
                char_device("/dev/full", 1, 7),
                symlink("/proc/fd", "/dev/fd"),
                symlink("/proc/self/fd/0", "/dev/stdin"),
                symlink("/proc/self/fd/1", "/dev/stdout"),
                symlink("/proc/self/fd/2", "/dev/stderr"),
            ],
        }
    }
}

/// One mount entry of the namespace configuration. Consumed by the external
/// provisioning layer; the core only carries it through the document.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MountEntry {
    pub source: PathBuf,
    pub target: PathBuf,
    pub fs_type: String,
    pub options: String,
}

impl MountEntry {
    pub fn bind_ro(path: &str) -> Self {
        Self {
            source: PathBuf::from(path),
            target: PathBuf::from(path),
            fs_type: "none".to_string(),
            options: "bind,ro".to_string(),
        }
    }

    pub fn proc() -> Self {
        Self {
            source: PathBuf::from("proc"),
            target: PathBuf::from("/proc"),
            fs_type: "proc".to_string(),
            options: "defaults".to_string(),
        }
    }
}

/// LXC-style namespace settings, passed through to the provisioning layer
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NamespaceConfig {
    pub arch: String,
    pub utsname: String,
    pub mount: Vec<MountEntry>,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            arch: if cfg!(target_pointer_width = "64") {
                "x86_64".to_string()
            } else {
                "x86".to_string()
            },
            utsname: "container".to_string(),
            mount: vec![
                MountEntry::bind_ro("/etc"),
                MountEntry::bind_ro("/bin"),
                MountEntry::bind_ro("/sbin"),
                MountEntry::bind_ro("/lib"),
                MountEntry::bind_ro("/usr"),
                MountEntry::proc(),
            ],
        }
    }
}

/// Defaults merged into every created process
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProcessDefaultSettings {
    pub environment: BTreeMap<String, String>,
    pub owner_id: OwnerId,
    pub resource_limits: ProcessResourceLimits,
    pub descriptors: BTreeMap<i32, StreamBinding>,
    pub current_path: PathBuf,
}

impl Default for ProcessDefaultSettings {
    fn default() -> Self {
        let mut environment = BTreeMap::new();
        environment.insert(
            "PATH".to_string(),
            "/usr/local/bin:/usr/bin:/bin:/usr/local/sbin:/usr/sbin:/sbin".to_string(),
        );
        environment.insert("LC_ALL".to_string(), "C".to_string());
        environment.insert("LANG".to_string(), "C".to_string());
        environment.insert("PWD".to_string(), "/".to_string());

        let mut descriptors = BTreeMap::new();
        for fd in 0..=2 {
            descriptors.insert(
                fd,
                StreamBinding::File {
                    path: PathBuf::from("/dev/null"),
                    access_mode: AccessMode::ReadWrite,
                },
            );
        }

        Self {
            environment,
            owner_id: OwnerId { uid: 0, gid: 0 },
            resource_limits: ProcessResourceLimits::default(),
            descriptors,
            current_path: PathBuf::from("/"),
        }
    }
}

/// Defaults merged into every created group
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct GroupDefaultSettings {
    pub resource_limits: GroupResourceLimits,
    pub process_default_settings: ProcessDefaultSettings,
}

/// The in-container control helper
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ControlProcessConfig {
    pub executable: PathBuf,
    /// Route tasks through the helper instead of running them in-process
    #[serde(default)]
    pub use_helper: bool,
}

impl Default for ControlProcessConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("invoker-ctl"),
            use_helper: false,
        }
    }
}

/// Root of the configuration document
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ContainerConfig {
    pub containers_dir: PathBuf,
    pub namespace_config: NamespaceConfig,
    pub group_default_settings: GroupDefaultSettings,
    pub control_process: ControlProcessConfig,
    pub filesystem_config: FilesystemConfig,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            containers_dir: PathBuf::from("/tmp"),
            namespace_config: NamespaceConfig::default(),
            group_default_settings: GroupDefaultSettings::default(),
            control_process: ControlProcessConfig::default(),
            filesystem_config: FilesystemConfig::default(),
        }
    }
}

impl ContainerConfig {
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        serde_json::from_reader(reader)
            .map_err(|e| InvokerError::Config(format!("failed to parse configuration: {}", e)))
    }

    pub fn to_writer(&self, writer: impl Write) -> Result<()> {
        serde_json::to_writer_pretty(writer, self)
            .map_err(|e| InvokerError::Config(format!("failed to write configuration: {}", e)))
    }

    pub fn load(path: &std::path::Path) -> Result<Self> {
        log::info!("loading configuration from {}", path.display());
        let file = std::fs::File::open(path).map_err(|e| {
            InvokerError::Config(format!("cannot open {}: {}", path.display(), e))
        })?;
        Self::from_reader(file)
    }

    /// Built-in defaults, overridden by the file named in `INVOKER_CONFIG`
    /// when the variable is set.
    pub fn from_environment() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(std::path::Path::new(&path)),
            None => Ok(Self::default()),
        }
    }
}
