/// Core error taxonomy for the invoker
use thiserror::Error;

/// Custom error types for invoker operations
#[derive(Error, Debug)]
pub enum InvokerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Container error: {0}")]
    Container(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Descriptor {fd} is not bound")]
    DescriptorOutOfRange { fd: i32 },

    #[error("Control helper exited abnormally ({status}): {stderr}")]
    ControlHelper { status: String, stderr: String },

    #[error("Invalid task: {0}")]
    Task(String),

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Notifier error: {0}")]
    Notifier(String),
}

impl From<nix::errno::Errno> for InvokerError {
    fn from(err: nix::errno::Errno) -> Self {
        InvokerError::Process(err.to_string())
    }
}

/// Result type alias for invoker operations
pub type Result<T> = std::result::Result<T, InvokerError>;
