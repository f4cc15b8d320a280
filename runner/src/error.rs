use crate::container::StoreError;
use crate::executor::ExecError;
use thiserror::Error;

/// Exit code used for failures that happen before or around the contained
/// process: bad arguments, unresolvable configuration, store problems.
pub const EXIT_RUN_FAILURE: i32 = 125;
/// Exit code used when the engine failed without reporting a process exit code.
pub const EXIT_ENGINE_FAILURE: i32 = 126;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("{message}")]
    InvalidArguments { message: String },

    #[error("invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    #[error("invalid mount specification: {message}")]
    InvalidMountSpec { message: String },

    #[error("error reading build container {id:?}: container not found")]
    NotFound { id: String },

    #[error("error reading build container {id:?}: {source}")]
    Store {
        id: String,
        #[source]
        source: StoreError,
    },

    /// The engine's error, carried unchanged.
    #[error(transparent)]
    Execution(ExecError),

    #[error("command ran in container {id:?} but its state could not be saved: {source}")]
    Persistence {
        id: String,
        #[source]
        source: StoreError,
    },
}

impl RunError {
    pub(crate) fn invalid_arguments(message: impl Into<String>) -> Self {
        RunError::InvalidArguments {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_configuration(message: impl Into<String>) -> Self {
        RunError::InvalidConfiguration {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_mount(message: impl Into<String>) -> Self {
        RunError::InvalidMountSpec {
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            RunError::InvalidArguments { .. } => "RUN_INVALID_ARGUMENTS",
            RunError::InvalidConfiguration { .. } => "RUN_INVALID_CONFIGURATION",
            RunError::InvalidMountSpec { .. } => "RUN_INVALID_MOUNT_SPEC",
            RunError::NotFound { .. } => "RUN_CONTAINER_NOT_FOUND",
            RunError::Store { .. } => "RUN_STORE_ERROR",
            RunError::Execution(_) => "RUN_EXECUTION_FAILED",
            RunError::Persistence { .. } => "RUN_PERSISTENCE_FAILED",
        }
    }

    /// Process exit code a command surface should report for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::Execution(err) => err.exit_code().unwrap_or(EXIT_ENGINE_FAILURE),
            _ => EXIT_RUN_FAILURE,
        }
    }
}
