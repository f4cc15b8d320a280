//! Execution engines: something that can run a command inside a container
//! as described by [`RunOptions`].

mod oci;
mod stub;

pub use oci::OciExecutor;
pub use stub::StubExecutor;

use crate::container::ContainerRecord;
use crate::options::RunOptions;
use config_loader::RunEnvironment;
use thiserror::Error;

/// Runtime name that selects [`StubExecutor`].
pub const STUB_RUNTIME: &str = "stub";

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn container runtime {runtime}: {source}")]
    RuntimeSpawn {
        runtime: String,
        #[source]
        source: std::io::Error,
    },

    #[error("container runtime {runtime} exited with code {code}")]
    Exited { runtime: String, code: i32 },

    #[error("container runtime {runtime} was terminated by a signal")]
    Signaled { runtime: String },

    #[error("failed to prepare runtime bundle: {message}")]
    Bundle { message: String },

    #[error("unable to resolve user {user:?}: {message}")]
    User { user: String, message: String },
}

impl ExecError {
    /// Exit code of the contained process, when the runtime reported one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ExecError::Exited { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ExecError::RuntimeSpawn { .. } => "EXEC_RUNTIME_SPAWN",
            ExecError::Exited { .. } => "EXEC_EXITED",
            ExecError::Signaled { .. } => "EXEC_SIGNALED",
            ExecError::Bundle { .. } => "EXEC_BUNDLE",
            ExecError::User { .. } => "EXEC_USER",
        }
    }
}

pub trait Executor {
    /// Runs `command` in `container` and blocks until it exits.
    fn run(
        &self,
        container: &ContainerRecord,
        command: &[String],
        options: &RunOptions,
    ) -> Result<(), ExecError>;
}

/// Picks the engine for a resolved runtime: the stub when the runtime is
/// `stub`, the OCI runtime binary otherwise.
pub fn select(runtime: &str, env: &RunEnvironment) -> Box<dyn Executor> {
    if runtime.trim().eq_ignore_ascii_case(STUB_RUNTIME) {
        Box::new(StubExecutor::new(env.stub_exit_code))
    } else {
        Box::new(OciExecutor::new())
    }
}
