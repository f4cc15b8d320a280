use super::{ExecError, Executor, STUB_RUNTIME};
use crate::container::ContainerRecord;
use crate::options::RunOptions;
use tracing::info;

/// Engine that runs nothing. Succeeds, or fails with the configured exit code.
#[derive(Debug, Clone, Default)]
pub struct StubExecutor {
    exit_code: Option<i32>,
}

impl StubExecutor {
    pub fn new(exit_code: Option<i32>) -> Self {
        Self { exit_code }
    }
}

impl Executor for StubExecutor {
    fn run(
        &self,
        container: &ContainerRecord,
        command: &[String],
        options: &RunOptions,
    ) -> Result<(), ExecError> {
        info!(
            container = %container.id,
            command = ?command,
            isolation = %options.isolation(),
            "stub runtime: not executing command"
        );
        match self.exit_code {
            Some(code) if code != 0 => Err(ExecError::Exited {
                runtime: STUB_RUNTIME.to_string(),
                code,
            }),
            _ => Ok(()),
        }
    }
}
