//! Core of `kilnctl run`: turns a raw request into resolved run options,
//! executes the command in a container and commits its history.

pub mod args;
pub mod container;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod isolation;
pub mod mounts;
pub mod options;

pub use args::{split_args, Invocation};
pub use container::{
    Container, ContainerConfig, ContainerRecord, ContainerStore, FileContainer, FileStore,
    HistoryEntry, StoreError,
};
pub use dispatch::{commit, dispatch};
pub use error::RunError;
pub use executor::{ExecError, Executor, OciExecutor, StubExecutor};
pub use isolation::{
    Disposition, Isolation, NamespaceFlag, NamespaceKind, NamespacePolicy, NetworkPolicy,
    ResolvedIsolation,
};
pub use mounts::{Mount, MountSpec, MountType};
pub use options::{plan, RunOptions, RunPlan, RunRequest, TerminalMode};

use config_loader::{KilnConfig, RunEnvironment};

/// Plans `request`, opens the file store under the resolved storage root
/// and dispatches to the engine the resolved runtime selects.
pub fn run(
    request: &RunRequest,
    env: &RunEnvironment,
    defaults: &KilnConfig,
) -> Result<Option<HistoryEntry>, RunError> {
    let plan = options::plan(request, env, defaults)?;
    let store = FileStore::new(env.storage_root(defaults));
    let executor = executor::select(plan.options.runtime(), env);
    dispatch(&store, executor.as_ref(), plan)
}
