//! Opens the target container, hands the command to an engine and commits
//! history when the run succeeds.

use crate::container::{Container, ContainerStore, HistoryEntry, StoreError};
use crate::error::RunError;
use crate::executor::Executor;
use crate::options::RunPlan;
use tracing::{debug, info, instrument};

/// Executes a planned run.
///
/// Returns the history entry that was committed, if any. The container is
/// saved exactly once after a successful run and never after a failed one.
#[instrument(
    skip_all,
    fields(container = %plan.invocation.container, runtime = %plan.options.runtime())
)]
pub fn dispatch<S, E>(
    store: &S,
    executor: &E,
    plan: RunPlan,
) -> Result<Option<HistoryEntry>, RunError>
where
    S: ContainerStore + ?Sized,
    E: Executor + ?Sized,
{
    let reference = plan.invocation.container.as_str();
    let mut container = store.open(reference).map_err(|err| match err {
        StoreError::NotFound { .. } => RunError::NotFound {
            id: reference.to_string(),
        },
        source => RunError::Store {
            id: reference.to_string(),
            source,
        },
    })?;

    let command = &plan.invocation.command;
    if let Err(err) = executor.run(container.record(), command, &plan.options) {
        debug!(container = %container.id(), error = %err, "error running command in container");
        return Err(RunError::Execution(err));
    }

    commit(
        &mut container,
        command,
        plan.add_history,
        &plan.default_shell,
    )
}

/// Records the command when `add_history` is set, then persists the
/// container.
pub fn commit<C>(
    container: &mut C,
    command: &[String],
    add_history: bool,
    default_shell: &[String],
) -> Result<Option<HistoryEntry>, RunError>
where
    C: Container + ?Sized,
{
    let entry = if add_history {
        let shell: Vec<String> = if container.shell().is_empty() {
            default_shell.to_vec()
        } else {
            container.shell().to_vec()
        };
        let entry = HistoryEntry::new(&shell, command);
        container.add_history(entry.clone());
        Some(entry)
    } else {
        None
    };

    container.save().map_err(|source| RunError::Persistence {
        id: container.id().to_string(),
        source,
    })?;

    if let Some(entry) = &entry {
        info!(container = %container.id(), created_by = %entry.created_by, "recorded history");
    }
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ContainerConfig, ContainerRecord};
    use crate::executor::ExecError;
    use crate::options::{plan, RunOptions, RunRequest};
    use config_loader::{KilnConfig, RunEnvironment};
    use std::cell::{Cell, RefCell};
    use std::path::PathBuf;
    use std::rc::Rc;

    #[derive(Default)]
    struct Saves {
        count: Cell<usize>,
        history: RefCell<Vec<HistoryEntry>>,
    }

    struct MockContainer {
        record: ContainerRecord,
        saves: Rc<Saves>,
        fail_save: bool,
    }

    impl Container for MockContainer {
        fn record(&self) -> &ContainerRecord {
            &self.record
        }

        fn add_history(&mut self, entry: HistoryEntry) {
            self.record.history.push(entry);
        }

        fn save(&mut self) -> Result<(), StoreError> {
            if self.fail_save {
                return Err(StoreError::Io {
                    path: PathBuf::from("/nowhere"),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
                });
            }
            self.saves.count.set(self.saves.count.get() + 1);
            *self.saves.history.borrow_mut() = self.record.history.clone();
            Ok(())
        }
    }

    struct MockStore {
        shell: Vec<String>,
        saves: Rc<Saves>,
        fail_save: bool,
    }

    impl MockStore {
        fn new(shell: &[&str]) -> Self {
            Self {
                shell: shell.iter().map(|s| s.to_string()).collect(),
                saves: Rc::new(Saves::default()),
                fail_save: false,
            }
        }
    }

    impl ContainerStore for MockStore {
        type Container = MockContainer;

        fn open(&self, reference: &str) -> Result<MockContainer, StoreError> {
            if reference != "ctr" {
                return Err(StoreError::NotFound {
                    reference: reference.to_string(),
                });
            }
            Ok(MockContainer {
                record: ContainerRecord {
                    id: "abc".to_string(),
                    name: "ctr".to_string(),
                    rootfs: PathBuf::from("/rootfs"),
                    config: ContainerConfig {
                        shell: self.shell.clone(),
                        ..Default::default()
                    },
                    history: vec![],
                },
                saves: Rc::clone(&self.saves),
                fail_save: self.fail_save,
            })
        }
    }

    struct MockExecutor {
        exit_code: Option<i32>,
        calls: RefCell<Vec<Vec<String>>>,
    }

    impl MockExecutor {
        fn new(exit_code: Option<i32>) -> Self {
            Self {
                exit_code,
                calls: RefCell::new(vec![]),
            }
        }
    }

    impl Executor for MockExecutor {
        fn run(
            &self,
            _container: &ContainerRecord,
            command: &[String],
            _options: &RunOptions,
        ) -> Result<(), ExecError> {
            self.calls.borrow_mut().push(command.to_vec());
            match self.exit_code {
                Some(code) => Err(ExecError::Exited {
                    runtime: "mock".to_string(),
                    code,
                }),
                None => Ok(()),
            }
        }
    }

    fn run_plan(args: &[&str], add_history: Option<bool>) -> RunPlan {
        let request = RunRequest {
            args: args.iter().map(|s| s.to_string()).collect(),
            add_history,
            ..Default::default()
        };
        plan(&request, &RunEnvironment::default(), &KilnConfig::default()).unwrap()
    }

    #[test]
    fn success_with_history_commits_one_entry() {
        let store = MockStore::new(&[]);
        let executor = MockExecutor::new(None);

        let entry = dispatch(&store, &executor, run_plan(&["ctr", "echo", "hi"], Some(true)))
            .unwrap()
            .unwrap();

        assert_eq!(entry.created_by, "/bin/sh -c echo hi");
        assert_eq!(store.saves.count.get(), 1);
        assert_eq!(store.saves.history.borrow().len(), 1);
        assert_eq!(executor.calls.borrow()[0], vec!["echo", "hi"]);
    }

    #[test]
    fn container_shell_wins_over_default() {
        let store = MockStore::new(&["/bin/bash", "-lc"]);
        let executor = MockExecutor::new(None);

        let entry = dispatch(&store, &executor, run_plan(&["ctr", "--", "make", "all"], Some(true)))
            .unwrap()
            .unwrap();
        assert_eq!(entry.created_by, "/bin/bash -lc make all");
        assert_eq!(entry.shell, "/bin/bash -lc");
    }

    #[test]
    fn success_without_history_still_saves_once() {
        let store = MockStore::new(&[]);
        let executor = MockExecutor::new(None);

        let entry = dispatch(&store, &executor, run_plan(&["ctr", "true"], None)).unwrap();
        assert!(entry.is_none());
        assert_eq!(store.saves.count.get(), 1);
        assert!(store.saves.history.borrow().is_empty());
    }

    #[test]
    fn failed_run_returns_engine_error_and_never_saves() {
        let store = MockStore::new(&[]);
        let executor = MockExecutor::new(Some(3));

        let err = dispatch(&store, &executor, run_plan(&["ctr", "false"], Some(true))).unwrap_err();
        match &err {
            RunError::Execution(ExecError::Exited { code, .. }) => assert_eq!(*code, 3),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.exit_code(), 3);
        assert_eq!(store.saves.count.get(), 0);
        assert!(store.saves.history.borrow().is_empty());
    }

    #[test]
    fn unknown_container_is_not_found_and_engine_is_not_called() {
        let store = MockStore::new(&[]);
        let executor = MockExecutor::new(None);

        let err = dispatch(&store, &executor, run_plan(&["ghost", "true"], None)).unwrap_err();
        assert!(matches!(err, RunError::NotFound { ref id } if id == "ghost"));
        assert!(executor.calls.borrow().is_empty());
    }

    #[test]
    fn save_failure_is_a_persistence_error() {
        let mut store = MockStore::new(&[]);
        store.fail_save = true;
        let executor = MockExecutor::new(None);

        let err = dispatch(&store, &executor, run_plan(&["ctr", "true"], Some(true))).unwrap_err();
        assert!(matches!(err, RunError::Persistence { .. }));
    }
}
