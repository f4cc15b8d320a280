//! Assembly of the immutable [`RunOptions`] handed to an execution engine.

use crate::args::{split_args, Invocation};
use crate::error::RunError;
use crate::isolation::{self, Disposition, Isolation, NamespaceFlag, NamespaceKind, NamespacePolicy};
use crate::mounts::{self, MountSpec};
use config_loader::{KilnConfig, RunEnvironment};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const DEFAULT_RUNTIME: &str = "runc";
pub const DEFAULT_SHELL: [&str; 2] = ["/bin/sh", "-c"];

/// Raw values collected by a command surface for one `run` invocation.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Positional arguments: container reference, optional `--`, command.
    pub args: Vec<String>,
    pub isolation: Option<String>,
    pub namespaces: Vec<NamespaceFlag>,
    pub env: Vec<String>,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub volumes: Vec<String>,
    pub mounts: Vec<String>,
    pub context_dir: Option<PathBuf>,
    pub runtime: Option<String>,
    pub runtime_flags: Vec<String>,
    pub hostname: Option<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    /// `None` when the terminal flag was never given.
    pub terminal: Option<bool>,
    pub no_pivot: bool,
    /// `None` when the history flag was never given.
    pub add_history: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminalMode {
    /// Not requested either way; the engine uses the container's default.
    #[default]
    Inherit,
    Enabled,
    Disabled,
}

impl From<Option<bool>> for TerminalMode {
    fn from(flag: Option<bool>) -> Self {
        match flag {
            None => TerminalMode::Inherit,
            Some(true) => TerminalMode::Enabled,
            Some(false) => TerminalMode::Disabled,
        }
    }
}

/// Fully resolved configuration for a single run. Built by [`assemble`] and
/// read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    hostname: Option<String>,
    runtime: String,
    runtime_args: Vec<String>,
    no_pivot: bool,
    user: Option<String>,
    isolation: Isolation,
    namespaces: NamespacePolicy,
    context_dir: Option<PathBuf>,
    add_capabilities: Vec<String>,
    drop_capabilities: Vec<String>,
    env: Vec<String>,
    working_dir: Option<String>,
    terminal: TerminalMode,
    mounts: MountSpec,
}

impl RunOptions {
    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    /// Global runtime flags, each already in `--flag` form.
    pub fn runtime_args(&self) -> &[String] {
        &self.runtime_args
    }

    pub fn no_pivot(&self) -> bool {
        self.no_pivot
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn isolation(&self) -> Isolation {
        self.isolation
    }

    pub fn namespaces(&self) -> &NamespacePolicy {
        &self.namespaces
    }

    pub fn context_dir(&self) -> Option<&Path> {
        self.context_dir.as_deref()
    }

    pub fn add_capabilities(&self) -> &[String] {
        &self.add_capabilities
    }

    pub fn drop_capabilities(&self) -> &[String] {
        &self.drop_capabilities
    }

    pub fn env(&self) -> &[String] {
        &self.env
    }

    pub fn working_dir(&self) -> Option<&str> {
        self.working_dir.as_deref()
    }

    pub fn terminal(&self) -> TerminalMode {
        self.terminal
    }

    pub fn mounts(&self) -> &MountSpec {
        &self.mounts
    }

    /// True when the process stays in the host's UTS namespace, so no
    /// hostname can be applied.
    pub fn shares_host_uts(&self) -> bool {
        shares_host_uts(self.isolation, &self.namespaces)
    }
}

fn shares_host_uts(isolation: Isolation, namespaces: &NamespacePolicy) -> bool {
    match namespaces.get(NamespaceKind::Uts) {
        Some(Disposition::Host) => true,
        Some(_) => false,
        None => isolation == Isolation::Chroot,
    }
}

/// Everything needed to dispatch one run, derived without touching the
/// container store.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub invocation: Invocation,
    pub options: RunOptions,
    pub add_history: bool,
    /// Shell recorded in history when the container has none configured.
    pub default_shell: Vec<String>,
}

/// Runs the pure half of `run`: split, resolve, merge, assemble.
pub fn plan(
    request: &RunRequest,
    env: &RunEnvironment,
    defaults: &KilnConfig,
) -> Result<RunPlan, RunError> {
    let invocation = split_args(&request.args)?;
    let resolved = isolation::resolve(
        request.isolation.as_deref(),
        &request.namespaces,
        env,
        defaults,
    )?;
    let mounts = mounts::merge(
        &request.volumes,
        &request.mounts,
        request.context_dir.as_deref(),
    )?;
    let options = assemble(request, resolved, mounts, env, defaults)?;

    let add_history = request.add_history.or(env.history).unwrap_or(false);
    let default_shell = defaults
        .default_shell
        .clone()
        .filter(|shell| !shell.is_empty())
        .unwrap_or_else(|| DEFAULT_SHELL.iter().map(|s| s.to_string()).collect());

    Ok(RunPlan {
        invocation,
        options,
        add_history,
        default_shell,
    })
}

pub fn assemble(
    request: &RunRequest,
    resolved: isolation::ResolvedIsolation,
    mounts: MountSpec,
    env: &RunEnvironment,
    defaults: &KilnConfig,
) -> Result<RunOptions, RunError> {
    let runtime = [
        request.runtime.as_deref(),
        env.runtime.as_deref(),
        defaults.runtime.as_deref(),
    ]
    .into_iter()
    .flatten()
    .map(str::trim)
    .find(|r| !r.is_empty())
    .unwrap_or(DEFAULT_RUNTIME)
    .to_string();

    let runtime_args = defaults
        .runtime_flags
        .iter()
        .chain(&request.runtime_flags)
        .map(|flag| runtime_flag(flag))
        .collect::<Result<Vec<_>, _>>()?;

    let hostname = match request.hostname.as_deref() {
        Some(name) => Some(validate_hostname(name)?),
        None => None,
    };
    if hostname.is_some() && shares_host_uts(resolved.isolation, &resolved.namespaces) {
        return Err(RunError::invalid_configuration(
            "cannot set a hostname while sharing the host's UTS namespace",
        ));
    }

    let working_dir = match request.working_dir.as_deref() {
        Some(dir) if !dir.starts_with('/') => {
            return Err(RunError::invalid_configuration(format!(
                "working directory {dir:?} must be an absolute path"
            )))
        }
        Some(dir) => Some(dir.to_string()),
        None => None,
    };

    for assignment in &request.env {
        match assignment.split_once('=') {
            Some((key, _)) if !key.trim().is_empty() => {}
            _ => {
                return Err(RunError::invalid_configuration(format!(
                    "environment assignment {assignment:?} must be KEY=VALUE"
                )))
            }
        }
    }

    let no_pivot = request.no_pivot || env.no_pivot();
    let terminal = TerminalMode::from(request.terminal);

    let options = RunOptions {
        hostname,
        runtime,
        runtime_args,
        no_pivot,
        user: request
            .user
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string),
        isolation: resolved.isolation,
        namespaces: resolved.namespaces,
        context_dir: request.context_dir.clone(),
        add_capabilities: normalize_capabilities(&request.cap_add)?,
        drop_capabilities: normalize_capabilities(&request.cap_drop)?,
        env: request.env.clone(),
        working_dir,
        terminal,
        mounts,
    };

    debug!(
        runtime = %options.runtime,
        isolation = %options.isolation,
        no_pivot = options.no_pivot,
        terminal = ?options.terminal,
        mounts = options.mounts.len(),
        "assembled run options"
    );
    Ok(options)
}

fn runtime_flag(raw: &str) -> Result<String, RunError> {
    let bare = raw.trim().trim_start_matches('-');
    if bare.is_empty() {
        return Err(RunError::invalid_configuration(format!(
            "runtime flag {raw:?} is empty"
        )));
    }
    Ok(format!("--{bare}"))
}

fn validate_hostname(name: &str) -> Result<String, RunError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(RunError::invalid_configuration("hostname cannot be empty"));
    }
    if name.len() > 64 || name.chars().any(|c| c.is_whitespace() || c == '/') {
        return Err(RunError::invalid_configuration(format!(
            "invalid hostname {name:?}"
        )));
    }
    Ok(name.to_string())
}

/// Upper-cases capability names and adds the `CAP_` prefix; `ALL` is kept.
fn normalize_capabilities(raw: &[String]) -> Result<Vec<String>, RunError> {
    let mut out: Vec<String> = Vec::with_capacity(raw.len());
    for cap in raw.iter().flat_map(|c| c.split(',')) {
        let upper = cap.trim().to_ascii_uppercase();
        let bare = upper.strip_prefix("CAP_").unwrap_or(&upper);
        if bare.is_empty() {
            return Err(RunError::invalid_configuration(format!(
                "invalid capability name {cap:?}"
            )));
        }
        let name = if bare == "ALL" {
            bare.to_string()
        } else {
            format!("CAP_{bare}")
        };
        if !out.contains(&name) {
            out.push(name);
        }
    }
    Ok(out)
}
