//! Process-environment overrides consulted by `run`.

use crate::{ConfigError, KilnConfig};
use std::path::PathBuf;
use tracing::{debug, warn};

pub const ISOLATION_VAR: &str = "KILN_ISOLATION";
pub const NOPIVOT_VAR: &str = "KILN_NOPIVOT";
pub const HISTORY_VAR: &str = "KILN_HISTORY";
pub const RUNTIME_VAR: &str = "KILN_RUNTIME";
pub const STORAGE_ROOT_VAR: &str = "KILN_STORAGE_ROOT";
pub const CONFIG_DIR_VAR: &str = "KILN_CONFIG_DIR";
pub const STUB_EXIT_CODE_VAR: &str = "KILN_STUB_EXIT_CODE";

/// Snapshot of the `KILN_*` variables, taken once per invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunEnvironment {
    pub isolation: Option<String>,
    /// Raw `KILN_NOPIVOT` text; see [`RunEnvironment::no_pivot`].
    pub no_pivot: Option<String>,
    pub history: Option<bool>,
    pub runtime: Option<String>,
    pub storage_root: Option<PathBuf>,
    pub config_dir: Option<PathBuf>,
    pub stub_exit_code: Option<i32>,
}

impl RunEnvironment {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let no_pivot = lookup(NOPIVOT_VAR);
        if let Some(value) = no_pivot.as_deref() {
            if matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "0" | "false" | "no" | "off"
            ) {
                warn!(
                    value,
                    "{} is set, so pivot_root is disabled regardless of its value", NOPIVOT_VAR
                );
            }
        }

        let history = match text(HISTORY_VAR) {
            Some(value) => Some(parse_bool(HISTORY_VAR, &value)?),
            None => None,
        };

        let stub_exit_code = match text(STUB_EXIT_CODE_VAR) {
            Some(value) => Some(value.trim().parse::<i32>().map_err(|e| {
                ConfigError::InvalidOverride {
                    key: STUB_EXIT_CODE_VAR.to_string(),
                    message: format!("{value:?} is not an integer: {e}"),
                }
            })?),
            None => None,
        };

        let env = Self {
            isolation: text(ISOLATION_VAR),
            no_pivot,
            history,
            runtime: text(RUNTIME_VAR),
            storage_root: text(STORAGE_ROOT_VAR).map(PathBuf::from),
            config_dir: text(CONFIG_DIR_VAR).map(PathBuf::from),
            stub_exit_code,
        };
        debug!(?env, "read environment overrides");
        Ok(env)
    }

    /// True when `KILN_NOPIVOT` is present with any non-empty value.
    pub fn no_pivot(&self) -> bool {
        self.no_pivot.as_deref().is_some_and(|v| !v.is_empty())
    }

    /// Store root: `KILN_STORAGE_ROOT`, then the defaults file, then
    /// `<user data dir>/kiln`.
    pub fn storage_root(&self, defaults: &KilnConfig) -> PathBuf {
        self.storage_root
            .clone()
            .or_else(|| defaults.storage_root.clone())
            .or_else(|| dirs::data_dir().map(|dir| dir.join("kiln")))
            .unwrap_or_else(|| PathBuf::from(".kiln"))
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidOverride {
            key: key.to_string(),
            message: format!("expected a boolean, got {other:?}"),
        }),
    }
}
