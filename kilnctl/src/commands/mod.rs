pub mod history;
pub mod run;

use anyhow::{Context, Result};
use config_loader::{ConfigManager, KilnConfig, RunEnvironment};

/// Reads the `KILN_*` overrides and the defaults file they point at.
pub fn load_settings() -> Result<(RunEnvironment, KilnConfig)> {
    let env = RunEnvironment::from_env().context("Failed to read KILN_* environment")?;
    let manager = ConfigManager::new(&env);
    let defaults = manager.load_defaults().with_context(|| {
        format!(
            "Failed to load defaults from {}",
            manager.defaults_path().display()
        )
    })?;
    Ok((env, defaults))
}
