use crate::core::applier::ApplierSettings;
use crate::core::compiler::InputPolicy;
use crate::core::error::{Error, Result};
use crate::utils::get_config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Overrides `applier.restore_command`
pub const RESTORE_COMMAND_ENV: &str = "FWMGR_RESTORE_COMMAND";
/// Overrides `applier.save_command`
pub const SAVE_COMMAND_ENV: &str = "FWMGR_SAVE_COMMAND";

/// Tool configuration (`~/.config/fwmgr/config.json`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Policy store location; the XDG data directory when unset
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    /// Self-protection section of the INPUT chain
    #[serde(default)]
    pub input: InputPolicy,
    #[serde(default)]
    pub applier: ApplierSettings,
    #[serde(default = "default_true")]
    pub audit_enabled: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            input: InputPolicy::default(),
            applier: ApplierSettings::default(),
            audit_enabled: true,
        }
    }
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    /// Applies `FWMGR_RESTORE_COMMAND` / `FWMGR_SAVE_COMMAND` when set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(cmd) = std::env::var(RESTORE_COMMAND_ENV)
            && !cmd.is_empty()
        {
            tracing::debug!("{RESTORE_COMMAND_ENV} overrides restore command: {cmd}");
            self.applier.restore_command = cmd;
        }
        if let Ok(cmd) = std::env::var(SAVE_COMMAND_ENV)
            && !cmd.is_empty()
        {
            tracing::debug!("{SAVE_COMMAND_ENV} overrides save command: {cmd}");
            self.applier.save_command = cmd;
        }
    }
}

/// Default config file location.
pub fn config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.json"))
}

/// Saves the config using an atomic write pattern.
/// 1. Writes to a temporary file created with mode 0o600.
/// 2. Flushes it to disk.
/// 3. Atomically renames it over the target path.
///
/// # Errors
///
/// I/O or serialization failures.
pub async fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    use tokio::fs::OpenOptions;
    use tokio::io::AsyncWriteExt;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }

    let json = serde_json::to_string_pretty(config)?;
    let mut temp_path = path.as_os_str().to_owned();
    temp_path.push(".tmp");
    let temp_path = PathBuf::from(temp_path);

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(&temp_path)
        .await?;
    file.write_all(json.as_bytes()).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&temp_path, path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::StorageFull {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save configuration. Free up space and try again.",
            ))
        } else {
            Error::Io(e)
        }
    })?;
    Ok(())
}

/// Loads the config, or the defaults if the file does not exist.
///
/// Unlike a missing file, a malformed one is an error: silently falling back
/// would change which admin ports stay open.
///
/// # Errors
///
/// `Error::Configuration` for unreadable or malformed files.
pub async fn load_config(path: &Path) -> Result<AppConfig> {
    let json = match tokio::fs::read_to_string(path).await {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(AppConfig::default());
        }
        Err(e) => {
            return Err(Error::Configuration(format!(
                "cannot read {}: {e}",
                path.display()
            )));
        }
    };

    serde_json::from_str(&json)
        .map_err(|e| Error::Configuration(format!("malformed {}: {e}", path.display())))
}
