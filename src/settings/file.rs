use log::info;
use std::fs;
use std::path::{Path, PathBuf};

use crate::settings::{DiverterSettings, SettingsError};

/// Default location of the configuration file.
///
/// `$XDG_CONFIG_HOME/netdivert/diverter.toml` on Linux.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("netdivert").join("diverter.toml"))
}

/// Loads and validates settings from a TOML file.
pub fn load_settings(path: &Path) -> Result<DiverterSettings, SettingsError> {
    let content = fs::read_to_string(path).map_err(|source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let settings = parse_settings(&content)?;
    info!("Loaded configuration from {}", path.display());
    Ok(settings)
}

/// Parses and validates settings from TOML text.
pub fn parse_settings(content: &str) -> Result<DiverterSettings, SettingsError> {
    let settings: DiverterSettings = toml::from_str(content)?;
    settings.validate()?;
    Ok(settings)
}

/// Writes settings to a TOML file, creating parent directories.
pub fn save_settings(path: &Path, settings: &DiverterSettings) -> Result<(), SettingsError> {
    let content = toml::to_string_pretty(settings)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| SettingsError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    fs::write(path, content).map_err(|source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    info!("Saved configuration to {}", path.display());
    Ok(())
}
