// Configuration loader
// Loads the training config from an explicit path, the user config dir, or defaults

use std::fs;
use std::path::{Path, PathBuf};

use super::settings::TrainConfig;
use crate::errors::Result;

/// Location of the per-user config file (`~/.config/reid-trainer/config.toml` on Linux)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("reid-trainer").join("config.toml"))
}

/// Load configuration
///
/// An explicit path must exist. Without one, the user config file is used
/// when present, otherwise the built-in defaults. Values are not validated
/// here; callers apply their overrides first and then call `validate`.
pub fn load_config(path: Option<&Path>) -> Result<TrainConfig> {
    let config = match path {
        Some(path) => load_from_file(path)?,
        None => match default_config_path().filter(|p| p.exists()) {
            Some(path) => load_from_file(&path)?,
            None => {
                tracing::debug!("No config file found, using defaults");
                TrainConfig::default()
            }
        },
    };
    Ok(config)
}

fn load_from_file(path: &Path) -> Result<TrainConfig> {
    let contents = fs::read_to_string(path)?;
    let config: TrainConfig = toml::from_str(&contents)?;
    tracing::info!(path = %path.display(), "Loaded config");
    Ok(config)
}
