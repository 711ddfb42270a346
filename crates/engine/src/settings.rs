//! Chef settings loaded from a YAML or JSON file.
//!
//! The file lives at `<config_dir>/brigade/settings.yaml` unless `BRIGADE_SETTINGS_PATH`
//! points elsewhere. A missing file yields the defaults. `BRIGADE_MAX_DISPATCHES` overrides
//! the dispatch guard after the file has been read.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use dirs_next::config_dir;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Environment variable overriding the settings file path.
pub const SETTINGS_PATH_ENV: &str = "BRIGADE_SETTINGS_PATH";

/// Environment variable overriding [`ChefSettings::max_dispatches`].
pub const MAX_DISPATCHES_ENV: &str = "BRIGADE_MAX_DISPATCHES";

/// Default filename inside the brigade config directory.
pub const SETTINGS_FILE_NAME: &str = "settings.yaml";

/// Error surfaced when settings cannot be loaded.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings I/O error for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML settings: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid JSON settings: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid value for {variable}: '{value}'")]
    InvalidOverride { variable: &'static str, value: String },
}

/// Tunables applied to every chef created from them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChefSettings {
    /// Upper bound on dispatched steps per cooking cycle. `None` disables the guard.
    pub max_dispatches: Option<u64>,
    /// Logs the workplan keys after every step at debug level.
    pub trace_workplan: bool,
}

/// Path of the settings file, honouring [`SETTINGS_PATH_ENV`].
pub fn default_settings_path() -> PathBuf {
    if let Ok(path) = env::var(SETTINGS_PATH_ENV) {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("brigade")
        .join(SETTINGS_FILE_NAME)
}

/// Loads settings from the default location and applies environment overrides.
pub fn load_settings() -> Result<ChefSettings, SettingsError> {
    let mut settings = load_settings_from(&default_settings_path())?;
    apply_env_overrides(&mut settings)?;
    Ok(settings)
}

/// Loads settings from `path`. A missing file yields the defaults.
pub fn load_settings_from(path: &Path) -> Result<ChefSettings, SettingsError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "settings file not found; using defaults");
            return Ok(ChefSettings::default());
        }
        Err(source) => {
            return Err(SettingsError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let is_json = path.extension().and_then(|extension| extension.to_str()) == Some("json");
    let settings = if is_json {
        serde_json::from_str(&content)?
    } else if content.trim().is_empty() {
        ChefSettings::default()
    } else {
        serde_yaml::from_str(&content)?
    };
    debug!(path = %path.display(), ?settings, "settings loaded");
    Ok(settings)
}

fn apply_env_overrides(settings: &mut ChefSettings) -> Result<(), SettingsError> {
    let Ok(raw) = env::var(MAX_DISPATCHES_ENV) else {
        return Ok(());
    };
    let value = raw.trim();
    if value.is_empty() {
        return Ok(());
    }
    let limit = value.parse::<u64>().map_err(|_| SettingsError::InvalidOverride {
        variable: MAX_DISPATCHES_ENV,
        value: raw.clone(),
    })?;
    settings.max_dispatches = Some(limit);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn missing_files_yield_defaults() {
        let dir = tempdir().expect("tempdir");
        let settings = load_settings_from(&dir.path().join("absent.yaml")).expect("defaults");
        assert_eq!(settings, ChefSettings::default());
    }

    #[test]
    fn yaml_and_json_files_are_both_understood() {
        let dir = tempdir().expect("tempdir");
        let yaml = dir.path().join("settings.yaml");
        fs::write(&yaml, "max_dispatches: 25\n").expect("write yaml");
        let json = dir.path().join("settings.json");
        fs::write(&json, r#"{ "trace_workplan": true }"#).expect("write json");

        let from_yaml = load_settings_from(&yaml).expect("yaml");
        assert_eq!(from_yaml.max_dispatches, Some(25));
        assert!(!from_yaml.trace_workplan);

        let from_json = load_settings_from(&json).expect("json");
        assert_eq!(from_json.max_dispatches, None);
        assert!(from_json.trace_workplan);
    }

    #[test]
    fn malformed_files_are_reported() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("settings.yaml");
        fs::write(&path, "max_dispatches: [not, a, number]\n").expect("write");
        assert!(matches!(load_settings_from(&path), Err(SettingsError::Yaml(_))));
    }

    #[test]
    fn environment_selects_the_file_and_overrides_the_guard() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("custom.yaml");
        fs::write(&path, "max_dispatches: 5\ntrace_workplan: true\n").expect("write");

        temp_env::with_vars(
            [
                (SETTINGS_PATH_ENV, Some(path.to_string_lossy().to_string())),
                (MAX_DISPATCHES_ENV, Some("40".to_string())),
            ],
            || {
                let settings = load_settings().expect("settings");
                assert_eq!(settings.max_dispatches, Some(40));
                assert!(settings.trace_workplan);
            },
        );
    }

    #[test]
    fn unparsable_overrides_are_rejected() {
        let dir = tempdir().expect("tempdir");
        temp_env::with_vars(
            [
                (SETTINGS_PATH_ENV, Some(dir.path().join("none.yaml").to_string_lossy().to_string())),
                (MAX_DISPATCHES_ENV, Some("lots".to_string())),
            ],
            || {
                assert!(matches!(load_settings(), Err(SettingsError::InvalidOverride { .. })));
            },
        );
    }
}
