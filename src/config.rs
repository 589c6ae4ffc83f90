//! Configuration loading via `ortho-config`.

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::release::DEFAULT_RELEASES_URL;

/// Ambient settings merged from defaults, configuration files and the
/// environment (`STRATUS_` prefix). Per-invocation inputs such as the
/// instance name stay on the command line.
#[derive(Clone, Debug, Deserialize, Eq, OrthoConfig, PartialEq)]
#[ortho_config(prefix = "STRATUS")]
pub struct AppConfig {
    /// Path of the local record store. Defaults to `.stratus/store.json`
    /// under the home directory.
    pub store_path: Option<String>,
    /// URL of the release index.
    #[ortho_config(default = DEFAULT_RELEASES_URL.to_owned())]
    pub releases_url: String,
}

/// Errors raised while resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Raised when the configuration sources cannot be merged.
    #[error("failed to load configuration: {0}")]
    Parse(String),
    /// Raised when no store path is configured and the home directory
    /// cannot be determined.
    #[error("cannot determine a store path: no home directory")]
    NoHomeDirectory,
    /// Raised when a resolved path is not valid UTF-8.
    #[error("configured path is not valid UTF-8: {0}")]
    InvalidPath(String),
}

impl AppConfig {
    /// Loads configuration without parsing CLI arguments. Values merge
    /// defaults, configuration files and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_from_sources() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("stratus")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Resolves the record store path, falling back to
    /// `~/.stratus/store.json`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoHomeDirectory`] when no override is set and
    /// the home directory is unknown, and [`ConfigError::InvalidPath`] when
    /// the resolved path is not UTF-8.
    pub fn store_path(&self) -> Result<Utf8PathBuf, ConfigError> {
        if let Some(path) = &self.store_path {
            return Ok(Utf8PathBuf::from(path));
        }
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDirectory)?;
        Utf8PathBuf::from_path_buf(home.join(".stratus").join("store.json"))
            .map_err(|path| ConfigError::InvalidPath(path.display().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_store_path_wins() {
        let config = AppConfig {
            store_path: Some(String::from("/tmp/custom.json")),
            releases_url: String::from(DEFAULT_RELEASES_URL),
        };
        let path = config
            .store_path()
            .unwrap_or_else(|err| panic!("store_path: {err}"));
        assert_eq!(path, Utf8PathBuf::from("/tmp/custom.json"));
    }

    #[test]
    fn default_store_path_lives_under_home() {
        let config = AppConfig {
            store_path: None,
            releases_url: String::from(DEFAULT_RELEASES_URL),
        };
        if dirs::home_dir().is_some() {
            let path = config
                .store_path()
                .unwrap_or_else(|err| panic!("store_path: {err}"));
            assert!(path.as_str().ends_with(".stratus/store.json"));
        }
    }
}
