//! Instance configuration file loading.
//!
//! Siodb instances keep a flat `key = value` parameter file under
//! `/etc/siodb/instances/<name>/config`. Lines starting with `#` are
//! comments; everything else with an `=` is a parameter.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors raised while loading or validating the instance configuration.
/// All of them are fatal at startup (exit code 2).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("can't read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("parameter '{0}' doesn't exist in the parameter file")]
    MissingParameter(String),

    #[error("invalid parameter '{key}': {reason}")]
    InvalidParameter { key: String, reason: String },

    #[error("can't stat file {0}")]
    MissingFile(PathBuf),

    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// A parsed parameter file.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    dir: PathBuf,
    parameters: Vec<(String, String)>,
}

impl ConfigFile {
    /// Reads and parses the parameter file at `path`.
    pub fn parse(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut parameters = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                if !key.is_empty() {
                    parameters.push((key.to_owned(), value.trim().to_owned()));
                }
            }
        }

        Ok(Self {
            dir: path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf(),
            parameters,
        })
    }

    /// Directory holding the config file; relative paths in parameters are
    /// resolved against it.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn require(&self, key: &str) -> Result<&str, ConfigError> {
        self.get(key)
            .ok_or_else(|| ConfigError::MissingParameter(key.to_owned()))
    }

    /// Resolves a file path parameter: existing paths are taken as given,
    /// otherwise the path is tried relative to the config directory. The
    /// file must exist either way.
    pub fn resolve_path(&self, value: &str) -> Result<PathBuf, ConfigError> {
        let direct = PathBuf::from(value);
        if direct.exists() {
            return Ok(direct);
        }
        let relative = self.dir.join(value);
        if relative.exists() {
            return Ok(relative);
        }
        Err(ConfigError::MissingFile(direct))
    }
}
