//! Configuration loading and validation errors.

use std::path::PathBuf;

/// Result alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading, parsing, or validating a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path that was being read.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The file extension does not map to a supported format.
    #[error("unsupported config format for {path} (expected .yaml, .yml, or .toml)")]
    UnsupportedFormat {
        /// Offending path.
        path: PathBuf,
    },

    /// The file did not parse as its declared format.
    #[error("failed to parse config: {message}")]
    Parse {
        /// Parser diagnostic.
        message: String,
    },

    /// The parsed configuration violates a structural rule.
    #[error("invalid config at {location}: {message}")]
    Validation {
        /// Dotted path of the offending value, e.g. `routes[2].pattern`.
        location: String,
        /// What is wrong with it.
        message: String,
    },

    /// A `${VAR}` credential reference points at an unset environment variable.
    #[error("environment variable {name} referenced by credential {credential} is not set")]
    MissingEnvVar {
        /// Referenced variable name.
        name: String,
        /// Credential entry holding the reference.
        credential: String,
    },

    /// The file watcher could not be installed.
    #[error("failed to watch config file: {message}")]
    Watch {
        /// Watcher diagnostic.
        message: String,
    },
}

impl ConfigError {
    /// Convenience constructor for [`ConfigError::Validation`].
    #[must_use]
    pub fn validation(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            location: location.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`ConfigError::Parse`].
    #[must_use]
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }
}
