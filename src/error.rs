#![forbid(unsafe_code)]

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DuebellError {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid config key '{0}'")]
    InvalidConfigKey(String),

    #[error("invalid config value for '{key}': {msg}")]
    InvalidConfigValue { key: String, msg: String },

    #[error("invalid settings key '{0}'")]
    InvalidSettingsKey(String),

    #[error("invalid due time '{0}'")]
    InvalidDueTime(String),

    #[error("failed to parse task file {path}: {msg}")]
    TaskFile { path: PathBuf, msg: String },

    #[error("io error at {path}: {source}")]
    IoPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
