use std::path::PathBuf;

use thiserror::Error;

use crate::domain::{RecordId, RecordState};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: id={0}")]
    NotFound(RecordId),

    #[error("invalid transition for record {id}: {from} -> {to}")]
    InvalidTransition {
        id: RecordId,
        from: RecordState,
        to: RecordState,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
