use std::path::PathBuf;

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error(
        "network is not of correct type: current --> {expected} ; checkpoint --> {found} ({path})"
    )]
    Incompatible {
        expected: String,
        found: String,
        path: PathBuf,
    },

    #[error("no matching checkpoint file found in {location}")]
    NotFound { location: PathBuf },

    #[error("failed to write checkpoint {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to read checkpoint {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to decode checkpoint {path}: {source}")]
    Decode {
        path: PathBuf,
        source: bincode::Error,
    },

    #[error("checkpoint {path} has format version {found}, this build reads {supported}")]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        supported: u32,
    },

    #[error("no workspace directory configured")]
    NoWorkspace,

    #[error("invalid model type tag {0:?}")]
    InvalidModelTag(String),

    #[error("invalid checkpoint name {0:?}")]
    InvalidName(String),

    #[error("failed to capture {field} for checkpoint: {source}")]
    StateCapture {
        field: &'static str,
        source: anyhow::Error,
    },

    #[error("failed to restore {field} from checkpoint: {source}")]
    StateRestore {
        field: &'static str,
        source: anyhow::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur during training.
#[derive(Debug, thiserror::Error)]
pub enum TrainingError {
    #[error("training crashed at epoch {epoch}: {source:#}")]
    EpochFailed {
        epoch: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("failed to move model to {device}: {source:#}")]
    Device {
        device: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("training failed after {attempts} attempts, last failure: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<TrainingError>,
    },
}

impl TrainingError {
    /// Whether a fail-safe run may retry after this error by resuming from the
    /// last durable checkpoint.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TrainingError::EpochFailed { .. })
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("config validation error: {0}")]
    Validation(String),
}
