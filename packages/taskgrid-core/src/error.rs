use thiserror::Error;

/// Errors surfaced by the scheduling engine.
///
/// Transient per-task failures (non-zero exit, timeout) are not represented
/// here — they are fed straight into the retry path and never bubble up as
/// an `Err`. Only fatal, start-up-time, or control-plane conditions are.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("GPU probe unavailable: {0}")]
    ProbeUnavailable(String),

    #[error("malformed command file: {0}")]
    MalformedCommandFile(#[from] ParseError),

    #[error("scheduler identity {0:?} is already running")]
    RegistryBusy(Identity),

    #[error("no scheduler found for identity {0:?}")]
    NotFound(Identity),

    #[error("no scheduler found running as pid {0}")]
    NoSuchPid(u32),

    #[error("invalid scheduler configuration: {0}")]
    ConfigInvalid(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the command-file parser (component I).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("block {block} is malformed: {reason}")]
    MalformedBlock { block: usize, reason: String },

    #[error("block {block} is missing required field {field}")]
    MissingRequiredField { block: usize, field: &'static str },

    #[error("block {block}, line {line}: expected an integer, found {found:?}")]
    NonIntegerWhereExpected {
        block: usize,
        line: usize,
        found: String,
    },
}

/// (mode, config_index) — the key the Scheduler Registry indexes live
/// instances by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Identity {
    pub mode: crate::model::Mode,
    pub config_index: u32,
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}#{}", self.mode, self.config_index)
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
