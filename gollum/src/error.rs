use thiserror::Error;

use gollum_core::error::CoordinatorError;

#[derive(Error, Debug)]
pub enum GollumBinError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GollumBinError {
    /// Maps a startup/runtime failure to the process exit code an operator's
    /// supervisor can branch on: `1` for a bad config or topology, `2` when a
    /// plugin itself fails to come up, `3` when shutdown ran past its bound.
    pub fn exit_code(&self) -> i32 {
        match self {
            GollumBinError::Config(_) => 1,
            GollumBinError::Coordinator(CoordinatorError::Configure(_)) => 1,
            GollumBinError::Coordinator(CoordinatorError::ProducerStartFailed(_, _)) => 2,
            GollumBinError::Coordinator(CoordinatorError::ShutdownTimedOut) => 3,
            GollumBinError::Coordinator(_) => 2,
            GollumBinError::Io(_) => 1,
        }
    }
}
