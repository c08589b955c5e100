//! The crate-wide error taxonomy. Each module defines the error type for its
//! own failure modes ([`crate::router::RouterError`], [`crate::batch::BatchError`],
//! [`crate::producer::ProducerError`]); this module adds the two types that
//! don't belong to any single component — configuration and coordinator
//! lifecycle errors — and a top-level enum the `gollum` binary can bubble
//! all the way up to `main`.

use thiserror::Error;

use crate::batch::BatchError;
use crate::producer::ProducerError;
use crate::router::RouterError;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVariable(String),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
    #[error("producer {0} has no known constructor registered")]
    UnknownProducerType(String),
}

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("configure phase failed: {0}")]
    Configure(String),
    /// A producer's own `Producer::configure` failed during `start_producers`
    /// — distinct from [`CoordinatorError::Configure`] (topology/options
    /// parsing): this is the plugin itself failing to come up, mapped by the
    /// binary to exit code 2 rather than the config-error exit code 1.
    #[error("producer {0} failed to start: {1}")]
    ProducerStartFailed(String, String),
    #[error("a producer task panicked or exited unexpectedly: {0}")]
    ProducerTaskFailed(String),
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error("shutdown did not complete within the configured timeout")]
    ShutdownTimedOut,
}

#[derive(Error, Debug)]
pub enum GollumError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error(transparent)]
    Producer(#[from] ProducerError),
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error(transparent)]
    Router(#[from] RouterError),
}
