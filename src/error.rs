//! Error types surfaced by driver operations.

use crate::backends::iptables::FilterError;
use crate::network::options::OptionsError;
use crate::proxy::ProcessError;
use thiserror::Error;

/// Errors returned to the orchestrator from driver operations.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("invalid network options: {0}")]
    Validation(#[from] OptionsError),

    #[error("packet filter error: {0}")]
    RuleProgramming(#[from] FilterError),

    #[error("helper process error: {0}")]
    Process(#[from] ProcessError),

    #[error("bridge error: {0:#}")]
    Bridge(anyhow::Error),

    #[error("{0} is not supported")]
    NotSupported(&'static str),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;
