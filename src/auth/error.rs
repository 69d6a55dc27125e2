use thiserror::Error;

use crate::azcli::CliError;

/// Failure modes of a device login attempt.
#[derive(Debug, Error)]
pub enum LoginError {
    #[error("Azure CLI error: {0}")]
    Cli(#[from] CliError),
    #[error("login protocol error: {0}")]
    Protocol(String),
    #[error("login timed out")]
    Timeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
