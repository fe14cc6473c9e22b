//! Error types for conversions

use browser::{BrowserError, CdpError};
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConvertError>;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error(transparent)]
    Browser(#[from] BrowserError),

    /// The conversion budget ran out during a blocking step
    #[error("Conversion timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Conversion cancelled")]
    Cancelled,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("No Chromium executable found; set CHROME_PATH or configure `executable`")]
    BrowserNotFound,

    #[error("Pre-processing with {processor} failed: {reason}")]
    PreProcessing { processor: String, reason: String },

    #[error("Converter has been disposed")]
    Disposed,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConvertError {
    /// Cancellation or a per-request deadline, as opposed to a real failure
    pub(crate) fn is_interruption(&self) -> bool {
        match self {
            ConvertError::Cancelled | ConvertError::TimedOut(_) => true,
            ConvertError::Browser(BrowserError::Cdp(CdpError::Cancelled | CdpError::Timeout(_))) => true,
            _ => false,
        }
    }
}

impl From<CdpError> for ConvertError {
    fn from(error: CdpError) -> Self {
        ConvertError::Browser(error.into())
    }
}
