//! Error types for browser operations
//!
//! Transport failures stay [`CdpError`]; everything above the wire lands here.

use thiserror::Error;

use crate::cdp::CdpError;

pub type Result<T> = std::result::Result<T, BrowserError>;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error(transparent)]
    Cdp(#[from] CdpError),

    /// The process failed to launch, exited before exposing an endpoint,
    /// or endpoint discovery ran out of time.
    #[error("Browser failed to start: {reason}")]
    Startup {
        reason: String,
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    #[error("Navigation failed: {0}")]
    Navigation(String),

    /// A print, snapshot, screenshot or script call gave nothing usable
    #[error("Conversion failed: {0}")]
    Conversion(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BrowserError {
    pub fn startup(reason: impl Into<String>) -> Self {
        BrowserError::Startup {
            reason: reason.into(),
            exit_code: None,
            stderr_tail: String::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, BrowserError::Cdp(CdpError::Cancelled))
    }
}
