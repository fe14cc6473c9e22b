//! Conversion requests and reports

use browser::{PageLoadingState, PageSettings, PageSource, ScreenshotOptions};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::error::{ConvertError, Result};

/// File types the browser renders directly, or after pre-processing
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "htm", "html", "shtml", "xhtml", "xht", "mht", "mhtml", "svg", "xml", "txt", "log", "text",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    Uri(Url),
    File(PathBuf),
    Html(String),
}

impl Source {
    /// Absolute `file://` URLs become [`Source::File`].
    pub fn from_uri(uri: &str) -> Result<Self> {
        let url = Url::parse(uri).map_err(|e| ConvertError::InvalidInput(format!("{uri}: {e}")))?;
        if url.scheme() == "file" {
            let path = url
                .to_file_path()
                .map_err(|_| ConvertError::InvalidInput(format!("{uri} is not a local path")))?;
            return Ok(Source::File(path));
        }
        Ok(Source::Uri(url))
    }

    pub fn file_extension(&self) -> Option<String> {
        match self {
            Source::File(path) => path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(str::to_ascii_lowercase),
            _ => None,
        }
    }

    /// Check the input before any browser work happens
    pub fn validate(&self) -> Result<()> {
        match self {
            Source::Uri(url) => match url.scheme() {
                "http" | "https" | "data" | "about" => Ok(()),
                scheme => Err(ConvertError::InvalidInput(format!(
                    "unsupported URL scheme {scheme:?}"
                ))),
            },
            Source::File(path) => {
                let extension = self.file_extension().ok_or_else(|| {
                    ConvertError::InvalidInput(format!("{} has no file extension", path.display()))
                })?;
                if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
                    return Err(ConvertError::InvalidInput(format!(
                        "unsupported file type .{extension}"
                    )));
                }
                if !path.is_file() {
                    return Err(ConvertError::InvalidInput(format!(
                        "{} does not exist",
                        path.display()
                    )));
                }
                Ok(())
            }
            Source::Html(html) if html.trim().is_empty() => {
                Err(ConvertError::InvalidInput("HTML input is empty".to_string()))
            }
            Source::Html(_) => Ok(()),
        }
    }

    pub(crate) fn to_page_source(&self) -> Result<PageSource> {
        match self {
            Source::Uri(url) => Ok(PageSource::Uri(url.clone())),
            Source::File(path) => {
                let absolute = absolute_path(path)?;
                let url = Url::from_file_path(&absolute).map_err(|_| {
                    ConvertError::InvalidInput(format!("{} is not an absolute path", absolute.display()))
                })?;
                Ok(PageSource::Uri(url))
            }
            Source::Html(html) => Ok(PageSource::Html(html.clone())),
        }
    }
}

fn absolute_path(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutputKind {
    Pdf(PageSettings),
    Png(ScreenshotOptions),
}

/// Hold conversion until the page sets `window.status` to `status`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowStatusWait {
    pub status: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversionRequest {
    pub source: Source,
    pub output: OutputKind,
    pub wait_for_window_status: Option<WindowStatusWait>,
    /// Evaluated after loading, before output is produced
    pub javascript: Option<String>,
    pub capture_snapshot: bool,
    pub media_load_timeout: Option<Duration>,
    /// Budget for everything from navigation to the last output byte
    pub conversion_timeout: Option<Duration>,
}

impl ConversionRequest {
    pub fn pdf(source: Source) -> Self {
        Self::new(source, OutputKind::Pdf(PageSettings::default()))
    }

    pub fn png(source: Source) -> Self {
        Self::new(source, OutputKind::Png(ScreenshotOptions::default()))
    }

    fn new(source: Source, output: OutputKind) -> Self {
        Self {
            source,
            output,
            wait_for_window_status: None,
            javascript: None,
            capture_snapshot: false,
            media_load_timeout: None,
            conversion_timeout: None,
        }
    }

    pub fn with_window_status(mut self, status: impl Into<String>, timeout: Duration) -> Self {
        self.wait_for_window_status = Some(WindowStatusWait {
            status: status.into(),
            timeout,
        });
        self
    }

    pub fn with_javascript(mut self, script: impl Into<String>) -> Self {
        self.javascript = Some(script.into());
        self
    }

    pub fn with_snapshot(mut self) -> Self {
        self.capture_snapshot = true;
        self
    }

    pub fn with_media_load_timeout(mut self, timeout: Duration) -> Self {
        self.media_load_timeout = Some(timeout);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.conversion_timeout = Some(timeout);
        self
    }
}

/// What happened during one conversion
#[derive(Debug, Clone)]
pub struct ConversionReport {
    pub state: PageLoadingState,
    pub media_load_timed_out: bool,
    /// `None` when no window status wait was requested
    pub window_status_matched: Option<bool>,
    pub script_result: Option<Value>,
    /// MHTML, when requested
    pub snapshot: Option<String>,
    pub bytes_written: u64,
}
