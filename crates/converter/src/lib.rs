//! HTML to PDF/PNG conversion
//!
//! [`Converter`] is the entry point. It validates and pre-processes the
//! input, keeps a headless browser running, and drives one page per
//! conversion through navigation, optional window-status wait, script and
//! snapshot, and finally printing or a screenshot.
//!
//! ```no_run
//! use converter::{ConversionRequest, Converter, ConverterConfig, Source};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> converter::Result<()> {
//! let mut converter = Converter::new(ConverterConfig::default());
//! let request = ConversionRequest::pdf(Source::from_uri("https://example.com")?);
//! converter
//!     .convert_to_file(&request, "example.pdf", &CancellationToken::new())
//!     .await?;
//! converter.dispose().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod converter;
pub mod error;
pub mod locator;
pub mod preprocess;
pub mod request;

pub use config::{ConverterConfig, WindowSize};
pub use converter::Converter;
pub use error::{ConvertError, Result};
pub use locator::{BrowserLocator, FixedLocator, SystemLocator};
pub use preprocess::{NoPreProcessing, PreProcessed, PreProcessor, PreWrapProcessor};
pub use request::{ConversionReport, ConversionRequest, OutputKind, Source, WindowStatusWait};

pub use browser::{PageLoadingState, PageSettings, PaperFormat, ScreenshotOptions};
