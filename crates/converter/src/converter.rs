//! Conversion orchestrator
//!
//! A [`Converter`] owns one browser process and one session on it, and runs
//! conversions through them one at a time. The process is launched on the
//! first conversion and relaunched if it has died since; the session is
//! rebuilt whenever the process endpoint changes or a connection dropped.

use browser::{
    BrowserProcess, BrowserSession, CdpError, CountdownTimer, DeadlineToken, NavigationOptions,
    PageLoadingState, PageSource,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ConverterConfig;
use crate::error::{ConvertError, Result};
use crate::locator::{BrowserLocator, SystemLocator};
use crate::preprocess::{NoPreProcessing, PreProcessor};
use crate::request::{ConversionReport, ConversionRequest, OutputKind};

pub struct Converter {
    id: Uuid,
    config: ConverterConfig,
    locator: Box<dyn BrowserLocator>,
    pre_processor: Box<dyn PreProcessor>,
    process: Option<BrowserProcess>,
    session: Option<BrowserSession>,
    disposed: bool,
}

impl Converter {
    pub fn new(config: ConverterConfig) -> Self {
        Self {
            id: Uuid::now_v7(),
            config,
            locator: Box::new(SystemLocator),
            pre_processor: Box::new(NoPreProcessing),
            process: None,
            session: None,
            disposed: false,
        }
    }

    pub fn with_locator(mut self, locator: impl BrowserLocator + 'static) -> Self {
        self.locator = Box::new(locator);
        self
    }

    pub fn with_pre_processor(mut self, pre_processor: impl PreProcessor + 'static) -> Self {
        self.pre_processor = Box::new(pre_processor);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &ConverterConfig {
        &self.config
    }

    /// Browser pid, once a conversion has launched it
    pub fn browser_pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(BrowserProcess::pid)
    }

    /// Convert `request` and write the PDF or PNG bytes to `output`.
    ///
    /// Temporary files made by the pre-processor are removed before this
    /// returns, on success and on failure.
    pub async fn convert<W>(
        &mut self,
        request: &ConversionRequest,
        output: &mut W,
        cancel: &CancellationToken,
    ) -> Result<ConversionReport>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        if self.disposed {
            return Err(ConvertError::Disposed);
        }
        request.source.validate()?;

        let work_dir = self.config.temp_dir();
        let prepared = self.pre_processor.process(&request.source, &work_dir).await?;
        if prepared.source != request.source {
            tracing::debug!(
                "[Converter {}] {} rewrote the input",
                self.id,
                self.pre_processor.name()
            );
        }

        let result = match prepared.source.to_page_source() {
            Ok(page_source) => self.convert_page(request, &page_source, output, cancel).await,
            Err(e) => Err(e),
        };

        remove_temp_files(&prepared.temp_files).await;

        match &result {
            Ok(report) => tracing::info!(
                "[Converter {}] Converted ({:?}, {} bytes)",
                self.id,
                report.state,
                report.bytes_written
            ),
            Err(e) => tracing::warn!("[Converter {}] Conversion failed: {}", self.id, e),
        }
        result
    }

    /// [`Converter::convert`] into a file; the file is removed again if the conversion fails.
    pub async fn convert_to_file(
        &mut self,
        request: &ConversionRequest,
        path: impl AsRef<Path>,
        cancel: &CancellationToken,
    ) -> Result<ConversionReport> {
        let path = path.as_ref();
        let mut file = tokio::fs::File::create(path).await?;
        let result = self.convert(request, &mut file, cancel).await;
        drop(file);

        if result.is_err() {
            if let Err(e) = tokio::fs::remove_file(path).await {
                tracing::debug!("[Converter {}] Could not remove {}: {}", self.id, path.display(), e);
            }
        }
        result
    }

    async fn convert_page<W>(
        &mut self,
        request: &ConversionRequest,
        page_source: &PageSource,
        output: &mut W,
        cancel: &CancellationToken,
    ) -> Result<ConversionReport>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let navigation = self.config.navigation_options(request.media_load_timeout);
        let mut countdown = CountdownTimer::new(request.conversion_timeout.unwrap_or(Duration::MAX));

        let result = match self.ensure_session(cancel).await {
            Ok(session) => {
                if request.conversion_timeout.is_some() {
                    countdown.start();
                }
                run_steps(session, request, page_source, &navigation, &mut countdown, output, cancel)
                    .await
            }
            Err(e) => Err(e),
        };

        result.map_err(|e| classify(e, &countdown, cancel))
    }

    async fn ensure_session(&mut self, cancel: &CancellationToken) -> Result<&BrowserSession> {
        let endpoint = self.ensure_process(cancel).await?;

        if let Some(existing) = self.session.take() {
            if existing.is_alive() && existing.browser_url() == endpoint {
                return Ok(&*self.session.insert(existing));
            }
            tracing::info!("[Converter {}] Session {} is stale, reconnecting", self.id, existing.id());
            existing.dispose().await;
        }

        let session = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ConvertError::Cancelled),
            session = BrowserSession::connect(&endpoint, self.config.websocket_timeout()) => session?,
        };
        Ok(&*self.session.insert(session))
    }

    async fn ensure_process(&mut self, cancel: &CancellationToken) -> Result<String> {
        let process = match self.process.take() {
            Some(process) => process,
            None => {
                let executable = match &self.config.executable {
                    Some(executable) => executable.clone(),
                    None => self.locator.locate().ok_or(ConvertError::BrowserNotFound)?,
                };
                tracing::debug!("[Converter {}] Using browser {}", self.id, executable.display());
                BrowserProcess::new(self.config.launch_options(executable))
            }
        };

        let process = self.process.insert(process);
        Ok(process.ensure_running(cancel).await?)
    }

    /// Close the session and stop the browser. Idempotent; later conversions fail.
    pub async fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        tracing::info!("[Converter {}] Disposing", self.id);

        match self.session.take() {
            Some(session) => session.close().await,
            None => {
                if let Some(process) = &self.process {
                    process.request_close(self.config.websocket_timeout()).await;
                }
            }
        }
        if let Some(mut process) = self.process.take() {
            process.shutdown().await;
        }
    }
}

async fn run_steps<W>(
    session: &BrowserSession,
    request: &ConversionRequest,
    page_source: &PageSource,
    navigation: &NavigationOptions,
    countdown: &mut CountdownTimer,
    output: &mut W,
    cancel: &CancellationToken,
) -> Result<ConversionReport>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let state = {
        let step = step_token(countdown, cancel)?;
        session.navigate(page_source, navigation, step.token()).await?
    };
    if state == PageLoadingState::Closed {
        return Err(CdpError::Closed.into());
    }

    let window_status_matched = match &request.wait_for_window_status {
        Some(wait) => {
            // The wait has its own limit, but never outlives the budget
            let limit = if countdown.is_running() {
                wait.timeout.min(countdown.remaining())
            } else {
                wait.timeout
            };
            // Linked before the pause so the budget's deadline still cancels the wait
            let step = step_token(countdown, cancel)?;
            countdown.pause();
            let matched = session
                .wait_for_window_status(&wait.status, limit, step.token())
                .await;
            countdown.resume();
            let matched = matched?;
            if countdown.is_expired() {
                return Err(ConvertError::TimedOut(countdown.budget()));
            }
            Some(matched)
        }
        None => None,
    };

    let step = step_token(countdown, cancel)?;

    let script_result = match &request.javascript {
        Some(script) => Some(session.run_javascript(script, step.token()).await?),
        None => None,
    };

    let snapshot = if request.capture_snapshot {
        Some(session.capture_snapshot(step.token()).await?)
    } else {
        None
    };

    let bytes_written = match &request.output {
        OutputKind::Pdf(settings) => session.print_to_pdf(settings, output, step.token()).await?,
        OutputKind::Png(options) => session.capture_screenshot(options, output, step.token()).await?,
    };

    Ok(ConversionReport {
        state,
        media_load_timed_out: state == PageLoadingState::MediaLoadTimeout,
        window_status_matched,
        script_result,
        snapshot,
        bytes_written,
    })
}

/// Token for the next blocking step, cancelled by the caller or the countdown
fn step_token(countdown: &CountdownTimer, cancel: &CancellationToken) -> Result<DeadlineToken> {
    if cancel.is_cancelled() {
        return Err(ConvertError::Cancelled);
    }
    if countdown.is_expired() {
        return Err(ConvertError::TimedOut(countdown.budget()));
    }
    Ok(countdown.linked_token(cancel))
}

/// Name interruptions after what caused them.
fn classify(error: ConvertError, countdown: &CountdownTimer, cancel: &CancellationToken) -> ConvertError {
    if !error.is_interruption() {
        return error;
    }
    if cancel.is_cancelled() {
        ConvertError::Cancelled
    } else if countdown.is_expired() {
        ConvertError::TimedOut(countdown.budget())
    } else {
        error
    }
}

async fn remove_temp_files(files: &[PathBuf]) {
    for file in files {
        match tokio::fs::remove_file(file).await {
            Ok(()) => tracing::trace!("Removed {}", file.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Could not remove temporary file {}: {}", file.display(), e),
        }
    }
}
