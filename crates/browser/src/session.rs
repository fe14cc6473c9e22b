//! Browser Session - the operations one conversion needs
//!
//! A session owns two connections: the browser-level endpoint and the page
//! target created for it at construction. Everything here is a sequence of
//! protocol round-trips over those two channels.
//!
//! Design decisions:
//! 1. Navigation consumes a private event queue and drives a pure state machine
//! 2. The command that starts a navigation runs concurrently with the event pump,
//!    because Chromium holds `Page.navigate` until paused requests are answered
//! 3. Domain teardown always runs and only undoes what setup enabled

use base64::Engine;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::cdp::events::PausedRequest;
use crate::cdp::protocol::{CreateTargetResult, TargetId};
use crate::cdp::{CdpConnection, CdpError, CdpEvent, CdpMessage, ConnectionEvent, EventReceiver, PageEvent};
use crate::error::{BrowserError, Result};
use crate::filter::{FilterDecision, RequestFilter};
use crate::navigation::{NavigationOptions, NavigationTracker, PageLoadingState, PageSource};
use crate::settings::{PageSettings, ScreenshotOptions};

/// How long the event pump waits for a frame before re-checking timers.
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(10);

const WINDOW_STATUS_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Budget for teardown requests; independent of the caller's token.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Bytes requested per `IO.read`
const IO_READ_CHUNK: usize = 1024 * 1024;

/// Domains switched on during navigation setup
#[derive(Debug, Default)]
struct EnabledDomains {
    network: bool,
    fetch: bool,
    page: bool,
    lifecycle: bool,
}

/// The parts of a `Page.navigate` answer the tracker cares about
#[derive(Debug, Default)]
struct NavigationReply {
    frame_id: Option<String>,
    loader_id: Option<String>,
    error_text: Option<String>,
}

impl NavigationReply {
    fn from_response(response: &Value) -> Self {
        let field = |name: &str| response.get(name).and_then(Value::as_str).map(str::to_string);
        Self {
            frame_id: field("frameId"),
            loader_id: field("loaderId"),
            error_text: field("errorText"),
        }
    }
}

pub struct BrowserSession {
    id: Uuid,
    target_id: TargetId,
    browser: Arc<CdpConnection>,
    page: Arc<CdpConnection>,
}

impl BrowserSession {
    /// Open the browser endpoint, create an `about:blank` target and open its page endpoint.
    ///
    /// `timeout` bounds each websocket open and becomes the default budget
    /// of both connections.
    pub async fn connect(browser_url: &str, timeout: Duration) -> Result<Self> {
        let browser = CdpConnection::connect(browser_url, timeout).await?;

        match open_page_target(&browser, browser_url, timeout).await {
            Ok((target_id, page)) => {
                let id = Uuid::now_v7();
                tracing::info!("[BrowserSession {}] Attached to target {}", id, target_id);
                Ok(Self {
                    id,
                    target_id,
                    browser,
                    page,
                })
            }
            Err(e) => {
                browser.close().await;
                Err(e)
            }
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    /// Browser-level endpoint this session was opened on
    pub fn browser_url(&self) -> &str {
        self.browser.url()
    }

    pub fn page_url(&self) -> &str {
        self.page.url()
    }

    /// Both connections are still open
    pub fn is_alive(&self) -> bool {
        !self.browser.is_closed() && !self.page.is_closed()
    }

    /// Load `source` and wait until the page is loaded enough to convert.
    ///
    /// Returns the terminal state that ended the wait. A fatal navigation
    /// error is returned as [`BrowserError::Navigation`], and only after the
    /// domains enabled for this navigation have been disabled again.
    pub async fn navigate(
        &self,
        source: &PageSource,
        options: &NavigationOptions,
        cancel: &CancellationToken,
    ) -> Result<PageLoadingState> {
        let filter = RequestFilter::new(&options.url_blacklist, &options.safe_urls, source.uri());
        let mut enabled = EnabledDomains::default();

        let outcome = self
            .run_navigation(source, options, &filter, &mut enabled, cancel)
            .await;

        self.disable_domains(&enabled).await;

        let mut tracker = outcome?;
        if let Some(error) = tracker.take_navigation_error() {
            return Err(BrowserError::Navigation(error));
        }
        tracing::debug!("[BrowserSession {}] Navigation finished: {:?}", self.id, tracker.state());
        Ok(tracker.state())
    }

    async fn run_navigation(
        &self,
        source: &PageSource,
        options: &NavigationOptions,
        filter: &RequestFilter,
        enabled: &mut EnabledDomains,
        cancel: &CancellationToken,
    ) -> Result<NavigationTracker> {
        let page = &self.page;

        if options.log_network_traffic || !options.extra_headers.is_empty() {
            page.send_request("Network.enable", json!({}), cancel).await?;
            enabled.network = true;
        }
        if !options.extra_headers.is_empty() {
            page.send_request(
                "Network.setExtraHTTPHeaders",
                json!({ "headers": options.extra_headers }),
                cancel,
            )
            .await?;
        }
        page.send_request(
            "Network.setCacheDisabled",
            json!({ "cacheDisabled": !options.use_cache }),
            cancel,
        )
        .await?;

        if filter.is_active() {
            page.send_request(
                "Fetch.enable",
                json!({ "patterns": [{ "urlPattern": "*" }] }),
                cancel,
            )
            .await?;
            enabled.fetch = true;
        }

        let blank = if matches!(source, PageSource::Html(_)) {
            // Fresh load cycle: lifecycle events are not refired for
            // setDocumentContent on a stale one
            let response = page
                .send_request("Page.navigate", json!({ "url": "about:blank" }), cancel)
                .await?;
            NavigationReply::from_response(&response)
        } else {
            NavigationReply::default()
        };

        let mut events = page.subscribe();

        page.send_request("Page.enable", json!({}), cancel).await?;
        enabled.page = true;
        page.send_request(
            "Page.setLifecycleEventsEnabled",
            json!({ "enabled": true }),
            cancel,
        )
        .await?;
        enabled.lifecycle = true;

        match source {
            PageSource::Uri(url) => {
                tracing::info!("[BrowserSession {}] Navigating to {}", self.id, url);
                let mut tracker =
                    NavigationTracker::new(options.wait_for_network_idle, options.media_load_timeout);
                let drive = self.start_navigation(url, cancel);
                self.pump_events(drive, &mut tracker, &mut events, filter, options, cancel)
                    .await?;
                Ok(tracker)
            }
            PageSource::Html(html) => {
                tracing::info!(
                    "[BrowserSession {}] Setting document content ({} bytes)",
                    self.id,
                    html.len()
                );
                let mut tracker = NavigationTracker::seeded_for_document_content(
                    options.wait_for_network_idle,
                    options.media_load_timeout,
                );
                // about:blank replays its own networkIdle once lifecycle events are on
                if let Some(loader_id) = blank.loader_id {
                    tracker.ignore_loader(loader_id);
                }
                if let Some(frame_id) = blank.frame_id {
                    tracker.set_main_frame(frame_id);
                }
                let drive = self.set_document_content(html, cancel);
                self.pump_events(drive, &mut tracker, &mut events, filter, options, cancel)
                    .await?;
                Ok(tracker)
            }
        }
    }

    async fn start_navigation(&self, url: &Url, cancel: &CancellationToken) -> Result<NavigationReply> {
        let response = self
            .page
            .send_request("Page.navigate", json!({ "url": url.as_str() }), cancel)
            .await?;
        Ok(NavigationReply::from_response(&response))
    }

    async fn set_document_content(&self, html: &str, cancel: &CancellationToken) -> Result<NavigationReply> {
        let tree = self
            .page
            .send_request("Page.getFrameTree", json!({}), cancel)
            .await?;
        let frame_id = tree["frameTree"]["frame"]["id"]
            .as_str()
            .ok_or_else(|| CdpError::InvalidResponse {
                method: "Page.getFrameTree".to_string(),
                reason: "missing frameTree.frame.id".to_string(),
            })?;

        self.page
            .send_request(
                "Page.setDocumentContent",
                json!({ "frameId": frame_id, "html": html }),
                cancel,
            )
            .await?;
        Ok(NavigationReply {
            frame_id: Some(frame_id.to_string()),
            ..NavigationReply::default()
        })
    }

    /// Feed events to `tracker` until it is terminal and `drive` has resolved.
    async fn pump_events<F>(
        &self,
        drive: F,
        tracker: &mut NavigationTracker,
        events: &mut EventReceiver,
        filter: &RequestFilter,
        options: &NavigationOptions,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        F: Future<Output = Result<NavigationReply>>,
    {
        tokio::pin!(drive);
        let mut driving = true;
        let mut events_open = true;

        loop {
            if cancel.is_cancelled() {
                return Err(CdpError::Cancelled.into());
            }
            if tracker.check_media_timeout(std::time::Instant::now()) {
                tracing::info!("[BrowserSession {}] Media load timeout, stopping page", self.id);
                self.stop_loading().await;
            }
            if tracker.is_finished() && !driving {
                return Ok(());
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled() => return Err(CdpError::Cancelled.into()),

                result = &mut drive, if driving => {
                    driving = false;
                    match result {
                        Ok(reply) => {
                            if let Some(frame_id) = reply.frame_id {
                                tracker.set_main_frame(frame_id);
                            }
                            tracker.on_navigation_response(reply.error_text.as_deref());
                        }
                        Err(BrowserError::Cdp(CdpError::Closed)) => tracker.on_connection_closed(),
                        Err(e) => return Err(e),
                    }
                }

                event = events.recv(), if events_open => match event {
                    Some(ConnectionEvent::Message(CdpMessage::Event(event))) => {
                        self.handle_event(&event, tracker, filter, options).await;
                    }
                    Some(ConnectionEvent::Message(CdpMessage::Response(_))) => {}
                    Some(ConnectionEvent::Error(e)) => {
                        tracing::debug!("[BrowserSession {}] Connection error during navigation: {}", self.id, e);
                    }
                    Some(ConnectionEvent::Closed) | None => {
                        events_open = false;
                        tracker.on_connection_closed();
                    }
                },

                _ = tokio::time::sleep(EVENT_POLL_INTERVAL) => {}
            }
        }
    }

    async fn handle_event(
        &self,
        event: &CdpEvent,
        tracker: &mut NavigationTracker,
        filter: &RequestFilter,
        options: &NavigationOptions,
    ) {
        let event = match PageEvent::decode(event) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("[BrowserSession {}] Ignoring {}: {}", self.id, event.method, e);
                return;
            }
        };

        match &event {
            PageEvent::RequestPaused(paused) => {
                self.answer_paused_request(paused, filter, options).await;
            }
            PageEvent::Network { method, params } => {
                if options.log_network_traffic {
                    log_network_event(method, params);
                }
            }
            _ => tracker.observe(&event, std::time::Instant::now()),
        }
    }

    /// Continue or fail one intercepted request. Answers are not awaited.
    async fn answer_paused_request(
        &self,
        paused: &PausedRequest,
        filter: &RequestFilter,
        options: &NavigationOptions,
    ) {
        let url = &paused.request.url;
        let sent = match filter.decide(url) {
            FilterDecision::Allow => {
                let mut params = json!({ "requestId": paused.request_id });
                if !options.extra_headers.is_empty() {
                    params["headers"] = merged_headers(paused, options);
                }
                self.page.send_and_forget("Fetch.continueRequest", params).await
            }
            FilterDecision::Block => {
                tracing::debug!("[BrowserSession {}] Blocked {}", self.id, url);
                self.page
                    .send_and_forget(
                        "Fetch.failRequest",
                        json!({
                            "requestId": paused.request_id,
                            "errorReason": "BlockedByClient",
                        }),
                    )
                    .await
            }
        };

        if let Err(e) = sent {
            tracing::warn!("[BrowserSession {}] Could not answer paused request {}: {}", self.id, url, e);
        }
    }

    /// Best effort; the navigation outcome is already decided.
    async fn stop_loading(&self) {
        if let Err(e) = self
            .page
            .send_with_timeout(
                "Runtime.evaluate",
                json!({ "expression": "window.stop();" }),
                CLEANUP_TIMEOUT,
            )
            .await
        {
            tracing::warn!("[BrowserSession {}] window.stop() failed: {}", self.id, e);
        }
    }

    async fn disable_domains(&self, enabled: &EnabledDomains) {
        let mut steps: Vec<(&str, Value)> = Vec::new();
        if enabled.lifecycle {
            steps.push(("Page.setLifecycleEventsEnabled", json!({ "enabled": false })));
        }
        if enabled.page {
            steps.push(("Page.disable", json!({})));
        }
        if enabled.fetch {
            steps.push(("Fetch.disable", json!({})));
        }
        if enabled.network {
            steps.push(("Network.disable", json!({})));
        }

        for (method, params) in steps {
            if let Err(e) = self.page.send_with_timeout(method, params, CLEANUP_TIMEOUT).await {
                tracing::debug!("[BrowserSession {}] {} during cleanup failed: {}", self.id, method, e);
            }
        }
    }

    /// Poll `window.status` until it equals `status` or `timeout` elapses.
    ///
    /// The comparison is exact and case-sensitive. Returns whether it
    /// matched; running out of time is not an error.
    pub async fn wait_for_window_status(
        &self,
        status: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let now = tokio::time::Instant::now();
        // Far enough to never fire
        let deadline = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365));

        loop {
            let evaluate = self.page.send_request(
                "Runtime.evaluate",
                json!({ "expression": "window.status", "returnByValue": true }),
                cancel,
            );
            let matched = tokio::select! {
                result = evaluate => result?["result"]["value"].as_str() == Some(status),
                _ = tokio::time::sleep_until(deadline) => false,
            };

            if matched {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::debug!("[BrowserSession {}] window.status never became {:?}", self.id, status);
                return Ok(false);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(CdpError::Cancelled.into()),
                _ = tokio::time::sleep(WINDOW_STATUS_POLL_INTERVAL) => {}
            }
        }
    }

    /// Evaluate `script` in the page and return its value (awaiting promises).
    pub async fn run_javascript(&self, script: &str, cancel: &CancellationToken) -> Result<Value> {
        let result = self
            .page
            .send_request(
                "Runtime.evaluate",
                json!({
                    "expression": script,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
                cancel,
            )
            .await?;

        if let Some(details) = result.get("exceptionDetails") {
            let description = details["exception"]["description"]
                .as_str()
                .or_else(|| details["text"].as_str())
                .unwrap_or("unknown exception");
            return Err(BrowserError::Conversion(format!("script threw: {description}")));
        }

        match result.get("result") {
            Some(remote) => Ok(remote.get("value").cloned().unwrap_or(Value::Null)),
            None => Err(BrowserError::Conversion("script evaluation returned nothing".to_string())),
        }
    }

    /// MHTML snapshot of the current page
    pub async fn capture_snapshot(&self, cancel: &CancellationToken) -> Result<String> {
        let result = self
            .page
            .send_request("Page.captureSnapshot", json!({ "format": "mhtml" }), cancel)
            .await
            .map_err(remote_to_conversion)?;

        match result.get("data").and_then(Value::as_str) {
            Some(data) if !data.is_empty() => Ok(data.to_string()),
            _ => Err(BrowserError::Conversion("snapshot returned no data".to_string())),
        }
    }

    /// Print the page to `output` through a protocol stream. Returns bytes written.
    pub async fn print_to_pdf<W>(
        &self,
        settings: &PageSettings,
        output: &mut W,
        cancel: &CancellationToken,
    ) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let result = self
            .page
            .send_request("Page.printToPDF", settings.to_print_params(), cancel)
            .await
            .map_err(remote_to_conversion)?;

        let handle = result
            .get("stream")
            .and_then(Value::as_str)
            .filter(|handle| !handle.is_empty())
            .ok_or_else(|| BrowserError::Conversion("printToPDF returned no stream handle".to_string()))?;

        let written = self.read_stream(handle, output, cancel).await;

        if let Err(e) = self
            .page
            .send_with_timeout("IO.close", json!({ "handle": handle }), CLEANUP_TIMEOUT)
            .await
        {
            tracing::warn!("[BrowserSession {}] IO.close({}) failed: {}", self.id, handle, e);
        }

        let written = written?;
        tracing::info!("[BrowserSession {}] Printed {} bytes", self.id, written);
        Ok(written)
    }

    async fn read_stream<W>(&self, handle: &str, output: &mut W, cancel: &CancellationToken) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut written = 0u64;

        loop {
            let chunk = self
                .page
                .send_request(
                    "IO.read",
                    json!({ "handle": handle, "size": IO_READ_CHUNK }),
                    cancel,
                )
                .await
                .map_err(remote_to_conversion)?;

            let data = chunk["data"].as_str().unwrap_or_default();
            let bytes = if chunk["base64Encoded"].as_bool().unwrap_or(false) {
                decode_base64(data)?
            } else {
                data.as_bytes().to_vec()
            };
            output.write_all(&bytes).await?;
            written += bytes.len() as u64;

            if chunk["eof"].as_bool().unwrap_or(false) {
                break;
            }
        }

        output.flush().await?;
        Ok(written)
    }

    /// PNG screenshot written to `output`. Returns bytes written.
    pub async fn capture_screenshot<W>(
        &self,
        options: &ScreenshotOptions,
        output: &mut W,
        cancel: &CancellationToken,
    ) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let result = self
            .page
            .send_request("Page.captureScreenshot", options.to_capture_params(), cancel)
            .await
            .map_err(remote_to_conversion)?;

        let data = result
            .get("data")
            .and_then(Value::as_str)
            .filter(|data| !data.is_empty())
            .ok_or_else(|| BrowserError::Conversion("screenshot returned no data".to_string()))?;

        let bytes = decode_base64(data)?;
        output.write_all(&bytes).await?;
        output.flush().await?;
        Ok(bytes.len() as u64)
    }

    /// Ask the browser to exit, then drop both connections.
    pub async fn close(&self) {
        if !self.browser.is_closed() {
            tracing::info!("[BrowserSession {}] Closing browser", self.id);
            if let Err(e) = self
                .browser
                .send_with_timeout("Browser.close", json!({}), CLEANUP_TIMEOUT)
                .await
            {
                // The browser often drops the socket before answering
                tracing::debug!("[BrowserSession {}] Browser.close: {}", self.id, e);
            }
        }
        self.dispose().await;
    }

    /// Close both connections without touching the browser. Idempotent.
    pub async fn dispose(&self) {
        self.page.close().await;
        self.browser.close().await;
    }
}

async fn open_page_target(
    browser: &CdpConnection,
    browser_url: &str,
    timeout: Duration,
) -> Result<(TargetId, Arc<CdpConnection>)> {
    let result = browser
        .send("Target.createTarget", json!({ "url": "about:blank" }))
        .await?;
    let created: CreateTargetResult =
        serde_json::from_value(result).map_err(|e| CdpError::InvalidResponse {
            method: "Target.createTarget".to_string(),
            reason: e.to_string(),
        })?;

    let page_url = page_endpoint(browser_url, &created.target_id)?;
    let page = CdpConnection::connect(&page_url, timeout).await?;
    Ok((created.target_id, page))
}

/// `ws://host:port/devtools/page/<targetId>` on the browser endpoint's host
fn page_endpoint(browser_url: &str, target_id: &str) -> Result<String> {
    let mut url = Url::parse(browser_url)
        .map_err(|e| BrowserError::startup(format!("invalid DevTools endpoint {browser_url}: {e}")))?;
    url.set_path(&format!("/devtools/page/{target_id}"));
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.to_string())
}

/// Paused request headers with the configured extra headers on top
fn merged_headers(paused: &PausedRequest, options: &NavigationOptions) -> Value {
    let mut headers: Vec<(String, String)> = paused
        .request
        .headers
        .iter()
        .filter(|(name, _)| {
            !options
                .extra_headers
                .keys()
                .any(|extra| extra.eq_ignore_ascii_case(name))
        })
        .map(|(name, value)| {
            let value = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
            (name.clone(), value)
        })
        .collect();
    headers.extend(
        options
            .extra_headers
            .iter()
            .map(|(name, value)| (name.clone(), value.clone())),
    );

    Value::Array(
        headers
            .into_iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect(),
    )
}

fn log_network_event(method: &str, params: &Value) {
    match method {
        "Network.requestWillBeSent" => tracing::debug!(
            "[Network] {} {}",
            params["request"]["method"].as_str().unwrap_or("GET"),
            params["request"]["url"].as_str().unwrap_or_default()
        ),
        "Network.responseReceived" => tracing::debug!(
            "[Network] {} {}",
            params["response"]["status"],
            params["response"]["url"].as_str().unwrap_or_default()
        ),
        "Network.loadingFailed" => tracing::debug!(
            "[Network] failed {}: {}",
            params["requestId"].as_str().unwrap_or_default(),
            params["errorText"].as_str().unwrap_or_default()
        ),
        _ => tracing::trace!("[Network] {}", method),
    }
}

fn remote_to_conversion(error: CdpError) -> BrowserError {
    match error {
        CdpError::Remote { code, message } => {
            BrowserError::Conversion(format!("remote error {code}: {message}"))
        }
        other => other.into(),
    }
}

fn decode_base64(data: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| BrowserError::Conversion(format!("invalid base64 payload: {e}")))
}
