//! Page loading state machine
//!
//! `Loading -> WaitForNetworkIdle -> Done`, with side exits to
//! `MediaLoadTimeout`, `BlockedByClient` and `Closed`. Every state other than
//! `Loading` and `WaitForNetworkIdle` is terminal: once reached, no input
//! changes it. The tracker is pure; [`crate::session::BrowserSession::navigate`]
//! feeds it events and performs the I/O.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use url::Url;

use crate::cdp::events::{LifecycleEvent, PageEvent};

/// Chromium reports sub-resources we blocked ourselves with this text.
pub const BLOCKED_BY_CLIENT: &str = "net::ERR_BLOCKED_BY_CLIENT";

/// What to load: a URI, or literal HTML set as the document content
#[derive(Debug, Clone, PartialEq)]
pub enum PageSource {
    Uri(Url),
    Html(String),
}

impl PageSource {
    pub fn uri(&self) -> Option<&Url> {
        match self {
            PageSource::Uri(url) => Some(url),
            PageSource::Html(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NavigationOptions {
    /// Wildcard patterns; matching sub-resources are failed with `BlockedByClient`
    pub url_blacklist: Vec<String>,
    /// Exact URLs that are always allowed, even when blacklisted
    pub safe_urls: Vec<String>,
    pub use_cache: bool,
    /// Budget for sub-resources once the DOM is parsed
    pub media_load_timeout: Option<Duration>,
    /// Finish on `networkIdle` instead of `loadEventFired`
    pub wait_for_network_idle: bool,
    pub log_network_traffic: bool,
    pub extra_headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageLoadingState {
    Loading,
    WaitForNetworkIdle,
    MediaLoadTimeout,
    BlockedByClient,
    Closed,
    Done,
}

impl PageLoadingState {
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            PageLoadingState::Loading | PageLoadingState::WaitForNetworkIdle
        )
    }
}

#[derive(Debug)]
pub struct NavigationTracker {
    state: PageLoadingState,
    wait_for_network_idle: bool,
    media_load_timeout: Option<Duration>,
    /// Set on `DOMContentLoaded`
    media_started: Option<Instant>,
    navigation_error: Option<String>,
    /// Lifecycle events of other frames are ignored once this is known
    main_frame: Option<String>,
    /// Loader of the document being replaced
    stale_loader: Option<String>,
}

impl NavigationTracker {
    pub fn new(wait_for_network_idle: bool, media_load_timeout: Option<Duration>) -> Self {
        Self {
            state: PageLoadingState::Loading,
            wait_for_network_idle,
            media_load_timeout,
            media_started: None,
            navigation_error: None,
            main_frame: None,
            stale_loader: None,
        }
    }

    /// Literal HTML never produces `frameNavigated`, so it starts here.
    pub fn seeded_for_document_content(
        wait_for_network_idle: bool,
        media_load_timeout: Option<Duration>,
    ) -> Self {
        let mut tracker = Self::new(wait_for_network_idle, media_load_timeout);
        tracker.state = PageLoadingState::WaitForNetworkIdle;
        tracker
    }

    pub fn state(&self) -> PageLoadingState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn take_navigation_error(&mut self) -> Option<String> {
        self.navigation_error.take()
    }

    pub fn set_main_frame(&mut self, frame_id: impl Into<String>) {
        self.main_frame = Some(frame_id.into());
    }

    /// Chromium replays the lifecycle of the current document when lifecycle
    /// events are switched on. Events from `loader_id` do not count until the
    /// navigation response arrives.
    pub fn ignore_loader(&mut self, loader_id: impl Into<String>) {
        self.stale_loader = Some(loader_id.into());
    }

    fn is_relevant(&self, lifecycle: &LifecycleEvent) -> bool {
        if self.stale_loader.as_deref() == Some(lifecycle.loader_id.as_str()) {
            return false;
        }
        self.main_frame
            .as_deref()
            .map_or(true, |main| main == lifecycle.frame_id)
    }

    /// Returns false when already terminal.
    fn transition(&mut self, next: PageLoadingState) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        if self.state != next {
            tracing::debug!("Page loading state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
        true
    }

    pub fn observe(&mut self, event: &PageEvent, now: Instant) {
        if self.is_finished() {
            return;
        }

        match event {
            PageEvent::Lifecycle(lifecycle) if !self.is_relevant(lifecycle) => {
                tracing::trace!(
                    "Ignoring {} of frame {} loader {}",
                    lifecycle.name,
                    lifecycle.frame_id,
                    lifecycle.loader_id
                );
            }
            PageEvent::Lifecycle(lifecycle) => match lifecycle.name.as_str() {
                "DOMContentLoaded" => {
                    if self.media_load_timeout.is_some() && self.media_started.is_none() {
                        tracing::debug!("DOM content loaded, media load stopwatch started");
                        self.media_started = Some(now);
                    }
                }
                "networkIdle" if self.state == PageLoadingState::WaitForNetworkIdle => {
                    self.transition(PageLoadingState::Done);
                }
                _ => {}
            },
            PageEvent::FrameNavigated(frame) if frame.is_main_frame() => {
                if self.main_frame.is_none() {
                    self.main_frame = Some(frame.id.clone());
                }
                self.transition(PageLoadingState::WaitForNetworkIdle);
            }
            PageEvent::LoadEventFired if !self.wait_for_network_idle => {
                self.transition(PageLoadingState::Done);
            }
            _ => {}
        }
    }

    /// `errorText` from the navigation response. Anything other than our own
    /// blocking is fatal and recorded for the caller.
    pub fn on_navigation_response(&mut self, error_text: Option<&str>) {
        // Anything queued after this belongs to the new document
        self.stale_loader = None;
        let Some(error_text) = error_text.filter(|text| !text.is_empty()) else {
            return;
        };
        if error_text.contains(BLOCKED_BY_CLIENT) {
            tracing::debug!("Navigation reported {}, ignored", error_text);
            return;
        }
        if self.transition(PageLoadingState::BlockedByClient) {
            self.navigation_error = Some(error_text.to_string());
        }
    }

    pub fn on_connection_closed(&mut self) {
        self.transition(PageLoadingState::Closed);
    }

    /// True exactly once: when the media stopwatch runs past its budget.
    pub fn check_media_timeout(&mut self, now: Instant) -> bool {
        let (Some(started), Some(timeout)) = (self.media_started, self.media_load_timeout) else {
            return false;
        };
        if now.duration_since(started) < timeout {
            return false;
        }
        self.transition(PageLoadingState::MediaLoadTimeout)
    }
}
