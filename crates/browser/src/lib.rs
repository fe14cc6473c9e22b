//! Headless Chromium control over the DevTools protocol
//!
//! This crate drives a headless Chromium-family browser for document
//! conversion: it launches and supervises the process, speaks the DevTools
//! wire protocol over websockets, and decides when a page is loaded enough
//! to print.
//!
//! # Layers
//!
//! 1. **Wire** ([`cdp::protocol`]): typed request/response/event envelopes
//! 2. **Transport** ([`cdp::connection`]): one websocket, id correlation, event fan-out
//! 3. **Session** ([`session`]): navigation state machine, printing, scripts
//! 4. **Process** ([`process`]): launch, endpoint discovery, tree kill

pub mod cdp;
pub mod countdown;
pub mod error;
pub mod filter;
pub mod navigation;
pub mod process;
pub mod session;
pub mod settings;

pub use cdp::{CdpConnection, CdpError};
pub use countdown::{CountdownTimer, DeadlineToken};
pub use error::{BrowserError, Result};
pub use filter::{FilterDecision, RequestFilter};
pub use navigation::{NavigationOptions, PageLoadingState, PageSource};
pub use process::{BrowserProcess, ChromiumArguments, EndpointDiscovery, LaunchOptions, RunAs};
pub use session::BrowserSession;
pub use settings::{Clip, PageSettings, PaperFormat, ScreenshotOptions};
