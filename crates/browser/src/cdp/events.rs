//! Typed page events
//!
//! Events are polymorphic only by their `method` string. Each inbound event is
//! decoded once into a closed enum; anything we do not model lands in
//! [`PageEvent::Other`].

use serde::Deserialize;
use serde_json::{Map, Value};

use super::connection::CdpError;
use super::protocol::CdpEvent;

#[derive(Debug, Clone, PartialEq)]
pub enum PageEvent {
    /// `Page.lifecycleEvent`
    Lifecycle(LifecycleEvent),
    /// `Page.frameNavigated`
    FrameNavigated(Frame),
    /// `Page.loadEventFired`
    LoadEventFired,
    /// `Fetch.requestPaused`
    RequestPaused(PausedRequest),
    /// Any `Network.*` event, kept raw for traffic logging
    Network { method: String, params: Value },
    Other { method: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LifecycleEvent {
    pub name: String,
    #[serde(rename = "frameId", default)]
    pub frame_id: String,
    #[serde(rename = "loaderId", default)]
    pub loader_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Frame {
    pub id: String,
    #[serde(rename = "parentId", default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub url: String,
}

impl Frame {
    pub fn is_main_frame(&self) -> bool {
        self.parent_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PausedRequest {
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub request: PausedRequestInfo,
    #[serde(rename = "resourceType", default)]
    pub resource_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PausedRequestInfo {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: Map<String, Value>,
}

#[derive(Deserialize)]
struct FrameNavigatedParams {
    frame: Frame,
}

impl PageEvent {
    pub fn decode(event: &CdpEvent) -> Result<Self, CdpError> {
        let params = event.params.clone();
        let decoded = match event.method.as_str() {
            "Page.lifecycleEvent" => PageEvent::Lifecycle(from_params(params)?),
            "Page.frameNavigated" => {
                let navigated: FrameNavigatedParams = from_params(params)?;
                PageEvent::FrameNavigated(navigated.frame)
            }
            "Page.loadEventFired" => PageEvent::LoadEventFired,
            "Fetch.requestPaused" => PageEvent::RequestPaused(from_params(params)?),
            method if method.starts_with("Network.") => PageEvent::Network {
                method: method.to_string(),
                params,
            },
            method => PageEvent::Other {
                method: method.to_string(),
            },
        };
        Ok(decoded)
    }
}

fn from_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, CdpError> {
    serde_json::from_value(params).map_err(|e| CdpError::Decode(e.to_string()))
}
