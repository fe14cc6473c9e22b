//! CDP Connection - one websocket to one DevTools endpoint
//!
//! Design decisions:
//! 1. One connection per endpoint (browser target and page target each get their own)
//! 2. Request/response matching via ID; every decoded frame is also published to subscribers
//! 3. The receive loop owns the read half and never propagates errors into callers
//! 4. Fail fast - no retries. Let the caller decide.

use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::protocol::*;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Budget for the websocket close handshake, independent of caller timeouts.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum CdpError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed protocol message: {0}")]
    Decode(String),

    #[error("CDP protocol error: {code} - {message}")]
    Remote { code: i64, message: String },

    #[error("Could not open websocket within {0:?}")]
    ConnectionTimeout(Duration),

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Connection closed")]
    Closed,

    #[error("Invalid response to {method}: {reason}")]
    InvalidResponse { method: String, reason: String },
}

/// Result type for CDP operations
pub type Result<T> = std::result::Result<T, CdpError>;

/// What subscribers see
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Message(CdpMessage),
    /// A frame could not be decoded or the socket failed; the waiters are unaffected
    Error(String),
    Closed,
}

pub type EventReceiver = mpsc::UnboundedReceiver<ConnectionEvent>;

/// State shared between the connection handle and its receive loop
struct Shared {
    /// Pending requests waiting for responses
    pending: DashMap<RequestId, oneshot::Sender<CdpResponse>>,

    /// Event queues, one per subscriber
    subscribers: DashMap<u64, mpsc::UnboundedSender<ConnectionEvent>>,
    next_subscriber: AtomicU64,

    closed: AtomicBool,
}

impl Shared {
    fn publish(&self, event: ConnectionEvent) {
        // Drop queues whose receiver is gone
        self.subscribers
            .retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    fn dispatch(&self, url: &str, text: &str) {
        tracing::trace!("<- {}: {}", url, text);
        match CdpMessage::decode(text) {
            Ok(message) => {
                if let CdpMessage::Response(response) = &message {
                    match self.pending.remove(&response.id) {
                        Some((_, tx)) => {
                            let _ = tx.send(response.clone()); // Receiver may have been cancelled
                        }
                        None => {
                            tracing::debug!("No waiter for response {} on {}", response.id, url);
                        }
                    }
                }
                self.publish(ConnectionEvent::Message(message));
            }
            Err(e) => {
                tracing::warn!("Dropping undecodable frame on {}: {}", url, e);
                self.publish(ConnectionEvent::Error(e.to_string()));
            }
        }
    }

    /// Fails every waiter and tells subscribers. Runs at most once.
    fn mark_closed(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the senders resolves every waiter with `Closed`
        self.pending.clear();
        self.publish(ConnectionEvent::Closed);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Removes a pending entry when the waiting future finishes or is dropped.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending.remove(&self.id);
    }
}

/// CDP Connection - manages a single websocket to a DevTools endpoint
pub struct CdpConnection {
    url: String,

    /// Monotonic request ID counter
    next_id: AtomicU64,

    shared: Arc<Shared>,

    /// WebSocket write half
    ws_sink: Mutex<WsSink>,

    /// Default budget for [`CdpConnection::send`]
    request_timeout: Duration,

    shutdown: CancellationToken,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl CdpConnection {
    /// Connect to a DevTools websocket endpoint within `timeout`.
    ///
    /// `timeout` also becomes the default budget of [`CdpConnection::send`].
    pub async fn connect(url: &str, timeout: Duration) -> Result<Arc<Self>> {
        let (ws_stream, _) = tokio::time::timeout(timeout, connect_async(url))
            .await
            .map_err(|_| CdpError::ConnectionTimeout(timeout))??;
        let (sink, stream) = ws_stream.split();

        tracing::debug!("Connected to {}", url);

        let shared = Arc::new(Shared {
            pending: DashMap::new(),
            subscribers: DashMap::new(),
            next_subscriber: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(receive_loop(
            stream,
            shared.clone(),
            shutdown.clone(),
            url.to_string(),
        ));

        Ok(Arc::new(Self {
            url: url.to_string(),
            next_id: AtomicU64::new(1),
            shared,
            ws_sink: Mutex::new(sink),
            request_timeout: timeout,
            shutdown,
            receive_task: Mutex::new(Some(task)),
            disposed: AtomicBool::new(false),
        }))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Open a new event queue. Every decoded inbound frame is delivered to
    /// every queue in arrival order, followed by [`ConnectionEvent::Closed`].
    pub fn subscribe(&self) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.shared.is_closed() {
            let _ = tx.send(ConnectionEvent::Closed);
            return rx;
        }
        let key = self.shared.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.shared.subscribers.insert(key, tx);
        // The receive loop may have closed between the check and the insert
        if self.shared.is_closed() {
            if let Some((_, tx)) = self.shared.subscribers.remove(&key) {
                let _ = tx.send(ConnectionEvent::Closed);
            }
        }
        rx
    }

    /// Send a request and wait for its response, bounded by the connection's default timeout.
    pub async fn send(&self, method: impl Into<String>, params: Value) -> Result<Value> {
        self.roundtrip(method.into(), params, None, Some(self.request_timeout))
            .await
    }

    /// Send a request and wait for its response with an explicit budget.
    pub async fn send_with_timeout(
        &self,
        method: impl Into<String>,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        self.roundtrip(method.into(), params, None, Some(timeout))
            .await
    }

    /// Send a request and wait until the response arrives, the connection
    /// closes, `cancel` fires or the default timeout runs out. Cancelling
    /// discards the pending entry.
    pub async fn send_request(
        &self,
        method: impl Into<String>,
        params: Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        self.roundtrip(method.into(), params, Some(cancel), Some(self.request_timeout))
            .await
    }

    /// Send a request without registering a waiter.
    pub async fn send_and_forget(&self, method: impl Into<String>, params: Value) -> Result<()> {
        if self.shared.is_closed() {
            return Err(CdpError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.transmit(&CdpRequest::new(id, method, params)).await
    }

    async fn roundtrip(
        &self,
        method: String,
        params: Value,
        cancel: Option<&CancellationToken>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = CdpRequest::new(id, method, params);

        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(id, tx);
        let _guard = PendingGuard {
            shared: &*self.shared,
            id,
        };
        // Checked after insert so a concurrent close cannot strand us
        if self.shared.is_closed() {
            return Err(CdpError::Closed);
        }

        self.transmit(&request).await?;

        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let deadline = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        let response = tokio::select! {
            biased;
            response = rx => response.map_err(|_| CdpError::Closed)?,
            _ = cancelled => {
                tracing::debug!("{} (id {}) cancelled", request.method, id);
                return Err(CdpError::Cancelled);
            }
            _ = deadline => {
                tracing::debug!("{} (id {}) timed out", request.method, id);
                return Err(CdpError::Timeout(timeout.unwrap_or_default()));
            }
        };

        response.into_result()
    }

    async fn transmit(&self, request: &CdpRequest) -> Result<()> {
        let json = serde_json::to_string(request)?;
        tracing::trace!("-> {}: {}", self.url, json);
        let mut sink = self.ws_sink.lock().await;
        sink.send(Message::Text(json)).await?;
        Ok(())
    }

    /// Close connection gracefully. Calling it again is a no-op.
    pub async fn close(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shutdown.cancel();
        if let Some(task) = self.receive_task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::warn!("Receive loop for {} ended abnormally: {}", self.url, e);
            }
        }

        let mut sink = self.ws_sink.lock().await;
        match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
            Ok(Ok(())) => tracing::debug!("Closed {}", self.url),
            Ok(Err(e)) => tracing::debug!("Websocket close for {} failed: {}", self.url, e),
            Err(_) => tracing::warn!("Websocket close for {} timed out", self.url),
        }
        drop(sink);

        self.shared.mark_closed();
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }
}

impl Drop for CdpConnection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn receive_loop(
    mut stream: SplitStream<WsStream>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    url: String,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!("Receive loop for {} shutting down", url);
                break;
            }
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => shared.dispatch(&url, &text),
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => shared.dispatch(&url, &text),
                Err(e) => shared.publish(ConnectionEvent::Error(format!(
                    "binary frame is not UTF-8: {e}"
                ))),
            },
            Some(Ok(Message::Close(_))) | None => {
                tracing::info!("WebSocket {} closed", url);
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::error!("WebSocket error on {}: {}", url, e);
                shared.publish(ConnectionEvent::Error(e.to_string()));
                break;
            }
        }
    }

    shared.mark_closed();
}
