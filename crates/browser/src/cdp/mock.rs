//! In-process DevTools endpoint for tests
//!
//! Every websocket accepted on the listener shares one scripted handler. The
//! handler sees each request as raw JSON and returns the frames to send back.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

pub(crate) enum MockFrame {
    Json(Value),
    Raw(String),
    Close,
}

pub(crate) fn reply(request: &Value, result: Value) -> MockFrame {
    MockFrame::Json(json!({"id": request["id"], "result": result}))
}

pub(crate) fn event(method: &str, params: Value) -> MockFrame {
    MockFrame::Json(json!({"method": method, "params": params}))
}

type Handler = Arc<dyn Fn(&Value) -> Vec<MockFrame> + Send + Sync>;

pub(crate) struct MockDevTools {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<Value>>>,
    pushers: Arc<Mutex<Vec<mpsc::UnboundedSender<MockFrame>>>>,
    task: JoinHandle<()>,
}

impl MockDevTools {
    pub(crate) async fn start<F>(handler: F) -> Self
    where
        F: Fn(&Value) -> Vec<MockFrame> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handler: Handler = Arc::new(handler);
        let requests = Arc::new(Mutex::new(Vec::new()));
        let pushers = Arc::new(Mutex::new(Vec::new()));

        let task = tokio::spawn({
            let requests = requests.clone();
            let pushers = pushers.clone();
            async move {
                while let Ok((socket, _)) = listener.accept().await {
                    let (push_tx, push_rx) = mpsc::unbounded_channel();
                    pushers.lock().unwrap().push(push_tx);
                    tokio::spawn(serve(
                        socket,
                        handler.clone(),
                        requests.clone(),
                        push_rx,
                    ));
                }
            }
        });

        Self {
            addr,
            requests,
            pushers,
            task,
        }
    }

    pub(crate) fn browser_url(&self) -> String {
        format!("ws://{}/devtools/browser/mock", self.addr)
    }

    /// Every request received so far, across all connections
    pub(crate) fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn methods(&self) -> Vec<String> {
        self.requests()
            .iter()
            .map(|r| r["method"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    pub(crate) fn count(&self, method: &str) -> usize {
        self.methods().iter().filter(|m| *m == method).count()
    }

    /// Send an unsolicited frame on every open connection
    pub(crate) fn push(&self, frame: impl Fn() -> MockFrame) {
        for tx in self.pushers.lock().unwrap().iter() {
            let _ = tx.send(frame());
        }
    }
}

impl Drop for MockDevTools {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    socket: tokio::net::TcpStream,
    handler: Handler,
    requests: Arc<Mutex<Vec<Value>>>,
    mut pushed: mpsc::UnboundedReceiver<MockFrame>,
) {
    let Ok(ws) = accept_async(socket).await else {
        return;
    };
    let (mut sink, mut stream) = ws.split();

    loop {
        let frames = tokio::select! {
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let Ok(request) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    requests.lock().unwrap().push(request.clone());
                    handler(&request)
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            },
            Some(frame) = pushed.recv() => vec![frame],
        };

        for frame in frames {
            let sent = match frame {
                MockFrame::Json(value) => sink.send(Message::Text(value.to_string())).await,
                MockFrame::Raw(text) => sink.send(Message::Text(text)).await,
                MockFrame::Close => {
                    let _ = sink.close().await;
                    return;
                }
            };
            if sent.is_err() {
                return;
            }
        }
    }
}
