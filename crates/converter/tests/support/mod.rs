//! Stub DevTools endpoint and fake browser for end-to-end conversions

#![allow(dead_code)]

use converter::{Converter, ConverterConfig};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

/// "%PDF-1.7"
pub const PDF_BASE64: &str = "JVBERi0xLjc=";
/// "\x89PNG"
pub const PNG_BASE64: &str = "iVBORw==";

type Custom = Arc<dyn Fn(&str, &Value) -> Option<Vec<Value>> + Send + Sync>;

pub fn reply(request: &Value, result: Value) -> Value {
    json!({ "id": request["id"], "result": result })
}

pub fn event(method: &str, params: Value) -> Value {
    json!({ "method": method, "params": params })
}

pub fn lifecycle(name: &str) -> Value {
    event(
        "Page.lifecycleEvent",
        json!({ "frameId": "F1", "loaderId": "L1", "name": name, "timestamp": 1.0 }),
    )
}

/// Answers like a cooperative browser unless `custom` claims the request.
fn default_frames(method: &str, request: &Value) -> Vec<Value> {
    match method {
        "Target.createTarget" => vec![reply(request, json!({ "targetId": "T1" }))],
        "Page.navigate" if request["params"]["url"] == "about:blank" => {
            vec![reply(request, json!({ "frameId": "F1" }))]
        }
        "Page.navigate" => vec![
            reply(request, json!({ "frameId": "F1", "loaderId": "L1" })),
            lifecycle("DOMContentLoaded"),
            event("Page.loadEventFired", json!({ "timestamp": 2.0 })),
        ],
        "Page.getFrameTree" => {
            vec![reply(request, json!({ "frameTree": { "frame": { "id": "F1" } } }))]
        }
        "Page.setDocumentContent" => vec![reply(request, json!({})), lifecycle("networkIdle")],
        "Page.printToPDF" => vec![reply(request, json!({ "stream": "S1" }))],
        "IO.read" => vec![reply(
            request,
            json!({ "base64Encoded": true, "data": PDF_BASE64, "eof": true }),
        )],
        "Page.captureScreenshot" => vec![reply(request, json!({ "data": PNG_BASE64 }))],
        "Page.captureSnapshot" => vec![reply(request, json!({ "data": "MIME-Version: 1.0" }))],
        _ => vec![reply(request, json!({}))],
    }
}

pub struct StubDevTools {
    port: u16,
    requests: Arc<Mutex<Vec<Value>>>,
    task: JoinHandle<()>,
}

impl StubDevTools {
    pub async fn start() -> Self {
        Self::with(|_, _| None).await
    }

    pub async fn with<F>(custom: F) -> Self
    where
        F: Fn(&str, &Value) -> Option<Vec<Value>> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let custom: Custom = Arc::new(custom);
        let requests = Arc::new(Mutex::new(Vec::new()));

        let task = tokio::spawn({
            let requests = requests.clone();
            async move {
                while let Ok((socket, _)) = listener.accept().await {
                    tokio::spawn(serve(socket, custom.clone(), requests.clone()));
                }
            }
        });

        Self { port, requests, task }
    }

    pub fn browser_url(&self) -> String {
        format!("ws://127.0.0.1:{}/devtools/browser/stub", self.port)
    }

    pub fn requests_for(&self, method: &str) -> Vec<Value> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r["method"] == method)
            .cloned()
            .collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.requests_for(method).len()
    }
}

impl Drop for StubDevTools {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(socket: tokio::net::TcpStream, custom: Custom, requests: Arc<Mutex<Vec<Value>>>) {
    let Ok(ws) = accept_async(socket).await else {
        return;
    };
    let (mut sink, mut stream) = ws.split();

    while let Some(Ok(message)) = stream.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(request) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        requests.lock().unwrap().push(request.clone());

        let method = request["method"].as_str().unwrap_or_default().to_string();
        let frames = custom(&method, &request).unwrap_or_else(|| default_frames(&method, &request));
        for frame in frames {
            if sink.send(Message::Text(frame.to_string())).await.is_err() {
                return;
            }
        }
    }
}

/// A shell script that announces `endpoint` on stderr and then idles
pub fn fake_browser(dir: &Path, endpoint: &str) -> PathBuf {
    let path = dir.join("fake-chromium");
    fs::write(
        &path,
        format!("#!/bin/sh\necho \"DevTools listening on {endpoint}\" >&2\nexec sleep 30\n"),
    )
    .unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

/// Converter wired to a fake browser that points at `stub`
pub fn converter(dir: &Path, stub: &StubDevTools) -> Converter {
    let config = ConverterConfig {
        executable: Some(fake_browser(dir, &stub.browser_url())),
        temp_dir: Some(dir.to_path_buf()),
        websocket_timeout_ms: 5_000,
        startup_timeout_ms: 5_000,
        shutdown_grace_ms: 100,
        ..ConverterConfig::default()
    };
    Converter::new(config)
}
