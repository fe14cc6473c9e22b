//! End-to-end conversions against a stub DevTools endpoint and a fake browser process
#![cfg(unix)]

mod support;

use browser::BrowserError;
use converter::{
    ConversionRequest, ConvertError, ConverterConfig, Converter, PageLoadingState, PreWrapProcessor,
    Source,
};
use serde_json::json;
use std::time::{Duration, Instant};
use support::{converter, reply, StubDevTools};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use url::Url;

fn example_com() -> Source {
    Source::Uri(Url::parse("https://example.com").unwrap())
}

/// Page.navigate to a real URL is never answered
fn hanging_navigation(method: &str, request: &serde_json::Value) -> Option<Vec<serde_json::Value>> {
    (method == "Page.navigate" && request["params"]["url"] != "about:blank").then(Vec::new)
}

#[tokio::test]
async fn test_url_to_pdf() {
    let dir = TempDir::new().unwrap();
    let stub = StubDevTools::start().await;
    let mut converter = converter(dir.path(), &stub);

    let mut output = Vec::new();
    let report = converter
        .convert(&ConversionRequest::pdf(example_com()), &mut output, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(output, b"%PDF-1.7");
    assert_eq!(report.bytes_written, 8);
    assert_eq!(report.state, PageLoadingState::Done);
    assert!(!report.media_load_timed_out);
    assert_eq!(report.window_status_matched, None);
    assert_eq!(
        stub.requests_for("Page.navigate")[0]["params"]["url"],
        "https://example.com/"
    );
    assert_eq!(stub.requests_for("Page.printToPDF")[0]["params"]["transferMode"], "ReturnAsStream");
    assert_eq!(stub.count("Page.disable"), 1);

    converter.dispose().await;
}

#[tokio::test]
async fn test_process_and_session_are_reused() {
    let dir = TempDir::new().unwrap();
    let stub = StubDevTools::start().await;
    let mut converter = converter(dir.path(), &stub);
    let cancel = CancellationToken::new();

    converter
        .convert(&ConversionRequest::pdf(example_com()), &mut Vec::new(), &cancel)
        .await
        .unwrap();
    let pid = converter.browser_pid();
    assert!(pid.is_some());

    converter
        .convert(&ConversionRequest::pdf(example_com()), &mut Vec::new(), &cancel)
        .await
        .unwrap();

    assert_eq!(converter.browser_pid(), pid);
    assert_eq!(stub.count("Target.createTarget"), 1);
    assert_eq!(stub.count("Page.printToPDF"), 2);

    converter.dispose().await;
}

#[tokio::test]
async fn test_literal_html_to_png() {
    let dir = TempDir::new().unwrap();
    let stub = StubDevTools::start().await;
    let mut converter = converter(dir.path(), &stub);

    let request = ConversionRequest::png(Source::Html("<html><body>hi</body></html>".to_string()));
    let mut output = Vec::new();
    let report = converter
        .convert(&request, &mut output, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(output, [0x89, b'P', b'N', b'G']);
    assert_eq!(report.state, PageLoadingState::Done);
    assert_eq!(stub.requests_for("Page.navigate")[0]["params"]["url"], "about:blank");
    assert_eq!(
        stub.requests_for("Page.setDocumentContent")[0]["params"]["html"],
        "<html><body>hi</body></html>"
    );
    assert_eq!(stub.count("Page.printToPDF"), 0);

    converter.dispose().await;
}

#[tokio::test]
async fn test_text_file_is_wrapped_and_cleaned_up() {
    let dir = TempDir::new().unwrap();
    let work_dir = TempDir::new().unwrap();
    let stub = StubDevTools::start().await;

    let input = dir.path().join("notes.txt");
    std::fs::write(&input, "1 < 2").unwrap();

    let config = ConverterConfig {
        temp_dir: Some(work_dir.path().to_path_buf()),
        ..converter(dir.path(), &stub).config().clone()
    };
    let mut converter = Converter::new(config).with_pre_processor(PreWrapProcessor);

    converter
        .convert(&ConversionRequest::pdf(Source::File(input)), &mut Vec::new(), &CancellationToken::new())
        .await
        .unwrap();

    let navigated = stub.requests_for("Page.navigate")[0]["params"]["url"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(navigated.starts_with("file://"));
    assert!(navigated.ends_with(".html"));
    assert_eq!(std::fs::read_dir(work_dir.path()).unwrap().count(), 0);

    converter.dispose().await;
}

#[tokio::test]
async fn test_hanging_navigation_times_out() {
    let dir = TempDir::new().unwrap();
    let stub = StubDevTools::with(hanging_navigation).await;
    let mut converter = converter(dir.path(), &stub);

    let request = ConversionRequest::pdf(example_com()).with_timeout(Duration::from_millis(300));
    let started = Instant::now();
    let result = converter
        .convert(&request, &mut Vec::new(), &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(ConvertError::TimedOut(d)) if d == Duration::from_millis(300)));
    assert!(started.elapsed() < Duration::from_secs(3));
    // Domains are switched off again before the error surfaces
    assert_eq!(stub.count("Page.setLifecycleEventsEnabled"), 2);
    assert_eq!(stub.count("Page.disable"), 1);
    assert_eq!(stub.count("Page.printToPDF"), 0);

    converter.dispose().await;
}

#[tokio::test]
async fn test_window_status_wait_does_not_extend_budget() {
    let dir = TempDir::new().unwrap();
    let stub = StubDevTools::with(|method, request| {
        (method == "Runtime.evaluate")
            .then(|| vec![reply(request, json!({ "result": { "type": "string", "value": "loading" } }))])
    })
    .await;
    let mut converter = converter(dir.path(), &stub);

    let request = ConversionRequest::pdf(example_com())
        .with_timeout(Duration::from_millis(400))
        .with_window_status("ready", Duration::from_secs(10));
    let started = Instant::now();
    let result = converter
        .convert(&request, &mut Vec::new(), &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(ConvertError::TimedOut(_))));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(400));
    assert!(elapsed < Duration::from_secs(3));
    assert_eq!(stub.count("Page.printToPDF"), 0);

    converter.dispose().await;
}

#[tokio::test]
async fn test_unanswered_window_status_poll_is_bounded_by_budget() {
    let dir = TempDir::new().unwrap();
    let stub = StubDevTools::with(|method, _| (method == "Runtime.evaluate").then(Vec::new)).await;
    let mut converter = converter(dir.path(), &stub);

    let request = ConversionRequest::pdf(example_com())
        .with_timeout(Duration::from_millis(300))
        .with_window_status("ready", Duration::from_secs(10));
    let started = Instant::now();
    let result = converter
        .convert(&request, &mut Vec::new(), &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(ConvertError::TimedOut(d)) if d == Duration::from_millis(300)));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(stub.count("Page.printToPDF"), 0);

    converter.dispose().await;
}

#[tokio::test]
async fn test_window_status_script_and_snapshot() {
    let dir = TempDir::new().unwrap();
    let stub = StubDevTools::with(|method, request| {
        (method == "Runtime.evaluate").then(|| {
            let value = if request["params"]["expression"] == "window.status" {
                json!("ready")
            } else {
                json!(2)
            };
            vec![reply(request, json!({ "result": { "value": value } }))]
        })
    })
    .await;
    let mut converter = converter(dir.path(), &stub);

    let request = ConversionRequest::pdf(example_com())
        .with_window_status("ready", Duration::from_secs(2))
        .with_javascript("1 + 1")
        .with_snapshot();
    let report = converter
        .convert(&request, &mut Vec::new(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.window_status_matched, Some(true));
    assert_eq!(report.script_result, Some(json!(2)));
    assert_eq!(report.snapshot.as_deref(), Some("MIME-Version: 1.0"));
    assert_eq!(report.bytes_written, 8);

    converter.dispose().await;
}

#[tokio::test]
async fn test_unmatched_window_status_still_converts() {
    let dir = TempDir::new().unwrap();
    let stub = StubDevTools::start().await;
    let mut converter = converter(dir.path(), &stub);

    let request = ConversionRequest::pdf(example_com()).with_window_status("ready", Duration::from_millis(100));
    let report = converter
        .convert(&request, &mut Vec::new(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.window_status_matched, Some(false));
    assert_eq!(report.bytes_written, 8);

    converter.dispose().await;
}

#[tokio::test]
async fn test_navigation_error_is_reported() {
    let dir = TempDir::new().unwrap();
    let stub = StubDevTools::with(|method, request| {
        (method == "Page.navigate" && request["params"]["url"] != "about:blank").then(|| {
            vec![reply(
                request,
                json!({ "frameId": "F1", "errorText": "net::ERR_NAME_NOT_RESOLVED" }),
            )]
        })
    })
    .await;
    let mut converter = converter(dir.path(), &stub);

    let result = converter
        .convert(&ConversionRequest::pdf(example_com()), &mut Vec::new(), &CancellationToken::new())
        .await;

    match result {
        Err(ConvertError::Browser(BrowserError::Navigation(message))) => {
            assert_eq!(message, "net::ERR_NAME_NOT_RESOLVED")
        }
        other => panic!("expected navigation error, got {:?}", other),
    }

    converter.dispose().await;
}

#[tokio::test]
async fn test_cancellation() {
    let dir = TempDir::new().unwrap();
    let stub = StubDevTools::with(hanging_navigation).await;
    let mut converter = converter(dir.path(), &stub);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        }
    });

    let result = converter
        .convert(&ConversionRequest::pdf(example_com()), &mut Vec::new(), &cancel)
        .await;
    assert!(matches!(result, Err(ConvertError::Cancelled)));

    converter.dispose().await;
}

#[tokio::test]
async fn test_dispose_closes_browser_once() {
    let dir = TempDir::new().unwrap();
    let stub = StubDevTools::start().await;
    let mut converter = converter(dir.path(), &stub);

    converter
        .convert(&ConversionRequest::pdf(example_com()), &mut Vec::new(), &CancellationToken::new())
        .await
        .unwrap();

    converter.dispose().await;
    converter.dispose().await;

    assert_eq!(stub.count("Browser.close"), 1);
    assert!(converter.browser_pid().is_none());

    let result = converter
        .convert(&ConversionRequest::pdf(example_com()), &mut Vec::new(), &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(ConvertError::Disposed)));
}

#[tokio::test]
async fn test_convert_to_file() {
    let dir = TempDir::new().unwrap();
    let stub = StubDevTools::with(hanging_navigation).await;
    let mut converter = converter(dir.path(), &stub);
    let cancel = CancellationToken::new();

    let html = ConversionRequest::pdf(Source::Html("<p>x</p>".to_string()));
    let pdf = dir.path().join("out.pdf");
    converter.convert_to_file(&html, &pdf, &cancel).await.unwrap();
    assert_eq!(std::fs::read(&pdf).unwrap(), b"%PDF-1.7");

    let failing = ConversionRequest::pdf(example_com()).with_timeout(Duration::from_millis(200));
    let missing = dir.path().join("failed.pdf");
    assert!(converter.convert_to_file(&failing, &missing, &cancel).await.is_err());
    assert!(!missing.exists());

    converter.dispose().await;
}
