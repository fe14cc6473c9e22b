//! Convert a URL, HTML file or text file to PDF or PNG
//!
//! cargo run -p converter --example convert -- <input> <output.pdf|output.png> [config.json]

use converter::{ConversionRequest, Converter, ConverterConfig, PreWrapProcessor, Source};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("usage: {} <input> <output.pdf|output.png> [config.json]", args[0]);
        std::process::exit(2);
    }

    let config = match args.get(3) {
        Some(path) => ConverterConfig::load(path).await?,
        None => ConverterConfig::default(),
    };

    let source = if args[1].contains("://") {
        Source::from_uri(&args[1])?
    } else {
        Source::File(PathBuf::from(&args[1]))
    };
    let output = PathBuf::from(&args[2]);
    let request = if output.extension().is_some_and(|ext| ext == "png") {
        ConversionRequest::png(source)
    } else {
        ConversionRequest::pdf(source)
    }
    .with_timeout(Duration::from_secs(60));

    // Ctrl-C cancels the running conversion
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    let mut converter = Converter::new(config).with_pre_processor(PreWrapProcessor);
    println!("Converting {} -> {}", args[1], output.display());

    let result = converter.convert_to_file(&request, &output, &cancel).await;
    converter.dispose().await;

    let report = result?;
    println!(
        "Done: {:?}, {} bytes{}",
        report.state,
        report.bytes_written,
        if report.media_load_timed_out { " (media load timed out)" } else { "" }
    );
    Ok(())
}
