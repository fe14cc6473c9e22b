//! Pre-processing - rewrite the input before the browser sees it
//!
//! A pre-processor takes the request source and may hand back a different
//! one, usually a file it wrote into the work directory. Files it lists as
//! temporary are deleted by the converter once the conversion is over,
//! whether it succeeded or not.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{ConvertError, Result};
use crate::request::Source;

/// Extensions [`PreWrapProcessor`] turns into HTML
pub const PLAIN_TEXT_EXTENSIONS: &[&str] = &["txt", "log", "text"];

#[derive(Debug, Clone, PartialEq)]
pub struct PreProcessed {
    pub source: Source,
    /// Files created for this conversion only
    pub temp_files: Vec<PathBuf>,
}

impl PreProcessed {
    pub fn unchanged(source: &Source) -> Self {
        Self {
            source: source.clone(),
            temp_files: Vec::new(),
        }
    }
}

#[async_trait]
pub trait PreProcessor: Send + Sync {
    /// Name for logs and errors
    fn name(&self) -> &str;

    async fn process(&self, source: &Source, work_dir: &Path) -> Result<PreProcessed>;
}

/// Passes every input through untouched
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPreProcessing;

#[async_trait]
impl PreProcessor for NoPreProcessing {
    fn name(&self) -> &str {
        "NoPreProcessing"
    }

    async fn process(&self, source: &Source, _work_dir: &Path) -> Result<PreProcessed> {
        Ok(PreProcessed::unchanged(source))
    }
}

/// Wraps plain-text files in a `<pre>` HTML document so they print as-is
#[derive(Debug, Default, Clone, Copy)]
pub struct PreWrapProcessor;

impl PreWrapProcessor {
    fn failed(&self, reason: impl std::fmt::Display) -> ConvertError {
        ConvertError::PreProcessing {
            processor: self.name().to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl PreProcessor for PreWrapProcessor {
    fn name(&self) -> &str {
        "PreWrapProcessor"
    }

    async fn process(&self, source: &Source, work_dir: &Path) -> Result<PreProcessed> {
        let Source::File(path) = source else {
            return Ok(PreProcessed::unchanged(source));
        };
        let is_text = source
            .file_extension()
            .is_some_and(|ext| PLAIN_TEXT_EXTENSIONS.contains(&ext.as_str()));
        if !is_text {
            return Ok(PreProcessed::unchanged(source));
        }

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| self.failed(format!("{}: {}", path.display(), e)))?;
        let text = String::from_utf8_lossy(&bytes);
        let title = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let wrapped = work_dir.join(format!("{}.html", Uuid::now_v7()));
        tokio::fs::write(&wrapped, wrap_in_pre(&title, &text))
            .await
            .map_err(|e| self.failed(format!("{}: {}", wrapped.display(), e)))?;
        tracing::debug!("[PreWrapProcessor] {} -> {}", path.display(), wrapped.display());

        Ok(PreProcessed {
            source: Source::File(wrapped.clone()),
            temp_files: vec![wrapped],
        })
    }
}

fn wrap_in_pre(title: &str, text: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{}</title>\n\
         <style>pre {{ white-space: pre-wrap; word-wrap: break-word; }}</style>\n\
         </head>\n<body>\n<pre>{}</pre>\n</body>\n</html>\n",
        escape_html(title),
        escape_html(text)
    )
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}
