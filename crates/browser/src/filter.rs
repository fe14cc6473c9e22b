//! Request Filter - decides which sub-resource requests may load
//!
//! Responsibilities:
//! - Match request URLs against blacklist wildcard patterns (`*` and `?`)
//! - Always allow URLs on the safe list (the safe list beats the blacklist)
//! - Always allow `file://` URLs inside the input document's own directory

use regex::Regex;
use std::collections::HashSet;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Allow,
    Block,
}

#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
    blacklist: Vec<Regex>,
    safe_urls: HashSet<String>,
    /// `file://` prefix of the directory holding the input document
    document_dir: Option<String>,
}

impl RequestFilter {
    pub fn new(blacklist: &[String], safe_urls: &[String], document: Option<&Url>) -> Self {
        let blacklist = blacklist
            .iter()
            .filter_map(|pattern| match wildcard_to_regex(pattern) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    tracing::warn!("Ignoring blacklist pattern {:?}: {}", pattern, e);
                    None
                }
            })
            .collect();

        let document_dir = document
            .filter(|url| url.scheme() == "file")
            .and_then(|url| url.join("./").ok())
            .map(|dir| dir.to_string());

        Self {
            blacklist,
            safe_urls: safe_urls.iter().cloned().collect(),
            document_dir,
        }
    }

    /// Interception is only worth enabling when something can be blocked
    pub fn is_active(&self) -> bool {
        !self.blacklist.is_empty()
    }

    pub fn decide(&self, url: &str) -> FilterDecision {
        if self.safe_urls.contains(url) {
            return FilterDecision::Allow;
        }

        if let Some(dir) = &self.document_dir {
            if url.starts_with("file://") && url.starts_with(dir.as_str()) {
                return FilterDecision::Allow;
            }
        }

        if self.blacklist.iter().any(|pattern| pattern.is_match(url)) {
            FilterDecision::Block
        } else {
            FilterDecision::Allow
        }
    }
}

/// `*` matches any run of characters, `?` exactly one; matching is
/// case-insensitive and anchored at both ends.
fn wildcard_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut expression = String::from("(?i)^");
    let mut literal = String::new();
    for ch in pattern.chars() {
        match ch {
            '*' | '?' => {
                expression.push_str(&regex::escape(&literal));
                literal.clear();
                expression.push_str(if ch == '*' { ".*" } else { "." });
            }
            _ => literal.push(ch),
        }
    }
    expression.push_str(&regex::escape(&literal));
    expression.push('$');
    Regex::new(&expression)
}
