//! Finding a Chromium executable

use std::path::{Path, PathBuf};

/// Environment variable naming the executable to use
pub const CHROME_PATH_ENV: &str = "CHROME_PATH";

pub trait BrowserLocator: Send + Sync {
    fn locate(&self) -> Option<PathBuf>;
}

/// Looks at `CHROME_PATH`, then `PATH`, then the usual install locations
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLocator;

impl BrowserLocator for SystemLocator {
    fn locate(&self) -> Option<PathBuf> {
        let from_env = std::env::var(CHROME_PATH_ENV).ok();
        locate_with(from_env.as_deref(), |name| which::which(name).ok())
    }
}

/// Always answers with the same path
#[derive(Debug, Clone)]
pub struct FixedLocator(pub PathBuf);

impl BrowserLocator for FixedLocator {
    fn locate(&self) -> Option<PathBuf> {
        Some(self.0.clone())
    }
}

fn locate_with(
    from_env: Option<&str>,
    search_path: impl Fn(&str) -> Option<PathBuf>,
) -> Option<PathBuf> {
    if let Some(raw) = from_env {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            let candidate = PathBuf::from(trimmed);
            if candidate.is_file() {
                return Some(candidate);
            }
            tracing::warn!("[SystemLocator] {}={} does not exist", CHROME_PATH_ENV, trimmed);
        }
    }

    for name in executable_names() {
        if let Some(path) = search_path(name) {
            return Some(path);
        }
    }

    install_locations().into_iter().find(|path| path.is_file())
}

fn executable_names() -> &'static [&'static str] {
    #[cfg(target_os = "windows")]
    {
        &["chrome.exe", "chromium.exe", "msedge.exe"]
    }

    #[cfg(not(target_os = "windows"))]
    {
        &[
            "chromium",
            "chromium-browser",
            "google-chrome-stable",
            "google-chrome",
        ]
    }
}

fn install_locations() -> Vec<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let mut paths = Vec::new();
        for var in ["PROGRAMFILES", "PROGRAMFILES(X86)", "LOCALAPPDATA"] {
            if let Some(root) = std::env::var_os(var) {
                let root = Path::new(&root);
                paths.push(root.join("Google/Chrome/Application/chrome.exe"));
                paths.push(root.join("Chromium/Application/chrome.exe"));
                paths.push(root.join("Microsoft/Edge/Application/msedge.exe"));
            }
        }
        paths
    }

    #[cfg(target_os = "macos")]
    {
        [
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        ]
        .iter()
        .map(|p| Path::new(p).to_path_buf())
        .collect()
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        [
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/google-chrome",
            "/snap/bin/chromium",
        ]
        .iter()
        .map(|p| Path::new(p).to_path_buf())
        .collect()
    }
}
