//! Converter configuration
//!
//! Loaded from JSON; every field is optional. Durations are milliseconds.

use browser::{ChromiumArguments, LaunchOptions, NavigationOptions, RunAs};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConvertError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    /// Browser executable; the locator is consulted when unset
    pub executable: Option<PathBuf>,
    /// Persistent profile; selects `DevToolsActivePort` discovery
    pub user_data_dir: Option<PathBuf>,
    /// Directory for pre-processor output; the system temp dir when unset
    pub temp_dir: Option<PathBuf>,

    pub no_sandbox: bool,
    pub use_old_headless_mode: bool,
    pub window_size: Option<WindowSize>,
    pub user_agent: Option<String>,
    pub proxy_server: Option<String>,
    pub proxy_bypass_list: Option<String>,
    pub proxy_pac_url: Option<String>,
    pub disk_cache_dir: Option<PathBuf>,
    pub enable_chromium_logging: bool,
    /// Added after the defaults, replacing flags of the same name
    pub extra_arguments: Vec<String>,
    /// Flag names to drop from the defaults
    pub removed_arguments: Vec<String>,
    pub run_as: Option<RunAs>,

    pub websocket_timeout_ms: u64,
    pub startup_timeout_ms: u64,
    pub shutdown_grace_ms: u64,

    pub use_cache: bool,
    pub wait_for_network_idle: bool,
    pub log_network_traffic: bool,
    pub url_blacklist: Vec<String>,
    pub safe_urls: Vec<String>,
    pub additional_headers: BTreeMap<String, String>,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            executable: None,
            user_data_dir: None,
            temp_dir: None,
            no_sandbox: cfg!(target_os = "linux"),
            use_old_headless_mode: false,
            window_size: None,
            user_agent: None,
            proxy_server: None,
            proxy_bypass_list: None,
            proxy_pac_url: None,
            disk_cache_dir: None,
            enable_chromium_logging: false,
            extra_arguments: Vec::new(),
            removed_arguments: Vec::new(),
            run_as: None,
            websocket_timeout_ms: 30_000,
            startup_timeout_ms: 30_000,
            shutdown_grace_ms: 2_000,
            use_cache: false,
            wait_for_network_idle: false,
            log_network_traffic: false,
            url_blacklist: Vec::new(),
            safe_urls: Vec::new(),
            additional_headers: BTreeMap::new(),
        }
    }
}

impl ConverterConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ConvertError::Config(e.to_string()))
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConvertError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    pub fn websocket_timeout(&self) -> Duration {
        Duration::from_millis(self.websocket_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Default flags plus everything this configuration turns on.
    pub fn chromium_arguments(&self) -> ChromiumArguments {
        let mut args = ChromiumArguments::new(self.use_old_headless_mode);

        if !self.no_sandbox {
            args.remove("--no-sandbox");
        }
        if let Some(size) = self.window_size {
            args.set(format!("--window-size={},{}", size.width, size.height));
        }
        if let Some(user_agent) = &self.user_agent {
            args.set(format!("--user-agent={user_agent}"));
        }
        if let Some(proxy) = &self.proxy_server {
            args.set(format!("--proxy-server={proxy}"));
        }
        if let Some(bypass) = &self.proxy_bypass_list {
            args.set(format!("--proxy-bypass-list={bypass}"));
        }
        if let Some(pac) = &self.proxy_pac_url {
            args.set(format!("--proxy-pac-url={pac}"));
        }
        if let Some(dir) = &self.disk_cache_dir {
            args.set(format!("--disk-cache-dir={}", dir.display()));
        }
        if self.enable_chromium_logging {
            args.set("--enable-logging=stderr");
            args.set("--v=1");
        }

        for arg in &self.extra_arguments {
            args.set(arg.clone());
        }
        for name in &self.removed_arguments {
            args.remove(name);
        }
        args
    }

    pub fn launch_options(&self, executable: PathBuf) -> LaunchOptions {
        LaunchOptions {
            executable,
            arguments: self.chromium_arguments(),
            user_data_dir: self.user_data_dir.clone(),
            run_as: self.run_as,
            startup_timeout: self.startup_timeout(),
            shutdown_grace: self.shutdown_grace(),
            echo_output: self.enable_chromium_logging,
        }
    }

    pub fn navigation_options(&self, media_load_timeout: Option<Duration>) -> NavigationOptions {
        NavigationOptions {
            url_blacklist: self.url_blacklist.clone(),
            safe_urls: self.safe_urls.clone(),
            use_cache: self.use_cache,
            media_load_timeout,
            wait_for_network_idle: self.wait_for_network_idle,
            log_network_traffic: self.log_network_traffic,
            extra_headers: self.additional_headers.clone(),
        }
    }
}
