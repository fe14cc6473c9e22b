//! Process Supervisor - one headless Chromium per converter
//!
//! Responsibilities:
//! - Build the flag list and launch the executable (optionally as another user)
//! - Discover the DevTools endpoint from stderr or from a `DevToolsActivePort` file
//! - Race discovery against early exit and the startup timeout
//! - Shut down: grace period, then kill the whole process tree
//!
//! The child is spawned in its own process group on Unix so that killing the
//! group also takes down renderer, GPU and zygote helpers.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cdp::{CdpConnection, CdpError};
use crate::error::{BrowserError, Result};

/// Marker Chromium prints on stderr once the DevTools server is up
const LISTENING_PREFIX: &str = "DevTools listening on ";

pub const PORT_FILE_NAME: &str = "DevToolsActivePort";

const PORT_FILE_POLL_INTERVAL: Duration = Duration::from_millis(50);

const STDERR_TAIL_LINES: usize = 20;

/// How long to wait for a killed (or already exiting) child to be reaped
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Flags that must survive [`ChromiumArguments::remove`]
const REQUIRED_FLAGS: &[&str] = &["--headless", "--remote-debugging-port"];

const DEFAULT_FLAGS: &[&str] = &[
    "--disable-gpu",
    "--hide-scrollbars",
    "--mute-audio",
    "--disable-background-networking",
    "--disable-background-timer-throttling",
    "--disable-default-apps",
    "--disable-extensions",
    "--disable-sync",
    "--disable-translate",
    "--disable-crash-reporter",
    "--no-first-run",
    "--no-default-browser-check",
    "--remote-debugging-port=0",
];

/// Ordered Chromium flag list, keyed by flag name (the part before `=`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChromiumArguments {
    args: Vec<String>,
}

impl ChromiumArguments {
    /// Default headless flag set. `--no-sandbox` is included on Linux.
    pub fn new(use_old_headless_mode: bool) -> Self {
        let headless = if use_old_headless_mode {
            "--headless=old"
        } else {
            "--headless"
        };

        let mut args: Vec<String> = std::iter::once(headless)
            .chain(DEFAULT_FLAGS.iter().copied())
            .map(str::to_string)
            .collect();
        if cfg!(target_os = "linux") {
            args.push("--no-sandbox".to_string());
        }
        Self { args }
    }

    /// Add `arg`, replacing any existing flag with the same name.
    pub fn set(&mut self, arg: impl Into<String>) {
        let arg = arg.into();
        let name = flag_name(&arg).to_string();
        match self.args.iter_mut().find(|existing| flag_name(existing) == name) {
            Some(existing) => *existing = arg,
            None => self.args.push(arg),
        }
    }

    /// Remove the flag called `name`. Required flags are kept.
    pub fn remove(&mut self, name: &str) -> bool {
        let name = flag_name(name);
        if REQUIRED_FLAGS.contains(&name) {
            tracing::warn!("Refusing to remove required browser flag {}", name);
            return false;
        }
        let before = self.args.len();
        self.args.retain(|arg| flag_name(arg) != name);
        self.args.len() != before
    }

    pub fn contains(&self, name: &str) -> bool {
        let name = flag_name(name);
        self.args.iter().any(|arg| flag_name(arg) == name)
    }

    /// Value after `=`, if the flag is present and has one
    pub fn value(&self, name: &str) -> Option<&str> {
        let name = flag_name(name);
        self.args
            .iter()
            .find(|arg| flag_name(arg) == name)
            .and_then(|arg| arg.split_once('='))
            .map(|(_, value)| value)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.args
    }
}

fn flag_name(arg: &str) -> &str {
    arg.split_once('=').map_or(arg, |(name, _)| name)
}

/// Unix credentials to launch the browser under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunAs {
    pub uid: u32,
    pub gid: u32,
}

/// Where the DevTools endpoint is read from; fixed for the life of a [`BrowserProcess`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointDiscovery {
    /// Scrape `DevTools listening on ws://...` from stderr
    Stderr,
    /// Poll for the port file Chromium writes into its user data directory
    PortFile(PathBuf),
}

#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub executable: PathBuf,
    pub arguments: ChromiumArguments,
    /// A persistent profile directory; switches discovery to the port file
    pub user_data_dir: Option<PathBuf>,
    pub run_as: Option<RunAs>,
    pub startup_timeout: Duration,
    pub shutdown_grace: Duration,
    /// Log browser stderr at `debug` instead of `trace`
    pub echo_output: bool,
}

impl LaunchOptions {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            arguments: ChromiumArguments::new(false),
            user_data_dir: None,
            run_as: None,
            startup_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(2),
            echo_output: false,
        }
    }
}

/// Last lines the browser wrote to stderr
#[derive(Debug, Default)]
struct StderrTail {
    lines: VecDeque<String>,
}

impl StderrTail {
    fn push(&mut self, line: String) {
        if self.lines.len() == STDERR_TAIL_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn text(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

enum LaunchOutcome {
    Endpoint(Option<String>),
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

pub struct BrowserProcess {
    options: LaunchOptions,
    discovery: EndpointDiscovery,
    child: Option<Child>,
    endpoint: Option<String>,
    stderr_tail: Arc<Mutex<StderrTail>>,
    drain_task: Option<JoinHandle<()>>,
}

impl BrowserProcess {
    pub fn new(mut options: LaunchOptions) -> Self {
        let discovery = match &options.user_data_dir {
            Some(dir) => {
                options
                    .arguments
                    .set(format!("--user-data-dir={}", dir.display()));
                EndpointDiscovery::PortFile(dir.join(PORT_FILE_NAME))
            }
            None => EndpointDiscovery::Stderr,
        };

        Self {
            options,
            discovery,
            child: None,
            endpoint: None,
            stderr_tail: Arc::new(Mutex::new(StderrTail::default())),
            drain_task: None,
        }
    }

    pub fn discovery(&self) -> &EndpointDiscovery {
        &self.discovery
    }

    pub fn arguments(&self) -> &ChromiumArguments {
        &self.options.arguments
    }

    /// Browser-level websocket URL of the running process
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                tracing::warn!("[BrowserProcess] Browser exited unexpectedly: {}", status);
                false
            }
            Some(Err(e)) => {
                tracing::warn!("[BrowserProcess] Could not query browser status: {}", e);
                false
            }
            None => false,
        }
    }

    /// Launch the browser unless it is already running, and return its endpoint.
    pub async fn ensure_running(&mut self, cancel: &CancellationToken) -> Result<String> {
        if self.is_running() {
            if let Some(endpoint) = &self.endpoint {
                return Ok(endpoint.clone());
            }
        }

        if self.child.is_some() {
            // Dead or endpoint-less leftover
            self.shutdown().await;
        }

        self.launch(cancel).await
    }

    async fn launch(&mut self, cancel: &CancellationToken) -> Result<String> {
        if let EndpointDiscovery::PortFile(path) = &self.discovery {
            remove_stale_port_file(path).await;
        }

        let mut command = self.command();
        let mut child = command.spawn().map_err(|e| {
            BrowserError::startup(format!(
                "could not launch {}: {}",
                self.options.executable.display(),
                e
            ))
        })?;
        tracing::info!(
            "[BrowserProcess] Launched {} (pid {:?})",
            self.options.executable.display(),
            child.id()
        );

        let tail = Arc::new(Mutex::new(StderrTail::default()));
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let endpoint_tx = (self.discovery == EndpointDiscovery::Stderr).then_some(endpoint_tx);
        let mut drain = child.stderr.take().map(|stderr| {
            tokio::spawn(drain_stderr(
                stderr,
                tail.clone(),
                endpoint_tx,
                self.options.echo_output,
            ))
        });

        let timeout = self.options.startup_timeout;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => LaunchOutcome::Cancelled,
            endpoint = discover(&self.discovery, endpoint_rx) => LaunchOutcome::Endpoint(endpoint),
            status = child.wait() => LaunchOutcome::Exited(status),
            _ = tokio::time::sleep(timeout) => LaunchOutcome::TimedOut,
        };

        let failure = match outcome {
            LaunchOutcome::Endpoint(Some(endpoint)) => {
                tracing::info!("[BrowserProcess] DevTools listening on {}", endpoint);
                self.child = Some(child);
                self.endpoint = Some(endpoint.clone());
                self.stderr_tail = tail;
                self.drain_task = drain;
                return Ok(endpoint);
            }
            LaunchOutcome::Endpoint(None) => {
                // stderr closed without the marker; the process is on its way out
                match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
                    Ok(Ok(status)) => exited_early(status),
                    _ => BrowserError::startup("browser closed stderr without exposing a DevTools endpoint"),
                }
            }
            LaunchOutcome::Exited(Ok(status)) => exited_early(status),
            LaunchOutcome::Exited(Err(e)) => {
                BrowserError::startup(format!("could not wait for the browser process: {e}"))
            }
            LaunchOutcome::TimedOut => BrowserError::startup(format!(
                "timed out after {timeout:?} waiting for the DevTools endpoint"
            )),
            LaunchOutcome::Cancelled => BrowserError::Cdp(CdpError::Cancelled),
        };

        kill_tree(&mut child).await;
        if let Some(drain) = drain.as_mut() {
            let _ = tokio::time::timeout(REAP_TIMEOUT, drain).await;
        }
        let stderr_tail = tail.lock().await.text();

        Err(match failure {
            BrowserError::Startup {
                reason, exit_code, ..
            } => {
                tracing::error!("[BrowserProcess] Startup failed: {}", reason);
                BrowserError::Startup {
                    reason,
                    exit_code,
                    stderr_tail,
                }
            }
            other => other,
        })
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.options.executable);
        command
            .args(self.options.arguments.as_slice())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            command.process_group(0);
            if let Some(run_as) = self.options.run_as {
                command.uid(run_as.uid).gid(run_as.gid);
            }
        }
        #[cfg(not(unix))]
        {
            if self.options.run_as.is_some() {
                tracing::warn!("[BrowserProcess] run_as is only supported on Unix, ignored");
            }
        }

        command
    }

    /// Ask the browser to exit over the protocol. Best effort.
    pub async fn request_close(&self, timeout: Duration) {
        let Some(endpoint) = &self.endpoint else {
            return;
        };
        match CdpConnection::connect(endpoint, timeout).await {
            Ok(connection) => {
                if let Err(e) = connection
                    .send_with_timeout("Browser.close", json!({}), timeout)
                    .await
                {
                    tracing::debug!("[BrowserProcess] Browser.close: {}", e);
                }
                connection.close().await;
            }
            Err(e) => tracing::debug!("[BrowserProcess] Could not reach {}: {}", endpoint, e),
        }
    }

    /// Wait out the grace period, then kill the process tree. Idempotent.
    pub async fn shutdown(&mut self) {
        if let Some(mut child) = self.child.take() {
            let grace = self.options.shutdown_grace;
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => tracing::info!("[BrowserProcess] Browser exited: {}", status),
                Ok(Err(e)) => {
                    tracing::warn!("[BrowserProcess] Waiting for browser failed: {}", e);
                    kill_tree(&mut child).await;
                }
                Err(_) => {
                    tracing::warn!(
                        "[BrowserProcess] Browser still running after {:?}, killing process tree",
                        grace
                    );
                    kill_tree(&mut child).await;
                }
            }
        }

        self.endpoint = None;
        if let Some(drain) = self.drain_task.take() {
            drain.abort();
        }
    }

    /// Recent stderr output of the running browser
    pub async fn stderr_tail(&self) -> String {
        self.stderr_tail.lock().await.text()
    }
}

impl Drop for BrowserProcess {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.start_kill() {
                tracing::debug!("[BrowserProcess] start_kill on drop: {}", e);
            }
        }
        if let Some(drain) = self.drain_task.take() {
            drain.abort();
        }
    }
}

async fn discover(discovery: &EndpointDiscovery, endpoint_rx: oneshot::Receiver<String>) -> Option<String> {
    match discovery {
        EndpointDiscovery::Stderr => endpoint_rx.await.ok(),
        EndpointDiscovery::PortFile(path) => Some(poll_port_file(path).await),
    }
}

/// Resolves once the port file holds a complete endpoint.
async fn poll_port_file(path: &Path) -> String {
    loop {
        if let Ok(contents) = tokio::fs::read_to_string(path).await {
            if let Some(endpoint) = parse_port_file(&contents) {
                return endpoint;
            }
        }
        tokio::time::sleep(PORT_FILE_POLL_INTERVAL).await;
    }
}

async fn remove_stale_port_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!("[BrowserProcess] Removed stale {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("[BrowserProcess] Could not remove {}: {}", path.display(), e),
    }
}

async fn drain_stderr(
    stderr: ChildStderr,
    tail: Arc<Mutex<StderrTail>>,
    mut endpoint_tx: Option<oneshot::Sender<String>>,
    echo: bool,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if echo {
            tracing::debug!("[chromium] {}", line);
        } else {
            tracing::trace!("[chromium] {}", line);
        }

        if let Some(endpoint) = parse_listening_line(&line) {
            if let Some(tx) = endpoint_tx.take() {
                let _ = tx.send(endpoint.to_string());
            }
        }
        tail.lock().await.push(line);
    }
}

/// `DevTools listening on ws://...` -> the websocket URL
pub fn parse_listening_line(line: &str) -> Option<&str> {
    let (_, endpoint) = line.split_once(LISTENING_PREFIX)?;
    let endpoint = endpoint.trim();
    endpoint.starts_with("ws").then_some(endpoint)
}

/// Port on the first line, path on the second
pub fn parse_port_file(contents: &str) -> Option<String> {
    let mut lines = contents.lines();
    let port: u16 = lines.next()?.trim().parse().ok()?;
    let path = lines.next()?.trim();
    if path.is_empty() {
        return None;
    }
    Some(format!("ws://127.0.0.1:{port}{path}"))
}

fn exited_early(status: ExitStatus) -> BrowserError {
    BrowserError::Startup {
        reason: format!(
            "browser exited before exposing a DevTools endpoint: {}",
            describe_exit(status)
        ),
        exit_code: status.code(),
        stderr_tail: String::new(),
    }
}

/// Human readable exit cause; Chromium's own result codes for the low values.
pub fn describe_exit(status: ExitStatus) -> String {
    match status.code() {
        Some(0) => "exit code 0 (normal exit)".to_string(),
        Some(1) => "exit code 1 (killed or general failure)".to_string(),
        Some(2) => "exit code 2 (hung)".to_string(),
        Some(3) => "exit code 3 (killed after a bad IPC message)".to_string(),
        Some(4) => "exit code 4 (GPU process died on arrival)".to_string(),
        Some(code) => format!("exit code {code}"),
        None => describe_signal(status),
    }
}

#[cfg(unix)]
fn describe_signal(status: ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(signal) => format!("terminated by signal {signal}"),
        None => status.to_string(),
    }
}

#[cfg(not(unix))]
fn describe_signal(status: ExitStatus) -> String {
    status.to_string()
}

/// Kill the browser and everything it spawned, then reap it. Failures are logged.
async fn kill_tree(child: &mut Child) {
    if let Some(pid) = child.id() {
        if let Some(mut command) = tree_kill_command(pid) {
            match command.status().await {
                Ok(status) if status.success() => {}
                Ok(status) => tracing::warn!("[BrowserProcess] Tree kill of {} returned {}", pid, status),
                Err(e) => tracing::warn!("[BrowserProcess] Tree kill of {} failed: {}", pid, e),
            }
        }
    }

    if let Err(e) = child.start_kill() {
        tracing::debug!("[BrowserProcess] start_kill: {}", e);
    }
    match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => tracing::warn!("[BrowserProcess] Reaping browser failed: {}", e),
        Err(_) => tracing::warn!("[BrowserProcess] Browser not reaped within {:?}", REAP_TIMEOUT),
    }
}

#[cfg(unix)]
fn tree_kill_command(pid: u32) -> Option<Command> {
    // The child leads its own process group
    let mut command = Command::new("kill");
    command
        .arg("-KILL")
        .arg(format!("-{pid}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    Some(command)
}

#[cfg(windows)]
fn tree_kill_command(pid: u32) -> Option<Command> {
    let mut command = Command::new("taskkill");
    command
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    Some(command)
}

#[cfg(not(any(unix, windows)))]
fn tree_kill_command(_pid: u32) -> Option<Command> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_arguments() {
        let args = ChromiumArguments::new(false);
        assert!(args.contains("--headless"));
        assert_eq!(args.value("--headless"), None);
        assert_eq!(args.value("--remote-debugging-port"), Some("0"));
        assert_eq!(args.as_slice()[0], "--headless");
        assert_eq!(args.contains("--no-sandbox"), cfg!(target_os = "linux"));

        let old = ChromiumArguments::new(true);
        assert_eq!(old.value("--headless"), Some("old"));
    }

    #[test]
    fn test_set_replaces_by_flag_name() {
        let mut args = ChromiumArguments::new(false);
        let count = args.as_slice().len();

        args.set("--window-size=800,600");
        args.set("--window-size=1024,768");
        assert_eq!(args.as_slice().len(), count + 1);
        assert_eq!(args.value("--window-size"), Some("1024,768"));
    }

    #[test]
    fn test_remove_keeps_required_flags() {
        let mut args = ChromiumArguments::new(false);
        assert!(args.remove("--mute-audio"));
        assert!(!args.contains("--mute-audio"));
        assert!(!args.remove("--mute-audio"));

        assert!(!args.remove("--remote-debugging-port"));
        assert!(!args.remove("--headless"));
        assert!(args.contains("--remote-debugging-port"));
    }

    #[test]
    fn test_user_data_dir_selects_port_file() {
        let mut options = LaunchOptions::new("/bin/chromium");
        options.user_data_dir = Some(PathBuf::from("/tmp/profile"));
        let process = BrowserProcess::new(options);

        assert_eq!(
            process.discovery(),
            &EndpointDiscovery::PortFile(PathBuf::from("/tmp/profile/DevToolsActivePort"))
        );
        assert_eq!(process.arguments().value("--user-data-dir"), Some("/tmp/profile"));

        let process = BrowserProcess::new(LaunchOptions::new("/bin/chromium"));
        assert_eq!(process.discovery(), &EndpointDiscovery::Stderr);
    }

    #[test]
    fn test_parse_listening_line() {
        assert_eq!(
            parse_listening_line("DevTools listening on ws://127.0.0.1:40123/devtools/browser/ab-cd\r"),
            Some("ws://127.0.0.1:40123/devtools/browser/ab-cd")
        );
        assert_eq!(parse_listening_line("[0101/000000.1:ERROR] something"), None);
        assert_eq!(parse_listening_line("DevTools listening on "), None);
    }

    #[test]
    fn test_parse_port_file() {
        assert_eq!(
            parse_port_file("36775\n/devtools/browser/1f3e\n").as_deref(),
            Some("ws://127.0.0.1:36775/devtools/browser/1f3e")
        );
        // Half-written
        assert_eq!(parse_port_file("36775\n"), None);
        assert_eq!(parse_port_file(""), None);
        assert_eq!(parse_port_file("abc\n/devtools/browser/x"), None);
    }

    #[test]
    fn test_stderr_tail_keeps_last_lines() {
        let mut tail = StderrTail::default();
        for n in 0..(STDERR_TAIL_LINES + 5) {
            tail.push(format!("line {n}"));
        }
        let text = tail.text();
        assert!(!text.contains("line 4\n"));
        assert!(text.starts_with("line 5"));
        assert!(text.ends_with(&format!("line {}", STDERR_TAIL_LINES + 4)));
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use std::fs;
        use std::os::unix::fs::PermissionsExt;
        use std::os::unix::process::ExitStatusExt;
        use tempfile::TempDir;

        fn write_fake_browser(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("fake-chromium");
            fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            let mut perms = fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&path, perms).unwrap();
            path
        }

        fn options(executable: PathBuf) -> LaunchOptions {
            LaunchOptions {
                startup_timeout: Duration::from_secs(5),
                shutdown_grace: Duration::from_millis(200),
                ..LaunchOptions::new(executable)
            }
        }

        #[test]
        fn test_describe_exit() {
            assert!(describe_exit(ExitStatus::from_raw(3 << 8)).contains("bad IPC message"));
            assert_eq!(describe_exit(ExitStatus::from_raw(42 << 8)), "exit code 42");
            assert_eq!(describe_exit(ExitStatus::from_raw(9)), "terminated by signal 9");
        }

        #[tokio::test]
        async fn test_endpoint_from_stderr() {
            let dir = TempDir::new().unwrap();
            let args_file = dir.path().join("args");
            let executable = write_fake_browser(
                dir.path(),
                &format!(
                    "echo \"$@\" > {}\n\
                     echo 'starting' >&2\n\
                     echo 'DevTools listening on ws://127.0.0.1:9999/devtools/browser/abc' >&2\n\
                     exec sleep 30",
                    args_file.display()
                ),
            );
            let mut process = BrowserProcess::new(options(executable));

            let endpoint = process
                .ensure_running(&CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(endpoint, "ws://127.0.0.1:9999/devtools/browser/abc");
            assert!(process.is_running());
            assert_eq!(process.endpoint(), Some(endpoint.as_str()));

            let args = fs::read_to_string(&args_file).unwrap();
            assert!(args.contains("--headless"));
            assert!(args.contains("--remote-debugging-port=0"));

            process.shutdown().await;
            assert!(!process.is_running());
            assert!(process.endpoint().is_none());
            process.shutdown().await;
        }

        #[tokio::test]
        async fn test_running_process_is_not_relaunched() {
            let dir = TempDir::new().unwrap();
            let launches = dir.path().join("launches");
            let executable = write_fake_browser(
                dir.path(),
                &format!(
                    "echo launch >> {}\n\
                     echo 'DevTools listening on ws://127.0.0.1:9999/devtools/browser/abc' >&2\n\
                     exec sleep 30",
                    launches.display()
                ),
            );
            let mut process = BrowserProcess::new(options(executable));
            let cancel = CancellationToken::new();

            process.ensure_running(&cancel).await.unwrap();
            process.ensure_running(&cancel).await.unwrap();
            assert_eq!(fs::read_to_string(&launches).unwrap().lines().count(), 1);

            process.shutdown().await;
        }

        #[tokio::test]
        async fn test_dead_process_is_relaunched() {
            let dir = TempDir::new().unwrap();
            let launches = dir.path().join("launches");
            let executable = write_fake_browser(
                dir.path(),
                &format!(
                    "echo launch >> {}\n\
                     echo 'DevTools listening on ws://127.0.0.1:9999/devtools/browser/abc' >&2\n\
                     sleep 0.2\n\
                     exit 0",
                    launches.display()
                ),
            );
            let mut process = BrowserProcess::new(options(executable));
            let cancel = CancellationToken::new();

            process.ensure_running(&cancel).await.unwrap();
            tokio::time::sleep(Duration::from_millis(600)).await;
            assert!(!process.is_running());

            process.ensure_running(&cancel).await.unwrap();
            assert_eq!(fs::read_to_string(&launches).unwrap().lines().count(), 2);

            process.shutdown().await;
        }

        #[tokio::test]
        async fn test_endpoint_from_port_file() {
            let dir = TempDir::new().unwrap();
            let profile = dir.path().join("profile");
            fs::create_dir(&profile).unwrap();
            // Left over from a previous run
            fs::write(profile.join(PORT_FILE_NAME), "1111\n/devtools/browser/stale\n").unwrap();

            let executable = write_fake_browser(
                dir.path(),
                "for arg in \"$@\"; do\n\
                   case \"$arg\" in --user-data-dir=*) profile=\"${arg#--user-data-dir=}\";; esac\n\
                 done\n\
                 sleep 0.2\n\
                 printf '9333\\n/devtools/browser/fresh\\n' > \"$profile/DevToolsActivePort\"\n\
                 exec sleep 30",
            );
            let mut options = options(executable);
            options.user_data_dir = Some(profile);
            let mut process = BrowserProcess::new(options);

            let endpoint = process
                .ensure_running(&CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(endpoint, "ws://127.0.0.1:9333/devtools/browser/fresh");

            process.shutdown().await;
        }

        #[tokio::test]
        async fn test_early_exit_reports_code_and_stderr() {
            let dir = TempDir::new().unwrap();
            let executable = write_fake_browser(
                dir.path(),
                "echo 'Missing X server or $DISPLAY' >&2\nexit 3",
            );
            let mut process = BrowserProcess::new(options(executable));

            match process.ensure_running(&CancellationToken::new()).await {
                Err(BrowserError::Startup {
                    reason,
                    exit_code,
                    stderr_tail,
                }) => {
                    assert_eq!(exit_code, Some(3));
                    assert!(reason.contains("exit code 3"));
                    assert!(stderr_tail.contains("Missing X server"));
                }
                other => panic!("expected startup error, got {:?}", other.map(|_| ())),
            }
            assert!(!process.is_running());
        }

        #[tokio::test]
        async fn test_startup_timeout_kills_browser() {
            let dir = TempDir::new().unwrap();
            let executable = write_fake_browser(dir.path(), "exec sleep 30");
            let mut options = options(executable);
            options.startup_timeout = Duration::from_millis(300);
            let mut process = BrowserProcess::new(options);

            let started = tokio::time::Instant::now();
            let result = process.ensure_running(&CancellationToken::new()).await;

            match result {
                Err(BrowserError::Startup { reason, .. }) => assert!(reason.contains("timed out")),
                other => panic!("expected startup error, got {:?}", other.map(|_| ())),
            }
            assert!(started.elapsed() < Duration::from_secs(5));
            assert!(process.pid().is_none());
        }

        #[tokio::test]
        async fn test_cancelled_launch() {
            let dir = TempDir::new().unwrap();
            let executable = write_fake_browser(dir.path(), "exec sleep 30");
            let mut process = BrowserProcess::new(options(executable));

            let cancel = CancellationToken::new();
            cancel.cancel();
            let result = process.ensure_running(&cancel).await;
            assert!(result.is_err_and(|e| e.is_cancelled()));
        }

        #[tokio::test]
        async fn test_missing_executable() {
            let mut process = BrowserProcess::new(options(PathBuf::from("/nonexistent/chromium")));
            let result = process.ensure_running(&CancellationToken::new()).await;
            assert!(matches!(result, Err(BrowserError::Startup { .. })));
        }
    }
}
