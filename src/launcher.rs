//! Launch and attach strategies: everything that differs between starting a
//! debuggee and connecting to one that already runs.

use crate::config::AdapterConfig;
use crate::dap::client::{ClientSender, TerminationSignal};
use crate::dap::protocol::{event, ExitedEventBody, LaunchArguments};
use crate::error::{Error, Result};
use crate::gate::Gate;
use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::Deserialize;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;

static SERVICE_BANNER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"listening on\s+(\S+)").expect("must compile"));

const INFO_FILE_POLL: Duration = Duration::from_millis(100);
const INFO_FILE_TIMEOUT: Duration = Duration::from_secs(60);

/// Hooks that produce a runtime endpoint and end the debuggee.
#[async_trait]
pub trait LaunchStrategy: Send + Sync {
    /// Start the debuggee and return its service uri.
    async fn launch(&self, args: &LaunchArguments) -> Result<String>;

    /// Return the service uri of an already running debuggee.
    async fn attach(&self, args: &LaunchArguments) -> Result<String>;

    /// Forceful stop. Must tolerate repeated calls.
    async fn disconnect(&self);

    /// Ask the debuggee to exit and wait for it.
    async fn terminate(&self);

    /// The strategy forwards the debuggee stdout/stderr itself.
    fn drains_output(&self) -> bool;

    /// Whether losing the service connection ends the session. When `false` the
    /// session ends once the debuggee process exits.
    fn terminate_on_vm_service_close(&self) -> bool;
}

#[derive(Debug, Deserialize)]
struct ServiceInfo {
    uri: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Launched,
    Attached,
}

/// Runs the program with the configured runtime, or attaches to a given uri.
pub struct ProcessLauncher {
    config: AdapterConfig,
    client: ClientSender,
    termination: TerminationSignal,
    mode: Mutex<Option<Mode>>,
    pid: Mutex<Option<Pid>>,
    exited: Arc<Gate>,
}

impl ProcessLauncher {
    pub fn new(config: AdapterConfig, client: ClientSender, termination: TerminationSignal) -> Self {
        Self {
            config,
            client,
            termination,
            mode: Mutex::new(None),
            pid: Mutex::new(None),
            exited: Arc::new(Gate::new()),
        }
    }

    fn mode(&self) -> Option<Mode> {
        *self.mode.lock()
    }

    fn signal(&self, signal: Signal) {
        if let Some(pid) = *self.pid.lock() {
            crate::muted_error!(kill(pid, signal), "signal debuggee:");
        }
    }

    /// Forward one output stream of the debuggee, reporting the service uri
    /// when the banner shows up.
    fn forward_output<R>(&self, reader: R, category: &'static str, uri_tx: Arc<Mutex<Option<oneshot::Sender<String>>>>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let client = self.client.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(captures) = SERVICE_BANNER.captures(&line) {
                    if let Some(tx) = uri_tx.lock().take() {
                        let _ = tx.send(captures[1].to_string());
                    }
                }
                client.output(category, format!("{line}\n"));
            }
        });
    }
}

async fn read_info_file(path: &str) -> Result<String> {
    let started = tokio::time::Instant::now();
    loop {
        if let Ok(text) = tokio::fs::read_to_string(path).await {
            if let Ok(info) = serde_json::from_str::<ServiceInfo>(&text) {
                return Ok(info.uri);
            }
        }
        if started.elapsed() > INFO_FILE_TIMEOUT {
            return Err(Error::Launch(format!(
                "vm service info file {path} did not appear"
            )));
        }
        tokio::time::sleep(INFO_FILE_POLL).await;
    }
}

#[async_trait]
impl LaunchStrategy for ProcessLauncher {
    async fn launch(&self, args: &LaunchArguments) -> Result<String> {
        let program = args
            .program
            .as_deref()
            .ok_or_else(|| Error::Launch("`program` is required".to_string()))?;
        let runtime = which::which(&self.config.runtime)
            .map_err(|e| Error::Launch(format!("runtime `{}`: {e}", self.config.runtime)))?;

        let mut command = Command::new(runtime);
        command
            .args(&self.config.runtime_args)
            .args(&args.tool_args)
            .arg("--enable-vm-service=0")
            .arg("--pause_isolates_on_start")
            .arg(program)
            .args(&args.args)
            .envs(&args.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &args.cwd {
            command.current_dir(cwd);
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::Launch(format!("start {program}: {e}")))?;
        *self.mode.lock() = Some(Mode::Launched);
        *self.pid.lock() = child.id().map(|id| Pid::from_raw(id as i32));
        log::info!(target: "dap", "debuggee started, pid {:?}", child.id());

        let (uri_tx, uri_rx) = oneshot::channel();
        let uri_tx = Arc::new(Mutex::new(Some(uri_tx)));
        if let Some(stdout) = child.stdout.take() {
            self.forward_output(stdout, "stdout", uri_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            self.forward_output(stderr, "stderr", uri_tx);
        }

        let client = self.client.clone();
        let termination = self.termination.clone();
        let exited = self.exited.clone();
        tokio::spawn(async move {
            let exit_code = match child.wait().await {
                Ok(status) => {
                    use std::os::unix::process::ExitStatusExt;
                    status
                        .code()
                        .or_else(|| status.signal().map(|signal| 128 + signal))
                        .unwrap_or(-1)
                }
                Err(e) => {
                    log::warn!(target: "dap", "wait for debuggee: {e}");
                    -1
                }
            };
            log::info!(target: "dap", "debuggee exited with code {exit_code}");
            exited.open();
            client.send_event(
                event::EXITED,
                ExitedEventBody {
                    exit_code: exit_code as i64,
                },
            );
            termination.send_terminated();
        });

        uri_rx
            .await
            .map_err(|_| Error::Launch(format!("{program} exited before the vm service started")))
    }

    async fn attach(&self, args: &LaunchArguments) -> Result<String> {
        *self.mode.lock() = Some(Mode::Attached);
        match (&args.vm_service_uri, &args.vm_service_info_file) {
            (Some(uri), _) => Ok(uri.clone()),
            (None, Some(path)) => read_info_file(path).await,
            (None, None) => Err(Error::Launch(
                "attach requires `vmServiceUri` or `vmServiceInfoFile`".to_string(),
            )),
        }
    }

    async fn disconnect(&self) {
        if self.mode() == Some(Mode::Launched) && !self.exited.is_open() {
            self.signal(Signal::SIGKILL);
        }
    }

    async fn terminate(&self) {
        if self.mode() != Some(Mode::Launched) || self.exited.is_open() {
            return;
        }
        self.signal(Signal::SIGTERM);
        if tokio::time::timeout(self.config.terminate_timeout(), self.exited.wait())
            .await
            .is_err()
        {
            log::warn!(target: "dap", "debuggee ignored SIGTERM, killing it");
            self.signal(Signal::SIGKILL);
        }
    }

    fn drains_output(&self) -> bool {
        self.mode() == Some(Mode::Launched)
    }

    fn terminate_on_vm_service_close(&self) -> bool {
        self.mode() != Some(Mode::Launched)
    }
}
